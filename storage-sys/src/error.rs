// SPDX-License-Identifier: GPL-3.0-only

use storage_contracts::{AgentError, ErrorKind};
use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No filesystem found on {0}")]
    NoFilesystem(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Mount listener closed")]
    Closed,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0} not found in PATH")]
    ToolNotFound(String),

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Mount failed: {0}")]
    MountFailed(String),

    #[error("Unmount failed: {0}")]
    UnmountFailed(String),

    #[error("Format failed: {0}")]
    FormatFailed(String),

    #[error("Quota failed: {0}")]
    QuotaFailed(String),
}

impl SysError {
    pub fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(err) if err.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Self::Io(_) | Self::Closed | Self::ToolNotFound(_) => ErrorKind::Internal,
            Self::InvalidPattern { .. } => ErrorKind::InvalidPattern,
            Self::Parse(_) => ErrorKind::ParseError,
            Self::NoFilesystem(_) => ErrorKind::NoFilesystem,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::CommandFailed { .. } => ErrorKind::Internal,
            Self::MountFailed(_) => ErrorKind::MountFailure,
            Self::UnmountFailed(_) => ErrorKind::UnmountFailure,
            Self::FormatFailed(_) => ErrorKind::FormatFailure,
            Self::QuotaFailed(_) => ErrorKind::QuotaFailure,
        }
    }
}

impl From<SysError> for AgentError {
    fn from(err: SysError) -> Self {
        AgentError::new(err.kind(), err.to_string())
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_onto_boundary_kinds() {
        let err: AgentError = SysError::NoFilesystem("/dev/sdb".to_string()).into();
        assert_eq!(err.kind, ErrorKind::NoFilesystem);
        assert_eq!(err.message, "No filesystem found on /dev/sdb");

        let err: AgentError = SysError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).into();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err: AgentError = SysError::invalid_pattern("{a...", "unbalanced braces").into();
        assert_eq!(err.kind, ErrorKind::InvalidPattern);
    }
}
