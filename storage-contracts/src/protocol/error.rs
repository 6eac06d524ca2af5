// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error kinds exposed at the agent boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Cancelled,
    InvalidPattern,
    ParseError,
    NoFilesystem,
    UdevMismatch,
    ForceRequired,
    DuplicateDevice,
    Conflict,
    NotFound,
    MountFailure,
    UnmountFailure,
    FormatFailure,
    QuotaFailure,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> u16 {
        match self {
            Self::Cancelled => 499,
            Self::InvalidPattern => 400,
            Self::ParseError => 422,
            Self::NoFilesystem => 424,
            Self::UdevMismatch => 412,
            Self::ForceRequired => 428,
            Self::DuplicateDevice => 300,
            Self::Conflict => 409,
            Self::NotFound => 404,
            Self::MountFailure => 502,
            Self::UnmountFailure => 503,
            Self::FormatFailure => 507,
            Self::QuotaFailure => 508,
            Self::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
    /// Operator-facing hint on how to recover
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl AgentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("{kind} {name} not found"))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_error_roundtrips() {
        let error = AgentError::new(ErrorKind::UdevMismatch, "udev data changed for 8:16")
            .with_suggestion("retry the format request");
        let json = serde_json::to_string(&error).expect("serialize error");
        let parsed: AgentError = serde_json::from_str(&json).expect("deserialize error");
        assert_eq!(parsed, error);
        assert!(json.contains("\"udev_mismatch\""));
    }

    #[test]
    fn display_carries_kind_and_message() {
        let error = AgentError::not_found("drive", "abc");
        assert_eq!(error.to_string(), "NotFound: drive abc not found");
        assert!(error.is(ErrorKind::NotFound));
    }

    #[test]
    fn error_kind_codes_are_stable() {
        assert_eq!(ErrorKind::InvalidPattern.code(), 400);
        assert_eq!(ErrorKind::NotFound.code(), 404);
        assert_eq!(ErrorKind::Conflict.code(), 409);
        assert_eq!(ErrorKind::Cancelled.code(), 499);
        assert_eq!(ErrorKind::Internal.code(), 500);
    }
}
