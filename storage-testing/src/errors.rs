use thiserror::Error;

#[derive(Debug, Error)]
pub enum TestingError {
    #[error("privilege required: run as root for loop-device tests")]
    PrivilegeRequired,
    #[error("{tool} not found in PATH")]
    ToolMissing { tool: String },
    #[error("command failed: {command}; stderr: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TestingError>;
