use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the persh session layer.
#[derive(Debug, Error)]
pub enum PershError {
    #[error("invalid working directory: {}", .0.display())]
    InvalidWorkingDirectory(PathBuf),

    #[error("failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("session limit reached ({0})")]
    SessionLimit(usize),

    #[error("session terminated: {0}")]
    SessionTerminated(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for PershError {
    fn from(e: serde_json::Error) -> Self {
        PershError::Other(format!("json error: {e}"))
    }
}

pub type PershResult<T> = Result<T, PershError>;
