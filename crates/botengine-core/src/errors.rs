use std::path::PathBuf;

/// Core error type.
///
/// Adapter crates map their SDK errors into this type so workers and the
/// control panel can tell fatal failures from retryable ones.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid session id {id:?}: {reason}")]
    InvalidSession { id: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("process error (pid {pid}): {reason}")]
    Process { pid: u32, reason: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Whether the handshake may loop back and ask the operator again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Rejected(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
