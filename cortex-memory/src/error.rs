//! Error types for the lesson memory subsystem.

/// Result type alias for memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the lesson memory subsystem
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(String),

    #[error("unknown error channel: {0:?}")]
    UnknownChannel(String),

    #[error("unknown lesson status: {0:?}")]
    UnknownStatus(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
