//! Error types for the agent harness.
//!
//! Inside the loop, tool errors are *data*: they flow back to the model as
//! error tool results. Only [`Error::Provider`] unwinds a session, and the
//! loop flushes partial metrics before propagating it.

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the agent harness
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("provider failure: {0}")]
    Provider(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown domain: {0:?}")]
    UnknownDomain(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("contract error: {0}")]
    Contract(String),

    #[error("memory error: {0}")]
    Memory(#[from] cortex_memory::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
