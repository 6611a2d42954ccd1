//! Unified error types for the memory layer.

use std::path::PathBuf;

/// Main error type for memory-layer operations.
///
/// Capacity shortfalls during prepare are *not* errors: they are reported as
/// [`MemoryStatus::FailedPrepare`](crate::MemoryStatus::FailedPrepare).
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The input batch violates an allocator invariant.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// A state stream is truncated or does not match the live cache.
    #[error("state format error: {0}")]
    StateFormat(String),

    /// A restored state does not fit into the cache.
    #[error("insufficient capacity: {0}")]
    Capacity(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be read.
    #[error("failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The compute step rejected a prepared context.
    #[error("compute failed: {0}")]
    Compute(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen in normal operation).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results with MemoryError.
pub type MemoryResult<T> = Result<T, MemoryError>;

impl MemoryError {
    /// Create an invalid batch error with message.
    pub fn invalid_batch(msg: impl Into<String>) -> Self {
        Self::InvalidBatch(msg.into())
    }

    /// Create a state format error with message.
    pub fn state_format(msg: impl Into<String>) -> Self {
        Self::StateFormat(msg.into())
    }

    /// Create a capacity error with message.
    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    /// Create a config error with message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a compute error with message.
    pub fn compute(msg: impl Into<String>) -> Self {
        Self::Compute(msg.into())
    }

    /// Create an internal error with message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
