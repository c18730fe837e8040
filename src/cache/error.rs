//! Cache error types

use thiserror::Error;

use super::entry::Namespace;

/// Errors raised by the on-disk cache.
///
/// Only [`CacheError::CapacityExceeded`] is ever returned from a `put`;
/// every other variant is logged where it happens and degrades to a miss
/// or a skipped write.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A single payload is larger than the whole namespace budget
    #[error("payload of {size} bytes exceeds the {namespace} namespace budget of {max} bytes")]
    CapacityExceeded {
        namespace: Namespace,
        size: u64,
        max: u64,
    },

    /// Record on disk failed validation
    #[error("corrupted cache record: {0}")]
    Corrupted(String),

    /// IO error
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record header could not be (de)serialized
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Namespace directory could not be opened
    #[error("cache namespace {0} unavailable: {1}")]
    Unavailable(Namespace, String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
