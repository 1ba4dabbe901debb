//! Error types for the tile cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tile cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing storage could not grow to satisfy a tile allocation
    #[error("tile allocation failed for {requested} tiles: {reason}")]
    AllocationFailed { requested: usize, reason: String },

    /// Entry marshalling failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored segment record could not be read back
    #[error("corrupt cache segment in bucket {bucket}: {reason}")]
    CorruptSegment { bucket: usize, reason: String },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation not supported by this entry or cache mode
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
}
