//! Error types for cairncache

use std::io;
use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by cache backends and decorators.
///
/// Missing or unreadable data is reported as an absent value, not an error.
/// Errors are reserved for content that cannot be reconstructed, invalid
/// configuration and failed writes.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while persisting
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stored content could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored content is not valid for its recorded type
    #[error("Malformed stored content: {0}")]
    Malformed(String),

    /// A stored type name has no registered decoder
    #[error("Unresolved stored type '{0}'")]
    UnresolvedType(String),

    /// A value was requested or supplied as the wrong type
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Type the caller asked for
        expected: String,
        /// Type actually stored or supplied
        found: String,
    },

    /// Rejected configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Block storage failure
    #[error("Storage error: {0}")]
    Store(#[from] cairnstore::Error),

    /// A caller-provided supplier or update function failed
    #[error("Supplier failed: {0}")]
    Supplier(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary supplier error
    pub fn supplier<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Supplier(err.into())
    }
}
