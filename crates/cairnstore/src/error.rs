//! Error types for cairnstore

use std::io;
use thiserror::Error;

/// Result type alias for cairnstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Row content too large for a single slot
    #[error("Row too large: {0} bytes (max {max} bytes)", max = crate::blocks::MAX_ROW_SIZE)]
    ValueTooLarge(usize),

    /// Row index outside of the file geometry
    #[error("Row {row} out of range (rows: {rows})")]
    RowOutOfRange {
        /// Requested row
        row: u32,
        /// Rows in the file
        rows: u32,
    },

    /// Existing file was created with a different row count
    #[error("Row count mismatch: expected {expected}, found {found}")]
    RowCountMismatch {
        /// Row count requested by the caller
        expected: u32,
        /// Row count recorded in the file header
        found: u32,
    },

    /// Block file is closed
    #[error("Block file is closed")]
    Closed,
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => Error::Parse("Incomplete input".to_string()),
            nom::Err::Error(e) | nom::Err::Failure(e) => Error::Parse(format!(
                "{:?} with {} bytes remaining",
                e.code,
                e.input.len()
            )),
        }
    }
}
