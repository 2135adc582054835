//! # cairnstore
//!
//! Storage primitives underneath the Cairn cache backends.
//!
//! ## Contents
//! - Block files: a fixed number of memory-mapped rows, each holding
//!   variable-length UTF-8 content, widened on demand
//! - File helpers: bounded-retry reads and temp-file + rename writes
//! - A nom parser for the block file header and slots

#![warn(missing_docs)]

mod blocks;
mod error;
mod fsio;
mod parser;

pub use blocks::{BlockFile, BlockStorage, MemoryBlocks, DEFAULT_SLOT_SIZE, MAX_ROW_SIZE};
pub use error::{Error, Result};
pub use fsio::{
    read_content_with_retry, read_with_retry, remove_if_exists, write_atomic, RetryPolicy,
};
