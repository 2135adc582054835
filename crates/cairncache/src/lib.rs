//! # cairncache
//!
//! Embeddable key/value cache with interchangeable storage backends.
//!
//! ## Architecture
//! - **Contract**: every backend and decorator implements [`Backend`]
//! - **Values**: type-erased [`Value`]s, rebuilt from disk through a [`TypeRegistry`]
//! - **Backends**: memory, single document, sharded files, hash buckets on a block file
//! - **Decorators**: [`CapacityLimited`] and [`DurationLimited`] wrap any backend
//! - **Adapters**: [`TypedCache`] and [`DynamicCache`] convert between typed and
//!   heterogeneous views
//!
//! ```no_run
//! use cairncache::{CacheExt, ShardedBackend};
//!
//! # fn main() -> cairncache::Result<()> {
//! let cache = ShardedBackend::open("/tmp/cairn")?;
//! cache.put_as("greeting", "hello".to_string())?;
//! let n = cache.compute_if_absent_as("answer", || 42u64)?;
//! assert_eq!(n, 42);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod adapter;
pub mod bucket;
pub mod cache;
pub mod clock;
pub mod config;
pub mod document;
pub mod duration;
pub mod error;
pub mod eviction;
pub mod memory;
pub mod sharded;
mod stats;
pub mod value;

pub use adapter::{DynamicCache, SingleTypeCache, TypedCache};
pub use bucket::BucketBackend;
pub use cache::{Backend, CacheExt, Supplier, Updater};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendConfig, CacheConfig};
pub use document::DocumentBackend;
pub use duration::DurationLimited;
pub use error::{Error, Result};
pub use eviction::{
    CapacityLimited, EvictionConfig, EvictionStrategy, OldestFirst, RandomSample, StrategyKind,
};
pub use memory::MemoryBackend;
pub use sharded::ShardedBackend;
pub use stats::CacheStats;
pub use value::{Cacheable, TypeRegistry, Value};
