//! Declarative cache construction
//!
//! A [`CacheConfig`] names one storage backend plus optional expiry and
//! capacity decorators. [`CacheConfig::build`] validates everything up front
//! and stacks the decorators as `capacity(duration(backend))`.
//!
//! ```json
//! {
//!   "backend": { "kind": "sharded", "dir": "/var/cache/app", "native": true },
//!   "eviction": { "capacity": 10000, "ratio": 0.1, "strategy": "oldest" },
//!   "max_age_ms": 3600000
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bucket::BucketBackend;
use crate::cache::Backend;
use crate::document::DocumentBackend;
use crate::duration::DurationLimited;
use crate::error::{Error, Result};
use crate::eviction::{CapacityLimited, EvictionConfig};
use crate::memory::MemoryBackend;
use crate::sharded::ShardedBackend;
use crate::value::TypeRegistry;

/// Default number of buckets for the bucket backend
pub const DEFAULT_BUCKETS: u32 = 64;

fn default_buckets() -> u32 {
    DEFAULT_BUCKETS
}

/// Storage backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// [`MemoryBackend`]
    Memory,
    /// [`DocumentBackend`] over one file
    Document {
        /// Root document path
        path: PathBuf,
    },
    /// [`ShardedBackend`] over a directory
    Sharded {
        /// Cache directory
        dir: PathBuf,
        /// Store strings and bytes as raw file content
        #[serde(default)]
        native: bool,
    },
    /// [`BucketBackend`] over a block file
    Bucket {
        /// Block file path
        path: PathBuf,
        /// Number of hash buckets
        #[serde(default = "default_buckets")]
        buckets: u32,
    },
}

impl BackendConfig {
    /// File or directory holding persisted entries
    pub fn location(&self) -> Option<&Path> {
        match self {
            BackendConfig::Memory => None,
            BackendConfig::Document { path } | BackendConfig::Bucket { path, .. } => {
                Some(path.as_path())
            }
            BackendConfig::Sharded { dir, .. } => Some(dir.as_path()),
        }
    }

    fn open(&self, registry: Arc<TypeRegistry>) -> Result<Box<dyn Backend>> {
        Ok(match self {
            BackendConfig::Memory => Box::new(MemoryBackend::new()),
            BackendConfig::Document { path } => {
                Box::new(DocumentBackend::open(path).with_registry(registry))
            }
            BackendConfig::Sharded { dir, native } => Box::new(
                ShardedBackend::open(dir)?
                    .native(*native)
                    .with_registry(registry),
            ),
            BackendConfig::Bucket { path, buckets } => {
                Box::new(BucketBackend::open(path, *buckets)?.with_registry(registry))
            }
        })
    }
}

/// Complete cache description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Storage backend
    pub backend: BackendConfig,
    /// Capacity limit, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction: Option<EvictionConfig>,
    /// Maximum entry age in milliseconds, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<u64>,
}

impl CacheConfig {
    /// Undecorated cache over `backend`
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            eviction: None,
            max_age_ms: None,
        }
    }

    /// Add a capacity limit
    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = Some(eviction);
        self
    }

    /// Add an age limit
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_ms = Some(max_age.as_millis() as u64);
        self
    }

    /// Parse a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read and parse a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check every setting without touching storage
    pub fn validate(&self) -> Result<()> {
        if let BackendConfig::Bucket { buckets: 0, .. } = self.backend {
            return Err(Error::Config("bucket count must be greater than 0".to_string()));
        }
        if self.max_age_ms == Some(0) {
            return Err(Error::Config("max age must be greater than 0".to_string()));
        }
        if let Some(eviction) = &self.eviction {
            eviction.eviction_volume()?;
        }
        Ok(())
    }

    /// Open the backend and stack the configured decorators
    pub fn build(&self, registry: Arc<TypeRegistry>) -> Result<Box<dyn Backend>> {
        self.validate()?;

        let mut cache = self.backend.open(registry)?;
        if let Some(ms) = self.max_age_ms {
            cache = Box::new(DurationLimited::new(cache, Duration::from_millis(ms))?);
        }
        if let Some(eviction) = &self.eviction {
            cache = Box::new(CapacityLimited::new(cache, eviction.clone())?);
        }

        info!(
            backend = ?self.backend,
            eviction = self.eviction.is_some(),
            max_age_ms = ?self.max_age_ms,
            "cache opened"
        );
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheExt;
    use crate::eviction::StrategyKind;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_config() {
        let config = CacheConfig::from_json(
            r#"{
                "backend": { "kind": "sharded", "dir": "/tmp/c", "native": true },
                "eviction": { "capacity": 100, "strategy": "oldest" },
                "max_age_ms": 5000
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.backend,
            BackendConfig::Sharded {
                dir: PathBuf::from("/tmp/c"),
                native: true
            }
        );
        let eviction = config.eviction.unwrap();
        assert_eq!(eviction.capacity, 100);
        assert_eq!(eviction.ratio, 0.1);
        assert_eq!(eviction.strategy, StrategyKind::Oldest);
        assert_eq!(config.max_age_ms, Some(5000));
    }

    #[test]
    fn test_defaults() {
        let config =
            CacheConfig::from_json(r#"{ "backend": { "kind": "bucket", "path": "b.blk" } }"#)
                .unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Bucket {
                path: PathBuf::from("b.blk"),
                buckets: DEFAULT_BUCKETS
            }
        );
        assert!(config.eviction.is_none());
    }

    #[test]
    fn test_rejects_bad_config() {
        let bad = [
            r#"{ "backend": { "kind": "redis" } }"#,
            r#"{ "backend": { "kind": "memory" }, "eviction": { "capacity": 10, "strategy": "lru" } }"#,
            r#"{ "backend": { "kind": "memory" }, "colour": "blue" }"#,
        ];
        for json in bad {
            assert!(matches!(CacheConfig::from_json(json), Err(Error::Config(_))), "{}", json);
        }

        let invalid = [
            CacheConfig::new(BackendConfig::Memory).with_eviction(EvictionConfig::new(0)),
            CacheConfig::new(BackendConfig::Memory).with_eviction(EvictionConfig::new(10).ratio(2.0)),
            CacheConfig::new(BackendConfig::Memory).with_max_age(Duration::ZERO),
            CacheConfig::new(BackendConfig::Bucket {
                path: PathBuf::from("unused"),
                buckets: 0,
            }),
        ];
        for config in invalid {
            let registry = Arc::new(TypeRegistry::default());
            assert!(matches!(config.build(registry), Err(Error::Config(_))));
        }
    }

    #[test]
    fn test_build_decorated_stack() {
        let temp = TempDir::new().unwrap();
        let config = CacheConfig::new(BackendConfig::Document {
            path: temp.path().join("cache.json"),
        })
        .with_eviction(EvictionConfig::new(10).ratio(0.5))
        .with_max_age(Duration::from_secs(60));

        let cache = config.build(Arc::new(TypeRegistry::default())).unwrap();
        for i in 0..40 {
            cache.put_as(&format!("k{}", i), i as u64).unwrap();
        }
        assert!(cache.size().unwrap() <= 15);
        assert!(temp.path().join("cache.json").exists());
    }

    #[test]
    fn test_json_round_trip() {
        let config = CacheConfig::new(BackendConfig::Memory)
            .with_eviction(EvictionConfig::new(50).strategy(StrategyKind::Oldest));
        let json = config.to_json().unwrap();
        assert_eq!(CacheConfig::from_json(&json).unwrap(), config);
        assert!(!json.contains("max_age_ms"));
    }
}
