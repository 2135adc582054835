//! Hash-bucketed block backend
//!
//! Keys are spread over a fixed number of buckets by
//! `|string_hash(key)| mod bucket_count`. Each bucket is one row of a
//! [`BlockStorage`] holding a JSON map of every key that hashes into it:
//!
//! ```text
//! { key: { "element": json, "type": type-name, "modifiedAt": epoch-millis } }
//! ```
//!
//! Every mutation rewrites its whole bucket, so `bucket_count` should keep
//! per-bucket occupancy small.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cairnstore::{BlockFile, BlockStorage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{Backend, Supplier, Updater};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::value::{TypeRegistry, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketEntry {
    element: serde_json::Value,
    #[serde(rename = "type")]
    type_name: String,
    modified_at: i64,
}

type BucketMap = BTreeMap<String, BucketEntry>;

/// 32-bit polynomial string hash (`h = 31 * h + c` over UTF-16 code units).
///
/// Stable across processes and platforms, which bucket placement requires.
pub fn string_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

/// Bucket a key belongs to
pub fn bucket_index(key: &str, bucket_count: u32) -> u32 {
    string_hash(key).unsigned_abs() % bucket_count
}

/// Fixed set of hash buckets stored as rows of a block storage
pub struct BucketBackend {
    storage: Arc<dyn BlockStorage>,
    bucket_count: u32,
    registry: Arc<TypeRegistry>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl BucketBackend {
    /// Open (creating if needed) a block file with `bucket_count` buckets
    pub fn open<P: AsRef<Path>>(path: P, bucket_count: u32) -> Result<Self> {
        let storage = BlockFile::open(path, bucket_count)?;
        Self::with_storage(Arc::new(storage))
    }

    /// Use an existing block storage; every row is one bucket
    pub fn with_storage(storage: Arc<dyn BlockStorage>) -> Result<Self> {
        let bucket_count = storage.rows();
        if bucket_count == 0 {
            return Err(Error::Config("bucket count must be greater than 0".to_string()));
        }
        Ok(Self {
            storage,
            bucket_count,
            registry: Arc::new(TypeRegistry::default()),
            clock: Arc::new(SystemClock),
            write_lock: Mutex::new(()),
        })
    }

    /// Resolve stored type names with `registry`
    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Use a different time source for modification stamps and ages
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of buckets
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Flush the underlying storage
    pub fn flush(&self) -> Result<()> {
        Ok(self.storage.flush()?)
    }

    fn read_bucket(&self, bucket: u32) -> Result<BucketMap> {
        let content = self.storage.read(bucket)?;
        if content.trim().is_empty() {
            return Ok(BucketMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    // Lookups treat unreadable storage as a miss; malformed content stays fatal.
    fn read_bucket_lenient(&self, bucket: u32) -> Result<BucketMap> {
        match self.read_bucket(bucket) {
            Err(Error::Store(e)) => {
                warn!(bucket, error = %e, "bucket unreadable, treating as empty");
                Ok(BucketMap::new())
            }
            other => other,
        }
    }

    fn write_bucket(&self, bucket: u32, map: &BucketMap) -> Result<()> {
        let content = if map.is_empty() {
            String::new()
        } else {
            serde_json::to_string(map)?
        };
        self.storage.write(bucket, &content)?;
        Ok(())
    }

    fn entry(&self, value: &Value) -> Result<BucketEntry> {
        Ok(BucketEntry {
            element: value.to_json()?,
            type_name: value.type_name().to_string(),
            modified_at: self.clock.now_millis(),
        })
    }

    fn decode(&self, entry: &BucketEntry) -> Result<Value> {
        self.registry
            .decode(&entry.type_name, entry.element.clone())
    }

    fn lookup(&self, key: &str) -> Result<Option<BucketEntry>> {
        let mut map = self.read_bucket_lenient(bucket_index(key, self.bucket_count))?;
        Ok(map.remove(key))
    }

    fn group_by_bucket<'a, T>(
        &self,
        items: impl IntoIterator<Item = (&'a str, T)>,
    ) -> BTreeMap<u32, Vec<(&'a str, T)>> {
        let mut grouped: BTreeMap<u32, Vec<(&'a str, T)>> = BTreeMap::new();
        for (key, item) in items {
            grouped
                .entry(bucket_index(key, self.bucket_count))
                .or_default()
                .push((key, item));
        }
        grouped
    }
}

impl Backend for BucketBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.lookup(key)?
            .map(|entry| self.decode(&entry))
            .transpose()
    }

    fn get_type(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lookup(key)?.map(|entry| entry.type_name))
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        let entry = self.entry(&value)?;
        let bucket = bucket_index(key, self.bucket_count);

        let _guard = self.write_lock.lock();
        let mut map = self.read_bucket(bucket)?;
        map.insert(key.to_string(), entry);
        self.write_bucket(bucket, &map)
    }

    fn put_all(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let prepared = entries
            .iter()
            .map(|(key, value)| Ok((key.as_str(), self.entry(value)?)))
            .collect::<Result<Vec<_>>>()?;

        let _guard = self.write_lock.lock();
        for (bucket, items) in self.group_by_bucket(prepared) {
            let mut map = self.read_bucket(bucket)?;
            for (key, entry) in items {
                map.insert(key.to_string(), entry);
            }
            self.write_bucket(bucket, &map)?;
        }
        Ok(())
    }

    fn compute_if_absent(&self, key: &str, supplier: Supplier<'_>) -> Result<Value> {
        let bucket = bucket_index(key, self.bucket_count);

        let _guard = self.write_lock.lock();
        let mut map = self.read_bucket(bucket)?;
        if let Some(existing) = map.get(key) {
            return self.decode(existing);
        }

        let value = supplier()?;
        map.insert(key.to_string(), self.entry(&value)?);
        self.write_bucket(bucket, &map)?;
        Ok(value)
    }

    fn compute_if_absent_or_update(
        &self,
        key: &str,
        supplier: Supplier<'_>,
        update: Updater<'_>,
    ) -> Result<Value> {
        let bucket = bucket_index(key, self.bucket_count);

        let _guard = self.write_lock.lock();
        let mut map = self.read_bucket(bucket)?;
        let value = match map.get(key) {
            Some(existing) => update(self.decode(existing)?)?,
            None => supplier()?,
        };
        map.insert(key.to_string(), self.entry(&value)?);
        self.write_bucket(bucket, &map)?;
        Ok(value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let bucket = bucket_index(key, self.bucket_count);

        let _guard = self.write_lock.lock();
        let mut map = self.read_bucket(bucket)?;
        if map.remove(key).is_some() {
            self.write_bucket(bucket, &map)?;
        }
        Ok(())
    }

    fn remove_all(&self, keys: &[String]) -> Result<()> {
        let _guard = self.write_lock.lock();
        for (bucket, items) in self.group_by_bucket(keys.iter().map(|k| (k.as_str(), ()))) {
            let mut map = self.read_bucket(bucket)?;
            let before = map.len();
            for (key, ()) in items {
                map.remove(key);
            }
            if map.len() != before {
                self.write_bucket(bucket, &map)?;
            }
        }
        Ok(())
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    fn key_set(&self) -> Result<HashSet<String>> {
        let mut keys = HashSet::new();
        for bucket in 0..self.bucket_count {
            keys.extend(self.read_bucket_lenient(bucket)?.into_keys());
        }
        Ok(keys)
    }

    fn size(&self) -> Result<usize> {
        let mut size = 0;
        for bucket in 0..self.bucket_count {
            size += self.read_bucket_lenient(bucket)?.len();
        }
        Ok(size)
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.storage.clear()?;
        Ok(())
    }

    fn age(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .lookup(key)?
            .map(|entry| self.clock.age_of(entry.modified_at)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheExt;
    use crate::clock::ManualClock;
    use cairnstore::MemoryBlocks;
    use tempfile::TempDir;

    fn memory(buckets: u32) -> BucketBackend {
        BucketBackend::with_storage(Arc::new(MemoryBlocks::new(buckets))).unwrap()
    }

    #[test]
    fn test_string_hash_is_stable() {
        assert_eq!(string_hash(""), 0);
        assert_eq!(string_hash("a"), 97);
        assert_eq!(string_hash("hello"), 99_162_322);
        // "Aa" and "BB" are the classic colliding pair
        assert_eq!(string_hash("Aa"), string_hash("BB"));
    }

    #[test]
    fn test_bucket_index_handles_negative_hashes() {
        let key = "polygenelubricants";
        assert!(string_hash(key) < 0);
        assert!(bucket_index(key, 7) < 7);
    }

    #[test]
    fn test_colliding_keys_are_independent() {
        let cache = memory(16);
        assert_eq!(bucket_index("Aa", 16), bucket_index("BB", 16));

        cache.put_as("Aa", "first".to_string()).unwrap();
        cache.put_as("BB", "second".to_string()).unwrap();

        assert_eq!(cache.get_as::<String>("Aa").unwrap().as_deref(), Some("first"));
        assert_eq!(cache.get_as::<String>("BB").unwrap().as_deref(), Some("second"));

        cache.remove("Aa").unwrap();
        assert_eq!(cache.get("Aa").unwrap(), None);
        assert_eq!(cache.get_as::<String>("BB").unwrap().as_deref(), Some("second"));
        assert_eq!(cache.size().unwrap(), 1);
    }

    #[test]
    fn test_single_bucket_holds_everything() {
        let cache = memory(1);
        for i in 0..20i64 {
            cache.put_as(&format!("key-{}", i), i).unwrap();
        }

        assert_eq!(cache.size().unwrap(), 20);
        assert_eq!(cache.get_as::<i64>("key-13").unwrap(), Some(13));

        cache
            .remove_all(&["key-1".to_string(), "key-2".to_string(), "nope".to_string()])
            .unwrap();
        assert_eq!(cache.size().unwrap(), 18);
        assert_eq!(cache.key_set().unwrap().len(), 18);
    }

    #[test]
    fn test_bucket_row_layout() {
        let storage = Arc::new(MemoryBlocks::new(4));
        let clock = Arc::new(ManualClock::new(42));
        let cache = BucketBackend::with_storage(storage.clone())
            .unwrap()
            .with_clock(clock);

        cache.put_as("k", 5u64).unwrap();

        let row = storage.read(bucket_index("k", 4)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&row).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!({"k": {"element": 5, "type": "u64", "modifiedAt": 42}})
        );
    }

    #[test]
    fn test_block_file_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buckets.blk");
        {
            let cache = BucketBackend::open(&path, 8).unwrap();
            cache.put_as("s", "persisted".to_string()).unwrap();
            cache.put_as("b", vec![1u8, 2]).unwrap();
            cache.flush().unwrap();
        }

        let cache = BucketBackend::open(&path, 8).unwrap();
        assert_eq!(cache.get_as::<String>("s").unwrap().as_deref(), Some("persisted"));
        assert_eq!(cache.get_as::<Vec<u8>>("b").unwrap(), Some(vec![1, 2]));
        assert!(BucketBackend::open(&path, 9).is_err());
    }

    #[test]
    fn test_malformed_bucket_is_fatal() {
        let storage = Arc::new(MemoryBlocks::new(1));
        storage.write(0, "{\"k\": [").unwrap();
        let cache = BucketBackend::with_storage(storage).unwrap();

        assert!(matches!(cache.get("k"), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_compute_and_clear() {
        let cache = memory(4);

        let first = cache.compute_if_absent_as("n", || 1i32).unwrap();
        let again = cache.compute_if_absent_as("n", || 2i32).unwrap();
        let updated = cache
            .compute_if_absent_or_update_as("n", || 0i32, |n| n * 10)
            .unwrap();
        assert_eq!((first, again, updated), (1, 1, 10));

        cache.clear().unwrap();
        assert!(cache.is_empty().unwrap());
    }
}
