//! In-memory backend

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use parking_lot::RwLock;

use crate::cache::{Backend, Supplier, Updater};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::value::Value;

struct Stamped {
    value: Value,
    created_at: i64,
}

/// Thread-safe map of key to value and creation time. Nothing is persisted.
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Stamped, RandomState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    /// Create an empty backend on the system clock
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::with_hasher(RandomState::new())),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a different time source for creation stamps and ages
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn stamp(&self, value: Value) -> Stamped {
        Stamped {
            value,
            created_at: self.clock.now_millis(),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().get(key).map(|e| e.value.clone()))
    }

    fn get_type(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .read()
            .get(key)
            .map(|e| e.value.type_name().to_string()))
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        let stamped = self.stamp(value);
        self.entries.write().insert(key.to_string(), stamped);
        Ok(())
    }

    fn put_all(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let mut map = self.entries.write();
        for (key, value) in entries {
            let stamped = self.stamp(value);
            map.insert(key, stamped);
        }
        Ok(())
    }

    fn compute_if_absent(&self, key: &str, supplier: Supplier<'_>) -> Result<Value> {
        if let Some(entry) = self.entries.read().get(key) {
            return Ok(entry.value.clone());
        }

        let mut map = self.entries.write();
        if let Some(entry) = map.get(key) {
            return Ok(entry.value.clone());
        }
        let value = supplier()?;
        map.insert(key.to_string(), self.stamp(value.clone()));
        Ok(value)
    }

    fn compute_if_absent_or_update(
        &self,
        key: &str,
        supplier: Supplier<'_>,
        update: Updater<'_>,
    ) -> Result<Value> {
        let mut map = self.entries.write();
        let value = match map.get(key) {
            Some(entry) => update(entry.value.clone())?,
            None => supplier()?,
        };
        map.insert(key.to_string(), self.stamp(value.clone()));
        Ok(value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn remove_all(&self, keys: &[String]) -> Result<()> {
        let mut map = self.entries.write();
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    fn key_set(&self) -> Result<HashSet<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn size(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }

    fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn age(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .entries
            .read()
            .get(key)
            .map(|e| self.clock.age_of(e.created_at)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheExt;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_memory_basic() {
        let cache = MemoryBackend::new();
        cache.put_as("a", "alpha".to_string()).unwrap();
        cache.put_as("b", vec![1u8, 2, 3]).unwrap();

        assert_eq!(cache.get_as::<String>("a").unwrap().as_deref(), Some("alpha"));
        assert_eq!(cache.get_as::<Vec<u8>>("b").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(cache.get_type("b").unwrap().as_deref(), Some("bytes"));
        assert_eq!(cache.size().unwrap(), 2);
    }

    #[test]
    fn test_memory_remove() {
        let cache = MemoryBackend::new();
        cache.put_as("a", 1i64).unwrap();
        cache.put_as("b", 2i64).unwrap();

        cache.remove("a").unwrap();

        assert_eq!(cache.get("a").unwrap(), None);
        assert!(!cache.key_set().unwrap().contains("a"));
        assert_eq!(cache.size().unwrap(), 1);
    }

    #[test]
    fn test_memory_age_follows_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = MemoryBackend::new().with_clock(clock.clone());

        cache.put_as("k", true).unwrap();
        clock.advance(Duration::from_secs(3));
        assert_eq!(cache.age("k").unwrap(), Some(Duration::from_secs(3)));

        // reads do not refresh the stamp, writes do
        cache.get("k").unwrap();
        assert_eq!(cache.age("k").unwrap(), Some(Duration::from_secs(3)));
        cache.put_as("k", false).unwrap();
        assert_eq!(cache.age("k").unwrap(), Some(Duration::ZERO));

        assert_eq!(cache.age("missing").unwrap(), None);
    }

    #[test]
    fn test_memory_concurrent_compute_if_absent() {
        let cache = Arc::new(MemoryBackend::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    cache
                        .compute_if_absent_as("shared", || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            i as u64
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| *r == results[0]));
    }

    #[test]
    fn test_memory_clear() {
        let cache = MemoryBackend::new();
        cache
            .put_all(vec![
                ("a".to_string(), Value::new(1i32)),
                ("b".to_string(), Value::new(2i32)),
            ])
            .unwrap();

        cache.clear().unwrap();

        assert_eq!(cache.size().unwrap(), 0);
        assert!(cache.is_empty().unwrap());
    }
}
