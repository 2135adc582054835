//! Age-based expiry decorator
//!
//! Entries whose age has reached `max_age` read as absent. Expiry is lazy:
//! nothing is deleted until the key is rewritten, removed or cleared.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::{Backend, Supplier, Updater};
use crate::error::{Error, Result};
use crate::stats::CacheStats;
use crate::value::Value;

/// Hides entries older than a fixed duration
pub struct DurationLimited<B> {
    inner: B,
    max_age: Duration,
    stats: CacheStats,
    // serializes replacing expired entries so concurrent callers supply once
    refresh_lock: Mutex<()>,
}

impl<B: Backend> DurationLimited<B> {
    /// Wrap `inner`; `max_age` must be non-zero
    pub fn new(inner: B, max_age: Duration) -> Result<Self> {
        if max_age.is_zero() {
            return Err(Error::Config("max age must be greater than 0".to_string()));
        }
        Ok(Self {
            inner,
            max_age,
            stats: CacheStats::new(),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Configured maximum age
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Expiry counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The wrapped backend
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Unwrap the decorator
    pub fn into_inner(self) -> B {
        self.inner
    }

    fn is_expired(&self, age: Option<Duration>) -> bool {
        matches!(age, Some(age) if age >= self.max_age)
    }

    fn expired(&self, key: &str) -> Result<bool> {
        let expired = self.is_expired(self.inner.age(key)?);
        if expired {
            self.stats.record_expiration();
        }
        Ok(expired)
    }

    /// Replace an entry seen as expired. Returns `None` when another caller
    /// refreshed it first; the caller then falls back to the inner compute.
    fn refresh(&self, key: &str, supplier: Supplier<'_>) -> Result<Option<Value>> {
        let _guard = self.refresh_lock.lock();
        if !self.is_expired(self.inner.age(key)?) && self.inner.contains_key(key)? {
            return Ok(None);
        }
        let value = supplier()?;
        self.inner.put(key, value.clone())?;
        Ok(Some(value))
    }
}

impl<B: Backend> Backend for DurationLimited<B> {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        if self.expired(key)? {
            return Ok(None);
        }
        self.inner.get(key)
    }

    fn get_type(&self, key: &str) -> Result<Option<String>> {
        if self.expired(key)? {
            return Ok(None);
        }
        self.inner.get_type(key)
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        self.inner.put(key, value)
    }

    fn put_all(&self, entries: Vec<(String, Value)>) -> Result<()> {
        self.inner.put_all(entries)
    }

    fn compute_if_absent(&self, key: &str, supplier: Supplier<'_>) -> Result<Value> {
        if self.expired(key)? {
            if let Some(value) = self.refresh(key, &mut *supplier)? {
                return Ok(value);
            }
        }
        self.inner.compute_if_absent(key, supplier)
    }

    fn compute_if_absent_or_update(
        &self,
        key: &str,
        supplier: Supplier<'_>,
        update: Updater<'_>,
    ) -> Result<Value> {
        if self.expired(key)? {
            if let Some(value) = self.refresh(key, &mut *supplier)? {
                return Ok(value);
            }
        }
        self.inner.compute_if_absent_or_update(key, supplier, update)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key)
    }

    fn remove_all(&self, keys: &[String]) -> Result<()> {
        self.inner.remove_all(keys)
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.inner.contains_key(key)? && !self.expired(key)?)
    }

    fn key_set(&self) -> Result<HashSet<String>> {
        let mut live = HashSet::new();
        for key in self.inner.key_set()? {
            if !self.is_expired(self.inner.age(&key)?) {
                live.insert(key);
            }
        }
        Ok(live)
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    fn age(&self, key: &str) -> Result<Option<Duration>> {
        let age = self.inner.age(key)?;
        if self.is_expired(age) {
            return Ok(None);
        }
        Ok(age)
    }
}
