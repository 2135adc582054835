//! Capacity-bounded eviction decorator
//!
//! Writes are counted with a lock-free counter. Every time the counter
//! crosses a multiple of the eviction volume (`floor(capacity * ratio)`), the
//! wrapped backend's size is checked and, when over capacity, a batch of keys
//! chosen by the [`EvictionStrategy`] is removed. The bound is approximate:
//! size may exceed capacity by up to one eviction volume between checks.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{Backend, Supplier, Updater};
use crate::error::{Error, Result};
use crate::stats::CacheStats;
use crate::value::Value;

/// Picks which keys an eviction pass removes
pub trait EvictionStrategy: Send + Sync + fmt::Debug {
    /// Choose up to `count` victims among `keys`
    fn select(&self, backend: &dyn Backend, keys: Vec<String>, count: usize)
        -> Result<Vec<String>>;
}

/// Uniform random sample without replacement (reservoir sampling)
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSample;

impl EvictionStrategy for RandomSample {
    fn select(&self, _: &dyn Backend, keys: Vec<String>, count: usize) -> Result<Vec<String>> {
        if count >= keys.len() {
            return Ok(keys);
        }
        Ok(keys
            .into_iter()
            .choose_multiple(&mut rand::thread_rng(), count))
    }
}

/// Evicts the entries with the greatest age first
#[derive(Debug, Default, Clone, Copy)]
pub struct OldestFirst;

impl EvictionStrategy for OldestFirst {
    fn select(&self, backend: &dyn Backend, keys: Vec<String>, count: usize) -> Result<Vec<String>> {
        if count >= keys.len() {
            return Ok(keys);
        }
        let mut aged = keys
            .into_iter()
            .map(|key| Ok((backend.age(&key)?.unwrap_or(Duration::MAX), key)))
            .collect::<Result<Vec<_>>>()?;

        aged.select_nth_unstable_by(count, |a, b| b.0.cmp(&a.0));
        aged.truncate(count);
        Ok(aged.into_iter().map(|(_, key)| key).collect())
    }
}

/// Named strategies selectable from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// [`RandomSample`]
    #[default]
    Random,
    /// [`OldestFirst`]
    Oldest,
}

impl StrategyKind {
    /// Instantiate the strategy
    pub fn build(self) -> Arc<dyn EvictionStrategy> {
        match self {
            StrategyKind::Random => Arc::new(RandomSample),
            StrategyKind::Oldest => Arc::new(OldestFirst),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(StrategyKind::Random),
            "oldest" => Ok(StrategyKind::Oldest),
            other => Err(Error::Config(format!("unknown eviction strategy '{}'", other))),
        }
    }
}

fn default_ratio() -> f64 {
    0.1
}

/// Capacity limit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Target maximum number of entries
    pub capacity: usize,
    /// Fraction of capacity evicted per pass, in `(0, 1]`
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    /// Victim selection
    #[serde(default)]
    pub strategy: StrategyKind,
}

impl EvictionConfig {
    /// Random eviction of 10% of `capacity` per pass
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ratio: default_ratio(),
            strategy: StrategyKind::default(),
        }
    }

    /// Set the eviction ratio
    pub fn ratio(mut self, ratio: f64) -> Self {
        self.ratio = ratio;
        self
    }

    /// Set the victim selection strategy
    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Validate and compute `floor(capacity * ratio)`
    pub fn eviction_volume(&self) -> Result<usize> {
        if self.capacity == 0 {
            return Err(Error::Config("capacity must be greater than 0".to_string()));
        }
        if !(self.ratio > 0.0 && self.ratio <= 1.0) {
            return Err(Error::Config(format!(
                "eviction ratio must be in (0, 1], got {}",
                self.ratio
            )));
        }
        let volume = (self.capacity as f64 * self.ratio).floor() as usize;
        if volume == 0 {
            return Err(Error::Config(format!(
                "capacity {} * ratio {} evicts nothing",
                self.capacity, self.ratio
            )));
        }
        Ok(volume)
    }
}

/// Keeps the wrapped backend near a fixed number of entries
pub struct CapacityLimited<B> {
    inner: B,
    capacity: usize,
    volume: usize,
    strategy: Arc<dyn EvictionStrategy>,
    ops: AtomicU64,
    stats: CacheStats,
}

impl<B: Backend> CapacityLimited<B> {
    /// Wrap `inner` using the strategy named in `config`
    pub fn new(inner: B, config: EvictionConfig) -> Result<Self> {
        let strategy = config.strategy.build();
        Self::with_strategy(inner, config, strategy)
    }

    /// Wrap `inner` with a custom strategy; `config.strategy` is ignored
    pub fn with_strategy(
        inner: B,
        config: EvictionConfig,
        strategy: Arc<dyn EvictionStrategy>,
    ) -> Result<Self> {
        let volume = config.eviction_volume()?;
        Ok(Self {
            inner,
            capacity: config.capacity,
            volume,
            strategy,
            ops: AtomicU64::new(0),
            stats: CacheStats::new(),
        })
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keys removed per pass, and writes between checks
    pub fn eviction_volume(&self) -> usize {
        self.volume
    }

    /// Eviction counters
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

    /// Run a capacity check now, returning how many keys were evicted
    pub fn evict_if_over_capacity(&self) -> Result<usize> {
        self.stats.record_check();
        let keys = self.inner.key_set()?;
        if keys.len() <= self.capacity {
            return Ok(0);
        }

        let count = self.volume.max(keys.len() - self.capacity);
        let victims = self
            .strategy
            .select(&self.inner, keys.into_iter().collect(), count)?;
        self.inner.remove_all(&victims)?;

        self.stats.record_eviction_pass(victims.len() as u64);
        debug!(
            evicted = victims.len(),
            capacity = self.capacity,
            "capacity eviction pass"
        );
        Ok(victims.len())
    }

    // The write already happened; a failed pass is logged, never surfaced.
    fn record(&self, touched: usize) {
        if touched == 0 {
            return;
        }
        let touched = touched as u64;
        let volume = self.volume as u64;
        self.stats.record_writes(touched);

        let before = self.ops.fetch_add(touched, Ordering::Relaxed);
        if before / volume != (before + touched) / volume {
            if let Err(e) = self.evict_if_over_capacity() {
                warn!(error = %e, capacity = self.capacity, "capacity eviction pass failed");
            }
        }
    }
}

impl<B: Backend> Backend for CapacityLimited<B> {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(key)
    }

    fn get_type(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_type(key)
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        self.inner.put(key, value)?;
        self.record(1);
        Ok(())
    }

    fn put_all(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let touched = entries.len();
        self.inner.put_all(entries)?;
        self.record(touched);
        Ok(())
    }

    fn compute_if_absent(&self, key: &str, supplier: Supplier<'_>) -> Result<Value> {
        let value = self.inner.compute_if_absent(key, supplier)?;
        self.record(1);
        Ok(value)
    }

    fn compute_if_absent_or_update(
        &self,
        key: &str,
        supplier: Supplier<'_>,
        update: Updater<'_>,
    ) -> Result<Value> {
        let value = self
            .inner
            .compute_if_absent_or_update(key, supplier, update)?;
        self.record(1);
        Ok(value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key)
    }

    fn remove_all(&self, keys: &[String]) -> Result<()> {
        self.inner.remove_all(keys)
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        self.inner.contains_key(key)
    }

    fn key_set(&self) -> Result<HashSet<String>> {
        self.inner.key_set()
    }

    fn size(&self) -> Result<usize> {
        self.inner.size()
    }

    fn is_empty(&self) -> Result<bool> {
        self.inner.is_empty()
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()?;
        self.ops.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn age(&self, key: &str) -> Result<Option<Duration>> {
        self.inner.age(key)
    }
}
