//! Decorator statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by the eviction and expiry decorators
#[derive(Debug, Default)]
pub struct CacheStats {
    writes: AtomicU64,
    eviction_checks: AtomicU64,
    eviction_passes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record entries written through the decorator
    pub fn record_writes(&self, count: u64) {
        self.writes.fetch_add(count, Ordering::Relaxed);
    }

    /// Record an amortized capacity check
    pub fn record_check(&self) {
        self.eviction_checks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an eviction pass that removed `evicted` keys
    pub fn record_eviction_pass(&self, evicted: u64) {
        self.eviction_passes.fetch_add(1, Ordering::Relaxed);
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
    }

    /// Record a read that found an aged-out entry
    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Entries written
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Capacity checks performed
    pub fn eviction_checks(&self) -> u64 {
        self.eviction_checks.load(Ordering::Relaxed)
    }

    /// Checks that actually evicted
    pub fn eviction_passes(&self) -> u64 {
        self.eviction_passes.load(Ordering::Relaxed)
    }

    /// Keys evicted in total
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Aged-out entries observed
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_basic() {
        let stats = CacheStats::new();

        stats.record_writes(3);
        stats.record_check();
        stats.record_eviction_pass(5);
        stats.record_eviction_pass(2);
        stats.record_expiration();

        assert_eq!(stats.writes(), 3);
        assert_eq!(stats.eviction_checks(), 1);
        assert_eq!(stats.eviction_passes(), 2);
        assert_eq!(stats.evictions(), 7);
        assert_eq!(stats.expirations(), 1);
    }
}
