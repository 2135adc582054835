//! Time sources for entry timestamps

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of wall-clock time in epoch milliseconds
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;

    /// Time elapsed since `created_at`, clamped at zero
    fn age_of(&self, created_at: i64) -> Duration {
        let delta = self.now_millis().saturating_sub(created_at).max(0);
        Duration::from_millis(delta as u64)
    }
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Start at the given epoch millisecond
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_age() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_millis(250));

        assert_eq!(clock.now_millis(), 1_250);
        assert_eq!(clock.age_of(1_000), Duration::from_millis(250));
    }

    #[test]
    fn test_age_never_negative() {
        let clock = ManualClock::new(10);
        assert_eq!(clock.age_of(500), Duration::ZERO);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now_millis();
        assert!(first > 0);
        assert!(clock.now_millis() >= first);
    }
}
