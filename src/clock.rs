//! Monotonic ingestion clock
//!
//! Facts that arrive without their own timestamp are stamped at ingestion.
//! The anomaly detector's de-dup cache assumes non-decreasing timestamps per
//! partition, so the clock never goes backward even if the wall clock does.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// A millisecond clock that never returns a value smaller than one it
/// already returned.
pub struct BoundedClock {
    /// High-water mark in milliseconds
    high_water_ms: AtomicI64,
}

impl BoundedClock {
    pub fn new() -> Self {
        Self {
            high_water_ms: AtomicI64::new(0),
        }
    }

    /// Start from a fixed point, useful for replaying data and in tests
    pub fn starting_at(millis: i64) -> Self {
        Self {
            high_water_ms: AtomicI64::new(millis),
        }
    }

    /// Returns a non-decreasing millisecond timestamp.
    ///
    /// If the wall clock has gone backward (e.g. NTP adjustment), the
    /// previous high-water mark is returned instead.
    pub fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let prev = self.high_water_ms.fetch_max(wall, Ordering::AcqRel);
        wall.max(prev)
    }

    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_millis()).unwrap_or_default()
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_decreasing() {
        let clock = BoundedClock::default();
        let mut prev = 0i64;
        for _ in 0..100 {
            let ts = clock.now_millis();
            assert!(ts >= prev, "timestamps must never go backward");
            prev = ts;
        }
    }

    #[test]
    fn test_future_high_water_mark_holds() {
        let future = Utc::now().timestamp_millis() + 60_000;
        let clock = BoundedClock::starting_at(future);
        assert_eq!(clock.now_millis(), future);
    }

    #[test]
    fn test_now_returns_valid_datetime() {
        let clock = BoundedClock::default();
        let dt = clock.now();
        assert!(dt.timestamp() > 1_577_836_800, "timestamp should be after 2020");
    }

    #[test]
    fn test_concurrent_monotonicity() {
        use std::sync::Arc;
        let clock = Arc::new(BoundedClock::default());
        let mut handles = vec![];

        for _ in 0..4 {
            let c = clock.clone();
            handles.push(std::thread::spawn(move || {
                let mut prev = 0i64;
                for _ in 0..1000 {
                    let ts = c.now_millis();
                    assert!(ts >= prev);
                    prev = ts;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
