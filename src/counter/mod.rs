//! Interval-bucketed counters
//!
//! Every count lives at one `(series, interval start)` coordinate in the
//! key-value store. Reads are zero-filled so callers always get a dense
//! window.

mod anomaly_counts;
mod topn;
mod traffic;

pub use anomaly_counts::{
    count_series_entries, AnomalyCounter, ANOMALY_SOURCE_SERIES_PREFIX, ANOMALY_TOPN_PREFIX,
    ANOMALY_TOTAL_SERIES, UNIQUE_SOURCES_SERIES,
};
pub use topn::{TopNResult, TopNTracker};
pub use traffic::{TrafficCounter, TRAFFIC_SERIES, TRAFFIC_TOPN_PREFIX};

use crate::fact::round_down;
use crate::store::{decode_i64, encode_i64, from_sortable_i64, sortable_i64, KeyValueStore};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const COUNTER_NAMESPACE: &[u8] = b"cnt\0";
const COUNT_COLUMN: &str = "c";

/// One interval of a counter series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: i64,
    pub count: i64,
}

/// Occurrence counter rounded to a fixed interval
#[derive(Clone)]
pub struct TimeWindowCounter {
    store: Arc<dyn KeyValueStore>,
    interval_ms: i64,
}

impl TimeWindowCounter {
    pub fn new(store: Arc<dyn KeyValueStore>, interval_ms: i64) -> Self {
        Self {
            store,
            interval_ms: interval_ms.max(1),
        }
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    // namespace ‖ u32_be(len) ‖ series ‖ sortable(ts); the length prefix keeps
    // one series' range from running into another whose name it prefixes
    fn row_key(&self, series: &[u8], timestamp: i64) -> Vec<u8> {
        let mut key = Vec::with_capacity(COUNTER_NAMESPACE.len() + 4 + series.len() + 8);
        key.extend_from_slice(COUNTER_NAMESPACE);
        key.extend_from_slice(&(series.len() as u32).to_be_bytes());
        key.extend_from_slice(series);
        key.extend_from_slice(&sortable_i64(timestamp));
        key
    }

    /// Add one occurrence and return the interval's new count
    pub async fn increment(&self, series: &[u8], timestamp: i64) -> Result<i64> {
        self.add(series, timestamp, 1).await
    }

    pub async fn add(&self, series: &[u8], timestamp: i64, delta: i64) -> Result<i64> {
        let ts = round_down(timestamp, self.interval_ms);
        self.store
            .increment(&self.row_key(series, ts), COUNT_COLUMN, delta)
            .await
    }

    /// Overwrite one interval's count
    pub async fn set(&self, series: &[u8], timestamp: i64, count: i64) -> Result<()> {
        let ts = round_down(timestamp, self.interval_ms);
        self.store
            .put(&self.row_key(series, ts), COUNT_COLUMN, encode_i64(count))
            .await
    }

    /// One point per interval in `[start, end)`, `start` rounded down,
    /// zero where nothing was recorded.
    pub async fn read_range(&self, series: &[u8], start: i64, end: i64) -> Result<Vec<DataPoint>> {
        let start = round_down(start, self.interval_ms);
        if end <= start {
            return Ok(Vec::new());
        }

        let rows = self
            .store
            .scan(&self.row_key(series, start), &self.row_key(series, end), None)
            .await?;

        let prefix_len = COUNTER_NAMESPACE.len() + 4 + series.len();
        let mut recorded = HashMap::with_capacity(rows.len());
        for row in rows {
            let Some(raw) = row.column(COUNT_COLUMN) else {
                continue;
            };
            let ts = from_sortable_i64(row.key.get(prefix_len..).unwrap_or_default())?;
            recorded.insert(ts, decode_i64(raw)?);
        }

        let mut points = Vec::new();
        let mut ts = start;
        while ts < end {
            points.push(DataPoint {
                timestamp: ts,
                count: recorded.get(&ts).copied().unwrap_or(0),
            });
            ts = match ts.checked_add(self.interval_ms) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(points)
    }

    /// Dense counts for `points` consecutive intervals starting at `start`
    pub async fn read_counts(&self, series: &[u8], start: i64, points: usize) -> Result<Vec<i64>> {
        let start = round_down(start, self.interval_ms);
        let span = self
            .interval_ms
            .saturating_mul(i64::try_from(points).unwrap_or(i64::MAX));
        let end = start.saturating_add(span);
        Ok(self
            .read_range(series, start, end)
            .await?
            .into_iter()
            .map(|p| p.count)
            .collect())
    }
}
