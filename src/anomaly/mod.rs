//! Anomaly detection over per-combination interval counts
//!
//! Each fact bumps the count of its dimension combination for the current
//! interval. The updated count is compared with the previous `lookback`
//! intervals of the same combination.
//!
//! Facts must arrive in non-decreasing timestamp order per partition. The
//! de-dup cache only remembers the most recent interval, so a late fact for
//! an earlier interval can be flagged again.

use crate::counter::TimeWindowCounter;
use crate::fact::{round_down, Fact, FactKey};
use crate::store::{KeyValueStore, TimeSeriesEntry, TimeSeriesStore};
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Time series holding one entry per emitted anomaly
pub const ANOMALY_SERIES: &str = "a";

/// An emitted anomaly: the combination's key and the fact stamped at the
/// start of its interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub data_series_key: String,
    pub fact: Fact,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub interval_ms: i64,
    /// Number of prior intervals forming the baseline
    pub lookback: usize,
    /// Baseline mean at or below which nothing is flagged
    pub mean_threshold: f64,
    /// Standard deviations above the mean needed to flag
    pub sensitivity: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            lookback: 10,
            mean_threshold: 2.0,
            sensitivity: 2.0,
        }
    }
}

/// Result of running one fact through the detector
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Normal,
    Anomaly(AnomalyRecord),
    /// Flagged, but the same combination was already emitted this interval
    Duplicate,
}

/// Whether the last entry of `counts` is anomalous against the ones before it.
///
/// The mean is taken over the whole window, current point included. The
/// population standard deviation is taken over the prior points only.
pub fn is_last_point_anomaly(counts: &[i64], mean_threshold: f64, sensitivity: f64) -> bool {
    let Some((&last, prior)) = counts.split_last() else {
        return false;
    };

    let mean = counts.iter().sum::<i64>() as f64 / counts.len() as f64;
    if mean <= mean_threshold {
        return false;
    }

    (last as f64 - mean) > sensitivity * population_std_dev(prior)
}

fn population_std_dev(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<i64>() as f64 / n;
    let variance = values
        .iter()
        .map(|v| {
            let d = *v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt()
}

/// Remembers which keys were flagged in the latest interval only
#[derive(Debug, Default)]
struct DedupCache {
    interval: Option<i64>,
    keys: HashSet<FactKey>,
}

impl DedupCache {
    fn is_duplicate(&mut self, interval: i64, key: &FactKey) -> bool {
        if self.interval != Some(interval) {
            self.keys.clear();
            self.interval = Some(interval);
        }
        !self.keys.insert(key.clone())
    }
}

/// Baseline detector. One per pipeline partition; not shared.
pub struct AnomalyDetector {
    counter: TimeWindowCounter,
    anomalies: Arc<dyn TimeSeriesStore>,
    config: DetectorConfig,
    dedup: DedupCache,
}

impl AnomalyDetector {
    pub fn new(
        counters: Arc<dyn KeyValueStore>,
        anomalies: Arc<dyn TimeSeriesStore>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            counter: TimeWindowCounter::new(counters, config.interval_ms),
            anomalies,
            config,
            dedup: DedupCache::default(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub async fn detect(&mut self, fact: &Fact) -> Result<Detection> {
        let interval = self.counter.interval_ms();
        let ts = round_down(fact.timestamp, interval);
        let key = fact.key();

        let lookback = i64::try_from(self.config.lookback).unwrap_or(i64::MAX);
        let window_start = ts.saturating_sub(interval.saturating_mul(lookback));
        let mut counts = self
            .counter
            .read_counts(key.as_bytes(), window_start, self.config.lookback.saturating_add(1))
            .await?;
        let current = self.counter.increment(key.as_bytes(), ts).await?;
        match counts.last_mut() {
            Some(last) => *last = current,
            None => counts.push(current),
        }

        if !is_last_point_anomaly(&counts, self.config.mean_threshold, self.config.sensitivity) {
            return Ok(Detection::Normal);
        }

        if self.dedup.is_duplicate(ts, &key) {
            debug!(key = %key, timestamp = ts, "Suppressing duplicate anomaly");
            return Ok(Detection::Duplicate);
        }

        let record = AnomalyRecord {
            data_series_key: key.to_string(),
            fact: fact.with_timestamp(ts),
        };
        let entry = TimeSeriesEntry::new(
            ANOMALY_SERIES,
            Bytes::copy_from_slice(key.as_bytes()),
            ts,
        )
        .with_tag(serde_json::to_string(&record.fact)?);
        self.anomalies.write(entry).await?;

        debug!(key = %key, timestamp = ts, count = current, "Anomaly detected");
        Ok(Detection::Anomaly(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryKeyValueStore, MemoryTimeSeriesStore};

    fn with_last(history: &[i64], last: i64) -> Vec<i64> {
        let mut counts = history.to_vec();
        counts.push(last);
        counts
    }

    #[test]
    fn test_rule_with_varying_history() {
        let history = [0, 1, 2, 3, 4, 5, 6, 5, 4, 3];
        assert!(!is_last_point_anomaly(&with_last(&history, 4), 1.0, 1.0));
        assert!(is_last_point_anomaly(&with_last(&history, 24), 1.0, 1.0));
    }

    #[test]
    fn test_rule_with_flat_history() {
        let history = [0; 10];
        assert!(!is_last_point_anomaly(&with_last(&history, 2), 1.0, 1.0));
        assert!(is_last_point_anomaly(&with_last(&history, 12), 1.0, 1.0));
    }

    #[test]
    fn test_rule_without_history() {
        assert!(!is_last_point_anomaly(&[], 0.0, 0.0));
        assert!(!is_last_point_anomaly(&[100], 1.0, 1.0));
    }

    #[test]
    fn test_dedup_cache_resets_on_new_interval() {
        let mut cache = DedupCache::default();
        let key = FactKey::from(&b"k"[..]);
        assert!(!cache.is_duplicate(5, &key));
        assert!(cache.is_duplicate(5, &key));
        assert!(!cache.is_duplicate(10, &key));
        assert!(!cache.is_duplicate(5, &key));
    }

    fn detector(mean_threshold: f64) -> (AnomalyDetector, Arc<MemoryTimeSeriesStore>) {
        let series = Arc::new(MemoryTimeSeriesStore::new());
        let config = DetectorConfig {
            interval_ms: 1_000,
            lookback: 10,
            mean_threshold,
            sensitivity: 1.0,
        };
        let detector = AnomalyDetector::new(Arc::new(MemoryKeyValueStore::new()), series.clone(), config);
        (detector, series)
    }

    #[tokio::test]
    async fn test_burst_flags_once_per_interval() {
        let (mut detector, series) = detector(1.0);
        let fact = Fact::new(10_250, vec![("src", "10.0.0.1")]);

        let mut outcomes = Vec::new();
        for _ in 0..13 {
            outcomes.push(detector.detect(&fact).await.unwrap());
        }

        let anomalies: Vec<&AnomalyRecord> = outcomes
            .iter()
            .filter_map(|d| match d {
                Detection::Anomaly(record) => Some(record),
                _ => None,
            })
            .collect();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].fact.timestamp, 10_000);
        // 12th fact is the first with mean above threshold
        assert!(matches!(outcomes[11], Detection::Anomaly(_)));
        assert_eq!(outcomes[12], Detection::Duplicate);

        let stored = series.read(ANOMALY_SERIES.as_bytes(), 0, 20_000).await.unwrap();
        assert_eq!(stored.len(), 1);
        let persisted: Fact = serde_json::from_str(&stored[0].tags[0]).unwrap();
        assert_eq!(persisted, anomalies[0].fact);
    }

    #[tokio::test]
    async fn test_extreme_timestamps_are_counted() {
        let (mut detector, _) = detector(2.0);
        for ts in [i64::MIN, i64::MIN + 1, i64::MAX, i64::MAX - 1] {
            let fact = Fact::new(ts, vec![("src", "a")]);
            assert_eq!(detector.detect(&fact).await.unwrap(), Detection::Normal);
        }

        let counts = detector
            .counter
            .read_counts(Fact::new(0, vec![("src", "a")]).key().as_bytes(), i64::MAX - 10_000, 11)
            .await
            .unwrap();
        assert_eq!(counts.last(), Some(&2));
    }

    #[tokio::test]
    async fn test_quiet_series_is_never_flagged() {
        let (mut detector, _) = detector(2.0);
        for i in 0..20 {
            let fact = Fact::new(i * 1_000, vec![("src", "a")]);
            assert_eq!(detector.detect(&fact).await.unwrap(), Detection::Normal);
        }
    }
}
