//! Read-side query surface
//!
//! Everything an outer API layer needs to render dashboards: zero-filled
//! counter series, top-N rankings and the anomaly log.

use crate::anomaly::{AnomalyRecord, ANOMALY_SERIES};
use crate::counter::{
    count_series_entries, DataPoint, TimeWindowCounter, TopNResult, TopNTracker,
    ANOMALY_SOURCE_SERIES_PREFIX, ANOMALY_TOPN_PREFIX, ANOMALY_TOTAL_SERIES, TRAFFIC_SERIES,
    TRAFFIC_TOPN_PREFIX, UNIQUE_SOURCES_SERIES,
};
use crate::fact::{Dimensions, Fact, FactKey};
use crate::store::{KeyValueStore, TimeSeriesStore};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Placeholder for a field whose values differ inside a group
pub const GROUPED_PLACEHOLDER: &str = "[grouped]";

/// Query service over the engine's stores
#[derive(Clone)]
pub struct QueryService {
    kv: Arc<dyn KeyValueStore>,
    series: Arc<dyn TimeSeriesStore>,
    /// Counter interval size in milliseconds
    interval_ms: i64,
    /// TopN slot size in milliseconds
    topn_granularity_ms: i64,
}

impl QueryService {
    /// Create a new query service
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        series: Arc<dyn TimeSeriesStore>,
        interval_ms: i64,
        topn_granularity_ms: i64,
    ) -> Self {
        Self {
            kv,
            series,
            interval_ms,
            topn_granularity_ms,
        }
    }

    /// Counts of one series over `[start, end)`, zero-filled
    pub async fn query_time_range(&self, series_key: &[u8], start: i64, end: i64) -> Result<Vec<DataPoint>> {
        TimeWindowCounter::new(self.kv.clone(), self.interval_ms)
            .read_range(series_key, start, end)
            .await
    }

    /// Like [`query_time_range`](Self::query_time_range), keyed by the
    /// escaped form carried in `AnomalyRecord::data_series_key`
    pub async fn query_time_range_escaped(&self, data_series_key: &str, start: i64, end: i64) -> Result<Vec<DataPoint>> {
        let key = FactKey::parse_escaped(data_series_key)?;
        self.query_time_range(key.as_bytes(), start, end).await
    }

    /// Top values under `prefix` for the window starting at `start`
    pub async fn query_top_n(&self, prefix: &str, start: i64, limit: usize) -> Result<Vec<TopNResult>> {
        TopNTracker::new(self.kv.clone())
            .get(prefix, start, self.topn_granularity_ms, limit)
            .await
    }

    /// Sources with the most traffic
    pub async fn top_traffic_sources(&self, start: i64, limit: usize) -> Result<Vec<TopNResult>> {
        self.query_top_n(TRAFFIC_TOPN_PREFIX, start, limit).await
    }

    /// Sources with the most anomalies
    pub async fn top_anomalous_sources(&self, start: i64, limit: usize) -> Result<Vec<TopNResult>> {
        self.query_top_n(ANOMALY_TOPN_PREFIX, start, limit).await
    }

    /// Total facts per interval
    pub async fn traffic_counts(&self, start: i64, end: i64) -> Result<Vec<DataPoint>> {
        self.query_time_range(TRAFFIC_SERIES.as_bytes(), start, end).await
    }

    /// Distinct anomalies per interval, for all sources or just one
    pub async fn anomaly_counts(&self, start: i64, end: i64, source: Option<&str>) -> Result<Vec<DataPoint>> {
        let series = match source {
            Some(src) => format!("{}{}", ANOMALY_SOURCE_SERIES_PREFIX, src),
            None => ANOMALY_TOTAL_SERIES.to_string(),
        };
        count_series_entries(self.series.as_ref(), &series, start, end, self.interval_ms).await
    }

    /// Number of distinct sources with at least one anomaly, per interval
    pub async fn unique_anomalous_sources(&self, start: i64, end: i64) -> Result<Vec<DataPoint>> {
        self.query_time_range(UNIQUE_SOURCES_SERIES.as_bytes(), start, end).await
    }

    /// Anomalies in `[start, end)`, most recent first.
    ///
    /// With `group_by`, anomalies sharing a timestamp and a value of that
    /// dimension are merged into one record: fields with a single value keep
    /// it, fields with differing values become `"[grouped]"`. Anomalies
    /// lacking the dimension are left out. `filter` keeps records matching
    /// every given dimension exactly.
    pub async fn query_anomalies(
        &self,
        start: i64,
        end: i64,
        group_by: Option<&str>,
        filter: Option<&Dimensions>,
    ) -> Result<Vec<AnomalyRecord>> {
        let mut records = self.read_anomalies(start, end).await?;

        if let Some(dimension) = group_by {
            records = group_anomalies(records, dimension);
        }

        if let Some(filter) = filter {
            records.retain(|record| {
                filter
                    .iter()
                    .all(|(name, value)| record.fact.get(name) == Some(value.as_str()))
            });
        }

        records.reverse();
        Ok(records)
    }

    async fn read_anomalies(&self, start: i64, end: i64) -> Result<Vec<AnomalyRecord>> {
        let entries = self.series.read(ANOMALY_SERIES.as_bytes(), start, end).await?;
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(tag) = entry.tags.first() else {
                warn!(timestamp = entry.timestamp, "Anomaly entry without fact tag");
                continue;
            };
            let fact: Fact = serde_json::from_str(tag)
                .map_err(|e| Error::Decode(format!("anomaly fact at {}: {}", entry.timestamp, e)))?;
            records.push(AnomalyRecord {
                data_series_key: FactKey::from(entry.value.as_ref()).to_string(),
                fact,
            });
        }
        Ok(records)
    }
}

/// Merge time-ordered anomalies per `(timestamp, value of dimension)`
pub fn group_anomalies(records: Vec<AnomalyRecord>, dimension: &str) -> Vec<AnomalyRecord> {
    let mut groups: BTreeMap<i64, BTreeMap<String, AnomalyRecord>> = BTreeMap::new();

    for record in records {
        let Some(group_value) = record.fact.get(dimension).map(str::to_string) else {
            continue;
        };
        let by_value = groups.entry(record.fact.timestamp).or_default();
        match by_value.get_mut(&group_value) {
            Some(existing) => {
                let merged = merge_dimensions(existing.fact.dimensions(), record.fact.dimensions(), dimension);
                existing.fact = existing.fact.with_dimensions(merged);
            }
            None => {
                by_value.insert(group_value, record);
            }
        }
    }

    groups
        .into_values()
        .flat_map(|by_value| by_value.into_values())
        .collect()
}

fn merge_dimensions(existing: &Dimensions, incoming: &Dimensions, skip: &str) -> Dimensions {
    let mut merged = existing.clone();
    for (name, value) in incoming {
        if name == skip {
            continue;
        }
        match merged.get(name) {
            Some(current) if current != value => {
                merged.insert(name.clone(), GROUPED_PLACEHOLDER.to_string());
            }
            _ => {
                merged.insert(name.clone(), value.clone());
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: i64, dims: &[(&str, &str)]) -> AnomalyRecord {
        let fact = Fact::new(ts, dims.iter().map(|(k, v)| (*k, *v)));
        AnomalyRecord {
            data_series_key: fact.key().to_string(),
            fact,
        }
    }

    #[test]
    fn test_grouping_merges_differing_fields() {
        let records = vec![
            record(5, &[("src", "a"), ("app", "TCP"), ("dpt", "80")]),
            record(5, &[("src", "a"), ("app", "TCP"), ("dpt", "443")]),
            record(5, &[("src", "b"), ("app", "UDP")]),
            record(10, &[("src", "a"), ("app", "UDP")]),
            record(10, &[("app", "UDP")]),
        ];

        let grouped = group_anomalies(records, "src");
        assert_eq!(grouped.len(), 3);

        let first = &grouped[0].fact;
        assert_eq!(first.timestamp, 5);
        assert_eq!(first.get("src"), Some("a"));
        assert_eq!(first.get("app"), Some("TCP"));
        assert_eq!(first.get("dpt"), Some(GROUPED_PLACEHOLDER));

        assert_eq!(grouped[1].fact.get("src"), Some("b"));
        assert_eq!(grouped[2].fact.timestamp, 10);
    }

    #[test]
    fn test_merge_keeps_fields_missing_from_incoming() {
        let existing = Fact::new(0, vec![("src", "a"), ("dst", "x")]);
        let incoming = Fact::new(0, vec![("src", "a"), ("app", "TCP")]);
        let merged = merge_dimensions(existing.dimensions(), incoming.dimensions(), "src");
        assert_eq!(merged.get("dst").map(String::as_str), Some("x"));
        assert_eq!(merged.get("app").map(String::as_str), Some("TCP"));
    }
}
