//! Aggregates over emitted anomalies

use super::{DataPoint, TimeWindowCounter, TopNTracker};
use crate::fact::{round_down, Fact};
use crate::store::{decode_i64, encode_i64, KeyValueStore, TimeSeriesEntry, TimeSeriesStore};
use crate::Result;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Time series of all anomalies, tagged with the anomaly key
pub const ANOMALY_TOTAL_SERIES: &str = "T_";
/// Per-source anomaly series, `IC_<source>`
pub const ANOMALY_SOURCE_SERIES_PREFIX: &str = "IC_";
/// Counter series of distinct sources with anomalies per interval
pub const UNIQUE_SOURCES_SERIES: &str = "UI_";
/// TopN prefix ranking sources by anomaly count
pub const ANOMALY_TOPN_PREFIX: &str = "atip_";

const LAST_SEEN_PREFIX: &str = "IS_";
const LAST_SEEN_COLUMN: &str = "ls";
const MARKER_VALUE: &[u8] = &[0];

/// Consumes emitted anomalies and maintains totals, per-source counts, unique
/// sources and the top anomalous sources.
///
/// Totals are time-series entries tagged with the anomaly's key, so the same
/// dimension combination flagged twice in one interval counts once.
pub struct AnomalyCounter {
    kv: Arc<dyn KeyValueStore>,
    series: Arc<dyn TimeSeriesStore>,
    unique_sources: TimeWindowCounter,
    top_sources: TopNTracker,
    source_dimension: String,
    topn_window_ms: i64,
    topn_granularity_ms: i64,
    /// Last interval each source was counted in
    last_seen: HashMap<String, i64>,
}

impl AnomalyCounter {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        series: Arc<dyn TimeSeriesStore>,
        interval_ms: i64,
        source_dimension: impl Into<String>,
        topn_window_ms: i64,
        topn_granularity_ms: i64,
    ) -> Self {
        Self {
            unique_sources: TimeWindowCounter::new(kv.clone(), interval_ms),
            top_sources: TopNTracker::new(kv.clone()),
            kv,
            series,
            source_dimension: source_dimension.into(),
            topn_window_ms,
            topn_granularity_ms,
            last_seen: HashMap::new(),
        }
    }

    /// Record one anomaly. `anomaly.timestamp` is expected to be already
    /// rounded to the detection interval.
    pub async fn record(&mut self, anomaly: &Fact) -> Result<()> {
        let tag = anomaly.key().to_string();
        self.series
            .write(
                TimeSeriesEntry::new(ANOMALY_TOTAL_SERIES, Bytes::from_static(MARKER_VALUE), anomaly.timestamp)
                    .with_tag(tag.clone()),
            )
            .await?;

        let Some(source) = anomaly.get(&self.source_dimension).map(str::to_string) else {
            return Ok(());
        };

        self.series
            .write(
                TimeSeriesEntry::new(
                    format!("{}{}", ANOMALY_SOURCE_SERIES_PREFIX, source),
                    Bytes::from_static(MARKER_VALUE),
                    anomaly.timestamp,
                )
                .with_tag(tag),
            )
            .await?;

        if !self.seen_at(&source, anomaly.timestamp).await? {
            self.unique_sources
                .increment(UNIQUE_SOURCES_SERIES.as_bytes(), anomaly.timestamp)
                .await?;
        }

        self.top_sources
            .add(
                ANOMALY_TOPN_PREFIX,
                &source,
                anomaly.timestamp,
                self.topn_window_ms,
                self.topn_granularity_ms,
            )
            .await
    }

    // true if the source was already counted at or after `ts`; otherwise
    // marks it seen at `ts`
    async fn seen_at(&mut self, source: &str, ts: i64) -> Result<bool> {
        let last = match self.last_seen.get(source) {
            Some(last) => Some(*last),
            None => {
                let key = format!("{}{}", LAST_SEEN_PREFIX, source);
                match self.kv.get(key.as_bytes(), LAST_SEEN_COLUMN).await? {
                    Some(raw) => Some(decode_i64(&raw)?),
                    None => None,
                }
            }
        };

        if matches!(last, Some(last) if last >= ts) {
            return Ok(true);
        }

        let key = format!("{}{}", LAST_SEEN_PREFIX, source);
        self.kv
            .put(key.as_bytes(), LAST_SEEN_COLUMN, encode_i64(ts))
            .await?;
        self.last_seen.insert(source.to_string(), ts);
        Ok(false)
    }
}

/// Number of entries per interval in `[start, end)` of a time series,
/// zero-filled
pub async fn count_series_entries(
    store: &dyn TimeSeriesStore,
    series: &str,
    start: i64,
    end: i64,
    interval_ms: i64,
) -> Result<Vec<DataPoint>> {
    let interval = interval_ms.max(1);
    let start = round_down(start, interval);
    if end <= start {
        return Ok(Vec::new());
    }

    let mut counts: BTreeMap<i64, i64> = BTreeMap::new();
    for entry in store.read(series.as_bytes(), start, end).await? {
        *counts.entry(round_down(entry.timestamp, interval)).or_default() += 1;
    }

    let mut points = Vec::new();
    let mut ts = start;
    while ts < end {
        points.push(DataPoint {
            timestamp: ts,
            count: counts.get(&ts).copied().unwrap_or(0),
        });
        ts = match ts.checked_add(interval) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(points)
}
