//! Raw traffic totals and top talkers

use super::{TimeWindowCounter, TopNTracker};
use crate::fact::Fact;
use crate::store::KeyValueStore;
use crate::Result;
use std::sync::Arc;

/// Counter series holding total facts per interval
pub const TRAFFIC_SERIES: &str = "T";
/// TopN prefix ranking sources by fact count
pub const TRAFFIC_TOPN_PREFIX: &str = "tip_";

/// Counts every raw fact and ranks sources by volume
#[derive(Clone)]
pub struct TrafficCounter {
    totals: TimeWindowCounter,
    top_sources: TopNTracker,
    source_dimension: String,
    topn_window_ms: i64,
    topn_granularity_ms: i64,
}

impl TrafficCounter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        interval_ms: i64,
        source_dimension: impl Into<String>,
        topn_window_ms: i64,
        topn_granularity_ms: i64,
    ) -> Self {
        Self {
            totals: TimeWindowCounter::new(store.clone(), interval_ms),
            top_sources: TopNTracker::new(store),
            source_dimension: source_dimension.into(),
            topn_window_ms,
            topn_granularity_ms,
        }
    }

    pub async fn record(&self, fact: &Fact) -> Result<()> {
        self.totals
            .increment(TRAFFIC_SERIES.as_bytes(), fact.timestamp)
            .await?;
        if let Some(source) = fact.get(&self.source_dimension) {
            self.top_sources
                .add(
                    TRAFFIC_TOPN_PREFIX,
                    source,
                    fact.timestamp,
                    self.topn_window_ms,
                    self.topn_granularity_ms,
                )
                .await?;
        }
        Ok(())
    }
}
