//! # factlens
//!
//! A streaming analytics engine for multi-dimensional facts.
//!
//! Facts are timestamped sets of named dimension values, such as one network
//! packet described by source, destination, protocol and size. factlens turns
//! a stream of them into three derived signals:
//!
//! - **Anomalies**: every combination of dimensions gets an interval counter,
//!   and a count well above its recent baseline is flagged once per interval
//! - **Categories**: numeric attributes are bucketed into labels like
//!   `low`/`medium`/`high` by histograms that learn and re-learn their
//!   boundaries from the data
//! - **Top-N**: sliding-window rankings of the busiest and most anomalous
//!   sources
//!
//! ## Architecture
//!
//! - **Pipeline**: partitions facts by a dimension hash and runs each
//!   partition's categorize → expand → detect flow on its own task
//! - **Store**: pluggable key-value and time-series backends behind async
//!   traits, with in-memory implementations included
//! - **Query**: zero-filled series, rankings and the anomaly log for an outer
//!   API layer

pub mod anomaly;
pub mod clock;
pub mod config;
pub mod counter;
pub mod expander;
pub mod fact;
pub mod histogram;
pub mod pipeline;
pub mod query;
pub mod store;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::anomaly::{AnomalyDetector, AnomalyRecord, Detection, DetectorConfig};
    pub use crate::config::{ComponentFactory, EngineConfig, Stores};
    pub use crate::counter::{DataPoint, TimeWindowCounter, TopNResult, TopNTracker};
    pub use crate::expander::DimensionExpander;
    pub use crate::fact::{Fact, FactKey, FactSource, LineFactSource, LineFormat, VecFactSource};
    pub use crate::histogram::{DynamicHistogram, HistogramConfig, NumberCategorizer};
    pub use crate::pipeline::{Pipeline, PipelineStats};
    pub use crate::query::QueryService;
    pub use crate::store::{KeyValueStore, TimeSeriesStore};
    pub use crate::{Error, Result};
}
