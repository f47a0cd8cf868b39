//! Engine configuration and environment-based component factory
//!
//! `EngineConfig::default()` carries the tuned defaults. `ComponentFactory`
//! overlays `FACTLENS_*` environment variables on top and builds the storage
//! backends.

use crate::anomaly::DetectorConfig;
use crate::histogram::{HistogramConfig, DEFAULT_CATEGORIES};
use crate::store::{KeyValueStore, MemoryKeyValueStore, MemoryTimeSeriesStore, TimeSeriesStore};
use crate::{Error, Result};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Upper bound on any channel capacity derived from the config
pub const MAX_CHANNEL_CAPACITY: usize = 1 << 20;
/// Upper bound on the anomaly baseline length, in intervals
pub const MAX_LOOKBACK: usize = 10_000;

/// Tunables for the whole analytics flow
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Counter and anomaly interval size
    pub interval_ms: i64,
    /// Prior intervals in the anomaly baseline
    pub lookback: usize,
    pub mean_threshold: f64,
    pub sensitivity: f64,
    /// Dimensions kept in every expanded combination
    pub required_dimensions: Vec<String>,
    pub max_subset_size: usize,
    /// TopN slot size
    pub topn_granularity_ms: i64,
    /// TopN window length, in slots
    pub topn_window_slots: i64,
    /// Dimension used for partition routing and source rankings
    pub partition_dimension: String,
    pub partitions: usize,
    pub batch_size: usize,
    /// Batches buffered per partition before submitters wait
    pub queue_capacity: usize,
    pub batch_timeout: Duration,
    pub histograms: Vec<HistogramConfig>,
    pub categories: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            lookback: 10,
            mean_threshold: 2.0,
            sensitivity: 2.0,
            required_dimensions: vec!["src".to_string()],
            max_subset_size: 2,
            topn_granularity_ms: 60_000,
            topn_window_slots: 10,
            partition_dimension: "src".to_string(),
            partitions: 4,
            batch_size: 100,
            queue_capacity: 64,
            batch_timeout: Duration::from_secs(30),
            histograms: vec![HistogramConfig::new("rl"), HistogramConfig::new("rs")],
            categories: DEFAULT_CATEGORIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            interval_ms: self.interval_ms,
            lookback: self.lookback,
            mean_threshold: self.mean_threshold,
            sensitivity: self.sensitivity,
        }
    }

    pub fn topn_window_ms(&self) -> i64 {
        self.topn_granularity_ms.saturating_mul(self.topn_window_slots)
    }

    /// Capacity of the output channel carrying detected anomalies
    pub fn anomaly_buffer(&self) -> usize {
        self.queue_capacity
            .saturating_mul(self.batch_size)
            .clamp(1, MAX_CHANNEL_CAPACITY)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms <= 0 {
            return Err(Error::Config(format!(
                "interval must be positive, got {}ms",
                self.interval_ms
            )));
        }
        if self.lookback > MAX_LOOKBACK {
            return Err(Error::Config(format!(
                "lookback must be at most {} intervals, got {}",
                MAX_LOOKBACK, self.lookback
            )));
        }
        if self.topn_granularity_ms <= 0 || self.topn_window_slots <= 0 {
            return Err(Error::Config(
                "top-n granularity and window must be positive".to_string(),
            ));
        }
        if self.partitions == 0 || self.batch_size == 0 || self.queue_capacity == 0 {
            return Err(Error::Config(
                "partitions, batch size and queue capacity must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity > MAX_CHANNEL_CAPACITY || self.batch_size > MAX_CHANNEL_CAPACITY {
            return Err(Error::Config(format!(
                "queue capacity and batch size must be at most {}, got {} and {}",
                MAX_CHANNEL_CAPACITY, self.queue_capacity, self.batch_size
            )));
        }
        if !self.required_dimensions.contains(&self.partition_dimension) {
            // combinations lacking it would be detected on every partition
            return Err(Error::Config(format!(
                "partition dimension '{}' must be one of the required dimensions {:?}",
                self.partition_dimension, self.required_dimensions
            )));
        }
        if !self.mean_threshold.is_finite() || !self.sensitivity.is_finite() {
            return Err(Error::Config(
                "mean threshold and sensitivity must be finite".to_string(),
            ));
        }
        if self.categories.len() < 3 && !self.histograms.is_empty() {
            return Err(Error::Config(format!(
                "histograms need at least 3 categories, got {}",
                self.categories.len()
            )));
        }
        if self.batch_timeout.is_zero() {
            return Err(Error::Config("batch timeout must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Overlay variables from `lookup` on the defaults
    ///
    /// Variables (all optional):
    /// - FACTLENS_INTERVAL_MS, FACTLENS_LOOKBACK
    /// - FACTLENS_MEAN_THRESHOLD, FACTLENS_SENSITIVITY
    /// - FACTLENS_REQUIRED_DIMENSIONS (comma separated), FACTLENS_MAX_SUBSET_SIZE
    /// - FACTLENS_TOPN_GRANULARITY_MS, FACTLENS_TOPN_WINDOW_SLOTS
    /// - FACTLENS_PARTITION_DIMENSION, FACTLENS_PARTITIONS
    /// - FACTLENS_BATCH_SIZE, FACTLENS_QUEUE_CAPACITY, FACTLENS_BATCH_TIMEOUT_MS
    /// - FACTLENS_HISTOGRAM_ATTRIBUTES (comma separated, empty disables)
    /// - FACTLENS_HISTOGRAM_POINTS_PER_BUCKET, FACTLENS_HISTOGRAM_HALF_LIFE
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string());

        if let Some(v) = get("FACTLENS_INTERVAL_MS") {
            config.interval_ms = parse_var("FACTLENS_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("FACTLENS_LOOKBACK") {
            config.lookback = parse_var("FACTLENS_LOOKBACK", &v)?;
        }
        if let Some(v) = get("FACTLENS_MEAN_THRESHOLD") {
            config.mean_threshold = parse_var("FACTLENS_MEAN_THRESHOLD", &v)?;
        }
        if let Some(v) = get("FACTLENS_SENSITIVITY") {
            config.sensitivity = parse_var("FACTLENS_SENSITIVITY", &v)?;
        }
        if let Some(v) = get("FACTLENS_REQUIRED_DIMENSIONS") {
            config.required_dimensions = parse_list(&v);
        }
        if let Some(v) = get("FACTLENS_MAX_SUBSET_SIZE") {
            config.max_subset_size = parse_var("FACTLENS_MAX_SUBSET_SIZE", &v)?;
        }
        if let Some(v) = get("FACTLENS_TOPN_GRANULARITY_MS") {
            config.topn_granularity_ms = parse_var("FACTLENS_TOPN_GRANULARITY_MS", &v)?;
        }
        if let Some(v) = get("FACTLENS_TOPN_WINDOW_SLOTS") {
            config.topn_window_slots = parse_var("FACTLENS_TOPN_WINDOW_SLOTS", &v)?;
        }
        if let Some(v) = get("FACTLENS_PARTITION_DIMENSION") {
            if v.is_empty() {
                return Err(Error::Config(
                    "FACTLENS_PARTITION_DIMENSION cannot be empty".to_string(),
                ));
            }
            config.partition_dimension = v;
        }
        if let Some(v) = get("FACTLENS_PARTITIONS") {
            config.partitions = parse_var("FACTLENS_PARTITIONS", &v)?;
        }
        if let Some(v) = get("FACTLENS_BATCH_SIZE") {
            config.batch_size = parse_var("FACTLENS_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("FACTLENS_QUEUE_CAPACITY") {
            config.queue_capacity = parse_var("FACTLENS_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("FACTLENS_BATCH_TIMEOUT_MS") {
            config.batch_timeout = Duration::from_millis(parse_var("FACTLENS_BATCH_TIMEOUT_MS", &v)?);
        }

        let points_per_bucket = match get("FACTLENS_HISTOGRAM_POINTS_PER_BUCKET") {
            Some(v) => Some(parse_var::<usize>("FACTLENS_HISTOGRAM_POINTS_PER_BUCKET", &v)?),
            None => None,
        };
        let half_life = match get("FACTLENS_HISTOGRAM_HALF_LIFE") {
            Some(v) => Some(parse_var::<u64>("FACTLENS_HISTOGRAM_HALF_LIFE", &v)?),
            None => None,
        };
        if let Some(v) = get("FACTLENS_HISTOGRAM_ATTRIBUTES") {
            config.histograms = parse_list(&v).into_iter().map(HistogramConfig::new).collect();
        }
        for histogram in config.histograms.iter_mut() {
            if let Some(points) = points_per_bucket {
                histogram.initial_points_per_bucket = points;
            }
            if let Some(half_life) = half_life {
                histogram.half_life = half_life;
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| Error::Config(format!("{name} has invalid value '{raw}': {e}")))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Storage handles shared by the pipeline and the query service
#[derive(Clone)]
pub struct Stores {
    pub kv: Arc<dyn KeyValueStore>,
    pub series: Arc<dyn TimeSeriesStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            kv: Arc::new(MemoryKeyValueStore::new()),
            series: Arc::new(MemoryTimeSeriesStore::new()),
        }
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Engine configuration from `FACTLENS_*` environment variables
    pub fn engine_config_from_env() -> Result<EngineConfig> {
        EngineConfig::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create storage backends from environment
    ///
    /// Environment variables:
    /// - FACTLENS_STORE_BACKEND: "memory" (default)
    pub fn create_stores() -> Result<Stores> {
        let backend =
            std::env::var("FACTLENS_STORE_BACKEND").unwrap_or_else(|_| "memory".to_string());
        Self::create_stores_for(&backend)
    }

    pub fn create_stores_for(backend: &str) -> Result<Stores> {
        match backend.trim() {
            "memory" => {
                info!("Using in-memory key-value and time-series stores");
                Ok(Stores::in_memory())
            }
            other => Err(Error::Config(format!(
                "Unknown FACTLENS_STORE_BACKEND: {}. Use 'memory'",
                other
            ))),
        }
    }
}
