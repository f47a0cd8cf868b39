//! Adaptive histograms for categorizing continuous attributes
//!
//! A `DynamicHistogram` learns bucket boundaries from its first samples,
//! then keeps per-bucket counts with exponential decay and re-partitions
//! itself whenever the decayed counts stop looking uniform. Bucket indexes
//! double as categories ("low", "medium", "high", ...).

mod categorizer;
mod chi_square;

pub use categorizer::{NumberCategorizer, DEFAULT_CATEGORIES};
pub use chi_square::{chi_square_p_value, chi_square_statistic, chi_square_test};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Confidence level used when deciding whether buckets are too skewed
const SKEW_ALPHA: f64 = 0.05;

/// Decay constant for a given half-life (mean lifetime = half-life / ln 2)
const MEAN_LIFETIME_FACTOR: f64 = 1.44;

/// Configuration of one histogram-backed numeric attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramConfig {
    /// Dimension name holding the numeric value
    pub attribute: String,
    /// Samples per bucket collected during warm-up
    pub initial_points_per_bucket: usize,
    /// Updates after which an untouched bucket's count halves
    pub half_life: u64,
}

impl HistogramConfig {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            initial_points_per_bucket: 300,
            half_life: 100,
        }
    }
}

/// One bucket of the histogram
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    /// Exclusive upper bound
    pub high: f64,
    /// Decayed count
    pub count: f64,
    /// Data point number of the last update
    pub last_update_at: u64,
}

/// Online histogram with adaptive bucket boundaries
#[derive(Debug, Clone)]
pub struct DynamicHistogram {
    num_buckets: usize,
    initial_points_per_bucket: usize,
    num_initial_points: usize,
    half_life: u64,
    mean_lifetime: f64,
    num_data_points: u64,
    initial_points: Vec<f64>,
    min: f64,
    max: f64,
    buckets: Vec<HistogramBucket>,
    rebalances: u64,
}

impl DynamicHistogram {
    /// Create a histogram.
    ///
    /// At least 3 buckets, 1 warm-up point per bucket and a half-life of 1
    /// are enforced.
    pub fn new(num_buckets: usize, initial_points_per_bucket: usize, half_life: u64) -> Self {
        let num_buckets = num_buckets.max(3);
        let initial_points_per_bucket = initial_points_per_bucket.max(1);
        let half_life = half_life.max(1);
        let num_initial_points = num_buckets * initial_points_per_bucket;

        Self {
            num_buckets,
            initial_points_per_bucket,
            num_initial_points,
            half_life,
            mean_lifetime: MEAN_LIFETIME_FACTOR * half_life as f64,
            num_data_points: 0,
            initial_points: Vec::with_capacity(num_initial_points),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            buckets: Vec::new(),
            rebalances: 0,
        }
    }

    pub fn from_config(config: &HistogramConfig, num_buckets: usize) -> Self {
        Self::new(num_buckets, config.initial_points_per_bucket, config.half_life)
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    pub fn num_data_points(&self) -> u64 {
        self.num_data_points
    }

    /// True once the warm-up quota has been collected
    pub fn is_active(&self) -> bool {
        self.num_data_points >= self.num_initial_points as u64
    }

    /// Number of rebalances performed so far
    pub fn rebalance_count(&self) -> u64 {
        self.rebalances
    }

    /// Current buckets, empty during warm-up
    pub fn buckets(&self) -> &[HistogramBucket] {
        &self.buckets
    }

    /// Index of the bucket `value` falls into, `None` during warm-up
    pub fn find_bucket_index(&self, value: f64) -> Option<usize> {
        if !self.is_active() {
            return None;
        }
        let index = self
            .buckets
            .iter()
            .position(|b| value < b.high)
            .unwrap_or(self.buckets.len() - 1);
        Some(index)
    }

    /// Record a sample. Returns true if it triggered a rebalance.
    pub fn add_data_point(&mut self, value: f64) -> bool {
        if !self.is_active() {
            self.add_initial_point(value);
            return false;
        }

        let Some(index) = self.find_bucket_index(value) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        let elapsed = self.num_data_points.saturating_sub(bucket.last_update_at);
        self.num_data_points += 1;
        bucket.last_update_at = self.num_data_points;
        bucket.count = 1.0 + bucket.count * (-(elapsed as f64) / self.mean_lifetime).exp();

        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }

        self.rebalance_if_needed()
    }

    fn add_initial_point(&mut self, value: f64) {
        self.initial_points.push(value);
        self.num_data_points += 1;
        if self.initial_points.len() == self.num_initial_points {
            self.create_initial_buckets();
        }
    }

    fn create_initial_buckets(&mut self) {
        let mut points = std::mem::take(&mut self.initial_points);
        points.sort_by(f64::total_cmp);

        let per_bucket = self.initial_points_per_bucket;
        let mut buckets = Vec::with_capacity(self.num_buckets);
        for i in 0..self.num_buckets - 1 {
            let offset = (i + 1) * per_bucket;
            let mut high = (points[offset - 1] + points[offset]) / 2.0;
            // repeated samples give equal midpoints; keep boundaries strictly increasing
            if let Some(previous) = buckets.last().map(|b: &HistogramBucket| b.high) {
                if high <= previous {
                    high = next_up(previous);
                }
            }
            buckets.push(HistogramBucket {
                high,
                count: per_bucket as f64,
                last_update_at: 0,
            });
        }
        buckets.push(HistogramBucket {
            high: f64::INFINITY,
            count: per_bucket as f64,
            last_update_at: 0,
        });

        self.min = points[0];
        self.max = points[points.len() - 1];
        self.buckets = buckets;
        debug!(
            buckets = self.num_buckets,
            min = self.min,
            max = self.max,
            "Histogram warm-up complete"
        );
    }

    fn rebalance_if_needed(&mut self) -> bool {
        if self.num_data_points % self.half_life != 0 || !self.is_too_skewed() {
            return false;
        }
        match rebalance(&self.buckets, self.min, self.max) {
            Some(buckets) => {
                self.buckets = buckets;
                self.rebalances += 1;
                debug!(
                    data_points = self.num_data_points,
                    rebalances = self.rebalances,
                    "Histogram rebalanced"
                );
                true
            }
            None => {
                debug!(
                    data_points = self.num_data_points,
                    "Histogram rebalance skipped: degenerate boundaries"
                );
                false
            }
        }
    }

    /// Chi-square test of the decayed counts against a uniform spread
    pub fn is_too_skewed(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        is_skewed(&self.buckets)
    }

    /// View with explicit range edges: a zero-count bucket at `min`, the
    /// interior buckets, then the last bucket's count bounded by `max`.
    pub fn snapshot(&self) -> Option<Vec<HistogramBucket>> {
        if !self.is_active() {
            return None;
        }
        let last = self.buckets[self.buckets.len() - 1];
        let mut view = Vec::with_capacity(self.buckets.len() + 1);
        view.push(HistogramBucket {
            high: self.min,
            count: 0.0,
            last_update_at: 0,
        });
        view.extend_from_slice(&self.buckets[..self.buckets.len() - 1]);
        view.push(HistogramBucket {
            high: self.max,
            count: last.count,
            last_update_at: last.last_update_at,
        });
        Some(view)
    }
}

/// True if the bucket counts reject uniformity at 95% confidence
pub fn is_skewed(buckets: &[HistogramBucket]) -> bool {
    if buckets.is_empty() {
        return false;
    }
    let total: f64 = buckets.iter().map(|b| b.count).sum();
    let average = total / buckets.len() as f64;
    let expected = vec![average; buckets.len()];
    let observed: Vec<u64> = buckets.iter().map(|b| b.count.round().max(0.0) as u64).collect();
    chi_square_test(&expected, &observed, SKEW_ALPHA)
}

/// Re-partition buckets so that each holds roughly the same decayed mass.
///
/// Density inside each bucket is assumed uniform, with `min` and `max`
/// closing the two edge buckets. A marker sweeps from `min` consuming
/// `average` mass per new bucket. Returns `None` when the sweep does not
/// produce strictly increasing finite boundaries.
pub fn rebalance(buckets: &[HistogramBucket], min: f64, max: f64) -> Option<Vec<HistogramBucket>> {
    let n = buckets.len();
    if n < 2 {
        return None;
    }

    let total: f64 = buckets.iter().map(|b| b.count).sum();
    let average = total / n as f64;
    if average.is_nan() || average <= 0.0 {
        return None;
    }

    let mut density = Vec::with_capacity(n);
    density.push(bucket_density(buckets[0].count, buckets[0].high - min));
    for i in 1..n - 1 {
        density.push(bucket_density(
            buckets[i].count,
            buckets[i].high - buckets[i - 1].high,
        ));
    }
    density.push(bucket_density(buckets[n - 1].count, max - buckets[n - 2].high));

    let mut current = 0;
    let mut marker = min;
    let mut last_update_at = 0u64;
    let mut available = buckets[0].count;
    let mut rebalanced = Vec::with_capacity(n);

    for _ in 0..n - 1 {
        let mut remaining = average;
        loop {
            last_update_at = last_update_at.max(buckets[current].last_update_at);
            if available > remaining {
                marker += remaining / density[current];
                available -= remaining;
                remaining = 0.0;
            } else {
                marker = buckets[current].high;
                remaining -= available;
                if current + 1 == n {
                    break;
                }
                current += 1;
                available = buckets[current].count;
            }
            if remaining <= 0.0 {
                break;
            }
        }
        rebalanced.push(HistogramBucket {
            high: marker,
            count: average,
            last_update_at,
        });
        last_update_at = buckets[current].last_update_at;
    }
    rebalanced.push(HistogramBucket {
        high: f64::INFINITY,
        count: average,
        last_update_at: last_update_at.max(buckets[n - 1].last_update_at),
    });

    let interior = &rebalanced[..n - 1];
    let finite = interior.iter().all(|b| b.high.is_finite());
    let increasing = interior.windows(2).all(|w| w[0].high < w[1].high);
    if finite && increasing {
        Some(rebalanced)
    } else {
        None
    }
}

/// Smallest `f64` greater than `value`
fn next_up(value: f64) -> f64 {
    if value.is_nan() || value == f64::INFINITY {
        return value;
    }
    if value == 0.0 {
        return f64::from_bits(1);
    }
    let bits = value.to_bits();
    if value > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

fn bucket_density(count: f64, width: f64) -> f64 {
    if width > 0.0 {
        count / width
    } else {
        f64::INFINITY
    }
}
