//! Numeric attribute categorization

use super::{DynamicHistogram, HistogramConfig};
use crate::fact::Fact;
use std::collections::BTreeMap;
use tracing::debug;

/// Default category labels, lowest bucket first
pub const DEFAULT_CATEGORIES: [&str; 3] = ["low", "medium", "high"];

/// Replaces numeric dimension values with category labels.
///
/// Owns one histogram per configured attribute. Not shared: each pipeline
/// partition holds its own categorizer.
#[derive(Debug, Clone)]
pub struct NumberCategorizer {
    histograms: BTreeMap<String, DynamicHistogram>,
    labels: Vec<String>,
}

impl NumberCategorizer {
    pub fn new(configs: &[HistogramConfig], labels: Vec<String>) -> Self {
        let histograms = configs
            .iter()
            .map(|c| {
                (
                    c.attribute.clone(),
                    DynamicHistogram::from_config(c, labels.len()),
                )
            })
            .collect();
        Self { histograms, labels }
    }

    pub fn with_default_labels(configs: &[HistogramConfig]) -> Self {
        Self::new(
            configs,
            DEFAULT_CATEGORIES.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn histogram(&self, attribute: &str) -> Option<&DynamicHistogram> {
        self.histograms.get(attribute)
    }

    /// Total rebalances across all histograms
    pub fn rebalance_count(&self) -> u64 {
        self.histograms.values().map(|h| h.rebalance_count()).sum()
    }

    /// Categorize every configured attribute present on the fact.
    ///
    /// Values that are still in warm-up, unparseable or non-finite are removed
    /// so they never leak raw numbers into dimension combinations.
    pub fn categorize(&mut self, fact: &Fact) -> Fact {
        let mut dimensions = fact.dimensions().clone();
        for (attribute, histogram) in self.histograms.iter_mut() {
            let Some(raw) = dimensions.get(attribute) else {
                continue;
            };
            let value = match raw.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => v,
                _ => {
                    debug!(attribute = %attribute, value = %raw, "Dropping non-numeric attribute");
                    dimensions.remove(attribute);
                    continue;
                }
            };

            histogram.add_data_point(value);
            match histogram.find_bucket_index(value) {
                Some(index) => {
                    let label = self
                        .labels
                        .get(index)
                        .cloned()
                        .unwrap_or_else(|| index.to_string());
                    dimensions.insert(attribute.clone(), label);
                }
                None => {
                    dimensions.remove(attribute);
                }
            }
        }
        fact.with_dimensions(dimensions)
    }
}
