//! Fact model
//!
//! A fact is one observed event: a timestamp plus a sorted set of named
//! dimension values. Facts are immutable once built; stages that need a
//! different timestamp or dimension set build a new fact.

mod codec;
mod parser;
mod source;

pub use codec::{encode, FactKey};
pub use parser::{parse_json_line, parse_wireshark_line, LineFormat};
pub use source::{FactSource, LineFactSource, VecFactSource};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sorted dimension map
pub type Dimensions = BTreeMap<String, String>;

/// A timestamped set of named dimension values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    /// Event time in milliseconds
    pub timestamp: i64,
    dimensions: Dimensions,
}

impl Fact {
    /// Create a fact, copying the dimensions into sorted order
    pub fn new<I, K, V>(timestamp: i64, dimensions: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            timestamp,
            dimensions: dimensions
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Create a fact from an already-sorted map
    pub fn from_dimensions(timestamp: i64, dimensions: Dimensions) -> Self {
        Self {
            timestamp,
            dimensions,
        }
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dimensions
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.dimensions.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Same dimensions, different timestamp
    pub fn with_timestamp(&self, timestamp: i64) -> Self {
        Self {
            timestamp,
            dimensions: self.dimensions.clone(),
        }
    }

    /// Same timestamp, different dimensions
    pub fn with_dimensions(&self, dimensions: Dimensions) -> Self {
        Self {
            timestamp: self.timestamp,
            dimensions,
        }
    }

    /// Canonical storage key for this fact's dimension set
    pub fn key(&self) -> FactKey {
        encode(&self.dimensions)
    }

    pub fn into_dimensions(self) -> Dimensions {
        self.dimensions
    }
}

/// Round a timestamp down to the start of its interval.
///
/// Uses floor division so negative timestamps land on the interval that
/// contains them rather than the one after.
pub fn round_down(timestamp: i64, interval: i64) -> i64 {
    if interval <= 0 {
        return timestamp;
    }
    timestamp.div_euclid(interval).saturating_mul(interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions_are_sorted() {
        let fact = Fact::new(10, vec![("z", "1"), ("a", "2"), ("m", "3")]);
        let names: Vec<&str> = fact.dimensions().keys().map(String::as_str).collect();
        assert_eq!(names, vec!["a", "m", "z"]);
    }

    #[test]
    fn test_with_timestamp_keeps_dimensions() {
        let fact = Fact::new(10, vec![("src", "10.0.0.1")]);
        let moved = fact.with_timestamp(5);
        assert_eq!(moved.timestamp, 5);
        assert_eq!(moved.get("src"), Some("10.0.0.1"));
        assert_eq!(fact.timestamp, 10);
    }

    #[test]
    fn test_round_down() {
        assert_eq!(round_down(12_345, 5_000), 10_000);
        assert_eq!(round_down(10_000, 5_000), 10_000);
        assert_eq!(round_down(-1, 5_000), -5_000);
        assert_eq!(round_down(7, 0), 7);
    }

    #[test]
    fn test_json_shape() {
        let fact = Fact::new(42, vec![("src", "a")]);
        let json = serde_json::to_string(&fact).unwrap();
        assert_eq!(json, r#"{"timestamp":42,"dimensions":{"src":"a"}}"#);
        let back: Fact = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fact);
    }
}
