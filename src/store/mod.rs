//! Storage interfaces
//!
//! The engine never talks to a concrete database. Components receive
//! `Arc<dyn KeyValueStore>` / `Arc<dyn TimeSeriesStore>` at construction and
//! only rely on single-key atomicity of `increment`.

mod memory;

pub use memory::{MemoryKeyValueStore, MemoryTimeSeriesStore};

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

/// One row returned by a range scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Bytes,
    pub columns: BTreeMap<String, Bytes>,
}

impl Row {
    pub fn column(&self, name: &str) -> Option<&Bytes> {
        self.columns.get(name)
    }
}

/// Ordered key-value store with named columns per row
///
/// Counter columns written through `increment` hold an 8-byte big-endian
/// `i64`; see [`encode_i64`] / [`decode_i64`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Atomically add `delta` to a counter column and return the new value
    async fn increment(&self, key: &[u8], column: &str, delta: i64) -> Result<i64>;

    async fn get(&self, key: &[u8], column: &str) -> Result<Option<Bytes>>;

    async fn put(&self, key: &[u8], column: &str, value: Bytes) -> Result<()>;

    async fn delete(&self, key: &[u8], column: &str) -> Result<()>;

    /// Rows with `start <= key < end` in key order, at most `limit` of them
    async fn scan(&self, start: &[u8], end: &[u8], limit: Option<usize>) -> Result<Vec<Row>>;
}

/// One time-series data point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSeriesEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub timestamp: i64,
    pub tags: Vec<String>,
}

impl TimeSeriesEntry {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Append-mostly time-series store
///
/// Entries are unique per `(key, timestamp, tags)`; writing the same
/// coordinate again replaces the value.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn write(&self, entry: TimeSeriesEntry) -> Result<()>;

    /// Entries of `key` with `start <= timestamp < end`, oldest first
    async fn read(&self, key: &[u8], start: i64, end: i64) -> Result<Vec<TimeSeriesEntry>>;
}

pub fn encode_i64(value: i64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

pub fn decode_i64(bytes: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Decode(format!("expected 8-byte counter, got {} bytes", bytes.len())))?;
    Ok(i64::from_be_bytes(raw))
}

/// Big-endian encoding of `value` with the sign bit flipped, so byte order
/// matches numeric order for negative values too.
pub fn sortable_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn from_sortable_i64(bytes: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Decode(format!("expected 8-byte timestamp, got {} bytes", bytes.len())))?;
    Ok((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
}
