//! In-memory storage for development, testing and the standalone binary

use super::{decode_i64, encode_i64, KeyValueStore, Row, TimeSeriesEntry, TimeSeriesStore};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// In-memory key-value store
///
/// A single `BTreeMap` keeps rows ordered for range scans. `increment` holds
/// the write lock for the whole read-modify-write so it is atomic per key.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    rows: RwLock<BTreeMap<Bytes, BTreeMap<String, Bytes>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn increment(&self, key: &[u8], column: &str, delta: i64) -> Result<i64> {
        let mut rows = self.rows.write();
        let columns = rows.entry(Bytes::copy_from_slice(key)).or_default();
        let current = match columns.get(column) {
            Some(raw) => decode_i64(raw)?,
            None => 0,
        };
        let updated = current.saturating_add(delta);
        columns.insert(column.to_string(), encode_i64(updated));
        Ok(updated)
    }

    async fn get(&self, key: &[u8], column: &str) -> Result<Option<Bytes>> {
        Ok(self
            .rows
            .read()
            .get(key)
            .and_then(|columns| columns.get(column).cloned()))
    }

    async fn put(&self, key: &[u8], column: &str, value: Bytes) -> Result<()> {
        self.rows
            .write()
            .entry(Bytes::copy_from_slice(key))
            .or_default()
            .insert(column.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &[u8], column: &str) -> Result<()> {
        let mut rows = self.rows.write();
        if let Some(columns) = rows.get_mut(key) {
            columns.remove(column);
            if columns.is_empty() {
                rows.remove(key);
            }
        }
        Ok(())
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: Option<usize>) -> Result<Vec<Row>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let rows = self.rows.read();
        let range = rows.range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)));
        Ok(range
            .take(limit.unwrap_or(usize::MAX))
            .map(|(key, columns)| Row {
                key: key.clone(),
                columns: columns.clone(),
            })
            .collect())
    }
}

/// In-memory time-series store: one ordered map per series key
#[derive(Debug, Default)]
pub struct MemoryTimeSeriesStore {
    series: DashMap<Bytes, BTreeMap<(i64, Vec<String>), Bytes>>,
}

impl MemoryTimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryTimeSeriesStore {
    async fn write(&self, entry: TimeSeriesEntry) -> Result<()> {
        let TimeSeriesEntry {
            key,
            value,
            timestamp,
            mut tags,
        } = entry;
        tags.sort();
        self.series
            .entry(key)
            .or_default()
            .insert((timestamp, tags), value);
        Ok(())
    }

    async fn read(&self, key: &[u8], start: i64, end: i64) -> Result<Vec<TimeSeriesEntry>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let Some(points) = self.series.get(key) else {
            return Ok(Vec::new());
        };
        let series_key = Bytes::copy_from_slice(key);
        Ok(points
            .range((start, Vec::new())..)
            .take_while(|((ts, _), _)| *ts < end)
            .map(|((ts, tags), value)| TimeSeriesEntry {
                key: series_key.clone(),
                value: value.clone(),
                timestamp: *ts,
                tags: tags.clone(),
            })
            .collect())
    }
}
