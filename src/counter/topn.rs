//! Sliding-window top-N ranking
//!
//! Ranked rows embed `i32::MAX - count` in their key, so a forward scan of
//! one window yields values in descending count order and a query of K values
//! reads K rows regardless of how many distinct values exist.
//!
//! Key layout (`ts` is the sign-flipped big-endian window start):
//!
//! ```text
//! rank:  prefix ‖ 't' ‖ ts ‖ i32_be(MAX - count) ‖ value
//! index: prefix ‖ 'i' ‖ ts ‖ value          column "k" = current rank key
//! ```

use crate::fact::round_down;
use crate::store::{encode_i64, sortable_i64, KeyValueStore};
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const RANK_MARKER: u8 = b't';
const INDEX_MARKER: u8 = b'i';
const INDEX_COLUMN: &str = "k";
const COUNT_COLUMN: &str = "c";

/// One ranked value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopNResult {
    pub value: String,
    pub count: i32,
}

/// Inverted-count rank table with a per-window index
///
/// # Consistency
///
/// Updating a value's rank deletes its old rank row and writes a new one,
/// then repoints the index. These are separate key operations with no
/// transaction around them. Two writers updating the same
/// `(prefix, window, value)` concurrently can lose an increment or leave a
/// stale rank row behind. Within one pipeline partition updates are
/// sequential, so this only matters when several instances share a store.
#[derive(Clone)]
pub struct TopNTracker {
    store: Arc<dyn KeyValueStore>,
}

impl TopNTracker {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Count one occurrence of `value` in every window of `window_ms` that
    /// still covers `timestamp`.
    pub async fn add(
        &self,
        prefix: &str,
        value: &str,
        timestamp: i64,
        window_ms: i64,
        granularity_ms: i64,
    ) -> Result<()> {
        let granularity = granularity_ms.max(1);
        let ts = round_down(timestamp, granularity);
        if window_ms <= 0 {
            return Ok(());
        }
        let oldest = ts.saturating_sub(window_ms);
        let mut start = ts;
        loop {
            self.increment_slot(prefix, value, start).await?;
            match start.checked_sub(granularity) {
                Some(previous) if previous > oldest => start = previous,
                _ => break,
            }
        }
        Ok(())
    }

    async fn increment_slot(&self, prefix: &str, value: &str, start: i64) -> Result<()> {
        let index_key = index_key(prefix, start, value);
        let mut count: i32 = 0;
        if let Some(old_key) = self.store.get(&index_key, INDEX_COLUMN).await? {
            count = decode_rank_key(prefix, &old_key)?.1;
            self.store.delete(&old_key, COUNT_COLUMN).await?;
        }
        count = count.saturating_add(1);

        let new_key = rank_key(prefix, start, count, value);
        self.store
            .put(&new_key, COUNT_COLUMN, encode_i64(count as i64))
            .await?;
        self.store
            .put(&index_key, INDEX_COLUMN, Bytes::from(new_key))
            .await
    }

    /// Top `limit` values of the window starting at `start_ts`, highest first
    pub async fn get(
        &self,
        prefix: &str,
        start_ts: i64,
        granularity_ms: i64,
        limit: usize,
    ) -> Result<Vec<TopNResult>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = round_down(start_ts, granularity_ms.max(1));
        let scan_start = window_prefix(prefix, RANK_MARKER, start);
        let scan_end = match start.checked_add(1) {
            Some(next) => window_prefix(prefix, RANK_MARKER, next),
            None => {
                let mut end = prefix.as_bytes().to_vec();
                end.push(RANK_MARKER + 1);
                end
            }
        };

        self.store
            .scan(&scan_start, &scan_end, Some(limit))
            .await?
            .iter()
            .map(|row| {
                let (value, count) = decode_rank_key(prefix, &row.key)?;
                Ok(TopNResult { value, count })
            })
            .collect()
    }
}

fn window_prefix(prefix: &str, marker: u8, start: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1 + 8 + 4 + 16);
    key.extend_from_slice(prefix.as_bytes());
    key.push(marker);
    key.extend_from_slice(&sortable_i64(start));
    key
}

fn rank_key(prefix: &str, start: i64, count: i32, value: &str) -> Vec<u8> {
    let mut key = window_prefix(prefix, RANK_MARKER, start);
    key.extend_from_slice(&(i32::MAX - count).to_be_bytes());
    key.extend_from_slice(value.as_bytes());
    key
}

fn index_key(prefix: &str, start: i64, value: &str) -> Vec<u8> {
    let mut key = window_prefix(prefix, INDEX_MARKER, start);
    key.extend_from_slice(value.as_bytes());
    key
}

fn decode_rank_key(prefix: &str, key: &[u8]) -> Result<(String, i32)> {
    let count_at = prefix.len() + 1 + 8;
    let value_at = count_at + 4;
    let inverted: [u8; 4] = key
        .get(count_at..value_at)
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| Error::Decode(format!("top-n key too short: {} bytes", key.len())))?;
    let count = i32::MAX - i32::from_be_bytes(inverted);
    let value = String::from_utf8_lossy(&key[value_at..]).into_owned();
    Ok((value, count))
}
