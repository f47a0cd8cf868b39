//! Batched fact sources

use super::{parse_json_line, parse_wireshark_line, Fact, LineFormat};
use crate::clock::BoundedClock;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

/// A source of ordered fact batches
#[async_trait]
pub trait FactSource: Send {
    /// Next batch, or `None` once the source is exhausted
    async fn next_batch(&mut self) -> Result<Option<Vec<Fact>>>;
}

/// Reads newline-delimited facts from any async reader.
///
/// Malformed lines, including ones that are not valid UTF-8, are dropped
/// here and never reach the engine.
pub struct LineFactSource<R> {
    reader: R,
    buffer: Vec<u8>,
    format: LineFormat,
    batch_size: usize,
    timestamp_field: Option<String>,
    clock: Arc<BoundedClock>,
    dropped: u64,
}

impl<R> LineFactSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, format: LineFormat, batch_size: usize) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            format,
            batch_size: batch_size.max(1),
            timestamp_field: None,
            clock: Arc::new(BoundedClock::default()),
            dropped: 0,
        }
    }

    /// Take fact timestamps from this JSON member instead of the ingestion clock
    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    pub fn with_clock(mut self, clock: Arc<BoundedClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of lines dropped as malformed so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

fn parse_line(format: LineFormat, timestamp_field: Option<&str>, line: &str, now: i64) -> Result<Fact> {
    match format {
        LineFormat::Json => parse_json_line(line, timestamp_field, now),
        LineFormat::Wireshark => parse_wireshark_line(line, now),
    }
}

#[async_trait]
impl<R> FactSource for LineFactSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_batch(&mut self) -> Result<Option<Vec<Fact>>> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            self.buffer.clear();
            if self.reader.read_until(b'\n', &mut self.buffer).await? == 0 {
                break;
            }
            let line = match std::str::from_utf8(&self.buffer) {
                Ok(line) => line.trim(),
                Err(e) => {
                    self.dropped += 1;
                    debug!(error = %e, "Dropping line that is not valid UTF-8");
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            match parse_line(self.format, self.timestamp_field.as_deref(), line, self.clock.now_millis()) {
                Ok(fact) => batch.push(fact),
                Err(e) => {
                    self.dropped += 1;
                    debug!(error = %e, format = self.format.as_str(), "Dropping malformed fact");
                }
            }
        }

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

/// In-memory source over a finite list of facts
#[derive(Debug, Clone)]
pub struct VecFactSource {
    facts: Vec<Fact>,
    position: usize,
    batch_size: usize,
}

impl VecFactSource {
    pub fn new(facts: Vec<Fact>, batch_size: usize) -> Self {
        Self {
            facts,
            position: 0,
            batch_size: batch_size.max(1),
        }
    }

    /// Start again from the first fact
    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

#[async_trait]
impl FactSource for VecFactSource {
    async fn next_batch(&mut self) -> Result<Option<Vec<Fact>>> {
        if self.position >= self.facts.len() {
            return Ok(None);
        }
        let end = (self.position + self.batch_size).min(self.facts.len());
        let batch = self.facts[self.position..end].to_vec();
        self.position = end;
        Ok(Some(batch))
    }
}
