//! Partitioned processing pipeline
//!
//! Facts are routed by a hash of the partition dimension to one of N worker
//! tasks. Each worker owns its categorizer, expander, detector and counters,
//! and processes one batch at a time in arrival order. Queues between the
//! submitter and the workers are bounded, so a slow partition pushes back on
//! `submit`.

pub mod telemetry;

use crate::anomaly::{AnomalyDetector, AnomalyRecord, Detection};
use crate::config::{EngineConfig, Stores};
use crate::counter::{AnomalyCounter, TrafficCounter};
use crate::expander::DimensionExpander;
use crate::fact::{Fact, FactSource};
use crate::histogram::NumberCategorizer;
use crate::{Error, Result};
use futures::future::join_all;
use std::ops::AddAssign;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one batch produced
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub facts: usize,
    /// Dimension combinations run through the detector
    pub combinations: usize,
    pub anomalies: Vec<AnomalyRecord>,
    pub duplicates: usize,
}

/// One partition's processing state. Never shared between tasks.
pub struct PartitionWorker {
    partition: usize,
    categorizer: NumberCategorizer,
    expander: DimensionExpander,
    detector: AnomalyDetector,
    traffic: TrafficCounter,
    anomaly_counter: AnomalyCounter,
    reported_rebalances: u64,
}

impl PartitionWorker {
    pub fn new(partition: usize, config: &EngineConfig, stores: &Stores) -> Self {
        Self {
            partition,
            categorizer: NumberCategorizer::new(&config.histograms, config.categories.clone()),
            expander: DimensionExpander::new(
                config.required_dimensions.iter().cloned(),
                config.max_subset_size,
            ),
            detector: AnomalyDetector::new(
                stores.kv.clone(),
                stores.series.clone(),
                config.detector_config(),
            ),
            traffic: TrafficCounter::new(
                stores.kv.clone(),
                config.interval_ms,
                config.partition_dimension.clone(),
                config.topn_window_ms(),
                config.topn_granularity_ms,
            ),
            anomaly_counter: AnomalyCounter::new(
                stores.kv.clone(),
                stores.series.clone(),
                config.interval_ms,
                config.partition_dimension.clone(),
                config.topn_window_ms(),
                config.topn_granularity_ms,
            ),
            reported_rebalances: 0,
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn categorizer(&self) -> &NumberCategorizer {
        &self.categorizer
    }

    /// Run a batch through the full flow, strictly in order.
    ///
    /// Any storage error fails the batch. Writes made before the failure are
    /// not rolled back.
    pub async fn process_batch(&mut self, batch: &[Fact]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome {
            facts: batch.len(),
            ..Default::default()
        };

        for fact in batch {
            self.traffic.record(fact).await?;

            let categorized = self.categorizer.categorize(fact);
            for combination in self.expander.expand(&categorized) {
                outcome.combinations += 1;
                match self.detector.detect(&combination).await? {
                    Detection::Normal => {}
                    Detection::Duplicate => outcome.duplicates += 1,
                    Detection::Anomaly(record) => {
                        self.anomaly_counter.record(&record.fact).await?;
                        outcome.anomalies.push(record);
                    }
                }
            }
        }

        let rebalances = self.categorizer.rebalance_count();
        telemetry::record_histogram_rebalances(rebalances - self.reported_rebalances);
        self.reported_rebalances = rebalances;

        Ok(outcome)
    }
}

/// Counters for a pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub facts_processed: u64,
    pub batches: u64,
    pub failed_batches: u64,
    pub anomalies: u64,
    pub duplicates: u64,
}

impl AddAssign for PipelineStats {
    fn add_assign(&mut self, other: Self) {
        self.facts_processed += other.facts_processed;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
        self.anomalies += other.anomalies;
        self.duplicates += other.duplicates;
    }
}

/// Running pipeline handle
pub struct Pipeline {
    senders: Vec<mpsc::Sender<Vec<Fact>>>,
    workers: Vec<JoinHandle<PipelineStats>>,
    shutdown: CancellationToken,
    partition_dimension: String,
}

impl Pipeline {
    /// Spawn one worker task per partition.
    ///
    /// Detected anomalies are sent on the returned receiver. Dropping the
    /// receiver is fine; holding it without reading eventually stalls the
    /// workers once it fills up.
    pub fn start(config: EngineConfig, stores: Stores) -> Result<(Self, mpsc::Receiver<AnomalyRecord>)> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let (anomaly_tx, anomaly_rx) = mpsc::channel(config.anomaly_buffer());
        let mut senders = Vec::with_capacity(config.partitions);
        let mut workers = Vec::with_capacity(config.partitions);

        for partition in 0..config.partitions {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            let worker = PartitionWorker::new(partition, &config, &stores);
            workers.push(tokio::spawn(run_partition(
                worker,
                rx,
                anomaly_tx.clone(),
                shutdown.clone(),
                config.batch_timeout,
            )));
            senders.push(tx);
        }

        info!(
            partitions = config.partitions,
            partition_dimension = %config.partition_dimension,
            interval_ms = config.interval_ms,
            "Pipeline started"
        );

        Ok((
            Self {
                senders,
                workers,
                shutdown,
                partition_dimension: config.partition_dimension,
            },
            anomaly_rx,
        ))
    }

    /// Token that stops the workers once their queued batches are done
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Partition for a fact; facts without the partition dimension go to 0
    pub fn partition_for(&self, fact: &Fact) -> usize {
        partition_for(fact, &self.partition_dimension, self.senders.len())
    }

    /// Split a batch by partition and enqueue each part, waiting for queue
    /// space. Relative order of facts within a partition is kept.
    pub async fn submit(&self, batch: Vec<Fact>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ChannelClosed);
        }

        let mut parts: Vec<Vec<Fact>> = vec![Vec::new(); self.senders.len()];
        for fact in batch {
            let partition = self.partition_for(&fact);
            parts[partition].push(fact);
        }

        for (sender, part) in self.senders.iter().zip(parts) {
            if !part.is_empty() {
                sender.send(part).await?;
            }
        }
        Ok(())
    }

    /// Drain a source into the pipeline until it is exhausted or the
    /// pipeline is cancelled. Returns the number of facts submitted.
    pub async fn run_source<S>(&self, source: &mut S) -> Result<u64>
    where
        S: FactSource + ?Sized,
    {
        let mut submitted = 0u64;
        while !self.shutdown.is_cancelled() {
            let batch = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Pipeline cancelled, stopping source");
                    break;
                }
                batch = source.next_batch() => batch?,
            };
            let Some(batch) = batch else {
                break;
            };
            submitted += batch.len() as u64;
            self.submit(batch).await?;
        }
        Ok(submitted)
    }

    /// Close the input queues, let workers finish what is queued, and
    /// collect the run's statistics.
    pub async fn shutdown(self) -> Result<PipelineStats> {
        drop(self.senders);
        let mut stats = PipelineStats::default();
        for joined in join_all(self.workers).await {
            stats += joined.map_err(|e| Error::Internal(format!("partition worker panicked: {}", e)))?;
        }
        info!(
            facts = stats.facts_processed,
            batches = stats.batches,
            failed_batches = stats.failed_batches,
            anomalies = stats.anomalies,
            "Pipeline stopped"
        );
        Ok(stats)
    }
}

/// crc32 of the partition dimension's value, modulo `partitions`
pub fn partition_for(fact: &Fact, dimension: &str, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    match fact.get(dimension) {
        Some(value) => crc32fast::hash(value.as_bytes()) as usize % partitions,
        None => 0,
    }
}

async fn run_partition(
    mut worker: PartitionWorker,
    mut batches: mpsc::Receiver<Vec<Fact>>,
    anomalies: mpsc::Sender<AnomalyRecord>,
    shutdown: CancellationToken,
    batch_timeout: Duration,
) -> PipelineStats {
    let partition = worker.partition();
    let mut stats = PipelineStats::default();
    let mut anomalies = Some(anomalies);

    loop {
        let batch = tokio::select! {
            biased;
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
            _ = shutdown.cancelled() => {
                info!(partition, "Partition worker shutting down");
                break;
            }
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(batch_timeout, worker.process_batch(&batch)).await {
            Ok(result) => result,
            Err(elapsed) => Err(Error::from(elapsed)),
        };
        let elapsed = started.elapsed().as_secs_f64();
        stats.batches += 1;

        match result {
            Ok(outcome) => {
                telemetry::record_batch("success", elapsed, outcome.facts as u64, partition);
                telemetry::record_anomalies(outcome.anomalies.len() as u64, outcome.duplicates as u64);
                stats.facts_processed += outcome.facts as u64;
                stats.anomalies += outcome.anomalies.len() as u64;
                stats.duplicates += outcome.duplicates as u64;
                debug!(
                    partition,
                    facts = outcome.facts,
                    combinations = outcome.combinations,
                    anomalies = outcome.anomalies.len(),
                    "Batch processed"
                );

                for record in outcome.anomalies {
                    let Some(tx) = anomalies.as_ref() else {
                        break;
                    };
                    if tx.send(record).await.is_err() {
                        warn!(partition, "Anomaly receiver dropped, no longer publishing");
                        anomalies = None;
                    }
                }
            }
            Err(e) => {
                let outcome = if matches!(e, Error::Timeout) { "timeout" } else { "failure" };
                telemetry::record_batch(outcome, elapsed, batch.len() as u64, partition);
                stats.failed_batches += 1;
                error!(partition, facts = batch.len(), error = %e, "Batch failed");
            }
        }
    }

    stats
}
