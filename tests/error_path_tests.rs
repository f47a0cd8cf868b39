//! Failure handling: storage errors, batch timeouts, cancellation and bad
//! configuration.

use async_trait::async_trait;
use bytes::Bytes;
use factlens::config::{EngineConfig, Stores};
use factlens::fact::{Fact, VecFactSource};
use factlens::pipeline::{PartitionWorker, Pipeline};
use factlens::store::{KeyValueStore, MemoryKeyValueStore, MemoryTimeSeriesStore, Row};
use factlens::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Delegates to an in-memory store; fails or stalls increments on demand
#[derive(Default)]
struct FaultyStore {
    inner: MemoryKeyValueStore,
    fail: AtomicBool,
    stall: AtomicBool,
}

#[async_trait]
impl KeyValueStore for FaultyStore {
    async fn increment(&self, key: &[u8], column: &str, delta: i64) -> Result<i64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Storage("injected increment failure".to_string()));
        }
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        self.inner.increment(key, column, delta).await
    }

    async fn get(&self, key: &[u8], column: &str) -> Result<Option<Bytes>> {
        self.inner.get(key, column).await
    }

    async fn put(&self, key: &[u8], column: &str, value: Bytes) -> Result<()> {
        self.inner.put(key, column, value).await
    }

    async fn delete(&self, key: &[u8], column: &str) -> Result<()> {
        self.inner.delete(key, column).await
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: Option<usize>) -> Result<Vec<Row>> {
        self.inner.scan(start, end, limit).await
    }
}

fn stores_with(kv: Arc<FaultyStore>) -> Stores {
    Stores {
        kv,
        series: Arc::new(MemoryTimeSeriesStore::new()),
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        partitions: 1,
        histograms: Vec::new(),
        ..EngineConfig::default()
    }
}

fn facts(n: usize) -> Vec<Fact> {
    (0..n)
        .map(|i| Fact::new(i as i64 * 1_000, vec![("src", "10.0.0.1")]))
        .collect()
}

#[tokio::test]
async fn test_storage_failure_fails_the_batch() {
    let kv = Arc::new(FaultyStore::default());
    kv.fail.store(true, Ordering::SeqCst);
    let mut worker = PartitionWorker::new(0, &config(), &stores_with(kv));

    let err = worker.process_batch(&facts(3)).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
}

#[tokio::test]
async fn test_worker_survives_failed_batches() {
    let kv = Arc::new(FaultyStore::default());
    kv.fail.store(true, Ordering::SeqCst);
    let (pipeline, _rx) = Pipeline::start(config(), stores_with(kv.clone())).unwrap();

    pipeline.submit(facts(2)).await.unwrap();
    // let the first batch fail before storage recovers
    tokio::time::sleep(Duration::from_millis(50)).await;
    kv.fail.store(false, Ordering::SeqCst);
    pipeline.submit(facts(2)).await.unwrap();

    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.batches, 2);
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.facts_processed, 2);
}

#[tokio::test]
async fn test_batch_timeout() {
    let kv = Arc::new(FaultyStore::default());
    kv.stall.store(true, Ordering::SeqCst);
    let config = EngineConfig {
        batch_timeout: Duration::from_millis(50),
        ..config()
    };
    let (pipeline, _rx) = Pipeline::start(config, stores_with(kv)).unwrap();

    pipeline.submit(facts(1)).await.unwrap();
    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.facts_processed, 0);
}

#[tokio::test]
async fn test_cancelled_pipeline_rejects_input() {
    let (pipeline, _rx) = Pipeline::start(config(), Stores::in_memory()).unwrap();
    pipeline.shutdown_token().cancel();

    assert!(matches!(pipeline.submit(facts(1)).await, Err(Error::ChannelClosed)));
    let mut source = VecFactSource::new(facts(10), 5);
    assert_eq!(pipeline.run_source(&mut source).await.unwrap(), 0);

    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(stats.batches, 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = EngineConfig {
        partitions: 0,
        ..EngineConfig::default()
    };
    assert!(matches!(
        Pipeline::start(config, Stores::in_memory()),
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn test_partition_dimension_outside_required_is_rejected() {
    let config = EngineConfig {
        required_dimensions: vec!["dst".to_string()],
        ..config()
    };
    assert!(matches!(
        Pipeline::start(config, Stores::in_memory()),
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn test_corrupt_counter_is_a_decode_error() {
    let kv = Arc::new(FaultyStore::default());
    let stores = stores_with(kv.clone());
    let mut worker = PartitionWorker::new(0, &config(), &stores);
    worker.process_batch(&facts(1)).await.unwrap();

    // overwrite every stored column with garbage
    let rows = kv.scan(&[], &[0xff; 16], None).await.unwrap();
    for row in rows {
        for column in row.columns.keys() {
            kv.put(&row.key, column, Bytes::from_static(b"bad")).await.unwrap();
        }
    }

    let err = worker.process_batch(&facts(1)).await.unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
}
