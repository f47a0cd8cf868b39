//! End-to-end tests: facts in through the pipeline, signals out through the
//! query service.

use factlens::anomaly::AnomalyRecord;
use factlens::config::{EngineConfig, Stores};
use factlens::fact::{Fact, LineFactSource, LineFormat, VecFactSource};
use factlens::pipeline::Pipeline;
use factlens::query::QueryService;
use std::io::Write;
use tokio::io::BufReader;
use tokio::sync::mpsc;

const INTERVAL: i64 = 5_000;

/// Defaults with a lower mean threshold and no histograms
fn test_config() -> EngineConfig {
    EngineConfig {
        mean_threshold: 1.0,
        partitions: 2,
        batch_size: 16,
        histograms: Vec::new(),
        ..EngineConfig::default()
    }
}

async fn drain(mut rx: mpsc::Receiver<AnomalyRecord>) -> Vec<AnomalyRecord> {
    let mut records = Vec::new();
    while let Some(record) = rx.recv().await {
        records.push(record);
    }
    records
}

fn query(stores: &Stores, config: &EngineConfig) -> QueryService {
    QueryService::new(
        stores.kv.clone(),
        stores.series.clone(),
        config.interval_ms,
        config.topn_granularity_ms,
    )
}

/// Ten quiet intervals, then a burst of 12 in the eleventh, plus one more
/// identical fact: exactly one anomaly.
#[tokio::test]
async fn test_burst_after_quiet_history_flags_once() {
    let config = test_config();
    let stores = Stores::in_memory();
    let (pipeline, rx) = Pipeline::start(config.clone(), stores.clone()).unwrap();

    let burst_ts = 10 * INTERVAL + 1_234;
    let burst: Vec<Fact> = (0..13)
        .map(|_| Fact::new(burst_ts, vec![("src", "10.0.0.1")]))
        .collect();
    pipeline.submit(burst).await.unwrap();

    let stats = pipeline.shutdown().await.unwrap();
    let anomalies = drain(rx).await;

    assert_eq!(stats.facts_processed, 13);
    assert_eq!(stats.failed_batches, 0);
    assert_eq!(anomalies.len(), 1, "burst must be reported exactly once");
    assert_eq!(stats.duplicates, 1);

    let record = &anomalies[0];
    assert_eq!(record.fact.timestamp, 10 * INTERVAL);
    assert_eq!(record.fact.get("src"), Some("10.0.0.1"));

    // the anomaly's series key leads back to its counter
    let service = query(&stores, &config);
    let series = service
        .query_time_range_escaped(&record.data_series_key, 0, 11 * INTERVAL)
        .await
        .unwrap();
    assert_eq!(series.len(), 11);
    assert!(series[..10].iter().all(|p| p.count == 0));
    assert_eq!(series[10].count, 13);
}

#[tokio::test]
async fn test_steady_traffic_is_not_anomalous() {
    let config = test_config();
    let stores = Stores::in_memory();
    let (pipeline, rx) = Pipeline::start(config, stores).unwrap();

    let facts: Vec<Fact> = (0..30)
        .flat_map(|i| {
            (0..3).map(move |_| Fact::new(i * INTERVAL, vec![("src", "10.0.0.2"), ("app", "TCP")]))
        })
        .collect();
    let mut source = VecFactSource::new(facts, 7);
    let submitted = pipeline.run_source(&mut source).await.unwrap();

    let stats = pipeline.shutdown().await.unwrap();
    assert_eq!(submitted, 90);
    assert_eq!(stats.facts_processed, 90);
    assert!(drain(rx).await.is_empty());
}

#[tokio::test]
async fn test_anomaly_counters_and_rankings() {
    let config = test_config();
    let stores = Stores::in_memory();
    let (pipeline, rx) = Pipeline::start(config.clone(), stores.clone()).unwrap();

    let ts = 20 * INTERVAL;
    let mut facts = Vec::new();
    for _ in 0..12 {
        facts.push(Fact::new(ts, vec![("src", "10.0.0.1")]));
    }
    for _ in 0..3 {
        facts.push(Fact::new(ts, vec![("src", "10.0.0.9")]));
    }
    pipeline.submit(facts).await.unwrap();
    pipeline.shutdown().await.unwrap();
    let anomalies = drain(rx).await;
    assert_eq!(anomalies.len(), 1);

    let service = query(&stores, &config);

    let traffic = service.traffic_counts(ts, ts + INTERVAL).await.unwrap();
    assert_eq!(traffic[0].count, 15);

    let top = service
        .top_traffic_sources(ts - config.topn_granularity_ms, 5)
        .await
        .unwrap();
    assert_eq!(top[0].value, "10.0.0.1");
    assert_eq!(top[0].count, 12);
    assert_eq!(top[1].count, 3);

    let totals = service.anomaly_counts(ts, ts + INTERVAL, None).await.unwrap();
    assert_eq!(totals[0].count, 1);
    let per_source = service
        .anomaly_counts(ts, ts + INTERVAL, Some("10.0.0.9"))
        .await
        .unwrap();
    assert_eq!(per_source[0].count, 0);

    let unique = service.unique_anomalous_sources(ts, ts + INTERVAL).await.unwrap();
    assert_eq!(unique[0].count, 1);

    let anomalous = service.top_anomalous_sources(ts, 5).await.unwrap();
    assert_eq!(anomalous.len(), 1);
    assert_eq!(anomalous[0].value, "10.0.0.1");
}

#[tokio::test]
async fn test_wireshark_lines_through_pipeline() {
    let input = "ip.src:10.1.1.1,ip.dst:10.1.1.2,tcp.srcport:443,tcp.dstport:5555,frame.cap_len:60\n\
                 not a fact\n\
                 ip.src:10.1.1.3,ip.dst:10.1.1.2,udp.srcport:53,udp.dstport:5353\n";
    let config = test_config();
    let stores = Stores::in_memory();
    let (pipeline, _rx) = Pipeline::start(config.clone(), stores.clone()).unwrap();

    let mut source = LineFactSource::new(input.as_bytes(), LineFormat::Wireshark, 10);
    let submitted = pipeline.run_source(&mut source).await.unwrap();
    let stats = pipeline.shutdown().await.unwrap();

    assert_eq!(submitted, 2);
    assert_eq!(source.dropped(), 1);
    assert_eq!(stats.facts_processed, 2);
}

#[tokio::test]
async fn test_json_file_with_timestamp_field() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 0..12 {
        writeln!(file, r#"{{"ts":{},"src":"10.2.0.1","app":"DNS"}}"#, 10 * INTERVAL + i).unwrap();
    }
    writeln!(file, "[1, 2, 3]").unwrap();
    file.flush().unwrap();

    let config = test_config();
    let stores = Stores::in_memory();
    let (pipeline, rx) = Pipeline::start(config.clone(), stores.clone()).unwrap();

    let reader = BufReader::new(tokio::fs::File::open(file.path()).await.unwrap());
    let mut source = LineFactSource::new(reader, LineFormat::Json, 5).with_timestamp_field("ts");
    let submitted = pipeline.run_source(&mut source).await.unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(submitted, 12);
    assert_eq!(source.dropped(), 1);
    let anomalies = drain(rx).await;
    assert!(!anomalies.is_empty());
    assert!(anomalies.iter().all(|a| a.fact.timestamp == 10 * INTERVAL));

    let traffic = query(&stores, &config)
        .traffic_counts(10 * INTERVAL, 11 * INTERVAL)
        .await
        .unwrap();
    assert_eq!(traffic[0].count, 12);
}
