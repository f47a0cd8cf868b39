//! Query service over stores populated the way the pipeline populates them

use bytes::Bytes;
use factlens::anomaly::ANOMALY_SERIES;
use factlens::config::Stores;
use factlens::counter::TimeWindowCounter;
use factlens::fact::{Dimensions, Fact};
use factlens::query::{QueryService, GROUPED_PLACEHOLDER};
use factlens::store::TimeSeriesEntry;

const INTERVAL: i64 = 5_000;

fn service(stores: &Stores) -> QueryService {
    QueryService::new(stores.kv.clone(), stores.series.clone(), INTERVAL, INTERVAL)
}

async fn log_anomaly(stores: &Stores, fact: &Fact) {
    let entry = TimeSeriesEntry::new(
        ANOMALY_SERIES,
        Bytes::copy_from_slice(fact.key().as_bytes()),
        fact.timestamp,
    )
    .with_tag(serde_json::to_string(fact).unwrap());
    stores.series.write(entry).await.unwrap();
}

#[tokio::test]
async fn test_anomalies_most_recent_first() {
    let stores = Stores::in_memory();
    for i in 0..5 {
        let fact = Fact::new(i * INTERVAL, vec![("src", format!("10.0.0.{}", i))]);
        log_anomaly(&stores, &fact).await;
    }

    let records = service(&stores)
        .query_anomalies(0, 5 * INTERVAL, None, None)
        .await
        .unwrap();
    let timestamps: Vec<i64> = records.iter().map(|r| r.fact.timestamp).collect();
    assert_eq!(timestamps, vec![20_000, 15_000, 10_000, 5_000, 0]);
    assert_eq!(records[0].data_series_key, records[0].fact.key().to_string());
}

#[tokio::test]
async fn test_anomaly_range_end_is_exclusive() {
    let stores = Stores::in_memory();
    log_anomaly(&stores, &Fact::new(0, vec![("src", "a")])).await;
    log_anomaly(&stores, &Fact::new(INTERVAL, vec![("src", "b")])).await;

    let records = service(&stores)
        .query_anomalies(0, INTERVAL, None, None)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fact.get("src"), Some("a"));
}

#[tokio::test]
async fn test_grouped_anomalies() {
    let stores = Stores::in_memory();
    let ts = 3 * INTERVAL;
    log_anomaly(&stores, &Fact::new(ts, vec![("src", "a"), ("dst", "x"), ("app", "TCP")])).await;
    log_anomaly(&stores, &Fact::new(ts, vec![("src", "a"), ("dst", "y"), ("app", "TCP")])).await;
    log_anomaly(&stores, &Fact::new(ts, vec![("dst", "x")])).await;

    let records = service(&stores)
        .query_anomalies(0, 10 * INTERVAL, Some("src"), None)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let fact = &records[0].fact;
    assert_eq!(fact.get("src"), Some("a"));
    assert_eq!(fact.get("app"), Some("TCP"));
    assert_eq!(fact.get("dst"), Some(GROUPED_PLACEHOLDER));
}

#[tokio::test]
async fn test_filter_requires_every_dimension() {
    let stores = Stores::in_memory();
    log_anomaly(&stores, &Fact::new(0, vec![("src", "a"), ("app", "TCP")])).await;
    log_anomaly(&stores, &Fact::new(0, vec![("src", "a"), ("app", "UDP")])).await;
    log_anomaly(&stores, &Fact::new(0, vec![("src", "b"), ("app", "TCP")])).await;

    let mut filter = Dimensions::new();
    filter.insert("src".to_string(), "a".to_string());
    filter.insert("app".to_string(), "TCP".to_string());

    let records = service(&stores)
        .query_anomalies(0, INTERVAL, None, Some(&filter))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fact.get("src"), Some("a"));
    assert_eq!(records[0].fact.get("app"), Some("TCP"));
}

#[tokio::test]
async fn test_time_range_is_zero_filled() {
    let stores = Stores::in_memory();
    let counter = TimeWindowCounter::new(stores.kv.clone(), INTERVAL);
    counter.add(b"series", 2 * INTERVAL + 10, 4).await.unwrap();
    counter.increment(b"series", 5 * INTERVAL).await.unwrap();

    let points = service(&stores)
        .query_time_range(b"series", 1_000, 6 * INTERVAL)
        .await
        .unwrap();
    let counts: Vec<i64> = points.iter().map(|p| p.count).collect();
    assert_eq!(counts, vec![0, 0, 4, 0, 0, 1]);
    assert_eq!(points[0].timestamp, 0);
    assert_eq!(points[5].timestamp, 5 * INTERVAL);
}

#[tokio::test]
async fn test_escaped_key_reads_the_same_series() {
    let stores = Stores::in_memory();
    let fact = Fact::new(0, vec![("src", "10.0.0.1"), ("app", "TCP")]);
    let counter = TimeWindowCounter::new(stores.kv.clone(), INTERVAL);
    counter.add(fact.key().as_bytes(), 0, 3).await.unwrap();

    let points = service(&stores)
        .query_time_range_escaped(&fact.key().to_string(), 0, INTERVAL)
        .await
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].count, 3);
}

#[tokio::test]
async fn test_empty_stores_give_zeroes_and_empty_rankings() {
    let stores = Stores::in_memory();
    let service = service(&stores);

    let traffic = service.traffic_counts(0, 3 * INTERVAL).await.unwrap();
    assert_eq!(traffic.len(), 3);
    assert!(traffic.iter().all(|p| p.count == 0));
    assert!(service.top_traffic_sources(0, 10).await.unwrap().is_empty());
    assert!(service
        .query_anomalies(0, INTERVAL, Some("src"), None)
        .await
        .unwrap()
        .is_empty());
}
