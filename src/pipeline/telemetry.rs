//! Pipeline telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct PipelineInstruments {
    facts_processed: Counter<u64>,
    batches: Counter<u64>,
    batch_duration_seconds: Histogram<f64>,
    batch_size: Histogram<u64>,
    anomalies_emitted: Counter<u64>,
    duplicates_suppressed: Counter<u64>,
    histogram_rebalances: Counter<u64>,
}

fn instruments() -> &'static PipelineInstruments {
    static INSTRUMENTS: OnceLock<PipelineInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("factlens.pipeline");
        PipelineInstruments {
            facts_processed: meter
                .u64_counter("factlens.pipeline.facts.processed")
                .with_description("Raw facts processed by partition workers")
                .init(),
            batches: meter
                .u64_counter("factlens.pipeline.batches")
                .with_description("Batches processed by outcome")
                .init(),
            batch_duration_seconds: meter
                .f64_histogram("factlens.pipeline.batch.duration")
                .with_description("Time to process one batch")
                .with_unit("s")
                .init(),
            batch_size: meter
                .u64_histogram("factlens.pipeline.batch.size")
                .with_description("Facts per batch")
                .init(),
            anomalies_emitted: meter
                .u64_counter("factlens.pipeline.anomalies.emitted")
                .with_description("Anomalies detected and persisted")
                .init(),
            duplicates_suppressed: meter
                .u64_counter("factlens.pipeline.anomalies.duplicates")
                .with_description("Anomalies suppressed as repeats within an interval")
                .init(),
            histogram_rebalances: meter
                .u64_counter("factlens.pipeline.histogram.rebalances")
                .with_description("Dynamic histogram rebalances")
                .init(),
        }
    })
}

pub fn record_batch(outcome: &'static str, duration_seconds: f64, facts: u64, partition: usize) {
    let i = instruments();
    let attrs = [
        KeyValue::new("outcome", outcome),
        KeyValue::new("partition", partition as i64),
    ];
    i.batches.add(1, &attrs);
    i.batch_duration_seconds.record(duration_seconds, &attrs);
    i.batch_size.record(facts, &[]);
    if outcome == "success" {
        i.facts_processed.add(facts, &[]);
    }
}

pub fn record_anomalies(emitted: u64, duplicates: u64) {
    let i = instruments();
    if emitted > 0 {
        i.anomalies_emitted.add(emitted, &[]);
    }
    if duplicates > 0 {
        i.duplicates_suppressed.add(duplicates, &[]);
    }
}

pub fn record_histogram_rebalances(count: u64) {
    if count > 0 {
        instruments().histogram_rebalances.add(count, &[]);
    }
}
