//! Detection throughput benchmark: expand plus detect per fact

use factlens::anomaly::{AnomalyDetector, DetectorConfig};
use factlens::config::{EngineConfig, Stores};
use factlens::expander::DimensionExpander;
use factlens::fact::Fact;
use factlens::pipeline::PartitionWorker;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};

fn create_facts(n: usize) -> Vec<Fact> {
    (0..n)
        .map(|i| {
            Fact::new(
                (i as i64) * 10,
                vec![
                    ("src", format!("10.0.{}.{}", i % 4, i % 25)),
                    ("dst", format!("10.1.0.{}", i % 7)),
                    ("app", if i % 3 == 0 { "UDP".to_string() } else { "TCP".to_string() }),
                    ("dpt", format!("{}", 1_000 + i % 11)),
                ],
            )
        })
        .collect()
}

fn benchmark_detect(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("detect");
    let facts = create_facts(1_000);
    let expander = DimensionExpander::new(Vec::<String>::new(), 4);
    let combinations: Vec<Fact> = facts.iter().flat_map(|f| expander.expand(f)).collect();
    group.throughput(Throughput::Elements(combinations.len() as u64));

    group.bench_function("1000_facts_all_subsets", |b| {
        b.to_async(&rt).iter_batched(
            || {
                let stores = Stores::in_memory();
                AnomalyDetector::new(stores.kv, stores.series, DetectorConfig::default())
            },
            |mut detector| {
                let combinations = &combinations;
                async move {
                    for combination in combinations {
                        black_box(detector.detect(combination).await.unwrap());
                    }
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn benchmark_process_batch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("process_batch");

    for batch_size in [100, 1_000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        let facts = create_facts(batch_size);
        let config = EngineConfig {
            histograms: Vec::new(),
            ..EngineConfig::default()
        };

        group.bench_function(format!("{}_facts", batch_size), |b| {
            b.to_async(&rt).iter_batched(
                || PartitionWorker::new(0, &config, &Stores::in_memory()),
                |mut worker| {
                    let facts = &facts;
                    async move {
                        black_box(worker.process_batch(facts).await.unwrap());
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_detect, benchmark_process_batch);

criterion_main!(benches);
