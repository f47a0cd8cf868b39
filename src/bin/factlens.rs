//! factlens command-line runner
//!
//! Reads newline-delimited facts from a file or stdin, runs them through the
//! pipeline, prints each anomaly as a JSON line on stdout and finishes with a
//! one-line JSON summary. Logs go to stderr.

use factlens::config::ComponentFactory;
use factlens::fact::{round_down, Fact, FactSource, LineFactSource, LineFormat};
use factlens::pipeline::Pipeline;
use factlens::query::QueryService;
use factlens::telemetry::Telemetry;
use factlens::Result;

use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

/// factlens: anomalies, categories and top-N over a stream of facts
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input file; reads stdin when omitted or "-"
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Line format: json or wireshark
    #[arg(long, env = "FACTLENS_FORMAT", default_value = "json")]
    format: LineFormat,

    /// JSON member holding the fact timestamp in milliseconds
    #[arg(long, env = "FACTLENS_TIMESTAMP_FIELD")]
    timestamp_field: Option<String>,

    /// Override the number of partitions
    #[arg(long)]
    partitions: Option<usize>,

    /// Override the anomaly mean threshold
    #[arg(long)]
    mean_threshold: Option<f64>,

    /// Override the anomaly sensitivity
    #[arg(long)]
    sensitivity: Option<f64>,

    /// Entries shown in the summary rankings
    #[arg(long, default_value = "10")]
    top: usize,

    /// Log level
    #[arg(long, env = "FACTLENS_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Remembers the timestamp range of everything it hands out
struct TrackingSource<S> {
    inner: S,
    min_ts: Option<i64>,
    max_ts: Option<i64>,
}

#[async_trait]
impl<S: FactSource> FactSource for TrackingSource<S> {
    async fn next_batch(&mut self) -> Result<Option<Vec<Fact>>> {
        let batch = self.inner.next_batch().await?;
        if let Some(facts) = &batch {
            for fact in facts {
                self.min_ts = Some(self.min_ts.map_or(fact.timestamp, |m| m.min(fact.timestamp)));
                self.max_ts = Some(self.max_ts.map_or(fact.timestamp, |m| m.max(fact.timestamp)));
            }
        }
        Ok(batch)
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _telemetry = Telemetry::init_for_component("factlens", &args.log_level)?;

    let mut config = ComponentFactory::engine_config_from_env()?;
    if let Some(partitions) = args.partitions {
        config.partitions = partitions;
    }
    if let Some(threshold) = args.mean_threshold {
        config.mean_threshold = threshold;
    }
    if let Some(sensitivity) = args.sensitivity {
        config.sensitivity = sensitivity;
    }
    config.validate()?;

    let stores = ComponentFactory::create_stores()?;
    let (pipeline, mut anomalies) = Pipeline::start(config.clone(), stores.clone())?;

    let shutdown = pipeline.shutdown_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            shutdown.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut printed = 0u64;
        while let Some(record) = anomalies.recv().await {
            match serde_json::to_string(&record) {
                Ok(line) => {
                    if stdout.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                        break;
                    }
                    printed += 1;
                }
                Err(e) => warn!(error = %e, "Failed to serialize anomaly"),
            }
        }
        let _ = stdout.flush().await;
        printed
    });

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) if path.as_os_str() != "-" => {
            info!(path = %path.display(), format = args.format.as_str(), "Reading facts from file");
            Box::new(BufReader::new(tokio::fs::File::open(path).await?))
        }
        _ => {
            info!(format = args.format.as_str(), "Reading facts from stdin");
            Box::new(BufReader::new(tokio::io::stdin()))
        }
    };
    let mut lines = LineFactSource::new(reader, args.format, config.batch_size);
    if let Some(field) = &args.timestamp_field {
        lines = lines.with_timestamp_field(field.clone());
    }
    let mut source = TrackingSource {
        inner: lines,
        min_ts: None,
        max_ts: None,
    };

    let submitted = pipeline.run_source(&mut source).await?;
    let stats = pipeline.shutdown().await?;
    let printed = printer.await.unwrap_or(0);

    let query = QueryService::new(
        stores.kv.clone(),
        stores.series.clone(),
        config.interval_ms,
        config.topn_granularity_ms,
    );
    let (top_sources, top_anomalous, anomaly_total) = match (source.min_ts, source.max_ts) {
        (Some(min_ts), Some(max_ts)) => {
            let granularity = config.topn_granularity_ms;
            let window_start = round_down(min_ts, granularity)
                .max(round_down(max_ts, granularity) - config.topn_window_ms() + granularity);
            let end = round_down(max_ts, config.interval_ms) + config.interval_ms;
            (
                query.top_traffic_sources(window_start, args.top).await?,
                query.top_anomalous_sources(window_start, args.top).await?,
                query
                    .anomaly_counts(min_ts, end, None)
                    .await?
                    .iter()
                    .map(|p| p.count)
                    .sum::<i64>(),
            )
        }
        _ => (Vec::new(), Vec::new(), 0),
    };

    let summary = json!({
        "summary": {
            "facts_submitted": submitted,
            "facts_processed": stats.facts_processed,
            "lines_dropped": source.inner.dropped(),
            "batches": stats.batches,
            "failed_batches": stats.failed_batches,
            "anomalies": stats.anomalies,
            "anomalies_printed": printed,
            "duplicates_suppressed": stats.duplicates,
            "distinct_anomalies": anomaly_total,
            "first_timestamp": source.min_ts,
            "last_timestamp": source.max_ts,
            "top_sources": top_sources,
            "top_anomalous_sources": top_anomalous,
        }
    });
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{}\n", summary).as_bytes()).await?;
    stdout.flush().await?;

    info!("factlens finished");
    Ok(())
}
