//! Logging and OpenTelemetry bootstrap for the factlens binary.

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

const ATTR_SERVICE_NAME: &str = "service.name";
const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";
const ATTR_FACTLENS_RUN_ID: &str = "factlens.run_id";

/// Whether SDK meter and tracer providers are installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    /// Instruments record into the no-op global providers
    Disabled,
    /// In-process SDK providers with the configured resource and sampler
    Sdk,
}

impl TelemetryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryMode::Disabled => "disabled",
            TelemetryMode::Sdk => "sdk",
        }
    }
}

/// Log line rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Telemetry settings read from the environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
    pub log_format: LogFormat,
    pub service_name: String,
    pub run_id: Option<String>,
    pub resource_attributes: Vec<KeyValue>,
    sampler: Sampler,
}

impl TelemetryConfig {
    /// Variables:
    /// - FACTLENS_TELEMETRY_ENABLED: install SDK providers (default true)
    /// - FACTLENS_TELEMETRY_RUN_ID: attached as `factlens.run_id`
    /// - FACTLENS_LOG_FORMAT: "json" (default) or "text"
    /// - OTEL_SERVICE_NAME, OTEL_RESOURCE_ATTRIBUTES
    /// - OTEL_TRACES_SAMPLER, OTEL_TRACES_SAMPLER_ARG
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        Self::from_lookup(default_service_name, |name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(default_service_name: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name = lookup("OTEL_SERVICE_NAME")
            .unwrap_or_else(|| default_service_name.to_string())
            .trim()
            .to_string();
        if service_name.is_empty() {
            return Err(Error::Config("OTEL_SERVICE_NAME cannot be empty".to_string()));
        }

        let mode = match parse_optional_bool("FACTLENS_TELEMETRY_ENABLED", lookup("FACTLENS_TELEMETRY_ENABLED"))? {
            Some(false) => TelemetryMode::Disabled,
            Some(true) | None => TelemetryMode::Sdk,
        };

        let log_format = match lookup("FACTLENS_LOG_FORMAT") {
            Some(raw) => parse_log_format(&raw)?,
            None => LogFormat::Json,
        };

        let run_id = lookup("FACTLENS_TELEMETRY_RUN_ID")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let sampler_name =
            lookup("OTEL_TRACES_SAMPLER").unwrap_or_else(|| "parentbased_always_on".to_string());
        let sampler_arg = lookup("OTEL_TRACES_SAMPLER_ARG");
        let sampler = parse_sampler(&sampler_name, sampler_arg.as_deref())?;

        let mut attr_map: BTreeMap<String, String> = BTreeMap::new();
        if let Some(raw) = lookup("OTEL_RESOURCE_ATTRIBUTES") {
            attr_map.extend(parse_resource_attributes(&raw)?);
        }
        attr_map.insert(ATTR_SERVICE_NAME.to_string(), service_name.clone());
        attr_map
            .entry(ATTR_SERVICE_NAMESPACE.to_string())
            .or_insert_with(|| "factlens".to_string());
        if let Some(run_id) = &run_id {
            attr_map.insert(ATTR_FACTLENS_RUN_ID.to_string(), run_id.clone());
        }

        Ok(Self {
            mode,
            log_format,
            service_name,
            run_id,
            resource_attributes: attr_map
                .into_iter()
                .map(|(k, v)| KeyValue::new(k, v))
                .collect(),
            sampler,
        })
    }
}

/// Keeps the SDK providers alive; flushes and shuts them down on drop.
pub struct Telemetry {
    config: TelemetryConfig,
    providers: Option<(TracerProvider, SdkMeterProvider)>,
}

impl Telemetry {
    /// Install the log subscriber and, unless disabled, the OTel providers.
    ///
    /// `RUST_LOG` takes precedence over `log_level` when set.
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let filter = match std::env::var("RUST_LOG") {
            Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives.trim()),
            _ => EnvFilter::try_new(parse_log_level(log_level)?),
        }
        .map_err(|e| Error::Config(format!("invalid log filter: {e}")))?;

        let builder = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr);
        let installed = match config.log_format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Text => builder.try_init(),
        };
        installed.map_err(|e| Error::Config(format!("failed to initialize log subscriber: {e}")))?;

        let providers = match config.mode {
            TelemetryMode::Disabled => None,
            TelemetryMode::Sdk => {
                let resource =
                    Resource::default().merge(&Resource::new(config.resource_attributes.clone()));
                let tracer_provider = TracerProvider::builder()
                    .with_config(
                        trace::Config::default()
                            .with_sampler(config.sampler.clone())
                            .with_resource(resource.clone()),
                    )
                    .build();
                let _ = global::set_tracer_provider(tracer_provider.clone());

                let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
                global::set_meter_provider(meter_provider.clone());
                global::set_text_map_propagator(TraceContextPropagator::new());
                Some((tracer_provider, meter_provider))
            }
        };

        info!(
            service_name = %config.service_name,
            telemetry_mode = config.mode.as_str(),
            run_id = %config.run_id.as_deref().unwrap_or("none"),
            "Telemetry initialized"
        );

        Ok(Self { config, providers })
    }

    pub fn run_id(&self) -> Option<&str> {
        self.config.run_id.as_deref()
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn mode(&self) -> TelemetryMode {
        self.config.mode
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some((tracer_provider, meter_provider)) = self.providers.take() {
            let _ = meter_provider.shutdown();
            let _ = tracer_provider.shutdown();
        }
    }
}

fn parse_log_level(raw: &str) -> Result<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "text" | "pretty" => Ok(LogFormat::Text),
        other => Err(Error::Config(format!(
            "FACTLENS_LOG_FORMAT must be 'json' or 'text', got '{other}'"
        ))),
    }
}

fn parse_optional_bool(name: &str, raw: Option<String>) -> Result<Option<bool>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}

fn parse_sampler(name: &str, arg: Option<&str>) -> Result<Sampler> {
    match name.trim().to_ascii_lowercase().as_str() {
        "always_on" => Ok(Sampler::AlwaysOn),
        "always_off" => Ok(Sampler::AlwaysOff),
        "traceidratio" => Ok(Sampler::TraceIdRatioBased(parse_ratio(arg)?)),
        "parentbased_always_on" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOn))),
        "parentbased_always_off" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOff))),
        "parentbased_traceidratio" => Ok(Sampler::ParentBased(Box::new(
            Sampler::TraceIdRatioBased(parse_ratio(arg)?),
        ))),
        other => Err(Error::Config(format!(
            "OTEL_TRACES_SAMPLER '{other}' is not supported"
        ))),
    }
}

fn parse_ratio(arg: Option<&str>) -> Result<f64> {
    let raw = arg.ok_or_else(|| {
        Error::Config("OTEL_TRACES_SAMPLER_ARG is required for ratio samplers".to_string())
    })?;
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|e| Error::Config(format!("OTEL_TRACES_SAMPLER_ARG must be a float: {e}")))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::Config(format!(
            "OTEL_TRACES_SAMPLER_ARG must be in [0,1], got {value}"
        )));
    }
    Ok(value)
}

fn parse_resource_attributes(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::Config(format!(
                    "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' is invalid, expected key=value"
                ))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Config(
                    "OTEL_RESOURCE_ATTRIBUTES contains an empty attribute key".to_string(),
                ));
            }
            Ok((key.to_string(), value.trim().to_string()))
        })
        .collect()
}
