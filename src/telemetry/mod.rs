//! Logging, traces and metrics for requestq processes.
//!
//! Every process logs through `tracing` to stderr. With an OTLP endpoint
//! configured, spans, metric instruments from [`metrics`] and log events
//! are also exported over gRPC, tagged with the service name and crate
//! version.

pub mod metrics;
pub mod task;

use crate::config::Config;
use crate::error::{Error, Result};
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. "http://localhost:4317". `None` logs to
    /// stderr only.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is not set (e.g. "info", "requestq=debug").
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn from_config(config: &Config, service_name: &str) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: config.log_level.clone(),
        }
    }
}

/// The three OTLP pipelines, built together so they share a resource.
struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Providers {
    fn otlp(endpoint: &str, resource: Resource) -> Result<Self> {
        use opentelemetry_otlp::WithExportConfig as _;

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;

        Ok(Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource.clone())
                .build(),
            logger: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build(),
        })
    }

    fn flush(&self) {
        let _ = self.tracer.force_flush();
        let _ = self.meter.force_flush();
        let _ = self.logger.force_flush();
    }

    fn shutdown(self) {
        let _ = self.logger.shutdown();
        let _ = self.meter.shutdown();
        let _ = self.tracer.shutdown();
    }
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn resource(service_name: String) -> Resource {
    Resource::builder()
        .with_service_name(service_name)
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build()
}

/// Keeps the exporters alive. Dropping it flushes and shuts them down, so
/// hold it for the life of the process.
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

impl TelemetryGuard {
    /// Push out everything buffered so far. No-op without an endpoint.
    pub fn force_flush(&self) {
        if let Some(ref providers) = self.providers {
            providers.flush();
        }
    }

    pub fn is_exporting(&self) -> bool {
        self.providers.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(providers) = self.providers.take() {
            providers.shutdown();
        }
    }
}

/// Install the global subscriber, and the OTLP pipelines when an endpoint
/// is configured.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    let Some(endpoint) = config.endpoint else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;
        return Ok(TelemetryGuard { providers: None });
    };

    let providers = Providers::otlp(&endpoint, resource(config.service_name))?;
    opentelemetry::global::set_meter_provider(providers.meter.clone());

    registry
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_opentelemetry::layer().with_tracer(providers.tracer.tracer("requestq")))
        .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
            &providers.logger,
        ))
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard {
        providers: Some(providers),
    })
}
