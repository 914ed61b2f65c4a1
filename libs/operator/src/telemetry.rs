//! Logging and tracing for the controller binary.
//!
//! Log output and the optional OTLP export are configured entirely from the
//! CLI via [`Settings`]. Reconcile spans record the trace ID from
//! [`get_trace_id`] so log lines and duration exemplars can be joined to a
//! trace.

use std::time::Duration;

use opentelemetry::trace::{TraceError, TraceId, TracerProvider};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tracing::dispatcher::SetGlobalDefaultError;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

const SERVICE_NAME: &str = "eno-controller";
const OTLP_EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to install the OTLP export pipeline: {0}")]
    Otlp(#[source] TraceError),

    #[error("failed to set the global subscriber: {0}")]
    Subscriber(#[source] SetGlobalDefaultError),
}

/// Log output format, selectable with `--log-format`.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum LogFormat {
    Json,
    Text,
}

/// Telemetry knobs collected from the controller CLI.
#[derive(Clone, Debug)]
pub struct Settings {
    /// `--log-filter`: an `EnvFilter` directive string.
    pub filter: String,
    /// `--log-format`
    pub format: LogFormat,
    /// `--tracing-url`: tracing is disabled when unset.
    pub otlp_endpoint: Option<String>,
    /// `--sample-ratio`
    pub sample_ratio: f64,
    /// `--debug`
    pub debug: bool,
}

impl Settings {
    /// `--debug` wins over `--log-filter`. The kube client and the HTTP
    /// stack stay at info even then; debug output from those drowns the
    /// reconciler logs the flag is meant to surface.
    fn directives(&self) -> String {
        if self.debug {
            "debug,kube=info,hyper=info,tower=info".to_string()
        } else {
            self.filter.clone()
        }
    }
}

/// Trace ID of the current span, traversing from [`tracing::Span`] through
/// the OpenTelemetry context.
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

/// Install the global subscriber: fmt logs per the configured format, plus
/// an OTLP export layer when an endpoint is set. Must run inside the tokio
/// runtime since the batch exporter spawns onto it.
pub fn init(settings: &Settings) -> Result<(), Error> {
    let logger = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().compact().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().compact().boxed(),
    };
    let filter = EnvFilter::new(settings.directives());
    let collector = Registry::default().with(logger).with(filter);

    let Some(endpoint) = &settings.otlp_endpoint else {
        return tracing::subscriber::set_global_default(collector).map_err(Error::Subscriber);
    };

    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_timeout(OTLP_EXPORT_TIMEOUT),
        )
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(settings.sample_ratio))
                .with_id_generator(RandomIdGenerator::default())
                .with_max_events_per_span(64)
                .with_max_attributes_per_span(16)
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(Error::Otlp)?;
    let tracer = provider
        .tracer_builder("opentelemetry-otlp")
        .with_version(env!("CARGO_PKG_VERSION"))
        .build();

    let telemetry = OpenTelemetryLayer::new(tracer);
    tracing::subscriber::set_global_default(collector.with(telemetry)).map_err(Error::Subscriber)
}
