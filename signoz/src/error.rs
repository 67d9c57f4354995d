use std::path::PathBuf;

use strum_macros::Display;
use thiserror::Error;

/// Telemetry signal an exporter was being built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Signal {
    Traces,
    Metrics,
    Logs,
}

impl Signal {
    /// Path appended to the base endpoint for OTLP/HTTP exports.
    pub fn http_path(self) -> &'static str {
        match self {
            Signal::Traces => "/v1/traces",
            Signal::Metrics => "/v1/metrics",
            Signal::Logs => "/v1/logs",
        }
    }
}

#[derive(Debug, Error)]
pub enum SignozError {
    #[error("failed to read settings from {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid signoz settings: {0}")]
    Config(#[from] toml::de::Error),

    #[error("failed to build OTLP {signal} exporter: {source}")]
    Exporter {
        signal: Signal,
        #[source]
        source: opentelemetry_otlp::ExporterBuildError,
    },

    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
