//! The "console" exporters: OTLP/JSON documents written to stdout.
//!
//! Each export writes one `Export*ServiceRequest` document. The resource in
//! the document is the one the owning provider hands the exporter.

use std::fmt::Debug;
use std::fmt::Display;
use std::io::Stdout;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::transform::common::tonic::ResourceAttributesWithSchema;
use opentelemetry_proto::transform::trace::tonic::group_spans_by_resource_and_scope;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::OTelSdkError;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::metrics::Temporality;
use opentelemetry_sdk::metrics::data::ResourceMetrics;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::trace::SpanData;
use opentelemetry_sdk::trace::SpanExporter;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsoleFormat {
    /// One JSON document per line.
    #[default]
    Compact,
    /// Indented JSON, for reading by eye.
    Pretty,
}

#[derive(Debug)]
struct ConsoleWriter<W> {
    target: Arc<Mutex<W>>,
    format: ConsoleFormat,
}

impl<W: Write> ConsoleWriter<W> {
    fn new(target: W) -> Self {
        Self {
            target: Arc::new(Mutex::new(target)),
            format: ConsoleFormat::default(),
        }
    }

    fn write_document<T: Serialize>(&self, document: &T) -> OTelSdkResult {
        let mut bytes = match self.format {
            ConsoleFormat::Compact => serde_json::to_vec(document),
            ConsoleFormat::Pretty => serde_json::to_vec_pretty(document),
        }
        .map_err(internal)?;
        bytes.push(b'\n');

        let mut target = self.target.lock().map_err(internal)?;
        target.write_all(&bytes).map_err(internal)
    }

    fn flush(&self) -> OTelSdkResult {
        self.target.lock().map_err(internal)?.flush().map_err(internal)
    }
}

/// Span exporter writing OTLP/JSON trace documents.
#[derive(Debug)]
pub struct ConsoleExporter<W: Write + Send + Debug> {
    writer: ConsoleWriter<W>,
    resource: Resource,
}

impl ConsoleExporter<Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send + Debug> ConsoleExporter<W> {
    /// The exporter starts without a resource; the tracer provider sets its
    /// own when the exporter is registered.
    pub fn new(target: W) -> Self {
        Self {
            writer: ConsoleWriter::new(target),
            resource: Resource::builder_empty().build(),
        }
    }

    pub fn with_format(mut self, format: ConsoleFormat) -> Self {
        self.writer.format = format;
        self
    }
}

impl<W: Write + Send + Debug> SpanExporter for ConsoleExporter<W> {
    async fn export(&self, batch: Vec<SpanData>) -> OTelSdkResult {
        if batch.is_empty() {
            return Ok(());
        }
        let resource = ResourceAttributesWithSchema::from(&self.resource);
        let request = ExportTraceServiceRequest {
            resource_spans: group_spans_by_resource_and_scope(batch, &resource),
        };
        self.writer.write_document(&request)
    }

    fn shutdown_with_timeout(&mut self, _timeout: Duration) -> OTelSdkResult {
        self.writer.flush()
    }

    fn force_flush(&mut self) -> OTelSdkResult {
        self.writer.flush()
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.resource = resource.clone();
    }
}

/// Push metric exporter writing OTLP/JSON metric documents; register it
/// through a `PeriodicReader`.
#[derive(Debug)]
pub struct ConsoleMetricExporter<W: Write + Send + Debug> {
    writer: ConsoleWriter<W>,
    temporality: Temporality,
}

impl ConsoleMetricExporter<Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send + Debug> ConsoleMetricExporter<W> {
    pub fn new(target: W) -> Self {
        Self {
            writer: ConsoleWriter::new(target),
            temporality: Temporality::Cumulative,
        }
    }

    pub fn with_format(mut self, format: ConsoleFormat) -> Self {
        self.writer.format = format;
        self
    }

    pub fn with_temporality(mut self, temporality: Temporality) -> Self {
        self.temporality = temporality;
        self
    }
}

impl<W: Write + Send + Debug + 'static> PushMetricExporter for ConsoleMetricExporter<W> {
    async fn export(&self, metrics: &ResourceMetrics) -> OTelSdkResult {
        self.writer
            .write_document(&ExportMetricsServiceRequest::from(metrics))
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.writer.flush()
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        self.writer.flush()
    }

    fn temporality(&self) -> Temporality {
        self.temporality
    }
}

fn internal(err: impl Display) -> OTelSdkError {
    OTelSdkError::InternalFailure(err.to_string())
}
