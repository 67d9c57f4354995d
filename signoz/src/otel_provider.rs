use std::collections::HashMap;
use std::time::Duration;

use gethostname::gethostname;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::MeterProvider;
use opentelemetry::trace::TracerProvider;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::LogExporter;
use opentelemetry_otlp::MetricExporter;
use opentelemetry_otlp::Protocol;
use opentelemetry_otlp::SpanExporter;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_otlp::WithHttpConfig;
use opentelemetry_otlp::WithTonicConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::PeriodicReader;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::Sampler;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::trace::Tracer;
use opentelemetry_semantic_conventions as semconv;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use tonic::metadata::MetadataMap;
use tracing::debug;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::AppInfo;
use crate::config::OtlpProtocol;
use crate::config::SignozSettings;
use crate::console_exporter::ConsoleExporter;
use crate::console_exporter::ConsoleMetricExporter;
use crate::error::Signal;
use crate::error::SignozError;
use crate::process_metrics::ProcessMetrics;
use crate::telemetry_scope::ScopeFactory;

const SERVICE_INSTANCE_ID: &str = "service.instance.id";

/// Targets whose events must not be bridged into OTLP logs; exporting them
/// would feed the exporter its own diagnostics.
const EXPORTER_TARGETS: [&str; 5] = ["opentelemetry", "tonic", "h2", "hyper", "reqwest"];

/// Builds the OTLP exporter for one signal, honouring the configured protocol.
macro_rules! otlp_exporter {
    ($exporter:ident, $signal:expr, $settings:expr, $endpoint:expr) => {{
        let signal: Signal = $signal;
        let settings: &SignozSettings = $settings;
        let endpoint: &str = $endpoint;
        match settings.otlp_protocol {
            OtlpProtocol::Grpc => {
                debug!("Using OTLP gRPC {signal} exporter: {endpoint}");
                $exporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .with_metadata(grpc_metadata(&settings.otlp_headers))
                    .build()
            }
            OtlpProtocol::HttpBinary | OtlpProtocol::HttpJson => {
                let endpoint = http_endpoint(endpoint, signal);
                debug!("Using OTLP Http {signal} exporter: {endpoint}");
                $exporter::builder()
                    .with_http()
                    .with_endpoint(endpoint)
                    .with_protocol(http_protocol(settings.otlp_protocol))
                    .with_headers(settings.otlp_headers.clone())
                    .build()
            }
        }
        .map_err(|source| SignozError::Exporter { signal, source })
    }};
}

/// Telemetry pipelines registered for one service.
///
/// Dropping the provider flushes and shuts every pipeline down.
pub struct SignozProvider {
    pub name: String,
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    logger_provider: Option<SdkLoggerProvider>,
    _process_metrics: Option<ProcessMetrics>,
}

impl SignozProvider {
    /// Registers the pipelines `settings` asks for. Returns `None` when
    /// telemetry is disabled.
    pub fn from(settings: &SignozSettings, app: &AppInfo) -> Result<Option<Self>, SignozError> {
        if !settings.enabled {
            debug!("SigNoz telemetry disabled; no pipelines registered.");
            return Ok(None);
        }

        let name = settings.resolved_service_name(&app.name);
        let resource = Resource::builder()
            .with_service_name(name.clone())
            .with_attributes(vec![
                KeyValue::new(semconv::attribute::SERVICE_VERSION, app.version.clone()),
                KeyValue::new(SERVICE_INSTANCE_ID, instance_id()),
            ])
            .build();

        let otlp_target = settings.otlp_target();
        if otlp_target.is_none() && settings.use_otlp_export {
            warn!("OTLP export requested but no otlp_endpoint is configured");
        }

        global::set_text_map_propagator(TraceContextPropagator::new());

        let tracer_provider = if settings.export_traces {
            let mut builder = SdkTracerProvider::builder()
                .with_resource(resource.clone())
                .with_sampler(Sampler::AlwaysOn);
            if let Some(endpoint) = otlp_target {
                let exporter = otlp_exporter!(SpanExporter, Signal::Traces, settings, endpoint)?;
                builder = builder.with_batch_exporter(exporter);
            }
            if settings.use_console_export {
                debug!("Using console span exporter");
                builder = builder.with_batch_exporter(ConsoleExporter::stdout());
            }
            let provider = builder.build();
            global::set_tracer_provider(provider.clone());
            Some(provider)
        } else {
            None
        };

        let meter_provider = if settings.export_metrics {
            let interval = Duration::from_secs(settings.metrics_interval_secs.max(1));
            let mut builder = SdkMeterProvider::builder().with_resource(resource.clone());
            if let Some(endpoint) = otlp_target {
                let exporter =
                    otlp_exporter!(MetricExporter, Signal::Metrics, settings, endpoint)?;
                let reader = PeriodicReader::builder(exporter)
                    .with_interval(interval)
                    .build();
                builder = builder.with_reader(reader);
            }
            if settings.use_console_export {
                debug!("Using console metric exporter");
                let reader = PeriodicReader::builder(ConsoleMetricExporter::stdout())
                    .with_interval(interval)
                    .build();
                builder = builder.with_reader(reader);
            }
            let provider = builder.build();
            global::set_meter_provider(provider.clone());
            Some(provider)
        } else {
            None
        };
        let process_metrics = meter_provider
            .as_ref()
            .map(|provider| ProcessMetrics::register(&provider.meter("signoz-otel")));

        let logger_provider = if settings.export_logs {
            let mut builder = SdkLoggerProvider::builder().with_resource(resource);
            if let Some(endpoint) = otlp_target {
                let exporter = otlp_exporter!(LogExporter, Signal::Logs, settings, endpoint)?;
                builder = builder.with_batch_exporter(exporter);
            }
            Some(builder.build())
        } else {
            None
        };

        Ok(Some(Self {
            name,
            tracer_provider,
            meter_provider,
            logger_provider,
            _process_metrics: process_metrics,
        }))
    }

    pub fn tracer(&self) -> Option<Tracer> {
        self.tracer_provider
            .as_ref()
            .map(|provider| provider.tracer(self.name.clone()))
    }

    pub fn scopes(&self) -> ScopeFactory {
        self.tracer()
            .map(ScopeFactory::new)
            .unwrap_or_else(ScopeFactory::disabled)
    }

    pub fn traces_enabled(&self) -> bool {
        self.tracer_provider.is_some()
    }

    pub fn metrics_enabled(&self) -> bool {
        self.meter_provider.is_some()
    }

    pub fn logs_enabled(&self) -> bool {
        self.logger_provider.is_some()
    }

    /// Flushes and shuts down every pipeline. Later calls are no-ops.
    pub fn shutdown(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(err) = provider.shutdown()
        {
            warn!("failed to shut down tracer provider: {err}");
        }
        if let Some(provider) = self.meter_provider.take()
            && let Err(err) = provider.shutdown()
        {
            warn!("failed to shut down meter provider: {err}");
        }
        if let Some(provider) = self.logger_provider.take()
            && let Err(err) = provider.shutdown()
        {
            warn!("failed to shut down logger provider: {err}");
        }
    }
}

impl Drop for SignozProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Installs the global `tracing` subscriber: an env filter, console output,
/// and, when `provider` is given, the span and log bridges to OpenTelemetry.
///
/// `RUST_LOG` wins over `default_filter`.
pub fn install_subscriber(
    provider: Option<&SignozProvider>,
    default_filter: &str,
) -> Result<(), SignozError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let otel_layer = provider
        .and_then(SignozProvider::tracer)
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));
    let log_layer = provider
        .and_then(|provider| provider.logger_provider.as_ref())
        .map(|logger_provider| {
            OpenTelemetryTracingBridge::new(logger_provider)
                .with_filter(filter_fn(|meta| !is_exporter_target(meta.target())))
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(otel_layer)
        .with(log_layer)
        .try_init()?;
    Ok(())
}

fn is_exporter_target(target: &str) -> bool {
    EXPORTER_TARGETS.iter().any(|prefix| {
        target == *prefix
            || target
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with("::") || rest.starts_with('_'))
    })
}

fn grpc_metadata(headers: &HashMap<String, String>) -> MetadataMap {
    let mut header_map = HeaderMap::new();
    for (key, value) in headers {
        if let Ok(name) = HeaderName::from_bytes(key.as_bytes())
            && let Ok(val) = HeaderValue::from_str(value)
        {
            header_map.insert(name, val);
        } else {
            warn!("skipping invalid OTLP header {key}");
        }
    }
    MetadataMap::from_headers(header_map)
}

fn http_protocol(protocol: OtlpProtocol) -> Protocol {
    match protocol {
        OtlpProtocol::HttpJson => Protocol::HttpJson,
        OtlpProtocol::Grpc | OtlpProtocol::HttpBinary => Protocol::HttpBinary,
    }
}

/// OTLP/HTTP exporters post to the endpoint verbatim, so the signal path is
/// appended here unless the configured endpoint already carries one.
fn http_endpoint(endpoint: &str, signal: Signal) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.ends_with(signal.http_path()) {
        base.to_string()
    } else {
        format!("{base}{}", signal.http_path())
    }
}

fn instance_id() -> String {
    gethostname()
        .into_string()
        .ok()
        .filter(|value| !value.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn disabled_settings_register_nothing() {
        let settings = SignozSettings::default();
        let provider = SignozProvider::from(&settings, &AppInfo::new("orders", "1.0.0"))
            .expect("disabled settings never fail");
        assert!(provider.is_none());
    }

    #[test]
    fn enabled_without_endpoint_builds_local_pipelines() {
        let settings = SignozSettings {
            enabled: true,
            export_logs: true,
            ..Default::default()
        };
        let mut provider = SignozProvider::from(&settings, &AppInfo::new("Orders", "1.0.0"))
            .expect("provider")
            .expect("enabled");

        assert_eq!(provider.name, "orders");
        assert!(provider.traces_enabled());
        assert!(provider.metrics_enabled());
        assert!(provider.logs_enabled());
        assert!(provider.scopes().is_enabled());

        provider.shutdown();
        assert!(!provider.traces_enabled());
        provider.shutdown();
    }

    #[test]
    fn console_export_wires_trace_and_metric_pipelines() {
        let settings = SignozSettings {
            enabled: true,
            use_otlp_export: false,
            use_console_export: true,
            ..Default::default()
        };
        let mut provider = SignozProvider::from(&settings, &AppInfo::new("orders", "1.0.0"))
            .expect("provider")
            .expect("enabled");

        assert!(provider.traces_enabled());
        assert!(provider.metrics_enabled());
        assert!(provider._process_metrics.is_some());
        provider.shutdown();
    }

    #[test]
    fn signal_switches_are_honoured() {
        let settings = SignozSettings {
            enabled: true,
            export_traces: false,
            export_metrics: false,
            ..Default::default()
        };
        let provider = SignozProvider::from(&settings, &AppInfo::new("orders", "1.0.0"))
            .expect("provider")
            .expect("enabled");

        assert!(!provider.traces_enabled());
        assert!(!provider.metrics_enabled());
        assert!(!provider.logs_enabled());
        assert!(!provider.scopes().is_enabled());
    }

    #[test]
    fn http_endpoint_appends_signal_path_once() {
        assert_eq!(
            http_endpoint("http://collector:4318/", Signal::Traces),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            http_endpoint("http://collector:4318/v1/metrics", Signal::Metrics),
            "http://collector:4318/v1/metrics"
        );
    }

    #[test]
    fn exporter_targets_are_filtered() {
        assert!(is_exporter_target("opentelemetry_sdk::trace"));
        assert!(is_exporter_target("hyper::proto"));
        assert!(is_exporter_target("h2"));
        assert!(!is_exporter_target("hyperspace"));
        assert!(!is_exporter_target("signoz_sample::jobs"));
    }

    #[test]
    fn invalid_grpc_headers_are_skipped() {
        let headers = HashMap::from([
            ("signoz-access-token".to_string(), "secret".to_string()),
            ("bad header".to_string(), "x".to_string()),
        ]);
        let metadata = grpc_metadata(&headers);
        assert_eq!(metadata.len(), 1);
        assert!(metadata.get("signoz-access-token").is_some());
    }
}
