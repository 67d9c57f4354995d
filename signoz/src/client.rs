//! Outbound HTTP instrumentation for `reqwest` clients.
//!
//! Each call gets a client span carrying `traceparent` to the callee, runs
//! inside a [`TelemetryScope`] that records transport errors and 5xx
//! responses, and feeds the `http.client.request.duration` histogram.

use std::time::Instant;

use opentelemetry::KeyValue;
use opentelemetry::metrics::Histogram;
use opentelemetry::metrics::Meter;
use opentelemetry_semantic_conventions as semconv;
use reqwest::Client;
use reqwest::Request;
use reqwest::RequestBuilder;
use reqwest::Response;
use tracing::Instrument;
use tracing::field::Empty;

use crate::http::RequestSpan;
use crate::propagation::inject_headers;
use crate::resources::ResourceCollection;
use crate::telemetry_scope::Failure;
use crate::telemetry_scope::TelemetryScope;

pub const CLIENT_REQUEST_DURATION: &str = "http.client.request.duration";

#[derive(Clone, Debug)]
pub struct InstrumentedClient {
    client: Client,
    request_duration: Histogram<f64>,
}

impl InstrumentedClient {
    pub fn new(client: Client, meter: &Meter) -> Self {
        Self {
            client,
            request_duration: meter
                .f64_histogram(CLIENT_REQUEST_DURATION)
                .with_unit("s")
                .with_description("Duration of outbound HTTP requests.")
                .build(),
        }
    }

    pub fn from_global(client: Client, scope_name: &'static str) -> Self {
        Self::new(client, &opentelemetry::global::meter(scope_name))
    }

    /// The wrapped client, for building requests.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub async fn send(&self, request: RequestBuilder) -> reqwest::Result<Response> {
        self.execute(request.build()?).await
    }

    pub async fn execute(&self, mut request: Request) -> reqwest::Result<Response> {
        let started = Instant::now();
        let method = request.method().as_str().to_owned();
        let host = request.url().host_str().unwrap_or_default().to_owned();
        let port = request.url().port_or_known_default();

        let span = tracing::info_span!(
            "http.client.request",
            otel.name = %method,
            otel.kind = "client",
            otel.status_code = Empty,
            otel.status_message = Empty,
            http.request.method = %method,
            url.full = %request.url(),
            server.address = %host,
            server.port = port,
            http.response.status_code = Empty,
            "error.type" = Empty,
        );
        request.headers_mut().extend(inject_headers(&span));

        let mut scope = TelemetryScope::new(
            Some(RequestSpan::new(span.clone())),
            ResourceCollection::new(),
        );
        let result = self
            .client
            .execute(request)
            .instrument(span.clone())
            .await;

        let mut attributes = vec![
            KeyValue::new(semconv::attribute::HTTP_REQUEST_METHOD, method),
            KeyValue::new(semconv::attribute::SERVER_ADDRESS, host),
        ];
        if let Some(port) = port {
            attributes.push(KeyValue::new(semconv::attribute::SERVER_PORT, i64::from(port)));
        }
        match &result {
            Ok(response) => {
                let status = response.status();
                span.record("http.response.status_code", status.as_u16());
                attributes.push(KeyValue::new(
                    semconv::attribute::HTTP_RESPONSE_STATUS_CODE,
                    i64::from(status.as_u16()),
                ));
                if status.is_server_error() {
                    span.record("error.type", status.as_str());
                    attributes.push(KeyValue::new(
                        semconv::attribute::ERROR_TYPE,
                        status.as_str().to_owned(),
                    ));
                    let reason = status.canonical_reason().unwrap_or("server error");
                    scope.record_failure(Failure::new(format!("{} {reason}", status.as_u16())));
                }
            }
            Err(err) => {
                let kind = error_type(err);
                span.record("error.type", kind);
                attributes.push(KeyValue::new(semconv::attribute::ERROR_TYPE, kind));
                scope.capture_error(err);
            }
        }
        self.request_duration
            .record(started.elapsed().as_secs_f64(), &attributes);

        drop(span);
        scope.release();
        result
    }
}

fn error_type(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else if err.is_redirect() {
        "redirect"
    } else if err.is_body() || err.is_decode() {
        "body"
    } else {
        "request"
    }
}
