//! Server-side request instrumentation for axum hosts.
//!
//! Every request runs inside a [`TelemetryScope`] over a `tracing` span that
//! `tracing-opentelemetry` exports as an OTel server span. 5xx responses are
//! recorded as failures, the caller's `traceparent` becomes the parent, and a
//! correlation ID is resolved, exposed to handlers and echoed back.

use std::time::Instant;

use axum::Router;
use axum::extract::MatchedPath;
use axum::extract::Request;
use axum::extract::State;
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::Context;
use opentelemetry::KeyValue;
use opentelemetry::metrics::Histogram;
use opentelemetry::metrics::Meter;
use opentelemetry::metrics::UpDownCounter;
use opentelemetry_semantic_conventions as semconv;
use tracing::Instrument;
use tracing::Span;
use tracing::field::Empty;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::propagation::CorrelationId;
use crate::propagation::extract_context;
use crate::resources::ResourceCollection;
use crate::resources::on_release;
use crate::telemetry_scope::Failure;
use crate::telemetry_scope::ScopeSpan;
use crate::telemetry_scope::TelemetryScope;

const REQUEST_DURATION: &str = "http.server.request.duration";
const ACTIVE_REQUESTS: &str = "http.server.active_requests";

/// A `tracing` span driven by a [`TelemetryScope`].
#[derive(Debug)]
pub struct RequestSpan(Span);

impl RequestSpan {
    pub fn new(span: Span) -> Self {
        Self(span)
    }
}

impl ScopeSpan for RequestSpan {
    fn set_ok(&mut self) {
        self.0.record("otel.status_code", "OK");
    }

    fn set_failed(&mut self, failure: &Failure<'_>) {
        // The code must be recorded before the message or the description is lost.
        self.0.record("otel.status_code", "ERROR");
        self.0.record("otel.status_message", failure.message.as_ref());

        let cause = failure.cause.map(|cause| format!("{cause:?}"));
        tracing::error!(
            parent: &self.0,
            exception.message = %failure.message,
            exception.stacktrace = cause.as_deref(),
            "exception"
        );
    }

    fn finish(&mut self) {
        self.0 = Span::none();
    }

    fn context(&self) -> Option<Context> {
        Some(self.0.context())
    }
}

/// Instruments shared by every instrumented request.
#[derive(Clone, Debug)]
pub struct HttpInstrumentation {
    request_duration: Histogram<f64>,
    active_requests: UpDownCounter<i64>,
}

impl HttpInstrumentation {
    pub fn new(meter: &Meter) -> Self {
        Self {
            request_duration: meter
                .f64_histogram(REQUEST_DURATION)
                .with_unit("s")
                .with_description("Duration of HTTP server requests.")
                .build(),
            active_requests: meter
                .i64_up_down_counter(ACTIVE_REQUESTS)
                .with_unit("{request}")
                .with_description("Number of in-flight HTTP server requests.")
                .build(),
        }
    }

    pub fn from_global(scope_name: &'static str) -> Self {
        Self::new(&opentelemetry::global::meter(scope_name))
    }
}

/// Wraps `router` with [`instrument_request`].
pub fn instrument<S>(router: Router<S>, instrumentation: HttpInstrumentation) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(axum::middleware::from_fn_with_state(
        instrumentation,
        instrument_request,
    ))
}

pub async fn instrument_request(
    State(instrumentation): State<HttpInstrumentation>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().as_str().to_owned();
    let path = request.uri().path().to_owned();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| path.clone());

    let correlation_id = CorrelationId::from_headers(request.headers());
    request.extensions_mut().insert(correlation_id.clone());

    let span = tracing::info_span!(
        "http.request",
        otel.name = %format!("{method} {route}"),
        otel.kind = "server",
        otel.status_code = Empty,
        otel.status_message = Empty,
        http.request.method = %method,
        http.route = %route,
        url.path = %path,
        http.response.status_code = Empty,
        correlation_id = %correlation_id,
    );
    span.set_parent(extract_context(request.headers()));

    let active_attributes = vec![
        KeyValue::new(semconv::attribute::HTTP_REQUEST_METHOD, method.clone()),
        KeyValue::new(semconv::attribute::HTTP_ROUTE, route.clone()),
    ];
    instrumentation
        .active_requests
        .add(1, &active_attributes);
    let active_requests = instrumentation.active_requests.clone();
    let resources = ResourceCollection::new().with(on_release("active request", move || {
        active_requests.add(-1, &active_attributes);
        Ok(())
    }));

    let request_span = RequestSpan::new(span.clone());
    let mut scope = TelemetryScope::new(Some(request_span), resources);

    let mut response = next.run(request).instrument(span.clone()).await;
    let status = response.status();
    if status.is_server_error() {
        let reason = status.canonical_reason().unwrap_or("server error");
        scope.record_failure(Failure::new(format!("{} {reason}", status.as_u16())));
    }
    span.record("http.response.status_code", status.as_u16());
    correlation_id.insert_into(response.headers_mut());

    instrumentation.request_duration.record(
        started.elapsed().as_secs_f64(),
        &[
            KeyValue::new(semconv::attribute::HTTP_REQUEST_METHOD, method),
            KeyValue::new(semconv::attribute::HTTP_ROUTE, route),
            KeyValue::new(
                semconv::attribute::HTTP_RESPONSE_STATUS_CODE,
                i64::from(status.as_u16()),
            ),
        ],
    );

    drop(span);
    scope.release();
    response
}
