//! Manual instrumentation for a single unit of work.
//!
//! A [`TelemetryScope`] owns a started span plus any resources tied to the
//! unit of work. Failures reported through [`TelemetryScope::record_failure`]
//! mark the span as errored; when the scope is released (explicitly or on
//! drop) the span gets an `Ok` status unless a failure was recorded, the span
//! is ended, and the owned resources are released in the order they were
//! added. Nothing in the release path can fail the caller.
//!
//! ```ignore
//! let mut scope = provider.scopes().start("orders.sync", ResourceCollection::new());
//! if let Err(err) = sync_orders().await {
//!     scope.capture_error(&err);
//! }
//! scope.release();
//! ```
//!
//! The scope's span is not made current automatically. Work that should nest
//! under it attaches [`TelemetryScope::context`] (or passes it to
//! [`ScopeFactory::start_with_parent`]).

use std::borrow::Cow;
use std::error::Error;
use std::iter::successors;

use opentelemetry::Context;
use opentelemetry::KeyValue;
use opentelemetry::trace::Span;
use opentelemetry::trace::Status;
use opentelemetry::trace::TraceContextExt;
use opentelemetry::trace::Tracer as _;
use opentelemetry_sdk::trace::Tracer;
use opentelemetry_semantic_conventions as semconv;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::resources::ResourceCollection;
use crate::resources::ScopedResource;
use crate::resources::contained;

const EXCEPTION_EVENT: &str = "exception";
const EXCEPTION_CAUSE: &str = "exception.cause";

/// A scope over spans produced by the SDK tracer.
pub type SdkScope = TelemetryScope<ContextSpan>;

/// What went wrong in a unit of work.
#[derive(Debug, Clone)]
pub struct Failure<'a> {
    pub message: Cow<'a, str>,
    pub cause: Option<&'a (dyn Error + 'static)>,
    pub kind: Option<&'static str>,
}

impl<'a> Failure<'a> {
    pub fn new(message: impl Into<Cow<'a, str>>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            kind: None,
        }
    }

    pub fn with_cause(mut self, cause: &'a (dyn Error + 'static)) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Uses the error's `Display` as the message and its type as the kind.
    pub fn from_error<E: Error + 'static>(err: &'a E) -> Self {
        Self {
            message: Cow::Owned(err.to_string()),
            cause: Some(err),
            kind: Some(std::any::type_name::<E>()),
        }
    }

    /// Attributes of the `exception` event describing this failure.
    pub fn exception_attributes(&self) -> Vec<KeyValue> {
        let mut attributes = vec![KeyValue::new(
            semconv::attribute::EXCEPTION_MESSAGE,
            self.message.to_string(),
        )];
        if let Some(kind) = self.kind {
            attributes.push(KeyValue::new(semconv::attribute::EXCEPTION_TYPE, kind));
        }
        if let Some(cause) = self.cause {
            attributes.push(KeyValue::new(
                semconv::attribute::EXCEPTION_STACKTRACE,
                format!("{cause:?}"),
            ));
            let chain = successors(cause.source(), |&err| err.source())
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            if !chain.is_empty() {
                attributes.push(KeyValue::new(EXCEPTION_CAUSE, chain.join(": ")));
            }
        }
        attributes
    }
}

/// The span capability a scope drives.
pub trait ScopeSpan {
    fn set_ok(&mut self);

    /// Marks the span as errored and attaches the failure details.
    fn set_failed(&mut self, failure: &Failure<'_>);

    fn finish(&mut self);

    /// Context carrying this span, for parenting nested work.
    fn context(&self) -> Option<Context> {
        None
    }
}

impl<S: Span> ScopeSpan for S {
    fn set_ok(&mut self) {
        self.set_status(Status::Ok);
    }

    fn set_failed(&mut self, failure: &Failure<'_>) {
        self.set_status(Status::error(failure.message.to_string()));
        self.add_event(EXCEPTION_EVENT, failure.exception_attributes());
    }

    fn finish(&mut self) {
        self.end();
    }
}

/// A started span held inside the [`Context`] nested work parents on.
#[derive(Debug)]
pub struct ContextSpan(Context);

impl ContextSpan {
    pub fn new(cx: Context) -> Self {
        Self(cx)
    }
}

impl ScopeSpan for ContextSpan {
    fn set_ok(&mut self) {
        self.0.span().set_status(Status::Ok);
    }

    fn set_failed(&mut self, failure: &Failure<'_>) {
        let span = self.0.span();
        span.set_status(Status::error(failure.message.to_string()));
        span.add_event(EXCEPTION_EVENT, failure.exception_attributes());
    }

    fn finish(&mut self) {
        self.0.span().end();
    }

    fn context(&self) -> Option<Context> {
        Some(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    Active,
    Released,
}

#[derive(Debug)]
pub struct TelemetryScope<S: ScopeSpan> {
    span: Option<S>,
    resources: ResourceCollection,
    succeeded: bool,
    state: ScopeState,
}

impl<S: ScopeSpan> TelemetryScope<S> {
    /// `span` must already be started. `None` means tracing is off; the scope
    /// then only manages `resources`.
    pub fn new(span: Option<S>, resources: ResourceCollection) -> Self {
        Self {
            span,
            resources,
            succeeded: true,
            state: ScopeState::Active,
        }
    }

    pub fn detached(resources: ResourceCollection) -> Self {
        Self::new(None, resources)
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn is_active(&self) -> bool {
        self.state == ScopeState::Active
    }

    pub fn has_span(&self) -> bool {
        self.span.is_some()
    }

    /// Context holding the scope's span, or the current context when the
    /// scope has none.
    pub fn context(&self) -> Context {
        self.span
            .as_ref()
            .and_then(ScopeSpan::context)
            .unwrap_or_else(Context::current)
    }

    /// Co-own another resource; it is released after the ones already held.
    pub fn push_resource(&mut self, resource: impl ScopedResource + 'static) {
        self.resources.push(resource);
    }

    pub fn record_failure(&mut self, failure: Failure<'_>) {
        self.succeeded = false;
        if let Some(span) = self.span.as_mut() {
            contained("recording a failure on the scope span", || {
                span.set_failed(&failure);
            });
        }
    }

    pub fn capture_error<E: Error + 'static>(&mut self, err: &E) {
        self.record_failure(Failure::from_error(err));
    }

    /// Runs `work` inside the scope, records an `Err` as a failure and
    /// releases the scope before handing the result back.
    pub fn run<T, E, F>(mut self, work: F) -> Result<T, E>
    where
        E: Error + 'static,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        let result = work(&mut self);
        if let Err(err) = &result {
            self.capture_error(err);
        }
        self.release();
        result
    }

    /// Finalizes the span and releases owned resources.
    pub fn release(mut self) {
        self.finalize();
    }

    fn finalize(&mut self) {
        if self.state == ScopeState::Released {
            return;
        }
        self.state = ScopeState::Released;

        if let Some(mut span) = self.span.take() {
            let succeeded = self.succeeded;
            contained("finalizing the scope span", move || {
                if succeeded {
                    span.set_ok();
                }
                span.finish();
            });
        }

        let failures = self.resources.release_all();
        if failures > 0 {
            tracing::debug!("telemetry scope released with {failures} resource failure(s)");
        }
    }
}

impl<S: ScopeSpan> Drop for TelemetryScope<S> {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Hands out scopes backed by the configured tracer, or detached scopes when
/// tracing is off.
#[derive(Clone, Debug, Default)]
pub struct ScopeFactory {
    tracer: Option<Tracer>,
}

impl ScopeFactory {
    pub fn new(tracer: Tracer) -> Self {
        Self {
            tracer: Some(tracer),
        }
    }

    pub fn disabled() -> Self {
        Self { tracer: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tracer.is_some()
    }

    /// Starts a scope whose span is a child of the current `tracing` span,
    /// falling back to the attached OpenTelemetry context.
    pub fn start(
        &self,
        name: impl Into<Cow<'static, str>>,
        resources: ResourceCollection,
    ) -> SdkScope {
        let mut parent = tracing::Span::current().context();
        if !parent.has_active_span() {
            parent = Context::current();
        }
        self.start_with_parent(name, &parent, resources)
    }

    pub fn start_with_parent(
        &self,
        name: impl Into<Cow<'static, str>>,
        parent: &Context,
        resources: ResourceCollection,
    ) -> SdkScope {
        let span = self.tracer.as_ref().map(|tracer| {
            let span = tracer.start_with_context(name, parent);
            ContextSpan::new(parent.with_span(span))
        });
        TelemetryScope::new(span, resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::BoxError;
    use crate::resources::on_release;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct FakeSpan {
        log: Log,
        panic_on_finish: bool,
    }

    impl FakeSpan {
        fn new(log: &Log) -> Self {
            Self {
                log: Arc::clone(log),
                panic_on_finish: false,
            }
        }

        fn push(&self, entry: String) {
            self.log.lock().expect("log lock").push(entry);
        }
    }

    impl ScopeSpan for FakeSpan {
        fn set_ok(&mut self) {
            self.push("span:ok".to_string());
        }

        fn set_failed(&mut self, failure: &Failure<'_>) {
            self.push(format!("span:error:{}", failure.message));
        }

        fn finish(&mut self) {
            if self.panic_on_finish {
                panic!("exporter gone");
            }
            self.push("span:end".to_string());
        }
    }

    fn resource(
        log: &Log,
        name: &'static str,
    ) -> impl ScopedResource + 'static + use<> {
        let log = Arc::clone(log);
        on_release(name, move || {
            log.lock().expect("log lock").push(format!("release:{name}"));
            Ok(())
        })
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().expect("log lock").clone()
    }

    #[derive(Debug, thiserror::Error)]
    #[error("timeout")]
    struct Timeout;

    #[test]
    fn release_without_failure_sets_ok_then_releases_in_order() {
        let log = Log::default();
        let scope = TelemetryScope::new(
            Some(FakeSpan::new(&log)),
            ResourceCollection::new()
                .with(resource(&log, "r1"))
                .with(resource(&log, "r2")),
        );

        assert!(scope.succeeded());
        scope.release();

        assert_eq!(
            entries(&log),
            vec!["span:ok", "span:end", "release:r1", "release:r2"]
        );
    }

    #[test]
    fn recorded_failure_keeps_error_status() {
        let log = Log::default();
        let mut scope = TelemetryScope::new(Some(FakeSpan::new(&log)), ResourceCollection::new());

        scope.capture_error(&Timeout);
        scope.record_failure(Failure::new("second"));
        assert!(!scope.succeeded());
        scope.release();

        assert_eq!(
            entries(&log),
            vec!["span:error:timeout", "span:error:second", "span:end"]
        );
    }

    #[test]
    fn drop_finalizes_exactly_once() {
        let log = Log::default();
        {
            let mut scope = TelemetryScope::new(
                Some(FakeSpan::new(&log)),
                ResourceCollection::new().with(resource(&log, "r1")),
            );
            scope.finalize();
            assert!(!scope.is_active());
        }

        assert_eq!(entries(&log), vec!["span:ok", "span:end", "release:r1"]);
    }

    #[test]
    fn absent_span_only_releases_resources() {
        let log = Log::default();
        let mut scope: TelemetryScope<FakeSpan> =
            TelemetryScope::detached(ResourceCollection::new().with(resource(&log, "r")));

        assert!(!scope.has_span());
        scope.capture_error(&Timeout);
        scope.release();

        assert_eq!(entries(&log), vec!["release:r"]);
    }

    #[test]
    fn resources_released_even_when_span_panics() {
        let log = Log::default();
        let mut span = FakeSpan::new(&log);
        span.panic_on_finish = true;

        let scope = TelemetryScope::new(
            Some(span),
            ResourceCollection::new().with(resource(&log, "r1")),
        );
        scope.release();

        assert_eq!(entries(&log), vec!["span:ok", "release:r1"]);
    }

    #[test]
    fn failing_resource_does_not_skip_later_ones() {
        let log = Log::default();
        let mut scope = TelemetryScope::new(
            Some(FakeSpan::new(&log)),
            ResourceCollection::new().with(resource(&log, "r1")),
        );
        scope.push_resource(on_release("broken", || -> Result<(), BoxError> {
            Err("already closed".into())
        }));
        scope.push_resource(resource(&log, "r3"));
        scope.release();

        assert_eq!(
            entries(&log),
            vec!["span:ok", "span:end", "release:r1", "release:r3"]
        );
    }

    #[test]
    fn run_captures_errors_and_releases() {
        let log = Log::default();
        let scope = TelemetryScope::new(Some(FakeSpan::new(&log)), ResourceCollection::new());

        let result: Result<(), Timeout> = scope.run(|_| Err(Timeout));

        assert!(result.is_err());
        assert_eq!(entries(&log), vec!["span:error:timeout", "span:end"]);
    }

    #[test]
    fn failure_attributes_include_cause_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("sync failed")]
        struct SyncFailed(#[source] Timeout);

        let err = SyncFailed(Timeout);
        let attributes = Failure::from_error(&err).exception_attributes();
        let value = |key: &str| {
            attributes
                .iter()
                .find(|kv| kv.key.as_str() == key)
                .map(|kv| kv.value.as_str().into_owned())
        };

        assert_eq!(value("exception.message").as_deref(), Some("sync failed"));
        assert_eq!(value("exception.cause").as_deref(), Some("timeout"));
        assert!(
            value("exception.type")
                .is_some_and(|kind| kind.ends_with("SyncFailed"))
        );
    }

    #[test]
    fn disabled_factory_hands_out_detached_scopes() {
        let factory = ScopeFactory::disabled();
        let scope = factory.start("job", ResourceCollection::new());

        assert!(!factory.is_enabled());
        assert!(!scope.has_span());
    }
}
