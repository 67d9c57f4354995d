use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use axum::Extension;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use clap::Parser;
use signoz_otel::AppInfo;
use signoz_otel::InstrumentedClient;
use signoz_otel::ResourceCollection;
use signoz_otel::ScopeFactory;
use signoz_otel::SignozError;
use signoz_otel::SignozProvider;
use signoz_otel::SignozSettings;
use signoz_otel::http::HttpInstrumentation;
use signoz_otel::http::instrument;
use signoz_otel::install_subscriber;
use signoz_otel::on_release;
use signoz_otel::propagation::CORRELATION_ID_HEADER;
use signoz_otel::propagation::CorrelationId;
use tokio::net::TcpListener;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser, Debug, Clone)]
#[command(about = "Sample web host exporting telemetry to SigNoz")]
pub struct Args {
    /// TOML file holding the `[signoz]` table.
    #[arg(long, value_name = "FILE", default_value = "signoz.toml")]
    pub config: PathBuf,

    /// Address the HTTP server listens on.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Base URL `/relay` calls; defaults to this server.
    #[arg(long, value_name = "URL")]
    pub upstream: Option<String>,

    /// Seconds between heartbeat runs; 0 disables the job.
    #[arg(long = "heartbeat-secs", value_name = "SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,
}

pub async fn run_main(args: Args) -> anyhow::Result<()> {
    let settings = SignozSettings::load(&args.config)?.apply_env_overrides();
    let app = AppInfo::new(APP_NAME, env!("CARGO_PKG_VERSION"));
    let mut provider = SignozProvider::from(&settings, &app)?;
    install_subscriber(provider.as_ref(), DEFAULT_LOG_FILTER)?;

    let scopes = provider
        .as_ref()
        .map(SignozProvider::scopes)
        .unwrap_or_default();
    let heartbeat = (args.heartbeat_secs > 0).then(|| {
        tokio::spawn(heartbeat(
            scopes,
            args.config.clone(),
            Duration::from_secs(args.heartbeat_secs),
        ))
    });

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    let local_url = format!("http://{}", listener.local_addr()?);
    info!("listening on {local_url}");

    let client = InstrumentedClient::from_global(reqwest::Client::new(), APP_NAME);
    let state = AppState::new(client, args.upstream.unwrap_or(local_url));
    let app = instrument(router(state), HttpInstrumentation::from_global(APP_NAME));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    if let Some(provider) = provider.as_mut() {
        provider.shutdown();
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct AppState {
    client: InstrumentedClient,
    upstream: String,
}

impl AppState {
    pub fn new(client: InstrumentedClient, upstream: impl Into<String>) -> Self {
        Self {
            client,
            upstream: upstream.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/hello", get(hello))
        .route("/bye", get(bye))
        .route("/relay", get(relay))
        .with_state(state)
}

async fn hello() -> &'static str {
    "World!"
}

async fn bye(correlation_id: Option<Extension<CorrelationId>>) -> Result<&'static str, AppError> {
    if let Some(Extension(id)) = correlation_id {
        debug!(correlation_id = %id, "saying goodbye");
    }
    Err(anyhow::anyhow!("expected error").into())
}

/// Calls the upstream `/hello`, forwarding the correlation ID.
async fn relay(
    State(state): State<AppState>,
    correlation_id: Option<Extension<CorrelationId>>,
) -> Result<String, AppError> {
    let url = format!("{}/hello", state.upstream.trim_end_matches('/'));
    let mut request = state.client.inner().get(url);
    if let Some(Extension(id)) = correlation_id {
        request = request.header(CORRELATION_ID_HEADER, id.as_str());
    }
    let response = state.client.send(request).await?.error_for_status()?;
    Ok(format!("relayed: {}", response.text().await?))
}

/// Handler error rendered as a 500 with the error text as the body.
struct AppError(anyhow::Error);

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("request failed: {:#}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

async fn heartbeat(scopes: ScopeFactory, config: PathBuf, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    let mut run: u64 = 0;
    loop {
        ticker.tick().await;
        run += 1;
        if let Err(err) = heartbeat_once(&scopes, &config, run) {
            warn!("heartbeat {run} failed: {err}");
        }
    }
}

/// One heartbeat tick: re-reads the settings file inside its own scope.
pub fn heartbeat_once(
    scopes: &ScopeFactory,
    config: &Path,
    run: u64,
) -> Result<SignozSettings, SignozError> {
    let started = Instant::now();
    let resources = ResourceCollection::new().with(on_release("heartbeat timer", move || {
        debug!(run, elapsed = ?started.elapsed(), "heartbeat finished");
        Ok(())
    }));
    scopes
        .start("sample.heartbeat", resources)
        .run(|_scope| SignozSettings::load(config))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
