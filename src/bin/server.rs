// Bulwark demo server
// A small axum service behind the full resilience stack, run as a lifecycle component
// Run with: cargo run --bin server -- --port 8080

//! # Bulwark Demo Server
//!
//! Serves a handful of routes behind every resilience layer so their
//! behavior can be observed with `curl`:
//!
//! - `GET  /health`          breaker state and component health
//! - `POST /api/echo`        returns the JSON body (try a body over the limit)
//! - `GET  /api/slow?ms=N`   sleeps N ms while honoring the request deadline
//! - `GET  /api/flaky`       fails every other request with a 500
//!
//! ## Startup and shutdown
//!
//! ```text
//! main()
//!   ↓ loads
//! Settings (defaults → --config file → BULWARK_* env)
//!   ↓ builds
//! ResilienceStack → Router
//!   ↓ registered as "http" with
//! LifecycleManager → init_all → start_all
//!   ↓ Ctrl-C
//! signal_shutdown → stop_all (graceful drain)
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Graceful shutdown with a token
//! `with_graceful_shutdown` takes any future. Passing
//! `token.cancelled()` lets the lifecycle `stop` phase end the server by
//! cancelling the token, after which hyper stops accepting and drains the
//! in-flight requests.
//!
//! ### `anyhow` at the edge
//! The library returns typed errors. The binary only reports them, so it
//! collects everything into `anyhow::Error` and lets `?` do the conversion.

use anyhow::Context as _;
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bulwark::lifecycle::HealthStatus;
use bulwark::{
    AgentError, CircuitBreaker, Context, ContextError, ErrorCode, Lifecycle, LifecycleManager,
    ResilienceStack, Settings,
};
use clap::Parser;
use dotenv::dotenv;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "server", about = "Bulwark resilience demo server")]
struct Cli {
    /// Settings file (toml, yaml or json)
    #[arg(short, long, env = "BULWARK_CONFIG")]
    config: Option<String>,

    /// Overrides server.host
    #[arg(long)]
    host: Option<String>,

    /// Overrides server.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    breaker: Option<Arc<CircuitBreaker>>,
    lifecycle: Arc<LifecycleManager>,
    flaky_calls: Arc<AtomicU64>,
}

#[derive(Debug, Deserialize)]
struct SlowParams {
    #[serde(default = "default_delay_ms")]
    ms: u64,
}

fn default_delay_ms() -> u64 {
    1_000
}

async fn health(State(state): State<AppState>, ctx: Context) -> Json<Value> {
    let components = state.lifecycle.health_check_all(&ctx).await;
    let healthy = components.values().all(HealthStatus::is_healthy);
    Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "circuit_breaker": state.breaker.as_ref().map(|breaker| json!({
            "state": breaker.state(),
            "failures": breaker.failures(),
        })),
        "components": components,
    }))
}

async fn echo(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "echo": body }))
}

/// Sleeps while watching the request deadline installed by the timeout layer
async fn slow(ctx: Context, Query(params): Query<SlowParams>) -> Result<Json<Value>, ContextError> {
    tokio::select! {
        reason = ctx.done() => Err(reason),
        _ = tokio::time::sleep(Duration::from_millis(params.ms)) => {
            Ok(Json(json!({ "slept_ms": params.ms })))
        }
    }
}

async fn flaky(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let call = state.flaky_calls.fetch_add(1, Ordering::Relaxed) + 1;
    if call % 2 == 0 {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "call": call, "error": "simulated upstream failure" })),
        )
    } else {
        (StatusCode::OK, Json(json!({ "call": call })))
    }
}

fn build_router(stack: &ResilienceStack, state: AppState) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/api/echo", post(echo))
        .route("/api/slow", get(slow))
        .route("/api/flaky", get(flaky));
    stack.apply(routes).with_state(state)
}

/// The HTTP listener as a lifecycle component
struct HttpServer {
    addr: SocketAddr,
    router: Mutex<Option<Router>>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), hyper::Error>>>>,
}

impl HttpServer {
    fn new(addr: SocketAddr, router: Router) -> Self {
        Self {
            addr,
            router: Mutex::new(Some(router)),
            stop: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Lifecycle for HttpServer {
    async fn start(&self, _ctx: &Context) -> Result<(), AgentError> {
        let router = self
            .router
            .lock()
            .take()
            .ok_or_else(|| AgentError::new(ErrorCode::InvalidConfig, "http server already started"))?;

        let builder = axum::Server::try_bind(&self.addr).map_err(|err| {
            AgentError::wrap(err, ErrorCode::InvalidConfig, format!("cannot bind {}", self.addr))
        })?;

        let stop = self.stop.clone();
        let server = builder
            .serve(router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { stop.cancelled().await });

        *self.task.lock() = Some(tokio::spawn(server));
        info!(addr = %self.addr, "listening");
        Ok(())
    }

    async fn stop(&self, _ctx: &Context) -> Result<(), AgentError> {
        self.stop.cancel();
        let task = self.task.lock().take();
        match task {
            Some(task) => match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(AgentError::wrap(err, ErrorCode::Internal, "http server failed")),
                Err(err) => Err(AgentError::wrap(err, ErrorCode::Internal, "http server task failed")),
            },
            None => Ok(()),
        }
    }

    async fn health_check(&self, _ctx: &Context) -> HealthStatus {
        let running = self
            .task
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished());
        if running {
            HealthStatus::healthy().with_detail("addr", self.addr.to_string())
        } else {
            HealthStatus::unhealthy("http server is not running")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    if let Err(err) = dotenv() {
        eprintln!("Note: no .env file loaded ({})", err);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    info!(
        service = %settings.server.name,
        environment = %bulwark::config::environment_name().unwrap_or_else(|| "development".to_string()),
        "starting bulwark demo server"
    );

    let stack = ResilienceStack::from_settings(&settings)
        .await
        .context("building middleware stack")?;

    let lifecycle = Arc::new(LifecycleManager::new(settings.lifecycle.clone()));
    let state = AppState {
        breaker: stack.circuit_breaker().map(|layer| layer.breaker().clone()),
        lifecycle: lifecycle.clone(),
        flaky_calls: Arc::new(AtomicU64::new(0)),
    };

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", settings.server.host, settings.server.port))?;
    let server = HttpServer::new(addr, build_router(&stack, state));
    lifecycle.register("http", Arc::new(server), 100)?;

    let ctx = Context::background();
    lifecycle.init_all(&ctx).await?;
    lifecycle.start_all(&ctx).await?;

    let shutdown = lifecycle.shutdown_signal();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "cannot listen for Ctrl-C, shutting down");
            }
        }
        _ = shutdown.cancelled() => {}
    }

    info!("shutting down");
    lifecycle.signal_shutdown();
    if let Err(err) = lifecycle.stop_all(&ctx).await {
        error!(error = %err, "shutdown finished with errors");
    }
    lifecycle.wait_for_shutdown(&ctx).await?;
    info!("bye");
    Ok(())
}
