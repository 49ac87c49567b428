//! ITSM OAuth proxying gateway
//!
//! Single-binary service that exposes a downstream ITSM HTTP API to AI
//! agents over MCP-over-SSE, multi-tenant, OAuth-token-managed end to end:
//! 1. Binds `/sse` and `/messages` for the MCP session lifecycle.
//! 2. Owns per-tenant OAuth refresh (C7), rate limiting (C4), and upstream
//!    circuit breaking (C5) behind a generic REST passthrough tool.
//! 3. Exposes `/admin/tenants` for registration and lifecycle management,
//!    `/health` and `/sessions` for operators, and `/metrics` for Prometheus.

mod admin;
mod auth;
mod config;
mod error;
mod mcp;
mod metrics;
mod session;
mod tools;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::session::SessionTable;

/// Shared application state, cloned into every axum handler.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<tenant::Registry>,
    pub upstream: Arc<upstream::UpstreamClient>,
    pub sessions: Arc<SessionTable>,
    pub session_budget: Arc<ratelimit::RequestBudget>,
    pub session_requests_per_minute: u32,
    pub auth_config: Arc<config::AuthConfig>,
    pub tier_overrides: Arc<std::collections::HashMap<store::RateTier, ratelimit::TierBudget>>,
    pub started_at: Instant,
    pub requests_total: Arc<AtomicU64>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting itsm-oauth-gateway");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(String::from)
        .unwrap_or_else(|| "config.toml".to_string());
    let config_path = std::path::PathBuf::from(cli_config_path);

    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let encryption_key = config.resolve_encryption_key()?;
    let crypto = Arc::new(crypto::EncryptionService::new(*encryption_key.expose()));

    let store: Arc<dyn store::Store> = if config.store.dsn == "memory" {
        info!("using in-memory store (single instance only)");
        Arc::new(store::InMemoryStore::new())
    } else {
        let pg = store::PostgresStore::connect(&config.store.dsn, config.store.pool_size).await?;
        pg.migrate().await?;
        Arc::new(pg)
    };

    let region_endpoints = config.region_endpoints()?;
    let registry = Arc::new(tenant::Registry::new(
        store.clone(),
        crypto.clone(),
        Duration::from_secs(config.token_manager.tenant_cache_ttl_secs),
        region_endpoints,
    ));

    let refresh_gate = Arc::new(ratelimit::RefreshCoordinator::new(
        ratelimit::RefreshWindowConfig {
            min_interval: Duration::from_secs(config.rate_limit.refresh_min_interval_secs),
            window: Duration::from_secs(config.rate_limit.refresh_window_secs),
            window_cap: config.rate_limit.refresh_window_cap,
            multi_instance: config.rate_limit.multi_instance,
        },
        if config.rate_limit.multi_instance { Some(store.clone()) } else { None },
    ));

    let identity = Arc::new(token::HttpIdentityClient::new(reqwest::Client::new()));
    let instance_id = format!("gw-{}", uuid::Uuid::new_v4());
    let token_manager = Arc::new(token::TokenManager::new(
        store.clone(),
        crypto.clone(),
        registry.clone(),
        identity,
        refresh_gate,
        token::ManagerConfig {
            safety_margin: time::Duration::seconds(config.token_manager.safety_margin_secs),
            retry_policy: config.retry.to_policy(),
            breaker_config: config.circuit_breaker.to_breaker_config(),
            region_endpoints: config.region_token_endpoints(),
            instance_id,
        },
    ));
    let _sweeper = token_manager.spawn_sweeper(
        Duration::from_secs(config.token_manager.check_interval_secs),
        time::Duration::seconds(config.token_manager.refresh_margin_secs),
    );

    let request_budget = Arc::new(ratelimit::RequestBudget::new());
    let upstream_client = Arc::new(upstream::UpstreamClient::new(
        reqwest::Client::builder().build().context("building upstream HTTP client")?,
        token_manager,
        request_budget,
    ));

    let sessions = Arc::new(SessionTable::new());
    let _idle_sweeper = SessionTable::spawn_idle_sweeper(
        sessions.clone(),
        Duration::from_secs(30),
        Duration::from_millis(config.server.session_idle_timeout_ms),
    );

    let tier_overrides = Arc::new(config.tier_budget_overrides());
    let gateway_state = GatewayState {
        registry,
        upstream: upstream_client,
        sessions,
        session_budget: Arc::new(ratelimit::RequestBudget::new()),
        session_requests_per_minute: config.server.session_requests_per_minute,
        auth_config: Arc::new(config.auth),
        tier_overrides,
        started_at: Instant::now(),
        requests_total: Arc::new(AtomicU64::new(0)),
        metrics_handle: metrics::install_recorder(),
    };

    let admin_plane = admin::build_admin_router(gateway_state.clone());

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(render_metrics))
        .route("/sse", get(session::sse_handler))
        .route("/messages", axum::routing::post(session::messages_handler))
        .route("/sessions", get(session::sessions_handler))
        .with_state(gateway_state)
        .merge(admin_plane)
        .layer(axum::middleware::from_fn(metrics::track_requests))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;

    info!(addr = %config.server.listen_addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(Duration::from_secs(config.server.drain_timeout_secs)))
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let sessions = state.sessions.session_count().await;
    let body = serde_json::json!({
        "status": "ok",
        "sessions": sessions,
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "requestsServed": state.requests_total.load(Ordering::Relaxed),
    });
    (axum::http::StatusCode::OK, axum::Json(body))
}

async fn render_metrics(State(state): State<GatewayState>) -> String {
    state.metrics_handle.render()
}

/// Waits for SIGTERM or SIGINT, then gives in-flight requests up to
/// `drain_timeout` to finish before `axum::serve` aborts the remainder.
async fn shutdown_signal(drain_timeout: Duration) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, draining"),
        _ = terminate => info!("received SIGTERM, draining"),
    }
    tokio::time::sleep(drain_timeout).await;
}
