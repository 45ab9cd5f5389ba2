//! HTTP Server
//!
//! Health checks, Prometheus metrics, price snapshots and the WebSocket
//! price feed, served from one axum router.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status with job, store and connection stats
//! - `GET /healthz` - Kubernetes liveness check (simple OK)
//! - `GET /readyz` - Kubernetes readiness check (first real-time cycle done)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /prices` - Last known record of every symbol
//! - `GET /prices/{symbol}` - Last known record of one symbol
//! - `GET /symbols` - Tracked universe
//! - `PUT /symbols` - Replace the tracked universe (`{"symbols": [...]}`)
//! - `PUT /symbols/{symbol}` - Start tracking a symbol
//! - `DELETE /symbols/{symbol}` - Stop tracking a symbol
//!
//! Universe changes take effect on the next cycle of each job.
//! - `GET /ws/prices` - WebSocket price feed

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{
    JobKind, JobStatus, LastFailure, PriceStore, StoreStats, UpdateScheduler,
};
use crate::domain::pricing::{PriceRecord, Symbol};
use crate::infrastructure::broadcast::{BroadcastStats, SharedBroadcastHub};
use crate::infrastructure::catalog::StaticCatalog;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::websocket;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Whether the first real-time cycle has finished.
    pub ready: bool,
    /// Scheduler job status.
    pub jobs: JobsStatus,
    /// Price store counters.
    pub store: StoreStats,
    /// Live connection statistics.
    pub connections: BroadcastStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Prices are flowing.
    Healthy,
    /// Serving, but the last real-time cycle failed or none has run yet.
    Degraded,
    /// Nothing to serve.
    Unhealthy,
}

/// Status of both scheduler jobs.
#[derive(Debug, Clone, Serialize)]
pub struct JobsStatus {
    /// Daily close job.
    pub daily_close: JobStatus,
    /// Real-time job.
    pub realtime: JobStatus,
}

// =============================================================================
// Price Response Types
// =============================================================================

/// Last known prices of one symbol, with derived daily change.
#[derive(Debug, Clone, Serialize)]
pub struct PriceView {
    /// Stored record.
    #[serde(flatten)]
    pub record: PriceRecord,
    /// Real-time value minus daily close.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_change: Option<Decimal>,
    /// Daily change as a percentage of the close.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_change_percent: Option<Decimal>,
    /// Most recent fetch failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<LastFailure>,
}

impl PriceView {
    fn new(record: PriceRecord, last_failure: Option<LastFailure>) -> Self {
        let (daily_change, daily_change_percent) = record
            .daily_change()
            .map_or((None, None), |(change, percent)| (Some(change), Some(percent)));
        Self {
            record,
            daily_change,
            daily_change_percent,
            last_failure,
        }
    }
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the HTTP server.
pub struct HttpServerState {
    version: String,
    started_at: Instant,
    scheduler: Arc<UpdateScheduler>,
    store: Arc<PriceStore>,
    hub: SharedBroadcastHub,
    catalog: Arc<StaticCatalog>,
}

impl HttpServerState {
    /// Create new server state.
    #[must_use]
    pub fn new(
        version: String,
        scheduler: Arc<UpdateScheduler>,
        store: Arc<PriceStore>,
        hub: SharedBroadcastHub,
        catalog: Arc<StaticCatalog>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            scheduler,
            store,
            hub,
            catalog,
        }
    }
}

// =============================================================================
// HTTP Server
// =============================================================================

/// Build the full router.
pub fn router(state: Arc<HttpServerState>) -> Router {
    let feed = websocket::router(Arc::clone(&state.hub));

    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/prices", get(prices_handler))
        .route("/prices/{symbol}", get(price_handler))
        .route("/symbols", get(symbols_handler).put(replace_symbols_handler))
        .route("/symbols/{symbol}", put(track_handler).delete(untrack_handler))
        .with_state(state)
        .merge(feed)
}

/// HTTP server.
pub struct HttpServer {
    port: u16,
    state: Arc<HttpServerState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HttpServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError::ServerFailed` if the server fails while
    /// running.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpServerError> {
        let port = listener.local_addr().map_or(self.port, |addr| addr.port());
        tracing::info!(port, "HTTP server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HttpServerState>>) -> impl IntoResponse {
    if state.scheduler.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn prices_handler(State(state): State<Arc<HttpServerState>>) -> Json<Vec<PriceView>> {
    let views = state
        .store
        .snapshot()
        .into_iter()
        .map(|record| {
            let failure = state.store.last_failure(&record.symbol);
            PriceView::new(record, failure)
        })
        .collect();
    Json(views)
}

async fn price_handler(
    State(state): State<Arc<HttpServerState>>,
    Path(symbol): Path<String>,
) -> Response {
    let symbol = Symbol::new(symbol);
    match state.store.get(&symbol) {
        Some(record) => {
            let failure = state.store.last_failure(&symbol);
            Json(PriceView::new(record, failure)).into_response()
        }
        None => {
            let body = json!({
                "error": "no price recorded",
                "symbol": symbol,
                "last_failure": state.store.last_failure(&symbol),
            });
            (StatusCode::NOT_FOUND, Json(body)).into_response()
        }
    }
}

/// Tracked universe, as listed and as accepted by `PUT /symbols`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolList {
    /// Symbols, sorted on output.
    pub symbols: Vec<Symbol>,
}

async fn symbols_handler(State(state): State<Arc<HttpServerState>>) -> Json<SymbolList> {
    Json(SymbolList {
        symbols: state.catalog.symbols(),
    })
}

async fn replace_symbols_handler(
    State(state): State<Arc<HttpServerState>>,
    Json(body): Json<SymbolList>,
) -> Json<SymbolList> {
    state
        .catalog
        .replace(body.symbols.iter().map(|s| Symbol::new(s.as_str())));
    Json(SymbolList {
        symbols: state.catalog.symbols(),
    })
}

async fn track_handler(
    State(state): State<Arc<HttpServerState>>,
    Path(symbol): Path<String>,
) -> Response {
    let symbol = Symbol::new(symbol);
    if symbol.is_empty() {
        let body = json!({ "error": "symbol must not be blank" });
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }
    let added = state.catalog.add(symbol.clone());
    if added {
        tracing::info!(symbol = %symbol, "Symbol tracked");
    }
    let status = if added { StatusCode::CREATED } else { StatusCode::OK };
    (status, Json(json!({ "symbol": symbol }))).into_response()
}

async fn untrack_handler(
    State(state): State<Arc<HttpServerState>>,
    Path(symbol): Path<String>,
) -> StatusCode {
    let symbol = Symbol::new(symbol);
    if state.catalog.remove(&symbol) {
        tracing::info!(symbol = %symbol, "Symbol untracked");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

fn build_health_response(state: &HttpServerState) -> HealthResponse {
    let jobs = JobsStatus {
        daily_close: state.scheduler.status(JobKind::DailyClose),
        realtime: state.scheduler.status(JobKind::Realtime),
    };
    let store = state.store.stats();

    HealthResponse {
        status: determine_health_status(&jobs.realtime, &store),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        ready: state.scheduler.is_ready(),
        jobs,
        store,
        connections: state.hub.stats(),
    }
}

fn determine_health_status(realtime: &JobStatus, store: &StoreStats) -> HealthStatus {
    let last_cycle_failed = realtime
        .last_report
        .is_some_and(|report| report.requested > 0 && report.failed == report.requested);

    match (realtime.completed, store.symbols) {
        (0, 0) => HealthStatus::Unhealthy,
        (0, _) => HealthStatus::Degraded,
        _ if last_cycle_failed => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
