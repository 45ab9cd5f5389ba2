//! Price Stream Binary
//!
//! Starts the price ingestion scheduler and the HTTP/WebSocket server.
//!
//! # Usage
//!
//! ```bash
//! PRICE_STREAM_SYMBOLS=AAPL,MSFT,PETR4.SA cargo run --bin price-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `PRICE_STREAM_SYMBOLS`: Comma-separated symbols to keep priced
//!
//! ## Server
//! - `PRICE_STREAM_HTTP_PORT`: HTTP and WebSocket port (default: 8090)
//!
//! ## Provider
//! - `PRICE_STREAM_PROVIDER_URL`: Quote API base URL (default: <https://query1.finance.yahoo.com>)
//! - `PRICE_STREAM_PROVIDER_USER_AGENT`: User agent sent to the provider
//! - `PRICE_STREAM_QUOTE_BATCH_LIMIT`: Symbols per real-time quote call (default: 50)
//!
//! ## Rate limiting and fetching
//! - `PRICE_STREAM_RATE_LIMIT`: Provider calls per window (default: 100)
//! - `PRICE_STREAM_RATE_WINDOW_SECS`: Rate limit window (default: 60)
//! - `PRICE_STREAM_CHUNK_SIZE`: Symbols per chunk (default: 50)
//! - `PRICE_STREAM_MAX_CONCURRENCY`: Chunks in flight (default: 4)
//! - `PRICE_STREAM_REQUEST_TIMEOUT_SECS`: Per-call timeout (default: 10)
//! - `PRICE_STREAM_MAX_RETRIES`: Retries of transient failures (default: 3)
//! - `PRICE_STREAM_INITIAL_BACKOFF_MS`: First retry delay (default: 300)
//! - `PRICE_STREAM_MAX_BACKOFF_MS`: Retry delay ceiling (default: 5000)
//!
//! ## Scheduling
//! - `PRICE_STREAM_DAILY_PERIOD_SECS`: Daily close refresh period (default: 86400)
//! - `PRICE_STREAM_DAILY_BUDGET_SECS`: Daily close cycle budget (default: 600)
//! - `PRICE_STREAM_DAILY_BATCH_TIMEOUT_SECS`: Daily close fetch deadline, below the budget (default: 570)
//! - `PRICE_STREAM_REALTIME_PERIOD_MS`: Real-time refresh period (default: 5000)
//! - `PRICE_STREAM_REALTIME_BUDGET_SECS`: Real-time cycle budget (default: 30)
//! - `PRICE_STREAM_REALTIME_BATCH_TIMEOUT_SECS`: Real-time fetch deadline, below the budget (default: 25)
//!
//! ## Connections and cache
//! - `PRICE_STREAM_QUEUE_CAPACITY`: Frames buffered per connection (default: 256)
//! - `PRICE_STREAM_MAX_CONNECTIONS`: Live connection ceiling (default: 100)
//! - `PRICE_STREAM_CACHE_TTL_SECS`: Cached price lifetime (default: 3600)
//! - `PRICE_STREAM_CACHE_MAX_ENTRIES`: Cached price ceiling (default: 100000)
//! - `PRICE_STREAM_SNAPSHOT_PATH`: Snapshot file for restart recovery (default: none)
//!
//! ## Telemetry
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: price-stream)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use price_stream::infrastructure::telemetry;
use price_stream::{
    BroadcastConfig, BroadcastHub, HttpQuoteProvider, HttpServer, HttpServerState, MokaPriceCache,
    PriceFetcher, PricePipeline, PriceStore, RateLimiter, ServiceConfig, StaticCatalog,
    UpdateScheduler, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting price stream");

    let _metrics_handle = init_metrics()?;

    let config = ServiceConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Adapters
    let catalog = Arc::new(StaticCatalog::new(config.symbols.clone()));
    let provider = Arc::new(HttpQuoteProvider::new(
        &config.provider,
        config.fetch.request_timeout,
    )?);
    let cache = Arc::new(MokaPriceCache::from_settings(&config.cache));
    let hub = Arc::new(BroadcastHub::new(BroadcastConfig::from(config.broadcast)));

    if let Some(path) = &config.cache.snapshot_path
        && let Err(e) = cache.load_snapshot(path).await
    {
        tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable price snapshot");
    }

    // Core services
    let limiter = Arc::new(RateLimiter::new(config.rate_limiter_config()));
    let fetcher = Arc::new(PriceFetcher::new(provider, limiter, config.fetcher_config()));
    let store = Arc::new(PriceStore::new());
    let pipeline = Arc::new(PricePipeline::new(
        Arc::clone(&catalog) as _,
        fetcher,
        Arc::clone(&store),
        Arc::clone(&cache) as _,
        Arc::clone(&hub) as _,
    ));

    match pipeline.restore_from_cache().await {
        Ok(restored) => tracing::info!(restored, "Seeded price store from cache"),
        Err(e) => tracing::warn!(error = %e, "Could not seed price store from cache"),
    }

    let scheduler = Arc::new(UpdateScheduler::new(pipeline, config.scheduler_config()));

    // HTTP server (health, metrics, prices, tracked symbols, WebSocket feed)
    let http_state = Arc::new(HttpServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&scheduler),
        store,
        Arc::clone(&hub),
        catalog,
    ));
    let http_server = HttpServer::new(config.server.http_port, http_state, shutdown_token.clone());
    let server_task = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown_token.clone()));

    tracing::info!("Price stream ready");

    await_shutdown(shutdown_token).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = scheduler_task.await;
        let _ = server_task.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out, exiting anyway"
        );
    }

    if let Some(path) = &config.cache.snapshot_path
        && let Err(e) = cache.save_snapshot(path).await
    {
        tracing::error!(path = %path.display(), error = %e, "Failed to save price snapshot");
    }

    tracing::info!("Price stream stopped");
    Ok(())
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ServiceConfig) {
    tracing::info!(
        symbols = config.symbols.len(),
        http_port = config.server.http_port,
        rate_limit = config.rate_limit.capacity,
        rate_window_secs = config.rate_limit.window.as_secs(),
        max_connections = config.broadcast.max_connections,
        "Configuration loaded"
    );
    tracing::debug!(
        provider_url = %config.provider.base_url,
        snapshot_path = ?config.cache.snapshot_path,
        "Adapters"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT), then cancel `shutdown_token`.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
