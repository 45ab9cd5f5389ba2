#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Price Stream - Asset Price Ingestion and Distribution
//!
//! Keeps the latest daily-close and real-time price of every tracked asset
//! fresh by polling a rate-limited quote provider, and streams every change
//! to live dashboard connections.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core price types with no I/O
//!   - `pricing`: Samples, records, fetch results, broadcast messages
//!   - `subscription`: Connection registry and symbol filters
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Catalog, price provider, cache and connection interfaces
//!   - `services`: Rate limiter, fetcher, store, pipeline, scheduler
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `provider`: HTTP quote provider client
//!   - `cache`: TTL cache with snapshot persistence
//!   - `catalog`: Configured symbol universe
//!   - `broadcast`: Per-connection queues and fan-out
//!   - `websocket` / `http`: Price feed, health, metrics and snapshots
//!   - `config` / `metrics` / `telemetry`: Ambient concerns
//!
//! # Data Flow
//!
//! ```text
//!                 ┌──────────────┐    ┌─────────┐    ┌────────────┐
//! Scheduler ────► │ Rate-limited │───►│  Price  │───►│ Broadcast  │──► Dashboard 1
//!  (daily +       │   Fetcher    │    │  Store  │    │    Hub     │──► Dashboard 2
//!   real-time)    └──────┬───────┘    └────┬────┘    └────────────┘──► Dashboard N
//!                        │                 │
//!                 Quote provider      Price cache
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core price types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::pricing::{
    BroadcastMessage, FailureReason, FetchOutcome, FetchResult, PriceKind, PriceRecord,
    PriceSample, Symbol,
};
pub use domain::subscription::{ConnectionId, RegistryError, Subscription, SymbolFilter};

// Services
pub use application::services::{
    CycleReport, FetcherConfig, JobKind, PermitMode, PriceFetcher, PricePipeline, PriceStore,
    RateLimiter, RateLimiterConfig, SchedulerConfig, UpdateScheduler,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ServiceConfig};

// HTTP server
pub use infrastructure::http::{HttpServer, HttpServerError, HttpServerState};

// Adapters
pub use infrastructure::broadcast::{BroadcastConfig, BroadcastHub, SharedBroadcastHub};
pub use infrastructure::cache::MokaPriceCache;
pub use infrastructure::catalog::StaticCatalog;
pub use infrastructure::provider::HttpQuoteProvider;

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
