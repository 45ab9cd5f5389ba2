//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the service's HTTP surface.

/// Live connection fan-out.
pub mod broadcast;

/// Price cache with TTL and snapshot persistence.
pub mod cache;

/// Symbol universe source.
pub mod catalog;

/// Configuration loading.
pub mod config;

/// Health, metrics and price snapshot HTTP endpoints.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// HTTP quote provider client.
pub mod provider;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;

/// WebSocket price feed.
pub mod websocket;
