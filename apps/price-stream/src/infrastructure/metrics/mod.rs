//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Fetch**: Provider calls and per-symbol fetch outcomes
//! - **Store**: Applied and ignored results
//! - **Broadcast**: Frames delivered, dropped, and dead connections
//! - **Scheduler**: Cycle durations and overruns
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::pricing::{FailureReason, IgnoreReason, PriceKind};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Fetch counters
    describe_counter!(
        "price_stream_provider_calls_total",
        "Outbound provider calls by kind and outcome"
    );
    describe_counter!(
        "price_stream_fetch_results_total",
        "Per-symbol fetch results by kind and outcome"
    );
    describe_histogram!(
        "price_stream_rate_limit_wait_seconds",
        "Time spent waiting for rate-limit permits"
    );

    // Store counters
    describe_counter!(
        "price_stream_store_outcomes_total",
        "Store apply outcomes by kind"
    );
    describe_gauge!(
        "price_stream_tracked_symbols",
        "Number of symbols with a price record"
    );

    // Broadcast
    describe_counter!(
        "price_stream_frames_sent_total",
        "Price frames handed to connections"
    );
    describe_counter!(
        "price_stream_frames_dropped_total",
        "Price frames dropped for lagging connections"
    );
    describe_counter!(
        "price_stream_dead_connections_total",
        "Connections removed after a failed delivery"
    );
    describe_gauge!(
        "price_stream_connections",
        "Number of live dashboard connections"
    );

    // Scheduler
    describe_histogram!(
        "price_stream_cycle_duration_seconds",
        "Duration of scheduler cycles by job"
    );
    describe_counter!(
        "price_stream_cycle_overruns_total",
        "Ticks skipped because the previous cycle was still running"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for cycle outcomes.
#[derive(Debug, Clone, Copy)]
pub enum CycleOutcome {
    /// Cycle finished.
    Completed,
    /// Catalog could not be read.
    Skipped,
    /// Cycle exceeded its budget.
    Abandoned,
}

impl CycleOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Record one outbound provider call.
pub fn record_provider_call(kind: PriceKind, outcome: &'static str) {
    counter!(
        "price_stream_provider_calls_total",
        "kind" => kind.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a successful per-symbol fetch.
pub fn record_fetch_ok(kind: PriceKind) {
    counter!(
        "price_stream_fetch_results_total",
        "kind" => kind.as_str(),
        "outcome" => "ok"
    )
    .increment(1);
}

/// Record a failed per-symbol fetch.
pub fn record_fetch_failed(kind: PriceKind, reason: &FailureReason) {
    counter!(
        "price_stream_fetch_results_total",
        "kind" => kind.as_str(),
        "outcome" => reason.as_str()
    )
    .increment(1);
}

/// Record time spent waiting for permits.
pub fn record_rate_limit_wait(duration: Duration) {
    histogram!("price_stream_rate_limit_wait_seconds").record(duration.as_secs_f64());
}

/// Record an applied store result.
pub fn record_store_applied(kind: PriceKind) {
    counter!(
        "price_stream_store_outcomes_total",
        "kind" => kind.as_str(),
        "outcome" => "applied"
    )
    .increment(1);
}

/// Record an ignored store result.
pub fn record_store_ignored(kind: PriceKind, reason: IgnoreReason) {
    counter!(
        "price_stream_store_outcomes_total",
        "kind" => kind.as_str(),
        "outcome" => reason.as_str()
    )
    .increment(1);
}

/// Update the number of tracked symbols.
#[allow(clippy::cast_precision_loss)]
pub fn set_tracked_symbols(count: usize) {
    gauge!("price_stream_tracked_symbols").set(count as f64);
}

/// Record frames handed to connections.
pub fn record_frames_sent(count: u64) {
    counter!("price_stream_frames_sent_total").increment(count);
}

/// Record frames dropped for a lagging connection.
pub fn record_frames_dropped(count: u64) {
    counter!("price_stream_frames_dropped_total").increment(count);
}

/// Record connections removed after a failed delivery.
pub fn record_dead_connections(count: u64) {
    counter!("price_stream_dead_connections_total").increment(count);
}

/// Update the live connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_connections(count: usize) {
    gauge!("price_stream_connections").set(count as f64);
}

/// Record a finished, skipped, or abandoned cycle.
pub fn record_cycle(job: &'static str, outcome: CycleOutcome, duration: Duration) {
    histogram!(
        "price_stream_cycle_duration_seconds",
        "job" => job,
        "outcome" => outcome.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Record a tick skipped because the job was still running.
pub fn record_cycle_overrun(job: &'static str) {
    counter!("price_stream_cycle_overruns_total", "job" => job).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
