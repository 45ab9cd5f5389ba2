//! Logging and Trace Export
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` plus a fmt layer,
//! and optionally an OTLP exporter layer for distributed tracing.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Extra filter directives (default level for this crate: info)
//! - `OTEL_ENABLED`: Set to "true" to export spans over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4317)
//! - `OTEL_SERVICE_NAME`: Service name for traces (default: price-stream)
//!
//! # Usage
//!
//! ```ignore
//! use price_stream::infrastructure::telemetry;
//!
//! // Keep the guard alive until shutdown so buffered spans are flushed.
//! let _guard = telemetry::init()?;
//! tracing::info!("Service starting");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Service name for OpenTelemetry traces.
const DEFAULT_SERVICE_NAME: &str = "price-stream";

/// Default OTLP (gRPC) endpoint.
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Directives applied on top of `RUST_LOG`.
const DEFAULT_DIRECTIVES: &[&str] = &["price_stream=info", "hyper=warn", "reqwest=warn", "h2=warn"];

/// Guard that shuts down OpenTelemetry when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans are exported over OTLP.
    #[must_use]
    pub const fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shutdown OpenTelemetry tracer provider: {e}");
        }
    }
}

/// Telemetry setup errors.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A filter directive did not parse.
    #[error("invalid log directive '{directive}': {reason}")]
    InvalidDirective {
        /// The offending directive.
        directive: String,
        /// Parser message.
        reason: String,
    },

    /// The OTLP exporter could not be built.
    #[error("failed to create OTLP exporter: {0}")]
    Exporter(String),

    /// A global subscriber was already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Whether OTLP export is enabled.
    pub enabled: bool,
    /// OTLP exporter endpoint.
    pub otlp_endpoint: String,
    /// Service name for traces.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            enabled: lookup("OTEL_ENABLED")
                .is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes")),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.otlp_endpoint),
            service_name: lookup("OTEL_SERVICE_NAME")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.service_name),
        }
    }
}

/// Initialize telemetry from environment variables.
///
/// # Errors
///
/// See [`init_with_config`].
pub fn init() -> Result<TelemetryGuard, TelemetryError> {
    init_with_config(TelemetryConfig::from_env())
}

/// Initialize telemetry with a custom configuration.
///
/// Returns a guard that must be kept alive for the duration of the program.
///
/// # Errors
///
/// Returns [`TelemetryError`] if a directive is invalid, the exporter
/// cannot be built, or a subscriber is already installed.
pub fn init_with_config(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = build_filter(EnvFilter::from_default_env())?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::Install(e.to_string()))?;

        return Ok(TelemetryGuard {
            tracer_provider: None,
        });
    }

    let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build();

    let tracer = tracer_provider.tracer(config.service_name);
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Install(e.to_string()))?;

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
    })
}

fn build_filter(mut filter: EnvFilter) -> Result<EnvFilter, TelemetryError> {
    for directive in DEFAULT_DIRECTIVES {
        let parsed = directive
            .parse()
            .map_err(|e: tracing_subscriber::filter::ParseError| TelemetryError::InvalidDirective {
                directive: (*directive).to_string(),
                reason: e.to_string(),
            })?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

// =============================================================================
// Tests
// =============================================================================
