//! Service Configuration Settings
//!
//! Configuration types for the price stream, loaded from environment
//! variables prefixed with `PRICE_STREAM_`. Every setting except the
//! tracked symbol list has a default; unparsable values fall back to it.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::services::{
    FetcherConfig, JobSettings, RateLimiterConfig, RetryConfig, SchedulerConfig,
};
use crate::domain::pricing::Symbol;

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Port for health, metrics, price snapshots and the WebSocket feed.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8090 }
    }
}

/// Quote provider settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Base URL of the quote API.
    pub base_url: String,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Largest number of symbols the real-time quote endpoint accepts.
    pub quote_batch_limit: usize,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://query1.finance.yahoo.com".to_string(),
            user_agent: concat!("price-stream/", env!("CARGO_PKG_VERSION")).to_string(),
            quote_batch_limit: 50,
        }
    }
}

/// Outbound rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Permits per window.
    pub capacity: usize,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Batch fetch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    /// Symbols per provider call.
    pub chunk_size: usize,
    /// Provider calls in flight at once.
    pub max_concurrency: usize,
    /// Timeout for one provider call.
    pub request_timeout: Duration,
    /// Retries after a transient failure.
    pub max_retries: u32,
    /// First retry delay.
    pub initial_backoff: Duration,
    /// Largest retry delay.
    pub max_backoff: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            max_concurrency: 4,
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Scheduler periods and cycle budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    /// Daily close period.
    pub daily_period: Duration,
    /// Daily close cycle budget.
    pub daily_budget: Duration,
    /// How long a daily close cycle keeps fetching.
    pub daily_batch_timeout: Duration,
    /// Real-time period.
    pub realtime_period: Duration,
    /// Real-time cycle budget.
    pub realtime_budget: Duration,
    /// How long a real-time cycle keeps fetching.
    pub realtime_batch_timeout: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            daily_period: Duration::from_secs(86_400),
            daily_budget: Duration::from_secs(600),
            daily_batch_timeout: Duration::from_secs(570),
            realtime_period: Duration::from_secs(5),
            realtime_budget: Duration::from_secs(30),
            realtime_batch_timeout: Duration::from_secs(25),
        }
    }
}

/// Live connection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// Frames buffered per connection.
    pub queue_capacity: usize,
    /// Maximum live connections.
    pub max_connections: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_connections: 100,
        }
    }
}

/// Price cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Time-to-live of cached samples.
    pub ttl: Duration,
    /// Maximum cached samples.
    pub max_entries: u64,
    /// Snapshot file read at startup and written at shutdown.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_entries: 100_000,
            snapshot_path: None,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Symbols to keep priced.
    pub symbols: Vec<Symbol>,
    /// HTTP server settings.
    pub server: ServerSettings,
    /// Quote provider settings.
    pub provider: ProviderSettings,
    /// Outbound rate limit.
    pub rate_limit: RateLimitSettings,
    /// Batch fetch settings.
    pub fetch: FetchSettings,
    /// Scheduler settings.
    pub schedule: ScheduleSettings,
    /// Live connection settings.
    pub broadcast: BroadcastSettings,
    /// Price cache settings.
    pub cache: CacheSettings,
}

impl ServiceConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `PRICE_STREAM_SYMBOLS` is missing or empty, or a
    /// setting is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_symbols = lookup("PRICE_STREAM_SYMBOLS")
            .ok_or_else(|| ConfigError::MissingEnvVar("PRICE_STREAM_SYMBOLS".to_string()))?;
        let symbols = parse_symbols(&raw_symbols);
        if symbols.is_empty() {
            return Err(ConfigError::EmptyValue("PRICE_STREAM_SYMBOLS".to_string()));
        }

        let env = Env(&lookup);

        let server = ServerSettings {
            http_port: env.parse("PRICE_STREAM_HTTP_PORT", ServerSettings::default().http_port),
        };

        let provider_defaults = ProviderSettings::default();
        let provider = ProviderSettings {
            base_url: env
                .string("PRICE_STREAM_PROVIDER_URL")
                .unwrap_or(provider_defaults.base_url),
            user_agent: env
                .string("PRICE_STREAM_PROVIDER_USER_AGENT")
                .unwrap_or(provider_defaults.user_agent),
            quote_batch_limit: env.parse(
                "PRICE_STREAM_QUOTE_BATCH_LIMIT",
                provider_defaults.quote_batch_limit,
            ),
        };

        let rate_limit = RateLimitSettings {
            capacity: env.parse(
                "PRICE_STREAM_RATE_LIMIT",
                RateLimitSettings::default().capacity,
            ),
            window: env.secs(
                "PRICE_STREAM_RATE_WINDOW_SECS",
                RateLimitSettings::default().window,
            ),
        };

        let fetch_defaults = FetchSettings::default();
        let fetch = FetchSettings {
            chunk_size: env.parse("PRICE_STREAM_CHUNK_SIZE", fetch_defaults.chunk_size),
            max_concurrency: env.parse(
                "PRICE_STREAM_MAX_CONCURRENCY",
                fetch_defaults.max_concurrency,
            ),
            request_timeout: env.secs(
                "PRICE_STREAM_REQUEST_TIMEOUT_SECS",
                fetch_defaults.request_timeout,
            ),
            max_retries: env.parse("PRICE_STREAM_MAX_RETRIES", fetch_defaults.max_retries),
            initial_backoff: env.millis(
                "PRICE_STREAM_INITIAL_BACKOFF_MS",
                fetch_defaults.initial_backoff,
            ),
            max_backoff: env.millis("PRICE_STREAM_MAX_BACKOFF_MS", fetch_defaults.max_backoff),
        };

        let schedule_defaults = ScheduleSettings::default();
        let schedule = ScheduleSettings {
            daily_period: env.secs(
                "PRICE_STREAM_DAILY_PERIOD_SECS",
                schedule_defaults.daily_period,
            ),
            daily_budget: env.secs(
                "PRICE_STREAM_DAILY_BUDGET_SECS",
                schedule_defaults.daily_budget,
            ),
            daily_batch_timeout: env.secs(
                "PRICE_STREAM_DAILY_BATCH_TIMEOUT_SECS",
                schedule_defaults.daily_batch_timeout,
            ),
            realtime_period: env.millis(
                "PRICE_STREAM_REALTIME_PERIOD_MS",
                schedule_defaults.realtime_period,
            ),
            realtime_budget: env.secs(
                "PRICE_STREAM_REALTIME_BUDGET_SECS",
                schedule_defaults.realtime_budget,
            ),
            realtime_batch_timeout: env.secs(
                "PRICE_STREAM_REALTIME_BATCH_TIMEOUT_SECS",
                schedule_defaults.realtime_batch_timeout,
            ),
        };

        let broadcast = BroadcastSettings {
            queue_capacity: env.parse(
                "PRICE_STREAM_QUEUE_CAPACITY",
                BroadcastSettings::default().queue_capacity,
            ),
            max_connections: env.parse(
                "PRICE_STREAM_MAX_CONNECTIONS",
                BroadcastSettings::default().max_connections,
            ),
        };

        let cache_defaults = CacheSettings::default();
        let cache = CacheSettings {
            ttl: env.secs("PRICE_STREAM_CACHE_TTL_SECS", cache_defaults.ttl),
            max_entries: env.parse("PRICE_STREAM_CACHE_MAX_ENTRIES", cache_defaults.max_entries),
            snapshot_path: env.string("PRICE_STREAM_SNAPSHOT_PATH").map(PathBuf::from),
        };

        let config = Self {
            symbols,
            server,
            provider,
            rate_limit,
            fetch,
            schedule,
            broadcast,
            cache,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first out-of-range value,
    /// including a job whose batch timeout does not leave room inside its
    /// cycle budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("PRICE_STREAM_RATE_LIMIT", self.rate_limit.capacity == 0),
            ("PRICE_STREAM_RATE_WINDOW_SECS", self.rate_limit.window.is_zero()),
            ("PRICE_STREAM_CHUNK_SIZE", self.fetch.chunk_size == 0),
            ("PRICE_STREAM_MAX_CONCURRENCY", self.fetch.max_concurrency == 0),
            ("PRICE_STREAM_QUOTE_BATCH_LIMIT", self.provider.quote_batch_limit == 0),
            ("PRICE_STREAM_REQUEST_TIMEOUT_SECS", self.fetch.request_timeout.is_zero()),
            ("PRICE_STREAM_DAILY_PERIOD_SECS", self.schedule.daily_period.is_zero()),
            ("PRICE_STREAM_REALTIME_PERIOD_MS", self.schedule.realtime_period.is_zero()),
            ("PRICE_STREAM_DAILY_BUDGET_SECS", self.schedule.daily_budget.is_zero()),
            ("PRICE_STREAM_REALTIME_BUDGET_SECS", self.schedule.realtime_budget.is_zero()),
            (
                "PRICE_STREAM_DAILY_BATCH_TIMEOUT_SECS",
                self.schedule.daily_batch_timeout.is_zero(),
            ),
            (
                "PRICE_STREAM_REALTIME_BATCH_TIMEOUT_SECS",
                self.schedule.realtime_batch_timeout.is_zero(),
            ),
            ("PRICE_STREAM_QUEUE_CAPACITY", self.broadcast.queue_capacity == 0),
            ("PRICE_STREAM_MAX_CONNECTIONS", self.broadcast.max_connections == 0),
        ];

        if let Some((key, _)) = checks.iter().find(|(_, invalid)| *invalid) {
            return Err(ConfigError::Invalid {
                key: (*key).to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        let windows = [
            (
                "PRICE_STREAM_DAILY_BATCH_TIMEOUT_SECS",
                self.schedule.daily_batch_timeout,
                self.schedule.daily_budget,
            ),
            (
                "PRICE_STREAM_REALTIME_BATCH_TIMEOUT_SECS",
                self.schedule.realtime_batch_timeout,
                self.schedule.realtime_budget,
            ),
        ];
        match windows.iter().find(|(_, batch, budget)| batch >= budget) {
            Some((key, _, budget)) => Err(ConfigError::Invalid {
                key: (*key).to_string(),
                reason: format!("must be shorter than the cycle budget of {}s", budget.as_secs()),
            }),
            None => Ok(()),
        }
    }

    /// Rate limiter configuration.
    #[must_use]
    pub const fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            capacity: self.rate_limit.capacity,
            window: self.rate_limit.window,
        }
    }

    /// Fetcher configuration.
    #[must_use]
    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            chunk_size: self.fetch.chunk_size,
            max_concurrency: self.fetch.max_concurrency,
            request_timeout: self.fetch.request_timeout,
            batch_timeout: self.schedule.realtime_batch_timeout,
            retry: RetryConfig {
                max_retries: self.fetch.max_retries,
                initial_backoff: self.fetch.initial_backoff,
                max_backoff: self.fetch.max_backoff,
                ..RetryConfig::default()
            },
        }
    }

    /// Scheduler configuration.
    #[must_use]
    pub const fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            daily: JobSettings {
                period: self.schedule.daily_period,
                budget: self.schedule.daily_budget,
                batch_timeout: self.schedule.daily_batch_timeout,
            },
            realtime: JobSettings {
                period: self.schedule.realtime_period,
                budget: self.schedule.realtime_budget,
                batch_timeout: self.schedule.realtime_batch_timeout,
            },
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Value is out of range.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Parse a comma-separated symbol list, dropping blanks and duplicates.
fn parse_symbols(raw: &str) -> Vec<Symbol> {
    let mut symbols: Vec<Symbol> = raw
        .split(',')
        .map(Symbol::new)
        .filter(|symbol| !symbol.is_empty())
        .collect();
    symbols.sort();
    symbols.dedup();
    symbols
}

/// Typed reads over a key lookup.
struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.string(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
