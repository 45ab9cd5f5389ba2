//! Configuration Module
//!
//! Configuration loading for the price stream service.

mod settings;

pub use settings::{
    BroadcastSettings, CacheSettings, ConfigError, FetchSettings, ProviderSettings,
    RateLimitSettings, ScheduleSettings, ServerSettings, ServiceConfig,
};
