//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `RateLimiter`: Shared sliding-window permit budget for provider calls
//! - `PriceFetcher`: Chunked, retried, deadline-bounded batch fetches
//! - `PriceStore`: Last known price per symbol
//! - `PricePipeline`: One fetch → apply → cache → publish cycle
//! - `UpdateScheduler`: Daily-close and real-time periodic jobs

pub mod backoff;
pub mod fetcher;
pub mod pipeline;
pub mod price_store;
pub mod rate_limiter;
pub mod scheduler;

pub use backoff::{BackoffPolicy, RetryConfig};
pub use fetcher::{FetcherConfig, PermitMode, PriceFetcher};
pub use pipeline::{CycleError, CycleReport, PricePipeline};
pub use price_store::{LastFailure, PriceStore, StoreStats};
pub use rate_limiter::{RateLimitError, RateLimiter, RateLimiterConfig};
pub use scheduler::{
    JobError, JobKind, JobSettings, JobState, JobStatus, SchedulerConfig, UpdateScheduler,
};
