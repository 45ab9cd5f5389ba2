//! Price Cache Port (Driven Port)
//!
//! Write-through cache of last known prices, read back at startup.

use async_trait::async_trait;

use crate::domain::pricing::{PriceKind, PriceSample, Symbol};

/// Cache error.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Snapshot file could not be read or written.
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot contents could not be encoded or decoded.
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Port for caching the latest sample per symbol and kind.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceCachePort: Send + Sync {
    /// Cached sample, if present and not expired.
    async fn get(
        &self,
        symbol: &Symbol,
        kind: PriceKind,
    ) -> Result<Option<PriceSample>, CacheError>;

    /// Store a sample under its symbol and kind.
    async fn put(&self, sample: PriceSample) -> Result<(), CacheError>;
}
