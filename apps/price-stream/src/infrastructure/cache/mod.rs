//! Price Cache
//!
//! In-process cache of the latest sample per symbol and kind, with a
//! time-to-live. The pipeline writes through it on every applied change and
//! reads it back at startup so dashboards see last known prices before the
//! first provider cycle completes.
//!
//! The cache can be persisted to a JSON snapshot file across restarts. Each
//! entry keeps the wall-clock time it was cached, so a restored sample only
//! lives for what is left of its TTL and samples already past it are skipped.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::Expiry;
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::application::ports::{CacheError, PriceCachePort};
use crate::domain::pricing::{PriceKind, PriceSample, Symbol};
use crate::infrastructure::config::CacheSettings;

/// Price cache backed by [`moka`].
#[derive(Clone)]
pub struct MokaPriceCache {
    inner: Cache<CacheKey, CachedSample>,
    ttl: Duration,
}

type CacheKey = (Symbol, PriceKind);

/// Snapshot entry: a sample and when it entered the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedSample {
    sample: PriceSample,
    cached_at: DateTime<Utc>,
}

impl CachedSample {
    fn remaining(&self, ttl: Duration) -> Duration {
        let age = (Utc::now() - self.cached_at).to_std().unwrap_or(Duration::ZERO);
        ttl.saturating_sub(age)
    }
}

/// Expires an entry `ttl` after its `cached_at`, including across restarts.
struct RemainingTtl {
    ttl: Duration,
}

impl Expiry<CacheKey, CachedSample> for RemainingTtl {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CachedSample,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.remaining(self.ttl))
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CachedSample,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.remaining(self.ttl))
    }
}

impl std::fmt::Debug for MokaPriceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaPriceCache")
            .field("entries", &self.inner.entry_count())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl MokaPriceCache {
    /// Create a cache holding at most `max_entries` samples for `ttl` each.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(RemainingTtl { ttl })
            .build();
        Self { inner, ttl }
    }

    /// Create a cache from settings.
    #[must_use]
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.ttl, settings.max_entries)
    }

    /// Every live entry, ordered by symbol then kind.
    fn cached_entries(&self) -> Vec<CachedSample> {
        let mut entries: Vec<CachedSample> = self
            .inner
            .iter()
            .map(|(_, entry)| entry)
            .filter(|entry| !entry.remaining(self.ttl).is_zero())
            .collect();
        entries.sort_by(|a, b| {
            a.sample
                .symbol
                .cmp(&b.sample.symbol)
                .then_with(|| a.sample.kind.as_str().cmp(b.sample.kind.as_str()))
        });
        entries
    }

    /// Approximate number of cached samples.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Write every live sample to `path` as JSON.
    ///
    /// Returns the number of samples written.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if encoding or writing fails.
    pub async fn save_snapshot(&self, path: &Path) -> Result<usize, CacheError> {
        let entries = self.cached_entries();
        let encoded = serde_json::to_vec_pretty(&entries)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a sibling file first so a crash never leaves a torn snapshot.
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, encoded).await?;
        tokio::fs::rename(&staging, path).await?;

        tracing::info!(path = %path.display(), samples = entries.len(), "Price snapshot saved");
        Ok(entries.len())
    }

    /// Load samples from a snapshot written by [`Self::save_snapshot`].
    ///
    /// A missing file loads nothing. Samples cached longer than the TTL ago
    /// are skipped. Returns the number of samples loaded.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the file cannot be read or decoded.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize, CacheError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No price snapshot found");
                return Ok(0);
            }
            Err(error) => return Err(error.into()),
        };

        let entries: Vec<CachedSample> = serde_json::from_slice(&bytes)?;
        let mut loaded = 0;
        let mut expired = 0;
        for entry in entries {
            if entry.sample.symbol.is_empty() {
                continue;
            }
            if entry.remaining(self.ttl).is_zero() {
                expired += 1;
                continue;
            }
            let key = (entry.sample.symbol.clone(), entry.sample.kind);
            self.inner.insert(key, entry).await;
            loaded += 1;
        }

        tracing::info!(path = %path.display(), samples = loaded, expired, "Price snapshot loaded");
        Ok(loaded)
    }
}

#[async_trait]
impl PriceCachePort for MokaPriceCache {
    async fn get(
        &self,
        symbol: &Symbol,
        kind: PriceKind,
    ) -> Result<Option<PriceSample>, CacheError> {
        Ok(self
            .inner
            .get(&(symbol.clone(), kind))
            .await
            .map(|entry| entry.sample))
    }

    async fn put(&self, sample: PriceSample) -> Result<(), CacheError> {
        let key = (sample.symbol.clone(), sample.kind);
        let entry = CachedSample {
            sample,
            cached_at: Utc::now(),
        };
        self.inner.insert(key, entry).await;
        Ok(())
    }
}
