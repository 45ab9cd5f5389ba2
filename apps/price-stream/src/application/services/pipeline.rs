//! Price Pipeline
//!
//! One update cycle: list the universe, fetch, apply to the store, write
//! applied samples through to the cache, and publish genuine changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::fetcher::{PermitMode, PriceFetcher};
use super::price_store::PriceStore;
use crate::application::ports::{CatalogError, CatalogPort, PriceCachePort, PricePublisher};
use crate::domain::pricing::{
    ChangeOutcome, FailureReason, FetchOutcome, FetchResult, IgnoreReason, PriceKind, Symbol,
};
use crate::infrastructure::metrics;

/// Errors that abort a cycle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CycleError {
    /// The symbol universe could not be listed.
    #[error("universe unavailable: {0}")]
    Catalog(#[from] CatalogError),
}

/// Counters for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Price kind fetched.
    pub kind: PriceKind,
    /// Distinct symbols requested.
    pub requested: usize,
    /// Results that created or advanced a record.
    pub applied: usize,
    /// Results ignored as stale.
    pub stale: usize,
    /// Symbols that failed to fetch.
    pub failed: usize,
    /// Messages published.
    pub broadcast: usize,
    /// Frames handed to connections across all messages.
    pub delivered: usize,
}

impl CycleReport {
    const fn new(kind: PriceKind, requested: usize) -> Self {
        Self {
            kind,
            requested,
            applied: 0,
            stale: 0,
            failed: 0,
            broadcast: 0,
            delivered: 0,
        }
    }
}

/// Wiring of the update path shared by both scheduler jobs.
pub struct PricePipeline {
    catalog: Arc<dyn CatalogPort>,
    fetcher: Arc<PriceFetcher>,
    store: Arc<PriceStore>,
    cache: Arc<dyn PriceCachePort>,
    publisher: Arc<dyn PricePublisher>,
    resume_points: Mutex<HashMap<PriceKind, Symbol>>,
}

impl PricePipeline {
    /// Create a pipeline.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn CatalogPort>,
        fetcher: Arc<PriceFetcher>,
        store: Arc<PriceStore>,
        cache: Arc<dyn PriceCachePort>,
        publisher: Arc<dyn PricePublisher>,
    ) -> Self {
        Self {
            catalog,
            fetcher,
            store,
            cache,
            publisher,
            resume_points: Mutex::new(HashMap::new()),
        }
    }

    /// The store this pipeline writes to.
    #[must_use]
    pub const fn store(&self) -> &Arc<PriceStore> {
        &self.store
    }

    /// Run one cycle for `kind`, fetching until `deadline`.
    ///
    /// Results are applied, written through and published chunk by chunk
    /// while the fetch is still running, so an abandoned cycle keeps
    /// everything applied up to that point. The universe is walked starting
    /// from the first symbol the previous cycle of the same kind left
    /// unresolved.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError::Catalog`] if the universe cannot be listed.
    /// Per-symbol failures are counted in the report instead.
    pub async fn run_cycle(
        &self,
        kind: PriceKind,
        mode: PermitMode,
        deadline: Instant,
    ) -> Result<CycleReport, CycleError> {
        let mut symbols = self.universe().await?;
        let resume_from = self.resume_points.lock().get(&kind).cloned();
        if let Some(resume_from) = resume_from {
            let start = symbols.partition_point(|symbol| *symbol < resume_from);
            symbols.rotate_left(start);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<FetchResult>>();
        let fetch = self
            .fetcher
            .fetch_each(&symbols, kind, mode, deadline, move |chunk| {
                // The receiver lives until the fetch finishes.
                let _ = tx.send(chunk);
            });
        let apply = async {
            let mut report = CycleReport::new(kind, 0);
            let mut unresolved = HashSet::new();
            while let Some(chunk) = rx.recv().await {
                for result in chunk {
                    if matches!(
                        result.outcome,
                        FetchOutcome::Failed(FailureReason::Timeout | FailureReason::Throttled)
                    ) {
                        unresolved.insert(result.symbol.clone());
                    }
                    self.apply_result(result, &mut report).await;
                }
            }
            (report, unresolved)
        };
        let (requested, (mut report, unresolved)) = tokio::join!(fetch, apply);
        report.requested = requested;

        let next = symbols
            .into_iter()
            .find(|symbol| unresolved.contains(symbol));
        match next {
            Some(symbol) => {
                tracing::debug!(kind = %kind, resume_from = %symbol, "Next cycle resumes mid-universe");
                self.resume_points.lock().insert(kind, symbol);
            }
            None => {
                self.resume_points.lock().remove(&kind);
            }
        }

        metrics::set_tracked_symbols(self.store.len());
        Ok(report)
    }

    async fn apply_result(&self, result: FetchResult, report: &mut CycleReport) {
        let kind = report.kind;
        match self.store.apply(result) {
            ChangeOutcome::Applied(change) => {
                report.applied += 1;
                metrics::record_store_applied(kind);

                if let Err(error) = self.cache.put(change.current.clone()).await {
                    tracing::warn!(
                        symbol = %change.current.symbol,
                        error = %error,
                        "Failed to write price to cache"
                    );
                }

                if change.value_changed() {
                    let published = self.publisher.publish(&change.to_message());
                    report.broadcast += 1;
                    report.delivered += published.delivered;
                }
            }
            ChangeOutcome::Ignored(reason) => {
                metrics::record_store_ignored(kind, reason);
                match reason {
                    IgnoreReason::Stale => report.stale += 1,
                    IgnoreReason::FetchFailed => report.failed += 1,
                }
            }
        }
    }

    /// Seed the store from the cache for every tracked symbol.
    ///
    /// Returns how many samples were restored.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError::Catalog`] if the universe cannot be listed.
    pub async fn restore_from_cache(&self) -> Result<usize, CycleError> {
        let symbols = self.universe().await?;
        let mut restored = 0;

        for symbol in &symbols {
            for kind in PriceKind::all() {
                match self.cache.get(symbol, *kind).await {
                    Ok(Some(sample)) => {
                        if self.store.restore(sample) {
                            restored += 1;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(
                            symbol = %symbol,
                            kind = %kind,
                            error = %error,
                            "Failed to read cached price"
                        );
                    }
                }
            }
        }

        metrics::set_tracked_symbols(self.store.len());
        Ok(restored)
    }

    async fn universe(&self) -> Result<Vec<Symbol>, CycleError> {
        let mut symbols: Vec<Symbol> = self
            .catalog
            .list_tracked_symbols()
            .await?
            .into_iter()
            .filter(|symbol| !symbol.is_empty())
            .collect();
        symbols.sort();
        Ok(symbols)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::{
        MockCatalogPort, MockPriceCachePort, MockPriceProviderPort, ProviderBatch, PublishReport,
    };
    use crate::application::services::fetcher::FetcherConfig;
    use crate::application::services::rate_limiter::{RateLimiter, RateLimiterConfig};
    use crate::domain::pricing::{BroadcastMessage, PriceSample};

    #[derive(Default)]
    struct RecordingPublisher {
        messages: Mutex<Vec<BroadcastMessage>>,
    }

    impl PricePublisher for RecordingPublisher {
        fn publish(&self, message: &BroadcastMessage) -> PublishReport {
            self.messages.lock().push(message.clone());
            PublishReport {
                delivered: 2,
                removed: 0,
            }
        }
    }

    fn catalog(symbols: &[&str]) -> MockCatalogPort {
        let symbols: HashSet<Symbol> = symbols.iter().map(|s| Symbol::new(*s)).collect();
        let mut catalog = MockCatalogPort::new();
        catalog
            .expect_list_tracked_symbols()
            .returning(move || Ok(symbols.clone()));
        catalog
    }

    /// Provider quoting a fixed price with a timestamp one second later per call.
    fn provider(cents: i64) -> MockPriceProviderPort {
        let clock = AtomicI64::new(0);
        let mut provider = MockPriceProviderPort::new();
        provider.expect_max_batch().return_const(50usize);
        provider.expect_fetch_prices().returning(move |symbols, kind| {
            let secs = clock.fetch_add(1, Ordering::SeqCst);
            let observed_at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
            let batch: ProviderBatch = symbols
                .iter()
                .filter(|s| s.as_str() != "ZZZZ")
                .map(|s| {
                    let sample = PriceSample::new(s.clone(), Decimal::new(cents, 2), observed_at, kind);
                    (s.clone(), Ok(sample))
                })
                .collect();
            Ok(batch)
        });
        provider
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    fn permissive_cache() -> MockPriceCachePort {
        let mut cache = MockPriceCachePort::new();
        cache.expect_put().returning(|_| Ok(()));
        cache.expect_get().returning(|_, _| Ok(None));
        cache
    }

    fn fetcher(provider: MockPriceProviderPort) -> Arc<PriceFetcher> {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            capacity: 100,
            window: Duration::from_secs(60),
        }));
        Arc::new(PriceFetcher::new(
            Arc::new(provider),
            limiter,
            FetcherConfig::default(),
        ))
    }

    fn pipeline(
        catalog: MockCatalogPort,
        provider: MockPriceProviderPort,
        cache: MockPriceCachePort,
        publisher: Arc<RecordingPublisher>,
    ) -> PricePipeline {
        PricePipeline::new(
            Arc::new(catalog),
            fetcher(provider),
            Arc::new(PriceStore::new()),
            Arc::new(cache),
            publisher,
        )
    }

    #[tokio::test]
    async fn cycle_applies_and_publishes() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pipeline = pipeline(
            catalog(&["AAPL", "MSFT"]),
            provider(15000),
            permissive_cache(),
            Arc::clone(&publisher),
        );

        let report = pipeline
            .run_cycle(PriceKind::Realtime, PermitMode::Wait, deadline())
            .await
            .unwrap();

        assert_eq!(report.requested, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(report.broadcast, 2);
        assert_eq!(report.delivered, 4);
        assert_eq!(publisher.messages.lock().len(), 2);
        assert_eq!(pipeline.store().len(), 2);
    }

    #[tokio::test]
    async fn unchanged_value_is_applied_but_not_broadcast() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pipeline = pipeline(
            catalog(&["AAPL"]),
            provider(15000),
            permissive_cache(),
            Arc::clone(&publisher),
        );

        pipeline
            .run_cycle(PriceKind::Realtime, PermitMode::Wait, deadline())
            .await
            .unwrap();
        let second = pipeline
            .run_cycle(PriceKind::Realtime, PermitMode::Wait, deadline())
            .await
            .unwrap();

        assert_eq!(second.applied, 1);
        assert_eq!(second.broadcast, 0);
        assert_eq!(publisher.messages.lock().len(), 1);
    }

    #[tokio::test]
    async fn missing_symbol_counts_as_failure() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pipeline = pipeline(
            catalog(&["AAPL", "ZZZZ"]),
            provider(15000),
            permissive_cache(),
            Arc::clone(&publisher),
        );

        let report = pipeline
            .run_cycle(PriceKind::DailyClose, PermitMode::Wait, deadline())
            .await
            .unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        let messages = publisher.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].symbol, Symbol::new("AAPL"));
        assert!(pipeline.store().get(&Symbol::new("ZZZZ")).is_none());
    }

    #[tokio::test]
    async fn catalog_failure_aborts_cycle() {
        let mut catalog = MockCatalogPort::new();
        catalog.expect_list_tracked_symbols().returning(|| {
            Err(CatalogError::Unavailable {
                message: "database down".to_string(),
            })
        });
        let mut provider = MockPriceProviderPort::new();
        provider.expect_fetch_prices().never();

        let pipeline = pipeline(
            catalog,
            provider,
            permissive_cache(),
            Arc::new(RecordingPublisher::default()),
        );

        let result = pipeline
            .run_cycle(PriceKind::Realtime, PermitMode::Skip, deadline())
            .await;
        assert!(matches!(result, Err(CycleError::Catalog(_))));
    }

    #[tokio::test]
    async fn applied_samples_are_written_through() {
        let mut cache = MockPriceCachePort::new();
        cache
            .expect_put()
            .times(2)
            .withf(|sample| sample.kind == PriceKind::DailyClose)
            .returning(|_| Ok(()));

        let pipeline = pipeline(
            catalog(&["AAPL", "MSFT"]),
            provider(15000),
            cache,
            Arc::new(RecordingPublisher::default()),
        );

        pipeline
            .run_cycle(PriceKind::DailyClose, PermitMode::Wait, deadline())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn next_cycle_resumes_where_the_deadline_cut_off() {
        let names: Vec<String> = (0..30).map(|i| format!("S{i:02}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();

        let mut provider = MockPriceProviderPort::new();
        provider.expect_max_batch().return_const(1usize);
        provider.expect_fetch_prices().returning(|symbols, kind| {
            Ok(symbols
                .iter()
                .map(|s| {
                    let sample = PriceSample::new(s.clone(), Decimal::ONE, Utc::now(), kind);
                    (s.clone(), Ok(sample))
                })
                .collect())
        });
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            capacity: 10,
            window: Duration::from_secs(60),
        }));
        let pipeline = PricePipeline::new(
            Arc::new(catalog(&refs)),
            Arc::new(PriceFetcher::new(
                Arc::new(provider),
                limiter,
                FetcherConfig::default(),
            )),
            Arc::new(PriceStore::new()),
            Arc::new(permissive_cache()),
            Arc::new(RecordingPublisher::default()),
        );
        let has = |name: &str| pipeline.store().get(&Symbol::new(name)).is_some();

        let first = pipeline
            .run_cycle(PriceKind::DailyClose, PermitMode::Wait, deadline())
            .await
            .unwrap();
        assert_eq!((first.requested, first.applied, first.failed), (30, 10, 20));
        assert!(has("S09") && !has("S10"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        let second = pipeline
            .run_cycle(PriceKind::DailyClose, PermitMode::Wait, deadline())
            .await
            .unwrap();
        assert_eq!(second.applied, 10);
        assert!(has("S19") && !has("S20"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        pipeline
            .run_cycle(PriceKind::DailyClose, PermitMode::Wait, deadline())
            .await
            .unwrap();
        assert!(refs.iter().all(|name| has(name)));
    }

    #[tokio::test]
    async fn restore_seeds_store_from_cache() {
        let mut cache = MockPriceCachePort::new();
        cache.expect_get().returning(|symbol, kind| {
            if kind == PriceKind::DailyClose {
                Ok(Some(PriceSample::new(
                    symbol.clone(),
                    Decimal::new(14900, 2),
                    Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
                    kind,
                )))
            } else {
                Ok(None)
            }
        });

        let publisher = Arc::new(RecordingPublisher::default());
        let pipeline = pipeline(
            catalog(&["AAPL", "MSFT"]),
            MockPriceProviderPort::new(),
            cache,
            Arc::clone(&publisher),
        );

        let restored = pipeline.restore_from_cache().await.unwrap();

        assert_eq!(restored, 2);
        assert_eq!(pipeline.store().stats().restored, 2);
        assert!(publisher.messages.lock().is_empty());
    }
}
