//! Price Fetcher
//!
//! Fetches a batch of symbols from the provider and returns exactly one
//! [`FetchResult`] per distinct symbol.
//!
//! # Flow
//!
//! ```text
//! symbols ─► dedupe ─► chunks ─► (permit ─► call ─► retry?)* ─► results
//!                                   ▲  up to max_concurrency at once
//! ```
//!
//! A failing chunk only fails its own symbols. Anything still unresolved
//! when the batch deadline passes is reported as a timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;

use super::backoff::{BackoffPolicy, RetryConfig};
use super::rate_limiter::RateLimiter;
use crate::application::ports::{PriceProviderPort, ProviderError};
use crate::domain::pricing::{FailureReason, FetchOutcome, FetchResult, PriceKind, Symbol};
use crate::infrastructure::metrics;

/// How a fetch obtains rate-limit permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitMode {
    /// Wait for a permit.
    Wait,
    /// Take a permit only if one is free; otherwise fail the chunk as throttled.
    Skip,
}

/// Fetcher configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FetcherConfig {
    /// Upper bound for symbols per provider call.
    pub chunk_size: usize,
    /// Provider calls in flight at once.
    pub max_concurrency: usize,
    /// Timeout for one provider call.
    pub request_timeout: Duration,
    /// Deadline of [`PriceFetcher::fetch_batch`]. Scheduled cycles pass
    /// their job's own deadline to [`PriceFetcher::fetch_each`].
    pub batch_timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            max_concurrency: 4,
            request_timeout: Duration::from_secs(10),
            batch_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Batch price fetcher.
pub struct PriceFetcher {
    provider: Arc<dyn PriceProviderPort>,
    limiter: Arc<RateLimiter>,
    config: FetcherConfig,
}

impl PriceFetcher {
    /// Create a fetcher.
    #[must_use]
    pub fn new(
        provider: Arc<dyn PriceProviderPort>,
        limiter: Arc<RateLimiter>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            provider,
            limiter,
            config,
        }
    }

    /// Fetcher configuration.
    #[must_use]
    pub const fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Fetch prices of `kind` for `symbols`, bounded by the configured
    /// batch timeout.
    ///
    /// Duplicate symbols are fetched once. The result holds one entry per
    /// distinct symbol, in no particular order.
    pub async fn fetch_batch(
        &self,
        symbols: &[Symbol],
        kind: PriceKind,
        mode: PermitMode,
    ) -> Vec<FetchResult> {
        let deadline = Instant::now() + self.config.batch_timeout;
        let mut results = Vec::with_capacity(symbols.len());
        self.fetch_each(symbols, kind, mode, deadline, |chunk| results.extend(chunk))
            .await;
        results
    }

    /// Fetch prices of `kind` for `symbols`, handing each chunk's results to
    /// `on_chunk` as soon as that chunk finishes.
    ///
    /// Symbols still unresolved at `deadline` are handed over last as
    /// [`FailureReason::Timeout`]. Every distinct symbol is handed over
    /// exactly once; the return value is their count.
    pub async fn fetch_each<F>(
        &self,
        symbols: &[Symbol],
        kind: PriceKind,
        mode: PermitMode,
        deadline: Instant,
        mut on_chunk: F,
    ) -> usize
    where
        F: FnMut(Vec<FetchResult>) + Send,
    {
        let mut seen = HashSet::with_capacity(symbols.len());
        let unique: Vec<Symbol> = symbols
            .iter()
            .filter(|symbol| seen.insert(*symbol))
            .cloned()
            .collect();
        if unique.is_empty() {
            return 0;
        }

        let chunk_size = self
            .config
            .chunk_size
            .min(self.provider.max_batch(kind))
            .max(1);
        let chunks: Vec<Vec<Symbol>> = unique.chunks(chunk_size).map(<[Symbol]>::to_vec).collect();

        let mut unresolved: HashSet<Symbol> = unique.iter().cloned().collect();
        let mut in_flight = futures::stream::iter(chunks)
            .map(|chunk| self.fetch_chunk(chunk, kind, mode))
            .buffer_unordered(self.config.max_concurrency.max(1));

        loop {
            match tokio::time::timeout_at(deadline, in_flight.next()).await {
                Ok(Some(results)) => {
                    for result in &results {
                        unresolved.remove(&result.symbol);
                        record_result(kind, result);
                    }
                    on_chunk(results);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        kind = %kind,
                        unresolved = unresolved.len(),
                        requested = unique.len(),
                        "Batch deadline exceeded"
                    );
                    break;
                }
            }
        }
        drop(in_flight);

        let requested = unique.len();
        if !unresolved.is_empty() {
            let timed_out: Vec<FetchResult> = unique
                .into_iter()
                .filter(|symbol| unresolved.contains(symbol))
                .map(|symbol| FetchResult::failed(symbol, FailureReason::Timeout))
                .collect();
            for result in &timed_out {
                record_result(kind, result);
            }
            on_chunk(timed_out);
        }
        requested
    }

    /// Fetch one chunk, retrying transient failures of the symbols still pending.
    async fn fetch_chunk(
        &self,
        chunk: Vec<Symbol>,
        kind: PriceKind,
        mode: PermitMode,
    ) -> Vec<FetchResult> {
        let mut backoff = BackoffPolicy::new(self.config.retry.clone());
        let mut done = Vec::with_capacity(chunk.len());
        let mut pending = chunk;

        loop {
            if !self.permit(mode).await {
                metrics::record_provider_call(kind, "throttled");
                done.extend(
                    pending
                        .into_iter()
                        .map(|symbol| FetchResult::failed(symbol, FailureReason::Throttled)),
                );
                return done;
            }

            let call = tokio::time::timeout(
                self.config.request_timeout,
                self.provider.fetch_prices(&pending, kind),
            )
            .await
            .unwrap_or(Err(ProviderError::Timeout));

            let (retry, last_error) = match call {
                Ok(mut batch) => {
                    metrics::record_provider_call(kind, "ok");
                    let mut retry = Vec::new();
                    let mut last_error = None;
                    for symbol in pending {
                        match batch.remove(&symbol) {
                            Some(Ok(sample)) => done.push(FetchResult {
                                symbol,
                                outcome: FetchOutcome::Ok(sample),
                            }),
                            Some(Err(error)) if error.is_retryable() => {
                                retry.push(symbol);
                                last_error = Some(error);
                            }
                            Some(Err(error)) => {
                                done.push(FetchResult::failed(symbol, error.to_failure()));
                            }
                            None => done.push(FetchResult::failed(
                                symbol,
                                FailureReason::Permanent("unknown symbol".to_string()),
                            )),
                        }
                    }
                    (retry, last_error)
                }
                Err(error) if error.is_retryable() => {
                    metrics::record_provider_call(kind, "transient");
                    (pending, Some(error))
                }
                Err(error) => {
                    metrics::record_provider_call(kind, "permanent");
                    tracing::warn!(
                        kind = %kind,
                        symbols = pending.len(),
                        error = %error,
                        "Provider rejected chunk"
                    );
                    let reason = error.to_failure();
                    done.extend(
                        pending
                            .into_iter()
                            .map(|symbol| FetchResult::failed(symbol, reason.clone())),
                    );
                    return done;
                }
            };

            pending = retry;
            let Some(error) = last_error.filter(|_| !pending.is_empty()) else {
                return done;
            };

            if let Some(delay) = backoff.next_delay() {
                tracing::debug!(
                    kind = %kind,
                    symbols = pending.len(),
                    attempt = backoff.retries(),
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Retrying provider call"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            tracing::warn!(
                kind = %kind,
                symbols = pending.len(),
                retries = backoff.retries(),
                error = %error,
                "Provider call failed after retries"
            );
            let reason = error.to_failure();
            done.extend(
                pending
                    .into_iter()
                    .map(|symbol| FetchResult::failed(symbol, reason.clone())),
            );
            return done;
        }
    }

    async fn permit(&self, mode: PermitMode) -> bool {
        match mode {
            PermitMode::Wait => match self.limiter.acquire(1).await {
                Ok(waited) => {
                    if !waited.is_zero() {
                        metrics::record_rate_limit_wait(waited);
                    }
                    true
                }
                Err(error) => {
                    tracing::warn!(error = %error, "Rate limiter refused permit");
                    false
                }
            },
            PermitMode::Skip => self.limiter.try_acquire(1).unwrap_or(false),
        }
    }
}

fn record_result(kind: PriceKind, result: &FetchResult) {
    match &result.outcome {
        FetchOutcome::Ok(_) => metrics::record_fetch_ok(kind),
        FetchOutcome::Failed(reason) => metrics::record_fetch_failed(kind, reason),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::{MockPriceProviderPort, ProviderBatch};
    use crate::application::services::rate_limiter::RateLimiterConfig;
    use crate::domain::pricing::PriceSample;

    type Script = dyn Fn(&[Symbol], usize) -> Result<ProviderBatch, ProviderError> + Send + Sync;

    /// Provider driven by a closure of (symbols, call index).
    struct ScriptedProvider {
        max_batch: usize,
        slow: HashSet<Symbol>,
        calls: AtomicUsize,
        script: Box<Script>,
    }

    impl ScriptedProvider {
        fn new(
            max_batch: usize,
            script: impl Fn(&[Symbol], usize) -> Result<ProviderBatch, ProviderError>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                max_batch,
                slow: HashSet::new(),
                calls: AtomicUsize::new(0),
                script: Box::new(script),
            }
        }

        fn with_slow(mut self, symbol: &str) -> Self {
            self.slow.insert(Symbol::new(symbol));
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PriceProviderPort for ScriptedProvider {
        async fn fetch_prices(
            &self,
            symbols: &[Symbol],
            _kind: PriceKind,
        ) -> Result<ProviderBatch, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if symbols.iter().any(|s| self.slow.contains(s)) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            (self.script)(symbols, call)
        }

        fn max_batch(&self, _kind: PriceKind) -> usize {
            self.max_batch
        }
    }

    fn sample(symbol: &Symbol) -> PriceSample {
        PriceSample::new(
            symbol.clone(),
            Decimal::new(15000, 2),
            Utc::now(),
            PriceKind::Realtime,
        )
    }

    fn all_ok(symbols: &[Symbol]) -> ProviderBatch {
        symbols.iter().map(|s| (s.clone(), Ok(sample(s)))).collect()
    }

    fn symbols(raw: &[&str]) -> Vec<Symbol> {
        raw.iter().map(|s| Symbol::new(*s)).collect()
    }

    fn config() -> FetcherConfig {
        FetcherConfig {
            chunk_size: 10,
            max_concurrency: 2,
            request_timeout: Duration::from_secs(1),
            batch_timeout: Duration::from_secs(30),
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(100),
                ..RetryConfig::default().without_jitter()
            },
        }
    }

    fn limiter(capacity: usize) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimiterConfig {
            capacity,
            window: Duration::from_secs(60),
        }))
    }

    fn outcome_of<'a>(results: &'a [FetchResult], symbol: &str) -> &'a FetchOutcome {
        &results
            .iter()
            .find(|r| r.symbol.as_str() == symbol)
            .unwrap()
            .outcome
    }

    #[tokio::test(start_paused = true)]
    async fn one_result_per_distinct_symbol() {
        let provider = Arc::new(ScriptedProvider::new(10, |symbols, _| Ok(all_ok(symbols))));
        let fetcher = PriceFetcher::new(provider.clone(), limiter(100), config());

        let results = fetcher
            .fetch_batch(
                &symbols(&["AAPL", "MSFT", "AAPL"]),
                PriceKind::Realtime,
                PermitMode::Wait,
            )
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(FetchResult::is_ok));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_makes_no_calls() {
        let provider = Arc::new(ScriptedProvider::new(10, |symbols, _| Ok(all_ok(symbols))));
        let fetcher = PriceFetcher::new(provider.clone(), limiter(100), config());

        let results = fetcher
            .fetch_batch(&[], PriceKind::Realtime, PermitMode::Wait)
            .await;

        assert!(results.is_empty());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_respect_provider_max_batch() {
        let provider = Arc::new(ScriptedProvider::new(2, |symbols, _| {
            assert!(symbols.len() <= 2);
            Ok(all_ok(symbols))
        }));
        let limiter = limiter(100);
        let fetcher = PriceFetcher::new(provider.clone(), Arc::clone(&limiter), config());

        let results = fetcher
            .fetch_batch(
                &symbols(&["A", "B", "C", "D", "E"]),
                PriceKind::DailyClose,
                PermitMode::Wait,
            )
            .await;

        assert_eq!(results.len(), 5);
        assert_eq!(provider.calls(), 3);
        assert_eq!(limiter.available(), 97);
    }

    #[tokio::test(start_paused = true)]
    async fn omitted_symbol_is_unknown() {
        let provider = Arc::new(ScriptedProvider::new(10, |symbols, _| {
            Ok(all_ok(&symbols.iter().filter(|s| s.as_str() != "ZZZZ").cloned().collect::<Vec<_>>()))
        }));
        let fetcher = PriceFetcher::new(provider, limiter(100), config());

        let results = fetcher
            .fetch_batch(&symbols(&["AAPL", "ZZZZ"]), PriceKind::Realtime, PermitMode::Wait)
            .await;

        assert!(matches!(outcome_of(&results, "AAPL"), FetchOutcome::Ok(_)));
        assert_eq!(
            outcome_of(&results, "ZZZZ"),
            &FetchOutcome::Failed(FailureReason::Permanent("unknown symbol".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_chunk_error_is_retried() {
        let provider = Arc::new(ScriptedProvider::new(10, |symbols, call| {
            if call == 0 {
                Err(ProviderError::transient("503"))
            } else {
                Ok(all_ok(symbols))
            }
        }));
        let limiter = limiter(100);
        let fetcher = PriceFetcher::new(provider.clone(), Arc::clone(&limiter), config());

        let results = fetcher
            .fetch_batch(&symbols(&["AAPL"]), PriceKind::Realtime, PermitMode::Wait)
            .await;

        assert!(results[0].is_ok());
        assert_eq!(provider.calls(), 2);
        // One permit per attempt.
        assert_eq!(limiter.available(), 98);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let provider = Arc::new(ScriptedProvider::new(10, |_, _| {
            Err(ProviderError::transient("503"))
        }));
        let fetcher = PriceFetcher::new(provider.clone(), limiter(100), config());

        let results = fetcher
            .fetch_batch(&symbols(&["AAPL"]), PriceKind::Realtime, PermitMode::Wait)
            .await;

        assert_eq!(provider.calls(), 3);
        assert_eq!(
            results[0].outcome,
            FetchOutcome::Failed(FailureReason::Transient("503".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn only_transiently_failed_symbols_are_retried() {
        let provider = Arc::new(ScriptedProvider::new(10, |symbols, call| {
            let mut batch = ProviderBatch::new();
            for symbol in symbols {
                let entry = match (symbol.as_str(), call) {
                    ("MSFT", 0) => Err(ProviderError::transient("busy")),
                    ("BAD", _) => Err(ProviderError::permanent("delisted")),
                    _ => Ok(sample(symbol)),
                };
                batch.insert(symbol.clone(), entry);
            }
            assert!(call == 0 || symbols == [Symbol::new("MSFT")]);
            Ok(batch)
        }));
        let fetcher = PriceFetcher::new(provider.clone(), limiter(100), config());

        let results = fetcher
            .fetch_batch(
                &symbols(&["AAPL", "MSFT", "BAD"]),
                PriceKind::Realtime,
                PermitMode::Wait,
            )
            .await;

        assert_eq!(provider.calls(), 2);
        assert!(matches!(outcome_of(&results, "AAPL"), FetchOutcome::Ok(_)));
        assert!(matches!(outcome_of(&results, "MSFT"), FetchOutcome::Ok(_)));
        assert_eq!(
            outcome_of(&results, "BAD"),
            &FetchOutcome::Failed(FailureReason::Permanent("delisted".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_chunk_does_not_affect_others() {
        let provider = Arc::new(ScriptedProvider::new(1, |symbols, _| {
            if symbols[0].as_str() == "BAD" {
                Err(ProviderError::permanent("400"))
            } else {
                Ok(all_ok(symbols))
            }
        }));
        let fetcher = PriceFetcher::new(provider, limiter(100), config());

        let results = fetcher
            .fetch_batch(
                &symbols(&["AAPL", "BAD", "MSFT"]),
                PriceKind::Realtime,
                PermitMode::Wait,
            )
            .await;

        assert_eq!(results.len(), 3);
        assert!(matches!(outcome_of(&results, "AAPL"), FetchOutcome::Ok(_)));
        assert!(matches!(outcome_of(&results, "MSFT"), FetchOutcome::Ok(_)));
        assert!(matches!(
            outcome_of(&results, "BAD"),
            FetchOutcome::Failed(FailureReason::Permanent(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_after_retries() {
        let provider = Arc::new(
            ScriptedProvider::new(10, |symbols, _| Ok(all_ok(symbols))).with_slow("SLOW"),
        );
        let fetcher = PriceFetcher::new(provider.clone(), limiter(100), config());

        let results = fetcher
            .fetch_batch(&symbols(&["SLOW"]), PriceKind::Realtime, PermitMode::Wait)
            .await;

        assert_eq!(provider.calls(), 3);
        assert_eq!(results[0].outcome, FetchOutcome::Failed(FailureReason::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_deadline_marks_unresolved_symbols() {
        let provider = Arc::new(
            ScriptedProvider::new(1, |symbols, _| Ok(all_ok(symbols))).with_slow("SLOW"),
        );
        let config = FetcherConfig {
            request_timeout: Duration::from_secs(60),
            batch_timeout: Duration::from_secs(5),
            ..config()
        };
        let fetcher = PriceFetcher::new(provider, limiter(100), config);

        let start = Instant::now();
        let results = fetcher
            .fetch_batch(&symbols(&["AAPL", "SLOW"]), PriceKind::Realtime, PermitMode::Wait)
            .await;

        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(matches!(outcome_of(&results, "AAPL"), FetchOutcome::Ok(_)));
        assert_eq!(
            outcome_of(&results, "SLOW"),
            &FetchOutcome::Failed(FailureReason::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finished_chunks_are_handed_over_before_the_deadline() {
        let provider = Arc::new(
            ScriptedProvider::new(1, |symbols, _| Ok(all_ok(symbols))).with_slow("SLOW"),
        );
        let config = FetcherConfig {
            request_timeout: Duration::from_secs(60),
            ..config()
        };
        let fetcher = PriceFetcher::new(provider, limiter(100), config);

        let start = Instant::now();
        let mut handed_over = Vec::new();
        let requested = fetcher
            .fetch_each(
                &symbols(&["AAPL", "SLOW", "MSFT"]),
                PriceKind::Realtime,
                PermitMode::Wait,
                start + Duration::from_secs(5),
                |chunk| handed_over.push((start.elapsed(), chunk)),
            )
            .await;

        assert_eq!(requested, 3);
        let (last_at, last) = handed_over.pop().unwrap();
        assert_eq!(last_at, Duration::from_secs(5));
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].symbol, Symbol::new("SLOW"));
        assert_eq!(last[0].outcome, FetchOutcome::Failed(FailureReason::Timeout));
        assert_eq!(handed_over.len(), 2);
        assert!(handed_over
            .iter()
            .all(|(at, chunk)| at.is_zero() && chunk.iter().all(FetchResult::is_ok)));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_mode_reports_throttled_chunks() {
        let provider = Arc::new(ScriptedProvider::new(1, |symbols, _| Ok(all_ok(symbols))));
        let config = FetcherConfig {
            max_concurrency: 1,
            ..config()
        };
        let fetcher = PriceFetcher::new(provider.clone(), limiter(1), config);

        let results = fetcher
            .fetch_batch(&symbols(&["AAPL", "MSFT"]), PriceKind::Realtime, PermitMode::Skip)
            .await;

        assert_eq!(provider.calls(), 1);
        let throttled = results
            .iter()
            .filter(|r| r.outcome == FetchOutcome::Failed(FailureReason::Throttled))
            .count();
        assert_eq!(throttled, 1);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let mut provider = MockPriceProviderPort::new();
        provider.expect_max_batch().return_const(10usize);
        provider
            .expect_fetch_prices()
            .times(1)
            .returning(|_, _| Err(ProviderError::permanent("malformed request")));

        let fetcher = PriceFetcher::new(Arc::new(provider), limiter(100), config());
        let results = fetcher
            .fetch_batch(&symbols(&["AAPL", "MSFT"]), PriceKind::DailyClose, PermitMode::Wait)
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome
            == FetchOutcome::Failed(FailureReason::Permanent("malformed request".to_string()))));
    }
}
