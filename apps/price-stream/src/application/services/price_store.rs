//! Price Store
//!
//! Authoritative last-known price per symbol. Records are sharded in a
//! [`DashMap`], so applies for different symbols proceed independently and
//! applies for the same symbol serialize on its shard entry.
//!
//! The store never holds a lock across I/O; it is purely in-memory.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use crate::domain::pricing::{
    AppliedChange, ChangeOutcome, FailureReason, FetchOutcome, FetchResult, IgnoreReason,
    PriceRecord, PriceSample, Symbol,
};

/// Most recent fetch failure of a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastFailure {
    /// Failure description.
    pub reason: String,
    /// Failure category.
    pub category: &'static str,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

/// Store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Symbols with a record.
    pub symbols: usize,
    /// Results that created or advanced a record.
    pub applied: u64,
    /// Results ignored as stale.
    pub stale: u64,
    /// Failed results recorded as diagnostics.
    pub failed: u64,
    /// Samples seeded from the cache.
    pub restored: u64,
}

/// In-memory price store.
#[derive(Debug, Default)]
pub struct PriceStore {
    records: DashMap<Symbol, PriceRecord>,
    failures: DashMap<Symbol, LastFailure>,
    applied: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
    restored: AtomicU64,
}

impl PriceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fetch result.
    pub fn apply(&self, result: FetchResult) -> ChangeOutcome {
        let FetchResult { symbol, outcome } = result;

        match outcome {
            FetchOutcome::Failed(reason) => {
                self.record_failure(symbol, &reason);
                self.failed.fetch_add(1, Ordering::Relaxed);
                ChangeOutcome::Ignored(IgnoreReason::FetchFailed)
            }
            FetchOutcome::Ok(mut sample) => {
                sample.symbol = symbol;
                match self.write(sample) {
                    Some(change) => {
                        self.applied.fetch_add(1, Ordering::Relaxed);
                        ChangeOutcome::Applied(change)
                    }
                    None => {
                        self.stale.fetch_add(1, Ordering::Relaxed);
                        ChangeOutcome::Ignored(IgnoreReason::Stale)
                    }
                }
            }
        }
    }

    /// Seed a sample read back from the cache.
    ///
    /// Follows the same ordering rules as [`apply`](Self::apply). Returns
    /// whether the sample was written.
    pub fn restore(&self, sample: PriceSample) -> bool {
        let written = self.write(sample).is_some();
        if written {
            self.restored.fetch_add(1, Ordering::Relaxed);
        }
        written
    }

    /// Current record of a symbol.
    #[must_use]
    pub fn get(&self, symbol: &Symbol) -> Option<PriceRecord> {
        self.records.get(symbol).map(|record| record.value().clone())
    }

    /// All records, sorted by symbol.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PriceRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|record| record.value().clone())
            .collect();
        records.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        records
    }

    /// Last recorded failure of a symbol.
    #[must_use]
    pub fn last_failure(&self, symbol: &Symbol) -> Option<LastFailure> {
        self.failures.get(symbol).map(|failure| failure.value().clone())
    }

    /// Number of symbols with a record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record exists yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Store counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            symbols: self.records.len(),
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            restored: self.restored.load(Ordering::Relaxed),
        }
    }

    fn write(&self, sample: PriceSample) -> Option<AppliedChange> {
        let now = Utc::now();

        match self.records.entry(sample.symbol.clone()) {
            Entry::Vacant(slot) => {
                let record = PriceRecord::from_sample(sample.clone(), now);
                let daily_change = record.daily_change();
                slot.insert(record);
                Some(AppliedChange {
                    previous: None,
                    current: sample,
                    daily_change,
                })
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if !record.accepts(&sample) {
                    return None;
                }
                let previous = record.replace(sample.clone(), now);
                Some(AppliedChange {
                    previous,
                    current: sample,
                    daily_change: record.daily_change(),
                })
            }
        }
    }

    fn record_failure(&self, symbol: Symbol, reason: &FailureReason) {
        self.failures.insert(
            symbol,
            LastFailure {
                reason: reason.to_string(),
                category: reason.as_str(),
                at: Utc::now(),
            },
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
