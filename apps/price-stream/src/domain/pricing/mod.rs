//! Price Domain Types
//!
//! Core value types for price ingestion: samples, per-symbol records,
//! fetch results, and the broadcast messages derived from record changes.
//!
//! # Design
//!
//! A [`PriceRecord`] keeps the latest daily close and the latest real-time
//! tick side by side. The two fields never overwrite each other, and each
//! one only moves forward in time.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Symbol
// =============================================================================

/// Unique identifier of a tradable asset (ticker).
///
/// Symbols are trimmed and upper-cased on construction so `"aapl "` and
/// `"AAPL"` address the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Create a normalized symbol.
    #[must_use]
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_uppercase())
    }

    /// Borrow the symbol text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the symbol is empty after normalization.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// =============================================================================
// Price Kind
// =============================================================================

/// Which of the two independent price series a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceKind {
    /// End-of-day settlement price.
    DailyClose,
    /// Intraday tick.
    Realtime,
}

impl PriceKind {
    /// Both kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::DailyClose, Self::Realtime]
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DailyClose => "daily_close",
            Self::Realtime => "realtime",
        }
    }
}

impl fmt::Display for PriceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Price Sample
// =============================================================================

/// A single immutable price observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSample {
    /// Asset symbol.
    pub symbol: Symbol,
    /// Observed price.
    pub value: Decimal,
    /// When the provider observed the price.
    pub observed_at: DateTime<Utc>,
    /// Daily close or real-time tick.
    pub kind: PriceKind,
    /// Traded volume reported alongside the price, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<i64>,
}

impl PriceSample {
    /// Create a sample without volume information.
    #[must_use]
    pub const fn new(
        symbol: Symbol,
        value: Decimal,
        observed_at: DateTime<Utc>,
        kind: PriceKind,
    ) -> Self {
        Self {
            symbol,
            value,
            observed_at,
            kind,
            volume: None,
        }
    }

    /// Attach a traded volume.
    #[must_use]
    pub const fn with_volume(mut self, volume: i64) -> Self {
        self.volume = Some(volume);
        self
    }
}

// =============================================================================
// Price Record
// =============================================================================

/// Last known prices for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceRecord {
    /// Asset symbol.
    pub symbol: Symbol,
    /// Latest daily close.
    pub daily_close: Option<PriceSample>,
    /// Latest real-time tick.
    pub realtime: Option<PriceSample>,
    /// Wall-clock time the newest sample was applied.
    pub last_applied_at: DateTime<Utc>,
}

impl PriceRecord {
    /// Create a record seeded with its first sample.
    #[must_use]
    pub fn from_sample(sample: PriceSample, applied_at: DateTime<Utc>) -> Self {
        let mut record = Self {
            symbol: sample.symbol.clone(),
            daily_close: None,
            realtime: None,
            last_applied_at: applied_at,
        };
        let kind = sample.kind;
        *record.slot_mut(kind) = Some(sample);
        record
    }

    /// The stored sample of the given kind.
    #[must_use]
    pub const fn sample(&self, kind: PriceKind) -> Option<&PriceSample> {
        match kind {
            PriceKind::DailyClose => self.daily_close.as_ref(),
            PriceKind::Realtime => self.realtime.as_ref(),
        }
    }

    /// Whether `candidate` is strictly newer than what is stored for its kind.
    #[must_use]
    pub fn accepts(&self, candidate: &PriceSample) -> bool {
        self.sample(candidate.kind)
            .is_none_or(|current| candidate.observed_at > current.observed_at)
    }

    /// Store `sample` in its slot and return what it replaced.
    ///
    /// Callers check [`accepts`](Self::accepts) first.
    pub fn replace(&mut self, sample: PriceSample, applied_at: DateTime<Utc>) -> Option<PriceSample> {
        self.last_applied_at = applied_at;
        self.slot_mut(sample.kind).replace(sample)
    }

    /// Change of the real-time price against the stored daily close.
    ///
    /// Returns `(absolute change, percent change)`; `None` when either side
    /// is missing, the close is zero, or the result does not fit a `Decimal`.
    #[must_use]
    pub fn daily_change(&self) -> Option<(Decimal, Decimal)> {
        let close = self.daily_close.as_ref()?.value;
        let last = self.realtime.as_ref()?.value;
        if close.is_zero() {
            return None;
        }
        let change = last.checked_sub(close)?;
        let percent = change
            .checked_div(close)?
            .checked_mul(Decimal::ONE_HUNDRED)?
            .round_dp(4);
        Some((change, percent))
    }

    const fn slot_mut(&mut self, kind: PriceKind) -> &mut Option<PriceSample> {
        match kind {
            PriceKind::DailyClose => &mut self.daily_close,
            PriceKind::Realtime => &mut self.realtime,
        }
    }
}

// =============================================================================
// Fetch Results
// =============================================================================

/// Why a symbol could not be priced in a fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    /// Provider failed transiently and retries were exhausted.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Unknown or delisted symbol, malformed request. Never retried.
    #[error("permanent provider error: {0}")]
    Permanent(String),
    /// Call or batch deadline exceeded.
    #[error("timed out")]
    Timeout,
    /// No rate-limit permit was available and the caller chose not to wait.
    #[error("throttled by rate limiter")]
    Throttled,
}

impl FailureReason {
    /// Label used in metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Timeout => "timeout",
            Self::Throttled => "throttled",
        }
    }
}

/// Outcome of fetching one symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The provider returned a price.
    Ok(PriceSample),
    /// The symbol could not be priced.
    Failed(FailureReason),
}

/// Per-symbol result of a batch fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    /// Requested symbol.
    pub symbol: Symbol,
    /// What happened.
    pub outcome: FetchOutcome,
}

impl FetchResult {
    /// Successful result.
    #[must_use]
    pub fn ok(sample: PriceSample) -> Self {
        Self {
            symbol: sample.symbol.clone(),
            outcome: FetchOutcome::Ok(sample),
        }
    }

    /// Failed result.
    #[must_use]
    pub const fn failed(symbol: Symbol, reason: FailureReason) -> Self {
        Self {
            symbol,
            outcome: FetchOutcome::Failed(reason),
        }
    }

    /// Whether the fetch produced a price.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.outcome, FetchOutcome::Ok(_))
    }
}

// =============================================================================
// Store Outcomes
// =============================================================================

/// Why the store did not apply a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Sample is not newer than the stored one of the same kind.
    Stale,
    /// The result was a fetch failure; only diagnostics were updated.
    FetchFailed,
}

impl IgnoreReason {
    /// Label used in metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::FetchFailed => "fetch_failed",
        }
    }
}

/// A sample that was written into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    /// Sample that was replaced, `None` for the first sample of its kind.
    pub previous: Option<PriceSample>,
    /// Sample now stored.
    pub current: PriceSample,
    /// Daily change of the record after the write, if computable.
    pub daily_change: Option<(Decimal, Decimal)>,
}

impl AppliedChange {
    /// Whether the stored value differs from the one it replaced.
    ///
    /// A newer timestamp with the same price advances the record but is
    /// not worth a broadcast.
    #[must_use]
    pub fn value_changed(&self) -> bool {
        self.previous
            .as_ref()
            .is_none_or(|previous| previous.value != self.current.value)
    }

    /// Build the broadcast message for this change.
    #[must_use]
    pub fn to_message(&self) -> BroadcastMessage {
        let (daily_change, daily_change_percent) = match (self.current.kind, self.daily_change) {
            (PriceKind::Realtime, Some((change, percent))) => (Some(change), Some(percent)),
            _ => (None, None),
        };

        BroadcastMessage {
            symbol: self.current.symbol.clone(),
            kind: self.current.kind,
            value: self.current.value,
            observed_at: self.current.observed_at,
            previous_value: self.previous.as_ref().map(|p| p.value),
            daily_change,
            daily_change_percent,
        }
    }
}

/// Result of applying a fetch result to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The record was created or advanced.
    Applied(AppliedChange),
    /// Nothing changed.
    Ignored(IgnoreReason),
}

impl ChangeOutcome {
    /// Whether the outcome is `Applied`.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

// =============================================================================
// Broadcast Message
// =============================================================================

/// A price change pushed to dashboard connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Asset symbol.
    pub symbol: Symbol,
    /// Which series changed.
    pub kind: PriceKind,
    /// New value.
    pub value: Decimal,
    /// When the provider observed the new value.
    pub observed_at: DateTime<Utc>,
    /// Value it replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Decimal>,
    /// Real-time price minus the stored daily close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_change: Option<Decimal>,
    /// Daily change as a percentage of the close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_change_percent: Option<Decimal>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn sample(value: Decimal, secs: i64, kind: PriceKind) -> PriceSample {
        PriceSample::new(Symbol::new("AAPL"), value, at(secs), kind)
    }

    #[test]
    fn symbol_is_normalized() {
        assert_eq!(Symbol::new(" aapl "), Symbol::new("AAPL"));
        assert_eq!(Symbol::new("brk.b").as_str(), "BRK.B");
        assert!(Symbol::new("   ").is_empty());
    }

    #[test]
    fn record_keeps_kinds_independent() {
        let mut record =
            PriceRecord::from_sample(sample(Decimal::new(15000, 2), 100, PriceKind::Realtime), at(1));

        let close = sample(Decimal::new(15100, 2), 200, PriceKind::DailyClose);
        assert!(record.accepts(&close));
        assert!(record.replace(close, at(2)).is_none());

        assert_eq!(record.realtime.as_ref().unwrap().value, Decimal::new(15000, 2));
        assert_eq!(record.daily_close.as_ref().unwrap().value, Decimal::new(15100, 2));
        assert_eq!(record.last_applied_at, at(2));
    }

    #[test]
    fn record_rejects_older_or_equal_sample() {
        let record =
            PriceRecord::from_sample(sample(Decimal::new(15000, 2), 100, PriceKind::Realtime), at(1));

        assert!(!record.accepts(&sample(Decimal::new(14950, 2), 90, PriceKind::Realtime)));
        assert!(!record.accepts(&sample(Decimal::new(14950, 2), 100, PriceKind::Realtime)));
        assert!(record.accepts(&sample(Decimal::new(14950, 2), 101, PriceKind::Realtime)));
    }

    #[test]
    fn daily_change_against_close() {
        let mut record = PriceRecord::from_sample(
            sample(Decimal::new(10000, 2), 100, PriceKind::DailyClose),
            at(1),
        );
        assert!(record.daily_change().is_none());

        record.replace(sample(Decimal::new(10250, 2), 200, PriceKind::Realtime), at(2));
        let (change, percent) = record.daily_change().unwrap();
        assert_eq!(change, Decimal::new(250, 2));
        assert_eq!(percent, Decimal::new(25, 1));
    }

    #[test]
    fn daily_change_ignores_zero_close() {
        let mut record =
            PriceRecord::from_sample(sample(Decimal::ZERO, 100, PriceKind::DailyClose), at(1));
        record.replace(sample(Decimal::ONE, 200, PriceKind::Realtime), at(2));
        assert!(record.daily_change().is_none());
    }

    #[test]
    fn daily_change_out_of_range_is_none() {
        let mut record = PriceRecord::from_sample(
            sample(Decimal::new(1, 8), 100, PriceKind::DailyClose),
            at(1),
        );
        let huge: Decimal = "5000000000000000000000".parse().unwrap();
        record.replace(sample(huge, 200, PriceKind::Realtime), at(2));

        assert!(record.daily_change().is_none());
    }

    #[test]
    fn same_value_is_not_a_change() {
        let change = AppliedChange {
            previous: Some(sample(Decimal::new(15000, 2), 100, PriceKind::Realtime)),
            current: sample(Decimal::new(150, 0), 110, PriceKind::Realtime),
            daily_change: None,
        };
        assert!(!change.value_changed());

        let first = AppliedChange {
            previous: None,
            current: sample(Decimal::new(150, 0), 110, PriceKind::Realtime),
            daily_change: None,
        };
        assert!(first.value_changed());
    }

    #[test]
    fn message_carries_daily_change_for_realtime_only() {
        let realtime = AppliedChange {
            previous: Some(sample(Decimal::new(101, 0), 100, PriceKind::Realtime)),
            current: sample(Decimal::new(102, 0), 110, PriceKind::Realtime),
            daily_change: Some((Decimal::new(2, 0), Decimal::new(2, 0))),
        };
        let message = realtime.to_message();
        assert_eq!(message.previous_value, Some(Decimal::new(101, 0)));
        assert_eq!(message.daily_change, Some(Decimal::new(2, 0)));

        let close = AppliedChange {
            previous: None,
            current: sample(Decimal::new(100, 0), 110, PriceKind::DailyClose),
            daily_change: Some((Decimal::new(2, 0), Decimal::new(2, 0))),
        };
        let message = close.to_message();
        assert!(message.daily_change.is_none());
        assert!(message.daily_change_percent.is_none());
    }

    #[test]
    fn message_serializes_decimal_as_string() {
        let message = AppliedChange {
            previous: None,
            current: sample(Decimal::new(15000, 2), 100, PriceKind::Realtime),
            daily_change: None,
        }
        .to_message();

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["symbol"], "AAPL");
        assert_eq!(json["kind"], "REALTIME");
        assert_eq!(json["value"], "150.00");
        assert!(json.get("previous_value").is_none());
    }
}
