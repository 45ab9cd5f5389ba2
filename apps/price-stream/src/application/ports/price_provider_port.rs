//! Price Provider Port (Driven Port)
//!
//! Interface to the external quote provider.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::pricing::{FailureReason, PriceKind, PriceSample, Symbol};

/// Per-symbol answer of one provider call.
pub type ProviderBatch = HashMap<Symbol, Result<PriceSample, ProviderError>>;

/// Provider error.
///
/// Returned for a whole call (chunk-level) or for a single symbol inside a
/// [`ProviderBatch`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Server error, throttling, or network failure. Worth retrying.
    #[error("Transient provider error: {message}")]
    Transient {
        /// Error details.
        message: String,
    },

    /// Unknown symbol or malformed request. Retrying cannot help.
    #[error("Permanent provider error: {message}")]
    Permanent {
        /// Error details.
        message: String,
    },

    /// The call did not finish within its timeout.
    #[error("Provider call timed out")]
    Timeout,
}

impl ProviderError {
    /// Create a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Whether the call may succeed if repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout)
    }

    /// Per-symbol failure reason for this error.
    #[must_use]
    pub fn to_failure(&self) -> FailureReason {
        match self {
            Self::Transient { message } => FailureReason::Transient(message.clone()),
            Self::Permanent { message } => FailureReason::Permanent(message.clone()),
            Self::Timeout => FailureReason::Timeout,
        }
    }
}

/// Port for fetching prices from an external provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceProviderPort: Send + Sync {
    /// Fetch prices for a set of symbols in one call.
    ///
    /// An `Err` fails every symbol in the call. Symbols missing from an
    /// `Ok` map are treated as unknown by the caller.
    async fn fetch_prices(
        &self,
        symbols: &[Symbol],
        kind: PriceKind,
    ) -> Result<ProviderBatch, ProviderError>;

    /// Largest number of symbols accepted by one call for `kind`.
    fn max_batch(&self, kind: PriceKind) -> usize;
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(ProviderError::transient("503"), true; "transient")]
    #[test_case(ProviderError::Timeout, true; "timeout")]
    #[test_case(ProviderError::permanent("404"), false; "permanent")]
    fn retryable(error: ProviderError, expected: bool) {
        assert_eq!(error.is_retryable(), expected);
    }

    #[test]
    fn failure_reason_keeps_message() {
        assert_eq!(
            ProviderError::permanent("unknown symbol").to_failure(),
            FailureReason::Permanent("unknown symbol".to_string())
        );
        assert_eq!(ProviderError::Timeout.to_failure(), FailureReason::Timeout);
    }
}
