//! Quote API response types.
//!
//! These map directly to the provider's JSON. Only the fields the service
//! reads are declared.

use serde::Deserialize;

// ============================================================================
// Real-time Quotes
// ============================================================================

/// Envelope of the batch quote endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteEnvelope {
    /// Response body.
    pub quote_response: QuoteResponse,
}

/// Batch quote body.
#[derive(Debug, Clone, Deserialize)]
pub struct QuoteResponse {
    /// One entry per recognised symbol. Unknown symbols are omitted.
    #[serde(default)]
    pub result: Vec<Quote>,
    /// Error reported by the provider, if any.
    #[serde(default)]
    pub error: Option<ApiError>,
}

/// A single real-time quote.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Symbol as echoed by the provider.
    pub symbol: String,
    /// Last traded price.
    #[serde(default)]
    pub regular_market_price: Option<f64>,
    /// Unix timestamp (seconds) of the last trade.
    #[serde(default)]
    pub regular_market_time: Option<i64>,
    /// Session volume.
    #[serde(default)]
    pub regular_market_volume: Option<i64>,
}

// ============================================================================
// Daily Chart
// ============================================================================

/// Envelope of the chart endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartEnvelope {
    /// Response body.
    pub chart: ChartResponse,
}

/// Chart body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartResponse {
    /// Series, normally exactly one.
    #[serde(default)]
    pub result: Option<Vec<ChartSeries>>,
    /// Error reported by the provider, if any.
    #[serde(default)]
    pub error: Option<ApiError>,
}

/// A daily bar series for one symbol.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartSeries {
    /// Series metadata.
    pub meta: ChartMeta,
    /// Unix timestamps (seconds) of each bar.
    #[serde(default)]
    pub timestamp: Vec<i64>,
    /// Bar values aligned with `timestamp`.
    pub indicators: ChartIndicators,
}

/// Series metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartMeta {
    /// Symbol as echoed by the provider.
    pub symbol: String,
}

/// Indicator block of a chart series.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartIndicators {
    /// OHLCV arrays, normally exactly one.
    #[serde(default)]
    pub quote: Vec<ChartBars>,
}

/// Close and volume arrays. Missing bars are `null`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartBars {
    /// Closing prices.
    #[serde(default)]
    pub close: Vec<Option<f64>>,
    /// Volumes.
    #[serde(default)]
    pub volume: Vec<Option<i64>>,
}

impl ChartSeries {
    /// Latest bar carrying a close: `(timestamp, close, volume)`.
    #[must_use]
    pub fn last_close(&self) -> Option<(i64, f64, Option<i64>)> {
        let bars = self.indicators.quote.first()?;
        self.timestamp
            .iter()
            .enumerate()
            .rev()
            .find_map(|(index, timestamp)| {
                let close = bars.close.get(index).copied().flatten()?;
                let volume = bars.volume.get(index).copied().flatten();
                Some((*timestamp, close, volume))
            })
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error object embedded in provider responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    /// Short error code.
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, &self.description) {
            (Some(code), Some(description)) => write!(f, "{code}: {description}"),
            (Some(text), None) | (None, Some(text)) => f.write_str(text),
            (None, None) => f.write_str("unknown provider error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_close_skips_trailing_nulls() {
        let series: ChartSeries = serde_json::from_str(
            r#"{
                "meta": {"symbol": "AAPL"},
                "timestamp": [1714483800, 1714570200, 1714656600],
                "indicators": {"quote": [{
                    "close": [170.33, 169.30, null],
                    "volume": [65934800, 50383100, null]
                }]}
            }"#,
        )
        .unwrap();

        assert_eq!(series.last_close(), Some((1_714_570_200, 169.30, Some(50_383_100))));
    }

    #[test]
    fn last_close_of_empty_series_is_none() {
        let series: ChartSeries = serde_json::from_str(
            r#"{"meta": {"symbol": "AAPL"}, "indicators": {"quote": []}}"#,
        )
        .unwrap();

        assert_eq!(series.last_close(), None);
    }

    #[test]
    fn quote_envelope_tolerates_missing_fields() {
        let envelope: QuoteEnvelope = serde_json::from_str(
            r#"{"quoteResponse": {"result": [{"symbol": "MSFT"}], "error": null}}"#,
        )
        .unwrap();

        let quote = &envelope.quote_response.result[0];
        assert_eq!(quote.symbol, "MSFT");
        assert!(quote.regular_market_price.is_none());
    }

    #[test]
    fn api_error_display() {
        let error = ApiError {
            code: Some("Not Found".to_string()),
            description: Some("No data found, symbol may be delisted".to_string()),
        };
        assert_eq!(error.to_string(), "Not Found: No data found, symbol may be delisted");
    }
}
