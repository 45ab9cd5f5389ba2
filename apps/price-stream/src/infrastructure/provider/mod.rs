//! HTTP Quote Provider
//!
//! [`PriceProviderPort`] adapter for a Yahoo-style quote API.
//!
//! - Real-time prices come from the batch quote endpoint
//!   (`/v7/finance/quote?symbols=A,B,C`). Unknown symbols are simply
//!   absent from the answer.
//! - Daily closes come from the chart endpoint
//!   (`/v8/finance/chart/{symbol}?range=5d&interval=1d`), one symbol per
//!   call. The latest bar with a close wins.
//!
//! Retries and rate limiting live in the fetcher. This adapter only
//! classifies failures: throttling, server errors and network failures are
//! transient, other client errors and undecodable bodies are permanent.

pub mod messages;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::de::DeserializeOwned;

use crate::application::ports::{PriceProviderPort, ProviderBatch, ProviderError};
use crate::domain::pricing::{PriceKind, PriceSample, Symbol};
use crate::infrastructure::config::ProviderSettings;

use self::messages::{ChartEnvelope, QuoteEnvelope};

/// Quote provider over HTTP.
#[derive(Debug, Clone)]
pub struct HttpQuoteProvider {
    client: Client,
    base_url: String,
    quote_batch_limit: usize,
}

impl HttpQuoteProvider {
    /// Create a provider client.
    ///
    /// `timeout` bounds each HTTP request.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Permanent`] if the HTTP client cannot be
    /// built.
    pub fn new(settings: &ProviderSettings, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| ProviderError::permanent(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            quote_batch_limit: settings.quote_batch_limit.max(1),
        })
    }

    async fn fetch_quotes(&self, symbols: &[Symbol]) -> Result<ProviderBatch, ProviderError> {
        let joined = symbols
            .iter()
            .map(Symbol::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("{}/v7/finance/quote", self.base_url);
        let envelope: QuoteEnvelope = self.get_json(&url, &[("symbols", joined.as_str())]).await?;

        if let Some(error) = envelope.quote_response.error {
            return Err(ProviderError::permanent(error.to_string()));
        }

        let mut batch = ProviderBatch::with_capacity(symbols.len());
        for quote in envelope.quote_response.result {
            let symbol = Symbol::new(&quote.symbol);
            let sample = quote
                .regular_market_price
                .ok_or_else(|| ProviderError::permanent("quote has no market price"))
                .and_then(to_decimal)
                .map(|value| {
                    let observed_at = quote
                        .regular_market_time
                        .and_then(from_unix)
                        .unwrap_or_else(Utc::now);
                    let sample =
                        PriceSample::new(symbol.clone(), value, observed_at, PriceKind::Realtime);
                    match quote.regular_market_volume {
                        Some(volume) => sample.with_volume(volume),
                        None => sample,
                    }
                });
            batch.insert(symbol, sample);
        }

        Ok(batch)
    }

    async fn fetch_daily_close(&self, symbol: &Symbol) -> Result<PriceSample, ProviderError> {
        let url = format!("{}/v8/finance/chart/{}", self.base_url, symbol.as_str());
        let envelope: ChartEnvelope = self
            .get_json(&url, &[("range", "5d"), ("interval", "1d")])
            .await?;

        if let Some(error) = envelope.chart.error {
            return Err(ProviderError::permanent(error.to_string()));
        }

        let series = envelope
            .chart
            .result
            .and_then(|mut series| series.pop())
            .ok_or_else(|| ProviderError::permanent("no chart data"))?;
        let (timestamp, close, volume) = series
            .last_close()
            .ok_or_else(|| ProviderError::permanent("no closing price in range"))?;
        let observed_at = from_unix(timestamp)
            .ok_or_else(|| ProviderError::permanent(format!("invalid bar timestamp {timestamp}")))?;

        let sample = PriceSample::new(
            symbol.clone(),
            to_decimal(close)?,
            observed_at,
            PriceKind::DailyClose,
        );
        Ok(match volume {
            Some(volume) => sample.with_volume(volume),
            None => sample,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let text = response.text().await.map_err(|e| classify_transport(&e))?;
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::permanent(format!("malformed provider response: {e}")))
    }
}

#[async_trait]
impl PriceProviderPort for HttpQuoteProvider {
    async fn fetch_prices(
        &self,
        symbols: &[Symbol],
        kind: PriceKind,
    ) -> Result<ProviderBatch, ProviderError> {
        if symbols.is_empty() {
            return Ok(ProviderBatch::new());
        }

        match kind {
            PriceKind::Realtime => self.fetch_quotes(symbols).await,
            PriceKind::DailyClose => {
                let mut batch = ProviderBatch::with_capacity(symbols.len());
                for symbol in symbols {
                    let result = self.fetch_daily_close(symbol).await;
                    if let Err(error) = &result {
                        tracing::debug!(symbol = %symbol, error = %error, "Daily close unavailable");
                    }
                    batch.insert(symbol.clone(), result);
                }
                Ok(batch)
            }
        }
    }

    fn max_batch(&self, kind: PriceKind) -> usize {
        match kind {
            PriceKind::Realtime => self.quote_batch_limit,
            PriceKind::DailyClose => 1,
        }
    }
}

// ============================================================================
// Error Classification
// ============================================================================

/// Map a non-success status to a provider error.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = body.chars().take(200).collect::<String>();
    let message = if detail.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {detail}", status.as_u16())
    };

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ProviderError::transient(message)
    } else {
        ProviderError::permanent(message)
    }
}

fn classify_transport(error: &reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout
    } else if error.is_decode() {
        ProviderError::permanent(format!("undecodable provider response: {error}"))
    } else {
        ProviderError::transient(format!("network error: {error}"))
    }
}

fn to_decimal(value: f64) -> Result<Decimal, ProviderError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ProviderError::permanent(format!("invalid price {value}")));
    }
    Decimal::from_f64(value)
        .ok_or_else(|| ProviderError::permanent(format!("unrepresentable price {value}")))
}

fn from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}

// ============================================================================
// Tests
// ============================================================================
