use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::AppError;

/// One trade row as delivered by the historical source, before it gains
/// instrument context in the consume stage.
#[derive(Debug, Clone, Copy)]
pub struct SourceTick {
    pub timestamp: NaiveDateTime,
    pub price: f64,
    pub volume: f64,
}

/// Day-granular historical trade source. A failed day is the caller's
/// problem to log and skip; retries, if any, belong to the implementation.
pub trait TickSource {
    fn fetch_day(
        &self,
        instrument: &str,
        day: NaiveDate,
    ) -> impl std::future::Future<Output = Result<Vec<SourceTick>>> + Send;
}

/// Deserialize string-encoded decimal fields to f64.
fn string_to_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<f64>().map_err(serde::de::Error::custom)
}

/// Aggregated trade row from GET /api/v3/aggTrades.
#[derive(Debug, Deserialize)]
pub struct AggTrade {
    #[serde(rename = "a")]
    pub agg_trade_id: u64,
    #[serde(rename = "p", deserialize_with = "string_to_f64")]
    pub price: f64,
    #[serde(rename = "q", deserialize_with = "string_to_f64")]
    pub qty: f64,
    #[serde(rename = "T")]
    pub timestamp_ms: u64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Error body the REST API returns alongside a non-success status.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    code: i64,
    msg: String,
}

const AGG_TRADES_PAGE_LIMIT: usize = 1000;

/// Historical trade fetcher over the public aggTrades endpoint, paginated by
/// advancing the time window. No credentials: market data only.
pub struct AggTradeSource {
    http: reqwest::Client,
    base_url: String,
    // Coarse request counter over the current minute window.
    request_count: AtomicU64,
    window_start: std::sync::Mutex<Instant>,
}

impl AggTradeSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            request_count: AtomicU64::new(0),
            window_start: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn check_rate_limit(&self) {
        let mut start = match self.window_start.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if start.elapsed().as_secs() >= 60 {
            *start = Instant::now();
            self.request_count.store(0, Ordering::Relaxed);
        }
        let count = self.request_count.fetch_add(1, Ordering::Relaxed);
        if count > 960 {
            tracing::warn!(count, "approaching request-weight limit (80% of 1200/min)");
        }
    }

    async fn fetch_page(
        &self,
        instrument: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<AggTrade>> {
        self.check_rate_limit();
        let url = format!(
            "{}/api/v3/aggTrades?symbol={}&startTime={}&endTime={}&limit={}",
            self.base_url, instrument, start_ms, end_ms, AGG_TRADES_PAGE_LIMIT
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("aggTrades request failed")?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            if let Ok(err) = serde_json::from_str::<ApiErrorResponse>(&body) {
                return Err(AppError::Api {
                    code: err.code,
                    msg: err.msg,
                }
                .into());
            }
            return Err(anyhow::anyhow!("aggTrades request failed: {}", body));
        }

        let trades: Vec<AggTrade> = resp
            .json()
            .await
            .context("aggTrades response is not valid JSON")?;
        Ok(trades)
    }
}

impl TickSource for AggTradeSource {
    async fn fetch_day(&self, instrument: &str, day: NaiveDate) -> Result<Vec<SourceTick>> {
        let day_start = day
            .and_hms_opt(0, 0, 0)
            .context("invalid day start")?
            .and_utc()
            .timestamp_millis();
        let day_end = day_start + 86_400_000;

        let mut out = Vec::new();
        let mut cursor = day_start;
        while cursor < day_end {
            let page = self.fetch_page(instrument, cursor, day_end).await?;
            let page_len = page.len();
            for trade in &page {
                let Some(ts) = DateTime::from_timestamp_millis(trade.timestamp_ms as i64) else {
                    continue;
                };
                out.push(SourceTick {
                    timestamp: ts.naive_utc(),
                    price: trade.price,
                    volume: trade.qty,
                });
            }
            if page_len < AGG_TRADES_PAGE_LIMIT {
                break;
            }
            let Some(last) = page.last() else { break };
            cursor = last.timestamp_ms as i64 + 1;
        }
        tracing::debug!(
            instrument,
            day = %day,
            ticks = out.len(),
            "fetched trade day"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agg_trade_parses_string_decimals() {
        let raw = r#"{"a":26129,"p":"0.01633102","q":"4.70443515","f":27781,"l":27781,"T":1498793709153,"m":true,"M":true}"#;
        let trade: AggTrade = serde_json::from_str(raw).unwrap();
        assert_eq!(trade.agg_trade_id, 26129);
        assert!((trade.price - 0.01633102).abs() < 1e-12);
        assert!((trade.qty - 4.70443515).abs() < 1e-12);
        assert_eq!(trade.timestamp_ms, 1498793709153);
        assert!(trade.is_buyer_maker);
    }

    #[test]
    fn agg_trade_rejects_non_numeric_price() {
        let raw = r#"{"a":1,"p":"abc","q":"1.0","T":1498793709153,"m":false}"#;
        assert!(serde_json::from_str::<AggTrade>(raw).is_err());
    }
}
