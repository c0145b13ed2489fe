//! Underlying-asset market data: current price and candles.
//!
//! The engine only needs the feed for the entry reference price and for the
//! momentum signal's window-open comparison; it is a leaf collaborator
//! behind the [`MarketDataFeed`] trait.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// A single observed price.
#[derive(Debug, Clone)]
pub struct PriceTick {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// One closed candle.
#[derive(Debug, Clone)]
pub struct Candle {
    pub open: f64,
    pub close: f64,
    pub close_time: DateTime<Utc>,
}

#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Latest trade price of the underlying.
    async fn current_price(&self) -> Result<PriceTick>;

    /// Opening price of the candle that started at `window_start`.
    async fn window_open_price(&self, window_start: DateTime<Utc>) -> Result<f64>;

    /// The most recent `limit` one-minute candles.
    async fn recent_candles(&self, limit: u32) -> Result<Vec<Candle>>;
}

/// REST price feed (Binance-style kline API).
pub struct RestFeed {
    client: Client,
    base_url: String,
    symbol: String,
}

/// Price ticker response
#[derive(Debug, Clone, Deserialize)]
struct PriceTicker {
    #[allow(dead_code)]
    symbol: String,
    price: String,
}

impl RestFeed {
    pub fn new(base_url: &str, symbol: &str, timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            symbol: symbol.to_string(),
        })
    }

    async fn get_klines(&self, query: &str) -> Result<Vec<Vec<serde_json::Value>>> {
        let url = format!("{}/api/v3/klines?symbol={}&{}", self.base_url, self.symbol, query);

        let response = self.client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch klines")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Klines request failed: {} - {}", status, text));
        }

        // Klines come back as positional arrays, not objects
        response.json().await.context("Failed to parse klines response")
    }
}

#[async_trait]
impl MarketDataFeed for RestFeed {
    async fn current_price(&self) -> Result<PriceTick> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, self.symbol);

        let response = self.client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch price")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Price request failed: {} - {}", status, text));
        }

        let ticker: PriceTicker = response.json().await
            .context("Failed to parse price response")?;

        let price = ticker.price.parse::<f64>()
            .context("Failed to parse price value")?;

        Ok(PriceTick { price, timestamp: Utc::now() })
    }

    async fn window_open_price(&self, window_start: DateTime<Utc>) -> Result<f64> {
        let start_ms = window_start.timestamp_millis();
        let end_ms = start_ms + 60_000; // +1 minute to get at least one candle

        let klines = self
            .get_klines(&format!(
                "interval=1m&startTime={}&endTime={}&limit=1",
                start_ms, end_ms
            ))
            .await?;

        if klines.is_empty() {
            return Err(anyhow!("No kline data available for window start"));
        }

        // Open price is index 1
        let open_str = klines[0][1]
            .as_str()
            .ok_or_else(|| anyhow!("Invalid open price format"))?;

        open_str.parse::<f64>().context("Failed to parse open price")
    }

    async fn recent_candles(&self, limit: u32) -> Result<Vec<Candle>> {
        let klines = self
            .get_klines(&format!("interval=1m&limit={}", limit))
            .await?;

        let mut candles = Vec::with_capacity(klines.len());
        for kline in klines {
            let open = kline[1].as_str().unwrap_or("0").parse::<f64>().unwrap_or(0.0);
            let close = kline[4].as_str().unwrap_or("0").parse::<f64>().unwrap_or(0.0);
            let close_time = kline[6].as_i64().unwrap_or(0);

            candles.push(Candle {
                open,
                close,
                close_time: DateTime::from_timestamp_millis(close_time)
                    .unwrap_or_else(Utc::now),
            });
        }

        Ok(candles)
    }
}
