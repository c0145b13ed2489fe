//! Exchange gateway: authenticated REST access to the event-contract exchange.
//!
//! Everything the engine knows about the exchange goes through the
//! [`ExchangeGateway`] trait so tests can substitute a scripted exchange.
//! The REST implementation signs every request with HMAC-SHA256 and caches
//! market snapshots for a short TTL (with an explicit bust for recovery
//! paths that must see fresh data).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Which side of a binary market a position holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Yes => write!(f, "yes"),
            Side::No => write!(f, "no"),
        }
    }
}

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    Buy,
    Sell,
}

/// Order lifetime semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good-till-cancelled: rests on the book.
    Gtc,
    /// Immediate-or-cancel: fills what it can, never rests.
    Ioc,
}

/// Market lifecycle as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    /// Expired but the result has not been posted yet.
    Closed,
    Settled,
}

/// Account balance.
#[derive(Debug, Clone, Deserialize)]
pub struct Balance {
    pub available: f64,
    pub pending_payout: f64,
}

/// Snapshot of one market's quotes and lifecycle state.
///
/// Prices are probability-priced in [0, 1]; a quote of 0.0 means no
/// liquidity on that side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub ticker: String,
    pub status: MarketStatus,
    pub yes_bid: f64,
    pub yes_ask: f64,
    pub no_bid: f64,
    pub no_ask: f64,
    pub close_time: DateTime<Utc>,
    /// Winning side, only present once settled.
    pub result: Option<Side>,
    /// Strike/threshold for markets that have one.
    pub strike: Option<f64>,
}

impl MarketSnapshot {
    pub fn bid_for(&self, side: Side) -> f64 {
        match side {
            Side::Yes => self.yes_bid,
            Side::No => self.no_bid,
        }
    }

    pub fn ask_for(&self, side: Side) -> f64 {
        match side {
            Side::Yes => self.yes_ask,
            Side::No => self.no_ask,
        }
    }
}

/// Order to be placed. `client_order_id` is the idempotency key: the
/// exchange deduplicates resubmissions carrying the same id.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub ticker: String,
    pub side: Side,
    pub action: OrderAction,
    pub count: u32,
    pub price: f64,
    pub client_order_id: String,
    pub time_in_force: TimeInForce,
}

/// Exchange response to an order placement.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub status: String,
    pub fill_count: u32,
}

impl OrderResponse {
    /// Whether the exchange reports this order as (at least partially) filled.
    pub fn is_filled(&self) -> bool {
        self.fill_count > 0 || self.status == "executed" || self.status == "filled"
    }
}

/// One order as returned by the order-history endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderInfo {
    pub order_id: String,
    pub status: String,
    pub fill_count: u32,
    pub price: f64,
    pub count: u32,
}

/// One price level of an order book side.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: u32,
}

/// Order book depth for one market.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBook {
    pub ticker: String,
    pub yes_bids: Vec<PriceLevel>,
    pub yes_asks: Vec<PriceLevel>,
    pub no_bids: Vec<PriceLevel>,
    pub no_asks: Vec<PriceLevel>,
}

impl OrderBook {
    pub fn asks_for(&self, side: Side) -> &[PriceLevel] {
        match side {
            Side::Yes => &self.yes_asks,
            Side::No => &self.no_asks,
        }
    }

    pub fn bids_for(&self, side: Side) -> &[PriceLevel] {
        match side {
            Side::Yes => &self.yes_bids,
            Side::No => &self.no_bids,
        }
    }

    /// Total resting ask size at or below `price` on `side`.
    pub fn ask_size_at_or_below(&self, side: Side, price: f64) -> u32 {
        self.asks_for(side)
            .iter()
            .filter(|l| l.price <= price + 1e-9)
            .map(|l| l.size)
            .sum()
    }
}

/// Exchange rejected the request (as opposed to a transport failure).
#[derive(Debug, thiserror::Error)]
#[error("exchange rejected request: {status} - {message}")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

/// The seam between the engine and the exchange.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn get_balance(&self) -> Result<Balance>;

    /// Market snapshot, served from a short-lived cache unless `bust_cache`.
    async fn get_market(&self, ticker: &str, bust_cache: bool) -> Result<MarketSnapshot>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Orders for a ticker filtered by status (`"all"`, `"resting"`,
    /// `"executed"`). Used for fill verification during stale recovery.
    async fn get_orders(&self, ticker: &str, status: &str) -> Result<Vec<OrderInfo>>;

    async fn get_order_book(&self, ticker: &str, depth: u32) -> Result<OrderBook>;
}

/// Generate a client order id (idempotency key): timestamp + random hex.
pub fn generate_client_order_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let random: u64 = rand::random();
    format!("{:016x}-{:016x}", now as u64, random)
}

/// REST implementation of the gateway.
pub struct RestExchange {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    snapshot_ttl: Duration,
    snapshot_cache: Mutex<HashMap<String, (Instant, MarketSnapshot)>>,
}

impl RestExchange {
    /// Build a client from environment credentials.
    ///
    /// Returns an error when `EXCHANGE_API_KEY` / `EXCHANGE_API_SECRET` are
    /// not set; the caller decides whether that means dry-run.
    pub fn from_env(timeout_ms: u64, snapshot_cache_secs: u64) -> Result<Self> {
        let api_key =
            std::env::var("EXCHANGE_API_KEY").context("EXCHANGE_API_KEY not set")?;
        let api_secret =
            std::env::var("EXCHANGE_API_SECRET").context("EXCHANGE_API_SECRET not set")?;

        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: std::env::var("EXCHANGE_API_URL")
                .unwrap_or_else(|_| "https://api.exchange.example.com".to_string()),
            api_key,
            api_secret,
            snapshot_ttl: Duration::from_secs(snapshot_cache_secs),
            snapshot_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Client without credentials: market data still works, private
    /// endpoints get rejected by the exchange. Used for dry-run.
    pub fn unauthenticated(timeout_ms: u64, snapshot_cache_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: std::env::var("EXCHANGE_API_URL")
                .unwrap_or_else(|_| "https://api.exchange.example.com".to_string()),
            api_key: String::new(),
            api_secret: String::new(),
            snapshot_ttl: Duration::from_secs(snapshot_cache_secs),
            snapshot_cache: Mutex::new(HashMap::new()),
        })
    }

    /// HMAC-SHA256 over `timestamp + method + path`, base64-encoded.
    fn sign(&self, timestamp: &str, method: &str, path: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| anyhow!("Invalid API secret length"))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str) -> Result<Vec<(&'static str, String)>> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)?
            .as_millis()
            .to_string();
        let signature = self.sign(&timestamp, method, path)?;
        Ok(vec![
            ("EXCH-API-KEY", self.api_key.clone()),
            ("EXCH-TIMESTAMP", timestamp),
            ("EXCH-SIGNATURE", signature),
        ])
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.get(&url);
        for (name, value) in self.auth_headers("GET", path)? {
            req = req.header(name, value);
        }

        let response = req.send().await.context("Exchange request failed")?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError { status, message }.into());
        }

        response.json().await.context("Failed to parse exchange response")
    }

    async fn fetch_market(&self, ticker: &str) -> Result<MarketSnapshot> {
        self.get_json(&format!("/v1/markets/{}", ticker)).await
    }
}

#[async_trait]
impl ExchangeGateway for RestExchange {
    async fn get_balance(&self) -> Result<Balance> {
        self.get_json("/v1/portfolio/balance").await
    }

    async fn get_market(&self, ticker: &str, bust_cache: bool) -> Result<MarketSnapshot> {
        if !bust_cache {
            let cache = self.snapshot_cache.lock().await;
            if let Some((fetched_at, snapshot)) = cache.get(ticker) {
                if fetched_at.elapsed() < self.snapshot_ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let snapshot = self.fetch_market(ticker).await?;

        let mut cache = self.snapshot_cache.lock().await;
        cache.insert(ticker.to_string(), (Instant::now(), snapshot.clone()));
        // Settled markets never change again; no need to keep stale tickers around
        cache.retain(|_, (at, _)| at.elapsed() < self.snapshot_ttl * 4);

        Ok(snapshot)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse> {
        let path = "/v1/orders";
        let url = format!("{}{}", self.base_url, path);

        let mut req = self.client.post(&url).json(request);
        for (name, value) in self.auth_headers("POST", path)? {
            req = req.header(name, value);
        }

        debug!(
            "Placing order: {} {} {:?} {:?} {} @ {:.2}",
            request.client_order_id,
            request.ticker,
            request.action,
            request.side,
            request.count,
            request.price
        );

        let response = req.send().await.context("Order request failed")?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError { status, message }.into());
        }

        response.json().await.context("Failed to parse order response")
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let path = format!("/v1/orders/{}", order_id);
        let url = format!("{}{}", self.base_url, path);

        let mut req = self.client.delete(&url);
        for (name, value) in self.auth_headers("DELETE", &path)? {
            req = req.header(name, value);
        }

        let response = req.send().await.context("Cancel request failed")?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            // A cancel of an already-gone order is not worth failing a tick over
            if status == 404 {
                warn!("Cancel {}: order already gone", order_id);
                return Ok(());
            }
            return Err(ApiError { status, message }.into());
        }

        Ok(())
    }

    async fn get_orders(&self, ticker: &str, status: &str) -> Result<Vec<OrderInfo>> {
        #[derive(Deserialize)]
        struct OrdersResponse {
            orders: Vec<OrderInfo>,
        }

        let response: OrdersResponse = self
            .get_json(&format!("/v1/orders?ticker={}&status={}", ticker, status))
            .await?;
        Ok(response.orders)
    }

    async fn get_order_book(&self, ticker: &str, depth: u32) -> Result<OrderBook> {
        self.get_json(&format!("/v1/markets/{}/orderbook?depth={}", ticker, depth))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Yes.opposite(), Side::No);
        assert_eq!(Side::No.opposite(), Side::Yes);
    }

    #[test]
    fn test_snapshot_quote_accessors() {
        let snap = MarketSnapshot {
            ticker: "T".to_string(),
            status: MarketStatus::Open,
            yes_bid: 0.28,
            yes_ask: 0.30,
            no_bid: 0.70,
            no_ask: 0.72,
            close_time: Utc::now(),
            result: None,
            strike: None,
        };
        assert_eq!(snap.bid_for(Side::Yes), 0.28);
        assert_eq!(snap.ask_for(Side::No), 0.72);
    }

    #[test]
    fn test_order_book_depth_at_price() {
        let book = OrderBook {
            ticker: "T".to_string(),
            yes_bids: vec![],
            yes_asks: vec![
                PriceLevel { price: 0.27, size: 10 },
                PriceLevel { price: 0.29, size: 40 },
                PriceLevel { price: 0.31, size: 500 },
            ],
            no_bids: vec![],
            no_asks: vec![],
        };
        assert_eq!(book.ask_size_at_or_below(Side::Yes, 0.29), 50);
        assert_eq!(book.ask_size_at_or_below(Side::Yes, 0.20), 0);
    }

    #[test]
    fn test_client_order_ids_are_unique() {
        let a = generate_client_order_id();
        let b = generate_client_order_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 33);
    }
}
