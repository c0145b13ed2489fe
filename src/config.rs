use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::window::Granularity;

/// Top-level configuration loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub advisor: AdvisorConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub ladder: LadderConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    pub bots: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// API request timeout (ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How long a market snapshot may be served from cache
    #[serde(default = "default_snapshot_cache_secs")]
    pub snapshot_cache_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            snapshot_cache_secs: default_snapshot_cache_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub base_url: String,
    #[serde(default = "default_feed_symbol")]
    pub symbol: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: default_feed_url(),
            symbol: default_feed_symbol(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvisorConfig {
    /// Advisory endpoint; empty disables advisory instances
    #[serde(default)]
    pub base_url: String,
    /// Advisory calls can take seconds
    #[serde(default = "default_advisor_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_ms: default_advisor_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Balance fetch cadence (seconds); cached value is used between fetches
    #[serde(default = "default_balance_refresh_secs")]
    pub balance_refresh_secs: u64,
    /// Pause all entries when available capital falls below this
    #[serde(default = "default_balance_floor")]
    pub balance_floor: f64,
    /// Taker fee on entry cost and early-exit proceeds (settlement is free)
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    /// Smallest position worth placing
    #[serde(default = "default_min_position_usd")]
    pub min_position_usd: f64,
    /// Absolute sizing ceiling, before per-trade and per-window caps
    #[serde(default = "default_max_position_usd")]
    pub max_position_usd: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            balance_refresh_secs: default_balance_refresh_secs(),
            balance_floor: default_balance_floor(),
            fee_rate: default_fee_rate(),
            min_position_usd: default_min_position_usd(),
            max_position_usd: default_max_position_usd(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LadderConfig {
    /// Max place/cancel cycles before going direct
    #[serde(default = "default_ladder_max_steps")]
    pub max_steps: u32,
    /// One price tick
    #[serde(default = "default_tick")]
    pub tick: f64,
    /// Target improvement versus the initial ask
    #[serde(default = "default_entry_discount")]
    pub entry_discount: f64,
    /// Unresponsive ticks before assuming no quoter is present
    #[serde(default = "default_unresponsive_ticks")]
    pub unresponsive_ticks: u32,
    /// Wait between ladder steps (ms)
    #[serde(default = "default_step_wait_ms")]
    pub step_wait_ms: u64,
    /// Skip the ladder entirely under this many minutes remaining
    #[serde(default = "default_ladder_min_minutes")]
    pub min_minutes_remaining: f64,
    /// Resting ask size at the target that means real sellers are present
    #[serde(default = "default_deep_ask_size")]
    pub deep_ask_size: u32,
    /// Order book depth to request for the deep-size guard
    #[serde(default = "default_book_depth")]
    pub book_depth: u32,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            max_steps: default_ladder_max_steps(),
            tick: default_tick(),
            entry_discount: default_entry_discount(),
            unresponsive_ticks: default_unresponsive_ticks(),
            step_wait_ms: default_step_wait_ms(),
            min_minutes_remaining: default_ladder_min_minutes(),
            deep_ask_size: default_deep_ask_size(),
            book_depth: default_book_depth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Exit at the bid when the held side's implied probability drops below this
    #[serde(default = "default_hard_stop_probability")]
    pub hard_stop_probability: f64,
    /// Lock in positive unrealized P&L under this many seconds remaining
    #[serde(default = "default_profit_lock_secs")]
    pub profit_lock_secs: u32,
    /// How long past close time before a position counts as stale
    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,
    /// Minimum wait between exit attempts
    #[serde(default = "default_exit_cooldown_secs")]
    pub exit_cooldown_secs: u64,
    /// Cadence of advisory exit checks
    #[serde(default = "default_advisory_exit_secs")]
    pub advisory_exit_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            hard_stop_probability: default_hard_stop_probability(),
            profit_lock_secs: default_profit_lock_secs(),
            stale_grace_secs: default_stale_grace_secs(),
            exit_cooldown_secs: default_exit_cooldown_secs(),
            advisory_exit_interval_secs: default_advisory_exit_secs(),
        }
    }
}

/// Which signal provider drives an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Momentum,
    Advisory,
}

/// One named bot instance.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub granularity: Granularity,
    /// Exchange market series, e.g. "BTC-15M"; the window key completes the ticker
    pub market_series: String,
    pub signal: SignalKind,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Fixed per-trade budget
    #[serde(default = "default_capital_per_trade")]
    pub capital_per_trade: f64,
    /// Total capital deployable within one window
    #[serde(default = "default_capital_per_window")]
    pub capital_per_window: f64,
    /// Pause this instance once today's realized loss reaches this
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    /// Providers below this confidence decline to trade
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Asks below this are assumed illiquid / likely rejected
    #[serde(default = "default_min_ask")]
    pub min_ask: f64,
    /// Asks above this have poor risk/reward
    #[serde(default = "default_max_ask")]
    pub max_ask: f64,
    /// No new entries under this many seconds remaining
    #[serde(default = "default_entry_min_seconds_remaining")]
    pub entry_min_seconds_remaining: u32,
    #[serde(default = "default_max_entries_per_window")]
    pub max_entries_per_window: u32,
}

fn default_state_dir() -> String { "data".to_string() }
fn default_request_timeout_ms() -> u64 { 5000 }
fn default_snapshot_cache_secs() -> u64 { 30 }
fn default_feed_url() -> String { "https://api.binance.com".to_string() }
fn default_feed_symbol() -> String { "BTCUSDT".to_string() }
fn default_advisor_timeout_ms() -> u64 { 15000 }
fn default_balance_refresh_secs() -> u64 { 60 }
fn default_balance_floor() -> f64 { 5.0 }
fn default_fee_rate() -> f64 { 0.015 }
fn default_min_position_usd() -> f64 { 1.0 }
fn default_max_position_usd() -> f64 { 50.0 }
fn default_ladder_max_steps() -> u32 { 6 }
fn default_tick() -> f64 { 0.01 }
fn default_entry_discount() -> f64 { 0.03 }
fn default_unresponsive_ticks() -> u32 { 2 }
fn default_step_wait_ms() -> u64 { 800 }
fn default_ladder_min_minutes() -> f64 { 3.0 }
fn default_deep_ask_size() -> u32 { 100 }
fn default_book_depth() -> u32 { 10 }
fn default_hard_stop_probability() -> f64 { 0.10 }
fn default_profit_lock_secs() -> u32 { 120 }
fn default_stale_grace_secs() -> u64 { 600 }
fn default_exit_cooldown_secs() -> u64 { 60 }
fn default_advisory_exit_secs() -> u64 { 180 }
fn default_true() -> bool { true }
fn default_tick_interval_secs() -> u64 { 5 }
fn default_capital_per_trade() -> f64 { 10.0 }
fn default_capital_per_window() -> f64 { 20.0 }
fn default_max_daily_loss() -> f64 { 25.0 }
fn default_confidence_threshold() -> f64 { 0.6 }
fn default_min_ask() -> f64 { 0.05 }
fn default_max_ask() -> f64 { 0.48 }
fn default_entry_min_seconds_remaining() -> u32 { 180 }
fn default_max_entries_per_window() -> u32 { 1 }

impl AppConfig {
    /// Load configuration from YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| "Failed to parse YAML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;

        if let Ok(val) = std::env::var("BOT_STATE_DIR") {
            config.state_dir = val;
        }
        if let Ok(val) = std::env::var("BOT_BALANCE_FLOOR") {
            config.risk.balance_floor = val.parse().unwrap_or(config.risk.balance_floor);
        }
        if let Ok(val) = std::env::var("BOT_FEE_RATE") {
            config.risk.fee_rate = val.parse().unwrap_or(config.risk.fee_rate);
        }
        if let Ok(val) = std::env::var("BOT_BALANCE_REFRESH_SECS") {
            config.risk.balance_refresh_secs =
                val.parse().unwrap_or(config.risk.balance_refresh_secs);
        }
        if let Ok(val) = std::env::var("ADVISOR_URL") {
            config.advisor.base_url = val;
        }
        if let Ok(val) = std::env::var("FEED_API_URL") {
            config.feed.base_url = val;
        }

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bots.is_empty() {
            bail!("Configuration defines no bot instances");
        }
        let mut seen = std::collections::HashSet::new();
        for bot in &self.bots {
            if bot.id.is_empty() {
                bail!("Bot instance with empty id");
            }
            if !seen.insert(bot.id.as_str()) {
                bail!("Duplicate bot id: {}", bot.id);
            }
            if !(2.9..=10.1).contains(&(bot.tick_interval_secs as f64)) {
                bail!("Bot {}: tick_interval_secs must be between 3 and 10", bot.id);
            }
            if bot.min_ask >= bot.max_ask {
                bail!("Bot {}: min_ask must be below max_ask", bot.id);
            }
            if bot.signal == SignalKind::Advisory
                && self.advisor.base_url.is_empty()
                && std::env::var("ADVISOR_URL").is_err()
            {
                bail!("Bot {}: advisory signal requires advisor.base_url or ADVISOR_URL", bot.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
bots:
  - id: btc-15m
    granularity: 15m
    market_series: BTC-15M
    signal: momentum
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: AppConfig = serde_yaml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.state_dir, "data");
        assert_eq!(config.risk.balance_refresh_secs, 60);
        assert!((config.risk.fee_rate - 0.015).abs() < 1e-9);
        assert_eq!(config.ladder.max_steps, 6);

        let bot = &config.bots[0];
        assert!(bot.enabled);
        assert_eq!(bot.tick_interval_secs, 5);
        assert!((bot.min_ask - 0.05).abs() < 1e-9);
        assert!((bot.max_ask - 0.48).abs() < 1e-9);
        assert_eq!(bot.max_entries_per_window, 1);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = r#"
bots:
  - id: same
    granularity: 15m
    market_series: BTC-15M
    signal: momentum
  - id: same
    granularity: hourly
    market_series: BTC-1H
    signal: momentum
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tick_interval_bounds() {
        let yaml = r#"
bots:
  - id: fast
    granularity: 15m
    market_series: BTC-15M
    signal: momentum
    tick_interval_secs: 1
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_advisory_requires_endpoint() {
        let yaml = r#"
bots:
  - id: advised
    granularity: hourly
    market_series: BTC-1H
    signal: advisory
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        // No advisor.base_url configured
        if std::env::var("ADVISOR_URL").is_err() {
            assert!(config.validate().is_err());
        }
    }
}
