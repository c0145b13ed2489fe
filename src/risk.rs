//! Capital and risk gating.
//!
//! One `CapitalGate` is shared by every instance: the exchange account is a
//! single pot, so the cached balance is process-wide and whichever
//! instance's tick crosses the refresh deadline first refreshes it for all.
//! Per-instance exposure is bounded separately by per-trade and per-window
//! budgets.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RiskConfig;
use crate::exchange::ExchangeGateway;

struct BalanceCache {
    available: f64,
    fetched_at: Option<Instant>,
}

pub struct CapitalGate {
    gateway: Arc<dyn ExchangeGateway>,
    config: RiskConfig,
    cache: Mutex<BalanceCache>,
}

impl CapitalGate {
    /// `initial_balance` seeds the cache so sizing works before the first
    /// successful fetch (and in dry-run, where balance calls may fail).
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        config: RiskConfig,
        initial_balance: f64,
    ) -> Self {
        Self {
            gateway,
            config,
            cache: Mutex::new(BalanceCache {
                available: initial_balance,
                fetched_at: None,
            }),
        }
    }

    /// Fetch the balance if the refresh cadence has elapsed. Fetch failures
    /// keep the cached value; the loop never blocks on a fresh balance.
    pub async fn refresh_if_due(&self) -> Result<()> {
        let due = {
            let cache = self.cache.lock().await;
            match cache.fetched_at {
                Some(at) => at.elapsed() >= Duration::from_secs(self.config.balance_refresh_secs),
                None => true,
            }
        };
        if !due {
            return Ok(());
        }

        match self.gateway.get_balance().await {
            Ok(balance) => {
                let mut cache = self.cache.lock().await;
                cache.available = balance.available;
                cache.fetched_at = Some(Instant::now());
                debug!(
                    "Balance refreshed: ${:.2} available, ${:.2} pending payout",
                    balance.available, balance.pending_payout
                );
            }
            Err(e) => {
                // Stamp the attempt so a dead endpoint is retried on cadence,
                // not on every tick
                let mut cache = self.cache.lock().await;
                cache.fetched_at = Some(Instant::now());
                warn!("Balance fetch failed, using cached value: {}", e);
            }
        }
        Ok(())
    }

    pub async fn available(&self) -> f64 {
        self.cache.lock().await.available
    }

    /// Record capital committed or returned without waiting for the next
    /// refresh, so back-to-back entries see a shrinking pot.
    pub async fn adjust_available(&self, delta: f64) {
        let mut cache = self.cache.lock().await;
        cache.available = (cache.available + delta).max(0.0);
    }

    /// Why trading must pause right now, if it must. Re-evaluated every
    /// tick; clears on its own at UTC rollover (daily P&L is recomputed from
    /// the ledger) or when the balance recovers.
    pub fn pause_reason(
        &self,
        available: f64,
        daily_pnl: f64,
        max_daily_loss: f64,
    ) -> Option<String> {
        if available < self.config.balance_floor {
            return Some(format!(
                "capital ${:.2} below floor ${:.2}",
                available, self.config.balance_floor
            ));
        }
        if daily_pnl <= -max_daily_loss {
            return Some(format!(
                "daily loss ${:.2} breaches limit ${:.2}",
                -daily_pnl, max_daily_loss
            ));
        }
        None
    }

    /// Dollars to deploy for the next entry.
    ///
    /// Tiered fraction of capital (small accounts trade a larger share),
    /// clamped to the absolute floor/ceiling, then capped by the per-trade
    /// budget and whatever is left of the window budget. Returns 0.0 when
    /// the result is too small to bother with.
    pub fn position_size(&self, available: f64, per_trade: f64, window_remaining: f64) -> f64 {
        let fraction = if available < 25.0 {
            0.20
        } else if available < 75.0 {
            0.10
        } else {
            0.05
        };

        let size = (available * fraction)
            .clamp(self.config.min_position_usd, self.config.max_position_usd)
            .min(per_trade)
            .min(window_remaining);

        if size < self.config.min_position_usd {
            0.0
        } else {
            size
        }
    }

    pub fn fee_rate(&self) -> f64 {
        self.config.fee_rate
    }
}

/// Contracts purchasable with `budget` at `ask`, rounded down.
pub fn contracts_for_budget(budget: f64, ask: f64) -> u32 {
    if ask <= 0.0 {
        return 0;
    }
    (budget / ask).floor() as u32
}
