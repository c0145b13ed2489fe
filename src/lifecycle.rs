//! Per-instance position lifecycle: the engine that runs one bot.
//!
//! One `BotEngine` owns everything a single instance needs for a tick:
//! entry gating, ladder execution, persistence ordering, and the open-position
//! monitoring loop (settlement, stale recovery, hard stop, profit lock,
//! advisory exits). The durable store is the source of truth for the open
//! position; in-memory flags never survive a restart and are always derived
//! by comparing persisted window keys against the clock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{InstanceConfig, LadderConfig, LifecycleConfig};
use crate::exchange::{
    generate_client_order_id, ExchangeGateway, MarketStatus, OrderAction, OrderRequest, Side,
    TimeInForce,
};
use crate::feed::MarketDataFeed;
use crate::ladder::{LadderOutcome, SpreadLadder};
use crate::risk::{contracts_for_budget, CapitalGate};
use crate::signal::{OpenLeg, ExitAction, SignalContext, SignalDecision, SignalProvider};
use crate::store::{AuditEntry, Position, Store, TradeRecord, WindowMeta};
use crate::window::{
    minutes_remaining, seconds_elapsed, seconds_remaining, ticker_for_window, window_key,
    window_start,
};

/// Open-position summary for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub ticker: String,
    pub side: Side,
    pub contracts: u32,
    pub entry_price: f64,
    pub window_key: String,
}

/// Aggregated per-instance status.
#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub id: String,
    pub running: bool,
    pub daily_pnl: f64,
    pub trade_count: usize,
    pub last_error: Option<String>,
    /// Why trading is paused, when it is (risk gate).
    pub pause_reason: Option<String>,
    /// Why the last tick skipped entry, for the dashboard.
    pub idle_reason: Option<String>,
    pub open_position: Option<PositionSummary>,
    pub last_tick: Option<DateTime<Utc>>,
}

impl BotStatus {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            running: false,
            daily_pnl: 0.0,
            trade_count: 0,
            last_error: None,
            pause_reason: None,
            idle_reason: None,
            open_position: None,
            last_tick: None,
        }
    }
}

/// The engine for one bot instance. Ticked by a single-flight task owned by
/// the orchestrator; nothing here is re-entrant.
pub struct BotEngine {
    cfg: InstanceConfig,
    lifecycle: LifecycleConfig,
    ladder: LadderConfig,
    gateway: Arc<dyn ExchangeGateway>,
    feed: Arc<dyn MarketDataFeed>,
    signal: Arc<dyn SignalProvider>,
    store: Arc<Store>,
    capital: Arc<CapitalGate>,
    status: Arc<Mutex<BotStatus>>,
    dry_run: bool,

    // Session-scoped state; deliberately not persisted.
    hard_stop_attempted: HashSet<String>,
    last_exit_attempt: Option<Instant>,
    last_advisory_check: Option<Instant>,
    window_open_cache: Option<(String, f64)>,
}

impl BotEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: InstanceConfig,
        lifecycle: LifecycleConfig,
        ladder: LadderConfig,
        gateway: Arc<dyn ExchangeGateway>,
        feed: Arc<dyn MarketDataFeed>,
        signal: Arc<dyn SignalProvider>,
        store: Arc<Store>,
        capital: Arc<CapitalGate>,
        status: Arc<Mutex<BotStatus>>,
        dry_run: bool,
    ) -> Self {
        Self {
            cfg,
            lifecycle,
            ladder,
            gateway,
            feed,
            signal,
            store,
            capital,
            status,
            dry_run,
            hard_stop_attempted: HashSet::new(),
            last_exit_attempt: None,
            last_advisory_check: None,
            window_open_cache: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    /// One tick. Errors are recoverable by design: the caller records them
    /// on the status surface and the next tick retries from durable state.
    pub async fn tick(&mut self) -> Result<()> {
        let now = Utc::now();

        self.capital.refresh_if_due().await?;

        let today = now.date_naive();
        let daily_pnl = self
            .store
            .daily_pnl(&self.cfg.id, today)
            .context("Failed to compute daily P&L")?;
        let trade_count = self.store.daily_trade_count(&self.cfg.id, today)?;

        let available = self.capital.available().await;
        let pause = self
            .capital
            .pause_reason(available, daily_pnl, self.cfg.max_daily_loss);

        // Sync the open position from the durable store every tick; the file
        // is authoritative, never the previous tick's memory.
        let position = self
            .store
            .load_position(&self.cfg.id)
            .context("Failed to load position")?;

        {
            let mut status = self.status.lock().unwrap();
            status.last_tick = Some(now);
            status.daily_pnl = daily_pnl;
            status.trade_count = trade_count;
            status.pause_reason = pause.clone();
            status.open_position = position.as_ref().map(summarize);
        }

        match position {
            Some(pos) => self.monitor(pos, now).await,
            None => {
                if let Some(reason) = pause {
                    // Paused, not stopped: re-evaluated next tick, lifts on
                    // rollover or balance recovery without intervention
                    debug!("[{}] paused: {}", self.cfg.id, reason);
                    self.set_idle_reason(reason);
                    Ok(())
                } else {
                    self.maybe_enter(now, available).await
                }
            }
        }
    }

    // ========================================================================
    // ENTRY
    // ========================================================================

    async fn maybe_enter(&mut self, now: DateTime<Utc>, available: f64) -> Result<()> {
        let wk = window_key(now, self.cfg.granularity);

        // Per-window counters are derived from the persisted key, never from
        // a flag that might predate a restart or a rollover
        let mut meta = match self.store.load_window_meta(&self.cfg.id)? {
            Some(meta) if meta.window_key == wk => meta,
            _ => WindowMeta {
                window_key: wk.clone(),
                last_decision_time: now,
                capital_deployed: 0.0,
                entries: 0,
            },
        };

        if meta.entries >= self.cfg.max_entries_per_window {
            self.set_idle_reason(format!(
                "already traded this window ({}/{} entries)",
                meta.entries, self.cfg.max_entries_per_window
            ));
            return Ok(());
        }

        let remaining = seconds_remaining(now, self.cfg.granularity);
        if remaining < self.cfg.entry_min_seconds_remaining {
            self.set_idle_reason(format!(
                "too close to settlement: {}s < {}s floor",
                remaining, self.cfg.entry_min_seconds_remaining
            ));
            return Ok(());
        }

        let ticker = ticker_for_window(&self.cfg.market_series, now, self.cfg.granularity);
        let snapshot = self
            .gateway
            .get_market(&ticker, false)
            .await
            .with_context(|| format!("Failed to fetch market {}", ticker))?;

        if snapshot.status != MarketStatus::Open {
            self.set_idle_reason(format!("market {} not open ({:?})", ticker, snapshot.status));
            return Ok(());
        }

        let underlying = self
            .feed
            .current_price()
            .await
            .context("Failed to fetch underlying price")?;
        let window_open = self.window_open_price(now, &wk).await;

        let ctx = SignalContext {
            ticker: ticker.clone(),
            yes_bid: snapshot.yes_bid,
            yes_ask: snapshot.yes_ask,
            no_bid: snapshot.no_bid,
            no_ask: snapshot.no_ask,
            underlying_price: underlying.price,
            window_open_price: window_open,
            seconds_elapsed: seconds_elapsed(now, self.cfg.granularity),
            seconds_remaining: remaining,
            available_capital: available,
            confidence_threshold: self.cfg.confidence_threshold,
        };

        // A failing provider must never abort the tick: the safe default is
        // simply not trading
        let decision = match self.signal.decide(&ctx).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("[{}] signal provider failed: {}", self.cfg.id, e);
                SignalDecision::NoTrade { reason: format!("signal error: {}", e) }
            }
        };

        let (direction, size_hint, rationale) = match decision {
            SignalDecision::NoTrade { reason } => {
                debug!("[{}] no trade: {}", self.cfg.id, reason);
                self.set_idle_reason(reason);
                return Ok(());
            }
            SignalDecision::Trade { direction, size_hint, rationale } => {
                (direction, size_hint, rationale)
            }
        };

        let ask = snapshot.ask_for(direction);
        if ask < self.cfg.min_ask || ask > self.cfg.max_ask {
            // Not an error: cheap asks are illiquid bait, expensive asks have
            // poor risk/reward
            let reason = format!(
                "ask {:.2} outside entry band [{:.2}, {:.2}]",
                ask, self.cfg.min_ask, self.cfg.max_ask
            );
            info!("[{}] skip entry: {}", self.cfg.id, reason);
            self.set_idle_reason(reason);
            return Ok(());
        }

        let window_budget_left = (self.cfg.capital_per_window - meta.capital_deployed).max(0.0);
        let mut budget =
            self.capital
                .position_size(available, self.cfg.capital_per_trade, window_budget_left);
        if let Some(hint) = size_hint {
            budget = budget.min(hint);
        }
        let contracts = contracts_for_budget(budget, ask);
        if contracts == 0 {
            self.set_idle_reason(format!(
                "budget ${:.2} too small at ask {:.2}",
                budget, ask
            ));
            return Ok(());
        }

        meta.last_decision_time = now;
        self.store.save_window_meta(&self.cfg.id, &meta)?;

        info!("═══════════════════════════════════════════════════════════════");
        info!("[{}] ENTRY SIGNAL", self.cfg.id);
        info!("  Ticker:     {}", ticker);
        info!("  Direction:  {}", direction);
        info!("  Ask:        {:.2}", ask);
        info!("  Contracts:  {} (${:.2} budget)", contracts, budget);
        info!("  Rationale:  {}", rationale);
        info!("═══════════════════════════════════════════════════════════════");

        let outcome = if self.dry_run {
            info!(
                "[DRY-RUN] [{}] would buy {} {} x{} @ {:.2}",
                self.cfg.id, ticker, direction, contracts, ask
            );
            LadderOutcome::Filled {
                order_id: format!("dry-run-{}", generate_client_order_id()),
                price: ask,
                count: contracts,
            }
        } else {
            let ladder = SpreadLadder::new(
                self.gateway.as_ref(),
                &self.ladder,
                &self.cfg.id,
                Some(self.store.as_ref()),
            );
            ladder
                .run_entry(
                    &ticker,
                    direction,
                    contracts,
                    minutes_remaining(now, self.cfg.granularity),
                )
                .await
        };

        match outcome {
            LadderOutcome::Filled { order_id, price, count }
            | LadderOutcome::MaxSteps { order_id, price, count } => {
                let cost = price * count as f64;
                let entry_fee = cost * self.capital.fee_rate();
                let position = Position {
                    ticker: ticker.clone(),
                    side: direction,
                    contracts: count,
                    entry_price: price,
                    cost,
                    entry_fee,
                    entry_time: now,
                    entry_ref_price: Some(underlying.price),
                    strike: snapshot.strike,
                    order_id: order_id.clone(),
                    signal_label: self.signal.name().to_string(),
                    window_key: wk,
                };

                // Persist before any other side effect: a believed fill that
                // is not on disk is the one unrecoverable gap
                self.store.save_position(&self.cfg.id, &position)?;

                meta.entries += 1;
                meta.capital_deployed += cost + entry_fee;
                self.store.save_window_meta(&self.cfg.id, &meta)?;
                self.capital.adjust_available(-(cost + entry_fee)).await;

                {
                    let mut status = self.status.lock().unwrap();
                    status.open_position = Some(summarize(&position));
                    status.idle_reason = None;
                }

                info!(
                    "[{}] OPEN: {} {} x{} @ {:.2} (cost ${:.2} + fee ${:.2}), order {}",
                    self.cfg.id, ticker, direction, count, price, cost, entry_fee, order_id
                );
                Ok(())
            }
            LadderOutcome::AccidentalFill { order_id, price } => {
                warn!(
                    "[{}] ladder bait sell filled accidentally (order {}, {:.2}); unwinding",
                    self.cfg.id, order_id, price
                );
                self.unwind_accidental_fill(&ticker, direction, now).await?;
                self.set_idle_reason("ladder accidental fill unwound".to_string());
                Ok(())
            }
            LadderOutcome::Aborted { reason } => {
                debug!("[{}] entry aborted: {}", self.cfg.id, reason);
                self.set_idle_reason(format!("entry aborted: {}", reason));
                Ok(())
            }
        }
    }

    /// The bait sell executed against us: we are short one contract we never
    /// owned. Buy it back immediately at the ask, whatever the price.
    async fn unwind_accidental_fill(
        &mut self,
        ticker: &str,
        side: Side,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let snapshot = self.gateway.get_market(ticker, true).await?;
        let ask = snapshot.ask_for(side);
        let request = OrderRequest {
            ticker: ticker.to_string(),
            side,
            action: OrderAction::Buy,
            count: 1,
            price: if ask > 0.0 { ask } else { 0.99 },
            client_order_id: generate_client_order_id(),
            time_in_force: TimeInForce::Ioc,
        };

        let result = self.gateway.place_order(&request).await;
        self.store.append_audit(&AuditEntry {
            timestamp: now,
            bot_id: self.cfg.id.clone(),
            ticker: ticker.to_string(),
            side,
            action: OrderAction::Buy,
            count: 1,
            price: request.price,
            client_order_id: request.client_order_id.clone(),
            order_id: result.as_ref().ok().map(|r| r.order_id.clone()),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            context: "accidental fill unwind".to_string(),
        })?;

        match result {
            Ok(response) => {
                info!("[{}] accidental fill unwound, order {}", self.cfg.id, response.order_id);
                Ok(())
            }
            Err(e) => Err(e).context("Failed to unwind accidental fill"),
        }
    }

    // ========================================================================
    // MONITORING
    // ========================================================================

    async fn monitor(&mut self, position: Position, now: DateTime<Utc>) -> Result<()> {
        let snapshot = self
            .gateway
            .get_market(&position.ticker, false)
            .await
            .with_context(|| format!("Failed to fetch market {}", position.ticker))?;

        if snapshot.status == MarketStatus::Settled {
            return self.settle(&position, snapshot.result).await;
        }

        // Stale: closed (or somehow still "open") well past close time with
        // no settlement observed
        let past_close = now.signed_duration_since(snapshot.close_time).num_seconds();
        if past_close > self.lifecycle.stale_grace_secs as i64 {
            return self.recover_stale(&position, now).await;
        }

        if snapshot.status == MarketStatus::Closed {
            // Expired, result pending. Monitor-only wait; blocks nothing.
            debug!(
                "[{}] {} closed, awaiting settlement result",
                self.cfg.id, position.ticker
            );
            self.set_idle_reason("awaiting settlement result".to_string());
            return Ok(());
        }

        let bid = snapshot.bid_for(position.side);
        let minutes_to_close =
            (snapshot.close_time.signed_duration_since(now).num_seconds().max(0) as f64) / 60.0;

        // Hard stop: the market has turned hard against us and someone is
        // still bidding. One attempt per ticker per session; a failing exit
        // must not become a retry loop
        if bid > 0.0
            && bid < self.lifecycle.hard_stop_probability
            && !self.hard_stop_attempted.contains(&position.ticker)
        {
            info!(
                "[{}] hard stop: {} bid {:.2} below {:.2}",
                self.cfg.id, position.ticker, bid, self.lifecycle.hard_stop_probability
            );
            let exited = self
                .attempt_exit(&position, bid, "hard stop", true, minutes_to_close, now)
                .await;
            if !exited {
                self.hard_stop_attempted.insert(position.ticker.clone());
                info!(
                    "[{}] hard stop exit failed; holding {} to settlement",
                    self.cfg.id, position.ticker
                );
            }
            return Ok(());
        }

        // Near settlement with unrealized profit: take it rather than risk a
        // reversal at the close
        let seconds_to_close = snapshot.close_time.signed_duration_since(now).num_seconds();
        if seconds_to_close > 0
            && (seconds_to_close as u64) < self.lifecycle.profit_lock_secs as u64
            && bid > position.entry_price
        {
            info!(
                "[{}] profit lock: {}s to close, bid {:.2} > entry {:.2}",
                self.cfg.id, seconds_to_close, bid, position.entry_price
            );
            self.attempt_exit(&position, bid, "profit lock", true, minutes_to_close, now)
                .await;
            return Ok(());
        }

        // Periodic advisory re-evaluation of open legs
        if self.signal.supports_exit_advice() && self.advisory_check_due() {
            self.last_advisory_check = Some(Instant::now());
            let legs = vec![OpenLeg {
                ticker: position.ticker.clone(),
                side: position.side,
                entry_price: position.entry_price,
                current_bid: bid,
                contracts: position.contracts,
            }];
            let advice = match self.signal.exit_check(&legs).await {
                Ok(advice) => advice,
                Err(e) => {
                    // Safe default: hold
                    warn!("[{}] advisory exit check failed: {}", self.cfg.id, e);
                    Vec::new()
                }
            };
            let wants_exit = advice
                .iter()
                .any(|a| a.ticker == position.ticker && a.action == ExitAction::Exit);
            if wants_exit && bid > 0.0 {
                info!("[{}] advisory exit for {}", self.cfg.id, position.ticker);
                self.attempt_exit(&position, bid, "advisory exit", false, minutes_to_close, now)
                    .await;
                return Ok(());
            }
        }

        debug!(
            "[{}] holding {} {} x{} @ {:.2}, bid {:.2}, {:.1}m to close",
            self.cfg.id,
            position.ticker,
            position.side,
            position.contracts,
            position.entry_price,
            bid,
            minutes_to_close
        );
        Ok(())
    }

    // ========================================================================
    // TERMINAL TRANSITIONS
    // ========================================================================

    /// Settlement observed. Terminal: clear the position, append exactly one
    /// ledger record. Settlement pays out fee-free.
    async fn settle(&mut self, position: &Position, result: Option<Side>) -> Result<()> {
        let won = result == Some(position.side);
        let payout = if won { position.contracts as f64 } else { 0.0 };
        let net_pnl = payout - position.cost - position.entry_fee;

        let record = TradeRecord {
            id: generate_client_order_id(),
            bot_id: self.cfg.id.clone(),
            signal_label: position.signal_label.clone(),
            ticker: position.ticker.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price: if won { 1.0 } else { 0.0 },
            contracts: position.contracts,
            cost: position.cost,
            net_pnl,
            won,
            exit_reason: format!(
                "settled {}",
                result.map(|s| s.to_string()).unwrap_or_else(|| "void".to_string())
            ),
            window_key: position.window_key.clone(),
            closed_at: Utc::now(),
        };

        // Clear before append: re-reading the same settled snapshot next tick
        // finds no position and cannot double-record
        self.store.clear_position(&self.cfg.id)?;
        self.store.append_trade(&record)?;
        if payout > 0.0 {
            self.capital.adjust_available(payout).await;
        }
        self.after_terminal(&record);

        info!("═══════════════════════════════════════════════════════════════");
        info!(
            "[{}] SETTLED {}: {} {} x{} @ {:.2} → net ${:+.2}",
            self.cfg.id,
            if won { "WIN" } else { "LOSS" },
            position.ticker,
            position.side,
            position.contracts,
            position.entry_price,
            net_pnl
        );
        info!("═══════════════════════════════════════════════════════════════");
        Ok(())
    }

    /// The market closed long ago and no settlement has been observed.
    /// Force fresh data; failing that, reconcile against our own order's
    /// fill history. The bias throughout is to never fabricate a loss that
    /// may not have happened.
    async fn recover_stale(&mut self, position: &Position, now: DateTime<Utc>) -> Result<()> {
        info!(
            "[{}] stale position on {}: forcing fresh fetch",
            self.cfg.id, position.ticker
        );

        let fresh = self
            .gateway
            .get_market(&position.ticker, true)
            .await
            .with_context(|| format!("Stale refetch failed for {}", position.ticker))?;

        if fresh.status == MarketStatus::Settled {
            return self.settle(position, fresh.result).await;
        }

        // No result available. Our order's fill history decides what, if
        // anything, we actually owned.
        let verdict = match self.gateway.get_orders(&position.ticker, "all").await {
            Ok(orders) => match orders.iter().find(|o| o.order_id == position.order_id) {
                Some(order) if order.fill_count == 0 => StaleVerdict::NeverFilled,
                Some(_) => StaleVerdict::Filled,
                None => StaleVerdict::Indeterminate("order not in history".to_string()),
            },
            Err(e) => StaleVerdict::Indeterminate(e.to_string()),
        };

        let (net_pnl, exit_reason) = match verdict {
            StaleVerdict::NeverFilled => {
                // The exchange silently dropped the order; no capital was
                // ever deployed
                self.capital
                    .adjust_available(position.cost + position.entry_fee)
                    .await;
                (
                    0.0,
                    "order never filled; stale market closed with zero risk".to_string(),
                )
            }
            StaleVerdict::Filled => (
                -(position.cost + position.entry_fee),
                "stale market never settled; cost basis written off".to_string(),
            ),
            StaleVerdict::Indeterminate(why) => (
                0.0,
                format!("fill status indeterminate ({}); assuming no fill", why),
            ),
        };

        let record = TradeRecord {
            id: generate_client_order_id(),
            bot_id: self.cfg.id.clone(),
            signal_label: position.signal_label.clone(),
            ticker: position.ticker.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price: 0.0,
            contracts: position.contracts,
            cost: position.cost,
            net_pnl,
            won: false,
            exit_reason,
            window_key: position.window_key.clone(),
            closed_at: now,
        };

        self.store.clear_position(&self.cfg.id)?;
        self.store.append_trade(&record)?;
        self.after_terminal(&record);

        warn!(
            "[{}] stale position resolved: {} net ${:+.2} ({})",
            self.cfg.id, position.ticker, record.net_pnl, record.exit_reason
        );
        Ok(())
    }

    /// Try to sell the position at the market. Returns whether it closed.
    async fn attempt_exit(
        &mut self,
        position: &Position,
        bid: f64,
        reason: &str,
        direct: bool,
        minutes_to_close: f64,
        now: DateTime<Utc>,
    ) -> bool {
        // A persistent placement failure must not spam the exchange every tick
        if let Some(at) = self.last_exit_attempt {
            let cooldown = Duration::from_secs(self.lifecycle.exit_cooldown_secs);
            if at.elapsed() < cooldown {
                debug!("[{}] exit cooldown active, skipping {}", self.cfg.id, reason);
                return false;
            }
        }
        self.last_exit_attempt = Some(Instant::now());

        let outcome = if self.dry_run {
            info!(
                "[DRY-RUN] [{}] would sell {} x{} @ {:.2} ({})",
                self.cfg.id, position.ticker, position.contracts, bid, reason
            );
            LadderOutcome::Filled {
                order_id: format!("dry-run-{}", generate_client_order_id()),
                price: bid,
                count: position.contracts,
            }
        } else {
            let ladder = SpreadLadder::new(
                self.gateway.as_ref(),
                &self.ladder,
                &self.cfg.id,
                Some(self.store.as_ref()),
            );
            ladder
                .run_exit(
                    &position.ticker,
                    position.side,
                    position.contracts,
                    minutes_to_close,
                    direct,
                )
                .await
        };

        match outcome {
            LadderOutcome::Filled { price, .. } | LadderOutcome::MaxSteps { price, .. } => {
                if let Err(e) = self.close_flat(position, price, reason, now).await {
                    self.record_error(format!("exit bookkeeping failed: {}", e));
                }
                true
            }
            LadderOutcome::AccidentalFill { .. } => {
                // Exit mode sells what we own; a fill is success, not accident
                true
            }
            LadderOutcome::Aborted { reason: why } => {
                warn!("[{}] exit ({}) failed: {}", self.cfg.id, reason, why);
                self.record_error(format!("exit ({}) failed: {}", reason, why));
                false
            }
        }
    }

    /// An early close at `exit_price`. Taker fee applies to the proceeds.
    async fn close_flat(
        &mut self,
        position: &Position,
        exit_price: f64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let proceeds = exit_price * position.contracts as f64;
        let exit_fee = proceeds * self.capital.fee_rate();
        let net_pnl = proceeds - exit_fee - position.cost - position.entry_fee;

        let record = TradeRecord {
            id: generate_client_order_id(),
            bot_id: self.cfg.id.clone(),
            signal_label: position.signal_label.clone(),
            ticker: position.ticker.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            contracts: position.contracts,
            cost: position.cost,
            net_pnl,
            won: net_pnl > 0.0,
            exit_reason: reason.to_string(),
            window_key: position.window_key.clone(),
            closed_at: now,
        };

        self.store.clear_position(&self.cfg.id)?;
        self.store.append_trade(&record)?;
        self.capital.adjust_available(proceeds - exit_fee).await;
        self.after_terminal(&record);

        info!(
            "[{}] CLOSED ({}): {} x{} {:.2} → {:.2}, net ${:+.2}",
            self.cfg.id,
            reason,
            position.ticker,
            position.contracts,
            position.entry_price,
            exit_price,
            net_pnl
        );
        Ok(())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn window_open_price(&mut self, now: DateTime<Utc>, wk: &str) -> Option<f64> {
        if let Some((cached_key, price)) = &self.window_open_cache {
            if cached_key == wk {
                return Some(*price);
            }
        }
        match self
            .feed
            .window_open_price(window_start(now, self.cfg.granularity))
            .await
        {
            Ok(price) => {
                self.window_open_cache = Some((wk.to_string(), price));
                Some(price)
            }
            Err(e) => {
                debug!("[{}] window open price unavailable: {}", self.cfg.id, e);
                None
            }
        }
    }

    fn advisory_check_due(&self) -> bool {
        match self.last_advisory_check {
            Some(at) => {
                at.elapsed() >= Duration::from_secs(self.lifecycle.advisory_exit_interval_secs)
            }
            None => true,
        }
    }

    fn after_terminal(&self, record: &TradeRecord) {
        let mut status = self.status.lock().unwrap();
        status.open_position = None;
        status.daily_pnl += record.net_pnl;
        status.trade_count += 1;
    }

    fn set_idle_reason(&self, reason: String) {
        self.status.lock().unwrap().idle_reason = Some(reason);
    }

    fn record_error(&self, error: String) {
        self.status.lock().unwrap().last_error = Some(error);
    }
}

enum StaleVerdict {
    NeverFilled,
    Filled,
    Indeterminate(String),
}

fn summarize(position: &Position) -> PositionSummary {
    PositionSummary {
        ticker: position.ticker.clone(),
        side: position.side,
        contracts: position.contracts,
        entry_price: position.entry_price,
        window_key: position.window_key.clone(),
    }
}
