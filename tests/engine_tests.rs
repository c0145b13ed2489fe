//! Critical path tests for the bot engine.
//!
//! These drive the real engine against scripted mock collaborators and
//! verify the invariants that matter with money on the line:
//! 1. Entry sizing and the persisted position record
//! 2. At most one entry per window, no matter how many ticks fire
//! 3. Settlement is terminal and exactly-once
//! 4. Restart with persisted state never double-trades
//! 5. Stale-position recovery never fabricates a loss
//! 6. The spread ladder never exceeds its step budget
//!
//! Run with: cargo test --test engine_tests

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use event_window_bot::config::{
    InstanceConfig, LadderConfig, LifecycleConfig, RiskConfig, SignalKind,
};
use event_window_bot::exchange::{
    Balance, ExchangeGateway, MarketSnapshot, MarketStatus, OrderAction, OrderBook, OrderInfo,
    OrderRequest, OrderResponse, Side, TimeInForce,
};
use event_window_bot::feed::{Candle, MarketDataFeed, PriceTick};
use event_window_bot::ladder::{LadderOutcome, SpreadLadder};
use event_window_bot::lifecycle::{BotEngine, BotStatus};
use event_window_bot::risk::CapitalGate;
use event_window_bot::signal::{SignalContext, SignalDecision, SignalProvider};
use event_window_bot::store::{Position, Store, TradeRecord, WindowMeta};
use event_window_bot::window::{window_key, Granularity};

// ============================================================================
// MOCK COLLABORATORS
// ============================================================================

#[derive(Default)]
struct MockExchangeState {
    /// Snapshots served in order; the last one keeps repeating.
    snapshots: VecDeque<MarketSnapshot>,
    /// Orders the engine placed, in order.
    placed: Vec<OrderRequest>,
    cancelled: Vec<String>,
    /// Fill history served by `get_orders`.
    order_history: Vec<OrderInfo>,
    /// When true, GTC placements report an immediate fill (bait gets lifted).
    fill_resting: bool,
    /// When true, every placement errors.
    fail_orders: bool,
    order_seq: u32,
}

struct MockExchange {
    state: Mutex<MockExchangeState>,
}

impl MockExchange {
    fn new(snapshots: Vec<MarketSnapshot>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockExchangeState {
                snapshots: snapshots.into_iter().collect(),
                ..Default::default()
            }),
        })
    }

    fn push_snapshot(&self, snapshot: MarketSnapshot) {
        self.state.lock().unwrap().snapshots.push_back(snapshot);
    }

    fn set_order_history(&self, orders: Vec<OrderInfo>) {
        self.state.lock().unwrap().order_history = orders;
    }

    fn set_fill_resting(&self, yes: bool) {
        self.state.lock().unwrap().fill_resting = yes;
    }

    fn set_fail_orders(&self, yes: bool) {
        self.state.lock().unwrap().fail_orders = yes;
    }

    fn placed(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().placed.clone()
    }

    fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    fn buys(&self) -> Vec<OrderRequest> {
        self.placed()
            .into_iter()
            .filter(|o| o.action == OrderAction::Buy)
            .collect()
    }

    fn bait_sells(&self) -> Vec<OrderRequest> {
        self.placed()
            .into_iter()
            .filter(|o| {
                o.action == OrderAction::Sell && o.count == 1 && o.time_in_force == TimeInForce::Gtc
            })
            .collect()
    }
}

#[async_trait]
impl ExchangeGateway for MockExchange {
    async fn get_balance(&self) -> Result<Balance> {
        Ok(Balance { available: 100.0, pending_payout: 0.0 })
    }

    async fn get_market(&self, _ticker: &str, _bust_cache: bool) -> Result<MarketSnapshot> {
        let mut state = self.state.lock().unwrap();
        if state.snapshots.len() > 1 {
            Ok(state.snapshots.pop_front().unwrap())
        } else {
            state
                .snapshots
                .front()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no snapshot scripted"))
        }
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse> {
        let mut state = self.state.lock().unwrap();
        if state.fail_orders {
            anyhow::bail!("exchange unavailable");
        }
        state.placed.push(request.clone());
        state.order_seq += 1;
        let order_id = format!("mock-{}", state.order_seq);

        let fill_count = match request.time_in_force {
            TimeInForce::Ioc => request.count,
            TimeInForce::Gtc => {
                if state.fill_resting {
                    request.count
                } else {
                    0
                }
            }
        };

        Ok(OrderResponse {
            order_id,
            status: if fill_count > 0 { "executed".into() } else { "resting".into() },
            fill_count,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.state.lock().unwrap().cancelled.push(order_id.to_string());
        Ok(())
    }

    async fn get_orders(&self, _ticker: &str, _status: &str) -> Result<Vec<OrderInfo>> {
        Ok(self.state.lock().unwrap().order_history.clone())
    }

    async fn get_order_book(&self, ticker: &str, _depth: u32) -> Result<OrderBook> {
        Ok(OrderBook {
            ticker: ticker.to_string(),
            yes_bids: vec![],
            yes_asks: vec![],
            no_bids: vec![],
            no_asks: vec![],
        })
    }
}

struct MockFeed;

#[async_trait]
impl MarketDataFeed for MockFeed {
    async fn current_price(&self) -> Result<PriceTick> {
        Ok(PriceTick { price: 50_200.0, timestamp: Utc::now() })
    }

    async fn window_open_price(&self, _window_start: DateTime<Utc>) -> Result<f64> {
        Ok(50_000.0)
    }

    async fn recent_candles(&self, _limit: u32) -> Result<Vec<Candle>> {
        Ok(vec![])
    }
}

/// Signal that always wants to buy YES.
struct AlwaysYes;

impl AlwaysYes {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl SignalProvider for AlwaysYes {
    fn name(&self) -> &str {
        "always-yes"
    }

    async fn decide(&self, _ctx: &SignalContext) -> Result<SignalDecision> {
        Ok(SignalDecision::Trade {
            direction: Side::Yes,
            size_hint: None,
            rationale: "scripted".to_string(),
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

fn instance(id: &str) -> InstanceConfig {
    InstanceConfig {
        id: id.to_string(),
        enabled: true,
        granularity: Granularity::Hourly,
        market_series: "BTC-1H".to_string(),
        signal: SignalKind::Momentum,
        tick_interval_secs: 5,
        capital_per_trade: 10.0,
        capital_per_window: 20.0,
        max_daily_loss: 25.0,
        confidence_threshold: 0.6,
        min_ask: 0.05,
        max_ask: 0.48,
        entry_min_seconds_remaining: 0,
        max_entries_per_window: 1,
    }
}

/// Open market, tight spread (so entries go direct, no ladder sleeps),
/// ask at 30 cents.
fn open_snapshot(ticker: &str) -> MarketSnapshot {
    MarketSnapshot {
        ticker: ticker.to_string(),
        status: MarketStatus::Open,
        yes_bid: 0.28,
        yes_ask: 0.30,
        no_bid: 0.68,
        no_ask: 0.70,
        close_time: Utc::now() + ChronoDuration::hours(1),
        result: None,
        strike: None,
    }
}

fn settled_snapshot(ticker: &str, result: Side) -> MarketSnapshot {
    MarketSnapshot {
        result: Some(result),
        status: MarketStatus::Settled,
        close_time: Utc::now() - ChronoDuration::minutes(1),
        ..open_snapshot(ticker)
    }
}

fn current_ticker() -> String {
    event_window_bot::window::ticker_for_window("BTC-1H", Utc::now(), Granularity::Hourly)
}

struct Harness {
    engine: BotEngine,
    store: Arc<Store>,
    status: Arc<Mutex<BotStatus>>,
    _dir: tempfile::TempDir,
}

fn harness_with(
    cfg: InstanceConfig,
    exchange: Arc<MockExchange>,
    signal: Arc<dyn SignalProvider>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new(dir.path()).unwrap());
    let capital = Arc::new(CapitalGate::new(
        exchange.clone(),
        RiskConfig::default(),
        100.0,
    ));
    let status = Arc::new(Mutex::new(BotStatus::new(&cfg.id)));
    let ladder = LadderConfig { step_wait_ms: 5, ..LadderConfig::default() };

    let engine = BotEngine::new(
        cfg,
        LifecycleConfig::default(),
        ladder,
        exchange.clone(),
        Arc::new(MockFeed),
        signal,
        store.clone(),
        capital,
        status.clone(),
        false,
    );

    Harness { engine, store, status, _dir: dir }
}

fn harness(exchange: Arc<MockExchange>) -> Harness {
    harness_with(instance("alpha"), exchange, AlwaysYes::new())
}

fn persisted_position(ticker: &str) -> Position {
    Position {
        ticker: ticker.to_string(),
        side: Side::Yes,
        contracts: 16,
        entry_price: 0.30,
        cost: 4.80,
        entry_fee: 0.072,
        entry_time: Utc::now() - ChronoDuration::minutes(10),
        entry_ref_price: Some(50_000.0),
        strike: None,
        order_id: "ord-persisted".to_string(),
        signal_label: "always-yes".to_string(),
        window_key: window_key(Utc::now(), Granularity::Hourly),
    }
}

// ============================================================================
// ENTRY AND SIZING
// ============================================================================

#[tokio::test]
async fn test_entry_places_position_with_tiered_sizing() {
    // $100 capital -> 5% tier -> $5 budget -> 16 contracts at 30 cents
    let ticker = current_ticker();
    let exchange = MockExchange::new(vec![open_snapshot(&ticker)]);
    let mut h = harness(exchange.clone());

    h.engine.tick().await.unwrap();

    let buys = exchange.buys();
    assert_eq!(buys.len(), 1, "exactly one entry order");
    assert_eq!(buys[0].count, 16);
    assert_eq!(buys[0].side, Side::Yes);

    let position = h.store.load_position("alpha").unwrap().expect("position persisted");
    assert_eq!(position.contracts, 16);
    assert!((position.entry_price - 0.30).abs() < 1e-9);
    assert!((position.cost - 4.80).abs() < 1e-9);
    assert_eq!(position.window_key, window_key(Utc::now(), Granularity::Hourly));

    let meta = h.store.load_window_meta("alpha").unwrap().unwrap();
    assert_eq!(meta.entries, 1);
}

#[tokio::test]
async fn test_ask_outside_band_skips_entry() {
    let ticker = current_ticker();
    let mut snapshot = open_snapshot(&ticker);
    snapshot.yes_ask = 0.55; // above the 48-cent ceiling
    snapshot.yes_bid = 0.53;
    let exchange = MockExchange::new(vec![snapshot]);
    let mut h = harness(exchange.clone());

    h.engine.tick().await.unwrap();

    assert!(exchange.buys().is_empty());
    assert!(h.store.load_position("alpha").unwrap().is_none());
    let status = h.status.lock().unwrap().clone();
    assert!(status.idle_reason.unwrap().contains("outside entry band"));
}

// ============================================================================
// ONE ENTRY PER WINDOW / SETTLEMENT EXACTLY ONCE
// ============================================================================

#[tokio::test]
async fn test_full_cycle_settles_once_and_never_reenters_window() {
    let ticker = current_ticker();
    let exchange = MockExchange::new(vec![open_snapshot(&ticker)]);
    let mut h = harness(exchange.clone());

    // Enter
    h.engine.tick().await.unwrap();
    assert_eq!(exchange.buys().len(), 1);

    // Market settles YES; replay the settled snapshot across several ticks
    // (a slow double-read must not double-record)
    exchange.push_snapshot(settled_snapshot(&ticker, Side::Yes));
    h.engine.tick().await.unwrap();
    h.engine.tick().await.unwrap();
    h.engine.tick().await.unwrap();

    let trades = h.store.trades_for_day(Utc::now().date_naive()).unwrap();
    assert_eq!(trades.len(), 1, "exactly one trade record after settlement");

    let trade = &trades[0];
    assert!(trade.won);
    assert!((trade.entry_price - 0.30).abs() < 1e-9);
    assert!((trade.exit_price - 1.0).abs() < 1e-9);
    assert_eq!(trade.contracts, 16);
    // 16 contracts paying $1 each, minus $4.80 cost and the 1.5% entry fee
    assert!((trade.net_pnl - (16.0 - 4.80 - 0.072)).abs() < 1e-6);

    assert!(h.store.load_position("alpha").unwrap().is_none());

    // Even though no position is open and the signal still says buy, the
    // window's entry budget is spent: no second entry this window
    assert_eq!(exchange.buys().len(), 1);
}

// ============================================================================
// RESTART RECOVERY
// ============================================================================

#[tokio::test]
async fn test_restart_with_open_position_does_not_reenter() {
    let ticker = current_ticker();
    let exchange = MockExchange::new(vec![open_snapshot(&ticker)]);
    let mut h = harness(exchange.clone());

    // A previous process persisted this position, then died
    h.store
        .save_position("alpha", &persisted_position(&ticker))
        .unwrap();

    // Fresh engine (fresh session state) ticks in the same window
    h.engine.tick().await.unwrap();
    h.engine.tick().await.unwrap();

    // Monitoring resumed; no duplicate entry was placed
    assert!(exchange.buys().is_empty());
    assert!(h.store.load_position("alpha").unwrap().is_some());
}

#[tokio::test]
async fn test_restart_derives_traded_this_window_from_metadata() {
    let ticker = current_ticker();
    let exchange = MockExchange::new(vec![open_snapshot(&ticker)]);
    let mut h = harness(exchange.clone());

    // Previous process already traded this window (position since settled)
    h.store
        .save_window_meta(
            "alpha",
            &WindowMeta {
                window_key: window_key(Utc::now(), Granularity::Hourly),
                last_decision_time: Utc::now(),
                capital_deployed: 4.87,
                entries: 1,
            },
        )
        .unwrap();

    h.engine.tick().await.unwrap();

    assert!(exchange.buys().is_empty(), "restart must not double-trade the window");
    let status = h.status.lock().unwrap().clone();
    assert!(status.idle_reason.unwrap().contains("already traded this window"));
}

// ============================================================================
// STALE-POSITION RECOVERY
// ============================================================================

fn stale_closed_snapshot(ticker: &str) -> MarketSnapshot {
    MarketSnapshot {
        status: MarketStatus::Closed,
        close_time: Utc::now() - ChronoDuration::minutes(20),
        ..open_snapshot(ticker)
    }
}

#[tokio::test]
async fn test_never_filled_stale_order_yields_zero_pnl() {
    let ticker = "BTC-1H-20260806-0900";
    let exchange = MockExchange::new(vec![stale_closed_snapshot(ticker)]);
    let mut h = harness(exchange.clone());

    h.store.save_position("alpha", &persisted_position(ticker)).unwrap();
    exchange.set_order_history(vec![OrderInfo {
        order_id: "ord-persisted".to_string(),
        status: "resting".to_string(),
        fill_count: 0,
        price: 0.30,
        count: 16,
    }]);

    h.engine.tick().await.unwrap();

    let trades = h.store.trades_for_day(Utc::now().date_naive()).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].net_pnl, 0.0);
    assert!(!trades[0].won);
    assert!(trades[0].exit_reason.contains("never filled"));
    assert!(h.store.load_position("alpha").unwrap().is_none());
}

#[tokio::test]
async fn test_stale_with_confirmed_fill_writes_off_cost() {
    let ticker = "BTC-1H-20260806-0900";
    let exchange = MockExchange::new(vec![stale_closed_snapshot(ticker)]);
    let mut h = harness(exchange.clone());

    h.store.save_position("alpha", &persisted_position(ticker)).unwrap();
    exchange.set_order_history(vec![OrderInfo {
        order_id: "ord-persisted".to_string(),
        status: "executed".to_string(),
        fill_count: 16,
        price: 0.30,
        count: 16,
    }]);

    h.engine.tick().await.unwrap();

    let trades = h.store.trades_for_day(Utc::now().date_naive()).unwrap();
    assert_eq!(trades.len(), 1);
    // Full cost basis plus entry fee written off
    assert!((trades[0].net_pnl + (4.80 + 0.072)).abs() < 1e-9);
    assert!(!trades[0].won);
}

#[tokio::test]
async fn test_indeterminate_fill_status_defaults_to_zero_pnl() {
    let ticker = "BTC-1H-20260806-0900";
    let exchange = MockExchange::new(vec![stale_closed_snapshot(ticker)]);
    let mut h = harness(exchange.clone());

    h.store.save_position("alpha", &persisted_position(ticker)).unwrap();
    // Order history knows nothing about our order
    exchange.set_order_history(vec![]);

    h.engine.tick().await.unwrap();

    let trades = h.store.trades_for_day(Utc::now().date_naive()).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].net_pnl, 0.0, "never fabricate a loss that may not have happened");
    assert!(trades[0].exit_reason.contains("indeterminate"));
}

// ============================================================================
// RISK GATE
// ============================================================================

#[tokio::test]
async fn test_daily_loss_breach_pauses_entries() {
    let ticker = current_ticker();
    let exchange = MockExchange::new(vec![open_snapshot(&ticker)]);
    let mut h = harness(exchange.clone());

    // Today already lost more than the $25 limit
    h.store
        .append_trade(&TradeRecord {
            id: "t-loss".to_string(),
            bot_id: "alpha".to_string(),
            signal_label: "always-yes".to_string(),
            ticker: ticker.clone(),
            side: Side::Yes,
            entry_price: 0.40,
            exit_price: 0.0,
            contracts: 80,
            cost: 32.0,
            net_pnl: -32.0,
            won: false,
            exit_reason: "settled no".to_string(),
            window_key: "20260806-0800".to_string(),
            closed_at: Utc::now(),
        })
        .unwrap();

    h.engine.tick().await.unwrap();

    assert!(exchange.buys().is_empty());
    let status = h.status.lock().unwrap().clone();
    assert!(status.pause_reason.unwrap().contains("daily loss"));
}

// ============================================================================
// MONITORING EXITS
// ============================================================================

#[tokio::test]
async fn test_hard_stop_exits_at_bid() {
    let ticker = current_ticker();
    let mut snapshot = open_snapshot(&ticker);
    snapshot.yes_bid = 0.06; // implied win probability collapsed
    snapshot.yes_ask = 0.08;
    let exchange = MockExchange::new(vec![snapshot]);
    let mut h = harness(exchange.clone());

    h.store.save_position("alpha", &persisted_position(&ticker)).unwrap();

    h.engine.tick().await.unwrap();

    let sells: Vec<_> = exchange
        .placed()
        .into_iter()
        .filter(|o| o.action == OrderAction::Sell)
        .collect();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].count, 16);
    assert!((sells[0].price - 0.06).abs() < 1e-9);

    let trades = h.store.trades_for_day(Utc::now().date_naive()).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].exit_reason, "hard stop");
    assert!(!trades[0].won);
    assert!(h.store.load_position("alpha").unwrap().is_none());
}

#[tokio::test]
async fn test_failed_hard_stop_holds_to_settlement_without_retry_loop() {
    let ticker = current_ticker();
    let mut snapshot = open_snapshot(&ticker);
    snapshot.yes_bid = 0.06;
    snapshot.yes_ask = 0.08;
    let exchange = MockExchange::new(vec![snapshot]);
    let mut h = harness(exchange.clone());

    h.store.save_position("alpha", &persisted_position(&ticker)).unwrap();
    exchange.set_fail_orders(true);

    h.engine.tick().await.unwrap();
    let attempts_after_first = exchange.placed().len();
    h.engine.tick().await.unwrap();
    h.engine.tick().await.unwrap();

    // The failed hard stop is not retried for this ticker this session
    assert_eq!(exchange.placed().len(), attempts_after_first);
    assert!(h.store.load_position("alpha").unwrap().is_some(), "still holding to settlement");
}

// ============================================================================
// SPREAD LADDER
// ============================================================================

fn wide_snapshot(ticker: &str, ask: f64) -> MarketSnapshot {
    MarketSnapshot {
        yes_bid: 0.20,
        yes_ask: ask,
        ..open_snapshot(ticker)
    }
}

#[tokio::test]
async fn test_ladder_never_exceeds_step_budget() {
    let ticker = "BTC-1H-20260806-1000";
    // Quoter keeps undercutting but the ask never reaches the target
    let exchange = MockExchange::new(vec![
        wide_snapshot(ticker, 0.40),
        wide_snapshot(ticker, 0.38),
        wide_snapshot(ticker, 0.36),
        wide_snapshot(ticker, 0.34),
    ]);
    let config = LadderConfig {
        max_steps: 2,
        entry_discount: 0.15,
        step_wait_ms: 5,
        ..LadderConfig::default()
    };

    let ladder = SpreadLadder::new(exchange.as_ref(), &config, "alpha", None);
    let outcome = ladder.run_entry(ticker, Side::Yes, 10, 30.0).await;

    match outcome {
        LadderOutcome::MaxSteps { count, .. } => assert_eq!(count, 10),
        other => panic!("expected MaxSteps, got {:?}", other),
    }
    assert!(
        exchange.bait_sells().len() <= 2,
        "place/cancel cycles must respect the step budget"
    );
    // The run still completed with a direct buy, and no bait was left resting
    assert_eq!(exchange.buys().len(), 1);
    assert!(!exchange.cancelled().is_empty());
}

#[tokio::test]
async fn test_ladder_tight_spread_goes_direct() {
    let ticker = "BTC-1H-20260806-1000";
    let exchange = MockExchange::new(vec![open_snapshot(ticker)]); // 2-tick spread
    let config = LadderConfig { step_wait_ms: 5, ..LadderConfig::default() };

    let ladder = SpreadLadder::new(exchange.as_ref(), &config, "alpha", None);
    let outcome = ladder.run_entry(ticker, Side::Yes, 16, 30.0).await;

    match outcome {
        LadderOutcome::Filled { price, count, .. } => {
            assert!((price - 0.30).abs() < 1e-9);
            assert_eq!(count, 16);
        }
        other => panic!("expected Filled, got {:?}", other),
    }
    assert!(exchange.bait_sells().is_empty(), "no laddering on a tight spread");
}

#[tokio::test]
async fn test_ladder_accidental_fill_is_reported_distinctly() {
    let ticker = "BTC-1H-20260806-1000";
    let exchange = MockExchange::new(vec![
        wide_snapshot(ticker, 0.40),
        wide_snapshot(ticker, 0.40),
    ]);
    exchange.set_fill_resting(true); // someone lifts the bait immediately
    let config = LadderConfig { step_wait_ms: 5, ..LadderConfig::default() };

    let ladder = SpreadLadder::new(exchange.as_ref(), &config, "alpha", None);
    let outcome = ladder.run_entry(ticker, Side::Yes, 10, 30.0).await;

    assert!(
        matches!(outcome, LadderOutcome::AccidentalFill { .. }),
        "accidental fills must be distinguishable from aborts, got {:?}",
        outcome
    );
    // No real buy was placed after the emergency
    assert!(exchange.buys().is_empty());
}
