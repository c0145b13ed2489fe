//! Bot orchestrator: owns the named instances and their tick tasks.
//!
//! Each started instance gets exactly one spawned task that ticks its
//! engine on an interval. Ticks execute strictly sequentially inside that
//! task and missed ticks are skipped, which is the single-flight guarantee:
//! a slow advisory or exchange call extends the current tick instead of
//! overlapping the next one. Instances never share locks; each owns its own
//! slot in the durable store.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::{AppConfig, InstanceConfig, SignalKind};
use crate::exchange::ExchangeGateway;
use crate::feed::MarketDataFeed;
use crate::lifecycle::{BotEngine, BotStatus};
use crate::risk::CapitalGate;
use crate::signal::{AdvisorySignal, MomentumSignal, SignalProvider};
use crate::store::Store;

struct Instance {
    cfg: InstanceConfig,
    status: Arc<Mutex<BotStatus>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub struct Orchestrator {
    config: AppConfig,
    gateway: Arc<dyn ExchangeGateway>,
    feed: Arc<dyn MarketDataFeed>,
    store: Arc<Store>,
    capital: Arc<CapitalGate>,
    dry_run: bool,
    instances: HashMap<String, Instance>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        gateway: Arc<dyn ExchangeGateway>,
        feed: Arc<dyn MarketDataFeed>,
        store: Arc<Store>,
        capital: Arc<CapitalGate>,
        dry_run: bool,
    ) -> Self {
        // The configured instances are the allowlist; nothing else can start
        let instances = config
            .bots
            .iter()
            .map(|cfg| {
                (
                    cfg.id.clone(),
                    Instance {
                        cfg: cfg.clone(),
                        status: Arc::new(Mutex::new(BotStatus::new(&cfg.id))),
                        running: Arc::new(AtomicBool::new(false)),
                        handle: None,
                    },
                )
            })
            .collect();

        Self { config, gateway, feed, store, capital, dry_run, instances }
    }

    fn build_signal(&self, cfg: &InstanceConfig) -> Result<Arc<dyn SignalProvider>> {
        match cfg.signal {
            SignalKind::Momentum => Ok(Arc::new(MomentumSignal::default())),
            SignalKind::Advisory => {
                let advisor = &self.config.advisor;
                if advisor.base_url.is_empty() {
                    bail!("Bot {}: advisory signal configured without an advisor endpoint", cfg.id);
                }
                Ok(Arc::new(AdvisorySignal::new(
                    &advisor.base_url,
                    advisor.request_timeout_ms,
                )?))
            }
        }
    }

    /// Start one instance. Idempotent: starting a running instance is a
    /// no-op. Unknown ids are an error, never silently ignored.
    pub fn start(&mut self, id: &str) -> Result<()> {
        if !self.instances.contains_key(id) {
            bail!("Unknown bot id: {} (not in configured allowlist)", id);
        }

        let signal = {
            let instance = &self.instances[id];
            if instance.running.load(Ordering::SeqCst) {
                info!("[{}] already running", id);
                return Ok(());
            }
            self.build_signal(&instance.cfg)?
        };

        // Restore durable state before the first tick so monitoring resumes
        // immediately instead of re-deciding
        match self.store.load_position(id)? {
            Some(position) => info!(
                "[{}] restored open position: {} {} x{} @ {:.2} (window {})",
                id,
                position.ticker,
                position.side,
                position.contracts,
                position.entry_price,
                position.window_key
            ),
            None => info!("[{}] no persisted position", id),
        }
        if let Some(meta) = self.store.load_window_meta(id)? {
            info!(
                "[{}] restored window metadata: {} ({} entries, ${:.2} deployed)",
                id, meta.window_key, meta.entries, meta.capital_deployed
            );
        }

        let instance = self.instances.get_mut(id).unwrap();
        instance.running.store(true, Ordering::SeqCst);
        {
            let mut status = instance.status.lock().unwrap();
            status.running = true;
            status.last_error = None;
        }

        let engine = BotEngine::new(
            instance.cfg.clone(),
            self.config.lifecycle.clone(),
            self.config.ladder.clone(),
            self.gateway.clone(),
            self.feed.clone(),
            signal,
            self.store.clone(),
            self.capital.clone(),
            instance.status.clone(),
            self.dry_run,
        );

        let running = instance.running.clone();
        let status = instance.status.clone();
        let tick_secs = instance.cfg.tick_interval_secs;

        instance.handle = Some(tokio::spawn(run_instance(engine, tick_secs, running, status)));

        info!("[{}] started ({}s tick)", id, tick_secs);
        Ok(())
    }

    /// Stop one instance: halt the tick task and best-effort cancel any
    /// resting orders. Cancellation is fire-and-forget; the exchange remains
    /// authoritative if it fails.
    pub fn stop(&mut self, id: &str) -> Result<()> {
        let instance = match self.instances.get_mut(id) {
            Some(instance) => instance,
            None => bail!("Unknown bot id: {} (not in configured allowlist)", id),
        };

        if !instance.running.swap(false, Ordering::SeqCst) {
            info!("[{}] not running", id);
            return Ok(());
        }

        if let Some(handle) = instance.handle.take() {
            handle.abort();
        }
        instance.status.lock().unwrap().running = false;

        // Cancel whatever may still rest on the book for our position's
        // market, without waiting for confirmation
        let gateway = self.gateway.clone();
        let store = self.store.clone();
        let bot_id = id.to_string();
        tokio::spawn(async move {
            let position = match store.load_position(&bot_id) {
                Ok(Some(position)) => position,
                _ => return,
            };
            match gateway.get_orders(&position.ticker, "resting").await {
                Ok(orders) => {
                    for order in orders {
                        if let Err(e) = gateway.cancel_order(&order.order_id).await {
                            warn!("[{}] stop: cancel {} failed: {}", bot_id, order.order_id, e);
                        }
                    }
                }
                Err(e) => warn!("[{}] stop: could not list resting orders: {}", bot_id, e),
            }
        });

        info!("[{}] stopped", id);
        Ok(())
    }

    /// Start every instance whose configuration marks it enabled. This runs
    /// at process start and is the whole restart-recovery story: durable
    /// state per instance is restored by `start`.
    pub fn start_enabled(&mut self) -> Result<()> {
        let ids: Vec<String> = self
            .config
            .bots
            .iter()
            .filter(|b| b.enabled)
            .map(|b| b.id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.start(&id) {
                warn!("[{}] failed to start: {}", id, e);
            }
        }
        Ok(())
    }

    pub fn stop_all(&mut self) {
        let ids: Vec<String> = self.instances.keys().cloned().collect();
        for id in ids {
            let _ = self.stop(&id);
        }
    }

    /// Snapshot of every instance's status, for the operator surface.
    pub fn status(&self) -> Vec<BotStatus> {
        let mut statuses: Vec<BotStatus> = self
            .instances
            .values()
            .map(|i| i.status.lock().unwrap().clone())
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.instances
            .get(id)
            .map(|i| i.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// The tick loop for one instance. Ticks are strictly sequential; missed
/// intervals are skipped rather than queued, so a slow tick can never stack
/// a burst of catch-up ticks behind it.
async fn run_instance(
    mut engine: BotEngine,
    tick_secs: u64,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<BotStatus>>,
) {
    let mut ticker = interval(Duration::from_secs(tick_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while running.load(Ordering::SeqCst) {
        ticker.tick().await;
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = engine.tick().await {
            // Transient by taxonomy: surface it and retry next tick
            warn!("[{}] tick failed: {:#}", engine.id(), e);
            status.lock().unwrap().last_error = Some(format!("{:#}", e));
        }
    }

    status.lock().unwrap().running = false;
    info!("[{}] tick loop ended", engine.id());
}
