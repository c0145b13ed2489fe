//! Multi-bot runner for 15-minute and hourly binary event markets.
//!
//! Starts every enabled instance (or a `--bot` subset), restores durable
//! state, and runs until interrupted. Without exchange credentials the
//! process runs in dry-run mode: full decision flow, no orders placed.

use anyhow::{Context, Result};
use clap::Parser;
use event_window_bot::config::AppConfig;
use event_window_bot::exchange::{ExchangeGateway, RestExchange};
use event_window_bot::feed::RestFeed;
use event_window_bot::orchestrator::Orchestrator;
use event_window_bot::risk::CapitalGate;
use event_window_bot::store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Autonomous trading bots for time-boxed binary event markets
#[derive(Parser, Debug)]
#[command(name = "window-bot")]
#[command(about = "Runs a fleet of window-aligned trading bot instances")]
struct Args {
    /// Path to the YAML configuration
    #[arg(long, default_value = "config/bots.yaml")]
    config: PathBuf,

    /// Run the full decision flow without placing any orders
    #[arg(long)]
    dry_run: bool,

    /// Start only these bot ids (default: every enabled instance)
    #[arg(long)]
    bot: Vec<String>,

    /// Override the state directory from the config
    #[arg(long)]
    state_dir: Option<String>,

    /// How often to log the aggregated status (seconds)
    #[arg(long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,event_window_bot=debug".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&log_filter))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("╔══════════════════════════════════════════════════════════════╗");
    info!("║       EVENT WINDOW BOT - MULTI-INSTANCE RUNNER               ║");
    info!("╚══════════════════════════════════════════════════════════════╝");

    let mut config = AppConfig::load_with_env(&args.config)
        .context("Failed to load configuration")?;
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }

    info!("Configuration loaded: {} instance(s)", config.bots.len());
    for bot in &config.bots {
        info!(
            "  {} | {:?} | series {} | {:?} signal | ${:.2}/trade, ${:.2}/window | {}",
            bot.id,
            bot.granularity,
            bot.market_series,
            bot.signal,
            bot.capital_per_trade,
            bot.capital_per_window,
            if bot.enabled { "enabled" } else { "disabled" }
        );
    }

    // Exchange credentials decide live vs dry-run, exactly like the absence
    // of a signing key does for order placement
    let (gateway, dry_run): (Arc<dyn ExchangeGateway>, bool) = match RestExchange::from_env(
        config.exchange.request_timeout_ms,
        config.exchange.snapshot_cache_secs,
    ) {
        Ok(exchange) => (Arc::new(exchange), args.dry_run),
        Err(e) => {
            warn!("Exchange credentials unavailable: {}", e);
            warn!("Running in DRY-RUN mode (no orders will be placed)");
            let public = RestExchange::unauthenticated(
                config.exchange.request_timeout_ms,
                config.exchange.snapshot_cache_secs,
            )?;
            (Arc::new(public), true)
        }
    };
    if dry_run {
        info!("Mode: DRY RUN (orders are simulated)");
    } else {
        info!("Mode: LIVE (real orders will be placed)");
    }

    let feed = Arc::new(RestFeed::new(
        &config.feed.base_url,
        &config.feed.symbol,
        config.feed.request_timeout_ms,
    )?);

    let store = Arc::new(Store::new(&config.state_dir).context("Failed to open state dir")?);

    // Dry runs without a reachable balance endpoint size off this instead
    let initial_bankroll: f64 = std::env::var("BOT_BANKROLL")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .unwrap_or(100.0);

    let capital = Arc::new(CapitalGate::new(
        gateway.clone(),
        config.risk.clone(),
        initial_bankroll,
    ));

    let mut orchestrator = Orchestrator::new(
        config.clone(),
        gateway,
        feed,
        store,
        capital,
        dry_run,
    );

    if args.bot.is_empty() {
        orchestrator.start_enabled()?;
    } else {
        for id in &args.bot {
            orchestrator.start(id)?;
        }
    }

    info!("");
    info!("Bots running. Press Ctrl+C to stop.");
    info!("");

    let mut status_interval = tokio::time::interval(Duration::from_secs(args.status_interval));
    status_interval.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping bots...");
                break;
            }
            _ = status_interval.tick() => {
                for status in orchestrator.status() {
                    info!(
                        "[{}] running={} pnl=${:+.2} trades={} pos={} | {}",
                        status.id,
                        status.running,
                        status.daily_pnl,
                        status.trade_count,
                        status
                            .open_position
                            .as_ref()
                            .map(|p| format!("{} {} x{}", p.ticker, p.side, p.contracts))
                            .unwrap_or_else(|| "none".to_string()),
                        status
                            .pause_reason
                            .as_deref()
                            .or(status.idle_reason.as_deref())
                            .or(status.last_error.as_deref())
                            .unwrap_or("ok")
                    );
                }
            }
        }
    }

    orchestrator.stop_all();
    // Give the fire-and-forget cancellations a moment to reach the exchange
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Shutdown complete");

    Ok(())
}
