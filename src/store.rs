//! Durable state: open positions, per-window metadata, the trade ledger and
//! the order audit log.
//!
//! Layout under the state directory:
//!
//! ```text
//! positions/<bot-id>.json         current open position (absent = none)
//! windows/<bot-id>.json           per-window metadata
//! ledger/trades-YYYY-MM-DD.json   append-only daily trade records
//! audit/orders-YYYY-MM-DD.jsonl   one line per order placement attempt
//! ```
//!
//! Every JSON document write goes through temp-file-then-rename so a crash
//! mid-write leaves the previous valid state intact. Only the owning bot
//! instance's tick loop writes its own position/window keys, so there is no
//! multi-writer contention on a single document.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::exchange::{OrderAction, Side};

/// An open position: the unit of financial exposure.
///
/// Exists in the store if and only if an order is believed filled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub side: Side,
    pub contracts: u32,
    /// Probability-priced entry in [0, 1].
    pub entry_price: f64,
    /// Contracts * entry price, before fees.
    pub cost: f64,
    /// Taker fee paid at entry.
    pub entry_fee: f64,
    pub entry_time: DateTime<Utc>,
    /// Underlying asset price at entry.
    pub entry_ref_price: Option<f64>,
    pub strike: Option<f64>,
    pub order_id: String,
    /// Free-text label of the signal that opened this.
    pub signal_label: String,
    /// Fixed at entry; never recomputed.
    pub window_key: String,
}

/// Per-window bookkeeping for one instance. Reset when the window key no
/// longer matches the current window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowMeta {
    pub window_key: String,
    pub last_decision_time: DateTime<Utc>,
    pub capital_deployed: f64,
    pub entries: u32,
}

/// Immutable ledger entry, one per closed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub bot_id: String,
    pub signal_label: String,
    pub ticker: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub contracts: u32,
    pub cost: f64,
    /// Fee-adjusted.
    pub net_pnl: f64,
    pub won: bool,
    pub exit_reason: String,
    pub window_key: String,
    pub closed_at: DateTime<Utc>,
}

/// One order placement attempt, success or failure, for post-hoc
/// reconciliation against the exchange's own records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub bot_id: String,
    pub ticker: String,
    pub side: Side,
    pub action: OrderAction,
    pub count: u32,
    pub price: f64,
    pub client_order_id: String,
    pub order_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub context: String,
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
    Ok(())
}

/// File-backed durable store, one per process, shared by all instances.
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["positions", "windows", "ledger", "audit"] {
            fs::create_dir_all(root.join(sub))
                .with_context(|| format!("Failed to create state dir {}", sub))?;
        }
        Ok(Self { root })
    }

    fn position_path(&self, bot_id: &str) -> PathBuf {
        self.root.join("positions").join(format!("{}.json", bot_id))
    }

    fn window_path(&self, bot_id: &str) -> PathBuf {
        self.root.join("windows").join(format!("{}.json", bot_id))
    }

    fn ledger_path(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join("ledger")
            .join(format!("trades-{}.json", date.format("%Y-%m-%d")))
    }

    fn audit_path(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join("audit")
            .join(format!("orders-{}.jsonl", date.format("%Y-%m-%d")))
    }

    // ========== POSITIONS ==========

    pub fn load_position(&self, bot_id: &str) -> Result<Option<Position>> {
        let path = self.position_path(bot_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read position for {}", bot_id))?;
        let position: Position = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse position for {}", bot_id))?;
        Ok(Some(position))
    }

    pub fn save_position(&self, bot_id: &str, position: &Position) -> Result<()> {
        let json = serde_json::to_vec_pretty(position)?;
        write_atomic(&self.position_path(bot_id), &json)?;
        debug!(
            "Persisted position for {}: {} {} x{} @ {:.2}",
            bot_id, position.ticker, position.side, position.contracts, position.entry_price
        );
        Ok(())
    }

    pub fn clear_position(&self, bot_id: &str) -> Result<()> {
        let path = self.position_path(bot_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to clear position for {}", bot_id))?;
            info!("Cleared position for {}", bot_id);
        }
        Ok(())
    }

    // ========== WINDOW METADATA ==========

    pub fn load_window_meta(&self, bot_id: &str) -> Result<Option<WindowMeta>> {
        let path = self.window_path(bot_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read window meta for {}", bot_id))?;
        let meta: WindowMeta = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse window meta for {}", bot_id))?;
        Ok(Some(meta))
    }

    pub fn save_window_meta(&self, bot_id: &str, meta: &WindowMeta) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&self.window_path(bot_id), &json)
    }

    // ========== TRADE LEDGER ==========

    /// Append one record to the day's ledger file (read-modify-write under
    /// the atomic-rename contract).
    pub fn append_trade(&self, record: &TradeRecord) -> Result<()> {
        let date = record.closed_at.date_naive();
        let mut trades = self.trades_for_day(date)?;
        trades.push(record.clone());
        let json = serde_json::to_vec_pretty(&trades)?;
        write_atomic(&self.ledger_path(date), &json)?;
        info!(
            "Ledger: {} {} {} net ${:+.2} ({})",
            record.bot_id,
            if record.won { "WON" } else { "LOST" },
            record.ticker,
            record.net_pnl,
            record.exit_reason
        );
        Ok(())
    }

    pub fn trades_for_day(&self, date: NaiveDate) -> Result<Vec<TradeRecord>> {
        let path = self.ledger_path(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read ledger {}", path.display()))?;
        let trades: Vec<TradeRecord> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse ledger {}", path.display()))?;
        Ok(trades)
    }

    /// Realized P&L for `bot_id` on `date`, recomputed from the ledger every
    /// time. Never cached across a date rollover.
    pub fn daily_pnl(&self, bot_id: &str, date: NaiveDate) -> Result<f64> {
        Ok(self
            .trades_for_day(date)?
            .iter()
            .filter(|t| t.bot_id == bot_id)
            .map(|t| t.net_pnl)
            .sum())
    }

    pub fn daily_trade_count(&self, bot_id: &str, date: NaiveDate) -> Result<usize> {
        Ok(self
            .trades_for_day(date)?
            .iter()
            .filter(|t| t.bot_id == bot_id)
            .count())
    }

    // ========== AUDIT LOG ==========

    /// Append-only JSON Lines; each line is independent, so an interrupted
    /// write can corrupt at most the final line.
    pub fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let path = self.audit_path(entry.timestamp.date_naive());
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .context("Failed to append audit entry")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_position() -> Position {
        Position {
            ticker: "BTC-15M-20260806-1415".to_string(),
            side: Side::Yes,
            contracts: 16,
            entry_price: 0.30,
            cost: 4.80,
            entry_fee: 0.072,
            entry_time: Utc.with_ymd_and_hms(2026, 8, 6, 14, 20, 0).unwrap(),
            entry_ref_price: Some(50_000.0),
            strike: None,
            order_id: "ord-1".to_string(),
            signal_label: "momentum".to_string(),
            window_key: "20260806-1415".to_string(),
        }
    }

    #[test]
    fn test_position_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        assert!(store.load_position("alpha").unwrap().is_none());

        let pos = sample_position();
        store.save_position("alpha", &pos).unwrap();

        let loaded = store.load_position("alpha").unwrap().unwrap();
        assert_eq!(loaded.ticker, pos.ticker);
        assert_eq!(loaded.contracts, 16);
        assert_eq!(loaded.window_key, "20260806-1415");

        store.clear_position("alpha").unwrap();
        assert!(store.load_position("alpha").unwrap().is_none());
        // Clearing twice is fine
        store.clear_position("alpha").unwrap();
    }

    #[test]
    fn test_positions_are_per_bot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        store.save_position("alpha", &sample_position()).unwrap();
        assert!(store.load_position("beta").unwrap().is_none());
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        store.save_position("alpha", &sample_position()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("positions"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_ledger_daily_partition_and_pnl() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let day1 = Utc.with_ymd_and_hms(2026, 8, 5, 23, 59, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 8, 6, 0, 1, 0).unwrap();

        let mut record = TradeRecord {
            id: "t1".to_string(),
            bot_id: "alpha".to_string(),
            signal_label: "momentum".to_string(),
            ticker: "BTC-15M-20260805-2345".to_string(),
            side: Side::Yes,
            entry_price: 0.30,
            exit_price: 0.0,
            contracts: 10,
            cost: 3.0,
            net_pnl: -3.05,
            won: false,
            exit_reason: "settled against us".to_string(),
            window_key: "20260805-2345".to_string(),
            closed_at: day1,
        };
        store.append_trade(&record).unwrap();

        record.id = "t2".to_string();
        record.net_pnl = 7.0;
        record.won = true;
        record.closed_at = day2;
        store.append_trade(&record).unwrap();

        // Prior day's losses do not bleed into the new day
        assert!((store.daily_pnl("alpha", day1.date_naive()).unwrap() + 3.05).abs() < 1e-9);
        assert!((store.daily_pnl("alpha", day2.date_naive()).unwrap() - 7.0).abs() < 1e-9);
        assert_eq!(store.daily_trade_count("alpha", day2.date_naive()).unwrap(), 1);
        // Other bots see zero
        assert_eq!(store.daily_pnl("beta", day2.date_naive()).unwrap(), 0.0);
    }

    #[test]
    fn test_audit_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let entry = AuditEntry {
            timestamp: Utc.with_ymd_and_hms(2026, 8, 6, 14, 20, 0).unwrap(),
            bot_id: "alpha".to_string(),
            ticker: "BTC-15M-20260806-1415".to_string(),
            side: Side::Yes,
            action: OrderAction::Buy,
            count: 16,
            price: 0.30,
            client_order_id: "c1".to_string(),
            order_id: Some("ord-1".to_string()),
            success: true,
            error: None,
            context: "ladder entry".to_string(),
        };
        store.append_audit(&entry).unwrap();
        store.append_audit(&entry).unwrap();

        let path = dir.path().join("audit").join("orders-2026-08-06.jsonl");
        let contents = fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
