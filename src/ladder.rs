//! Spread ladder: price-improvement order execution.
//!
//! On thin books the resident quoter bots re-peg to stay at the front of the
//! queue. A 1-lot sell resting just under the ask reliably gets undercut by
//! one tick; chasing the undercuts walks the ask down toward our target
//! before the real buy is placed. The same trick runs in reverse on exits.
//!
//! A ladder run is ephemeral: nothing about it is persisted, and a crash
//! mid-run simply abandons it (an unfilled resting 1-lot is harmless and
//! gets cancelled by `stop` or expires with the market).

use anyhow::Result;
use chrono::Utc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::config::LadderConfig;
use crate::exchange::{
    generate_client_order_id, ExchangeGateway, OrderAction, OrderRequest, OrderResponse, Side,
    TimeInForce,
};
use crate::store::{AuditEntry, Store};

const EPS: f64 = 1e-9;

/// How a ladder run ended.
#[derive(Debug, Clone)]
pub enum LadderOutcome {
    /// Target reached (or fast path taken) and the real order filled.
    Filled { order_id: String, price: f64, count: u32 },
    /// Step budget exhausted; executed direct at the prevailing price.
    /// A completion, not a failure.
    MaxSteps { order_id: String, price: f64, count: u32 },
    /// The 1-lot bait sell filled. We sold a contract we never owned; the
    /// caller must unwind immediately.
    AccidentalFill { order_id: String, price: f64 },
    /// Network/API failure or no liquidity; no position resulted.
    Aborted { reason: String },
}

pub struct SpreadLadder<'a> {
    gateway: &'a dyn ExchangeGateway,
    config: &'a LadderConfig,
    bot_id: &'a str,
    /// Audit sink; every placement attempt is logged when present.
    store: Option<&'a Store>,
}

impl<'a> SpreadLadder<'a> {
    pub fn new(
        gateway: &'a dyn ExchangeGateway,
        config: &'a LadderConfig,
        bot_id: &'a str,
        store: Option<&'a Store>,
    ) -> Self {
        Self { gateway, config, bot_id, store }
    }

    /// Place an order and record the attempt in the audit log, success or
    /// failure.
    async fn place_audited(&self, request: &OrderRequest, context: &str) -> Result<OrderResponse> {
        let result = self.gateway.place_order(request).await;
        if let Some(store) = self.store {
            let entry = AuditEntry {
                timestamp: Utc::now(),
                bot_id: self.bot_id.to_string(),
                ticker: request.ticker.clone(),
                side: request.side,
                action: request.action,
                count: request.count,
                price: request.price,
                client_order_id: request.client_order_id.clone(),
                order_id: result.as_ref().ok().map(|r| r.order_id.clone()),
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
                context: context.to_string(),
            };
            if let Err(e) = store.append_audit(&entry) {
                warn!("[{}] audit append failed: {}", self.bot_id, e);
            }
        }
        result
    }

    /// Buy `count` contracts of `side`, laddering the ask down first when
    /// conditions allow.
    pub async fn run_entry(
        &self,
        ticker: &str,
        side: Side,
        count: u32,
        minutes_remaining: f64,
    ) -> LadderOutcome {
        let tick = self.config.tick;

        let snapshot = match self.gateway.get_market(ticker, true).await {
            Ok(s) => s,
            Err(e) => return LadderOutcome::Aborted { reason: format!("market fetch: {}", e) },
        };

        let mut ask = snapshot.ask_for(side);
        let bid = snapshot.bid_for(side);
        if ask <= 0.0 {
            return LadderOutcome::Aborted { reason: "no ask liquidity".to_string() };
        }

        // Fast paths: no time to iterate, or nothing to squeeze out of the spread
        if minutes_remaining < self.config.min_minutes_remaining {
            debug!(
                "[{}] ladder skipped: {:.1}m remaining < {:.1}m floor",
                self.bot_id, minutes_remaining, self.config.min_minutes_remaining
            );
            return self.buy_direct(ticker, side, count, ask).await;
        }
        if bid > 0.0 && ask - bid <= 2.0 * tick + EPS {
            debug!("[{}] ladder skipped: spread already tight", self.bot_id);
            return self.buy_direct(ticker, side, count, ask).await;
        }

        let target = (ask - self.config.entry_discount).max(bid + tick).max(tick);

        // If real size already rests at or below the target there is no queue
        // to jump; don't wait behind actual counterparties.
        match self.gateway.get_order_book(ticker, self.config.book_depth).await {
            Ok(book) => {
                let resting_size = book.ask_size_at_or_below(side, target);
                if resting_size >= self.config.deep_ask_size {
                    debug!(
                        "[{}] ladder skipped: {} contracts resting at target {:.2}",
                        self.bot_id, resting_size, target
                    );
                    return self.buy_direct(ticker, side, count, ask).await;
                }
            }
            Err(e) => {
                return LadderOutcome::Aborted { reason: format!("order book fetch: {}", e) }
            }
        }

        info!(
            "[{}] ladder entry {} {}: ask {:.2} -> target {:.2}",
            self.bot_id, ticker, side, ask, target
        );

        let mut bait: Option<(String, f64)> = None;
        let mut unresponsive = 0u32;
        let mut steps = 0u32;

        let outcome = loop {
            if ask <= target + EPS {
                break None; // target reached, go buy
            }
            if steps >= self.config.max_steps {
                break Some(LadderOutcome::MaxSteps { order_id: String::new(), price: ask, count });
            }

            let bait_price = ask - tick;
            if bait_price <= bid + EPS {
                break None; // nowhere left to stand
            }

            // (Re)place the bait one tick under the current ask
            let needs_move = bait.as_ref().map(|(_, p)| (*p - bait_price).abs() > EPS).unwrap_or(true);
            if needs_move {
                if let Some((id, _)) = bait.take() {
                    if let Err(e) = self.gateway.cancel_order(&id).await {
                        break Some(LadderOutcome::Aborted { reason: format!("cancel: {}", e) });
                    }
                }
                let request = OrderRequest {
                    ticker: ticker.to_string(),
                    side,
                    action: OrderAction::Sell,
                    count: 1,
                    price: bait_price,
                    client_order_id: generate_client_order_id(),
                    time_in_force: TimeInForce::Gtc,
                };
                match self.place_audited(&request, "ladder bait sell").await {
                    Ok(response) => {
                        if response.is_filled() {
                            // Sold a contract we never owned
                            break Some(LadderOutcome::AccidentalFill {
                                order_id: response.order_id,
                                price: bait_price,
                            });
                        }
                        steps += 1;
                        debug!(
                            "[{}] ladder step {}: bait sell resting at {:.2}",
                            self.bot_id, steps, bait_price
                        );
                        bait = Some((response.order_id, bait_price));
                    }
                    Err(e) => {
                        break Some(LadderOutcome::Aborted { reason: format!("bait place: {}", e) });
                    }
                }
            }

            sleep(Duration::from_millis(self.config.step_wait_ms)).await;

            let fresh = match self.gateway.get_market(ticker, true).await {
                Ok(s) => s,
                Err(e) => {
                    self.cancel_best_effort(&bait).await;
                    bait = None;
                    break Some(LadderOutcome::Aborted { reason: format!("market refetch: {}", e) });
                }
            };

            if let Some((id, price)) = bait.clone() {
                match self.order_fill_count(ticker, &id).await {
                    Ok(fills) if fills > 0 => {
                        // Nothing to cancel; the bait is gone
                        bait = None;
                        break Some(LadderOutcome::AccidentalFill { order_id: id, price });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.cancel_best_effort(&bait).await;
                        bait = None;
                        break Some(LadderOutcome::Aborted { reason: format!("fill check: {}", e) });
                    }
                }
            }

            let new_ask = fresh.ask_for(side);
            if new_ask + EPS < bait.as_ref().map(|(_, p)| *p).unwrap_or(ask) {
                // Undercut by a quote-follower; chase it down
                debug!("[{}] undercut detected: ask {:.2} -> {:.2}", self.bot_id, ask, new_ask);
                ask = new_ask;
                unresponsive = 0;
            } else {
                unresponsive += 1;
                if unresponsive >= self.config.unresponsive_ticks {
                    // No competing quoter; nothing to exploit
                    debug!("[{}] no quoter response after {} ticks, going direct", self.bot_id, unresponsive);
                    break None;
                }
            }
        };

        self.cancel_best_effort(&bait).await;

        match outcome {
            Some(LadderOutcome::MaxSteps { .. }) => {
                match self.buy_direct(ticker, side, count, ask).await {
                    LadderOutcome::Filled { order_id, price, count } => {
                        LadderOutcome::MaxSteps { order_id, price, count }
                    }
                    other => other,
                }
            }
            Some(done) => done,
            None => self.buy_direct(ticker, side, count, ask).await,
        }
    }

    /// Sell `count` contracts of `side`. `direct` skips the ladder entirely
    /// (urgent exits go straight to the bid).
    pub async fn run_exit(
        &self,
        ticker: &str,
        side: Side,
        count: u32,
        minutes_remaining: f64,
        direct: bool,
    ) -> LadderOutcome {
        let tick = self.config.tick;

        let snapshot = match self.gateway.get_market(ticker, true).await {
            Ok(s) => s,
            Err(e) => return LadderOutcome::Aborted { reason: format!("market fetch: {}", e) },
        };

        let bid = snapshot.bid_for(side);
        let ask = snapshot.ask_for(side);
        if bid <= 0.0 {
            return LadderOutcome::Aborted { reason: "no bid liquidity".to_string() };
        }

        if direct
            || minutes_remaining < self.config.min_minutes_remaining
            || (ask > 0.0 && ask - bid <= 2.0 * tick + EPS)
        {
            return self.sell_direct(ticker, side, count, bid).await;
        }

        // Start above the bid and walk down toward it
        let mut price = (bid + self.config.entry_discount).min(ask - tick).max(bid + tick);
        let mut steps = 0u32;

        info!(
            "[{}] ladder exit {} {}: bid {:.2}, starting at {:.2}",
            self.bot_id, ticker, side, bid, price
        );

        while steps < self.config.max_steps && price > bid + EPS {
            let request = OrderRequest {
                ticker: ticker.to_string(),
                side,
                action: OrderAction::Sell,
                count,
                price,
                client_order_id: generate_client_order_id(),
                time_in_force: TimeInForce::Gtc,
            };
            let response = match self.place_audited(&request, "ladder exit sell").await {
                Ok(r) => r,
                Err(e) => return LadderOutcome::Aborted { reason: format!("exit place: {}", e) },
            };
            steps += 1;

            if response.fill_count >= count {
                return LadderOutcome::Filled { order_id: response.order_id, price, count };
            }

            // Give the book two ticks to come to us before lowering the price
            let mut filled = response.fill_count;
            for _ in 0..self.config.unresponsive_ticks {
                sleep(Duration::from_millis(self.config.step_wait_ms)).await;
                match self.order_fill_count(ticker, &response.order_id).await {
                    Ok(f) => filled = f,
                    Err(e) => {
                        self.cancel_best_effort(&Some((response.order_id.clone(), price))).await;
                        return LadderOutcome::Aborted { reason: format!("fill check: {}", e) };
                    }
                }
                if filled >= count {
                    return LadderOutcome::Filled { order_id: response.order_id, price, count };
                }
            }

            if let Err(e) = self.gateway.cancel_order(&response.order_id).await {
                return LadderOutcome::Aborted { reason: format!("exit cancel: {}", e) };
            }

            if filled > 0 {
                // Partially filled while resting: flatten the remainder at the bid
                let remainder = count - filled;
                warn!(
                    "[{}] exit partially filled ({}/{}), flattening remainder at bid",
                    self.bot_id, filled, count
                );
                return match self.sell_direct(ticker, side, remainder, bid).await {
                    LadderOutcome::Filled { order_id, .. } => {
                        let blended =
                            (price * filled as f64 + bid * remainder as f64) / count as f64;
                        LadderOutcome::Filled { order_id, price: blended, count }
                    }
                    other => other,
                };
            }

            price -= tick;
        }

        match self.sell_direct(ticker, side, count, bid).await {
            LadderOutcome::Filled { order_id, price, count } if steps >= self.config.max_steps => {
                LadderOutcome::MaxSteps { order_id, price, count }
            }
            other => other,
        }
    }

    async fn buy_direct(&self, ticker: &str, side: Side, count: u32, price: f64) -> LadderOutcome {
        let request = OrderRequest {
            ticker: ticker.to_string(),
            side,
            action: OrderAction::Buy,
            count,
            price,
            client_order_id: generate_client_order_id(),
            time_in_force: TimeInForce::Ioc,
        };
        match self.place_audited(&request, "direct buy").await {
            Ok(response) if response.is_filled() => {
                info!("[{}] direct buy filled: {} x{} @ {:.2}", self.bot_id, ticker, count, price);
                LadderOutcome::Filled { order_id: response.order_id, price, count }
            }
            Ok(_) => LadderOutcome::Aborted { reason: "direct buy did not fill".to_string() },
            Err(e) => LadderOutcome::Aborted { reason: format!("direct buy: {}", e) },
        }
    }

    async fn sell_direct(&self, ticker: &str, side: Side, count: u32, price: f64) -> LadderOutcome {
        let request = OrderRequest {
            ticker: ticker.to_string(),
            side,
            action: OrderAction::Sell,
            count,
            price,
            client_order_id: generate_client_order_id(),
            time_in_force: TimeInForce::Ioc,
        };
        match self.place_audited(&request, "direct sell").await {
            Ok(response) if response.is_filled() => {
                info!("[{}] direct sell filled: {} x{} @ {:.2}", self.bot_id, ticker, count, price);
                LadderOutcome::Filled { order_id: response.order_id, price, count }
            }
            Ok(_) => LadderOutcome::Aborted { reason: "direct sell did not fill".to_string() },
            Err(e) => LadderOutcome::Aborted { reason: format!("direct sell: {}", e) },
        }
    }

    async fn order_fill_count(&self, ticker: &str, order_id: &str) -> Result<u32> {
        let orders = self.gateway.get_orders(ticker, "all").await?;
        Ok(orders
            .iter()
            .find(|o| o.order_id == order_id)
            .map(|o| o.fill_count)
            .unwrap_or(0))
    }

    async fn cancel_best_effort(&self, bait: &Option<(String, f64)>) {
        if let Some((id, _)) = bait {
            if let Err(e) = self.gateway.cancel_order(id).await {
                warn!("[{}] best-effort cancel of {} failed: {}", self.bot_id, id, e);
            }
        }
    }
}
