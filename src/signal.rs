//! Trade signal providers.
//!
//! A provider looks at the current market context and either recommends an
//! entry or declines. Providers are expected to fail occasionally (the
//! advisory endpoint is a remote service); the engine treats any provider
//! error as "no trade" / "hold everything" rather than aborting the tick.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::exchange::Side;

/// Everything a provider may consider when deciding.
#[derive(Debug, Clone)]
pub struct SignalContext {
    pub ticker: String,
    pub yes_bid: f64,
    pub yes_ask: f64,
    pub no_bid: f64,
    pub no_ask: f64,
    /// Latest underlying price.
    pub underlying_price: f64,
    /// Underlying price when the window opened, if known.
    pub window_open_price: Option<f64>,
    pub seconds_elapsed: u32,
    pub seconds_remaining: u32,
    pub available_capital: f64,
    /// Instance-level confidence gate; providers below it decline.
    pub confidence_threshold: f64,
}

/// Provider verdict for an entry decision.
#[derive(Debug, Clone)]
pub enum SignalDecision {
    NoTrade {
        reason: String,
    },
    Trade {
        direction: Side,
        /// Suggested dollars to deploy; the risk gate caps it either way.
        size_hint: Option<f64>,
        rationale: String,
    },
}

/// One open leg submitted for an advisory exit check.
#[derive(Debug, Clone, Serialize)]
pub struct OpenLeg {
    pub ticker: String,
    pub side: Side,
    pub entry_price: f64,
    pub current_bid: f64,
    pub contracts: u32,
}

/// Advisory recommendation for one open leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitAction {
    Hold,
    Exit,
}

#[derive(Debug, Clone)]
pub struct ExitAdvice {
    pub ticker: String,
    pub action: ExitAction,
}

#[async_trait]
pub trait SignalProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, ctx: &SignalContext) -> Result<SignalDecision>;

    /// Re-evaluate open legs. Default: hold everything (only advisory
    /// providers have an opinion after entry).
    async fn exit_check(&self, legs: &[OpenLeg]) -> Result<Vec<ExitAdvice>> {
        Ok(legs
            .iter()
            .map(|l| ExitAdvice { ticker: l.ticker.clone(), action: ExitAction::Hold })
            .collect())
    }

    fn supports_exit_advice(&self) -> bool {
        false
    }
}

// ============================================================================
// Momentum provider
// ============================================================================

/// Built-in provider: trades the direction of the move since window open
/// when the move is large enough to matter.
pub struct MomentumSignal {
    /// Absolute underlying move at which confidence reaches 1.0.
    pub full_confidence_delta: f64,
    /// Don't decide in the first part of the window (no information yet).
    pub min_seconds_elapsed: u32,
}

impl Default for MomentumSignal {
    fn default() -> Self {
        Self {
            full_confidence_delta: 100.0,
            min_seconds_elapsed: 60,
        }
    }
}

#[async_trait]
impl SignalProvider for MomentumSignal {
    fn name(&self) -> &str {
        "momentum"
    }

    async fn decide(&self, ctx: &SignalContext) -> Result<SignalDecision> {
        let open = match ctx.window_open_price {
            Some(p) if p > 0.0 => p,
            _ => {
                return Ok(SignalDecision::NoTrade {
                    reason: "window open price not available yet".to_string(),
                })
            }
        };

        if ctx.seconds_elapsed < self.min_seconds_elapsed {
            return Ok(SignalDecision::NoTrade {
                reason: format!(
                    "too early in window: {}s < {}s minimum",
                    ctx.seconds_elapsed, self.min_seconds_elapsed
                ),
            });
        }

        let delta = ctx.underlying_price - open;
        let confidence = (delta.abs() / self.full_confidence_delta).min(1.0);

        if confidence < ctx.confidence_threshold {
            return Ok(SignalDecision::NoTrade {
                reason: format!(
                    "confidence {:.2} below threshold {:.2} (delta {:+.2})",
                    confidence, ctx.confidence_threshold, delta
                ),
            });
        }

        let direction = if delta > 0.0 { Side::Yes } else { Side::No };

        Ok(SignalDecision::Trade {
            direction,
            size_hint: None,
            rationale: format!(
                "momentum: delta {:+.2} from open {:.2}, confidence {:.2}",
                delta, open, confidence
            ),
        })
    }
}

// ============================================================================
// Advisory provider (external AI oracle)
// ============================================================================

/// Provider backed by an external advisory HTTP service.
///
/// The service sees the same context the engine does and answers with an
/// entry instruction or a per-leg HOLD/EXIT list. Any transport or parse
/// failure degrades to the safe default at the call site in the engine.
pub struct AdvisorySignal {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct AdviceRequest<'a> {
    ticker: &'a str,
    yes_bid: f64,
    yes_ask: f64,
    no_bid: f64,
    no_ask: f64,
    underlying_price: f64,
    window_open_price: Option<f64>,
    seconds_remaining: u32,
    available_capital: f64,
}

#[derive(Debug, Deserialize)]
struct AdviceResponse {
    /// "buy" or "none"
    action: String,
    /// "yes" or "no", required when action is "buy"
    direction: Option<String>,
    confidence: Option<f64>,
    size_hint: Option<f64>,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Serialize)]
struct ExitCheckRequest<'a> {
    legs: &'a [OpenLeg],
}

#[derive(Debug, Deserialize)]
struct ExitCheckResponse {
    advice: Vec<ExitCheckEntry>,
}

#[derive(Debug, Deserialize)]
struct ExitCheckEntry {
    ticker: String,
    /// "HOLD" or "EXIT"
    action: String,
}

impl AdvisorySignal {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl SignalProvider for AdvisorySignal {
    fn name(&self) -> &str {
        "advisory"
    }

    async fn decide(&self, ctx: &SignalContext) -> Result<SignalDecision> {
        let request = AdviceRequest {
            ticker: &ctx.ticker,
            yes_bid: ctx.yes_bid,
            yes_ask: ctx.yes_ask,
            no_bid: ctx.no_bid,
            no_ask: ctx.no_ask,
            underlying_price: ctx.underlying_price,
            window_open_price: ctx.window_open_price,
            seconds_remaining: ctx.seconds_remaining,
            available_capital: ctx.available_capital,
        };

        let url = format!("{}/v1/advice", self.base_url);
        let response = self.client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Advisory request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Advisory request failed: {} - {}", status, text));
        }

        let advice: AdviceResponse = response.json().await
            .context("Failed to parse advisory response")?;

        debug!("Advisory response for {}: {:?}", ctx.ticker, advice.action);

        if advice.action != "buy" {
            return Ok(SignalDecision::NoTrade {
                reason: if advice.rationale.is_empty() {
                    "advisor declined".to_string()
                } else {
                    advice.rationale
                },
            });
        }

        if let Some(confidence) = advice.confidence {
            if confidence < ctx.confidence_threshold {
                return Ok(SignalDecision::NoTrade {
                    reason: format!(
                        "advisor confidence {:.2} below threshold {:.2}",
                        confidence, ctx.confidence_threshold
                    ),
                });
            }
        }

        let direction = match advice.direction.as_deref() {
            Some("yes") => Side::Yes,
            Some("no") => Side::No,
            other => {
                return Err(anyhow!("Advisory buy without a valid direction: {:?}", other))
            }
        };

        Ok(SignalDecision::Trade {
            direction,
            size_hint: advice.size_hint,
            rationale: advice.rationale,
        })
    }

    async fn exit_check(&self, legs: &[OpenLeg]) -> Result<Vec<ExitAdvice>> {
        let url = format!("{}/v1/exit-check", self.base_url);
        let response = self.client
            .post(&url)
            .json(&ExitCheckRequest { legs })
            .send()
            .await
            .context("Exit-check request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Exit-check request failed: {} - {}", status, text));
        }

        let parsed: ExitCheckResponse = response.json().await
            .context("Failed to parse exit-check response")?;

        Ok(parsed
            .advice
            .into_iter()
            .map(|e| ExitAdvice {
                ticker: e.ticker,
                action: if e.action.eq_ignore_ascii_case("exit") {
                    ExitAction::Exit
                } else {
                    ExitAction::Hold
                },
            })
            .collect())
    }

    fn supports_exit_advice(&self) -> bool {
        true
    }
}
