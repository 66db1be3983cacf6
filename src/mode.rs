//! Trading mode guard: paper by default, live only after every arming
//! prerequisite holds.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ArmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingMode {
    /// Simulated fills only, no broker traffic.
    Paper,
    /// Live market data and routing paths, orders still simulated.
    LiveDry,
    /// Real orders reach live brokers.
    LiveArmed,
}

impl TradingMode {
    fn as_u8(self) -> u8 {
        match self {
            TradingMode::Paper => 0,
            TradingMode::LiveDry => 1,
            TradingMode::LiveArmed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => TradingMode::LiveDry,
            2 => TradingMode::LiveArmed,
            _ => TradingMode::Paper,
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "PAPER"),
            TradingMode::LiveDry => write!(f, "LIVE_DRY"),
            TradingMode::LiveArmed => write!(f, "LIVE_ARMED"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModeConfig {
    /// Exact phrase the operator must supply to arm live trading.
    #[serde(default = "default_confirmation_key")]
    pub confirmation_key: String,
    /// Days of paper trading required before arming.
    #[serde(default = "default_min_paper_days")]
    pub min_paper_days: i64,
    /// Hard ceiling on capital exposed while armed.
    #[serde(default = "default_max_live_capital")]
    pub max_live_capital: Decimal,
}

fn default_confirmation_key() -> String {
    "CONFIRM-LIVE-TRADING".to_string()
}

fn default_min_paper_days() -> i64 {
    90
}

fn default_max_live_capital() -> Decimal {
    Decimal::from(10_000)
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            confirmation_key: default_confirmation_key(),
            min_paper_days: default_min_paper_days(),
            max_live_capital: default_max_live_capital(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeStatus {
    pub mode: TradingMode,
    pub paper_started_at: Option<DateTime<Utc>>,
    pub paper_elapsed_days: i64,
    pub min_paper_days: i64,
    pub walk_forward_passed: bool,
    pub circuit_breaker_ready: bool,
    pub live_capital_limit: Option<Decimal>,
    pub armed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ModeInner {
    paper_started_at: Option<DateTime<Utc>>,
    walk_forward_passed: bool,
    circuit_breaker_ready: bool,
    live_capital_limit: Option<Decimal>,
    armed_at: Option<DateTime<Utc>>,
}

/// Guard state machine over paper / live-dry / live-armed.
///
/// `mode()` and `is_live_armed()` read an atomic mirror so the hot
/// submission path never touches the mutex.
#[derive(Debug)]
pub struct ModeController {
    config: ModeConfig,
    mode: AtomicU8,
    inner: Mutex<ModeInner>,
}

impl ModeController {
    pub fn new(config: ModeConfig) -> Self {
        Self {
            config,
            mode: AtomicU8::new(TradingMode::Paper.as_u8()),
            inner: Mutex::new(ModeInner {
                paper_started_at: None,
                walk_forward_passed: false,
                circuit_breaker_ready: false,
                live_capital_limit: None,
                armed_at: None,
            }),
        }
    }

    pub fn mode(&self) -> TradingMode {
        TradingMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    pub fn is_live_armed(&self) -> bool {
        self.mode() == TradingMode::LiveArmed
    }

    /// Switches to paper and (re)starts the seasoning clock.
    pub async fn set_paper_mode(&self) {
        let mut inner = self.inner.lock().await;
        inner.paper_started_at = Some(Utc::now());
        inner.armed_at = None;
        inner.live_capital_limit = None;
        self.mode.store(TradingMode::Paper.as_u8(), Ordering::SeqCst);
        info!("trading mode set to PAPER, seasoning clock restarted");
    }

    pub async fn set_live_dry(&self) {
        let mut inner = self.inner.lock().await;
        inner.armed_at = None;
        inner.live_capital_limit = None;
        self.mode
            .store(TradingMode::LiveDry.as_u8(), Ordering::SeqCst);
        info!("trading mode set to LIVE_DRY");
    }

    pub async fn mark_walk_forward_passed(&self) {
        let mut inner = self.inner.lock().await;
        inner.walk_forward_passed = true;
        info!("walk-forward validation marked passed");
    }

    pub async fn mark_circuit_breaker_ready(&self) {
        let mut inner = self.inner.lock().await;
        inner.circuit_breaker_ready = true;
        info!("circuit breaker marked ready for live trading");
    }

    /// Arms live trading. Every prerequisite must hold at once; the first
    /// failing check is returned and the mode is left untouched.
    pub async fn arm_live(
        &self,
        confirmation: &str,
        capital_limit: Option<Decimal>,
    ) -> Result<(), ArmError> {
        let mut inner = self.inner.lock().await;

        if confirmation != self.config.confirmation_key {
            warn!("arming refused: confirmation key mismatch");
            return Err(ArmError::ConfirmationMismatch);
        }

        let elapsed_days = inner
            .paper_started_at
            .map(|started| (Utc::now() - started).num_days())
            .unwrap_or(0);
        if elapsed_days < self.config.min_paper_days {
            warn!(
                elapsed_days,
                required_days = self.config.min_paper_days,
                "arming refused: paper seasoning incomplete"
            );
            return Err(ArmError::PaperSeasoningIncomplete {
                elapsed_days,
                required_days: self.config.min_paper_days,
            });
        }

        if !inner.walk_forward_passed {
            warn!("arming refused: walk-forward validation missing");
            return Err(ArmError::WalkForwardNotValidated);
        }

        if !inner.circuit_breaker_ready {
            warn!("arming refused: circuit breaker not ready");
            return Err(ArmError::CircuitBreakerNotReady);
        }

        let limit = capital_limit
            .map(|requested| requested.min(self.config.max_live_capital))
            .unwrap_or(self.config.max_live_capital);
        inner.live_capital_limit = Some(limit);
        inner.armed_at = Some(Utc::now());
        self.mode
            .store(TradingMode::LiveArmed.as_u8(), Ordering::SeqCst);
        info!(%limit, "LIVE TRADING ARMED");
        Ok(())
    }

    /// Drops LiveArmed back to LiveDry. No-op in any other mode.
    pub async fn disarm(&self) {
        let mut inner = self.inner.lock().await;
        if self.mode() != TradingMode::LiveArmed {
            return;
        }
        inner.armed_at = None;
        inner.live_capital_limit = None;
        self.mode
            .store(TradingMode::LiveDry.as_u8(), Ordering::SeqCst);
        info!("live trading disarmed, back to LIVE_DRY");
    }

    pub async fn status(&self) -> ModeStatus {
        let inner = self.inner.lock().await;
        let paper_elapsed_days = inner
            .paper_started_at
            .map(|started| (Utc::now() - started).num_days())
            .unwrap_or(0);
        ModeStatus {
            mode: self.mode(),
            paper_started_at: inner.paper_started_at,
            paper_elapsed_days,
            min_paper_days: self.config.min_paper_days,
            walk_forward_passed: inner.walk_forward_passed,
            circuit_breaker_ready: inner.circuit_breaker_ready,
            live_capital_limit: inner.live_capital_limit,
            armed_at: inner.armed_at,
        }
    }
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new(ModeConfig::default())
    }
}
