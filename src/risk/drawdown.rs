use std::collections::VecDeque;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct DrawdownConfig {
    /// Drawdown percent at which sizing halves.
    #[serde(default = "default_warning_dd_pct")]
    pub warning_dd_pct: f64,
    /// Drawdown percent at which sizing drops to a quarter.
    #[serde(default = "default_caution_dd_pct")]
    pub caution_dd_pct: f64,
    /// Drawdown percent at which new positions stop.
    #[serde(default = "default_critical_dd_pct")]
    pub critical_dd_pct: f64,
    /// Drawdown percent that locks the protector until manual reset.
    #[serde(default = "default_lock_dd_pct")]
    pub lock_dd_pct: f64,
    /// Equity moving-average window, in observations.
    #[serde(default = "default_equity_ma_period")]
    pub equity_ma_period: usize,
    /// Halve sizing while equity sits below its moving average.
    #[serde(default = "default_use_equity_curve_filter")]
    pub use_equity_curve_filter: bool,
    /// Consecutive in-drawdown observations before locking.
    #[serde(default = "default_max_dd_duration")]
    pub max_dd_duration: u32,
}

fn default_warning_dd_pct() -> f64 {
    5.0
}

fn default_caution_dd_pct() -> f64 {
    10.0
}

fn default_critical_dd_pct() -> f64 {
    15.0
}

fn default_lock_dd_pct() -> f64 {
    20.0
}

fn default_equity_ma_period() -> usize {
    20
}

fn default_use_equity_curve_filter() -> bool {
    true
}

fn default_max_dd_duration() -> u32 {
    50
}

impl Default for DrawdownConfig {
    fn default() -> Self {
        Self {
            warning_dd_pct: default_warning_dd_pct(),
            caution_dd_pct: default_caution_dd_pct(),
            critical_dd_pct: default_critical_dd_pct(),
            lock_dd_pct: default_lock_dd_pct(),
            equity_ma_period: default_equity_ma_period(),
            use_equity_curve_filter: default_use_equity_curve_filter(),
            max_dd_duration: default_max_dd_duration(),
        }
    }
}

/// Severity tier derived from the current drawdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DrawdownSeverity {
    Normal,
    Warning,
    Caution,
    Critical,
    Locked,
}

impl std::fmt::Display for DrawdownSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrawdownSeverity::Normal => write!(f, "NORMAL"),
            DrawdownSeverity::Warning => write!(f, "WARNING"),
            DrawdownSeverity::Caution => write!(f, "CAUTION"),
            DrawdownSeverity::Critical => write!(f, "CRITICAL"),
            DrawdownSeverity::Locked => write!(f, "LOCKED"),
        }
    }
}

/// Point-in-time view of the protector
#[derive(Debug, Clone, Serialize)]
pub struct DrawdownState {
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    pub current_drawdown_pct: f64,
    pub max_drawdown_pct: f64,
    /// Consecutive observations spent in drawdown.
    pub drawdown_duration: u32,
    pub severity: DrawdownSeverity,
    pub multiplier: Decimal,
    pub below_equity_ma: bool,
    pub locked: bool,
    pub lock_reason: Option<String>,
}

#[derive(Debug, Default)]
struct DrawdownInner {
    peak_equity: Decimal,
    current_equity: Decimal,
    current_drawdown_pct: f64,
    max_drawdown_pct: f64,
    drawdown_duration: u32,
    equity_history: VecDeque<Decimal>,
    below_equity_ma: bool,
    locked: bool,
    lock_reason: Option<String>,
    initialized: bool,
}

/// Equity high-water-mark tracker that scales position sizing down as
/// drawdown deepens and locks out trading entirely past the worst tier.
pub struct DrawdownProtector {
    config: DrawdownConfig,
    inner: Mutex<DrawdownInner>,
}

impl DrawdownProtector {
    pub fn new(config: DrawdownConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(DrawdownInner::default()),
        }
    }

    /// Feed one equity observation. The first observation seeds the
    /// high-water mark.
    pub async fn observe_equity(&self, equity: Decimal) -> DrawdownState {
        let mut inner = self.inner.lock().await;

        if !inner.initialized {
            inner.peak_equity = equity;
            inner.initialized = true;
        }
        inner.current_equity = equity;
        if equity > inner.peak_equity {
            inner.peak_equity = equity;
        }

        let dd_pct = drawdown_pct(inner.peak_equity, equity);
        inner.current_drawdown_pct = dd_pct;
        if dd_pct > inner.max_drawdown_pct {
            inner.max_drawdown_pct = dd_pct;
        }

        if dd_pct > 0.0 {
            inner.drawdown_duration += 1;
        } else {
            inner.drawdown_duration = 0;
        }

        inner.equity_history.push_back(equity);
        while inner.equity_history.len() > self.config.equity_ma_period {
            inner.equity_history.pop_front();
        }
        inner.below_equity_ma = if inner.equity_history.len() >= self.config.equity_ma_period {
            let sum: Decimal = inner.equity_history.iter().copied().sum();
            let ma = sum / Decimal::from(inner.equity_history.len() as u64);
            equity < ma
        } else {
            false
        };

        if !inner.locked {
            if dd_pct >= self.config.lock_dd_pct {
                inner.locked = true;
                inner.lock_reason = Some(format!(
                    "drawdown {:.2}% breached lock threshold {:.2}%",
                    dd_pct, self.config.lock_dd_pct
                ));
                warn!(
                    drawdown_pct = dd_pct,
                    threshold = self.config.lock_dd_pct,
                    "drawdown protector locked"
                );
            } else if inner.drawdown_duration >= self.config.max_dd_duration {
                inner.locked = true;
                inner.lock_reason = Some(format!(
                    "drawdown duration {} reached limit {}",
                    inner.drawdown_duration, self.config.max_dd_duration
                ));
                warn!(
                    duration = inner.drawdown_duration,
                    limit = self.config.max_dd_duration,
                    "drawdown protector locked on duration"
                );
            }
        }

        debug!(
            equity = %equity,
            peak = %inner.peak_equity,
            drawdown_pct = dd_pct,
            "equity observed"
        );
        self.snapshot(&inner)
    }

    /// Sizing multiplier for new orders. Zero means no new positions.
    pub async fn position_size_multiplier(&self) -> Decimal {
        let inner = self.inner.lock().await;
        self.multiplier_for(&inner)
    }

    pub async fn is_trading_allowed(&self) -> bool {
        let inner = self.inner.lock().await;
        self.multiplier_for(&inner) > Decimal::ZERO
    }

    pub async fn severity(&self) -> DrawdownSeverity {
        let inner = self.inner.lock().await;
        self.severity_for(&inner)
    }

    pub async fn status(&self) -> DrawdownState {
        let inner = self.inner.lock().await;
        self.snapshot(&inner)
    }

    /// Manual unlock. Resets duration and the high-water mark to the
    /// given equity (or the last observed one).
    pub async fn reset(&self, new_peak: Option<Decimal>) {
        let mut inner = self.inner.lock().await;
        let peak = new_peak.unwrap_or(inner.current_equity);
        inner.peak_equity = peak;
        inner.current_drawdown_pct = drawdown_pct(peak, inner.current_equity);
        inner.drawdown_duration = 0;
        inner.locked = false;
        inner.lock_reason = None;
        info!(peak = %peak, "drawdown protector reset");
    }

    fn multiplier_for(&self, inner: &DrawdownInner) -> Decimal {
        if inner.locked {
            return Decimal::ZERO;
        }
        let dd = inner.current_drawdown_pct;
        let mut multiplier = if dd >= self.config.critical_dd_pct {
            Decimal::ZERO
        } else if dd >= self.config.caution_dd_pct {
            dec!(0.25)
        } else if dd >= self.config.warning_dd_pct {
            dec!(0.5)
        } else {
            Decimal::ONE
        };
        if self.config.use_equity_curve_filter && inner.below_equity_ma {
            multiplier = multiplier.min(dec!(0.5));
        }
        multiplier
    }

    fn severity_for(&self, inner: &DrawdownInner) -> DrawdownSeverity {
        if inner.locked {
            return DrawdownSeverity::Locked;
        }
        let dd = inner.current_drawdown_pct;
        if dd >= self.config.critical_dd_pct {
            DrawdownSeverity::Critical
        } else if dd >= self.config.caution_dd_pct {
            DrawdownSeverity::Caution
        } else if dd >= self.config.warning_dd_pct {
            DrawdownSeverity::Warning
        } else {
            DrawdownSeverity::Normal
        }
    }

    fn snapshot(&self, inner: &DrawdownInner) -> DrawdownState {
        DrawdownState {
            peak_equity: inner.peak_equity,
            current_equity: inner.current_equity,
            current_drawdown_pct: inner.current_drawdown_pct,
            max_drawdown_pct: inner.max_drawdown_pct,
            drawdown_duration: inner.drawdown_duration,
            severity: self.severity_for(inner),
            multiplier: self.multiplier_for(inner),
            below_equity_ma: inner.below_equity_ma,
            locked: inner.locked,
            lock_reason: inner.lock_reason.clone(),
        }
    }
}

impl Default for DrawdownProtector {
    fn default() -> Self {
        Self::new(DrawdownConfig::default())
    }
}

fn drawdown_pct(peak: Decimal, current: Decimal) -> f64 {
    if peak <= Decimal::ZERO {
        return 0.0;
    }
    if current >= peak {
        return 0.0;
    }
    ((peak - current) / peak * Decimal::from(100))
        .to_f64()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn protector() -> DrawdownProtector {
        // MA filter off so tier tests see the pure thresholds.
        DrawdownProtector::new(DrawdownConfig {
            use_equity_curve_filter: false,
            ..DrawdownConfig::default()
        })
    }

    #[tokio::test]
    async fn multiplier_tiers_follow_drawdown() {
        let p = protector();
        p.observe_equity(dec!(100000)).await;
        assert_eq!(p.position_size_multiplier().await, Decimal::ONE);

        p.observe_equity(dec!(94000)).await; // 6% down
        assert_eq!(p.position_size_multiplier().await, dec!(0.5));
        assert_eq!(p.severity().await, DrawdownSeverity::Warning);

        p.observe_equity(dec!(88000)).await; // 12% down
        assert_eq!(p.position_size_multiplier().await, dec!(0.25));
        assert_eq!(p.severity().await, DrawdownSeverity::Caution);

        p.observe_equity(dec!(84000)).await; // 16% down
        assert_eq!(p.position_size_multiplier().await, Decimal::ZERO);
        assert_eq!(p.severity().await, DrawdownSeverity::Critical);
    }

    #[tokio::test]
    async fn recovery_restores_full_size() {
        let p = protector();
        p.observe_equity(dec!(100000)).await;
        p.observe_equity(dec!(88000)).await;
        assert_eq!(p.position_size_multiplier().await, dec!(0.25));

        let state = p.observe_equity(dec!(101000)).await;
        assert_eq!(state.multiplier, Decimal::ONE);
        assert_eq!(state.peak_equity, dec!(101000));
        assert_eq!(state.drawdown_duration, 0);
        // Historic worst is kept.
        assert!(state.max_drawdown_pct > 11.0);
    }

    #[tokio::test]
    async fn lock_threshold_requires_manual_reset() {
        let p = protector();
        p.observe_equity(dec!(100000)).await;
        let state = p.observe_equity(dec!(79000)).await; // 21% down
        assert!(state.locked);
        assert_eq!(state.severity, DrawdownSeverity::Locked);
        assert!(!p.is_trading_allowed().await);

        // Recovery alone does not unlock.
        p.observe_equity(dec!(99000)).await;
        assert!(!p.is_trading_allowed().await);

        p.reset(Some(dec!(99000))).await;
        assert!(p.is_trading_allowed().await);
        assert_eq!(p.position_size_multiplier().await, Decimal::ONE);
    }

    #[tokio::test]
    async fn duration_lock_triggers_after_long_drawdown() {
        let p = DrawdownProtector::new(DrawdownConfig {
            use_equity_curve_filter: false,
            max_dd_duration: 3,
            ..DrawdownConfig::default()
        });
        p.observe_equity(dec!(100000)).await;
        p.observe_equity(dec!(99000)).await;
        p.observe_equity(dec!(99100)).await;
        let state = p.observe_equity(dec!(99050)).await;
        assert!(state.locked);
        assert!(state
            .lock_reason
            .as_deref()
            .unwrap_or_default()
            .contains("duration"));
    }

    #[tokio::test]
    async fn equity_ma_filter_halves_size() {
        let p = DrawdownProtector::new(DrawdownConfig {
            equity_ma_period: 3,
            ..DrawdownConfig::default()
        });
        // Rising then a small dip below the 3-observation average, with
        // drawdown still under the warning tier.
        p.observe_equity(dec!(100000)).await;
        p.observe_equity(dec!(101000)).await;
        p.observe_equity(dec!(102000)).await;
        let state = p.observe_equity(dec!(100500)).await;
        assert!(state.below_equity_ma);
        assert!(state.current_drawdown_pct < 5.0);
        assert_eq!(state.multiplier, dec!(0.5));
    }

    #[tokio::test]
    async fn first_observation_seeds_peak() {
        let p = protector();
        let state = p.observe_equity(dec!(50000)).await;
        assert_eq!(state.peak_equity, dec!(50000));
        assert_eq!(state.current_drawdown_pct, 0.0);
        assert_eq!(state.multiplier, Decimal::ONE);
    }
}
