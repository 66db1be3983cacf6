//! Layered configuration for the execution pipeline.
//!
//! Settings load from `default.toml`, then an environment-specific file
//! chosen by `BREAKWATER_ENV`, then `BREAKWATER__`-prefixed environment
//! variables. Every section has working defaults, so all sources are
//! optional and a missing config directory yields a paper-trading setup.

use std::path::Path;

use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::broker::PaperConfig;
use crate::error::Result;
use crate::execution::dedup::DedupConfig;
use crate::execution::latency::LatencyConfig;
use crate::execution::retry::RetryPolicy;
use crate::execution::slippage::SlippageConfig;
use crate::mode::ModeConfig;
use crate::risk::{CircuitBreakerConfig, DrawdownConfig, PreTradeConfig, SizingConfig};

/// Top-level configuration covering every pipeline component.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub drawdown: DrawdownConfig,
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub pretrade: PreTradeConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub slippage: SlippageConfig,
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub mode: ModeConfig,
}

impl PipelineConfig {
    /// Loads configuration from the `config/` directory next to the binary.
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Loads configuration from an explicit directory.
    ///
    /// Layering order, later sources winning:
    /// 1. `<dir>/default.toml`
    /// 2. `<dir>/{BREAKWATER_ENV}.toml` (defaults to `development`)
    /// 3. environment variables: `BREAKWATER__RETRY__MAX_ATTEMPTS=5`
    pub fn load_from<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let env = std::env::var("BREAKWATER_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .add_source(File::from(dir.join("default.toml")).required(false))
            .add_source(File::from(dir.join(format!("{env}.toml"))).required(false))
            .add_source(
                Environment::with_prefix("BREAKWATER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Checks cross-field consistency, collecting every problem found.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            errors.push("retry.backoff_multiplier must be at least 1.0".to_string());
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.initial_delay_ms exceeds retry.max_delay_ms".to_string());
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            errors.push("retry.jitter must be in [0, 1)".to_string());
        }

        if self.circuit_breaker.max_daily_loss_pct <= 0.0 {
            errors.push("circuit_breaker.max_daily_loss_pct must be positive".to_string());
        }
        if self.circuit_breaker.max_drawdown_pct <= 0.0 {
            errors.push("circuit_breaker.max_drawdown_pct must be positive".to_string());
        }
        if self.circuit_breaker.max_consecutive_failures == 0 {
            errors.push("circuit_breaker.max_consecutive_failures must be at least 1".to_string());
        }
        if self.circuit_breaker.unlock_token.is_empty() {
            errors.push("circuit_breaker.unlock_token must not be empty".to_string());
        }

        let dd = &self.drawdown;
        let ladder_ordered = dd.warning_dd_pct > 0.0
            && dd.warning_dd_pct < dd.caution_dd_pct
            && dd.caution_dd_pct < dd.critical_dd_pct
            && dd.critical_dd_pct < dd.lock_dd_pct;
        if !ladder_ordered {
            errors.push(
                "drawdown thresholds must be strictly increasing: warning < caution < critical < lock"
                    .to_string(),
            );
        }
        if dd.lock_dd_pct > 100.0 {
            errors.push("drawdown.lock_dd_pct must not exceed 100".to_string());
        }
        if dd.use_equity_curve_filter && dd.equity_ma_period == 0 {
            errors.push("drawdown.equity_ma_period must be at least 1 when the filter is on".to_string());
        }

        if self.pretrade.min_order_value > self.pretrade.max_order_value {
            errors.push("pretrade.min_order_value exceeds pretrade.max_order_value".to_string());
        }
        if self.pretrade.max_leverage < 1.0 {
            errors.push("pretrade.max_leverage must be at least 1.0".to_string());
        }
        if !(0.0..=100.0).contains(&self.pretrade.max_position_pct_of_balance)
            || self.pretrade.max_position_pct_of_balance == 0.0
        {
            errors.push("pretrade.max_position_pct_of_balance must be in (0, 100]".to_string());
        }
        if self.pretrade.max_risk_per_trade_pct <= 0.0 {
            errors.push("pretrade.max_risk_per_trade_pct must be positive".to_string());
        }
        if self.pretrade.min_risk_reward <= 0.0 {
            errors.push("pretrade.min_risk_reward must be positive".to_string());
        }

        if self.sizing.default_risk_pct <= 0.0 || self.sizing.default_risk_pct > 100.0 {
            errors.push("sizing.default_risk_pct must be in (0, 100]".to_string());
        }
        if self.sizing.max_position_pct <= 0.0 || self.sizing.max_position_pct > 100.0 {
            errors.push("sizing.max_position_pct must be in (0, 100]".to_string());
        }
        if self.sizing.kelly_fraction <= 0.0 || self.sizing.kelly_fraction > 1.0 {
            errors.push("sizing.kelly_fraction must be in (0, 1]".to_string());
        }

        if self.dedup.window_secs == 0 {
            errors.push("dedup.window_secs must be at least 1".to_string());
        }

        if self.slippage.base_bps < 0.0 {
            errors.push("slippage.base_bps must not be negative".to_string());
        }
        if self.slippage.alert_threshold_bps <= 0.0 {
            errors.push("slippage.alert_threshold_bps must be positive".to_string());
        }
        if self.slippage.history_limit == 0 {
            errors.push("slippage.history_limit must be at least 1".to_string());
        }

        if self.latency.warn_threshold_ms > self.latency.critical_threshold_ms {
            errors.push("latency.warn_threshold_ms exceeds latency.critical_threshold_ms".to_string());
        }
        if self.latency.history_limit == 0 {
            errors.push("latency.history_limit must be at least 1".to_string());
        }

        if self.paper.min_latency_ms > self.paper.max_latency_ms {
            errors.push("paper.min_latency_ms exceeds paper.max_latency_ms".to_string());
        }
        if !(0.0..=1.0).contains(&self.paper.partial_fill_probability) {
            errors.push("paper.partial_fill_probability must be in [0, 1]".to_string());
        }
        if self.paper.partial_fill_probability > 0.0 {
            let ratios_ok = self.paper.partial_fill_min_ratio > 0.0
                && self.paper.partial_fill_min_ratio <= self.paper.partial_fill_max_ratio
                && self.paper.partial_fill_max_ratio <= 1.0;
            if !ratios_ok {
                errors.push(
                    "paper partial fill ratios must satisfy 0 < min <= max <= 1".to_string(),
                );
            }
        }
        if self.paper.max_slippage_bps < 0.0 {
            errors.push("paper.max_slippage_bps must not be negative".to_string());
        }

        if self.mode.min_paper_days < 0 {
            errors.push("mode.min_paper_days must not be negative".to_string());
        }
        if self.mode.confirmation_key.is_empty() {
            errors.push("mode.confirmation_key must not be empty".to_string());
        }
        if self.mode.max_live_capital <= Decimal::ZERO {
            errors.push("mode.max_live_capital must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
