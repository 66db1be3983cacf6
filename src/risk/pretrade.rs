use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{OrderSide, PositionSnapshot};

/// Everything a pre-trade check may look at.
///
/// The check must be a pure function of this snapshot, so a decision can
/// be replayed from the audit record alone.
#[derive(Debug, Clone, Serialize)]
pub struct PreTradeInputs {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Leverage requested by the caller, if any.
    pub leverage: Option<f64>,
    pub account_balance: Decimal,
    pub open_positions: Vec<PositionSnapshot>,
    /// Sizing multiplier already applied upstream.
    pub drawdown_multiplier: Decimal,
    /// Circuit breaker verdict at pipeline entry.
    pub breaker_ok: bool,
}

impl PreTradeInputs {
    pub fn order_value(&self) -> Decimal {
        self.price * self.quantity
    }

    pub fn open_exposure(&self) -> Decimal {
        self.open_positions.iter().map(|p| p.value()).sum()
    }

    pub fn has_position_in(&self, symbol: &str) -> bool {
        self.open_positions.iter().any(|p| p.symbol == symbol)
    }
}

/// Outcome of a pre-trade check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreTradeDecision {
    pub approved: bool,
    pub rejections: Vec<String>,
    pub warnings: Vec<String>,
    /// Set when the check wants the order shrunk rather than rejected.
    pub adjusted_quantity: Option<Decimal>,
    /// 0 to 100, higher means riskier.
    pub risk_score: f64,
}

impl PreTradeDecision {
    pub fn approved() -> Self {
        Self {
            approved: true,
            rejections: Vec::new(),
            warnings: Vec::new(),
            adjusted_quantity: None,
            risk_score: 0.0,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            rejections: vec![reason.into()],
            warnings: Vec::new(),
            adjusted_quantity: None,
            risk_score: 0.0,
        }
    }
}

/// Last risk gate before execution. Implementations decide, the router
/// enforces; swapping in a desk-specific rule set never touches the
/// pipeline.
pub trait PreTradeCheck: Send + Sync {
    fn check(&self, inputs: &PreTradeInputs) -> PreTradeDecision;
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreTradeConfig {
    #[serde(default = "default_min_balance")]
    pub min_balance: Decimal,
    #[serde(default = "default_min_order_value")]
    pub min_order_value: Decimal,
    #[serde(default = "default_max_order_value")]
    pub max_order_value: Decimal,
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: Decimal,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Single-order value cap as a percent of balance; orders above it are
    /// resized down, not rejected.
    #[serde(default = "default_max_position_pct_of_balance")]
    pub max_position_pct_of_balance: f64,
    /// Stop-implied loss cap as a percent of balance.
    #[serde(default = "default_max_risk_per_trade_pct")]
    pub max_risk_per_trade_pct: f64,
    /// Reward-to-risk ratios below this draw a warning.
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: f64,
}

fn default_min_balance() -> Decimal {
    Decimal::from(100)
}

fn default_min_order_value() -> Decimal {
    Decimal::from(10)
}

fn default_max_order_value() -> Decimal {
    Decimal::from(50_000)
}

fn default_max_total_exposure() -> Decimal {
    Decimal::from(100_000)
}

fn default_max_leverage() -> f64 {
    3.0
}

fn default_max_open_positions() -> usize {
    10
}

fn default_max_position_pct_of_balance() -> f64 {
    25.0
}

fn default_max_risk_per_trade_pct() -> f64 {
    2.0
}

fn default_min_risk_reward() -> f64 {
    1.5
}

impl Default for PreTradeConfig {
    fn default() -> Self {
        Self {
            min_balance: default_min_balance(),
            min_order_value: default_min_order_value(),
            max_order_value: default_max_order_value(),
            max_total_exposure: default_max_total_exposure(),
            max_leverage: default_max_leverage(),
            max_open_positions: default_max_open_positions(),
            max_position_pct_of_balance: default_max_position_pct_of_balance(),
            max_risk_per_trade_pct: default_max_risk_per_trade_pct(),
            min_risk_reward: default_min_risk_reward(),
        }
    }
}

/// Stock rule set: balance, order-value bounds, position count, exposure,
/// leverage, and a resize cap on single-order size.
#[derive(Debug, Clone)]
pub struct StandardPreTradeCheck {
    config: PreTradeConfig,
}

impl StandardPreTradeCheck {
    pub fn new(config: PreTradeConfig) -> Self {
        Self { config }
    }
}

impl Default for StandardPreTradeCheck {
    fn default() -> Self {
        Self::new(PreTradeConfig::default())
    }
}

impl PreTradeCheck for StandardPreTradeCheck {
    fn check(&self, inputs: &PreTradeInputs) -> PreTradeDecision {
        let mut rejections = Vec::new();
        let mut warnings = Vec::new();
        let mut adjusted_quantity = None;
        let mut risk_score = 0.0_f64;

        if inputs.quantity <= Decimal::ZERO {
            rejections.push("quantity must be positive".to_string());
        }
        if inputs.price <= Decimal::ZERO {
            rejections.push("price must be positive".to_string());
        }
        if !inputs.breaker_ok {
            rejections.push("circuit breaker disallows new orders".to_string());
        }
        if inputs.drawdown_multiplier <= Decimal::ZERO {
            rejections.push("drawdown protection disallows new positions".to_string());
        }
        if inputs.account_balance < self.config.min_balance {
            rejections.push(format!(
                "balance {} below minimum {}",
                inputs.account_balance, self.config.min_balance
            ));
        }
        if let Some(requested) = inputs.leverage {
            if requested > self.config.max_leverage {
                rejections.push(format!(
                    "requested leverage {requested:.2}x exceeds limit {:.2}x",
                    self.config.max_leverage
                ));
                risk_score += 25.0;
            }
        }
        if let Some(stop) = inputs.stop_loss {
            let wrong_side = match inputs.side {
                OrderSide::Buy => stop >= inputs.price,
                OrderSide::Sell => stop <= inputs.price,
            };
            if wrong_side {
                rejections.push(format!(
                    "stop loss {stop} on the wrong side of entry {}",
                    inputs.price
                ));
                risk_score += 20.0;
            }
        }
        if let Some(target) = inputs.take_profit {
            let wrong_side = match inputs.side {
                OrderSide::Buy => target <= inputs.price,
                OrderSide::Sell => target >= inputs.price,
            };
            if wrong_side {
                warnings.push(format!(
                    "take profit {target} on the wrong side of entry {}",
                    inputs.price
                ));
            }
        }

        // Per-order cap resizes rather than rejects; the checks below use
        // the capped quantity, as execution will.
        let mut working_quantity = inputs.quantity;
        if rejections.is_empty() && inputs.account_balance > Decimal::ZERO {
            let cap = inputs.account_balance
                * Decimal::from_f64(self.config.max_position_pct_of_balance / 100.0)
                    .unwrap_or(Decimal::ONE);
            if inputs.order_value() > cap && inputs.price > Decimal::ZERO {
                working_quantity = cap / inputs.price;
                warnings.push(format!(
                    "order resized from {} to {} by position cap",
                    inputs.quantity, working_quantity
                ));
                adjusted_quantity = Some(working_quantity);
                risk_score += 20.0;
            }
        }

        let value = inputs.price * working_quantity;
        if rejections.is_empty() {
            if value < self.config.min_order_value {
                rejections.push(format!(
                    "order value {} below minimum {}",
                    value, self.config.min_order_value
                ));
            }
            if value > self.config.max_order_value {
                rejections.push(format!(
                    "order value {} exceeds maximum {}",
                    value, self.config.max_order_value
                ));
            }

            if let Some(stop) = inputs.stop_loss {
                if inputs.account_balance > Decimal::ZERO {
                    let risk_value = (inputs.price - stop).abs() * working_quantity;
                    let risk_pct = (risk_value / inputs.account_balance)
                        .to_f64()
                        .unwrap_or(f64::MAX)
                        * 100.0;
                    if risk_pct > self.config.max_risk_per_trade_pct {
                        rejections.push(format!(
                            "risk per trade {risk_pct:.2}% exceeds limit {:.2}%",
                            self.config.max_risk_per_trade_pct
                        ));
                        risk_score += 30.0;
                    }
                }
            }

            if inputs.open_positions.len() >= self.config.max_open_positions
                && !inputs.has_position_in(&inputs.symbol)
            {
                rejections.push(format!(
                    "open position count {} at limit {}",
                    inputs.open_positions.len(),
                    self.config.max_open_positions
                ));
                risk_score += 15.0;
            }

            let exposure = inputs.open_exposure();
            if exposure + value > self.config.max_total_exposure {
                rejections.push(format!(
                    "total exposure {} would exceed limit {}",
                    exposure + value,
                    self.config.max_total_exposure
                ));
                risk_score += 15.0;
            }

            if inputs.account_balance > Decimal::ZERO {
                let leverage = ((exposure + value) / inputs.account_balance)
                    .to_f64()
                    .unwrap_or(f64::MAX);
                if leverage > self.config.max_leverage {
                    rejections.push(format!(
                        "leverage {:.2}x would exceed limit {:.2}x",
                        leverage, self.config.max_leverage
                    ));
                    risk_score += 25.0;
                }
            }

            if let (Some(stop), Some(target)) = (inputs.stop_loss, inputs.take_profit) {
                let risk = (inputs.price - stop).abs();
                let reward = (target - inputs.price).abs();
                if risk > Decimal::ZERO {
                    let ratio = (reward / risk).to_f64().unwrap_or(0.0);
                    if ratio < self.config.min_risk_reward {
                        warnings.push(format!(
                            "risk/reward {ratio:.2} below minimum {:.2}",
                            self.config.min_risk_reward
                        ));
                        risk_score += 10.0;
                    }
                }
            }

            if inputs.drawdown_multiplier < Decimal::ONE {
                warnings.push(format!(
                    "sizing already reduced to {} by drawdown protection",
                    inputs.drawdown_multiplier
                ));
                risk_score += 15.0;
            }

            if let Some(existing) = inputs
                .open_positions
                .iter()
                .find(|p| p.symbol == inputs.symbol && p.side == inputs.side)
            {
                warnings.push(format!(
                    "adding to existing {} position in {}",
                    existing.side, existing.symbol
                ));
                risk_score += 10.0;
            }
        }

        let approved = rejections.is_empty();
        debug!(
            symbol = %inputs.symbol,
            approved,
            rejections = rejections.len(),
            warnings = warnings.len(),
            risk_score,
            "pre-trade check complete"
        );
        PreTradeDecision {
            approved,
            rejections,
            warnings,
            adjusted_quantity,
            risk_score: risk_score.min(100.0),
        }
    }
}
