use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Position sizing method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    FixedFractional,
    VolatilityAdjusted,
    Kelly,
    CvarBased,
}

impl std::fmt::Display for SizingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizingMethod::FixedFractional => write!(f, "fixed_fractional"),
            SizingMethod::VolatilityAdjusted => write!(f, "volatility_adjusted"),
            SizingMethod::Kelly => write!(f, "kelly"),
            SizingMethod::CvarBased => write!(f, "cvar_based"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizingConfig {
    #[serde(default = "default_method")]
    pub default_method: SizingMethod,
    /// Account fraction risked per trade, percent.
    #[serde(default = "default_risk_pct")]
    pub default_risk_pct: f64,
    /// Hard cap on position value as a percent of balance.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,
    /// Fraction of full Kelly actually deployed.
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
    /// Stop distance in ATRs for volatility sizing.
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,
}

fn default_method() -> SizingMethod {
    SizingMethod::FixedFractional
}

fn default_risk_pct() -> f64 {
    2.0
}

fn default_max_position_pct() -> f64 {
    25.0
}

fn default_kelly_fraction() -> f64 {
    0.25
}

fn default_atr_multiplier() -> f64 {
    2.0
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            default_method: default_method(),
            default_risk_pct: default_risk_pct(),
            max_position_pct: default_max_position_pct(),
            kelly_fraction: default_kelly_fraction(),
            atr_multiplier: default_atr_multiplier(),
        }
    }
}

/// Everything a sizing method may need. Methods ignore fields they
/// do not use; missing fields make the method fall back or size zero.
#[derive(Debug, Clone)]
pub struct SizingInputs {
    pub balance: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub atr: Option<Decimal>,
    pub win_rate: Option<f64>,
    pub avg_win: Option<f64>,
    pub avg_loss: Option<f64>,
    /// Expected tail loss (CVaR at 95%), as a fraction of position value.
    pub cvar_95: Option<f64>,
    /// Override for the configured per-trade risk percent.
    pub risk_pct: Option<f64>,
    pub method: Option<SizingMethod>,
    /// Scaling from the drawdown protector, applied after the method and
    /// before the cap.
    pub drawdown_multiplier: Decimal,
}

impl SizingInputs {
    pub fn new(balance: Decimal, entry_price: Decimal) -> Self {
        Self {
            balance,
            entry_price,
            stop_loss: None,
            atr: None,
            win_rate: None,
            avg_win: None,
            avg_loss: None,
            cvar_95: None,
            risk_pct: None,
            method: None,
            drawdown_multiplier: Decimal::ONE,
        }
    }

    pub fn with_stop_loss(mut self, stop_loss: Decimal) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_atr(mut self, atr: Decimal) -> Self {
        self.atr = Some(atr);
        self
    }

    pub fn with_kelly_stats(mut self, win_rate: f64, avg_win: f64, avg_loss: f64) -> Self {
        self.win_rate = Some(win_rate);
        self.avg_win = Some(avg_win);
        self.avg_loss = Some(avg_loss);
        self
    }

    pub fn with_cvar(mut self, cvar_95: f64) -> Self {
        self.cvar_95 = Some(cvar_95);
        self
    }

    pub fn with_risk_pct(mut self, risk_pct: f64) -> Self {
        self.risk_pct = Some(risk_pct);
        self
    }

    pub fn with_method(mut self, method: SizingMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_drawdown_multiplier(mut self, multiplier: Decimal) -> Self {
        self.drawdown_multiplier = multiplier;
        self
    }
}

/// Sizing result
#[derive(Debug, Clone, Serialize)]
pub struct PositionSize {
    pub quantity: Decimal,
    pub value: Decimal,
    /// Account currency amount at risk if the stop is hit, for the final
    /// (capped) quantity.
    pub risk_amount: Decimal,
    /// `risk_amount` as a percent of balance.
    pub risk_pct_actual: f64,
    pub method: SizingMethod,
}

impl PositionSize {
    fn zero(method: SizingMethod) -> Self {
        Self {
            quantity: Decimal::ZERO,
            value: Decimal::ZERO,
            risk_amount: Decimal::ZERO,
            risk_pct_actual: 0.0,
            method,
        }
    }
}

/// Position sizer. All methods floor at zero and respect the
/// `max_position_pct` cap; none of them ever panics on degenerate input.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    /// Dispatch on the requested (or configured) method.
    pub fn calculate(&self, inputs: &SizingInputs) -> PositionSize {
        let method = inputs.method.unwrap_or(self.config.default_method);
        let result = match method {
            SizingMethod::FixedFractional => self.fixed_fractional(inputs),
            SizingMethod::VolatilityAdjusted => self.volatility_adjusted(inputs),
            SizingMethod::Kelly => self.kelly(inputs),
            SizingMethod::CvarBased => self.cvar_based(inputs),
        };
        debug!(
            method = %result.method,
            quantity = %result.quantity,
            value = %result.value,
            "position sized"
        );
        result
    }

    /// Risk a fixed fraction of the balance per trade: risk budget divided
    /// by the stop distance. Without a stop a synthetic one 2% below entry
    /// stands in; a stop exactly at entry sizes zero.
    pub fn fixed_fractional(&self, inputs: &SizingInputs) -> PositionSize {
        if !positive(inputs.balance) || !positive(inputs.entry_price) {
            return PositionSize::zero(SizingMethod::FixedFractional);
        }
        let risk_amount = inputs.balance * self.risk_fraction(inputs);
        let per_unit = match inputs.stop_loss {
            Some(stop) => (inputs.entry_price - stop).abs(),
            None => inputs.entry_price * dec!(0.02),
        };
        if per_unit.is_zero() {
            return PositionSize::zero(SizingMethod::FixedFractional);
        }
        self.finalize(SizingMethod::FixedFractional, inputs, risk_amount / per_unit)
    }

    /// Stop distance derived from volatility: `atr_multiplier` ATRs.
    /// Without a usable ATR this falls back to fixed-fractional.
    pub fn volatility_adjusted(&self, inputs: &SizingInputs) -> PositionSize {
        if !positive(inputs.balance) || !positive(inputs.entry_price) {
            return PositionSize::zero(SizingMethod::VolatilityAdjusted);
        }
        let atr = match inputs.atr.filter(|a| positive(*a)) {
            Some(atr) => atr,
            None => return self.fixed_fractional(inputs),
        };
        let stop_distance =
            atr * Decimal::from_f64(self.config.atr_multiplier).unwrap_or(Decimal::TWO);
        if stop_distance.is_zero() {
            return self.fixed_fractional(inputs);
        }
        let risk_amount = inputs.balance * self.risk_fraction(inputs);
        self.finalize(
            SizingMethod::VolatilityAdjusted,
            inputs,
            risk_amount / stop_distance,
        )
    }

    /// Fractional Kelly. A missing or degenerate trade history falls back
    /// to fixed-fractional; a negative edge sizes zero.
    pub fn kelly(&self, inputs: &SizingInputs) -> PositionSize {
        if !positive(inputs.balance) || !positive(inputs.entry_price) {
            return PositionSize::zero(SizingMethod::Kelly);
        }
        let (win_rate, avg_win, avg_loss) =
            match (inputs.win_rate, inputs.avg_win, inputs.avg_loss) {
                (Some(w), Some(aw), Some(al)) if al > 0.0 && aw > 0.0 && (0.0..=1.0).contains(&w) => {
                    (w, aw, al)
                }
                _ => return self.fixed_fractional(inputs),
            };
        let payoff = avg_win / avg_loss;
        let kelly = win_rate - (1.0 - win_rate) / payoff;
        if kelly <= 0.0 {
            // No edge, no trade.
            return PositionSize::zero(SizingMethod::Kelly);
        }
        // Deploy a fraction of full Kelly, never more than a quarter of
        // the account.
        let allocation = (kelly * self.config.kelly_fraction).min(0.25);
        let value = inputs.balance * Decimal::from_f64(allocation).unwrap_or(Decimal::ZERO);
        self.finalize(SizingMethod::Kelly, inputs, value / inputs.entry_price)
    }

    /// Size so the expected tail loss equals the per-trade risk budget.
    /// Without a usable CVaR estimate this falls back to fixed-fractional.
    pub fn cvar_based(&self, inputs: &SizingInputs) -> PositionSize {
        if !positive(inputs.balance) || !positive(inputs.entry_price) {
            return PositionSize::zero(SizingMethod::CvarBased);
        }
        let cvar = match inputs.cvar_95.filter(|c| *c > 0.0) {
            Some(cvar) => cvar,
            None => return self.fixed_fractional(inputs),
        };
        let risk_amount = inputs.balance * self.risk_fraction(inputs);
        let value = risk_amount / Decimal::from_f64(cvar).unwrap_or(Decimal::ONE);
        self.finalize(SizingMethod::CvarBased, inputs, value / inputs.entry_price)
    }

    fn risk_fraction(&self, inputs: &SizingInputs) -> Decimal {
        let pct = inputs.risk_pct.unwrap_or(self.config.default_risk_pct);
        Decimal::from_f64(pct / 100.0).unwrap_or(Decimal::ZERO)
    }

    /// Apply the drawdown multiplier, clamp to the position-value cap,
    /// floor at zero, then derive the risk of the final size.
    fn finalize(&self, method: SizingMethod, inputs: &SizingInputs, quantity: Decimal) -> PositionSize {
        let mut quantity = quantity * inputs.drawdown_multiplier;
        if quantity <= Decimal::ZERO {
            return PositionSize::zero(method);
        }
        let max_value = inputs.balance
            * Decimal::from_f64(self.config.max_position_pct / 100.0).unwrap_or(Decimal::ONE);
        let mut value = quantity * inputs.entry_price;
        if value > max_value {
            quantity = max_value / inputs.entry_price;
            value = quantity * inputs.entry_price;
        }
        // Dollar risk of what will actually be traded; a missing stop is
        // treated as 2% of entry, matching the synthetic-stop fallback.
        let risk_amount = match inputs.stop_loss {
            Some(stop) => (inputs.entry_price - stop).abs() * quantity,
            None => value * dec!(0.02),
        };
        let risk_pct_actual = if inputs.balance.is_zero() {
            0.0
        } else {
            (risk_amount / inputs.balance * Decimal::from(100))
                .to_f64()
                .unwrap_or(0.0)
        };
        PositionSize {
            quantity,
            value,
            risk_amount,
            risk_pct_actual,
            method,
        }
    }
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self::new(SizingConfig::default())
    }
}

fn positive(value: Decimal) -> bool {
    value > Decimal::ZERO
}
