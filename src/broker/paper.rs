use async_trait::async_trait;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::time::{sleep, Duration};
use tracing::debug;
use uuid::Uuid;

use super::{BrokerAck, BrokerConnector, OrderInstruction};
use crate::domain::OrderSide;
use crate::error::BrokerError;

/// Tuning for the simulated broker
#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    /// Simulated exchange round-trip, lower bound.
    #[serde(default = "default_min_latency_ms")]
    pub min_latency_ms: u64,
    /// Simulated exchange round-trip, upper bound.
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    /// Upper bound for adverse fill slippage, in basis points.
    #[serde(default = "default_slippage_bps")]
    pub max_slippage_bps: f64,
    #[serde(default = "default_partial_fill_probability")]
    pub partial_fill_probability: f64,
    /// Fill ratio range when a partial fill is rolled.
    #[serde(default = "default_partial_fill_min_ratio")]
    pub partial_fill_min_ratio: f64,
    #[serde(default = "default_partial_fill_max_ratio")]
    pub partial_fill_max_ratio: f64,
}

fn default_min_latency_ms() -> u64 {
    50
}

fn default_max_latency_ms() -> u64 {
    200
}

fn default_slippage_bps() -> f64 {
    10.0
}

fn default_partial_fill_probability() -> f64 {
    0.1
}

fn default_partial_fill_min_ratio() -> f64 {
    0.5
}

fn default_partial_fill_max_ratio() -> f64 {
    0.95
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            min_latency_ms: default_min_latency_ms(),
            max_latency_ms: default_max_latency_ms(),
            max_slippage_bps: default_slippage_bps(),
            partial_fill_probability: default_partial_fill_probability(),
            partial_fill_min_ratio: default_partial_fill_min_ratio(),
            partial_fill_max_ratio: default_partial_fill_max_ratio(),
        }
    }
}

impl PaperConfig {
    /// Deterministic variant for tests: no sleep, no slippage, full fills.
    pub fn instant() -> Self {
        Self {
            min_latency_ms: 0,
            max_latency_ms: 0,
            max_slippage_bps: 0.0,
            partial_fill_probability: 0.0,
            partial_fill_min_ratio: 1.0,
            partial_fill_max_ratio: 1.0,
        }
    }
}

/// In-process simulated broker.
///
/// Fills every order after a randomized latency, with a small adverse price
/// move and an occasional partial fill, so paper runs exercise the same
/// bookkeeping paths as live ones.
pub struct PaperConnector {
    config: PaperConfig,
}

impl PaperConnector {
    pub fn new(config: PaperConfig) -> Self {
        Self { config }
    }
}

impl Default for PaperConnector {
    fn default() -> Self {
        Self::new(PaperConfig::default())
    }
}

#[async_trait]
impl BrokerConnector for PaperConnector {
    async fn create_order(
        &self,
        instruction: &OrderInstruction,
    ) -> std::result::Result<BrokerAck, BrokerError> {
        // Roll all randomness before the await; ThreadRng is not Send.
        let (latency_ms, slip_bps, fill_ratio) = {
            let mut rng = rand::thread_rng();
            let latency_ms = if self.config.max_latency_ms > self.config.min_latency_ms {
                rng.gen_range(self.config.min_latency_ms..=self.config.max_latency_ms)
            } else {
                self.config.min_latency_ms
            };
            let slip_bps = if self.config.max_slippage_bps > 0.0 {
                rng.gen_range(0.0..self.config.max_slippage_bps)
            } else {
                0.0
            };
            let fill_ratio = if self.config.partial_fill_probability > 0.0
                && rng.gen_bool(self.config.partial_fill_probability.clamp(0.0, 1.0))
            {
                rng.gen_range(
                    self.config.partial_fill_min_ratio..=self.config.partial_fill_max_ratio,
                )
            } else {
                1.0
            };
            (latency_ms, slip_bps, fill_ratio)
        };

        if latency_ms > 0 {
            sleep(Duration::from_millis(latency_ms)).await;
        }

        // Adverse move: buys fill above the reference price, sells below.
        let slip_fraction =
            Decimal::from_f64(slip_bps / 10_000.0).unwrap_or(Decimal::ZERO);
        let offset = instruction.price * slip_fraction;
        let fill_price = match instruction.side {
            OrderSide::Buy => instruction.price + offset,
            OrderSide::Sell => instruction.price - offset,
        };

        let ratio = Decimal::from_f64(fill_ratio).unwrap_or(Decimal::ONE);
        let filled_quantity = instruction.quantity * ratio;

        let ack = BrokerAck {
            broker_order_id: format!("paper-{}", Uuid::new_v4()),
            price: fill_price,
            filled_quantity,
        };
        debug!(
            symbol = %instruction.symbol,
            side = %instruction.side,
            fill_price = %ack.price,
            filled = %ack.filled_quantity,
            latency_ms,
            "paper fill"
        );
        Ok(ack)
    }
}
