use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::percentile;
use crate::domain::OrderSide;

#[derive(Debug, Clone, Deserialize)]
pub struct SlippageConfig {
    /// Floor cost paid on any order, in basis points.
    #[serde(default = "default_base_bps")]
    pub base_bps: f64,
    /// Scales the square-root market impact term.
    #[serde(default = "default_volume_impact_factor")]
    pub volume_impact_factor: f64,
    /// Scales the volatility term (bps per volatility percent).
    #[serde(default = "default_volatility_factor")]
    pub volatility_factor: f64,
    /// Order-to-depth ratio past which depth pressure kicks in.
    #[serde(default = "default_depth_pressure_ratio")]
    pub depth_pressure_ratio: f64,
    /// Realized slippage above this is flagged, in basis points.
    #[serde(default = "default_alert_threshold_bps")]
    pub alert_threshold_bps: f64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_base_bps() -> f64 {
    5.0
}

fn default_volume_impact_factor() -> f64 {
    0.1
}

fn default_volatility_factor() -> f64 {
    0.5
}

fn default_depth_pressure_ratio() -> f64 {
    0.1
}

fn default_alert_threshold_bps() -> f64 {
    50.0
}

fn default_history_limit() -> usize {
    10_000
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self {
            base_bps: default_base_bps(),
            volume_impact_factor: default_volume_impact_factor(),
            volatility_factor: default_volatility_factor(),
            depth_pressure_ratio: default_depth_pressure_ratio(),
            alert_threshold_bps: default_alert_threshold_bps(),
            history_limit: default_history_limit(),
        }
    }
}

/// Market context for an estimate. All fields optional; missing data
/// simply drops the corresponding term.
#[derive(Debug, Clone, Default)]
pub struct MarketConditions {
    /// Average traded volume in the order's units.
    pub avg_volume: Option<Decimal>,
    /// Recent volatility, in percent.
    pub volatility_pct: Option<f64>,
    /// Visible book depth in the order's units.
    pub book_depth: Option<Decimal>,
}

/// Pre-trade slippage estimate
#[derive(Debug, Clone, Serialize)]
pub struct SlippageEstimate {
    /// Estimated cost, always non-negative.
    pub bps: f64,
    /// Signed price offset: positive for buys, negative for sells.
    pub price_offset: Decimal,
    /// Request price adjusted by the offset.
    pub expected_fill_price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlippageRecord {
    pub timestamp: DateTime<Utc>,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub expected_price: Decimal,
    pub actual_price: Decimal,
    /// Adverse slippage is positive, price improvement negative.
    pub bps: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolSlippage {
    pub count: u64,
    pub avg_bps: f64,
    pub max_bps: f64,
    pub flagged: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlippageStats {
    pub count: u64,
    pub avg_bps: f64,
    pub p95_bps: f64,
    pub max_bps: f64,
    pub flagged: u64,
    pub by_symbol: HashMap<String, SymbolSlippage>,
}

#[derive(Default)]
struct SlippageBook {
    records: VecDeque<SlippageRecord>,
    sums: HashMap<String, SymbolAccumulator>,
    total_count: u64,
    total_sum_bps: f64,
    total_max_bps: f64,
    flagged: u64,
}

#[derive(Default)]
struct SymbolAccumulator {
    count: u64,
    sum_bps: f64,
    max_bps: f64,
    flagged: u64,
}

/// Transaction cost model: estimates expected slippage before submission
/// and aggregates realized slippage afterwards.
///
/// Estimated bps = base + impact + volatility term, where impact grows with
/// the square root of the order's participation in average volume; orders
/// above `depth_pressure_ratio` of visible depth scale the whole estimate
/// by (1 + order/depth).
pub struct SlippageModel {
    config: SlippageConfig,
    book: RwLock<SlippageBook>,
}

impl SlippageModel {
    pub fn new(config: SlippageConfig) -> Self {
        Self {
            config,
            book: RwLock::new(SlippageBook::default()),
        }
    }

    /// Pure estimate; never blocks an order.
    pub fn estimate(
        &self,
        price: Decimal,
        side: OrderSide,
        quantity: Decimal,
        market: &MarketConditions,
    ) -> SlippageEstimate {
        let mut bps = self.config.base_bps;

        if let Some(avg_volume) = market.avg_volume.filter(|v| *v > Decimal::ZERO) {
            let participation = (quantity / avg_volume).to_f64().unwrap_or(0.0).max(0.0);
            bps += self.config.volume_impact_factor * participation.sqrt() * 100.0;
        }

        if let Some(volatility_pct) = market.volatility_pct.filter(|v| *v > 0.0) {
            bps += self.config.volatility_factor * volatility_pct;
        }

        if let Some(depth) = market.book_depth.filter(|d| *d > Decimal::ZERO) {
            let pressure = (quantity / depth).to_f64().unwrap_or(0.0);
            if pressure > self.config.depth_pressure_ratio {
                bps *= 1.0 + pressure;
            }
        }

        let magnitude = price * Decimal::from_f64(bps / 10_000.0).unwrap_or(Decimal::ZERO);
        let price_offset = match side {
            OrderSide::Buy => magnitude,
            OrderSide::Sell => -magnitude,
        };
        SlippageEstimate {
            bps,
            price_offset,
            expected_fill_price: price + price_offset,
        }
    }

    /// Record a realized fill against its expected price. Returns the
    /// adverse-positive slippage in bps.
    pub async fn record_actual(
        &self,
        order_id: &str,
        symbol: &str,
        side: OrderSide,
        expected_price: Decimal,
        actual_price: Decimal,
    ) -> Option<f64> {
        if expected_price <= Decimal::ZERO {
            return None;
        }
        let raw = ((actual_price - expected_price) / expected_price * Decimal::from(10_000))
            .to_f64()
            .unwrap_or(0.0);
        // For sells a lower fill is the adverse direction.
        let bps = match side {
            OrderSide::Buy => raw,
            OrderSide::Sell => -raw,
        };
        let flagged = bps > self.config.alert_threshold_bps;

        let record = SlippageRecord {
            timestamp: Utc::now(),
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            expected_price,
            actual_price,
            bps,
        };

        let mut book = self.book.write().await;
        book.records.push_back(record);
        while book.records.len() > self.config.history_limit {
            book.records.pop_front();
        }
        book.total_count += 1;
        book.total_sum_bps += bps;
        if bps > book.total_max_bps {
            book.total_max_bps = bps;
        }
        let acc = book.sums.entry(symbol.to_string()).or_default();
        acc.count += 1;
        acc.sum_bps += bps;
        if bps > acc.max_bps {
            acc.max_bps = bps;
        }
        if flagged {
            acc.flagged += 1;
            book.flagged += 1;
            warn!(
                order_id,
                symbol,
                bps,
                threshold = self.config.alert_threshold_bps,
                "excessive slippage"
            );
        } else {
            debug!(order_id, symbol, bps, "slippage recorded");
        }
        Some(bps)
    }

    pub async fn stats(&self) -> SlippageStats {
        let book = self.book.read().await;
        let mut samples: Vec<f64> = book.records.iter().map(|r| r.bps).collect();
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let by_symbol = book
            .sums
            .iter()
            .map(|(symbol, acc)| {
                (
                    symbol.clone(),
                    SymbolSlippage {
                        count: acc.count,
                        avg_bps: if acc.count > 0 {
                            acc.sum_bps / acc.count as f64
                        } else {
                            0.0
                        },
                        max_bps: acc.max_bps,
                        flagged: acc.flagged,
                    },
                )
            })
            .collect();
        SlippageStats {
            count: book.total_count,
            avg_bps: if book.total_count > 0 {
                book.total_sum_bps / book.total_count as f64
            } else {
                0.0
            },
            p95_bps: percentile(&samples, 95.0),
            max_bps: book.total_max_bps,
            flagged: book.flagged,
            by_symbol,
        }
    }

    pub async fn symbol_stats(&self, symbol: &str) -> Option<SymbolSlippage> {
        let book = self.book.read().await;
        book.sums.get(symbol).map(|acc| SymbolSlippage {
            count: acc.count,
            avg_bps: if acc.count > 0 {
                acc.sum_bps / acc.count as f64
            } else {
                0.0
            },
            max_bps: acc.max_bps,
            flagged: acc.flagged,
        })
    }
}

impl Default for SlippageModel {
    fn default() -> Self {
        Self::new(SlippageConfig::default())
    }
}
