use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::risk::PreTradeDecision;

/// Broker name that always resolves to the in-process simulated path.
pub const PAPER_BROKER: &str = "paper";

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Market,
    Limit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Market => write!(f, "MARKET"),
            OrderKind::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Order created but not yet past the risk gates
    Pending,
    /// Order handed to a broker (or the simulated path)
    Submitted,
    /// Order partially filled
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Order cancelled before completion
    Cancelled,
    /// Order rejected by a risk gate
    Rejected,
    /// Order failed during execution
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }
}

/// Which execution path actually handled the order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionPath {
    Simulated,
    Live,
}

impl std::fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionPath::Simulated => write!(f, "SIMULATED"),
            ExecutionPath::Live => write!(f, "LIVE"),
        }
    }
}

/// Order request (what the caller wants to do).
///
/// `price` is the limit price for limit orders and the reference price for
/// market orders; the pipeline needs it for fingerprinting, notional checks
/// and simulated fills either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Decimal,
    pub broker: String,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    /// Requested leverage, if the caller trades on margin.
    #[serde(default)]
    pub leverage: Option<f64>,
    /// Account balance at decision time, for risk checks.
    #[serde(default)]
    pub balance: Decimal,
    /// Which strategy or signal produced this order.
    #[serde(default)]
    pub signal_source: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal, reference_price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: OrderKind::Market,
            quantity,
            price: reference_price,
            broker: PAPER_BROKER.to_string(),
            stop_loss: None,
            take_profit: None,
            leverage: None,
            balance: Decimal::ZERO,
            signal_source: None,
            metadata: HashMap::new(),
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: OrderKind::Limit,
            quantity,
            price,
            broker: PAPER_BROKER.to_string(),
            stop_loss: None,
            take_profit: None,
            leverage: None,
            balance: Decimal::ZERO,
            signal_source: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = broker.into();
        self
    }

    pub fn with_stops(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_leverage(mut self, leverage: f64) -> Self {
        self.leverage = Some(leverage);
        self
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = balance;
        self
    }

    pub fn with_signal_source(mut self, source: impl Into<String>) -> Self {
        self.signal_source = Some(source.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Notional value at the request price.
    pub fn value(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// Order ticket (tracked through the pipeline and kept for audit)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub id: String,
    pub broker_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub broker: String,
    /// Quantity as requested, before drawdown scaling.
    pub requested_quantity: Decimal,
    /// Working quantity after scaling and pre-trade adjustment.
    pub quantity: Decimal,
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub leverage: Option<f64>,
    pub signal_source: Option<String>,
    pub status: OrderStatus,
    pub path: Option<ExecutionPath>,
    pub fill_price: Option<Decimal>,
    pub filled_quantity: Decimal,
    /// Pre-trade slippage estimate, in basis points.
    pub estimated_slippage_bps: Option<f64>,
    /// Realized slippage versus the request price, in basis points.
    pub slippage_bps: Option<f64>,
    /// Wall-clock time spent in the execution stage.
    pub latency_ms: Option<u64>,
    pub retry_count: u32,
    pub fingerprint: Option<String>,
    pub rejection_reason: Option<String>,
    pub error: Option<String>,
    pub pre_trade: Option<PreTradeDecision>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OrderTicket {
    pub fn from_request(request: &OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            broker_order_id: None,
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            broker: request.broker.clone(),
            requested_quantity: request.quantity,
            quantity: request.quantity,
            price: request.price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            leverage: request.leverage,
            signal_source: request.signal_source.clone(),
            status: OrderStatus::Pending,
            path: None,
            fill_price: None,
            filled_quantity: Decimal::ZERO,
            estimated_slippage_bps: None,
            slippage_bps: None,
            latency_ms: None,
            retry_count: 0,
            fingerprint: None,
            rejection_reason: None,
            error: None,
            pre_trade: None,
            created_at: now,
            submitted_at: None,
            completed_at: None,
            updated_at: now,
            metadata: request.metadata.clone(),
        }
    }

    /// Notional value of the working quantity.
    pub fn value(&self) -> Decimal {
        self.price * self.quantity
    }

    /// Fill percentage of the working quantity.
    pub fn fill_pct(&self) -> Decimal {
        if self.quantity.is_zero() {
            return Decimal::ZERO;
        }
        self.filled_quantity / self.quantity * Decimal::from(100)
    }

    /// Apply a position-size multiplier from the drawdown protector.
    pub fn scale_quantity(&mut self, multiplier: Decimal) {
        self.quantity = self.requested_quantity * multiplier;
        self.touch();
    }

    pub fn mark_submitted(&mut self, path: ExecutionPath) -> bool {
        if !self.transition(OrderStatus::Submitted) {
            return false;
        }
        self.path = Some(path);
        self.submitted_at = Some(Utc::now());
        true
    }

    /// Record the broker acknowledgement. Fills below the working quantity
    /// land as `PartiallyFilled`, the rest as `Filled`.
    pub fn mark_filled(
        &mut self,
        broker_order_id: Option<String>,
        fill_price: Decimal,
        filled_quantity: Decimal,
    ) -> bool {
        let status = if filled_quantity < self.quantity {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Filled
        };
        if !self.transition(status) {
            return false;
        }
        self.broker_order_id = broker_order_id;
        self.fill_price = Some(fill_price);
        self.filled_quantity = filled_quantity;
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn mark_rejected(&mut self, reason: impl Into<String>) -> bool {
        if !self.transition(OrderStatus::Rejected) {
            return false;
        }
        self.rejection_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(OrderStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn mark_cancelled(&mut self) -> bool {
        if !self.transition(OrderStatus::Cancelled) {
            return false;
        }
        self.completed_at = Some(Utc::now());
        true
    }

    /// Status transitions are monotonic: once terminal, a ticket never
    /// changes again. `PartiallyFilled` may still settle to `Filled`.
    fn transition(&mut self, next: OrderStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.status == OrderStatus::PartiallyFilled && next == OrderStatus::Submitted {
            return false;
        }
        self.status = next;
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
