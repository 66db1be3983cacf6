use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderSide;

/// Open position as the risk gates see it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl PositionSnapshot {
    pub fn new(symbol: impl Into<String>, side: OrderSide, quantity: Decimal, entry_price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            entry_price,
            updated_at: Utc::now(),
        }
    }

    /// Notional value at entry.
    pub fn value(&self) -> Decimal {
        self.entry_price * self.quantity
    }
}
