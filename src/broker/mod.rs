pub mod paper;

pub use paper::{PaperConfig, PaperConnector};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{OrderKind, OrderSide};
use crate::error::BrokerError;

/// What a connector needs to place one order.
///
/// Deliberately smaller than `OrderRequest`: routing fields (broker name,
/// metadata) and risk bookkeeping never cross the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInstruction {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Decimal,
}

/// Broker acknowledgement for a placed order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAck {
    pub broker_order_id: String,
    pub price: Decimal,
    pub filled_quantity: Decimal,
}

/// Venue adapter. One implementation per broker; the router talks to
/// nothing below this trait.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn create_order(
        &self,
        instruction: &OrderInstruction,
    ) -> std::result::Result<BrokerAck, BrokerError>;
}
