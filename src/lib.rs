pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod execution;
pub mod mode;
pub mod risk;

pub use broker::{BrokerAck, BrokerConnector, OrderInstruction, PaperConfig, PaperConnector};
pub use config::PipelineConfig;
pub use domain::{
    ExecutionPath, OrderKind, OrderRequest, OrderSide, OrderStatus, OrderTicket, PositionSnapshot,
    PAPER_BROKER,
};
pub use error::{ArmError, BreakerError, BreakwaterError, BrokerError, Result, Transient};
pub use execution::{
    DedupStats, DuplicateGuard, DuplicateReason, ExecutionStats, LatencyStats, LatencyTracker,
    OrderCallback, OrderRouter, RetryEngine, RetryFailure, RetryOutcome, RetryPolicy,
    SlippageEstimate, SlippageModel, SlippageStats,
};
pub use mode::{ModeConfig, ModeController, ModeStatus, TradingMode};
pub use risk::{
    BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitState, DrawdownProtector,
    DrawdownSeverity, DrawdownState, EmergencyActions, PositionSizer, PreTradeCheck,
    PreTradeDecision, PreTradeInputs, SizingMethod, StandardPreTradeCheck, TripEvent, TripReason,
};
