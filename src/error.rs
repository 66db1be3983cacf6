use thiserror::Error;

/// Main error type for the execution pipeline
#[derive(Error, Debug)]
pub enum BreakwaterError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Broker/connector errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    // Circuit breaker administration errors
    #[error("Circuit breaker error: {0}")]
    Breaker(#[from] BreakerError),

    // Live-arming errors
    #[error("Arming refused: {0}")]
    Arm(#[from] ArmError),

    // Order lifecycle errors
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for BreakwaterError
pub type Result<T> = std::result::Result<T, BreakwaterError>;

/// Classification hook for retry decisions.
///
/// Implemented by error types whose values can tell a transient fault
/// (worth retrying) from a fatal one (fail fast).
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Wire-level failures reported by broker connectors.
///
/// Connectors map their transport errors into these variants; the retry
/// engine keys off the variant, never off message text.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("Timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Exchange unavailable: {0}")]
    Unavailable(String),

    #[error("Order rejected by broker: {0}")]
    Rejected(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Authentication error: {0}")]
    Auth(String),
}

impl BrokerError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout { .. }
                | BrokerError::Connection(_)
                | BrokerError::RateLimited(_)
                | BrokerError::Unavailable(_)
        )
    }
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        BrokerError::is_transient(self)
    }
}

/// Refusals from circuit breaker administration calls
#[derive(Error, Debug, Clone)]
pub enum BreakerError {
    #[error("Breaker is locked ({reason}); unlock with the admin token")]
    Locked { reason: String },

    #[error("Invalid unlock token")]
    InvalidUnlockToken,
}

/// Refusals from the mode controller when arming live trading
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArmError {
    #[error("Confirmation key mismatch")]
    ConfirmationMismatch,

    #[error("Paper seasoning incomplete: {elapsed_days} of {required_days} days")]
    PaperSeasoningIncomplete {
        elapsed_days: i64,
        required_days: i64,
    },

    #[error("Walk-forward validation has not passed")]
    WalkForwardNotValidated,

    #[error("Circuit breaker is not ready for live trading")]
    CircuitBreakerNotReady,
}
