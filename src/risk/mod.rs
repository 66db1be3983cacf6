pub mod circuit_breaker;
pub mod drawdown;
pub mod pretrade;
pub mod sizing;

pub use circuit_breaker::*;
pub use drawdown::*;
pub use pretrade::*;
pub use sizing::*;
