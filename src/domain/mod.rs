pub mod order;
pub mod position;

pub use order::*;
pub use position::*;
