// Order execution module: position tracking and exchange order flow
pub mod order_executor;
pub mod position_store;

pub use order_executor::{AdjustOutcome, ExecutorConfig, OrderExecutor};
pub use position_store::PositionStore;
