// Strategy runners: one cancellable task per active symbol, plus the
// manager that owns their lifecycle and the persisted config set.
pub mod manager;
pub mod strategy_runner;

pub use manager::{ActiveStrategy, StartOutcome, StopOutcome, StrategyManager};
pub use strategy_runner::RunnerParams;
