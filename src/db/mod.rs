// Durable storage: strategy configs (restart recovery) and closed trades.
pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresPersistence;

use async_trait::async_trait;

use crate::models::{StrategyConfig, Trade};
use crate::Result;

/// Durable store of strategy configs keyed by symbol.
///
/// `save_config` must commit before a start request is acknowledged: a
/// crash between accept and ack must never lose the config.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn save_config(&self, config: &StrategyConfig) -> Result<()>;

    /// Returns whether a row existed.
    async fn delete_config(&self, symbol: &str) -> Result<bool>;

    /// All configs with status=running, for startup restore.
    async fn load_running(&self) -> Result<Vec<StrategyConfig>>;
}

/// Append-only sink for closed trades.
#[async_trait]
pub trait TradeSink: Send + Sync {
    async fn append_trade(&self, trade: &Trade) -> Result<()>;
}
