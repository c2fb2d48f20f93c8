use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ConfigStore, TradeSink};
use crate::models::{StrategyConfig, StrategyStatus, Trade};
use crate::Result;

/// In-memory store implementing the persistence seams.
///
/// Not durable across processes; used by tests and dry runs to exercise the
/// exact start/stop/restore flow without a database.
#[derive(Default)]
pub struct MemoryStore {
    configs: Mutex<HashMap<String, StrategyConfig>>,
    trades: Mutex<Vec<Trade>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.trades.lock().expect("trade log poisoned").clone()
    }

    pub fn config_count(&self) -> usize {
        self.configs.lock().expect("config map poisoned").len()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn save_config(&self, config: &StrategyConfig) -> Result<()> {
        self.configs
            .lock()
            .expect("config map poisoned")
            .insert(config.symbol.clone(), config.clone());
        Ok(())
    }

    async fn delete_config(&self, symbol: &str) -> Result<bool> {
        Ok(self
            .configs
            .lock()
            .expect("config map poisoned")
            .remove(symbol)
            .is_some())
    }

    async fn load_running(&self) -> Result<Vec<StrategyConfig>> {
        let mut configs: Vec<StrategyConfig> = self
            .configs
            .lock()
            .expect("config map poisoned")
            .values()
            .filter(|c| c.status == StrategyStatus::Running)
            .cloned()
            .collect();
        configs.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(configs)
    }
}

#[async_trait]
impl TradeSink for MemoryStore {
    async fn append_trade(&self, trade: &Trade) -> Result<()> {
        self.trades
            .lock()
            .expect("trade log poisoned")
            .push(trade.clone());
        Ok(())
    }
}
