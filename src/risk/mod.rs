// Risk management module
use serde::{Deserialize, Serialize};

/// Hard limits applied before any order leaves the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Maximum notional (quote currency) a single order may carry.
    pub max_order_notional: f64,
    /// Cap on simultaneously running per-symbol strategies.
    pub max_concurrent_strategies: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_order_notional: 1000.0, // Conservative default per order
            max_concurrent_strategies: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskViolation {
    OrderNotional { notional: f64, limit: f64 },
    StrategyCount { active: usize, limit: usize },
}

impl RiskLimits {
    /// Check an order's notional against the per-order cap.
    pub fn check_order(&self, notional: f64) -> Result<(), RiskViolation> {
        if notional > self.max_order_notional {
            return Err(RiskViolation::OrderNotional {
                notional,
                limit: self.max_order_notional,
            });
        }
        Ok(())
    }

    /// Check whether another strategy may start.
    pub fn check_strategy_count(&self, active: usize) -> Result<(), RiskViolation> {
        if active >= self.max_concurrent_strategies {
            return Err(RiskViolation::StrategyCount {
                active,
                limit: self.max_concurrent_strategies,
            });
        }
        Ok(())
    }
}
