use serde::Deserialize;

use super::{DecisionContext, DecisionFunction};
use crate::indicators::calculate_sma;
use crate::models::{Action, Side};

/// Trend-following rule for rising markets.
///
/// Enters long when price extends above its SMA by a configurable
/// deviation, and emits a close once price falls back under the SMA while
/// the long is open. TP/SL still guards the position independently.
#[derive(Debug, Clone)]
pub struct BullMode {
    config: BullConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BullConfig {
    pub sma_period: usize,
    /// Percent above the SMA the price must extend before entering.
    pub entry_deviation_pct: f64,
}

impl Default for BullConfig {
    fn default() -> Self {
        Self {
            sma_period: 20,
            entry_deviation_pct: 1.5,
        }
    }
}

impl BullMode {
    pub fn new(config: BullConfig) -> Self {
        Self { config }
    }
}

impl DecisionFunction for BullMode {
    fn decide(&self, ctx: &DecisionContext) -> Option<Action> {
        if ctx.candles.len() < self.min_candles() {
            return None;
        }

        let closes: Vec<f64> = ctx.candles.iter().map(|c| c.close).collect();
        let sma = calculate_sma(&closes, self.config.sma_period)?;

        if let Some(position) = ctx.position {
            // Exit the long when the trend gives way
            if position.side == Side::Long && ctx.price < sma {
                return Some(Action::CloseLong {
                    price: ctx.price,
                    reason: "trend_exhausted".to_string(),
                });
            }
            return None;
        }

        let deviation_pct = (ctx.price - sma) / sma * 100.0;
        tracing::debug!(symbol = ctx.symbol, sma, deviation_pct, "Bull entry check");

        if deviation_pct >= self.config.entry_deviation_pct {
            return Some(Action::OpenLong {
                price: ctx.price,
                reason: "trend_breakout".to_string(),
            });
        }

        None
    }

    fn name(&self) -> &str {
        "bull"
    }

    fn min_candles(&self) -> usize {
        self.config.sma_period
    }
}
