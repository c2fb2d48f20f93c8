use serde::Deserialize;

use super::{DecisionContext, DecisionFunction};
use crate::indicators::calculate_rsi;
use crate::models::{Action, Side};

/// Short-horizon momentum scalping rule.
///
/// Enters long on a burst: price up at least `entry_move_pct` versus the
/// close `lookback` candles ago, with an RSI guard so entries never chase a
/// move that is already overextended. Closes when the burst fades (price
/// back under the previous close). Profits are normally captured by the
/// tight TP the runner arms.
#[derive(Debug, Clone)]
pub struct ScalpMode {
    config: ScalpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScalpConfig {
    /// Candles back the burst is measured against.
    pub lookback: usize,
    /// Minimum percent move to enter.
    pub entry_move_pct: f64,
    pub rsi_period: usize,
    /// No entries once RSI is at or above this level.
    pub rsi_overbought: f64,
}

impl Default for ScalpConfig {
    fn default() -> Self {
        Self {
            lookback: 3,
            entry_move_pct: 0.4,
            rsi_period: 14,
            rsi_overbought: 70.0,
        }
    }
}

impl ScalpMode {
    pub fn new(config: ScalpConfig) -> Self {
        Self { config }
    }
}

impl DecisionFunction for ScalpMode {
    fn decide(&self, ctx: &DecisionContext) -> Option<Action> {
        if ctx.candles.len() < self.min_candles() {
            return None;
        }

        let closes: Vec<f64> = ctx.candles.iter().map(|c| c.close).collect();
        let last_close = *closes.last().expect("len checked above");

        if let Some(position) = ctx.position {
            if position.side == Side::Long && ctx.price < last_close {
                return Some(Action::CloseLong {
                    price: ctx.price,
                    reason: "momentum_faded".to_string(),
                });
            }
            return None;
        }

        let reference = closes[closes.len() - self.config.lookback.max(1)];
        let move_pct = (ctx.price - reference) / reference * 100.0;
        let rsi = calculate_rsi(&closes, self.config.rsi_period)?;

        tracing::debug!(symbol = ctx.symbol, move_pct, rsi, "Scalp entry check");

        if move_pct >= self.config.entry_move_pct && rsi < self.config.rsi_overbought {
            return Some(Action::OpenLong {
                price: ctx.price,
                reason: "momentum_burst".to_string(),
            });
        }

        None
    }

    fn name(&self) -> &str {
        "scalp"
    }

    fn min_candles(&self) -> usize {
        (self.config.rsi_period + 1).max(self.config.lookback.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testutil::{candles_from_closes, open_position};

    /// Choppy base series that keeps RSI well inside the band.
    fn base_closes() -> Vec<f64> {
        vec![
            100.0, 100.4, 100.1, 100.5, 100.2, 100.6, 100.3, 100.7, 100.4, 100.8, 100.5, 100.9,
            100.6, 101.0, 100.7,
        ]
    }

    #[test]
    fn test_entry_on_momentum_burst() {
        let mode = ScalpMode::new(ScalpConfig::default());
        let candles = candles_from_closes(&base_closes(), 1);

        // +0.9% vs three candles back (101.0... reference is closes[len-3] = 100.6)
        let action = mode
            .decide(&DecisionContext {
                symbol: "TESTUSDT",
                price: 101.5,
                candles: &candles,
                position: None,
            })
            .unwrap();

        assert_eq!(action.intent(), "open_long");
        assert_eq!(action.reason(), "momentum_burst");
    }

    #[test]
    fn test_no_entry_without_move() {
        let mode = ScalpMode::new(ScalpConfig::default());
        let candles = candles_from_closes(&base_closes(), 1);

        let action = mode.decide(&DecisionContext {
            symbol: "TESTUSDT",
            price: 100.65,
            candles: &candles,
            position: None,
        });

        assert!(action.is_none());
    }

    #[test]
    fn test_rsi_guard_blocks_overextended_entry() {
        let mode = ScalpMode::new(ScalpConfig::default());
        // Straight-up series: RSI = 100
        let closes: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        let candles = candles_from_closes(&closes, 1);

        let action = mode.decide(&DecisionContext {
            symbol: "TESTUSDT",
            price: 116.0,
            candles: &candles,
            position: None,
        });

        assert!(action.is_none());
    }

    #[test]
    fn test_close_when_momentum_fades() {
        let mode = ScalpMode::new(ScalpConfig::default());
        let candles = candles_from_closes(&base_closes(), 1);
        let position = open_position("TESTUSDT", Side::Long, 101.0);

        // Price dipped back under the last close (100.7)
        let action = mode
            .decide(&DecisionContext {
                symbol: "TESTUSDT",
                price: 100.5,
                candles: &candles,
                position: Some(&position),
            })
            .unwrap();

        assert_eq!(action.intent(), "close_long");
        assert_eq!(action.reason(), "momentum_faded");
    }

    #[test]
    fn test_holds_position_while_momentum_continues() {
        let mode = ScalpMode::new(ScalpConfig::default());
        let candles = candles_from_closes(&base_closes(), 1);
        let position = open_position("TESTUSDT", Side::Long, 101.0);

        let action = mode.decide(&DecisionContext {
            symbol: "TESTUSDT",
            price: 101.2,
            candles: &candles,
            position: Some(&position),
        });

        assert!(action.is_none());
    }

    #[test]
    fn test_insufficient_candles() {
        let mode = ScalpMode::new(ScalpConfig::default());
        let candles = candles_from_closes(&[100.0, 100.5], 1);

        let action = mode.decide(&DecisionContext {
            symbol: "TESTUSDT",
            price: 101.0,
            candles: &candles,
            position: None,
        });

        assert!(action.is_none());
    }
}
