use serde::Deserialize;

use super::{DecisionContext, DecisionFunction};
use crate::indicators::calculate_bollinger;
use crate::models::{Action, Side};

/// Bollinger-band range trading rule.
///
/// Detects a sideways market by its band envelope: buys touches of the
/// lower band, shorts touches of the upper band, and closes either side
/// once price reverts to the middle band.
#[derive(Debug, Clone)]
pub struct RangeMode {
    config: RangeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    pub band_period: usize,
    pub band_stddev: f64,
    /// Bands narrower than this percent of the middle indicate no usable
    /// range; entries are suppressed.
    pub min_band_width_pct: f64,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            band_period: 20,
            band_stddev: 2.0,
            min_band_width_pct: 0.2,
        }
    }
}

impl RangeMode {
    pub fn new(config: RangeConfig) -> Self {
        Self { config }
    }
}

impl DecisionFunction for RangeMode {
    fn decide(&self, ctx: &DecisionContext) -> Option<Action> {
        if ctx.candles.len() < self.min_candles() {
            return None;
        }

        let closes: Vec<f64> = ctx.candles.iter().map(|c| c.close).collect();
        let (middle, upper, lower) =
            calculate_bollinger(&closes, self.config.band_period, self.config.band_stddev)?;

        if let Some(position) = ctx.position {
            match position.side {
                Side::Long if ctx.price >= middle => {
                    return Some(Action::CloseLong {
                        price: ctx.price,
                        reason: "reverted_to_mean".to_string(),
                    });
                }
                Side::Short if ctx.price <= middle => {
                    return Some(Action::CloseShort {
                        price: ctx.price,
                        reason: "reverted_to_mean".to_string(),
                    });
                }
                _ => return None,
            }
        }

        let band_width_pct = (upper - lower) / middle * 100.0;
        tracing::debug!(
            symbol = ctx.symbol,
            middle,
            upper,
            lower,
            band_width_pct,
            "Range entry check"
        );

        // A flat envelope means no range worth trading
        if band_width_pct < self.config.min_band_width_pct {
            return None;
        }

        if ctx.price <= lower {
            return Some(Action::OpenLong {
                price: ctx.price,
                reason: "range_low".to_string(),
            });
        }
        if ctx.price >= upper {
            return Some(Action::OpenShort {
                price: ctx.price,
                reason: "range_high".to_string(),
            });
        }

        None
    }

    fn name(&self) -> &str {
        "range"
    }

    fn min_candles(&self) -> usize {
        self.config.band_period
    }
}
