use serde::Deserialize;

use super::{DecisionContext, DecisionFunction};
use crate::models::Action;

/// Bear-market crash-buying rule.
///
/// Watches percentage moves over three nested windows and buys capitulation
/// candles. With pct15/pct30/pct60 the change from the 15/30/60-minute-ago
/// closes to the current price, a long entry fires when either:
/// - all three windows show a deep, sustained slide
///   (pct15, pct30 and pct60 all under their thresholds), or
/// - a violent dip is visible anywhere in the hour (the most negative change
///   from the current price to any of the four preceding closes breaches
///   `max_drop_threshold`), in which case the 30-minute requirement relaxes
///   to `relaxed_pct30_threshold`.
///
/// The four most recent closes in the buffer are taken as the
/// 60/45/30/15-minute-ago marks, so the runner feeds 15-minute candles.
/// Exits are left to the structural TP/SL check.
#[derive(Debug, Clone)]
pub struct BearMode {
    config: BearConfig,
}

/// Thresholds are percentages, negative for drops. Heuristics without
/// statistical backing; tune per symbol via strategy params.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BearConfig {
    pub pct15_threshold: f64,
    pub pct30_threshold: f64,
    pub pct60_threshold: f64,
    /// Trigger for the relaxed branch: worst drop vs any preceding close.
    pub max_drop_threshold: f64,
    /// 30-minute requirement used when the max-drop trigger fired.
    pub relaxed_pct30_threshold: f64,
}

impl Default for BearConfig {
    fn default() -> Self {
        Self {
            pct15_threshold: -5.0,
            pct30_threshold: -10.0,
            pct60_threshold: -12.0,
            max_drop_threshold: -12.0,
            relaxed_pct30_threshold: -8.0,
        }
    }
}

impl BearMode {
    pub fn new(config: BearConfig) -> Self {
        Self { config }
    }
}

fn pct_change(from: f64, to: f64) -> f64 {
    (to - from) / from * 100.0
}

impl DecisionFunction for BearMode {
    fn decide(&self, ctx: &DecisionContext) -> Option<Action> {
        // Entry-only rule: an open position is managed by TP/SL
        if ctx.position.is_some() {
            return None;
        }
        if ctx.candles.len() < self.min_candles() {
            return None;
        }

        // Last four closes = 60/45/30/15 minutes ago, oldest first
        let closes: Vec<f64> = ctx.candles[ctx.candles.len() - 4..]
            .iter()
            .map(|c| c.close)
            .collect();

        let pct15 = pct_change(closes[3], ctx.price);
        let pct30 = pct_change(closes[2], ctx.price);
        let pct60 = pct_change(closes[0], ctx.price);

        let max_drop_60m = closes
            .iter()
            .map(|&c| pct_change(c, ctx.price))
            .fold(f64::INFINITY, f64::min);

        tracing::debug!(
            symbol = ctx.symbol,
            pct15,
            pct30,
            pct60,
            max_drop_60m,
            "Bear entry check"
        );

        let sustained = pct15 <= self.config.pct15_threshold
            && pct30 <= self.config.pct30_threshold
            && pct60 <= self.config.pct60_threshold;

        if sustained {
            return Some(Action::OpenLong {
                price: ctx.price,
                reason: "sustained_drop".to_string(),
            });
        }

        let extreme = max_drop_60m <= self.config.max_drop_threshold
            && pct15 <= self.config.pct15_threshold
            && pct30 <= self.config.relaxed_pct30_threshold;

        if extreme {
            return Some(Action::OpenLong {
                price: ctx.price,
                reason: "extreme_volatility".to_string(),
            });
        }

        None
    }

    fn name(&self) -> &str {
        "bear"
    }

    fn min_candles(&self) -> usize {
        4
    }
}
