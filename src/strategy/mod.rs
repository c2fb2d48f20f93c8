// Trading strategy module: one decision function per mode
pub mod bear;
pub mod bull;
pub mod range;
pub mod scalp;

use serde::de::DeserializeOwned;

use crate::models::{Action, Candle, Mode, Position};
use crate::{BotError, Result};

pub use bear::{BearConfig, BearMode};
pub use bull::{BullConfig, BullMode};
pub use range::{RangeConfig, RangeMode};
pub use scalp::{ScalpConfig, ScalpMode};

/// Market state handed to a decision function on each tick.
///
/// Candles are ordered oldest first; `price` is the freshest quote and may
/// be newer than the last candle close.
pub struct DecisionContext<'a> {
    pub symbol: &'a str,
    pub price: f64,
    pub candles: &'a [Candle],
    pub position: Option<&'a Position>,
}

/// Pure, mode-specific decision rule.
///
/// Implementations never do I/O and never read the clock; everything they
/// need arrives in the context. Returning `None` means no action this tick.
pub trait DecisionFunction: std::fmt::Debug + Send + Sync {
    fn decide(&self, ctx: &DecisionContext) -> Option<Action>;

    fn name(&self) -> &str;

    /// Minimum candles required before the rule can evaluate.
    fn min_candles(&self) -> usize;
}

/// Parse per-mode params from a StrategyConfig document.
///
/// `null` means all defaults; unknown fields are tolerated so one params
/// document can carry both mode and runner settings.
pub(crate) fn parse_params<T>(params: &serde_json::Value) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone())
        .map_err(|e| BotError::Config(format!("invalid strategy params: {e}")))
}

/// Build the decision function for a mode, selected once at runner
/// construction.
pub fn build_decision(mode: Mode, params: &serde_json::Value) -> Result<Box<dyn DecisionFunction>> {
    Ok(match mode {
        Mode::Bear => Box::new(BearMode::new(parse_params(params)?)),
        Mode::Bull => Box::new(BullMode::new(parse_params(params)?)),
        Mode::Scalp => Box::new(ScalpMode::new(parse_params(params)?)),
        Mode::Range => Box::new(RangeMode::new(parse_params(params)?)),
    })
}
