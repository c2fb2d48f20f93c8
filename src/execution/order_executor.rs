use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::api::{ExchangeApi, OrderRequest, OrderResult, OrderSide, OrderType, PositionSide};
use crate::dashboard::{emit, BotEvent, EventSender};
use crate::execution::PositionStore;
use crate::models::{Position, Side, Trade};
use crate::risk::RiskLimits;
use crate::{BotError, Result};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Taker fee rate applied to every market fill.
    pub taker_fee_rate: f64,
    /// Attempts per exchange call for `Transient` failures.
    pub max_retries: u32,
    /// Base backoff, doubled per attempt.
    pub retry_backoff_ms: u64,
    pub limits: RiskLimits,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            taker_fee_rate: 0.0005,
            max_retries: 3,
            retry_backoff_ms: 500,
            limits: RiskLimits::default(),
        }
    }
}

/// Result of an `adjust` call. A position that disappeared between request
/// and execution is a no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOutcome {
    Adjusted,
    NotFound,
}

/// Turns actions into exchange order calls and owns fee accounting.
///
/// Entry plus the two protective legs are three independent calls, not a
/// transaction: once the entry fills, a failed protective leg is logged as
/// a warning and the position stays tracked (partially unprotected) until
/// `adjust` re-arms it.
pub struct OrderExecutor {
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<PositionStore>,
    events: EventSender,
    config: ExecutorConfig,
    total_fees: Mutex<f64>,
}

fn entry_order_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Buy,
        Side::Short => OrderSide::Sell,
    }
}

fn exit_order_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Sell,
        Side::Short => OrderSide::Buy,
    }
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<PositionStore>,
        events: EventSender,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            events,
            config,
            total_fees: Mutex::new(0.0),
        }
    }

    /// Place an order, retrying `Transient` failures with exponential
    /// backoff. Rejections surface immediately.
    async fn place_with_retry(&self, request: &OrderRequest) -> Result<OrderResult> {
        let mut attempt = 1;
        loop {
            match self.exchange.create_order(request).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let backoff = Duration::from_millis(
                        self.config.retry_backoff_ms * (1u64 << (attempt - 1)),
                    );
                    tracing::warn!(
                        symbol = %request.symbol,
                        attempt,
                        max = self.config.max_retries,
                        "Transient order failure: {}, retrying in {:?}",
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn add_fee(&self, fee: f64) {
        *self.total_fees.lock().expect("fee total poisoned") += fee;
    }

    /// Running total of fees paid through this executor.
    pub fn total_fees(&self) -> f64 {
        *self.total_fees.lock().expect("fee total poisoned")
    }

    /// Place one protective leg; a failure is a warning, never fatal.
    async fn place_protective_leg(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        size: f64,
        trigger: f64,
    ) -> Option<String> {
        let request = OrderRequest::protective(
            symbol,
            exit_order_side(side),
            order_type,
            size,
            PositionSide::from(side),
            trigger,
        );

        match self.place_with_retry(&request).await {
            Ok(result) => Some(result.order_id),
            Err(e) => {
                tracing::warn!(
                    symbol,
                    order_type = order_type.as_str(),
                    trigger,
                    "Protective leg failed, position stays unprotected on this side: {}",
                    e
                );
                None
            }
        }
    }

    /// Open a position: market entry first, then the stop and take-profit
    /// legs as independent reduce-only orders.
    pub async fn open(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        price_hint: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<Position> {
        if self.store.contains(symbol) {
            return Err(BotError::ExchangeRejected(format!(
                "position already open for {symbol}"
            )));
        }

        if let Err(violation) = self.config.limits.check_order(size * price_hint) {
            return Err(BotError::ExchangeRejected(format!(
                "risk limit violated: {violation:?}"
            )));
        }

        let entry_request =
            OrderRequest::market(symbol, entry_order_side(side), size, PositionSide::from(side));
        let entry = self.place_with_retry(&entry_request).await?;

        let entry_price = if entry.avg_price > 0.0 {
            entry.avg_price
        } else {
            price_hint
        };
        let entry_fee = entry_price * size * self.config.taker_fee_rate;
        self.add_fee(entry_fee);

        tracing::info!(
            symbol,
            side = side.as_str(),
            size,
            entry_price,
            stop_loss,
            take_profit,
            "Entry filled"
        );

        let position = Position {
            symbol: symbol.to_string(),
            side,
            entry_price,
            size,
            stop_loss,
            take_profit,
            opened_at: Utc::now(),
            unrealized_pnl: 0.0,
            stop_order_id: None,
            take_profit_order_id: None,
            adopted_from_exchange: false,
        };

        // Track before arming the legs: the entry already exists on the
        // exchange, so local state must reflect it even if a leg fails.
        // Per-symbol runner serialization makes a duplicate here unreachable.
        self.store.insert(position.clone())?;

        let stop_order_id = self
            .place_protective_leg(symbol, side, OrderType::StopMarket, size, stop_loss)
            .await;
        let take_profit_order_id = self
            .place_protective_leg(symbol, side, OrderType::TakeProfitMarket, size, take_profit)
            .await;

        self.store.update(symbol, |p| {
            p.stop_order_id = stop_order_id.clone();
            p.take_profit_order_id = take_profit_order_id.clone();
        })?;

        self.store
            .get(symbol)
            .ok_or_else(|| BotError::NotFound(format!("no position for {symbol}")))
    }

    /// Cancel whatever protective orders the position still has resting.
    async fn cancel_protective_orders(&self, position: &Position) {
        for order_id in [&position.stop_order_id, &position.take_profit_order_id]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.exchange.cancel_order(order_id, &position.symbol).await {
                tracing::warn!(
                    symbol = %position.symbol,
                    order_id,
                    "Failed to cancel protective order (may already be gone): {}",
                    e
                );
            }
        }
    }

    fn build_trade(
        &self,
        position: &Position,
        size: f64,
        exit_price: f64,
        reason: &str,
    ) -> Trade {
        let entry_fee = position.entry_price * size * self.config.taker_fee_rate;
        let exit_fee = exit_price * size * self.config.taker_fee_rate;
        let gross = (exit_price - position.entry_price) * size * position.side.sign();
        let pnl = gross - (entry_fee + exit_fee);
        let notional = position.entry_price * size;

        Trade {
            id: Uuid::new_v4(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size,
            pnl,
            pnl_pct: if notional > 0.0 {
                pnl / notional * 100.0
            } else {
                0.0
            },
            fees: entry_fee + exit_fee,
            reason: reason.to_string(),
            entry_time: position.opened_at,
            exit_time: Utc::now(),
        }
    }

    /// Close the full position with a reduce-only opposite market order.
    pub async fn close(&self, symbol: &str, price_hint: f64, reason: &str) -> Result<Trade> {
        let position = self
            .store
            .get(symbol)
            .ok_or_else(|| BotError::NotFound(format!("no position for {symbol}")))?;

        self.cancel_protective_orders(&position).await;

        let request = OrderRequest::reduce_market(
            symbol,
            exit_order_side(position.side),
            position.size,
            PositionSide::from(position.side),
        );
        let result = self.place_with_retry(&request).await?;

        let exit_price = if result.avg_price > 0.0 {
            result.avg_price
        } else {
            price_hint
        };
        let exit_fee = exit_price * position.size * self.config.taker_fee_rate;
        self.add_fee(exit_fee);

        self.store.remove(symbol);

        let trade = self.build_trade(&position, position.size, exit_price, reason);
        tracing::info!(
            symbol,
            reason,
            pnl = trade.pnl,
            exit_price,
            "Position closed"
        );
        emit(&self.events, BotEvent::TradeClosed(trade.clone()));

        Ok(trade)
    }

    /// Shrink the position by `size`, realizing PnL on the slice.
    ///
    /// The resting protective orders keep their prior size; being
    /// reduce-only they can never flip the position, and `adjust` re-arms
    /// them at the remaining size.
    pub async fn reduce(
        &self,
        symbol: &str,
        size: f64,
        price_hint: f64,
        reason: &str,
    ) -> Result<Trade> {
        let position = self
            .store
            .get(symbol)
            .ok_or_else(|| BotError::NotFound(format!("no position for {symbol}")))?;

        if size >= position.size {
            return self.close(symbol, price_hint, reason).await;
        }

        let request = OrderRequest::reduce_market(
            symbol,
            exit_order_side(position.side),
            size,
            PositionSide::from(position.side),
        );
        let result = self.place_with_retry(&request).await?;

        let exit_price = if result.avg_price > 0.0 {
            result.avg_price
        } else {
            price_hint
        };
        let exit_fee = exit_price * size * self.config.taker_fee_rate;
        self.add_fee(exit_fee);

        self.store.update(symbol, |p| {
            p.size -= size;
        })?;

        let trade = self.build_trade(&position, size, exit_price, reason);
        tracing::info!(symbol, reason, size, pnl = trade.pnl, "Position reduced");
        emit(&self.events, BotEvent::TradeClosed(trade.clone()));

        Ok(trade)
    }

    /// Re-arm the protective legs at new prices.
    pub async fn adjust(
        &self,
        symbol: &str,
        new_stop_loss: f64,
        new_take_profit: f64,
    ) -> Result<AdjustOutcome> {
        // The position may have closed between request and execution
        let position = match self.store.get(symbol) {
            Some(position) => position,
            None => return Ok(AdjustOutcome::NotFound),
        };

        self.cancel_protective_orders(&position).await;

        let stop_order_id = self
            .place_protective_leg(
                symbol,
                position.side,
                OrderType::StopMarket,
                position.size,
                new_stop_loss,
            )
            .await;
        let take_profit_order_id = self
            .place_protective_leg(
                symbol,
                position.side,
                OrderType::TakeProfitMarket,
                position.size,
                new_take_profit,
            )
            .await;

        self.store.update(symbol, |p| {
            p.stop_loss = new_stop_loss;
            p.take_profit = new_take_profit;
            p.stop_order_id = stop_order_id.clone();
            p.take_profit_order_id = take_profit_order_id.clone();
        })?;

        Ok(AdjustOutcome::Adjusted)
    }
}
