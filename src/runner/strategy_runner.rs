use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::api::MarketDataFeed;
use crate::dashboard::{emit, BotEvent, EventSender};
use crate::execution::{OrderExecutor, PositionStore};
use crate::models::{Action, Position, Side, Signal, SignalStatus};
use crate::strategy::{DecisionContext, DecisionFunction};
use crate::{BotError, Result};

/// Execution settings parsed from the strategy params document (alongside
/// the mode-specific fields, which tolerate these as unknown keys).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerParams {
    /// Quote notional per entry order; size = notional / price.
    pub order_notional: f64,
    /// Stop distance from entry, percent.
    pub stop_loss_pct: f64,
    /// Take-profit distance from entry, percent.
    pub take_profit_pct: f64,
    /// Kline interval requested from the feed each tick.
    pub candle_interval: String,
    pub candle_limit: usize,
}

impl Default for RunnerParams {
    fn default() -> Self {
        Self {
            order_notional: 100.0,
            stop_loss_pct: 2.0,
            take_profit_pct: 4.0,
            candle_interval: "15m".to_string(),
            candle_limit: 50,
        }
    }
}

/// Per-symbol lifecycle: no position, position armed, close in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolState {
    Idle,
    Open,
    Closing,
}

/// TP/SL check. Evaluated unconditionally before the decision function;
/// no mode can skip it.
pub(crate) fn protective_trigger(position: &Position, price: f64) -> Option<&'static str> {
    match position.side {
        Side::Long => {
            if price <= position.stop_loss {
                Some("stop_loss")
            } else if price >= position.take_profit {
                Some("take_profit")
            } else {
                None
            }
        }
        Side::Short => {
            if price >= position.stop_loss {
                Some("stop_loss")
            } else if price <= position.take_profit {
                Some("take_profit")
            } else {
                None
            }
        }
    }
}

/// Stop/take-profit prices derived from entry and percent distances.
pub(crate) fn protective_levels(
    side: Side,
    price: f64,
    stop_loss_pct: f64,
    take_profit_pct: f64,
) -> (f64, f64) {
    match side {
        Side::Long => (
            price * (1.0 - stop_loss_pct / 100.0),
            price * (1.0 + take_profit_pct / 100.0),
        ),
        Side::Short => (
            price * (1.0 + stop_loss_pct / 100.0),
            price * (1.0 - take_profit_pct / 100.0),
        ),
    }
}

/// Drives the tick loop for one symbol.
///
/// The runner is the only order issuer for its symbol and awaits every
/// executor call inline, so at most one open/close action is ever in
/// flight per symbol. Cancellation is checked cooperatively at the top of
/// each tick; an in-flight action always resolves before the task exits.
pub(crate) struct StrategyRunner {
    symbol: String,
    interval: Duration,
    decision: Box<dyn DecisionFunction>,
    params: RunnerParams,
    feed: Arc<dyn MarketDataFeed>,
    executor: Arc<OrderExecutor>,
    store: Arc<PositionStore>,
    events: EventSender,
    state: SymbolState,
}

impl StrategyRunner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        symbol: String,
        interval: Duration,
        decision: Box<dyn DecisionFunction>,
        params: RunnerParams,
        feed: Arc<dyn MarketDataFeed>,
        executor: Arc<OrderExecutor>,
        store: Arc<PositionStore>,
        events: EventSender,
    ) -> Self {
        Self {
            symbol,
            interval,
            decision,
            params,
            feed,
            executor,
            store,
            events,
            state: SymbolState::Idle,
        }
    }

    pub(crate) async fn run(mut self, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            symbol = %self.symbol,
            strategy = self.decision.name(),
            interval = ?self.interval,
            "Strategy runner starting"
        );

        let mut shutdown = shutdown;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            // A failed tick is logged and the loop proceeds: availability
            // outranks any one tick's correctness.
            match self.tick().await {
                Ok(()) => {}
                Err(BotError::DataUnavailable(msg)) => {
                    tracing::warn!(symbol = %self.symbol, "Skipping tick, feed unavailable: {}", msg);
                }
                Err(e) => {
                    tracing::error!(symbol = %self.symbol, "Tick failed: {}", e);
                }
            }
        }

        tracing::info!(symbol = %self.symbol, "Strategy runner stopped");
    }

    /// One tick: fetch data, re-sync state, TP/SL first, then the decision
    /// function, then forward any action.
    pub(crate) async fn tick(&mut self) -> Result<()> {
        let price = self.feed.get_price(&self.symbol).await?;
        let candles = self
            .feed
            .get_candles(
                &self.symbol,
                &self.params.candle_interval,
                self.params.candle_limit,
            )
            .await?;

        let position = self.store.get(&self.symbol);

        // The store is shared with the reconciler: positions can appear or
        // vanish between ticks, so re-derive the state from it.
        self.state = match (&position, self.state) {
            (Some(_), SymbolState::Idle) => SymbolState::Open,
            (None, SymbolState::Open | SymbolState::Closing) => SymbolState::Idle,
            (_, state) => state,
        };

        if let Some(position) = &position {
            let _ = self.store.mark_price(&self.symbol, price);

            // TP/SL precedes the decision function, unconditionally
            if let Some(reason) = protective_trigger(position, price) {
                let action = match position.side {
                    Side::Long => Action::CloseLong {
                        price,
                        reason: reason.to_string(),
                    },
                    Side::Short => Action::CloseShort {
                        price,
                        reason: reason.to_string(),
                    },
                };
                self.forward(action).await;
                return Ok(());
            }
        }

        let ctx = DecisionContext {
            symbol: &self.symbol,
            price,
            candles: &candles,
            position: position.as_ref(),
        };

        if let Some(action) = self.decision.decide(&ctx) {
            self.forward(action).await;
        }

        Ok(())
    }

    /// Forward an action to the executor, guarding the state machine:
    /// opens are discarded unless IDLE (the idempotency guard: no mode can
    /// overwrite an open position), closes while IDLE are no-ops.
    async fn forward(&mut self, action: Action) {
        if action.is_open() && self.state != SymbolState::Idle {
            tracing::debug!(
                symbol = %self.symbol,
                intent = action.intent(),
                state = ?self.state,
                "Discarding open intent while position exists"
            );
            return;
        }
        if !action.is_open() && self.state == SymbolState::Idle {
            tracing::debug!(
                symbol = %self.symbol,
                intent = action.intent(),
                "Ignoring close intent with no position"
            );
            return;
        }

        let signal = Signal::pending(&self.symbol, &action);
        emit(&self.events, BotEvent::Signal(signal.clone()));

        let outcome = self.dispatch(&action).await;

        match outcome {
            Ok(()) => {
                emit(
                    &self.events,
                    BotEvent::Signal(signal.with_status(SignalStatus::Executed)),
                );
            }
            Err(BotError::NotFound(msg)) => {
                // The position vanished between decision and execution
                tracing::debug!(symbol = %self.symbol, "Action became a no-op: {}", msg);
                self.state = SymbolState::Idle;
                emit(
                    &self.events,
                    BotEvent::Signal(signal.with_status(SignalStatus::Failed)),
                );
            }
            Err(e) => {
                tracing::warn!(
                    symbol = %self.symbol,
                    intent = action.intent(),
                    "Action failed: {}",
                    e
                );
                emit(
                    &self.events,
                    BotEvent::Signal(signal.with_status(SignalStatus::Failed)),
                );
            }
        }
    }

    async fn dispatch(&mut self, action: &Action) -> Result<()> {
        match action {
            Action::OpenLong { price, reason } | Action::OpenShort { price, reason } => {
                let side = match action {
                    Action::OpenLong { .. } => Side::Long,
                    _ => Side::Short,
                };
                let size = self.params.order_notional / price;
                let (stop_loss, take_profit) = protective_levels(
                    side,
                    *price,
                    self.params.stop_loss_pct,
                    self.params.take_profit_pct,
                );

                tracing::info!(
                    symbol = %self.symbol,
                    side = side.as_str(),
                    price,
                    reason,
                    "Entry signal"
                );

                self.executor
                    .open(&self.symbol, side, size, *price, stop_loss, take_profit)
                    .await?;
                self.state = SymbolState::Open;
                Ok(())
            }
            Action::CloseLong { price, reason } | Action::CloseShort { price, reason } => {
                self.state = SymbolState::Closing;
                match self.executor.close(&self.symbol, *price, reason).await {
                    Ok(_) => {
                        self.state = SymbolState::Idle;
                        Ok(())
                    }
                    Err(e) => {
                        // Close failed: the position is still live, TP/SL
                        // re-evaluates next tick
                        if !matches!(e, BotError::NotFound(_)) {
                            self.state = SymbolState::Open;
                        }
                        Err(e)
                    }
                }
            }
            Action::Reduce {
                price,
                size,
                reason,
            } => {
                self.executor
                    .reduce(&self.symbol, *size, *price, reason)
                    .await?;
                if !self.store.contains(&self.symbol) {
                    self.state = SymbolState::Idle;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        Balance, ExchangeApi, ExchangePosition, OpenOrder, OrderRequest, OrderResult,
    };
    use crate::dashboard::event_channel;
    use crate::execution::ExecutorConfig;
    use crate::models::Candle;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Feed with a scripted price; candle buffer mirrors the price.
    struct StubFeed {
        price: Mutex<f64>,
        fail: bool,
    }

    impl StubFeed {
        fn at(price: f64) -> Self {
            Self {
                price: Mutex::new(price),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl MarketDataFeed for StubFeed {
        async fn get_price(&self, _symbol: &str) -> Result<f64> {
            if self.fail {
                return Err(BotError::DataUnavailable("stub feed down".to_string()));
            }
            Ok(*self.price.lock().unwrap())
        }

        async fn get_candles(
            &self,
            symbol: &str,
            _interval: &str,
            limit: usize,
        ) -> Result<Vec<Candle>> {
            if self.fail {
                return Err(BotError::DataUnavailable("stub feed down".to_string()));
            }
            let price = *self.price.lock().unwrap();
            Ok((0..limit)
                .map(|i| Candle {
                    symbol: symbol.to_string(),
                    timestamp: Utc::now() - chrono::Duration::minutes((limit - i) as i64),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 100.0,
                })
                .collect())
        }
    }

    /// Exchange that fills everything at the requested hint.
    #[derive(Default)]
    struct StubExchange {
        orders: Mutex<Vec<OrderRequest>>,
        next_id: AtomicU64,
    }

    impl StubExchange {
        fn order_count(&self) -> usize {
            self.orders.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ExchangeApi for StubExchange {
        async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult> {
            self.orders.lock().unwrap().push(request.clone());
            Ok(OrderResult {
                order_id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
                symbol: request.symbol.clone(),
                status: "FILLED".to_string(),
                executed_qty: request.quantity,
                avg_price: 0.0, // Executor falls back to its price hint
            })
        }

        async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<()> {
            Ok(())
        }

        async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<OpenOrder>> {
            Ok(Vec::new())
        }

        async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
            Ok(Vec::new())
        }

        async fn get_balance(&self) -> Result<Balance> {
            Ok(Balance {
                asset: "USDT".to_string(),
                total: 10000.0,
                available: 10000.0,
            })
        }
    }

    /// Decision that always wants a long.
    #[derive(Debug)]
    struct AlwaysOpenLong;

    impl DecisionFunction for AlwaysOpenLong {
        fn decide(&self, ctx: &DecisionContext) -> Option<Action> {
            Some(Action::OpenLong {
                price: ctx.price,
                reason: "test_entry".to_string(),
            })
        }

        fn name(&self) -> &str {
            "always_open_long"
        }

        fn min_candles(&self) -> usize {
            1
        }
    }

    /// Decision that never acts.
    #[derive(Debug)]
    struct NeverAct;

    impl DecisionFunction for NeverAct {
        fn decide(&self, _ctx: &DecisionContext) -> Option<Action> {
            None
        }

        fn name(&self) -> &str {
            "never_act"
        }

        fn min_candles(&self) -> usize {
            1
        }
    }

    struct Harness {
        runner: StrategyRunner,
        exchange: Arc<StubExchange>,
        feed: Arc<StubFeed>,
        store: Arc<PositionStore>,
        events: tokio::sync::mpsc::UnboundedReceiver<BotEvent>,
    }

    impl Harness {
        /// Reason of the most recent TradeClosed event, if any.
        fn last_close_reason(&mut self) -> Option<String> {
            let mut reason = None;
            while let Ok(event) = self.events.try_recv() {
                if let BotEvent::TradeClosed(trade) = event {
                    reason = Some(trade.reason);
                }
            }
            reason
        }
    }

    fn harness(decision: Box<dyn DecisionFunction>, price: f64) -> Harness {
        let exchange = Arc::new(StubExchange::default());
        let feed = Arc::new(StubFeed::at(price));
        let store = Arc::new(PositionStore::new());
        let (tx, rx) = event_channel();

        let executor = Arc::new(OrderExecutor::new(
            exchange.clone(),
            store.clone(),
            tx.clone(),
            ExecutorConfig {
                taker_fee_rate: 0.001,
                max_retries: 3,
                retry_backoff_ms: 1,
                limits: Default::default(),
            },
        ));

        let runner = StrategyRunner::new(
            "BTCUSDT".to_string(),
            Duration::from_secs(15),
            decision,
            RunnerParams::default(),
            feed.clone(),
            executor,
            store.clone(),
            tx,
        );

        Harness {
            runner,
            exchange,
            feed,
            store,
            events: rx,
        }
    }

    #[test]
    fn test_protective_trigger_long() {
        let mut position = crate::strategy::testutil::open_position("BTCUSDT", Side::Long, 100.0);
        position.stop_loss = 95.0;
        position.take_profit = 110.0;

        assert_eq!(protective_trigger(&position, 94.0), Some("stop_loss"));
        assert_eq!(protective_trigger(&position, 111.0), Some("take_profit"));
        assert_eq!(protective_trigger(&position, 103.0), None);
        // Boundary prices trigger
        assert_eq!(protective_trigger(&position, 95.0), Some("stop_loss"));
        assert_eq!(protective_trigger(&position, 110.0), Some("take_profit"));
    }

    #[test]
    fn test_protective_trigger_short_is_symmetric() {
        let mut position = crate::strategy::testutil::open_position("BTCUSDT", Side::Short, 100.0);
        position.stop_loss = 105.0;
        position.take_profit = 90.0;

        assert_eq!(protective_trigger(&position, 106.0), Some("stop_loss"));
        assert_eq!(protective_trigger(&position, 89.0), Some("take_profit"));
        assert_eq!(protective_trigger(&position, 100.0), None);
    }

    #[test]
    fn test_protective_levels() {
        let (sl, tp) = protective_levels(Side::Long, 100.0, 2.0, 4.0);
        assert_eq!(sl, 98.0);
        assert_eq!(tp, 104.0);

        let (sl, tp) = protective_levels(Side::Short, 100.0, 2.0, 4.0);
        assert_eq!(sl, 102.0);
        assert_eq!(tp, 96.0);
    }

    #[tokio::test]
    async fn test_tick_opens_position_from_decision() {
        let mut h = harness(Box::new(AlwaysOpenLong), 100.0);

        h.runner.tick().await.unwrap();

        let position = h.store.get("BTCUSDT").unwrap();
        assert_eq!(position.entry_price, 100.0);
        assert_eq!(position.side, Side::Long);
        // notional 100 at price 100 -> size 1
        assert_eq!(position.size, 1.0);
        assert_eq!(h.runner.state, SymbolState::Open);
        // Entry + two protective legs
        assert_eq!(h.exchange.order_count(), 3);
    }

    #[tokio::test]
    async fn test_repeated_entry_signals_never_overwrite_position() {
        let mut h = harness(Box::new(AlwaysOpenLong), 100.0);

        h.runner.tick().await.unwrap();
        let orders_after_open = h.exchange.order_count();

        // Price moves; the decision still screams open_long every tick
        *h.feed.price.lock().unwrap() = 101.0;
        h.runner.tick().await.unwrap();
        *h.feed.price.lock().unwrap() = 102.0;
        h.runner.tick().await.unwrap();

        // No new orders, entry price untouched
        assert_eq!(h.exchange.order_count(), orders_after_open);
        assert_eq!(h.store.get("BTCUSDT").unwrap().entry_price, 100.0);
        assert_eq!(h.store.open_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_loss_fires_before_decision() {
        // AlwaysOpenLong would re-enter immediately if the guard let it
        let mut h = harness(Box::new(AlwaysOpenLong), 100.0);
        h.runner.tick().await.unwrap();

        // Default runner params: SL at 98, TP at 104
        *h.feed.price.lock().unwrap() = 94.0;
        h.runner.tick().await.unwrap();

        // Position closed by the structural check; the decision's open was
        // evaluated only after the close, on the next tick at the earliest
        assert_eq!(h.runner.state, SymbolState::Idle);
        assert!(!h.store.contains("BTCUSDT"));
        assert_eq!(h.last_close_reason().as_deref(), Some("stop_loss"));
    }

    #[tokio::test]
    async fn test_take_profit_fires() {
        let mut h = harness(Box::new(NeverAct), 100.0);
        h.runner.tick().await.unwrap();
        assert!(!h.store.contains("BTCUSDT"));

        // Seed a position directly
        let mut position = crate::strategy::testutil::open_position("BTCUSDT", Side::Long, 100.0);
        position.stop_loss = 95.0;
        position.take_profit = 110.0;
        h.store.insert(position).unwrap();

        *h.feed.price.lock().unwrap() = 111.0;
        h.runner.tick().await.unwrap();

        assert!(!h.store.contains("BTCUSDT"));
        assert_eq!(h.runner.state, SymbolState::Idle);
        assert_eq!(h.last_close_reason().as_deref(), Some("take_profit"));
    }

    #[tokio::test]
    async fn test_price_between_levels_does_not_close() {
        let mut h = harness(Box::new(NeverAct), 103.0);
        let mut position = crate::strategy::testutil::open_position("BTCUSDT", Side::Long, 100.0);
        position.stop_loss = 95.0;
        position.take_profit = 110.0;
        h.store.insert(position).unwrap();

        h.runner.tick().await.unwrap();

        assert!(h.store.contains("BTCUSDT"));
        // Mark refreshed the unrealized PnL, and nothing closed
        assert_eq!(h.store.get("BTCUSDT").unwrap().unrealized_pnl, 3.0);
        assert_eq!(h.last_close_reason(), None);
    }

    #[tokio::test]
    async fn test_feed_failure_skips_tick_without_side_effects() {
        let exchange = Arc::new(StubExchange::default());
        let feed = Arc::new(StubFeed {
            price: Mutex::new(100.0),
            fail: true,
        });
        let store = Arc::new(PositionStore::new());
        let (tx, _rx) = event_channel();
        let executor = Arc::new(OrderExecutor::new(
            exchange.clone(),
            store.clone(),
            tx.clone(),
            ExecutorConfig::default(),
        ));
        let mut runner = StrategyRunner::new(
            "BTCUSDT".to_string(),
            Duration::from_secs(15),
            Box::new(AlwaysOpenLong),
            RunnerParams::default(),
            feed,
            executor,
            store.clone(),
            tx,
        );

        let err = runner.tick().await.unwrap_err();
        assert!(matches!(err, BotError::DataUnavailable(_)));
        assert_eq!(exchange.order_count(), 0);
        assert!(!store.contains("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_runner_adopts_position_appearing_in_store() {
        // Reconciler adopted a position behind the runner's back
        let mut h = harness(Box::new(NeverAct), 100.0);
        let mut position = crate::strategy::testutil::open_position("BTCUSDT", Side::Short, 100.0);
        position.stop_loss = 105.0;
        position.take_profit = 90.0;
        position.adopted_from_exchange = true;
        h.store.upsert(position);

        h.runner.tick().await.unwrap();
        assert_eq!(h.runner.state, SymbolState::Open);

        // And TP/SL now guards it: price collapses through the take-profit
        *h.feed.price.lock().unwrap() = 89.0;
        h.runner.tick().await.unwrap();
        assert!(!h.store.contains("BTCUSDT"));
    }
}
