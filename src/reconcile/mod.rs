// Reconciliation loop: periodically syncs local position belief against
// the exchange ledger and self-heals drift. Runs independently of every
// strategy runner.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::api::{ExchangeApi, ExchangePosition, MarketDataFeed};
use crate::dashboard::{emit, BotEvent, EventSender};
use crate::execution::PositionStore;
use crate::models::Position;
use crate::runner::strategy_runner::protective_levels;
use crate::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    /// Protective levels for adopted positions, derived from the adopted
    /// entry price (the exchange does not know our intended levels).
    pub default_stop_loss_pct: f64,
    pub default_take_profit_pct: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            default_stop_loss_pct: 5.0,
            default_take_profit_pct: 10.0,
        }
    }
}

/// What one reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Exchange-only positions adopted locally.
    pub adopted: usize,
    /// Local-only positions dropped.
    pub dropped: usize,
    /// Size/entry mismatches overwritten with exchange values.
    pub overwritten: usize,
    /// Consistent positions whose unrealized PnL was refreshed.
    pub marked: usize,
}

/// Sizes/prices from two ledgers never match bit-for-bit.
fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9_f64.max(a.abs().max(b.abs()) * 1e-6)
}

pub struct Reconciler {
    exchange: Arc<dyn ExchangeApi>,
    feed: Arc<dyn MarketDataFeed>,
    store: Arc<PositionStore>,
    events: EventSender,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        feed: Arc<dyn MarketDataFeed>,
        store: Arc<PositionStore>,
        events: EventSender,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            exchange,
            feed,
            store,
            events,
            config,
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.interval_secs,
            "Reconciliation loop starting"
        );

        let mut shutdown = shutdown;
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.sync_once().await {
                Ok(report) => {
                    if report != ReconcileReport::default() {
                        tracing::debug!(?report, "Reconcile pass");
                    }
                }
                Err(e) => {
                    tracing::warn!("Reconcile pass failed, retrying next interval: {}", e);
                }
            }
        }

        tracing::info!("Reconciliation loop stopped");
    }

    fn adopt_position(&self, remote: &ExchangePosition) -> Position {
        let (stop_loss, take_profit) = protective_levels(
            remote.side,
            remote.entry_price,
            self.config.default_stop_loss_pct,
            self.config.default_take_profit_pct,
        );

        Position {
            symbol: remote.symbol.clone(),
            side: remote.side,
            entry_price: remote.entry_price,
            size: remote.size,
            stop_loss,
            take_profit,
            opened_at: Utc::now(),
            unrealized_pnl: remote.unrealized_pnl,
            stop_order_id: None,
            take_profit_order_id: None,
            adopted_from_exchange: true,
        }
    }

    /// One pass: the exchange is the ledger of record, so local state is
    /// corrected toward it, never the other way around.
    pub async fn sync_once(&self) -> Result<ReconcileReport> {
        let mut remote: HashMap<String, ExchangePosition> = self
            .exchange
            .get_positions()
            .await?
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();

        let mut report = ReconcileReport::default();

        for local in self.store.snapshot() {
            match remote.remove(&local.symbol) {
                None => {
                    self.store.remove(&local.symbol);
                    tracing::warn!(
                        symbol = %local.symbol,
                        "Drift: local position absent on exchange, dropping local state"
                    );
                    emit(
                        &self.events,
                        BotEvent::drift(&local.symbol, "local position absent on exchange"),
                    );
                    report.dropped += 1;
                }
                Some(exchange_position) => {
                    let consistent = exchange_position.side == local.side
                        && approx_eq(exchange_position.size, local.size)
                        && approx_eq(exchange_position.entry_price, local.entry_price);

                    if !consistent {
                        tracing::warn!(
                            symbol = %local.symbol,
                            local_size = local.size,
                            exchange_size = exchange_position.size,
                            local_entry = local.entry_price,
                            exchange_entry = exchange_position.entry_price,
                            "Drift: adopting exchange size/entry as authoritative"
                        );
                        self.store.update(&local.symbol, |p| {
                            p.side = exchange_position.side;
                            p.size = exchange_position.size;
                            p.entry_price = exchange_position.entry_price;
                            p.unrealized_pnl = exchange_position.unrealized_pnl;
                            p.adopted_from_exchange = true;
                        })?;
                        emit(
                            &self.events,
                            BotEvent::drift(&local.symbol, "size/entry overwritten from exchange"),
                        );
                        report.overwritten += 1;
                    } else {
                        // In agreement: refresh unrealized PnL at the
                        // current price
                        match self.feed.get_price(&local.symbol).await {
                            Ok(price) => {
                                let _ = self.store.mark_price(&local.symbol, price);
                                report.marked += 1;
                            }
                            Err(e) => {
                                tracing::debug!(
                                    symbol = %local.symbol,
                                    "Price unavailable during reconcile: {}",
                                    e
                                );
                            }
                        }
                    }
                }
            }
        }

        // Whatever remains is exchange-only: adopt it
        for (symbol, exchange_position) in remote {
            let adopted = self.adopt_position(&exchange_position);
            tracing::warn!(
                symbol = %symbol,
                side = adopted.side.as_str(),
                size = adopted.size,
                entry_price = adopted.entry_price,
                "Drift: exchange reports a position unknown locally, adopting"
            );
            self.store.upsert(adopted);
            emit(
                &self.events,
                BotEvent::drift(&symbol, "adopted exchange-only position"),
            );
            report.adopted += 1;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Balance, OpenOrder, OrderRequest, OrderResult};
    use crate::models::Side;
    use crate::dashboard::event_channel;
    use crate::models::Candle;
    use crate::BotError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedExchange {
        positions: Mutex<Vec<ExchangePosition>>,
    }

    impl ScriptedExchange {
        fn with_positions(positions: Vec<ExchangePosition>) -> Self {
            Self {
                positions: Mutex::new(positions),
            }
        }
    }

    #[async_trait]
    impl ExchangeApi for ScriptedExchange {
        async fn create_order(&self, _request: &OrderRequest) -> Result<OrderResult> {
            Err(BotError::ExchangeRejected("not scripted".to_string()))
        }

        async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<()> {
            Ok(())
        }

        async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<OpenOrder>> {
            Ok(Vec::new())
        }

        async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
            Ok(self.positions.lock().unwrap().clone())
        }

        async fn get_balance(&self) -> Result<Balance> {
            Ok(Balance {
                asset: "USDT".to_string(),
                total: 0.0,
                available: 0.0,
            })
        }
    }

    struct FixedFeed {
        price: f64,
    }

    #[async_trait]
    impl MarketDataFeed for FixedFeed {
        async fn get_price(&self, _symbol: &str) -> Result<f64> {
            Ok(self.price)
        }

        async fn get_candles(
            &self,
            _symbol: &str,
            _interval: &str,
            _limit: usize,
        ) -> Result<Vec<Candle>> {
            Ok(Vec::new())
        }
    }

    fn remote_long(symbol: &str, entry: f64, size: f64) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: entry,
            size,
            unrealized_pnl: 0.0,
        }
    }

    fn build(
        exchange_positions: Vec<ExchangePosition>,
        price: f64,
    ) -> (
        Reconciler,
        Arc<PositionStore>,
        tokio::sync::mpsc::UnboundedReceiver<BotEvent>,
    ) {
        let store = Arc::new(PositionStore::new());
        let (tx, rx) = event_channel();
        let reconciler = Reconciler::new(
            Arc::new(ScriptedExchange::with_positions(exchange_positions)),
            Arc::new(FixedFeed { price }),
            store.clone(),
            tx,
            ReconcileConfig::default(),
        );
        (reconciler, store, rx)
    }

    #[tokio::test]
    async fn test_adopts_exchange_only_position() {
        let (reconciler, store, mut rx) = build(vec![remote_long("BTCUSDT", 26000.0, 0.5)], 26100.0);

        let report = reconciler.sync_once().await.unwrap();

        assert_eq!(report.adopted, 1);
        let position = store.get("BTCUSDT").unwrap();
        assert!(position.adopted_from_exchange);
        assert_eq!(position.entry_price, 26000.0);
        assert_eq!(position.size, 0.5);
        // Default levels derived from the adopted entry: -5% / +10%
        assert!((position.stop_loss - 24700.0).abs() < 1e-6);
        assert!((position.take_profit - 28600.0).abs() < 1e-6);

        match rx.recv().await.unwrap() {
            BotEvent::Drift { symbol, .. } => assert_eq!(symbol, "BTCUSDT"),
            other => panic!("expected Drift, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drops_local_position_absent_on_exchange() {
        let (reconciler, store, mut rx) = build(Vec::new(), 100.0);
        store
            .insert(crate::strategy::testutil::open_position(
                "ETHUSDT",
                Side::Long,
                1650.0,
            ))
            .unwrap();

        let report = reconciler.sync_once().await.unwrap();

        assert_eq!(report.dropped, 1);
        assert!(!store.contains("ETHUSDT"));
        assert!(matches!(rx.recv().await.unwrap(), BotEvent::Drift { .. }));
    }

    #[tokio::test]
    async fn test_overwrites_mismatched_size_and_entry() {
        let (reconciler, store, _rx) = build(vec![remote_long("BTCUSDT", 25900.0, 0.7)], 26000.0);
        // Local belief: 0.5 @ 26000 (e.g. a manual partial close happened)
        let mut local = crate::strategy::testutil::open_position("BTCUSDT", Side::Long, 26000.0);
        local.size = 0.5;
        store.insert(local).unwrap();

        let report = reconciler.sync_once().await.unwrap();

        assert_eq!(report.overwritten, 1);
        let position = store.get("BTCUSDT").unwrap();
        assert_eq!(position.size, 0.7);
        assert_eq!(position.entry_price, 25900.0);
        assert!(position.adopted_from_exchange);
    }

    #[tokio::test]
    async fn test_consistent_position_gets_pnl_refresh() {
        let (reconciler, store, _rx) = build(vec![remote_long("BTCUSDT", 26000.0, 0.5)], 26200.0);
        let mut local = crate::strategy::testutil::open_position("BTCUSDT", Side::Long, 26000.0);
        local.size = 0.5;
        store.insert(local).unwrap();

        let report = reconciler.sync_once().await.unwrap();

        assert_eq!(report.marked, 1);
        assert_eq!(report.overwritten, 0);
        let position = store.get("BTCUSDT").unwrap();
        // (26200 - 26000) * 0.5
        assert_eq!(position.unrealized_pnl, 100.0);
        assert!(!position.adopted_from_exchange);
    }

    #[tokio::test]
    async fn test_empty_both_sides_is_a_quiet_pass() {
        let (reconciler, store, _rx) = build(Vec::new(), 100.0);
        let report = reconciler.sync_once().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(store.open_count(), 0);
    }
}
