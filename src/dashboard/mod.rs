// Dashboard state: downstream consumer of the event queue.
//
// The aggregator task is the only writer; runners and the executor never
// touch this state directly. Constructed once at startup and injected,
// never a module-level singleton.
pub mod events;

pub use events::{emit, event_channel, BotEvent, EventSender};

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::db::TradeSink;
use crate::models::{Position, Signal, SignalStatus, Trade};

/// Bounded history per category; oldest entries are discarded.
const MAX_HISTORY: usize = 500;

/// Derived trading statistics over the recorded history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate_pct: f64,
    pub total_pnl: f64,
    pub total_fees: f64,
}

/// Read-only view handed to the dashboard endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub signals: Vec<Signal>,
    pub positions: Vec<Position>,
    pub trades: Vec<Trade>,
    pub statistics: Statistics,
}

#[derive(Default)]
struct Inner {
    signals: Vec<Signal>,
    trades: Vec<Trade>,
    drift_log: Vec<(DateTime<Utc>, String)>,
}

/// In-memory signal/trade history plus derived statistics.
pub struct DashboardState {
    inner: RwLock<Inner>,
}

impl DashboardState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Apply one event to the history.
    pub fn record(&self, event: &BotEvent) {
        let mut inner = self.inner.write().expect("dashboard lock poisoned");

        match event {
            BotEvent::Signal(signal) => {
                // A signal id reappears when its status settles
                if let Some(existing) = inner.signals.iter_mut().find(|s| s.id == signal.id) {
                    *existing = signal.clone();
                } else {
                    inner.signals.push(signal.clone());
                    if inner.signals.len() > MAX_HISTORY {
                        inner.signals.remove(0);
                    }
                }
            }
            BotEvent::TradeClosed(trade) => {
                inner.trades.push(trade.clone());
                if inner.trades.len() > MAX_HISTORY {
                    inner.trades.remove(0);
                }
            }
            BotEvent::Drift {
                symbol,
                detail,
                timestamp,
            } => {
                inner
                    .drift_log
                    .push((*timestamp, format!("{symbol}: {detail}")));
                if inner.drift_log.len() > MAX_HISTORY {
                    inner.drift_log.remove(0);
                }
            }
        }
    }

    pub fn statistics(&self) -> Statistics {
        let inner = self.inner.read().expect("dashboard lock poisoned");

        let total_trades = inner.trades.len();
        let wins = inner.trades.iter().filter(|t| t.pnl > 0.0).count();
        let losses = inner.trades.iter().filter(|t| t.pnl < 0.0).count();
        let total_pnl: f64 = inner.trades.iter().map(|t| t.pnl).sum();
        let total_fees: f64 = inner.trades.iter().map(|t| t.fees).sum();

        Statistics {
            total_trades,
            wins,
            losses,
            win_rate_pct: if total_trades > 0 {
                wins as f64 / total_trades as f64 * 100.0
            } else {
                0.0
            },
            total_pnl,
            total_fees,
        }
    }

    /// Full view for the read-only endpoint. Live positions come from the
    /// position store; history from here.
    pub fn snapshot(&self, positions: Vec<Position>) -> DashboardSnapshot {
        let statistics = self.statistics();
        let inner = self.inner.read().expect("dashboard lock poisoned");

        DashboardSnapshot {
            signals: inner.signals.clone(),
            positions,
            trades: inner.trades.clone(),
            statistics,
        }
    }

    pub fn drift_events(&self) -> Vec<String> {
        let inner = self.inner.read().expect("dashboard lock poisoned");
        inner.drift_log.iter().map(|(_, d)| d.clone()).collect()
    }

    /// Wipe recorded history. Never touches live positions.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("dashboard lock poisoned");
        inner.signals.clear();
        inner.trades.clear();
    }

    /// Full reset of in-memory history including the drift log.
    pub fn reset(&self) {
        let mut inner = self.inner.write().expect("dashboard lock poisoned");
        *inner = Inner::default();
    }
}

impl Default for DashboardState {
    fn default() -> Self {
        Self::new()
    }
}

/// Consume the event queue into the dashboard state, appending closed
/// trades to durable storage when a sink is available. Runs until every
/// sender is dropped.
pub async fn run_aggregator(
    state: Arc<DashboardState>,
    mut rx: UnboundedReceiver<BotEvent>,
    trade_sink: Option<Arc<dyn TradeSink>>,
) {
    while let Some(event) = rx.recv().await {
        state.record(&event);

        if let BotEvent::TradeClosed(trade) = &event {
            if let Some(sink) = &trade_sink {
                if let Err(e) = sink.append_trade(trade).await {
                    tracing::warn!("Failed to persist trade {}: {}", trade.id, e);
                }
            }
        }
    }

    tracing::debug!("Dashboard aggregator stopped: all producers gone");
}

/// Count of signals currently in the history (mainly for tests/status).
impl DashboardState {
    pub fn signal_count(&self) -> usize {
        self.inner
            .read()
            .expect("dashboard lock poisoned")
            .signals
            .len()
    }
}
