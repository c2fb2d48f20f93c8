use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Signal, Trade};

/// Events emitted by the hot path onto the dashboard queue.
///
/// Producers (runners, executor, reconciler) never call into dashboard
/// code synchronously; they push events here and move on. Sends are
/// fire-and-forget: a missing consumer must never stall a tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotEvent {
    /// A signal attempt was recorded or its status changed.
    Signal(Signal),
    /// A position was closed into a trade.
    TradeClosed(Trade),
    /// Local and exchange position state diverged and was self-healed.
    Drift {
        symbol: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },
}

impl BotEvent {
    pub fn drift(symbol: &str, detail: impl Into<String>) -> Self {
        BotEvent::Drift {
            symbol: symbol.to_string(),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Sender half of the event queue, shared by every producer.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<BotEvent>;

/// Build the event queue. The receiver goes to the dashboard aggregator.
pub fn event_channel() -> (EventSender, tokio::sync::mpsc::UnboundedReceiver<BotEvent>) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Push an event, ignoring a closed queue (consumer shut down first).
pub fn emit(sender: &EventSender, event: BotEvent) {
    let _ = sender.send(event);
}
