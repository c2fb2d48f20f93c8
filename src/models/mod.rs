use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of an open exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short. Used in PnL math.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

/// Strategy mode selecting a decision function at runner construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Bear,
    Bull,
    Scalp,
    Range,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Bear => "bear",
            Mode::Bull => "bull",
            Mode::Scalp => "scalp",
            Mode::Range => "range",
        }
    }

    pub fn parse(s: &str) -> Option<Mode> {
        match s {
            "bear" => Some(Mode::Bear),
            "bull" => Some(Mode::Bull),
            "scalp" => Some(Mode::Scalp),
            "range" => Some(Mode::Range),
            _ => None,
        }
    }
}

/// OHLCV candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// An open exposure to a symbol.
///
/// At most one Position exists per symbol. Created by the order executor on
/// entry and converted into a [`Trade`] on close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
    /// Refreshed by the reconciliation loop and on each mark.
    pub unrealized_pnl: f64,
    /// Exchange order id of the protective stop leg, if it was placed.
    pub stop_order_id: Option<String>,
    /// Exchange order id of the take-profit leg, if it was placed.
    pub take_profit_order_id: Option<String>,
    /// Set when the reconciler adopted this position from exchange state
    /// instead of it being opened locally (drift marker).
    pub adopted_from_exchange: bool,
}

impl Position {
    /// Unrealized PnL at the given mark price (fees excluded).
    pub fn unrealized_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.size * self.side.sign()
    }

    /// Notional value at entry.
    pub fn entry_notional(&self) -> f64 {
        self.entry_price * self.size
    }
}

/// A trading intent emitted by a decision function.
///
/// Transient: produced at most once per tick and immediately turned into a
/// [`Signal`] record when forwarded to the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    OpenLong { price: f64, reason: String },
    OpenShort { price: f64, reason: String },
    CloseLong { price: f64, reason: String },
    CloseShort { price: f64, reason: String },
    Reduce { price: f64, size: f64, reason: String },
}

impl Action {
    pub fn intent(&self) -> &'static str {
        match self {
            Action::OpenLong { .. } => "open_long",
            Action::OpenShort { .. } => "open_short",
            Action::CloseLong { .. } => "close_long",
            Action::CloseShort { .. } => "close_short",
            Action::Reduce { .. } => "reduce",
        }
    }

    pub fn price(&self) -> f64 {
        match self {
            Action::OpenLong { price, .. }
            | Action::OpenShort { price, .. }
            | Action::CloseLong { price, .. }
            | Action::CloseShort { price, .. }
            | Action::Reduce { price, .. } => *price,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Action::OpenLong { reason, .. }
            | Action::OpenShort { reason, .. }
            | Action::CloseLong { reason, .. }
            | Action::CloseShort { reason, .. }
            | Action::Reduce { reason, .. } => reason,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Action::OpenLong { .. } | Action::OpenShort { .. })
    }
}

/// Outcome of a signal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Pending,
    Executed,
    Failed,
}

/// Immutable log record of an Action attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub action: String,
    pub price: f64,
    pub reason: String,
    pub status: SignalStatus,
}

impl Signal {
    /// New pending record for an action about to be forwarded.
    pub fn pending(symbol: &str, action: &Action) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            action: action.intent().to_string(),
            price: action.price(),
            reason: action.reason().to_string(),
            status: SignalStatus::Pending,
        }
    }

    pub fn with_status(mut self, status: SignalStatus) -> Self {
        self.status = status;
        self
    }
}

/// Immutable record of a closed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub fees: f64,
    pub reason: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
}

/// Lifecycle state of a persisted strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Running,
    Stopped,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Running => "running",
            StrategyStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<StrategyStatus> {
        match s {
            "running" => Some(StrategyStatus::Running),
            "stopped" => Some(StrategyStatus::Stopped),
            _ => None,
        }
    }
}

/// Durable description of an active strategy, keyed by symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub symbol: String,
    pub mode: Mode,
    pub interval_secs: u64,
    /// Free-form per-mode parameters; parsed with defaults by the decision
    /// function factory and the runner.
    pub params: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub status: StrategyStatus,
}
