// Exchange access: market data feed + order API trait seams and the
// concrete REST client implementing both.
pub mod futures_client;

pub use futures_client::FuturesClient;

use async_trait::async_trait;

use crate::models::{Candle, Side};
use crate::Result;

/// Side of an order as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Explicit position side tag.
///
/// Always supplied on every order: exchanges that allow holding both
/// directions at once reject orders whose direction must be inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

impl From<Side> for PositionSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Long => PositionSide::Long,
            Side::Short => PositionSide::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// A fully specified order request.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub position_side: PositionSide,
    pub reduce_only: bool,
    /// Trigger price for STOP_MARKET / TAKE_PROFIT_MARKET orders.
    pub stop_price: Option<f64>,
}

impl OrderRequest {
    /// Market entry order.
    pub fn market(symbol: &str, side: OrderSide, quantity: f64, position_side: PositionSide) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            position_side,
            reduce_only: false,
            stop_price: None,
        }
    }

    /// Reduce-only protective order triggered at `stop_price`.
    pub fn protective(
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        position_side: PositionSide,
        stop_price: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            position_side,
            reduce_only: true,
            stop_price: Some(stop_price),
        }
    }

    /// Reduce-only market order shrinking an existing position.
    pub fn reduce_market(
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        position_side: PositionSide,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            position_side,
            reduce_only: true,
            stop_price: None,
        }
    }
}

/// Result of a placed order.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: String,
    pub symbol: String,
    pub status: String,
    pub executed_qty: f64,
    /// Average fill price; 0.0 until the exchange reports fills.
    pub avg_price: f64,
}

/// An order resting on the exchange.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub order_type: String,
    pub stop_price: f64,
}

/// A position as reported by the exchange ledger.
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub unrealized_pnl: f64,
}

/// Account balance for the quote asset.
#[derive(Debug, Clone)]
pub struct Balance {
    pub asset: String,
    pub total: f64,
    pub available: f64,
}

/// Price/candle supplier. Failures surface as `DataUnavailable` and skip
/// the caller's tick.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Result<f64>;

    async fn get_candles(&self, symbol: &str, interval: &str, limit: usize)
        -> Result<Vec<Candle>>;
}

/// Order placement and account state on the exchange.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>>;

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>>;

    async fn get_balance(&self) -> Result<Balance>;
}
