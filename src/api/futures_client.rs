use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;

use super::{
    Balance, ExchangeApi, ExchangePosition, MarketDataFeed, OpenOrder, OrderRequest, OrderResult,
};
use crate::models::{Candle, Side};
use crate::{BotError, Result};

type HmacSha256 = Hmac<Sha256>;

// Type alias for the rate limiter to simplify signatures
type ApiRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Asset all strategies are margined and settled in.
const QUOTE_ASSET: &str = "USDT";

/// REST client for a USDT-margined futures exchange.
///
/// Market data endpoints are public GETs; order and account endpoints are
/// signed with HMAC-SHA256 and carry the API key header. Every request
/// passes the shared rate limiter and the client-wide timeout, so no call
/// can block a tick indefinitely.
///
/// The client performs exactly one attempt per call and only classifies
/// failures (`Transient` vs `ExchangeRejected` vs `DataUnavailable`);
/// retry policy lives in the order executor.
#[derive(Clone)]
pub struct FuturesClient {
    client: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    rate_limiter: Arc<ApiRateLimiter>,
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct TickerPriceRaw {
    #[allow(dead_code)]
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponseRaw {
    #[serde(rename = "orderId")]
    order_id: i64,
    symbol: String,
    status: String,
    #[serde(rename = "executedQty")]
    executed_qty: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenOrderRaw {
    #[serde(rename = "orderId")]
    order_id: i64,
    symbol: String,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(rename = "stopPrice", default)]
    stop_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PositionRiskRaw {
    symbol: String,
    #[serde(rename = "positionAmt")]
    position_amt: String,
    #[serde(rename = "entryPrice")]
    entry_price: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
}

#[derive(Debug, Deserialize)]
struct BalanceRaw {
    asset: String,
    balance: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

// ============== Implementation ==============

impl FuturesClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        api_secret: &str,
        timeout_secs: u64,
        rate_limit_per_min: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| BotError::Config(format!("failed to build HTTP client: {e}")))?;

        let quota = Quota::per_minute(
            NonZeroU32::new(rate_limit_per_min.max(1)).expect("nonzero rate limit"),
        );
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter,
        })
    }

    /// Sign a query string with HMAC-SHA256.
    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Public (unsigned) GET for market data. Failures map to
    /// `DataUnavailable` so callers skip their tick and retry later.
    async fn public_get(&self, path: &str, query: &str) -> Result<reqwest::Response> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}?{}", self.base_url, path, query);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BotError::DataUnavailable(format!("{path}: {e}")))?;

        if !response.status().is_success() {
            return Err(BotError::DataUnavailable(format!(
                "{path}: HTTP {}",
                response.status()
            )));
        }

        Ok(response)
    }

    /// Signed request for order/account endpoints. Appends timestamp and
    /// signature, sends the API key header, and classifies failures into
    /// the retryable/non-retryable taxonomy.
    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &str,
    ) -> Result<reqwest::Response> {
        self.rate_limiter.until_ready().await;

        let with_ts = if params.is_empty() {
            format!("timestamp={}", self.timestamp_ms())
        } else {
            format!("{}&timestamp={}", params, self.timestamp_ms())
        };
        let signature = self.sign(&with_ts);
        let full_params = format!("{}&signature={}", with_ts, signature);

        let request = if method == Method::GET {
            self.client
                .get(format!("{}{}?{}", self.base_url, path, full_params))
        } else {
            self.client
                .request(method, format!("{}{}", self.base_url, path))
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(full_params)
        };

        let response = request
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| BotError::Transient(format!("{path}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(BotError::Transient(format!("{path}: HTTP {status} {body}")));
        }

        // Exchange error bodies carry {code, msg}
        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(api_err) => Err(BotError::ExchangeRejected(format!(
                "code {}: {}",
                api_err.code, api_err.msg
            ))),
            Err(_) => Err(BotError::ExchangeRejected(format!(
                "{path}: HTTP {status} {body}"
            ))),
        }
    }
}

/// Format a quantity/price without trailing zeros.
fn format_decimal(value: f64) -> String {
    let s = format!("{value:.8}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn parse_f64(s: &str, what: &str) -> Result<f64> {
    s.parse::<f64>()
        .map_err(|_| BotError::ExchangeRejected(format!("unparseable {what}: {s}")))
}

#[async_trait]
impl MarketDataFeed for FuturesClient {
    async fn get_price(&self, symbol: &str) -> Result<f64> {
        let response = self
            .public_get("/fapi/v1/ticker/price", &format!("symbol={symbol}"))
            .await?;

        let ticker: TickerPriceRaw = response
            .json()
            .await
            .map_err(|e| BotError::DataUnavailable(format!("ticker parse: {e}")))?;

        ticker
            .price
            .parse::<f64>()
            .map_err(|_| BotError::DataUnavailable(format!("bad ticker price: {}", ticker.price)))
    }

    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let query = format!("symbol={symbol}&interval={interval}&limit={limit}");
        let response = self.public_get("/fapi/v1/klines", &query).await?;

        // Klines come as arrays: [open_time, open, high, low, close, volume, ...]
        let rows: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| BotError::DataUnavailable(format!("klines parse: {e}")))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() < 6 {
                return Err(BotError::DataUnavailable("short kline row".to_string()));
            }

            let open_time = row[0]
                .as_i64()
                .ok_or_else(|| BotError::DataUnavailable("bad kline open time".to_string()))?;
            let timestamp = Utc
                .timestamp_millis_opt(open_time)
                .single()
                .ok_or_else(|| BotError::DataUnavailable("bad kline timestamp".to_string()))?;

            let field = |i: usize| -> Result<f64> {
                row[i]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| BotError::DataUnavailable(format!("bad kline field {i}")))
            };

            candles.push(Candle {
                symbol: symbol.to_string(),
                timestamp,
                open: field(1)?,
                high: field(2)?,
                low: field(3)?,
                close: field(4)?,
                volume: field(5)?,
            });
        }

        Ok(candles)
    }
}

#[async_trait]
impl ExchangeApi for FuturesClient {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult> {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}&positionSide={}&reduceOnly={}",
            request.symbol,
            request.side.as_str(),
            request.order_type.as_str(),
            format_decimal(request.quantity),
            request.position_side.as_str(),
            request.reduce_only,
        );
        if let Some(stop_price) = request.stop_price {
            params.push_str(&format!("&stopPrice={}", format_decimal(stop_price)));
        }

        tracing::debug!(
            symbol = %request.symbol,
            order_type = request.order_type.as_str(),
            side = request.side.as_str(),
            position_side = request.position_side.as_str(),
            "Placing order"
        );

        let response = self
            .signed_request(Method::POST, "/fapi/v1/order", &params)
            .await?;

        let raw: OrderResponseRaw = response
            .json()
            .await
            .map_err(|e| BotError::ExchangeRejected(format!("order response parse: {e}")))?;

        Ok(OrderResult {
            order_id: raw.order_id.to_string(),
            symbol: raw.symbol,
            status: raw.status,
            executed_qty: parse_f64(&raw.executed_qty, "executedQty")?,
            avg_price: raw
                .avg_price
                .as_deref()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0),
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.signed_request(Method::DELETE, "/fapi/v1/order", &params)
            .await?;
        Ok(())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let response = self
            .signed_request(
                Method::GET,
                "/fapi/v1/openOrders",
                &format!("symbol={symbol}"),
            )
            .await?;

        let raw: Vec<OpenOrderRaw> = response
            .json()
            .await
            .map_err(|e| BotError::ExchangeRejected(format!("open orders parse: {e}")))?;

        Ok(raw
            .into_iter()
            .map(|o| OpenOrder {
                order_id: o.order_id.to_string(),
                symbol: o.symbol,
                order_type: o.order_type,
                stop_price: o
                    .stop_price
                    .as_deref()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        let response = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", "")
            .await?;

        let raw: Vec<PositionRiskRaw> = response
            .json()
            .await
            .map_err(|e| BotError::ExchangeRejected(format!("positionRisk parse: {e}")))?;

        let mut positions = Vec::new();
        for row in raw {
            let amount = parse_f64(&row.position_amt, "positionAmt")?;
            if amount.abs() < f64::EPSILON {
                continue;
            }

            positions.push(ExchangePosition {
                symbol: row.symbol,
                side: if amount > 0.0 { Side::Long } else { Side::Short },
                entry_price: parse_f64(&row.entry_price, "entryPrice")?,
                size: amount.abs(),
                unrealized_pnl: parse_f64(&row.unrealized_profit, "unRealizedProfit")?,
            });
        }

        Ok(positions)
    }

    async fn get_balance(&self) -> Result<Balance> {
        let response = self
            .signed_request(Method::GET, "/fapi/v2/balance", "")
            .await?;

        let raw: Vec<BalanceRaw> = response
            .json()
            .await
            .map_err(|e| BotError::ExchangeRejected(format!("balance parse: {e}")))?;

        raw.into_iter()
            .find(|b| b.asset == QUOTE_ASSET)
            .map(|b| {
                Ok(Balance {
                    asset: b.asset,
                    total: parse_f64(&b.balance, "balance")?,
                    available: parse_f64(&b.available_balance, "availableBalance")?,
                })
            })
            .unwrap_or_else(|| Err(BotError::NotFound(format!("no {QUOTE_ASSET} balance"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{OrderSide, OrderType, PositionSide};
    use mockito::Matcher;

    fn test_client(base_url: &str) -> FuturesClient {
        FuturesClient::new(base_url, "test_key", "test_secret", 5, 600).unwrap()
    }

    #[test]
    fn test_format_decimal_trims_zeros() {
        assert_eq!(format_decimal(0.5), "0.5");
        assert_eq!(format_decimal(100.0), "100");
        assert_eq!(format_decimal(0.00012345), "0.00012345");
    }

    #[test]
    fn test_sign_is_deterministic() {
        let client = test_client("http://localhost");
        let a = client.sign("symbol=BTCUSDT&timestamp=1");
        let b = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA256
    }

    #[tokio::test]
    async fn test_get_price() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"symbol":"BTCUSDT","price":"26123.45"}"#)
            .create_async()
            .await;

        let client = test_client(&server.url());
        let price = client.get_price("BTCUSDT").await.unwrap();

        assert_eq!(price, 26123.45);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_price_server_error_is_data_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(Matcher::Any)
            .with_status(502)
            .create_async()
            .await;

        let client = test_client(&server.url());
        let err = client.get_price("BTCUSDT").await.unwrap_err();

        assert!(matches!(err, BotError::DataUnavailable(_)));
    }

    #[tokio::test]
    async fn test_get_candles_parses_kline_rows() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/klines")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[
                    [1700000000000,"100.0","101.0","99.0","100.5","1200.0",1700000899999],
                    [1700000900000,"100.5","102.0","100.1","101.8","900.0",1700001799999]
                ]"#,
            )
            .create_async()
            .await;

        let client = test_client(&server.url());
        let candles = client.get_candles("BTCUSDT", "15m", 2).await.unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 100.5);
        assert_eq!(candles[1].close, 101.8);
        assert_eq!(candles[0].symbol, "BTCUSDT");
        assert!(candles[0].timestamp < candles[1].timestamp);
    }

    #[tokio::test]
    async fn test_create_order_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fapi/v1/order")
            .with_status(200)
            .with_body(
                r#"{"orderId":123456,"symbol":"BTCUSDT","status":"FILLED",
                    "side":"BUY","origQty":"0.5","executedQty":"0.5","avgPrice":"26000.10"}"#,
            )
            .create_async()
            .await;

        let client = test_client(&server.url());
        let request = OrderRequest::market("BTCUSDT", OrderSide::Buy, 0.5, PositionSide::Long);
        let result = client.create_order(&request).await.unwrap();

        assert_eq!(result.order_id, "123456");
        assert_eq!(result.executed_qty, 0.5);
        assert_eq!(result.avg_price, 26000.10);
    }

    #[tokio::test]
    async fn test_create_order_rejection_surfaces_exchange_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fapi/v1/order")
            .with_status(400)
            .with_body(r#"{"code":-2019,"msg":"Margin is insufficient."}"#)
            .create_async()
            .await;

        let client = test_client(&server.url());
        let request = OrderRequest::protective(
            "BTCUSDT",
            OrderSide::Sell,
            OrderType::StopMarket,
            0.5,
            PositionSide::Long,
            25000.0,
        );
        let err = client.create_order(&request).await.unwrap_err();

        match err {
            BotError::ExchangeRejected(msg) => assert!(msg.contains("Margin is insufficient")),
            other => panic!("expected ExchangeRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_order_rate_limited_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fapi/v1/order")
            .with_status(429)
            .with_body(r#"{"code":-1003,"msg":"Too many requests."}"#)
            .create_async()
            .await;

        let client = test_client(&server.url());
        let request = OrderRequest::market("BTCUSDT", OrderSide::Buy, 0.5, PositionSide::Long);
        let err = client.create_order(&request).await.unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_get_positions_skips_flat_symbols() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fapi/v2/positionRisk")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[
                    {"symbol":"BTCUSDT","positionAmt":"0.500","entryPrice":"26000.0",
                     "unRealizedProfit":"12.5","positionSide":"LONG"},
                    {"symbol":"ETHUSDT","positionAmt":"-2.000","entryPrice":"1650.0",
                     "unRealizedProfit":"-3.0","positionSide":"SHORT"},
                    {"symbol":"SOLUSDT","positionAmt":"0.000","entryPrice":"0.0",
                     "unRealizedProfit":"0.0","positionSide":"BOTH"}
                ]"#,
            )
            .create_async()
            .await;

        let client = test_client(&server.url());
        let positions = client.get_positions().await.unwrap();

        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].side, Side::Long);
        assert_eq!(positions[0].size, 0.5);
        assert_eq!(positions[1].side, Side::Short);
        assert_eq!(positions[1].size, 2.0);
    }

    #[tokio::test]
    async fn test_get_open_orders_parses_protective_orders() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/openOrders")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[
                    {"orderId":77,"symbol":"BTCUSDT","type":"STOP_MARKET","stopPrice":"25000.0"},
                    {"orderId":78,"symbol":"BTCUSDT","type":"TAKE_PROFIT_MARKET","stopPrice":"28000.0"}
                ]"#,
            )
            .create_async()
            .await;

        let client = test_client(&server.url());
        let orders = client.get_open_orders("BTCUSDT").await.unwrap();

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].order_id, "77");
        assert_eq!(orders[0].order_type, "STOP_MARKET");
        assert_eq!(orders[0].stop_price, 25000.0);
        assert_eq!(orders[1].order_type, "TAKE_PROFIT_MARKET");
    }

    #[tokio::test]
    async fn test_get_balance_picks_quote_asset() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fapi/v2/balance")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[
                    {"asset":"BNB","balance":"1.0","availableBalance":"1.0"},
                    {"asset":"USDT","balance":"10000.0","availableBalance":"9500.0"}
                ]"#,
            )
            .create_async()
            .await;

        let client = test_client(&server.url());
        let balance = client.get_balance().await.unwrap();

        assert_eq!(balance.asset, "USDT");
        assert_eq!(balance.total, 10000.0);
        assert_eq!(balance.available, 9500.0);
    }
}
