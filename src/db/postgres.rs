use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{ConfigStore, TradeSink};
use crate::models::{Mode, Side, StrategyConfig, StrategyStatus, Trade};
use crate::{BotError, Result};

/// Postgres persistence for strategy configs and closed trades.
pub struct PostgresPersistence {
    pool: PgPool,
}

fn decode_err(column: &str, detail: impl Into<String>) -> BotError {
    BotError::Persistence(format!("corrupt {column} column: {}", detail.into()))
}

fn numeric(row: &PgRow, column: &str) -> Result<f64> {
    let value: Decimal = row.try_get(column)?;
    value
        .to_f64()
        .ok_or_else(|| decode_err(column, format!("numeric out of f64 range: {value}")))
}

impl PostgresPersistence {
    /// Connect and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    /// Recent closed trades, newest first.
    pub async fn load_recent_trades(&self, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, side, entry_price, exit_price, size,
                   pnl, pnl_pct, fees, reason, entry_time, exit_time
            FROM trades
            ORDER BY exit_time DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            let side_str: String = row.try_get("side")?;
            let side = match side_str.as_str() {
                "long" => Side::Long,
                "short" => Side::Short,
                other => return Err(decode_err("side", format!("unknown side: {other}"))),
            };

            trades.push(Trade {
                id: row.try_get::<Uuid, _>("id")?,
                symbol: row.try_get("symbol")?,
                side,
                entry_price: numeric(&row, "entry_price")?,
                exit_price: numeric(&row, "exit_price")?,
                size: numeric(&row, "size")?,
                pnl: numeric(&row, "pnl")?,
                pnl_pct: numeric(&row, "pnl_pct")?,
                fees: numeric(&row, "fees")?,
                reason: row.try_get("reason")?,
                entry_time: row.try_get::<DateTime<Utc>, _>("entry_time")?,
                exit_time: row.try_get::<DateTime<Utc>, _>("exit_time")?,
            });
        }

        Ok(trades)
    }

    /// Delete all rows (testing only)
    #[cfg(test)]
    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM strategy_configs")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM trades").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for PostgresPersistence {
    /// Upsert the config row. Commits synchronously: the caller only
    /// acknowledges a start request after this returns.
    async fn save_config(&self, config: &StrategyConfig) -> Result<()> {
        let params_json = serde_json::to_string(&config.params)
            .map_err(|e| BotError::Config(format!("unserializable params: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO strategy_configs (symbol, mode, interval_secs, params, status, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (symbol) DO UPDATE SET
                mode = EXCLUDED.mode,
                interval_secs = EXCLUDED.interval_secs,
                params = EXCLUDED.params,
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                updated_at = NOW()
            "#,
        )
        .bind(&config.symbol)
        .bind(config.mode.as_str())
        .bind(config.interval_secs as i64)
        .bind(params_json)
        .bind(config.status.as_str())
        .bind(config.started_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved strategy config for {} to Postgres", config.symbol);

        Ok(())
    }

    async fn delete_config(&self, symbol: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM strategy_configs WHERE symbol = $1")
            .bind(symbol)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_running(&self) -> Result<Vec<StrategyConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, mode, interval_secs, params, status, started_at
            FROM strategy_configs
            WHERE status = 'running'
            ORDER BY symbol ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            let mode_str: String = row.try_get("mode")?;
            let mode = Mode::parse(&mode_str)
                .ok_or_else(|| decode_err("mode", format!("unknown mode: {mode_str}")))?;

            let status_str: String = row.try_get("status")?;
            let status = StrategyStatus::parse(&status_str)
                .ok_or_else(|| decode_err("status", format!("unknown status: {status_str}")))?;

            let params_json: String = row.try_get("params")?;
            let params = serde_json::from_str(&params_json)
                .map_err(|e| decode_err("params", format!("bad params json: {e}")))?;

            let interval_secs: i64 = row.try_get("interval_secs")?;

            configs.push(StrategyConfig {
                symbol: row.try_get("symbol")?,
                mode,
                interval_secs: interval_secs as u64,
                params,
                started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
                status,
            });
        }

        tracing::info!(
            "Loaded {} running strategy configs from Postgres",
            configs.len()
        );

        Ok(configs)
    }
}

#[async_trait]
impl TradeSink for PostgresPersistence {
    async fn append_trade(&self, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, symbol, side, entry_price, exit_price, size,
                pnl, pnl_pct, fees, reason, entry_time, exit_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(trade.id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.size)
        .bind(trade.pnl)
        .bind(trade.pnl_pct)
        .bind(trade.fees)
        .bind(&trade.reason)
        .bind(trade.entry_time)
        .bind(trade.exit_time)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Appended trade {} for {} to Postgres", trade.id, trade.symbol);

        Ok(())
    }
}
