use thiserror::Error;

/// Error taxonomy for the bot.
///
/// Classification drives retry behavior: `Transient` failures are retried
/// with bounded backoff, `ExchangeRejected` is surfaced immediately, and
/// `DataUnavailable` skips the current tick.
#[derive(Debug, Error)]
pub enum BotError {
    /// Market data feed failure. The tick is skipped and retried on the
    /// next interval.
    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    /// The exchange refused the request (bad params, insufficient margin,
    /// price too close to mark). Never retried blindly.
    #[error("exchange rejected request: {0}")]
    ExchangeRejected(String),

    /// Timeout, rate limit, or connection failure. Retried with backoff up
    /// to the executor's retry bound.
    #[error("transient exchange failure: {0}")]
    Transient(String),

    /// An order was built without an explicit position side tag.
    #[error("order missing explicit position side tag")]
    PositionModeMismatch,

    /// Durable-store failure. Fatal for the triggering start/stop request.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BotError {
    /// True for failures worth another attempt after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, BotError::Transient(_))
    }
}

impl From<sqlx::Error> for BotError {
    fn from(e: sqlx::Error) -> Self {
        BotError::Persistence(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BotError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        BotError::Persistence(format!("migration: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
