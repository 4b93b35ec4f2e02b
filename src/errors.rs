use thiserror::Error;

use crate::exchange::adapter::ExchangeError;

pub type Result<T> = std::result::Result<T, BotError>;

/// Domain errors for the bot engine. The HTTP layer and loggers
/// pattern-match on these.
#[derive(Error, Debug)]
pub enum BotError {
    /// Free quote balance too low to start or continue a cycle.
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    /// Exchange free balance deviates critically from expected inventory.
    #[error("Balance deviation: {0}")]
    BalanceDeviation(String),

    /// Order placement failed on the exchange.
    #[error("Order creation failed: {0}")]
    OrderCreation(String),

    /// Order value below the exchange minimum notional.
    #[error("Below minimum notional: {0}")]
    MinNotional(String),

    /// Per-bot recovery failure at startup.
    #[error("Recovery failed: {0}")]
    Recovery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BotError {
    pub fn insufficient_balance(msg: impl Into<String>) -> Self {
        Self::InsufficientBalance(msg.into())
    }

    pub fn balance_deviation(msg: impl Into<String>) -> Self {
        Self::BalanceDeviation(msg.into())
    }

    pub fn order_creation(msg: impl Into<String>) -> Self {
        Self::OrderCreation(msg.into())
    }

    pub fn min_notional(msg: impl Into<String>) -> Self {
        Self::MinNotional(msg.into())
    }

    pub fn recovery(msg: impl Into<String>) -> Self {
        Self::Recovery(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
