use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::exchange::types::{
    Candle, Market, OrderKind, OrderSide, OrderUpdate, PlacedOrder, Ticker,
};
use crate::utils::precision::{round_to_precision, truncate_to_precision};

/// Exchange failures, categorized the way the fill handler reacts to them.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("{0}")]
    Other(String),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Capability interface over a centralized exchange.
///
/// Each bot owns its own authenticated session; implementations must be
/// cancel-safe at every await point and must not leak connections when a
/// stream receiver is dropped.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Free balance per currency.
    async fn fetch_free_balance(&self) -> ExchangeResult<HashMap<String, Decimal>>;

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderUpdate>;

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderUpdate>>;

    async fn create_order(
        &self,
        symbol: &str,
        kind: OrderKind,
        side: OrderSide,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> ExchangeResult<PlacedOrder>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<()>;

    /// Exchange metadata for a symbol (precision, minimum notional, fees).
    async fn market(&self, symbol: &str) -> ExchangeResult<Market>;

    /// Lazily-connected stream of order updates for a symbol.
    async fn watch_orders(&self, symbol: &str) -> ExchangeResult<mpsc::Receiver<OrderUpdate>>;

    /// Lazily-connected stream of ticker updates for a symbol.
    async fn watch_ticker(&self, symbol: &str) -> ExchangeResult<mpsc::Receiver<Ticker>>;

    /// Releases sessions and background stream tasks. Idempotent.
    async fn close(&self);

    /// Truncates an amount to the symbol's precision (round-down).
    async fn amount_to_precision(&self, symbol: &str, amount: Decimal) -> ExchangeResult<Decimal> {
        let market = self.market(symbol).await?;
        Ok(truncate_to_precision(amount, market.amount_precision))
    }

    /// Rounds a price to the symbol's precision.
    async fn price_to_precision(&self, symbol: &str, price: Decimal) -> ExchangeResult<Decimal> {
        let market = self.market(symbol).await?;
        Ok(round_to_precision(price, market.price_precision))
    }

    /// Whether `amount * price` satisfies the exchange minimum order value.
    async fn check_min_notional(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Decimal,
    ) -> ExchangeResult<bool> {
        let market = self.market(symbol).await?;
        match market.min_notional {
            Some(min) if min > Decimal::ZERO => Ok(amount * price >= min),
            _ => Ok(true),
        }
    }
}
