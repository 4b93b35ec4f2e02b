use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Last-trade ticker for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Fee attached to a fill, in whatever currency the exchange charged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub cost: Decimal,
    pub currency: String,
}

/// Normalized order state as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeOrderStatus {
    Open,
    Closed,
    Canceled,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
}

/// An order snapshot delivered by the user-data stream or a REST fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub id: String,
    pub symbol: String,
    pub status: ExchangeOrderStatus,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: Option<Decimal>,
    /// Average fill price, when the exchange reports one.
    pub average: Option<Decimal>,
    pub amount: Decimal,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub cost: Option<Decimal>,
    pub fee: Option<Fee>,
}

impl OrderUpdate {
    /// Whether this delivery should be treated as a fill. The exchange
    /// occasionally reports a residual sub-1% remainder on a completed
    /// order, so near-complete fills count too.
    pub fn is_fill(&self) -> bool {
        if self.status == ExchangeOrderStatus::Closed {
            return true;
        }
        self.filled > Decimal::ZERO
            && self.amount > Decimal::ZERO
            && self.filled >= self.amount * Decimal::new(99, 2)
    }

    /// Fill price: average when present, else the limit price.
    pub fn effective_price(&self) -> Option<Decimal> {
        self.average.or(self.price)
    }

    /// Quote cost of the fill; reconstructed from price * filled when the
    /// exchange omits it.
    pub fn effective_cost(&self) -> Option<Decimal> {
        match self.cost {
            Some(c) if c > Decimal::ZERO => Some(c),
            _ => self.effective_price().map(|p| p * self.filled),
        }
    }
}

/// Result of placing an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub id: String,
    pub status: ExchangeOrderStatus,
    pub average: Option<Decimal>,
}

/// One OHLCV candle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Exchange metadata for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub symbol: String,
    pub amount_precision: u32,
    pub price_precision: u32,
    pub min_notional: Option<Decimal>,
    pub taker_fee: Option<Decimal>,
}

/// Splits a `BASE/QUOTE` symbol into its currencies.
pub fn split_symbol(symbol: &str) -> (String, String) {
    match symbol.split_once('/') {
        Some((base, quote)) => (base.to_uppercase(), quote.to_uppercase()),
        None => (symbol.to_uppercase(), String::new()),
    }
}
