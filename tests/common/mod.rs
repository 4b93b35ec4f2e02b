//! Shared test fixtures: a scriptable in-memory exchange and builders for
//! fills and configs.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use dca_grid_bot::db::models::BotConfig;
use dca_grid_bot::exchange::adapter::{Exchange, ExchangeError, ExchangeResult};
use dca_grid_bot::exchange::types::{
    Candle, ExchangeOrderStatus, Market, OrderKind, OrderSide, OrderUpdate, PlacedOrder, Ticker,
};

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

#[derive(Debug, Clone)]
pub struct PlacedRecord {
    pub id: String,
    pub symbol: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub amount: Decimal,
    pub price: Option<Decimal>,
}

/// Channel-driven exchange double. Balances, candles, and per-order
/// statuses are scripted by the test; placements and cancels are recorded.
pub struct MockExchange {
    pub market: Market,
    pub free_balances: Mutex<HashMap<String, Decimal>>,
    pub ticker_price: Mutex<Decimal>,
    pub candles: Mutex<Vec<Candle>>,
    pub open_orders: Mutex<Vec<OrderUpdate>>,
    pub order_statuses: Mutex<HashMap<String, OrderUpdate>>,
    pub placed: Mutex<Vec<PlacedRecord>>,
    pub canceled: Mutex<Vec<String>>,
    pub fail_next_create: Mutex<Option<ExchangeError>>,
    next_id: AtomicU64,
}

impl MockExchange {
    pub fn eth_usdt() -> Self {
        Self {
            market: Market {
                symbol: "ETH/USDT".into(),
                amount_precision: 4,
                price_precision: 2,
                min_notional: Some(dec("5")),
                taker_fee: Some(dec("0.001")),
            },
            free_balances: Mutex::new(HashMap::new()),
            ticker_price: Mutex::new(dec("3000")),
            candles: Mutex::new(Vec::new()),
            open_orders: Mutex::new(Vec::new()),
            order_statuses: Mutex::new(HashMap::new()),
            placed: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            fail_next_create: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_balance(&self, currency: &str, amount: Decimal) {
        self.free_balances
            .lock()
            .unwrap()
            .insert(currency.to_string(), amount);
    }

    pub fn set_order_status(&self, update: OrderUpdate) {
        self.order_statuses
            .lock()
            .unwrap()
            .insert(update.id.clone(), update);
    }

    pub fn placed_orders(&self) -> Vec<PlacedRecord> {
        self.placed.lock().unwrap().clone()
    }

    pub fn canceled_orders(&self) -> Vec<String> {
        self.canceled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn fetch_free_balance(&self) -> ExchangeResult<HashMap<String, Decimal>> {
        Ok(self.free_balances.lock().unwrap().clone())
    }

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: *self.ticker_price.lock().unwrap(),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: &str,
        _limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        Ok(self.candles.lock().unwrap().clone())
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderUpdate> {
        self.order_statuses
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .map_or_else(
                || {
                    Ok(OrderUpdate {
                        id: order_id.to_string(),
                        symbol: symbol.to_string(),
                        status: ExchangeOrderStatus::Open,
                        side: OrderSide::Sell,
                        kind: OrderKind::Limit,
                        price: None,
                        average: None,
                        amount: Decimal::ZERO,
                        filled: Decimal::ZERO,
                        remaining: Decimal::ZERO,
                        cost: None,
                        fee: None,
                    })
                },
                Ok,
            )
    }

    async fn fetch_open_orders(&self, _symbol: &str) -> ExchangeResult<Vec<OrderUpdate>> {
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn create_order(
        &self,
        symbol: &str,
        kind: OrderKind,
        side: OrderSide,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> ExchangeResult<PlacedOrder> {
        if let Some(err) = self.fail_next_create.lock().unwrap().take() {
            return Err(err);
        }

        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.placed.lock().unwrap().push(PlacedRecord {
            id: id.clone(),
            symbol: symbol.to_string(),
            kind,
            side,
            amount,
            price,
        });
        Ok(PlacedOrder {
            id,
            status: ExchangeOrderStatus::Open,
            average: None,
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> ExchangeResult<()> {
        self.canceled.lock().unwrap().push(order_id.to_string());
        Ok(())
    }

    async fn market(&self, _symbol: &str) -> ExchangeResult<Market> {
        Ok(self.market.clone())
    }

    async fn watch_orders(&self, _symbol: &str) -> ExchangeResult<mpsc::Receiver<OrderUpdate>> {
        let (_tx, rx) = mpsc::channel(8);
        Ok(rx)
    }

    async fn watch_ticker(&self, _symbol: &str) -> ExchangeResult<mpsc::Receiver<Ticker>> {
        let (_tx, rx) = mpsc::channel(8);
        Ok(rx)
    }

    async fn close(&self) {}
}

pub fn test_config() -> BotConfig {
    BotConfig {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        is_active: true,
        api_key: String::new(),
        api_secret: String::new(),
        symbol: "ETH/USDT".into(),
        total_budget: dec("100"),
        grid_levels: 5,
        grid_length_pct: dec("5"),
        first_order_offset_pct: dec("0.5"),
        volume_scale_pct: dec("40"),
        grid_shift_threshold_pct: dec("0.6"),
        take_profit_pct: dec("1.2"),
        trailing_enabled: true,
        trailing_callback_pct: dec("0.8"),
        trailing_min_profit_pct: dec("1.0"),
    }
}

pub fn buy_fill(id: &str, amount: &str, price: &str, cost: &str) -> OrderUpdate {
    OrderUpdate {
        id: id.to_string(),
        symbol: "ETH/USDT".into(),
        status: ExchangeOrderStatus::Closed,
        side: OrderSide::Buy,
        kind: OrderKind::Limit,
        price: Some(dec(price)),
        average: Some(dec(price)),
        amount: dec(amount),
        filled: dec(amount),
        remaining: Decimal::ZERO,
        cost: Some(dec(cost)),
        fee: None,
    }
}

pub fn sell_fill(id: &str, amount: &str, price: &str, cost: &str) -> OrderUpdate {
    OrderUpdate {
        side: OrderSide::Sell,
        ..buy_fill(id, amount, price, cost)
    }
}
