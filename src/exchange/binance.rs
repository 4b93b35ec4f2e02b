use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::exchange::adapter::{Exchange, ExchangeError, ExchangeResult};
use crate::exchange::types::{
    Candle, ExchangeOrderStatus, Fee, Market, OrderKind, OrderSide, OrderUpdate, PlacedOrder,
    Ticker,
};

const PROD_REST: &str = "https://api.binance.com";
const PROD_WS: &str = "wss://stream.binance.com:9443";
const SANDBOX_REST: &str = "https://testnet.binance.vision";
const SANDBOX_WS: &str = "wss://stream.testnet.binance.vision";

const LISTEN_KEY_KEEPALIVE_SECS: u64 = 1800;
const STREAM_CHANNEL_CAPACITY: usize = 256;

type HmacSha256 = Hmac<Sha256>;

/// Authenticated Binance spot session: signed REST plus user-data and
/// ticker WebSocket streams. One instance per bot.
pub struct BinanceClient {
    api_key: String,
    api_secret: String,
    http: reqwest::Client,
    rest_base: String,
    ws_base: String,
    markets: RwLock<HashMap<String, Market>>,
    shutdown_tx: watch::Sender<bool>,
}

impl BinanceClient {
    pub fn new(api_key: String, api_secret: String, sandbox: bool) -> Self {
        let (rest_base, ws_base) = if sandbox {
            (SANDBOX_REST, SANDBOX_WS)
        } else {
            (PROD_REST, PROD_WS)
        };

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            api_key,
            api_secret,
            http: reqwest::Client::new(),
            rest_base: rest_base.to_string(),
            ws_base: ws_base.to_string(),
            markets: RwLock::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// "ETH/USDT" -> "ETHUSDT"
    fn market_id(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        params.push(("timestamp".into(), Utc::now().timestamp_millis().to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: Option<String>,
        signed: bool,
    ) -> ExchangeResult<Value> {
        let mut url = format!("{}{}", self.rest_base, path);
        if let Some(q) = &query {
            url = format!("{}?{}", url, q);
        }

        let mut req = self.http.request(method, &url);
        if signed {
            req = req.header("X-MBX-APIKEY", &self.api_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::categorize_error(&body, status));
        }

        Ok(body)
    }

    fn categorize_error(body: &Value, status: reqwest::StatusCode) -> ExchangeError {
        let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
        let msg = body
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("unknown exchange error")
            .to_string();

        match code {
            -2010 | -2018 | -2019 => ExchangeError::InsufficientFunds(msg),
            -1013 | -1111 | -1121 | -2011 | -2013 => ExchangeError::InvalidOrder(msg),
            _ if status.is_server_error() => ExchangeError::Network(msg),
            _ => ExchangeError::Other(format!("code {}: {}", code, msg)),
        }
    }

    fn parse_decimal(value: &Value) -> Decimal {
        value
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO)
    }

    fn parse_status(status: &str) -> ExchangeOrderStatus {
        match status {
            "NEW" | "PARTIALLY_FILLED" | "PENDING_NEW" => ExchangeOrderStatus::Open,
            "FILLED" => ExchangeOrderStatus::Closed,
            "CANCELED" | "PENDING_CANCEL" => ExchangeOrderStatus::Canceled,
            "REJECTED" => ExchangeOrderStatus::Rejected,
            _ => ExchangeOrderStatus::Expired,
        }
    }

    /// REST order payload -> OrderUpdate. REST responses carry no fee; the
    /// fee calculator falls back to the market taker rate.
    fn parse_rest_order(symbol: &str, v: &Value) -> OrderUpdate {
        let amount = Self::parse_decimal(&v["origQty"]);
        let filled = Self::parse_decimal(&v["executedQty"]);
        let cost = Self::parse_decimal(&v["cummulativeQuoteQty"]);
        let average = if filled > Decimal::ZERO && cost > Decimal::ZERO {
            Some(cost / filled)
        } else {
            None
        };

        OrderUpdate {
            id: v["orderId"]
                .as_i64()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            symbol: symbol.to_string(),
            status: Self::parse_status(v["status"].as_str().unwrap_or("")),
            side: if v["side"].as_str() == Some("SELL") {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            kind: if v["type"].as_str() == Some("MARKET") {
                OrderKind::Market
            } else {
                OrderKind::Limit
            },
            price: Some(Self::parse_decimal(&v["price"])).filter(|p| *p > Decimal::ZERO),
            average,
            amount,
            filled,
            remaining: amount - filled,
            cost: Some(cost).filter(|c| *c > Decimal::ZERO),
            fee: None,
        }
    }

    /// User-data `executionReport` event -> OrderUpdate.
    fn parse_execution_report(symbol: &str, v: &Value) -> OrderUpdate {
        let amount = Self::parse_decimal(&v["q"]);
        let filled = Self::parse_decimal(&v["z"]);
        let cost = Self::parse_decimal(&v["Z"]);

        let fee_cost = Self::parse_decimal(&v["n"]);
        let fee = v["N"].as_str().filter(|_| fee_cost > Decimal::ZERO).map(|currency| Fee {
            cost: fee_cost,
            currency: currency.to_uppercase(),
        });

        OrderUpdate {
            id: v["i"].as_i64().map(|id| id.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            status: Self::parse_status(v["X"].as_str().unwrap_or("")),
            side: if v["S"].as_str() == Some("SELL") {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            kind: if v["o"].as_str() == Some("MARKET") {
                OrderKind::Market
            } else {
                OrderKind::Limit
            },
            price: Some(Self::parse_decimal(&v["p"])).filter(|p| *p > Decimal::ZERO),
            average: if filled > Decimal::ZERO && cost > Decimal::ZERO {
                Some(cost / filled)
            } else {
                None
            },
            amount,
            filled,
            remaining: amount - filled,
            cost: Some(cost).filter(|c| *c > Decimal::ZERO),
            fee,
        }
    }

    /// Decimal places implied by a filter step like "0.00010000".
    fn precision_from_step(step: &str) -> u32 {
        match Decimal::from_str(step) {
            Ok(d) if d > Decimal::ZERO => d.normalize().scale(),
            _ => 8,
        }
    }

    async fn create_listen_key(&self) -> ExchangeResult<String> {
        let body = self
            .request(reqwest::Method::POST, "/api/v3/userDataStream", None, true)
            .await?;
        body["listenKey"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::Other("userDataStream returned no listenKey".into()))
    }

    async fn keepalive_listen_key(&self, listen_key: &str) -> ExchangeResult<()> {
        self.request(
            reqwest::Method::PUT,
            "/api/v3/userDataStream",
            Some(format!("listenKey={}", listen_key)),
            true,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn fetch_free_balance(&self) -> ExchangeResult<HashMap<String, Decimal>> {
        let query = self.signed_query(vec![]);
        let body = self
            .request(reqwest::Method::GET, "/api/v3/account", Some(query), true)
            .await?;

        let mut balances = HashMap::new();
        if let Some(entries) = body["balances"].as_array() {
            for entry in entries {
                let free = Self::parse_decimal(&entry["free"]);
                if let Some(asset) = entry["asset"].as_str() {
                    balances.insert(asset.to_uppercase(), free);
                }
            }
        }
        Ok(balances)
    }

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/api/v3/ticker/price",
                Some(format!("symbol={}", Self::market_id(symbol))),
                false,
            )
            .await?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last: Self::parse_decimal(&body["price"]),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/api/v3/klines",
                Some(format!(
                    "symbol={}&interval={}&limit={}",
                    Self::market_id(symbol),
                    timeframe,
                    limit
                )),
                false,
            )
            .await?;

        let mut candles = Vec::new();
        if let Some(rows) = body.as_array() {
            for row in rows {
                let ts = row[0].as_i64().unwrap_or(0);
                candles.push(Candle {
                    timestamp: Utc.timestamp_millis_opt(ts).single().unwrap_or_else(Utc::now),
                    open: Self::parse_decimal(&row[1]),
                    high: Self::parse_decimal(&row[2]),
                    low: Self::parse_decimal(&row[3]),
                    close: Self::parse_decimal(&row[4]),
                    volume: Self::parse_decimal(&row[5]),
                });
            }
        }
        Ok(candles)
    }

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<OrderUpdate> {
        let query = self.signed_query(vec![
            ("symbol".into(), Self::market_id(symbol)),
            ("orderId".into(), order_id.to_string()),
        ]);
        let body = self
            .request(reqwest::Method::GET, "/api/v3/order", Some(query), true)
            .await?;
        Ok(Self::parse_rest_order(symbol, &body))
    }

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderUpdate>> {
        let query = self.signed_query(vec![("symbol".into(), Self::market_id(symbol))]);
        let body = self
            .request(reqwest::Method::GET, "/api/v3/openOrders", Some(query), true)
            .await?;

        Ok(body
            .as_array()
            .map(|rows| rows.iter().map(|v| Self::parse_rest_order(symbol, v)).collect())
            .unwrap_or_default())
    }

    async fn create_order(
        &self,
        symbol: &str,
        kind: OrderKind,
        side: OrderSide,
        amount: Decimal,
        price: Option<Decimal>,
    ) -> ExchangeResult<PlacedOrder> {
        let mut params = vec![
            ("symbol".into(), Self::market_id(symbol)),
            (
                "side".into(),
                match side {
                    OrderSide::Buy => "BUY".into(),
                    OrderSide::Sell => "SELL".into(),
                },
            ),
            ("quantity".into(), amount.normalize().to_string()),
        ];

        match kind {
            OrderKind::Limit => {
                let price = price
                    .ok_or_else(|| ExchangeError::InvalidOrder("limit order without price".into()))?;
                params.push(("type".into(), "LIMIT".into()));
                params.push(("timeInForce".into(), "GTC".into()));
                params.push(("price".into(), price.normalize().to_string()));
            }
            OrderKind::Market => params.push(("type".into(), "MARKET".into())),
        }

        let query = self.signed_query(params);
        let body = self
            .request(reqwest::Method::POST, "/api/v3/order", Some(query), true)
            .await?;

        let order = Self::parse_rest_order(symbol, &body);
        debug!("Order placed on exchange: id={} status={:?}", order.id, order.status);

        Ok(PlacedOrder {
            id: order.id,
            status: order.status,
            average: order.average,
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> ExchangeResult<()> {
        let query = self.signed_query(vec![
            ("symbol".into(), Self::market_id(symbol)),
            ("orderId".into(), order_id.to_string()),
        ]);
        self.request(reqwest::Method::DELETE, "/api/v3/order", Some(query), true)
            .await?;
        Ok(())
    }

    async fn market(&self, symbol: &str) -> ExchangeResult<Market> {
        {
            let markets = self.markets.read().await;
            if let Some(market) = markets.get(symbol) {
                return Ok(market.clone());
            }
        }

        let body = self
            .request(
                reqwest::Method::GET,
                "/api/v3/exchangeInfo",
                Some(format!("symbol={}", Self::market_id(symbol))),
                false,
            )
            .await?;

        let info = body["symbols"]
            .as_array()
            .and_then(|s| s.first())
            .ok_or_else(|| ExchangeError::Other(format!("unknown market {}", symbol)))?;

        let mut amount_precision = 8;
        let mut price_precision = 8;
        let mut min_notional = None;

        if let Some(filters) = info["filters"].as_array() {
            for filter in filters {
                match filter["filterType"].as_str() {
                    Some("LOT_SIZE") => {
                        amount_precision =
                            Self::precision_from_step(filter["stepSize"].as_str().unwrap_or(""));
                    }
                    Some("PRICE_FILTER") => {
                        price_precision =
                            Self::precision_from_step(filter["tickSize"].as_str().unwrap_or(""));
                    }
                    Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                        let min = Self::parse_decimal(&filter["minNotional"]);
                        if min > Decimal::ZERO {
                            min_notional = Some(min);
                        }
                    }
                    _ => {}
                }
            }
        }

        let market = Market {
            symbol: symbol.to_string(),
            amount_precision,
            price_precision,
            min_notional,
            // Spot taker default; account-level discounts are ignored.
            taker_fee: Some(Decimal::new(1, 3)),
        };

        self.markets
            .write()
            .await
            .insert(symbol.to_string(), market.clone());

        Ok(market)
    }

    async fn watch_orders(&self, symbol: &str) -> ExchangeResult<mpsc::Receiver<OrderUpdate>> {
        let listen_key = self.create_listen_key().await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let ws_url = format!("{}/ws/{}", self.ws_base, listen_key);
        let symbol = symbol.to_string();
        let market_id = Self::market_id(&symbol);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Keepalive for the user-data stream; dies with the client.
        let keepalive_http = self.http.clone();
        let keepalive_url = format!("{}/api/v3/userDataStream", self.rest_base);
        let keepalive_key = self.api_key.clone();
        let keepalive_listen_key = listen_key.clone();
        let mut keepalive_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(LISTEN_KEY_KEEPALIVE_SECS));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let res = keepalive_http
                            .put(&keepalive_url)
                            .header("X-MBX-APIKEY", &keepalive_key)
                            .query(&[("listenKey", keepalive_listen_key.as_str())])
                            .send()
                            .await;
                        if let Err(e) = res {
                            warn!("listenKey keepalive failed: {}", e);
                        }
                    }
                    _ = keepalive_shutdown.changed() => break,
                }
            }
        });

        tokio::spawn(async move {
            loop {
                let stream = match connect_async(&ws_url).await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        error!("User-data stream connect failed for {}: {}", symbol, e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                info!("📡 User-data stream connected for {}", symbol);

                let (_, mut read) = stream.split();
                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    let Ok(event) = serde_json::from_str::<Value>(&text) else {
                                        continue;
                                    };
                                    if event["e"].as_str() != Some("executionReport")
                                        || event["s"].as_str() != Some(market_id.as_str())
                                    {
                                        continue;
                                    }
                                    let update = Self::parse_execution_report(&symbol, &event);
                                    if tx.send(update).await.is_err() {
                                        return;
                                    }
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("User-data stream error for {}: {}", symbol, e);
                                    break;
                                }
                                None => break,
                            }
                        }
                        _ = shutdown_rx.changed() => return,
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        Ok(rx)
    }

    async fn watch_ticker(&self, symbol: &str) -> ExchangeResult<mpsc::Receiver<Ticker>> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let ws_url = format!(
            "{}/ws/{}@miniTicker",
            self.ws_base,
            Self::market_id(symbol).to_lowercase()
        );
        let symbol = symbol.to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let stream = match connect_async(&ws_url).await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        error!("Ticker stream connect failed for {}: {}", symbol, e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                debug!("Ticker stream connected for {}", symbol);

                let (_, mut read) = stream.split();
                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    let Ok(event) = serde_json::from_str::<Value>(&text) else {
                                        continue;
                                    };
                                    let last = Self::parse_decimal(&event["c"]);
                                    if last <= Decimal::ZERO {
                                        continue;
                                    }
                                    let ticker = Ticker {
                                        symbol: symbol.clone(),
                                        last,
                                        timestamp: Utc::now(),
                                    };
                                    if tx.send(ticker).await.is_err() {
                                        return;
                                    }
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!("Ticker stream error for {}: {}", symbol, e);
                                    break;
                                }
                                None => break,
                            }
                        }
                        _ = shutdown_rx.changed() => return,
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        Ok(rx)
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
