use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::constants::{
    BUDGET_HEADROOM, CYCLE_RESTART_GRACE_MS, MIN_TRADING_AMOUNT, STREAM_RECONNECT_SECS,
};
use crate::db::models::{BotConfig, DcaCycle, OrderStatus, OrderType};
use crate::db::{repository, Database};
use crate::errors::{BotError, Result};
use crate::exchange::binance::BinanceClient;
use crate::exchange::types::{split_symbol, ExchangeOrderStatus, OrderKind, OrderSide};
use crate::exchange::Exchange;
use crate::trading::dust::DustManager;
use crate::trading::grid::{calculate_grid, GridInput};
use crate::trading::order_handler::{FillOutcome, OrderLifecycle};
use crate::trading::registry::{PriceCache, SupervisorRegistry};
use crate::trading::shift::GridShifter;
use crate::trading::trailing::{EmergencyReason, TrailingExit, TrailingMonitor};
use crate::trading::types::CycleStartReceipt;
use crate::utils::crypto::CredentialCipher;

/// Builds a per-bot authenticated exchange session from a stored config.
/// Bots never share a session.
pub trait ExchangeFactory: Send + Sync {
    fn create(&self, config: &BotConfig) -> Result<Arc<dyn Exchange>>;
}

/// Production factory: decrypts stored API credentials and opens a Binance
/// session against production or the sandbox.
pub struct BinanceSessionFactory {
    cipher: CredentialCipher,
    sandbox: bool,
}

impl BinanceSessionFactory {
    pub fn new(cipher: CredentialCipher, sandbox: bool) -> Self {
        Self { cipher, sandbox }
    }
}

impl ExchangeFactory for BinanceSessionFactory {
    fn create(&self, config: &BotConfig) -> Result<Arc<dyn Exchange>> {
        let api_key = self.cipher.decrypt(&config.api_key)?;
        let api_secret = self.cipher.decrypt(&config.api_secret)?;
        Ok(Arc::new(BinanceClient::new(api_key, api_secret, self.sandbox)))
    }
}

/// Entry point for starting, resuming, and stopping bots. Cheap to clone;
/// shared by the HTTP layer, recovery, and the supervisors themselves.
#[derive(Clone)]
pub struct BotEngine {
    db: Database,
    factory: Arc<dyn ExchangeFactory>,
    registry: SupervisorRegistry,
    price_cache: PriceCache,
}

impl BotEngine {
    pub fn new(db: Database, factory: Arc<dyn ExchangeFactory>) -> Self {
        Self {
            db,
            factory,
            registry: SupervisorRegistry::new(),
            price_cache: PriceCache::new(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &SupervisorRegistry {
        &self.registry
    }

    pub fn price_cache(&self) -> &PriceCache {
        &self.price_cache
    }

    /// A fresh authenticated session for this config, e.g. for recovery's
    /// reconciliation pass.
    pub fn exchange_for(&self, config: &BotConfig) -> Result<Arc<dyn Exchange>> {
        self.factory.create(config)
    }

    /// Opens a fresh cycle for a config: computes the grid, persists the
    /// cycle and its rungs, subscribes streams, and places rung 0.
    ///
    /// On any failure the transaction rolls back and the just-registered
    /// supervisor is torn down again.
    pub async fn start_first_cycle(&self, config: &BotConfig) -> Result<CycleStartReceipt> {
        let exchange = self.factory.create(config)?;

        match self.start_cycle_inner(config, exchange.clone()).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                if let Some(supervisor) = self.registry.remove(config.id).await {
                    supervisor.stop().await;
                } else {
                    exchange.close().await;
                }
                Err(e)
            }
        }
    }

    async fn start_cycle_inner(
        &self,
        config: &BotConfig,
        exchange: Arc<dyn Exchange>,
    ) -> Result<CycleStartReceipt> {
        if let Some(existing) = self.db.find_open_cycle(config.id).await? {
            return Err(BotError::validation(format!(
                "Config {} already has open cycle {}",
                config.id, existing.id
            )));
        }

        let (_, quote_currency) = split_symbol(&config.symbol);

        let free = exchange.fetch_free_balance().await?;
        let free_quote = free.get(&quote_currency).copied().unwrap_or(Decimal::ZERO);

        if free_quote < MIN_TRADING_AMOUNT {
            return Err(BotError::insufficient_balance(format!(
                "Minimum {} {} required, available {:.2}",
                MIN_TRADING_AMOUNT, quote_currency, free_quote
            )));
        }

        let effective_budget = if config.total_budget > free_quote {
            warn!(
                "Budget {} exceeds available {} {}, capping with 1% headroom",
                config.total_budget, free_quote, quote_currency
            );
            free_quote * BUDGET_HEADROOM
        } else {
            config.total_budget
        };

        let ticker = exchange.fetch_ticker(&config.symbol).await?;
        let market = exchange.market(&config.symbol).await?;

        let grid = calculate_grid(&GridInput {
            current_price: ticker.last,
            total_budget: effective_budget,
            grid_levels: config.grid_levels as u32,
            grid_length_pct: config.grid_length_pct,
            first_order_offset_pct: config.first_order_offset_pct,
            volume_scale_pct: config.volume_scale_pct,
            amount_precision: market.amount_precision,
            price_precision: market.price_precision,
        })?;

        info!(
            "Starting cycle for config {} with budget {:.2} {} (available {:.2})",
            config.id, effective_budget, quote_currency, free_quote
        );

        let mut tx = self.db.pool().begin().await?;
        let cycle = repository::insert_cycle(&mut tx, config.id).await?;

        let mut first = None;
        for rung in &grid {
            let row = repository::insert_order(
                &mut tx,
                cycle.id,
                None,
                OrderType::BuySafety,
                rung.index as i32,
                rung.price,
                rung.amount_base,
                OrderStatus::Pending,
            )
            .await?;
            if rung.index == 0 {
                first = Some(row);
            }
        }
        let first = first.ok_or_else(|| BotError::internal("grid produced no rung 0"))?;
        repository::set_cycle_initial_price(&mut tx, cycle.id, first.price).await?;

        // Subscribe streams before placing the order so the fill cannot
        // slip between placement and subscription.
        let supervisor = Arc::new(BotSupervisor::new(
            self.clone(),
            config.clone(),
            exchange.clone(),
        ));
        self.registry.add(config.id, supervisor.clone()).await;
        supervisor.spawn();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let amount = exchange
            .amount_to_precision(&config.symbol, first.amount)
            .await?;
        let price = exchange.price_to_precision(&config.symbol, first.price).await?;

        if !exchange
            .check_min_notional(&config.symbol, amount, price)
            .await?
        {
            return Err(BotError::min_notional(format!(
                "first order {} x {} below exchange minimum",
                amount, price
            )));
        }

        let placed = exchange
            .create_order(&config.symbol, OrderKind::Limit, OrderSide::Buy, amount, Some(price))
            .await?;

        repository::activate_order(&mut tx, first.id, &placed.id).await?;
        repository::set_config_active(&mut tx, config.id, true).await?;
        tx.commit().await?;

        info!(
            "🤖 First order placed: cycle={}, exchange_id={}, price={}",
            cycle.id, placed.id, first.price
        );

        Ok(CycleStartReceipt {
            cycle_id: cycle.id,
            first_exchange_id: placed.id,
        })
    }

    /// Attaches a supervisor to an already-open cycle (recovery path).
    pub async fn resume_bot(&self, config: &BotConfig) -> Result<()> {
        let exchange = self.factory.create(config)?;
        let supervisor = Arc::new(BotSupervisor::new(self.clone(), config.clone(), exchange));
        self.registry.add(config.id, supervisor.clone()).await;
        supervisor.spawn();
        Ok(())
    }

    /// User-initiated stop. Idempotent.
    pub async fn stop_bot(&self, config_id: Uuid) -> Result<()> {
        if let Some(supervisor) = self.registry.remove(config_id).await {
            supervisor.stop().await;
        }
        self.db.set_config_active(config_id, false).await?;
        info!("Bot stopped for config {}", config_id);
        Ok(())
    }
}

/// Long-lived per-bot task pair: one loop over order updates, one over
/// ticker updates, both serialized against themselves and canceled
/// together through a single shutdown signal.
pub struct BotSupervisor {
    engine: BotEngine,
    config: BotConfig,
    exchange: Arc<dyn Exchange>,
    shutdown_tx: watch::Sender<bool>,
}

impl BotSupervisor {
    pub fn new(engine: BotEngine, config: BotConfig, exchange: Arc<dyn Exchange>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engine,
            config,
            exchange,
            shutdown_tx,
        }
    }

    pub fn config_id(&self) -> Uuid {
        self.config.id
    }

    pub fn spawn(self: &Arc<Self>) {
        let orders = Arc::clone(self);
        tokio::spawn(async move { orders.watch_orders_loop().await });

        let ticker = Arc::clone(self);
        tokio::spawn(async move { ticker.watch_ticker_loop().await });

        info!(
            "Supervisor running for config {} ({})",
            self.config.id, self.config.symbol
        );
    }

    /// Cancels both loops at their next await point and closes the
    /// exchange session. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.exchange.close().await;
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn backoff(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(STREAM_RECONNECT_SECS)) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn watch_orders_loop(self: Arc<Self>) {
        let handler = OrderLifecycle::new(self.engine.db().clone(), self.exchange.clone());
        let mut shutdown = self.shutdown_tx.subscribe();

        while !self.is_stopped() {
            let mut stream = match self.exchange.watch_orders(&self.config.symbol).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("watch_orders subscription failed: {}", e);
                    self.backoff().await;
                    continue;
                }
            };
            debug!("watch_orders loop started for {}", self.config.symbol);

            loop {
                tokio::select! {
                    maybe_update = stream.recv() => {
                        let Some(update) = maybe_update else { break };

                        if !update.is_fill() {
                            debug!(
                                "Order {} update: status={:?}, filled={}/{}",
                                update.id, update.status, update.filled, update.amount
                            );
                            continue;
                        }

                        match handler.handle_fill(&update).await {
                            Ok(FillOutcome::CycleClosed { config }) => {
                                self.restart_cycle(config);
                                return;
                            }
                            Ok(_) => {}
                            Err(e) => error!(
                                "Fill handler failed (next delivery retries): {}",
                                e
                            ),
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }

            if self.is_stopped() {
                return;
            }
            warn!("Order stream ended for {}, reconnecting", self.config.symbol);
            self.backoff().await;
        }
    }

    /// Tears this supervisor down and starts the next cycle after a short
    /// grace period that lets the exchange release stream state.
    fn restart_cycle(&self, config: BotConfig) {
        let engine = self.engine.clone();
        let config_id = self.config.id;

        tokio::spawn(async move {
            if let Some(old) = engine.registry().remove(config_id).await {
                old.stop().await;
            }
            tokio::time::sleep(Duration::from_millis(CYCLE_RESTART_GRACE_MS)).await;

            match engine.start_first_cycle(&config).await {
                Ok(receipt) => info!(
                    "New cycle {} started for config {}",
                    receipt.cycle_id, config_id
                ),
                Err(e) => {
                    error!("Could not start next cycle for {}: {}", config_id, e);
                    if let Err(db_err) = engine.db().set_config_active(config_id, false).await {
                        error!("Could not deactivate config {}: {}", config_id, db_err);
                    }
                }
            }
        });
    }

    async fn watch_ticker_loop(self: Arc<Self>) {
        let mut shifter = GridShifter::new();
        let mut trailing = TrailingMonitor::new(&self.config);
        let mut shutdown = self.shutdown_tx.subscribe();

        while !self.is_stopped() {
            let mut stream = match self.exchange.watch_ticker(&self.config.symbol).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("watch_ticker subscription failed: {}", e);
                    self.backoff().await;
                    continue;
                }
            };
            debug!("watch_ticker loop started for {}", self.config.symbol);

            loop {
                tokio::select! {
                    maybe_ticker = stream.recv() => {
                        let Some(ticker) = maybe_ticker else { break };
                        let price = ticker.last;

                        self.engine.price_cache().set(&self.config.symbol, price).await;

                        if let Err(e) = shifter
                            .maybe_shift(self.engine.db(), self.exchange.as_ref(), &self.config, price)
                            .await
                        {
                            error!("Grid shift failed: {}", e);
                        }

                        if self.config.trailing_enabled {
                            if let Err(e) = self.trailing_tick(&mut trailing, price).await {
                                error!("Trailing monitor failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }

            if self.is_stopped() {
                return;
            }
            warn!("Ticker stream ended for {}, reconnecting", self.config.symbol);
            self.backoff().await;
        }
    }

    /// One trailing-TP step for a ticker price: activation confirmation
    /// while idle, then max tracking, the emergency monitor, and the
    /// normal callback exit while active.
    async fn trailing_tick(&self, trailing: &mut TrailingMonitor, price: Decimal) -> Result<()> {
        let Some(mut cycle) = self.engine.db().find_open_cycle(self.config.id).await? else {
            return Ok(());
        };
        trailing.sync_with_cycle(&cycle);

        if !cycle.trailing_active {
            if trailing.should_activate(&cycle, price) {
                let starting_max = TrailingMonitor::activation_max(&cycle, price);
                let mut conn = self.engine.db().pool().acquire().await?;
                repository::update_cycle_trailing_activation(
                    &mut conn,
                    cycle.id,
                    starting_max,
                    price,
                    chrono::Utc::now(),
                )
                .await?;
                trailing.on_activated(price);
                info!(
                    "📈 Trailing TP activated for cycle {}: price={}, starting max={}",
                    cycle.id, price, starting_max
                );
            }
            return Ok(());
        }

        match cycle.max_price_tracked {
            Some(max) if price > max => {
                let mut conn = self.engine.db().pool().acquire().await?;
                repository::update_cycle_max_price(&mut conn, cycle.id, price).await?;
                cycle.max_price_tracked = Some(price);
                debug!("New max for cycle {}: {} -> {}", cycle.id, max, price);
            }
            None => {
                let mut conn = self.engine.db().pool().acquire().await?;
                repository::update_cycle_max_price(&mut conn, cycle.id, price).await?;
                cycle.max_price_tracked = Some(price);
            }
            _ => {}
        }

        if let Some(reason) = trailing.check_emergency(&cycle, price) {
            self.execute_emergency_exit(&cycle, reason).await?;
            return Ok(());
        }

        let callback = trailing
            .adaptive_callback(self.exchange.as_ref(), &self.config.symbol)
            .await;
        if let Some(exit) = trailing.exit_decision(&cycle, price, callback) {
            self.execute_trailing_exit(trailing, &cycle, exit).await?;
        }

        Ok(())
    }

    /// Replaces the TP with a limit sell at the trailing exit price.
    /// Rate-limited, and skipped when the old TP already left the book
    /// (it may have filled concurrently with this tick).
    async fn execute_trailing_exit(
        &self,
        trailing: &mut TrailingMonitor,
        cycle: &DcaCycle,
        exit: TrailingExit,
    ) -> Result<()> {
        if !trailing.can_update_tp() {
            debug!("TP update rate-limited for cycle {}", cycle.id);
            return Ok(());
        }

        if let Some(tp_id) = &cycle.current_tp_order_id {
            match self.exchange.fetch_order(tp_id, &self.config.symbol).await {
                Ok(order) if order.status != ExchangeOrderStatus::Open => {
                    info!(
                        "Old TP {} is {:?}, skipping trailing update",
                        tp_id, order.status
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("Could not verify TP {} status, skipping update: {}", tp_id, e);
                    return Ok(());
                }
                _ => {}
            }
        }

        let (base_currency, _) = split_symbol(&self.config.symbol);
        let market = self.exchange.market(&self.config.symbol).await?;
        let free = self.exchange.fetch_free_balance().await?;
        let available = free.get(&base_currency).copied().unwrap_or(Decimal::ZERO);

        let amount_to_sell = if cycle.total_base_qty > Decimal::ZERO {
            available.min(cycle.total_base_qty)
        } else {
            available
        };
        let dust = DustManager::split(amount_to_sell, cycle.accumulated_dust, market.amount_precision);
        if dust.sellable <= Decimal::ZERO {
            warn!("Nothing sellable for trailing update on cycle {}", cycle.id);
            return Ok(());
        }

        let exit_price = self
            .exchange
            .price_to_precision(&self.config.symbol, exit.exit_price)
            .await?;

        let mut tx = self.engine.db().pool().begin().await?;

        if let Some(tp_id) = &cycle.current_tp_order_id {
            if let Err(e) = self.exchange.cancel_order(tp_id, &self.config.symbol).await {
                warn!("Could not cancel old TP {}: {}", tp_id, e);
            }
            repository::update_order_status_by_exchange_id(&mut tx, tp_id, OrderStatus::Canceled)
                .await?;
        }

        let placed = self
            .exchange
            .create_order(
                &self.config.symbol,
                OrderKind::Limit,
                OrderSide::Sell,
                dust.sellable,
                Some(exit_price),
            )
            .await?;

        repository::update_cycle_dust(&mut tx, cycle.id, dust.new_dust).await?;
        repository::set_cycle_tp(&mut tx, cycle.id, Some(&placed.id), Some(exit_price)).await?;
        repository::insert_order(
            &mut tx,
            cycle.id,
            Some(&placed.id),
            OrderType::SellTp,
            -1,
            exit_price,
            dust.sellable,
            OrderStatus::Active,
        )
        .await?;
        tx.commit().await?;

        trailing.mark_tp_updated();
        info!(
            "TP updated via trailing for cycle {}: price={}, amount={}, reason={}",
            cycle.id, exit_price, dust.sellable, exit.reason
        );
        Ok(())
    }

    /// Immediate market sell of the full free base amount.
    async fn execute_emergency_exit(
        &self,
        cycle: &DcaCycle,
        reason: EmergencyReason,
    ) -> Result<()> {
        error!(
            "🚨 EMERGENCY MARKET SELL for cycle {}: {}",
            cycle.id,
            reason.as_str()
        );

        if let Some(tp_id) = &cycle.current_tp_order_id {
            if let Err(e) = self.exchange.cancel_order(tp_id, &self.config.symbol).await {
                warn!("Could not cancel TP {} (possibly already filled): {}", tp_id, e);
            }
        }

        let (base_currency, _) = split_symbol(&self.config.symbol);
        let free = self.exchange.fetch_free_balance().await?;
        let available = free.get(&base_currency).copied().unwrap_or(Decimal::ZERO);

        if available <= Decimal::ZERO {
            error!("No free {} for emergency sell", base_currency);
            return Ok(());
        }

        let amount = self
            .exchange
            .amount_to_precision(&self.config.symbol, available)
            .await?;
        let placed = self
            .exchange
            .create_order(&self.config.symbol, OrderKind::Market, OrderSide::Sell, amount, None)
            .await?;

        let mut conn = self.engine.db().pool().acquire().await?;
        if let Some(tp_id) = &cycle.current_tp_order_id {
            repository::update_order_status_by_exchange_id(&mut conn, tp_id, OrderStatus::Canceled)
                .await?;
        }
        repository::mark_cycle_emergency_exit(
            &mut conn,
            cycle.id,
            reason.as_str(),
            chrono::Utc::now(),
        )
        .await?;

        info!(
            "Emergency sell complete for cycle {}: order {}, amount {}",
            cycle.id, placed.id, amount
        );
        Ok(())
    }
}
