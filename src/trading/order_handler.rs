use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::constants::MIN_PROFIT_CHECK_RATIO;
use crate::db::models::{BotConfig, DcaCycle, Order, OrderStatus, OrderType};
use crate::db::{repository, Database};
use crate::errors::{BotError, Result};
use crate::exchange::types::{split_symbol, Market, OrderKind, OrderSide, OrderUpdate};
use crate::exchange::{Exchange, ExchangeError};
use crate::trading::balance::BalanceValidator;
use crate::trading::dust::DustManager;
use crate::trading::fees::FeeCalculator;
use crate::trading::tp::TakeProfitCalculator;
use crate::trading::types::CycleStats;

/// What a processed fill means for the supervisor.
#[derive(Debug)]
pub enum FillOutcome {
    /// Duplicate, unknown, or not-yet-filled delivery; nothing changed.
    Ignored,
    /// A safety buy was absorbed; the cycle continues.
    BuyProcessed,
    /// The take-profit filled; the cycle is closed and a new one should be
    /// started for this config.
    CycleClosed { config: BotConfig },
}

/// Reacts to fill events: updates the cycle, rotates the TP order, places
/// the next safety rung, and closes the cycle when the TP fills.
///
/// Every invocation runs in a single database transaction. The fill row is
/// locked `FOR UPDATE`, so a redelivery of the same event blocks until the
/// first handler commits and then hits the `FILLED` early-return.
pub struct OrderLifecycle {
    db: Database,
    exchange: Arc<dyn Exchange>,
}

impl OrderLifecycle {
    pub fn new(db: Database, exchange: Arc<dyn Exchange>) -> Self {
        Self { db, exchange }
    }

    pub async fn handle_fill(&self, update: &OrderUpdate) -> Result<FillOutcome> {
        if update.id.is_empty() {
            warn!("Fill event without an order id, skipping");
            return Ok(FillOutcome::Ignored);
        }

        info!("Processing fill for exchange order {}", update.id);
        let mut tx = self.db.pool().begin().await?;

        let order = match repository::lock_order_by_exchange_id(&mut tx, &update.id).await? {
            Some(order) => order,
            None => match repository::find_cycle_by_tp_order(&mut tx, &update.id).await? {
                Some(cycle) => {
                    // The TP reached the exchange but its local row was lost
                    // before commit; rebuild it and continue.
                    warn!(
                        "TP order {} known only via cycle {}, synthesizing order row",
                        update.id, cycle.id
                    );
                    let amount = if update.amount > Decimal::ZERO {
                        update.amount
                    } else {
                        cycle.total_base_qty
                    };
                    repository::insert_order(
                        &mut tx,
                        cycle.id,
                        Some(&update.id),
                        OrderType::SellTp,
                        -1,
                        update.effective_price().unwrap_or(Decimal::ZERO),
                        amount,
                        OrderStatus::Active,
                    )
                    .await?
                }
                None => {
                    error!(
                        "Order {} not found locally and not a tracked TP, dropping event",
                        update.id
                    );
                    return Ok(FillOutcome::Ignored);
                }
            },
        };

        if order.status == OrderStatus::Filled {
            info!("Order {} already processed, skipping redelivery", update.id);
            return Ok(FillOutcome::Ignored);
        }

        let cycle = repository::get_cycle(&mut tx, order.cycle_id)
            .await?
            .ok_or_else(|| BotError::not_found(format!("cycle {}", order.cycle_id)))?;
        let config = repository::get_config(&mut tx, cycle.config_id)
            .await?
            .ok_or_else(|| BotError::not_found(format!("config {}", cycle.config_id)))?;

        match order.order_type {
            OrderType::BuySafety => {
                self.handle_buy_fill(&mut tx, &order, &cycle, &config, update)
                    .await?;
                tx.commit().await?;
                Ok(FillOutcome::BuyProcessed)
            }
            OrderType::SellTp => {
                self.handle_tp_fill(&mut tx, &order, &cycle, &config, update)
                    .await?;
                tx.commit().await?;
                Ok(FillOutcome::CycleClosed { config })
            }
        }
    }

    async fn handle_buy_fill(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
        cycle: &DcaCycle,
        config: &BotConfig,
        update: &OrderUpdate,
    ) -> Result<()> {
        info!(
            "Buy fill: order {} (rung {}) for cycle {}",
            order.id, order.order_index, cycle.id
        );
        repository::update_order_status(&mut *tx, order.id, OrderStatus::Filled).await?;

        let market = self.exchange.market(&config.symbol).await?;
        let fill = FeeCalculator::fill_result(update, &config.symbol, order.price, market.taker_fee);

        let total_base_qty = cycle.total_base_qty + fill.net_qty;
        let total_quote_spent = cycle.total_quote_spent + fill.order_cost;
        let avg_price = if total_base_qty > Decimal::ZERO {
            total_quote_spent / total_base_qty
        } else {
            Decimal::ZERO
        };
        let stats = CycleStats {
            total_base_qty,
            total_quote_spent,
            avg_price,
        };
        repository::update_cycle_stats(&mut *tx, cycle.id, total_base_qty, total_quote_spent, avg_price)
            .await?;
        info!(
            "Cycle {} updated: base_qty={}, quote_spent={}, avg_price={}",
            cycle.id, total_base_qty, total_quote_spent, avg_price
        );

        if let Some(tp_id) = &cycle.current_tp_order_id {
            match self.exchange.cancel_order(tp_id, &config.symbol).await {
                Ok(()) => {
                    repository::update_order_status_by_exchange_id(
                        &mut *tx,
                        tp_id,
                        OrderStatus::Canceled,
                    )
                    .await?;
                    info!("Old TP order {} canceled", tp_id);
                }
                Err(e) => error!("Failed to cancel old TP {}: {}", tp_id, e),
            }
        }

        // Anything past this point is cycle progression; a failure here must
        // not roll back the fill bookkeeping above. The grid resumes on the
        // next fill or after a grid shift.
        match self
            .progress_after_buy(tx, order, cycle, config, &stats, &market)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if Self::aborts_progression_only(&e) => {
                match &e {
                    BotError::MinNotional(msg) => {
                        warn!("TP postponed, below minimum notional: {}", msg)
                    }
                    BotError::Exchange(ExchangeError::InsufficientFunds(msg)) => error!(
                        "Insufficient funds after a passed balance check — severe anomaly: {}",
                        msg
                    ),
                    other => error!("Cycle progression aborted: {}", other),
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Errors that stop this fill's onward progression but keep the
    /// already-persisted cycle updates.
    fn aborts_progression_only(e: &BotError) -> bool {
        matches!(
            e,
            BotError::InsufficientBalance(_)
                | BotError::BalanceDeviation(_)
                | BotError::MinNotional(_)
                | BotError::OrderCreation(_)
                | BotError::Exchange(_)
        )
    }

    /// Replaces the TP at the new average and arms the next rung.
    async fn progress_after_buy(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
        cycle: &DcaCycle,
        config: &BotConfig,
        stats: &CycleStats,
        market: &Market,
    ) -> Result<()> {
        let (base_currency, _) = split_symbol(&config.symbol);

        let free = self.exchange.fetch_free_balance().await?;
        let available = free.get(&base_currency).copied().unwrap_or(Decimal::ZERO);

        let check = BalanceValidator::validate_for_sell(available, stats.total_base_qty)?;

        let dust = DustManager::split(
            check.amount_to_sell,
            cycle.accumulated_dust,
            market.amount_precision,
        );
        repository::update_cycle_dust(&mut *tx, cycle.id, dust.new_dust).await?;

        if dust.sellable <= Decimal::ZERO {
            return Err(BotError::insufficient_balance(
                "Sellable amount is zero after precision truncation",
            ));
        }

        let tp = TakeProfitCalculator::calculate(
            stats,
            config.take_profit_pct,
            market.amount_precision,
            market.price_precision,
        );

        if !self
            .exchange
            .check_min_notional(&config.symbol, dust.sellable, tp.tp_price)
            .await?
        {
            return Err(BotError::min_notional(format!(
                "TP {} x {} = {}",
                dust.sellable,
                tp.tp_price,
                dust.sellable * tp.tp_price
            )));
        }

        let placed = self
            .exchange
            .create_order(
                &config.symbol,
                OrderKind::Limit,
                OrderSide::Sell,
                dust.sellable,
                Some(tp.tp_price),
            )
            .await
            .map_err(|e| match e {
                ExchangeError::Network(msg) => {
                    BotError::order_creation(format!("network: {}", msg))
                }
                ExchangeError::InvalidOrder(msg) => {
                    BotError::order_creation(format!("invalid order: {}", msg))
                }
                other => BotError::Exchange(other),
            })?;

        repository::set_cycle_tp(&mut *tx, cycle.id, Some(&placed.id), Some(tp.tp_price)).await?;
        repository::insert_order(
            &mut *tx,
            cycle.id,
            Some(&placed.id),
            OrderType::SellTp,
            -1,
            tp.tp_price,
            dust.sellable,
            OrderStatus::Active,
        )
        .await?;
        info!(
            "TP order created: exchange_id={}, price={}, amount={}, effective_tp={:.2}%",
            placed.id, tp.tp_price, dust.sellable, tp.effective_tp_pct
        );

        self.place_next_safety_order(tx, cycle, order.order_index + 1, config)
            .await?;

        Ok(())
    }

    /// Places the next rung of the ladder, if one exists and clears the
    /// minimum notional. Placement failures are logged and skipped; the
    /// grid catches up on a later fill or shift.
    async fn place_next_safety_order(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        cycle: &DcaCycle,
        next_index: i32,
        config: &BotConfig,
    ) -> Result<()> {
        let Some(next) =
            repository::find_safety_order_at_index(&mut *tx, cycle.id, next_index).await?
        else {
            info!("No safety order at rung {}, ladder exhausted", next_index);
            return Ok(());
        };

        let amount = self
            .exchange
            .amount_to_precision(&config.symbol, next.amount)
            .await?;
        let price = self
            .exchange
            .price_to_precision(&config.symbol, next.price)
            .await?;

        if !self
            .exchange
            .check_min_notional(&config.symbol, amount, price)
            .await?
        {
            warn!(
                "Next rung {} too small (amount={}, price={}), skipping",
                next_index, amount, price
            );
            return Ok(());
        }

        match self
            .exchange
            .create_order(&config.symbol, OrderKind::Limit, OrderSide::Buy, amount, Some(price))
            .await
        {
            Ok(placed) => {
                repository::activate_order(&mut *tx, next.id, &placed.id).await?;
                info!(
                    "Next safety order placed: rung={}, exchange_id={}",
                    next_index, placed.id
                );
            }
            Err(e) => error!("Failed to place next safety order: {}", e),
        }

        Ok(())
    }

    async fn handle_tp_fill(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
        cycle: &DcaCycle,
        config: &BotConfig,
        update: &OrderUpdate,
    ) -> Result<()> {
        repository::update_order_status(&mut *tx, order.id, OrderStatus::Filled).await?;

        for open_order in repository::find_active_orders(&mut *tx, cycle.id).await? {
            if open_order.id == order.id {
                continue;
            }
            let Some(exchange_id) = &open_order.exchange_order_id else {
                continue;
            };
            match self.exchange.cancel_order(exchange_id, &config.symbol).await {
                Ok(()) => {
                    repository::update_order_status(&mut *tx, open_order.id, OrderStatus::Canceled)
                        .await?
                }
                Err(e) => error!("Failed to cancel order {}: {}", exchange_id, e),
            }
        }

        let (gross, fee) = FeeCalculator::sell_proceeds(update, &config.symbol);
        let gross = if gross > Decimal::ZERO {
            gross
        } else {
            warn!("Sell cost missing from exchange, reconstructing from order row");
            order.price * order.amount
        };

        let received = gross - fee;
        let profit = received - cycle.total_quote_spent;

        repository::close_cycle(&mut *tx, cycle.id, profit, Utc::now()).await?;

        let actual_profit_pct = if cycle.total_quote_spent > Decimal::ZERO {
            profit / cycle.total_quote_spent * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        let expected_min_pct = config.take_profit_pct * MIN_PROFIT_CHECK_RATIO;

        if actual_profit_pct < expected_min_pct {
            // Profit is profit; the cycle stays closed, this is for the operator.
            error!(
                "ANOMALY: cycle {} closed with {:.2}% profit, expected at least {:.2}% \
                 (spent={}, received={}, avg_price={}, tp_price={})",
                cycle.id,
                actual_profit_pct,
                expected_min_pct,
                cycle.total_quote_spent,
                received,
                cycle.avg_price,
                order.price
            );
        }

        info!(
            "💰 Cycle {} closed: received={} (gross={}, fee={}), spent={}, profit={} ({:.2}%)",
            cycle.id, received, gross, fee, cycle.total_quote_spent, profit, actual_profit_pct
        );

        Ok(())
    }
}
