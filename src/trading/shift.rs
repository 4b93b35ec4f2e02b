use rust_decimal::Decimal;
use std::time::Instant;
use tracing::{info, warn};

use crate::constants::GRID_SHIFT_INTERVAL_SECS;
use crate::db::models::{BotConfig, DcaCycle, OrderStatus, OrderType};
use crate::db::{repository, Database};
use crate::errors::{BotError, Result};
use crate::exchange::types::{OrderKind, OrderSide};
use crate::exchange::Exchange;
use crate::trading::grid::{calculate_grid, GridInput};

/// Cancels and rebuilds the unfilled grid when price drifts upward far
/// enough that the ladder would never be reached.
pub struct GridShifter {
    last_shift: Option<Instant>,
}

impl Default for GridShifter {
    fn default() -> Self {
        Self::new()
    }
}

impl GridShifter {
    pub fn new() -> Self {
        Self { last_shift: None }
    }

    /// Evaluates one ticker price and shifts the grid when warranted.
    /// Returns `true` when a shift was performed.
    pub async fn maybe_shift(
        &mut self,
        db: &Database,
        exchange: &dyn Exchange,
        config: &BotConfig,
        current_price: Decimal,
    ) -> Result<bool> {
        if let Some(at) = self.last_shift {
            if at.elapsed().as_secs() < GRID_SHIFT_INTERVAL_SECS {
                return Ok(false);
            }
        }

        let Some(cycle) = db.find_open_cycle(config.id).await? else {
            return Ok(false);
        };

        let rung0 = {
            let mut conn = db.pool().acquire().await?;
            repository::find_safety_order_at_index(&mut conn, cycle.id, 0).await?
        };
        let Some(rung0) = rung0 else {
            return Ok(false);
        };
        if rung0.status == OrderStatus::Filled {
            return Ok(false);
        }

        let reference = cycle.initial_first_order_price.unwrap_or(rung0.price);
        if reference <= Decimal::ZERO {
            return Ok(false);
        }

        let ideal_entry = current_price
            * (Decimal::ONE - config.first_order_offset_pct / Decimal::ONE_HUNDRED);
        let drift_pct = (ideal_entry - reference) / reference * Decimal::ONE_HUNDRED;

        if drift_pct < config.grid_shift_threshold_pct {
            return Ok(false);
        }

        info!(
            "Grid shift: ideal entry {} is {:.2}% above reference {} (threshold {}%)",
            ideal_entry, drift_pct, reference, config.grid_shift_threshold_pct
        );

        self.shift_grid(db, exchange, &cycle, config, current_price)
            .await?;
        self.last_shift = Some(Instant::now());
        Ok(true)
    }

    /// The shift itself, in one transaction: cancel the unfilled ladder,
    /// delete its rows, insert the recomputed grid, place the new rung 0.
    /// Any exchange error on placement rolls everything back.
    async fn shift_grid(
        &self,
        db: &Database,
        exchange: &dyn Exchange,
        cycle: &DcaCycle,
        config: &BotConfig,
        current_price: Decimal,
    ) -> Result<()> {
        let mut tx = db.pool().begin().await?;

        for order in repository::find_open_safety_orders(&mut tx, cycle.id).await? {
            if let Some(exchange_id) = &order.exchange_order_id {
                if let Err(e) = exchange.cancel_order(exchange_id, &config.symbol).await {
                    warn!("Could not cancel order {}: {}", exchange_id, e);
                }
            }
            repository::clear_order_exchange_id(&mut tx, order.id, OrderStatus::Canceled).await?;
        }

        let deleted = repository::delete_unfilled_safety_orders(&mut tx, cycle.id).await?;
        info!("Removed {} unfilled safety rows for reconstruction", deleted);

        let market = exchange.market(&config.symbol).await?;
        let grid = calculate_grid(&GridInput {
            current_price,
            total_budget: config.total_budget,
            grid_levels: config.grid_levels as u32,
            grid_length_pct: config.grid_length_pct,
            first_order_offset_pct: config.first_order_offset_pct,
            volume_scale_pct: config.volume_scale_pct,
            amount_precision: market.amount_precision,
            price_precision: market.price_precision,
        })?;

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

        let amount = exchange
            .amount_to_precision(&config.symbol, first.amount)
            .await?;
        let price = exchange.price_to_precision(&config.symbol, first.price).await?;

        if !exchange
            .check_min_notional(&config.symbol, amount, price)
            .await?
        {
            return Err(BotError::min_notional(format!(
                "rung 0 after shift: {} x {}",
                amount, price
            )));
        }

        let placed = exchange
            .create_order(&config.symbol, OrderKind::Limit, OrderSide::Buy, amount, Some(price))
            .await?;

        repository::activate_order(&mut tx, first.id, &placed.id).await?;
        repository::set_cycle_initial_price(&mut tx, cycle.id, first.price).await?;

        tx.commit().await?;
        info!(
            "Grid shifted for cycle {}: new rung 0 at {} (exchange id {})",
            cycle.id, first.price, placed.id
        );
        Ok(())
    }
}
