//! Queries for the bot engine. Pool-level reads live on [`Database`];
//! everything that participates in a fill/shift transaction takes a
//! `&mut PgConnection` so one transaction spans the whole handler.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::models::{BotConfig, CycleStatus, DcaCycle, Order, OrderStatus, OrderType};
use crate::db::Database;
use crate::errors::Result;

impl Database {
    pub async fn find_active_configs(&self) -> Result<Vec<BotConfig>> {
        let configs = sqlx::query_as::<_, BotConfig>(
            "SELECT * FROM bot_configs WHERE is_active = TRUE",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(configs)
    }

    pub async fn get_config(&self, config_id: Uuid) -> Result<Option<BotConfig>> {
        let config = sqlx::query_as::<_, BotConfig>("SELECT * FROM bot_configs WHERE id = $1")
            .bind(config_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(config)
    }

    pub async fn set_config_active(&self, config_id: Uuid, is_active: bool) -> Result<()> {
        sqlx::query("UPDATE bot_configs SET is_active = $2 WHERE id = $1")
            .bind(config_id)
            .bind(is_active)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Most recent open cycle for a config, if any.
    pub async fn find_open_cycle(&self, config_id: Uuid) -> Result<Option<DcaCycle>> {
        let cycle = sqlx::query_as::<_, DcaCycle>(
            "SELECT * FROM dca_cycles WHERE config_id = $1 AND status = $2 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(config_id)
        .bind(CycleStatus::Open)
        .fetch_optional(self.pool())
        .await?;
        Ok(cycle)
    }

    pub async fn get_cycle(&self, cycle_id: Uuid) -> Result<Option<DcaCycle>> {
        let cycle = sqlx::query_as::<_, DcaCycle>("SELECT * FROM dca_cycles WHERE id = $1")
            .bind(cycle_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(cycle)
    }

    /// Cycle history for a config, newest first. Serves the HTTP read path
    /// (cycle statistics and trailing state).
    pub async fn list_cycles(&self, config_id: Uuid) -> Result<Vec<DcaCycle>> {
        let cycles = sqlx::query_as::<_, DcaCycle>(
            "SELECT * FROM dca_cycles WHERE config_id = $1 ORDER BY created_at DESC",
        )
        .bind(config_id)
        .fetch_all(self.pool())
        .await?;
        Ok(cycles)
    }

    /// Locally ACTIVE or PENDING orders for a cycle, used by recovery.
    pub async fn find_inflight_orders(&self, cycle_id: Uuid) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE cycle_id = $1 AND status IN ($2, $3)",
        )
        .bind(cycle_id)
        .bind(OrderStatus::Active)
        .bind(OrderStatus::Pending)
        .fetch_all(self.pool())
        .await?;
        Ok(orders)
    }
}

// ---------------------------------------------------------------------------
// Transaction-scoped queries
// ---------------------------------------------------------------------------

pub async fn insert_cycle(conn: &mut PgConnection, config_id: Uuid) -> Result<DcaCycle> {
    let cycle = sqlx::query_as::<_, DcaCycle>(
        "INSERT INTO dca_cycles (id, config_id, status, total_base_qty, total_quote_spent, \
         avg_price, accumulated_dust, trailing_active, emergency_exit, created_at) \
         VALUES ($1, $2, $3, 0, 0, 0, 0, FALSE, FALSE, NOW()) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(config_id)
    .bind(CycleStatus::Open)
    .fetch_one(conn)
    .await?;
    Ok(cycle)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_order(
    conn: &mut PgConnection,
    cycle_id: Uuid,
    exchange_order_id: Option<&str>,
    order_type: OrderType,
    order_index: i32,
    price: Decimal,
    amount: Decimal,
    status: OrderStatus,
) -> Result<Order> {
    let order = sqlx::query_as::<_, Order>(
        "INSERT INTO orders (id, cycle_id, exchange_order_id, order_type, order_index, \
         price, amount, status, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW()) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(cycle_id)
    .bind(exchange_order_id)
    .bind(order_type)
    .bind(order_index)
    .bind(price)
    .bind(amount)
    .bind(status)
    .fetch_one(conn)
    .await?;
    Ok(order)
}

/// Row-locked lookup by exchange order id. The lock serializes concurrent
/// redeliveries of the same fill until the transaction commits.
pub async fn lock_order_by_exchange_id(
    conn: &mut PgConnection,
    exchange_order_id: &str,
) -> Result<Option<Order>> {
    let order = sqlx::query_as::<_, Order>(
        "SELECT * FROM orders WHERE exchange_order_id = $1 FOR UPDATE",
    )
    .bind(exchange_order_id)
    .fetch_optional(conn)
    .await?;
    Ok(order)
}

/// Cycle whose current TP order id matches; used when a TP was placed on
/// the exchange but its local row was lost before commit.
pub async fn find_cycle_by_tp_order(
    conn: &mut PgConnection,
    exchange_order_id: &str,
) -> Result<Option<DcaCycle>> {
    let cycle = sqlx::query_as::<_, DcaCycle>(
        "SELECT * FROM dca_cycles WHERE current_tp_order_id = $1",
    )
    .bind(exchange_order_id)
    .fetch_optional(conn)
    .await?;
    Ok(cycle)
}

pub async fn get_cycle(conn: &mut PgConnection, cycle_id: Uuid) -> Result<Option<DcaCycle>> {
    let cycle = sqlx::query_as::<_, DcaCycle>("SELECT * FROM dca_cycles WHERE id = $1")
        .bind(cycle_id)
        .fetch_optional(conn)
        .await?;
    Ok(cycle)
}

pub async fn get_config(conn: &mut PgConnection, config_id: Uuid) -> Result<Option<BotConfig>> {
    let config = sqlx::query_as::<_, BotConfig>("SELECT * FROM bot_configs WHERE id = $1")
        .bind(config_id)
        .fetch_optional(conn)
        .await?;
    Ok(config)
}

pub async fn update_order_status(
    conn: &mut PgConnection,
    order_id: Uuid,
    status: OrderStatus,
) -> Result<()> {
    sqlx::query("UPDATE orders SET status = $2 WHERE id = $1")
        .bind(order_id)
        .bind(status)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn update_order_status_by_exchange_id(
    conn: &mut PgConnection,
    exchange_order_id: &str,
    status: OrderStatus,
) -> Result<()> {
    sqlx::query("UPDATE orders SET status = $2 WHERE exchange_order_id = $1")
        .bind(exchange_order_id)
        .bind(status)
        .execute(conn)
        .await?;
    Ok(())
}

/// Marks a placed order ACTIVE and records its exchange id.
pub async fn activate_order(
    conn: &mut PgConnection,
    order_id: Uuid,
    exchange_order_id: &str,
) -> Result<()> {
    sqlx::query("UPDATE orders SET status = $2, exchange_order_id = $3 WHERE id = $1")
        .bind(order_id)
        .bind(OrderStatus::Active)
        .bind(exchange_order_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn update_cycle_stats(
    conn: &mut PgConnection,
    cycle_id: Uuid,
    total_base_qty: Decimal,
    total_quote_spent: Decimal,
    avg_price: Decimal,
) -> Result<()> {
    sqlx::query(
        "UPDATE dca_cycles SET total_base_qty = $2, total_quote_spent = $3, avg_price = $4 \
         WHERE id = $1",
    )
    .bind(cycle_id)
    .bind(total_base_qty)
    .bind(total_quote_spent)
    .bind(avg_price)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn update_cycle_dust(
    conn: &mut PgConnection,
    cycle_id: Uuid,
    accumulated_dust: Decimal,
) -> Result<()> {
    sqlx::query("UPDATE dca_cycles SET accumulated_dust = $2 WHERE id = $1")
        .bind(cycle_id)
        .bind(accumulated_dust)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn set_cycle_tp(
    conn: &mut PgConnection,
    cycle_id: Uuid,
    tp_order_id: Option<&str>,
    tp_price: Option<Decimal>,
) -> Result<()> {
    sqlx::query(
        "UPDATE dca_cycles SET current_tp_order_id = $2, current_tp_price = $3 WHERE id = $1",
    )
    .bind(cycle_id)
    .bind(tp_order_id)
    .bind(tp_price)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn set_cycle_initial_price(
    conn: &mut PgConnection,
    cycle_id: Uuid,
    price: Decimal,
) -> Result<()> {
    sqlx::query("UPDATE dca_cycles SET initial_first_order_price = $2 WHERE id = $1")
        .bind(cycle_id)
        .bind(price)
        .execute(conn)
        .await?;
    Ok(())
}

/// Closes a cycle: profit recorded, dust reset for the next round.
pub async fn close_cycle(
    conn: &mut PgConnection,
    cycle_id: Uuid,
    profit_quote: Decimal,
    closed_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE dca_cycles SET status = $2, profit_quote = $3, closed_at = $4, \
         accumulated_dust = 0 WHERE id = $1",
    )
    .bind(cycle_id)
    .bind(CycleStatus::Closed)
    .bind(profit_quote)
    .bind(closed_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn update_cycle_trailing_activation(
    conn: &mut PgConnection,
    cycle_id: Uuid,
    max_price_tracked: Decimal,
    activation_price: Decimal,
    activation_time: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE dca_cycles SET trailing_active = TRUE, max_price_tracked = $2, \
         trailing_activation_price = $3, trailing_activation_time = $4 WHERE id = $1",
    )
    .bind(cycle_id)
    .bind(max_price_tracked)
    .bind(activation_price)
    .bind(activation_time)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn update_cycle_max_price(
    conn: &mut PgConnection,
    cycle_id: Uuid,
    max_price_tracked: Decimal,
) -> Result<()> {
    sqlx::query("UPDATE dca_cycles SET max_price_tracked = $2 WHERE id = $1")
        .bind(cycle_id)
        .bind(max_price_tracked)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn mark_cycle_emergency_exit(
    conn: &mut PgConnection,
    cycle_id: Uuid,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE dca_cycles SET emergency_exit = TRUE, emergency_exit_reason = $2, \
         emergency_exit_time = $3 WHERE id = $1",
    )
    .bind(cycle_id)
    .bind(reason)
    .bind(at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Latest safety order at a given rung index. A shift can leave several
/// generations of rows per index; the newest wins.
pub async fn find_safety_order_at_index(
    conn: &mut PgConnection,
    cycle_id: Uuid,
    order_index: i32,
) -> Result<Option<Order>> {
    let order = sqlx::query_as::<_, Order>(
        "SELECT * FROM orders WHERE cycle_id = $1 AND order_index = $2 AND order_type = $3 \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(cycle_id)
    .bind(order_index)
    .bind(OrderType::BuySafety)
    .fetch_optional(conn)
    .await?;
    Ok(order)
}

pub async fn find_active_orders(conn: &mut PgConnection, cycle_id: Uuid) -> Result<Vec<Order>> {
    let orders = sqlx::query_as::<_, Order>(
        "SELECT * FROM orders WHERE cycle_id = $1 AND status = $2",
    )
    .bind(cycle_id)
    .bind(OrderStatus::Active)
    .fetch_all(conn)
    .await?;
    Ok(orders)
}

/// Safety orders still live on the exchange (pending or partially filled).
pub async fn find_open_safety_orders(
    conn: &mut PgConnection,
    cycle_id: Uuid,
) -> Result<Vec<Order>> {
    let orders = sqlx::query_as::<_, Order>(
        "SELECT * FROM orders WHERE cycle_id = $1 AND order_type = $2 \
         AND status IN ($3, $4, $5)",
    )
    .bind(cycle_id)
    .bind(OrderType::BuySafety)
    .bind(OrderStatus::Pending)
    .bind(OrderStatus::Partial)
    .bind(OrderStatus::Active)
    .fetch_all(conn)
    .await?;
    Ok(orders)
}

/// Removes the unfilled remainder of the grid ahead of reconstruction.
pub async fn delete_unfilled_safety_orders(
    conn: &mut PgConnection,
    cycle_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM orders WHERE cycle_id = $1 AND order_type = $2 AND status != $3",
    )
    .bind(cycle_id)
    .bind(OrderType::BuySafety)
    .bind(OrderStatus::Filled)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn set_config_active(
    conn: &mut PgConnection,
    config_id: Uuid,
    is_active: bool,
) -> Result<()> {
    sqlx::query("UPDATE bot_configs SET is_active = $2 WHERE id = $1")
        .bind(config_id)
        .bind(is_active)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn clear_order_exchange_id(
    conn: &mut PgConnection,
    order_id: Uuid,
    status: OrderStatus,
) -> Result<()> {
    sqlx::query("UPDATE orders SET status = $2, exchange_order_id = NULL WHERE id = $1")
        .bind(order_id)
        .bind(status)
        .execute(conn)
        .await?;
    Ok(())
}
