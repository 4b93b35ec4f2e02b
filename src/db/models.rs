use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One user's bot parameters. API credentials are stored AES-GCM encrypted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: Uuid,
    pub user_id: Uuid,
    pub is_active: bool,

    pub api_key: String,
    pub api_secret: String,

    pub symbol: String,
    pub total_budget: Decimal,
    pub grid_levels: i32,
    pub grid_length_pct: Decimal,
    pub first_order_offset_pct: Decimal,
    pub volume_scale_pct: Decimal,
    pub grid_shift_threshold_pct: Decimal,
    pub take_profit_pct: Decimal,

    pub trailing_enabled: bool,
    pub trailing_callback_pct: Decimal,
    pub trailing_min_profit_pct: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "cycle_status", rename_all = "lowercase")]
pub enum CycleStatus {
    Open,
    Closed,
}

/// One DCA round for a config: accumulating buys below market and a single
/// take-profit sell above the weighted average entry.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DcaCycle {
    pub id: Uuid,
    pub config_id: Uuid,
    pub status: CycleStatus,

    pub total_base_qty: Decimal,
    pub total_quote_spent: Decimal,
    pub avg_price: Decimal,
    pub accumulated_dust: Decimal,

    pub current_tp_order_id: Option<String>,
    pub current_tp_price: Option<Decimal>,
    pub initial_first_order_price: Option<Decimal>,
    pub profit_quote: Option<Decimal>,

    pub trailing_active: bool,
    pub max_price_tracked: Option<Decimal>,
    pub trailing_activation_price: Option<Decimal>,
    pub trailing_activation_time: Option<DateTime<Utc>>,

    pub emergency_exit: bool,
    pub emergency_exit_reason: Option<String>,
    pub emergency_exit_time: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Active,
    Partial,
    Filled,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    BuySafety,
    SellTp,
}

/// Local mirror of one exchange order. `order_index` is the rung position
/// in the grid, -1 for the take-profit.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub cycle_id: Uuid,
    pub exchange_order_id: Option<String>,
    pub order_type: OrderType,
    pub order_index: i32,
    pub price: Decimal,
    pub amount: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// Referenced by configs; otherwise opaque to the trading core.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
