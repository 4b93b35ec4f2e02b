use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Net result of processing one buy fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillResult {
    pub filled_qty: Decimal,
    pub fee_qty: Decimal,
    pub net_qty: Decimal,
    pub order_cost: Decimal,
}

/// Cycle accumulators after a fill.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleStats {
    pub total_base_qty: Decimal,
    pub total_quote_spent: Decimal,
    pub avg_price: Decimal,
}

/// Outcome of validating exchange balance against expected inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceCheck {
    pub available: Decimal,
    pub expected: Decimal,
    pub amount_to_sell: Decimal,
    pub deviation_pct: Decimal,
    pub warning: Option<String>,
}

/// Adaptive take-profit parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitParams {
    pub effective_tp_pct: Decimal,
    pub tp_price: Decimal,
    pub min_tp_pct: Decimal,
    pub overhead_quote: Decimal,
}

/// Sellable amount and carried-forward dust after precision truncation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DustSplit {
    pub sellable: Decimal,
    pub new_dust: Decimal,
}

/// Receipt returned to the HTTP layer when a cycle starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleStartReceipt {
    pub cycle_id: Uuid,
    pub first_exchange_id: String,
}

/// Aggregate result of startup recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub recovered: u32,
    pub failed: u32,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
}
