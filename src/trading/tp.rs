use rust_decimal::Decimal;
use tracing::info;

use crate::constants::{ESTIMATED_TOTAL_FEE_RATE, MIN_TP_PCT, TP_SAFETY_MARGIN};
use crate::trading::types::{CycleStats, TakeProfitParams};
use crate::utils::precision::{round_to_precision, step_size};

/// Computes the adaptive take-profit price.
///
/// The effective TP is never below the break-even level that covers the
/// round-trip fees plus the worst-case precision loss, with a 1.5x margin.
pub struct TakeProfitCalculator;

impl TakeProfitCalculator {
    pub fn calculate(
        stats: &CycleStats,
        config_tp_pct: Decimal,
        amount_precision: u32,
        price_precision: u32,
    ) -> TakeProfitParams {
        let step = step_size(amount_precision);
        let reference_price = round_to_precision(stats.avg_price, price_precision);

        let precision_loss_quote = step * reference_price;
        let fees_quote = stats.total_quote_spent * ESTIMATED_TOTAL_FEE_RATE;
        let overhead_quote = precision_loss_quote + fees_quote;

        let min_tp_pct = if stats.total_quote_spent > Decimal::ZERO {
            overhead_quote / stats.total_quote_spent * Decimal::ONE_HUNDRED
        } else {
            MIN_TP_PCT
        };

        let safe_tp_pct = min_tp_pct * TP_SAFETY_MARGIN;
        let effective_tp_pct = config_tp_pct.max(safe_tp_pct);

        let tp_price = round_to_precision(
            stats.avg_price * (Decimal::ONE + effective_tp_pct / Decimal::ONE_HUNDRED),
            price_precision,
        );

        info!(
            "Adaptive TP: precision_loss={:.4}, fees={:.4}, min={:.2}%, safe={:.2}%, \
             configured={:.2}%, effective={:.2}%",
            precision_loss_quote, fees_quote, min_tp_pct, safe_tp_pct, config_tp_pct,
            effective_tp_pct
        );

        TakeProfitParams {
            effective_tp_pct,
            tp_price,
            min_tp_pct,
            overhead_quote,
        }
    }
}
