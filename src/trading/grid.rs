use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{BotError, Result};
use crate::utils::precision::{round_to_precision, truncate_to_precision};

/// Inputs for one grid computation. Percentages are 0-100 scaled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridInput {
    pub current_price: Decimal,
    pub total_budget: Decimal,
    pub grid_levels: u32,
    pub grid_length_pct: Decimal,
    pub first_order_offset_pct: Decimal,
    pub volume_scale_pct: Decimal,
    pub amount_precision: u32,
    pub price_precision: u32,
}

/// One rung of the safety-buy ladder. Rung 0 sits closest to market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rung {
    pub index: u32,
    pub price: Decimal,
    pub amount_quote: Decimal,
    pub amount_base: Decimal,
}

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Computes the DCA ladder: equal price steps from the offset entry down to
/// the grid floor, with martingale-scaled volumes summing to the budget.
///
/// Base amounts are truncated down to the exchange precision; rounding up
/// would make placement fail with insufficient balance.
pub fn calculate_grid(input: &GridInput) -> Result<Vec<Rung>> {
    validate(input)?;

    let first_price = input.current_price * (Decimal::ONE - input.first_order_offset_pct / HUNDRED);
    let last_price = first_price * (Decimal::ONE - input.grid_length_pct / HUNDRED);

    let price_step = if input.grid_levels > 1 {
        (first_price - last_price) / Decimal::from(input.grid_levels - 1)
    } else {
        Decimal::ZERO
    };

    let multiplier = Decimal::ONE + input.volume_scale_pct / HUNDRED;

    let mut weight_sum = Decimal::ZERO;
    let mut weight = Decimal::ONE;
    for _ in 0..input.grid_levels {
        weight_sum += weight;
        weight *= multiplier;
    }
    let first_volume = input.total_budget / weight_sum;

    let mut rungs = Vec::with_capacity(input.grid_levels as usize);
    let mut volume = first_volume;
    for i in 0..input.grid_levels {
        let raw_price = first_price - price_step * Decimal::from(i);
        let price = round_to_precision(raw_price, input.price_precision);

        if price <= Decimal::ZERO {
            return Err(BotError::validation(format!(
                "Grid rung {} priced at {} — grid reaches below zero",
                i, price
            )));
        }

        let amount_base = truncate_to_precision(volume / price, input.amount_precision);

        rungs.push(Rung {
            index: i,
            price,
            amount_quote: round_to_precision(volume, 2),
            amount_base,
        });

        volume *= multiplier;
    }

    Ok(rungs)
}

fn validate(input: &GridInput) -> Result<()> {
    if input.current_price <= Decimal::ZERO {
        return Err(BotError::validation("current_price must be positive"));
    }
    if input.total_budget <= Decimal::ZERO {
        return Err(BotError::validation("total_budget must be positive"));
    }
    if input.grid_levels < 1 {
        return Err(BotError::validation("grid_levels must be at least 1"));
    }
    if input.grid_length_pct < Decimal::ZERO || input.grid_length_pct > HUNDRED {
        return Err(BotError::validation("grid_length_pct must be between 0 and 100"));
    }
    if input.first_order_offset_pct < Decimal::ZERO || input.first_order_offset_pct > HUNDRED {
        return Err(BotError::validation(
            "first_order_offset_pct must be between 0 and 100",
        ));
    }
    if input.volume_scale_pct < Decimal::ZERO {
        return Err(BotError::validation("volume_scale_pct cannot be negative"));
    }
    Ok(())
}
