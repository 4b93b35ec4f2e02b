use rust_decimal::Decimal;
use tracing::info;

use crate::trading::types::DustSplit;
use crate::utils::precision::truncate_to_precision;

/// Tracks sub-precision residue from truncating sell amounts.
///
/// Dust carries forward across TP updates within a cycle and is zeroed when
/// the cycle closes.
pub struct DustManager;

impl DustManager {
    pub fn split(amount: Decimal, accumulated_dust: Decimal, amount_precision: u32) -> DustSplit {
        let total_with_dust = amount + accumulated_dust;
        let sellable = truncate_to_precision(total_with_dust, amount_precision);
        let new_dust = total_with_dust - sellable;

        info!(
            "Dust accumulation: current={}, carried={}, sellable={}, new_dust={}",
            amount, accumulated_dust, sellable, new_dust
        );

        DustSplit { sellable, new_dust }
    }
}
