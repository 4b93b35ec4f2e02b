mod common;

use proptest::prelude::*;
use rust_decimal::Decimal;

use common::dec;
use dca_grid_bot::trading::fees::FeeCalculator;
use dca_grid_bot::trading::grid::{calculate_grid, GridInput};
use dca_grid_bot::trading::tp::TakeProfitCalculator;
use dca_grid_bot::trading::types::CycleStats;
use dca_grid_bot::utils::precision::{step_size, truncate_to_precision};

fn input_strategy() -> impl Strategy<Value = GridInput> {
    // Price and length ranges keep the rounded price step above one tick,
    // so rung prices stay strictly decreasing after rounding.
    (
        100_000i64..5_000_000,  // price in cents: 1000.00 .. 50000.00
        100_000i64..1_000_000, // budget in cents: 1000.00 .. 10000.00
        1u32..=50,
        500i64..3000,  // grid length bp: 5.00% .. 30.00%
        0i64..500,     // first offset bp: 0 .. 5.00%
        0i64..10_000,  // volume scale bp: 0 .. 100.00%
    )
        .prop_map(|(price, budget, levels, length, offset, scale)| GridInput {
            current_price: Decimal::new(price, 2),
            total_budget: Decimal::new(budget, 2),
            grid_levels: levels,
            grid_length_pct: Decimal::new(length, 2),
            first_order_offset_pct: Decimal::new(offset, 2),
            volume_scale_pct: Decimal::new(scale, 2),
            amount_precision: 4,
            price_precision: 2,
        })
}

proptest! {
    #[test]
    fn grid_emits_exactly_n_rungs(input in input_strategy()) {
        let rungs = calculate_grid(&input).unwrap();
        prop_assert_eq!(rungs.len(), input.grid_levels as usize);
        for (i, rung) in rungs.iter().enumerate() {
            prop_assert_eq!(rung.index, i as u32);
        }
    }

    #[test]
    fn grid_prices_strictly_decrease(input in input_strategy()) {
        let rungs = calculate_grid(&input).unwrap();
        for pair in rungs.windows(2) {
            prop_assert!(pair[1].price < pair[0].price,
                "rung {} price {} not below rung {} price {}",
                pair[1].index, pair[1].price, pair[0].index, pair[0].price);
        }
        prop_assert!(rungs[0].price < input.current_price);
    }

    #[test]
    fn grid_volumes_never_decrease(input in input_strategy()) {
        let rungs = calculate_grid(&input).unwrap();
        for pair in rungs.windows(2) {
            prop_assert!(pair[1].amount_quote >= pair[0].amount_quote);
        }
    }

    #[test]
    fn grid_spend_bounded_by_budget(input in input_strategy()) {
        let rungs = calculate_grid(&input).unwrap();

        // actual spend = base * price, where base was truncated down from
        // quote / price, so each term is at most the ideal quote share
        let spend: Decimal = rungs.iter().map(|r| r.amount_base * r.price).sum();
        prop_assert!(spend <= input.total_budget + dec("0.01"));

        // truncation loses less than one amount step per rung
        let max_truncation_loss: Decimal = rungs
            .iter()
            .map(|r| step_size(input.amount_precision) * r.price)
            .sum();
        prop_assert!(spend >= input.total_budget - max_truncation_loss - dec("0.01"));
    }

    #[test]
    fn grid_base_amounts_respect_precision(input in input_strategy()) {
        let rungs = calculate_grid(&input).unwrap();
        for rung in &rungs {
            prop_assert!(rung.amount_base.scale() <= input.amount_precision);
            prop_assert!(rung.price.scale() <= input.price_precision);
        }
    }

    #[test]
    fn truncation_rounds_down_within_one_step(
        units in 0i64..1_000_000_000_000,
        precision in 0u32..8,
    ) {
        let value = Decimal::new(units, 8); // 0 .. 10000.00000000
        let truncated = truncate_to_precision(value, precision);
        prop_assert!(truncated <= value);
        prop_assert!(value - truncated < step_size(precision));
    }

    #[test]
    fn avg_price_invariant_over_fill_sequences(
        fills in prop::collection::vec((1i64..10_000, 100_000i64..5_000_000), 1..12),
    ) {
        // accumulate synthetic buy fills the way the handler does
        let mut stats = CycleStats {
            total_base_qty: Decimal::ZERO,
            total_quote_spent: Decimal::ZERO,
            avg_price: Decimal::ZERO,
        };

        for (amount_units, price_cents) in fills {
            let amount = Decimal::new(amount_units, 4);
            let price = Decimal::new(price_cents, 2);
            let update = common::buy_fill("prop", &amount.to_string(), &price.to_string(),
                &(amount * price).to_string());
            let fill = FeeCalculator::fill_result(&update, "ETH/USDT", price, Some(dec("0.001")));

            stats.total_base_qty += fill.net_qty;
            stats.total_quote_spent += fill.order_cost;
            if stats.total_base_qty > Decimal::ZERO {
                stats.avg_price = stats.total_quote_spent / stats.total_base_qty;
            }
        }

        if stats.total_base_qty > Decimal::ZERO {
            let recomputed = stats.total_quote_spent / stats.total_base_qty;
            prop_assert!((stats.avg_price - recomputed).abs() < Decimal::new(1, 8));
        }
    }

    #[test]
    fn adaptive_tp_dominates_configured_tp(
        spent_cents in 100i64..10_000_000,
        base_units in 1i64..10_000_000,
        tp_bp in 10i64..500,
    ) {
        let spent = Decimal::new(spent_cents, 2);
        let base = Decimal::new(base_units, 6);
        let stats = CycleStats {
            total_base_qty: base,
            total_quote_spent: spent,
            avg_price: spent / base,
        };
        let config_tp = Decimal::new(tp_bp, 2);

        let params = TakeProfitCalculator::calculate(&stats, config_tp, 4, 2);
        prop_assert!(params.effective_tp_pct >= config_tp);
        prop_assert!(params.tp_price >= stats.avg_price.round_dp(2) - dec("0.01"));
    }
}
