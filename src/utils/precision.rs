use rust_decimal::Decimal;

/// Truncates `value` down to `precision` decimal places.
///
/// Exchanges reject orders whose amount exceeds the free balance, so amount
/// rounding must never round up.
pub fn truncate_to_precision(value: Decimal, precision: u32) -> Decimal {
    value.trunc_with_scale(precision)
}

/// Rounds `value` to `precision` decimal places (banker-free, half away
/// from zero), used for prices where truncation is not required.
pub fn round_to_precision(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
}

/// Smallest representable amount at the given precision, e.g. 0.0001 for 4.
pub fn step_size(precision: u32) -> Decimal {
    Decimal::new(1, precision)
}
