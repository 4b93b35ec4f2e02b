use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::constants::{
    CRITICAL_DEVIATION_PCT, EXACT_MATCH_THRESHOLD_PCT, WARNING_DEVIATION_PCT,
};
use crate::errors::{BotError, Result};
use crate::trading::types::BalanceCheck;

/// Validates exchange free balance against the inventory the cycle believes
/// it holds, and picks a safe amount to sell.
pub struct BalanceValidator;

impl BalanceValidator {
    pub fn validate_for_sell(available: Decimal, expected: Decimal) -> Result<BalanceCheck> {
        info!(
            "Balance check: available={}, expected={}",
            available, expected
        );

        if available <= Decimal::ZERO {
            return Err(BotError::insufficient_balance(format!(
                "No base asset available for sell (expected {})",
                expected
            )));
        }

        let deviation_pct = if expected > Decimal::ZERO {
            (available - expected).abs() / expected * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };

        let mut warning = None;
        if expected > Decimal::ZERO {
            if deviation_pct > CRITICAL_DEVIATION_PCT {
                // Manual transfers, several bots on one account, or stale
                // API data can all produce this; progressing would sell an
                // amount nobody accounted for.
                return Err(BotError::balance_deviation(format!(
                    "available={} expected={} deviation={:.2}% (threshold {}%)",
                    available, expected, deviation_pct, CRITICAL_DEVIATION_PCT
                )));
            }
            if deviation_pct > WARNING_DEVIATION_PCT {
                let msg = format!(
                    "Moderate balance deviation {:.2}%, using conservative amount",
                    deviation_pct
                );
                warn!("{}", msg);
                warning = Some(msg);
            }
        }

        let amount_to_sell = if expected <= Decimal::ZERO {
            warn!("No expected inventory recorded, selling available balance");
            available
        } else if deviation_pct < EXACT_MATCH_THRESHOLD_PCT {
            available
        } else if available < expected {
            warn!(
                "Balance below expected; selling {} (dust lost {})",
                available,
                expected - available
            );
            available
        } else {
            warn!(
                "Balance above expected; selling recorded amount {} for safety",
                expected
            );
            expected
        };

        if amount_to_sell <= Decimal::ZERO {
            return Err(BotError::insufficient_balance(
                "Computed sell amount is zero",
            ));
        }

        Ok(BalanceCheck {
            available,
            expected,
            amount_to_sell,
            deviation_pct,
            warning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn zero_available_is_error() {
        let err = BalanceValidator::validate_for_sell(Decimal::ZERO, dec("1")).unwrap_err();
        assert!(matches!(err, BotError::InsufficientBalance(_)));
    }

    #[test]
    fn critical_deviation_is_error() {
        let err = BalanceValidator::validate_for_sell(dec("1.06"), dec("1.0")).unwrap_err();
        assert!(matches!(err, BotError::BalanceDeviation(_)));
    }

    #[test]
    fn exact_match_uses_available() {
        let check = BalanceValidator::validate_for_sell(dec("1.0005"), dec("1.0")).unwrap();
        assert_eq!(check.amount_to_sell, dec("1.0005"));
        assert!(check.warning.is_none());
    }

    #[test]
    fn below_expected_sells_available() {
        let check = BalanceValidator::validate_for_sell(dec("0.98"), dec("1.0")).unwrap();
        assert_eq!(check.amount_to_sell, dec("0.98"));
        assert!(check.warning.is_some());
    }

    #[test]
    fn above_expected_sells_expected() {
        let check = BalanceValidator::validate_for_sell(dec("1.03"), dec("1.0")).unwrap();
        assert_eq!(check.amount_to_sell, dec("1.0"));
    }

    #[test]
    fn no_expected_inventory_sells_available() {
        let check = BalanceValidator::validate_for_sell(dec("0.5"), Decimal::ZERO).unwrap();
        assert_eq!(check.amount_to_sell, dec("0.5"));
    }
}
