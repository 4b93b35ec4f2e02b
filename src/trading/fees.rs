use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::constants::FALLBACK_FEE_RATE;
use crate::exchange::types::{split_symbol, OrderUpdate};
use crate::trading::types::FillResult;

/// Derives fee quantities from raw exchange fills.
///
/// Buy fees come back in whatever currency the exchange charged; they are
/// normalized into base units so the net position is exact. Sell fees are
/// kept in quote units for profit accounting.
pub struct FeeCalculator;

impl FeeCalculator {
    /// Processes a buy fill into net base quantity and quote cost.
    ///
    /// `taker_fee` is the market's taker rate, used when the exchange did
    /// not report a fee on the fill.
    pub fn fill_result(
        update: &OrderUpdate,
        symbol: &str,
        order_price: Decimal,
        taker_fee: Option<Decimal>,
    ) -> FillResult {
        let filled_qty = if update.filled > Decimal::ZERO {
            update.filled
        } else {
            update.amount
        };
        let (base_currency, quote_currency) = split_symbol(symbol);

        let fee_qty = match &update.fee {
            Some(fee) if fee.cost > Decimal::ZERO => {
                if fee.currency == base_currency {
                    fee.cost
                } else if fee.currency == quote_currency || fee.currency == "USD" {
                    if order_price > Decimal::ZERO {
                        fee.cost / order_price
                    } else {
                        Decimal::ZERO
                    }
                } else {
                    warn!(
                        "Unknown fee currency {}, falling back to {}%",
                        fee.currency,
                        FALLBACK_FEE_RATE * Decimal::ONE_HUNDRED
                    );
                    filled_qty * FALLBACK_FEE_RATE
                }
            }
            _ => {
                let rate = taker_fee.unwrap_or(FALLBACK_FEE_RATE);
                filled_qty * rate
            }
        };

        let net_qty = filled_qty - fee_qty;
        let order_cost = update
            .effective_cost()
            .unwrap_or_else(|| order_price * filled_qty);

        info!(
            "Fill processed: filled={}, fee={}, net={}",
            filled_qty, fee_qty, net_qty
        );

        FillResult {
            filled_qty,
            fee_qty,
            net_qty,
            order_cost,
        }
    }

    /// Quote proceeds of a sell fill after fees: `(gross_cost, fee_quote)`.
    pub fn sell_proceeds(update: &OrderUpdate, symbol: &str) -> (Decimal, Decimal) {
        let (_, quote_currency) = split_symbol(symbol);

        let gross = update.effective_cost().unwrap_or(Decimal::ZERO);

        let fee = match &update.fee {
            Some(fee) if fee.currency == quote_currency || fee.currency == "USD" => {
                info!("Sell fee reported by exchange: {} {}", fee.cost, fee.currency);
                fee.cost
            }
            _ => {
                let estimated = gross * FALLBACK_FEE_RATE;
                warn!(
                    "No usable sell fee from exchange, estimated {}% = {}",
                    FALLBACK_FEE_RATE * Decimal::ONE_HUNDRED,
                    estimated
                );
                estimated
            }
        };

        (gross, fee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::{ExchangeOrderStatus, Fee, OrderKind, OrderSide};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn fill(filled: &str, cost: Option<&str>, fee: Option<Fee>) -> OrderUpdate {
        OrderUpdate {
            id: "1".into(),
            symbol: "ETH/USDT".into(),
            status: ExchangeOrderStatus::Closed,
            side: OrderSide::Buy,
            kind: OrderKind::Limit,
            price: Some(dec("2985")),
            average: None,
            amount: dec(filled),
            filled: dec(filled),
            remaining: Decimal::ZERO,
            cost: cost.map(dec),
            fee,
        }
    }

    #[test]
    fn base_currency_fee_is_direct() {
        let update = fill(
            "0.0033",
            Some("9.8505"),
            Some(Fee {
                cost: dec("0.0000033"),
                currency: "ETH".into(),
            }),
        );
        let result = FeeCalculator::fill_result(&update, "ETH/USDT", dec("2985"), None);
        assert_eq!(result.fee_qty, dec("0.0000033"));
        assert_eq!(result.net_qty, dec("0.0032967"));
        assert_eq!(result.order_cost, dec("9.8505"));
    }

    #[test]
    fn quote_fee_converted_through_price() {
        let update = fill(
            "0.0033",
            Some("9.8505"),
            Some(Fee {
                cost: dec("0.0098505"),
                currency: "USDT".into(),
            }),
        );
        let result = FeeCalculator::fill_result(&update, "ETH/USDT", dec("2985"), None);
        assert_eq!(result.fee_qty, dec("0.0098505") / dec("2985"));
    }

    #[test]
    fn unknown_fee_currency_uses_fallback() {
        let update = fill(
            "1.0",
            None,
            Some(Fee {
                cost: dec("0.5"),
                currency: "BNB".into(),
            }),
        );
        let result = FeeCalculator::fill_result(&update, "ETH/USDT", dec("2985"), None);
        assert_eq!(result.fee_qty, dec("0.001"));
    }

    #[test]
    fn missing_fee_uses_taker_rate() {
        let update = fill("1.0", None, None);
        let result =
            FeeCalculator::fill_result(&update, "ETH/USDT", dec("2985"), Some(dec("0.002")));
        assert_eq!(result.fee_qty, dec("0.002"));

        let result = FeeCalculator::fill_result(&update, "ETH/USDT", dec("2985"), None);
        assert_eq!(result.fee_qty, dec("0.001"));
    }

    #[test]
    fn sell_proceeds_prefer_quote_fee() {
        let mut update = fill("0.0032", Some("9.7152"), None);
        update.side = OrderSide::Sell;
        update.fee = Some(Fee {
            cost: dec("0.0097"),
            currency: "USDT".into(),
        });
        let (gross, fee) = FeeCalculator::sell_proceeds(&update, "ETH/USDT");
        assert_eq!(gross, dec("9.7152"));
        assert_eq!(fee, dec("0.0097"));
    }

    #[test]
    fn sell_proceeds_fallback_fee() {
        let mut update = fill("0.0032", Some("10.0"), None);
        update.side = OrderSide::Sell;
        let (gross, fee) = FeeCalculator::sell_proceeds(&update, "ETH/USDT");
        assert_eq!(gross, dec("10.0"));
        assert_eq!(fee, dec("0.01"));
    }
}
