mod common;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use common::{dec, test_config, MockExchange};
use dca_grid_bot::db::models::{CycleStatus, DcaCycle};
use dca_grid_bot::exchange::types::Candle;
use dca_grid_bot::trading::trailing::{EmergencyReason, TrailingMonitor, TrailingPhase};

fn open_cycle(avg: &str, tp_price: &str) -> DcaCycle {
    DcaCycle {
        id: Uuid::new_v4(),
        config_id: Uuid::new_v4(),
        status: CycleStatus::Open,
        total_base_qty: dec("0.0032"),
        total_quote_spent: dec("9.85"),
        avg_price: dec(avg),
        accumulated_dust: Decimal::ZERO,
        current_tp_order_id: Some("tp-1".into()),
        current_tp_price: Some(dec(tp_price)),
        initial_first_order_price: Some(dec("2985")),
        profit_quote: None,
        trailing_active: false,
        max_price_tracked: None,
        trailing_activation_price: None,
        trailing_activation_time: None,
        emergency_exit: false,
        emergency_exit_reason: None,
        emergency_exit_time: None,
        created_at: Utc::now(),
        closed_at: None,
    }
}

fn candles_with_atr_pct(atr_pct: &str, bars: usize) -> Vec<Candle> {
    // flat closes at 3000 with a constant true range of atr_pct percent
    let close = dec("3000");
    let range = close * dec(atr_pct) / Decimal::ONE_HUNDRED;
    (0..bars)
        .map(|_| Candle {
            timestamp: Utc::now(),
            open: close,
            high: close + range,
            low: close,
            close,
            volume: Decimal::ONE,
        })
        .collect()
}

/// Seed scenario: three touches of the TP activate trailing, the max
/// tracks upward, and a retrace exits at max(callback, min_profit).
#[tokio::test]
async fn trailing_activation_and_exit_sequence() {
    let config = test_config(); // callback 0.8%, min profit 1.0%
    let mut monitor = TrailingMonitor::new(&config);
    let mut cycle = open_cycle("3000", "3036");

    // three consecutive touches
    assert!(!monitor.should_activate(&cycle, dec("3036")));
    assert!(!monitor.should_activate(&cycle, dec("3037")));
    assert!(monitor.should_activate(&cycle, dec("3038")));

    let starting_max = TrailingMonitor::activation_max(&cycle, dec("3038"));
    assert_eq!(starting_max, dec("3038"));
    monitor.on_activated(dec("3038"));
    assert_eq!(monitor.phase(), TrailingPhase::Active);

    cycle.trailing_active = true;
    cycle.max_price_tracked = Some(starting_max);

    // ATR 1.5% => base callback; callback price 3038 * 0.992 = 3013.696,
    // min profit floor 3000 * 1.01 = 3030 dominates.
    let exchange = MockExchange::eth_usdt();
    *exchange.candles.lock().unwrap() = candles_with_atr_pct("1.5", 15);
    let callback = monitor.adaptive_callback(&exchange, "ETH/USDT").await;
    assert_eq!(callback, dec("0.8"));

    // still above the floor: no exit
    assert!(monitor.exit_decision(&cycle, dec("3031"), callback).is_none());

    // retrace through the floor: exit at the floor, never below it
    let exit = monitor.exit_decision(&cycle, dec("3013"), callback).unwrap();
    assert_eq!(exit.exit_price, dec("3030"));
    assert!(exit.exit_price >= monitor.min_profit_price(&cycle));
}

/// The same retrace with a much larger run-up exits on the callback side.
#[tokio::test]
async fn trailing_exit_by_callback_after_runup() {
    let config = test_config();
    let mut monitor = TrailingMonitor::new(&config);
    let mut cycle = open_cycle("3000", "3036");

    assert!(monitor.should_activate(&cycle, dec("3043"))); // overshoot confirm
    monitor.on_activated(dec("3043"));
    cycle.trailing_active = true;
    cycle.max_price_tracked = Some(dec("3200"));

    let exit = monitor.exit_decision(&cycle, dec("3170"), dec("0.8")).unwrap();
    assert_eq!(exit.exit_price, dec("3174.4000"));
    assert!(exit.reason.contains("Callback"));
}

/// High volatility widens the callback before it is applied.
#[tokio::test]
async fn adaptive_callback_widens_under_volatility() {
    let config = test_config();
    let mut monitor = TrailingMonitor::new(&config);

    let exchange = MockExchange::eth_usdt();
    *exchange.candles.lock().unwrap() = candles_with_atr_pct("6", 15);

    let callback = monitor.adaptive_callback(&exchange, "ETH/USDT").await;
    assert_eq!(callback, dec("1.6"));

    // The ATR is cached: changing the candles does not change the result
    // within the cache window.
    *exchange.candles.lock().unwrap() = candles_with_atr_pct("0.5", 15);
    let callback = monitor.adaptive_callback(&exchange, "ETH/USDT").await;
    assert_eq!(callback, dec("1.6"));
}

/// Seed scenario: a 2%+ drop across the rolling window while trailing is
/// active triggers the dump branch of the emergency monitor.
#[tokio::test]
async fn dump_detection_triggers_emergency() {
    let config = test_config();
    let mut monitor = TrailingMonitor::new(&config);
    // wide TP so the min-profit floor (2900 * ~1.01) sits far below the
    // tick range and only the dump trigger can fire
    let mut cycle = open_cycle("2900", "2950");
    cycle.trailing_active = true;
    cycle.max_price_tracked = Some(dec("3060"));
    monitor.sync_with_cycle(&cycle);

    for price in ["3060", "3059", "3058", "3057", "3056", "3055"] {
        assert_eq!(monitor.check_emergency(&cycle, dec(price)), None);
    }
    // against the sample six back (3059), 2996 is a 2.06% drop
    assert_eq!(
        monitor.check_emergency(&cycle, dec("2996")),
        Some(EmergencyReason::DumpDetected)
    );
}

/// Falling 0.5% below the protected-profit floor triggers the other
/// emergency branch even without a rapid dump.
#[tokio::test]
async fn floor_breach_triggers_emergency() {
    let config = test_config();
    let mut monitor = TrailingMonitor::new(&config);
    let mut cycle = open_cycle("3000", "3036");
    cycle.trailing_active = true;
    cycle.max_price_tracked = Some(dec("3038"));

    // floor = 3030, buffer = 3014.85
    assert_eq!(monitor.check_emergency(&cycle, dec("3016")), None);
    assert_eq!(
        monitor.check_emergency(&cycle, dec("3014")),
        Some(EmergencyReason::BelowMinProfit)
    );
}

#[tokio::test]
async fn cycle_without_tp_never_activates() {
    let config = test_config();
    let mut monitor = TrailingMonitor::new(&config);
    let mut cycle = open_cycle("3000", "3036");
    cycle.current_tp_price = None;

    // no TP price on the cycle: nothing to touch
    assert!(!monitor.should_activate(&cycle, dec("99999")));
    assert_eq!(monitor.phase(), TrailingPhase::Idle);
}
