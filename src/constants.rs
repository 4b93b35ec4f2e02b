use rust_decimal::Decimal;

/// Minimum free quote balance required to start a cycle.
pub const MIN_TRADING_AMOUNT: Decimal = Decimal::from_parts(10, 0, 0, false, 0);

/// Fraction of the free balance usable when the configured budget exceeds it.
/// The remaining 1% absorbs fee drift between the balance check and the fill.
pub const BUDGET_HEADROOM: Decimal = Decimal::from_parts(99, 0, 0, false, 2);

/// Balance deviation buckets (percent). Empirically tuned.
pub const CRITICAL_DEVIATION_PCT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);
pub const WARNING_DEVIATION_PCT: Decimal = Decimal::ONE;
pub const EXACT_MATCH_THRESHOLD_PCT: Decimal = Decimal::from_parts(1, 0, 0, false, 1);

/// Fee rate used when the exchange reports nothing usable (0.1%).
pub const FALLBACK_FEE_RATE: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

/// Round-trip (buy + sell) fee estimate used in adaptive TP math (0.2%).
pub const ESTIMATED_TOTAL_FEE_RATE: Decimal = Decimal::from_parts(2, 0, 0, false, 3);

/// Floor for the minimum TP percentage when nothing has been spent yet.
pub const MIN_TP_PCT: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Multiplier applied to the break-even TP to leave a safety margin.
pub const TP_SAFETY_MARGIN: Decimal = Decimal::from_parts(15, 0, 0, false, 1);

/// A closed cycle earning less than this fraction of the configured TP is
/// logged as an anomaly.
pub const MIN_PROFIT_CHECK_RATIO: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Seconds between TP order replacements for one cycle.
pub const TP_UPDATE_INTERVAL_SECS: u64 = 10;

/// Seconds between grid shifts for one bot.
pub const GRID_SHIFT_INTERVAL_SECS: u64 = 15;

/// Backoff after a stream error before reconnecting.
pub const STREAM_RECONNECT_SECS: u64 = 5;

/// Grace period between tearing down a supervisor and subscribing the next
/// one, letting the exchange release user-data stream state.
pub const CYCLE_RESTART_GRACE_MS: u64 = 500;

/// Trailing activation: consecutive touches required.
pub const TRAILING_CONFIRM_TOUCHES: u32 = 3;
/// Trailing activation: price overshoot that confirms immediately (0.2%).
pub const TRAILING_CONFIRM_OVERSHOOT: Decimal = Decimal::from_parts(1002, 0, 0, false, 3);
/// Trailing activation: seconds after the first touch before confirming anyway.
pub const TRAILING_CONFIRM_TIMEOUT_SECS: u64 = 30;

/// Dump detector: rolling price history length and drop threshold.
pub const DUMP_HISTORY_LEN: usize = 12;
pub const DUMP_DROP_THRESHOLD_PCT: Decimal = Decimal::TWO;

/// Emergency exit triggers when price falls below min_profit * 0.995.
pub const EMERGENCY_MIN_PROFIT_BUFFER: Decimal = Decimal::from_parts(995, 0, 0, false, 3);

/// Fraction of the activation-time effective TP protected by trailing.
pub const TRAILING_MIN_PROFIT_RATIO: Decimal = Decimal::from_parts(66, 0, 0, false, 2);

/// ATR settings for the adaptive trailing callback.
pub const ATR_PERIOD: usize = 14;
pub const ATR_TIMEFRAME: &str = "5m";
pub const ATR_CACHE_SECS: u64 = 300;
/// ATR% returned when candles are unavailable.
pub const ATR_FALLBACK_PCT: Decimal = Decimal::TWO;
