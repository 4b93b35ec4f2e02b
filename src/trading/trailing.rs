use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::constants::{
    ATR_CACHE_SECS, ATR_FALLBACK_PCT, ATR_PERIOD, ATR_TIMEFRAME, DUMP_DROP_THRESHOLD_PCT,
    DUMP_HISTORY_LEN, EMERGENCY_MIN_PROFIT_BUFFER, TP_UPDATE_INTERVAL_SECS,
    TRAILING_CONFIRM_OVERSHOOT, TRAILING_CONFIRM_TIMEOUT_SECS, TRAILING_CONFIRM_TOUCHES,
    TRAILING_MIN_PROFIT_RATIO,
};
use crate::db::models::{BotConfig, DcaCycle};
use crate::exchange::types::Candle;
use crate::exchange::Exchange;

/// Rolling detector for rapid price collapses.
///
/// Samples arrive on every ticker event while trailing is active; a drop
/// of more than 2% against the sample six positions back (≈30 s of ticks)
/// is treated as a dump.
pub struct DumpDetector {
    history: VecDeque<(Instant, Decimal)>,
    max_history: usize,
}

impl Default for DumpDetector {
    fn default() -> Self {
        Self::new(DUMP_HISTORY_LEN)
    }
}

impl DumpDetector {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max_history),
            max_history,
        }
    }

    pub fn add_price(&mut self, price: Decimal) {
        self.history.push_back((Instant::now(), price));
        if self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    pub fn detect_rapid_drop(&self, threshold_pct: Decimal) -> bool {
        if self.history.len() < 6 {
            return false;
        }

        let reference = self.history[self.history.len() - 6].1;
        let current = self.history[self.history.len() - 1].1;
        if reference <= Decimal::ZERO {
            return false;
        }

        let drop_pct = (reference - current) / reference * Decimal::ONE_HUNDRED;
        drop_pct > threshold_pct
    }

    /// Price change velocity in percent per second over the window.
    pub fn drop_velocity(&self) -> Decimal {
        let (Some(first), Some(last)) = (self.history.front(), self.history.back()) else {
            return Decimal::ZERO;
        };

        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed <= 0.0 || first.1 <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let change_pct = (last.1 - first.1) / first.1 * Decimal::ONE_HUNDRED;
        change_pct / Decimal::from_f64_retain(elapsed).unwrap_or(Decimal::ONE)
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

/// In-process trailing state; the persisted cycle fields are a projection
/// of this (plus the dump history, which is transient by design).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingPhase {
    Idle,
    Pending { touches: u32, first_touch: Instant },
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyReason {
    BelowMinProfit,
    DumpDetected,
}

impl EmergencyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BelowMinProfit => "Below min_profit",
            Self::DumpDetected => "Dump detected",
        }
    }
}

/// A confirmed trailing exit decision.
#[derive(Debug, Clone, PartialEq)]
pub struct TrailingExit {
    pub exit_price: Decimal,
    pub reason: String,
}

/// Per-bot trailing take-profit supervisor: activation confirmation,
/// adaptive callback, min-profit floor, and the emergency monitor.
pub struct TrailingMonitor {
    callback_pct: Decimal,
    min_profit_pct: Decimal,
    phase: TrailingPhase,
    dump_detector: DumpDetector,
    last_tp_update: Option<Instant>,
    atr_cache: Option<(Instant, Decimal)>,
}

impl TrailingMonitor {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            callback_pct: config.trailing_callback_pct,
            min_profit_pct: config.trailing_min_profit_pct,
            phase: TrailingPhase::Idle,
            dump_detector: DumpDetector::default(),
            last_tp_update: None,
            atr_cache: None,
        }
    }

    pub fn phase(&self) -> TrailingPhase {
        self.phase
    }

    /// Aligns in-process state with a cycle restored from the database,
    /// e.g. after recovery of a bot whose trailing was already active.
    pub fn sync_with_cycle(&mut self, cycle: &DcaCycle) {
        if cycle.trailing_active && self.phase != TrailingPhase::Active {
            info!(
                "Trailing already active for cycle {} (restored state)",
                cycle.id
            );
            self.phase = TrailingPhase::Active;
        }
    }

    pub fn reset_for_new_cycle(&mut self) {
        self.phase = TrailingPhase::Idle;
        self.dump_detector.clear();
        self.last_tp_update = None;
    }

    /// Advances the Idle/Pending confirmation machine on one tick.
    ///
    /// Returns `true` when activation is confirmed: three consecutive
    /// touches of the TP price, a 0.2% overshoot, or 30 s elapsed since the
    /// first touch. A tick back below the TP resets the counter.
    pub fn should_activate(&mut self, cycle: &DcaCycle, price: Decimal) -> bool {
        if cycle.trailing_active || self.phase == TrailingPhase::Active {
            return false;
        }

        let Some(tp_price) = cycle.current_tp_price else {
            return false;
        };

        if price < tp_price {
            if matches!(self.phase, TrailingPhase::Pending { .. }) {
                debug!("Price back below TP, resetting activation counter");
                self.phase = TrailingPhase::Idle;
            }
            return false;
        }

        let (touches, first_touch) = match self.phase {
            TrailingPhase::Pending {
                touches,
                first_touch,
            } => (touches + 1, first_touch),
            _ => (1, Instant::now()),
        };

        if touches >= TRAILING_CONFIRM_TOUCHES {
            info!("Trailing activation confirmed: {} touches", touches);
            return true;
        }

        if price >= tp_price * TRAILING_CONFIRM_OVERSHOOT {
            info!(
                "Trailing activation confirmed: price {:.2}% above TP",
                (price / tp_price - Decimal::ONE) * Decimal::ONE_HUNDRED
            );
            return true;
        }

        if first_touch.elapsed() > Duration::from_secs(TRAILING_CONFIRM_TIMEOUT_SECS) {
            info!(
                "Trailing activation confirmed: timeout ({}s)",
                first_touch.elapsed().as_secs()
            );
            return true;
        }

        debug!(
            "Trailing activation pending: {}/{} touches",
            touches, TRAILING_CONFIRM_TOUCHES
        );
        self.phase = TrailingPhase::Pending {
            touches,
            first_touch,
        };
        false
    }

    /// Starting maximum at activation. When the price gapped over the TP
    /// the TP price itself seeds the max; otherwise the current price does.
    pub fn activation_max(cycle: &DcaCycle, price: Decimal) -> Decimal {
        cycle.current_tp_price.map_or(price, |tp| tp.max(price))
    }

    /// Transitions to Active and seeds the dump history.
    pub fn on_activated(&mut self, price: Decimal) {
        self.phase = TrailingPhase::Active;
        self.dump_detector.clear();
        self.dump_detector.add_price(price);
    }

    /// ATR as a percentage of the last close, from 5-minute candles.
    pub fn atr_pct_from_candles(candles: &[Candle]) -> Option<Decimal> {
        if candles.len() < 2 {
            return None;
        }

        let mut true_ranges = Vec::with_capacity(candles.len() - 1);
        for pair in candles.windows(2) {
            let prev_close = pair[0].close;
            let (high, low) = (pair[1].high, pair[1].low);
            let tr = (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs());
            true_ranges.push(tr);
        }

        let last_close = candles.last()?.close;
        if last_close <= Decimal::ZERO {
            return None;
        }

        let atr = true_ranges.iter().sum::<Decimal>() / Decimal::from(true_ranges.len());
        Some(atr / last_close * Decimal::ONE_HUNDRED)
    }

    /// Widens or tightens the callback with volatility.
    pub fn scaled_callback(base: Decimal, atr_pct: Decimal) -> Decimal {
        if atr_pct > Decimal::from(5) {
            base * Decimal::TWO
        } else if atr_pct > Decimal::from(3) {
            base * Decimal::new(15, 1)
        } else if atr_pct < Decimal::ONE {
            base * Decimal::new(7, 1)
        } else {
            base
        }
    }

    /// Volatility-adjusted callback percentage, ATR cached for 5 minutes.
    pub async fn adaptive_callback(&mut self, exchange: &dyn Exchange, symbol: &str) -> Decimal {
        let atr_pct = match self.atr_cache {
            Some((at, cached)) if at.elapsed() < Duration::from_secs(ATR_CACHE_SECS) => cached,
            _ => {
                let atr = match exchange
                    .fetch_ohlcv(symbol, ATR_TIMEFRAME, ATR_PERIOD + 1)
                    .await
                {
                    Ok(candles) => {
                        Self::atr_pct_from_candles(&candles).unwrap_or(ATR_FALLBACK_PCT)
                    }
                    Err(e) => {
                        warn!("ATR fetch failed, using fallback: {}", e);
                        ATR_FALLBACK_PCT
                    }
                };
                self.atr_cache = Some((Instant::now(), atr));
                debug!("ATR computed: {:.2}%", atr);
                atr
            }
        };

        Self::scaled_callback(self.callback_pct, atr_pct)
    }

    pub fn callback_price(max_price: Decimal, callback_pct: Decimal) -> Decimal {
        max_price * (Decimal::ONE - callback_pct / Decimal::ONE_HUNDRED)
    }

    /// Price floor protecting a minimum share of the profit the cycle had
    /// locked in at activation: at least `trailing_min_profit_pct`, or 66%
    /// of the effective TP, whichever is higher.
    pub fn min_profit_price(&self, cycle: &DcaCycle) -> Decimal {
        let (Some(tp_price), avg_price) = (cycle.current_tp_price, cycle.avg_price) else {
            return Decimal::ZERO;
        };
        if avg_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let effective_tp_pct = (tp_price / avg_price - Decimal::ONE) * Decimal::ONE_HUNDRED;
        let adaptive_min = effective_tp_pct * TRAILING_MIN_PROFIT_RATIO;
        let final_min_pct = adaptive_min.max(self.min_profit_pct);

        avg_price * (Decimal::ONE + final_min_pct / Decimal::ONE_HUNDRED)
    }

    /// Exit decision for an Active cycle given the already-resolved
    /// adaptive callback. The exit price never undercuts the profit floor.
    pub fn exit_decision(
        &self,
        cycle: &DcaCycle,
        price: Decimal,
        adaptive_callback: Decimal,
    ) -> Option<TrailingExit> {
        if !cycle.trailing_active {
            return None;
        }
        let max_tracked = cycle.max_price_tracked?;

        let callback_price = Self::callback_price(max_tracked, adaptive_callback);
        let min_profit_price = self.min_profit_price(cycle);
        let exit_price = callback_price.max(min_profit_price);

        if price > exit_price {
            return None;
        }

        let reason = if min_profit_price > callback_price {
            format!("Min profit protection ({}%)", self.min_profit_pct)
        } else {
            format!("Callback triggered ({:.2}% from max)", adaptive_callback)
        };

        info!(
            "Trailing exit for cycle {}: price={}, callback_price={}, min_profit_price={}, \
             exit_price={}, max_tracked={}, reason={}",
            cycle.id, price, callback_price, min_profit_price, exit_price, max_tracked, reason
        );

        Some(TrailingExit { exit_price, reason })
    }

    /// Emergency monitor, run on every Active tick. Records the price and
    /// fires on a detected dump or a breach of the protected-profit floor.
    pub fn check_emergency(&mut self, cycle: &DcaCycle, price: Decimal) -> Option<EmergencyReason> {
        if !cycle.trailing_active {
            return None;
        }

        self.dump_detector.add_price(price);

        let min_profit_price = self.min_profit_price(cycle);
        if min_profit_price > Decimal::ZERO
            && price < min_profit_price * EMERGENCY_MIN_PROFIT_BUFFER
        {
            warn!(
                "Emergency trigger: price {} below protected floor {} for cycle {}",
                price, min_profit_price, cycle.id
            );
            return Some(EmergencyReason::BelowMinProfit);
        }

        if self.dump_detector.detect_rapid_drop(DUMP_DROP_THRESHOLD_PCT) {
            warn!(
                "Emergency trigger: dump detected for cycle {} (velocity {:.3}%/s)",
                cycle.id,
                self.dump_detector.drop_velocity()
            );
            return Some(EmergencyReason::DumpDetected);
        }

        None
    }

    /// TP replacement rate limit: at most one update per 10 s per cycle.
    pub fn can_update_tp(&self) -> bool {
        match self.last_tp_update {
            Some(at) => at.elapsed() >= Duration::from_secs(TP_UPDATE_INTERVAL_SECS),
            None => true,
        }
    }

    pub fn mark_tp_updated(&mut self) {
        self.last_tp_update = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use uuid::Uuid;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn config(callback: &str, min_profit: &str) -> BotConfig {
        BotConfig {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            is_active: true,
            api_key: String::new(),
            api_secret: String::new(),
            symbol: "ETH/USDT".into(),
            total_budget: dec("100"),
            grid_levels: 5,
            grid_length_pct: dec("5"),
            first_order_offset_pct: dec("0.5"),
            volume_scale_pct: dec("40"),
            grid_shift_threshold_pct: dec("0.6"),
            take_profit_pct: dec("1.2"),
            trailing_enabled: true,
            trailing_callback_pct: dec(callback),
            trailing_min_profit_pct: dec(min_profit),
        }
    }

    fn cycle(avg: &str, tp: Option<&str>, active: bool, max: Option<&str>) -> DcaCycle {
        DcaCycle {
            id: Uuid::new_v4(),
            config_id: Uuid::new_v4(),
            status: crate::db::models::CycleStatus::Open,
            total_base_qty: dec("0.0032"),
            total_quote_spent: dec("9.85"),
            avg_price: dec(avg),
            accumulated_dust: Decimal::ZERO,
            current_tp_order_id: tp.map(|_| "tp-1".to_string()),
            current_tp_price: tp.map(dec),
            initial_first_order_price: None,
            profit_quote: None,
            trailing_active: active,
            max_price_tracked: max.map(dec),
            trailing_activation_price: None,
            trailing_activation_time: None,
            emergency_exit: false,
            emergency_exit_reason: None,
            emergency_exit_time: None,
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn activation_needs_three_touches() {
        let mut monitor = TrailingMonitor::new(&config("0.8", "1.0"));
        let c = cycle("3000", Some("3036"), false, None);

        assert!(!monitor.should_activate(&c, dec("3036")));
        assert!(!monitor.should_activate(&c, dec("3037")));
        assert!(monitor.should_activate(&c, dec("3038")));
    }

    #[test]
    fn dip_resets_touch_counter() {
        let mut monitor = TrailingMonitor::new(&config("0.8", "1.0"));
        let c = cycle("3000", Some("3036"), false, None);

        assert!(!monitor.should_activate(&c, dec("3036")));
        assert!(!monitor.should_activate(&c, dec("3035")));
        assert_eq!(monitor.phase(), TrailingPhase::Idle);
        assert!(!monitor.should_activate(&c, dec("3036")));
        assert!(!monitor.should_activate(&c, dec("3036")));
        assert!(monitor.should_activate(&c, dec("3036")));
    }

    #[test]
    fn overshoot_activates_immediately() {
        let mut monitor = TrailingMonitor::new(&config("0.8", "1.0"));
        let c = cycle("3000", Some("3036"), false, None);

        // 3036 * 1.002 = 3042.072
        assert!(monitor.should_activate(&c, dec("3043")));
    }

    #[test]
    fn activation_max_handles_gap() {
        let c = cycle("3000", Some("3036"), false, None);
        assert_eq!(TrailingMonitor::activation_max(&c, dec("3038")), dec("3038"));
        // opening gap below TP keeps the TP as the starting max
        assert_eq!(TrailingMonitor::activation_max(&c, dec("3010")), dec("3036"));
    }

    #[test]
    fn callback_scaling_buckets() {
        let base = dec("0.8");
        assert_eq!(TrailingMonitor::scaled_callback(base, dec("6")), dec("1.6"));
        assert_eq!(TrailingMonitor::scaled_callback(base, dec("4")), dec("1.2"));
        assert_eq!(TrailingMonitor::scaled_callback(base, dec("0.5")), dec("0.56"));
        assert_eq!(TrailingMonitor::scaled_callback(base, dec("1.5")), base);
    }

    #[test]
    fn atr_from_candles() {
        let mk = |h: &str, l: &str, c: &str| Candle {
            timestamp: Utc::now(),
            open: dec(c),
            high: dec(h),
            low: dec(l),
            close: dec(c),
            volume: Decimal::ONE,
        };
        // constant 30-point true range on a 3000 close => 1% ATR
        let candles = vec![
            mk("3030", "3000", "3000"),
            mk("3030", "3000", "3000"),
            mk("3030", "3000", "3000"),
        ];
        let atr = TrailingMonitor::atr_pct_from_candles(&candles).unwrap();
        assert_eq!(atr, dec("1"));

        assert!(TrailingMonitor::atr_pct_from_candles(&candles[..1]).is_none());
    }

    #[test]
    fn min_profit_floor_uses_larger_of_configured_and_adaptive() {
        // effective TP 1.2% => adaptive 0.792% < configured 1.0%
        let monitor = TrailingMonitor::new(&config("0.8", "1.0"));
        let c = cycle("3000", Some("3036"), true, Some("3038"));
        assert_eq!(monitor.min_profit_price(&c), dec("3030"));

        // effective TP 4% => adaptive 2.64% > configured 1.0%
        let c = cycle("3000", Some("3120"), true, Some("3130"));
        assert_eq!(monitor.min_profit_price(&c), dec("3079.2"));
    }

    #[test]
    fn exit_waits_above_floor_even_when_callback_hit() {
        // Seed scenario: max=3038, callback 0.8% => callback price 3013.696;
        // floor 3030 dominates, so a tick at 3020 exits at the floor.
        let monitor = TrailingMonitor::new(&config("0.8", "1.0"));
        let c = cycle("3000", Some("3036"), true, Some("3038"));

        let exit = monitor.exit_decision(&c, dec("3020"), dec("0.8")).unwrap();
        assert_eq!(exit.exit_price, dec("3030"));
        assert!(exit.reason.contains("Min profit"));

        // above the floor: no exit yet
        assert!(monitor.exit_decision(&c, dec("3031"), dec("0.8")).is_none());
    }

    #[test]
    fn exit_by_callback_when_floor_below() {
        // Large run-up: max=3200, callback price 3174.4 > floor 3030.
        let monitor = TrailingMonitor::new(&config("0.8", "1.0"));
        let c = cycle("3000", Some("3036"), true, Some("3200"));

        let exit = monitor.exit_decision(&c, dec("3170"), dec("0.8")).unwrap();
        assert_eq!(exit.exit_price, dec("3174.4000"));
        assert!(exit.reason.contains("Callback"));

        // exit price is never below the floor
        assert!(exit.exit_price >= monitor.min_profit_price(&c));
    }

    #[test]
    fn dump_detector_flags_two_percent_drop() {
        let mut detector = DumpDetector::default();
        for price in ["3060", "3058", "3055", "3050", "3040", "3020", "2998"] {
            detector.add_price(dec(price));
        }
        // 3060 -> 2998 across six samples is a 2.03% drop
        assert!(detector.detect_rapid_drop(dec("2.0")));
    }

    #[test]
    fn dump_detector_ignores_slow_drift() {
        let mut detector = DumpDetector::default();
        for price in ["3060", "3059", "3058", "3057", "3056", "3055", "3054"] {
            detector.add_price(dec(price));
        }
        assert!(!detector.detect_rapid_drop(dec("2.0")));
    }

    #[test]
    fn emergency_fires_below_protected_floor() {
        let mut monitor = TrailingMonitor::new(&config("0.8", "1.0"));
        let c = cycle("3000", Some("3036"), true, Some("3038"));

        // floor 3030 * 0.995 = 3014.85
        assert_eq!(
            monitor.check_emergency(&c, dec("3010")),
            Some(EmergencyReason::BelowMinProfit)
        );
        assert_eq!(monitor.check_emergency(&c, dec("3031")), None);
    }

    #[test]
    fn emergency_fires_on_dump() {
        let mut monitor = TrailingMonitor::new(&config("0.8", "1.0"));
        // low floor (2933, buffer 2918) so only the dump trigger can fire
        let c = cycle("2900", Some("2950"), true, Some("3100"));

        for price in ["3100", "3099", "3098", "3097", "3096", "3095"] {
            assert_eq!(monitor.check_emergency(&c, dec(price)), None);
        }
        // sixth-back sample is 3099 -> 3030 is a 2.2% drop
        assert_eq!(
            monitor.check_emergency(&c, dec("3030")),
            Some(EmergencyReason::DumpDetected)
        );
    }

    #[test]
    fn tp_rate_limit() {
        let mut monitor = TrailingMonitor::new(&config("0.8", "1.0"));
        assert!(monitor.can_update_tp());
        monitor.mark_tp_updated();
        assert!(!monitor.can_update_tp());
    }
}
