// =============================================================================
// PositionSizer & CircuitBreaker — the two capital-protection gates
// =============================================================================
//
// PositionSizer turns (balance, entry, stop-loss, cfg) into an order
// quantity under a notional cap and a margin-sufficiency cap (§4.4).
// CircuitBreaker gates new entries on cumulative realised loss for the
// venue's current day (§4.9 / glossary), resetting at each day boundary as
// observed through the injected `Clock` port.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::types::EffectiveConfig;

/// Floors `qty` to the nearest multiple of `step` — never rounds up, so the
/// sizer never submits more risk than `cfg` allows (§4.4).
pub fn floor_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    (qty / step).floor() * step
}

pub struct PositionSizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingError {
    /// `entry == stopLoss`; risk distance collapses to zero.
    ZeroRiskDistance,
    /// Quantity rounds to zero once floored to the symbol's step size.
    QuantityRoundsToZero,
}

impl std::fmt::Display for SizingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroRiskDistance => write!(f, "entry price equals stop-loss price"),
            Self::QuantityRoundsToZero => write!(f, "sized quantity rounds to zero at symbol step"),
        }
    }
}

impl PositionSizer {
    /// Compute order quantity per §4.4. `risk_multiplier` is
    /// `cfg.dcaRiskMultiplier` for a DCA leg, `1.0` for a fresh entry.
    pub fn size(
        balance: f64,
        entry: f64,
        stop_loss: f64,
        cfg: &EffectiveConfig,
        risk_multiplier: f64,
        step_size: f64,
    ) -> Result<f64, SizingError> {
        let risk_distance = (entry - stop_loss).abs();
        if risk_distance <= 0.0 {
            return Err(SizingError::ZeroRiskDistance);
        }

        let risk_usdt = balance * cfg.risk_percent * risk_multiplier;
        let mut qty = risk_usdt / risk_distance;

        if cfg.max_position_usdt > 0.0 {
            qty = qty.min(cfg.max_position_usdt / entry);
        }

        let margin_cap = 0.90 * balance * cfg.fixed_leverage as f64 / entry;
        qty = qty.min(margin_cap);

        let floored = floor_to_step(qty, step_size);
        if floored <= 0.0 {
            return Err(SizingError::QuantityRoundsToZero);
        }

        debug!(balance, entry, stop_loss, risk_multiplier, qty = floored, "sized position");
        Ok(floored)
    }
}

// =============================================================================
// CircuitBreaker — daily realised-loss gate
// =============================================================================

struct Inner {
    today: String,
    realised_loss_today: f64,
}

/// Tracks cumulative realised loss for the current day and trips once it
/// reaches `maxDailyLossUsdt` for a given effective config (0 disables it).
pub struct CircuitBreaker {
    clock: std::sync::Arc<dyn Clock>,
    state: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(clock: std::sync::Arc<dyn Clock>) -> Self {
        let today = clock.now().format("%Y-%m-%d").to_string();
        Self {
            clock,
            state: RwLock::new(Inner { today, realised_loss_today: 0.0 }),
        }
    }

    fn maybe_reset(&self, guard: &mut Inner) {
        let today = self.clock.now().format("%Y-%m-%d").to_string();
        if guard.today != today {
            info!(previous_day = %guard.today, new_day = %today, "circuit breaker day rollover");
            guard.today = today;
            guard.realised_loss_today = 0.0;
        }
    }

    /// Record a realised close. Only losses (negative `net_profit`) move the
    /// accumulator; wins do not reduce it back below zero.
    pub fn record_realised(&self, net_profit: f64) {
        let mut guard = self.state.write();
        self.maybe_reset(&mut guard);
        if net_profit < 0.0 {
            guard.realised_loss_today += -net_profit;
        }
    }

    /// True when `cfg.maxDailyLossUsdt > 0` and today's accumulated loss has
    /// reached or exceeded it (§4.7.1 step 3).
    pub fn is_tripped(&self, cfg: &EffectiveConfig) -> bool {
        if cfg.max_daily_loss_usdt <= 0.0 {
            return false;
        }
        let mut guard = self.state.write();
        self.maybe_reset(&mut guard);
        guard.realised_loss_today >= cfg.max_daily_loss_usdt
    }

    pub fn today_realised_loss(&self) -> f64 {
        let mut guard = self.state.write();
        self.maybe_reset(&mut guard);
        guard.realised_loss_today
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed::FixedClock;
    use std::sync::Arc;

    fn cfg(max_daily_loss: f64) -> EffectiveConfig {
        EffectiveConfig {
            risk_percent: 0.2,
            max_position_usdt: 0.0,
            max_daily_loss_usdt: max_daily_loss,
            max_dca_per_symbol: 3,
            dca_risk_multiplier: 1.0,
            fixed_leverage: 10,
            allowed_symbols: vec!["BTCUSDT".into()],
            dedup_enabled: true,
            default_symbol: None,
        }
    }

    #[test]
    fn sizing_matches_scenario_s1() {
        // leverage must clear 11x here so the margin cap (0.90*1000*lev/95000)
        // doesn't bind below the risk-derived 0.1 qty S1 expects.
        let mut c = cfg(0.0);
        c.fixed_leverage = 11;
        let qty = PositionSizer::size(1000.0, 95000.0, 93000.0, &c, 1.0, 0.001).unwrap();
        assert!((qty - 0.1).abs() < 1e-6, "qty={qty}");
    }

    #[test]
    fn sizing_rejects_zero_risk_distance() {
        let err = PositionSizer::size(1000.0, 95000.0, 95000.0, &cfg(0.0), 1.0, 0.001).unwrap_err();
        assert_eq!(err, SizingError::ZeroRiskDistance);
    }

    #[test]
    fn sizing_applies_notional_cap() {
        let mut c = cfg(0.0);
        c.max_position_usdt = 1000.0;
        let qty = PositionSizer::size(100_000.0, 95000.0, 93000.0, &c, 1.0, 0.001).unwrap();
        assert!(qty <= 1000.0 / 95000.0 + 1e-9);
    }

    #[test]
    fn sizing_applies_margin_cap() {
        let mut c = cfg(0.0);
        c.risk_percent = 1.0;
        c.fixed_leverage = 1;
        let qty = PositionSizer::size(1000.0, 95000.0, 1.0, &c, 1.0, 0.0001).unwrap();
        let margin_cap = 0.90 * 1000.0 * 1.0 / 95000.0;
        assert!(qty <= margin_cap + 1e-9);
    }

    #[test]
    fn floor_to_step_never_rounds_up() {
        assert_eq!(floor_to_step(0.1234, 0.01), 0.12);
        assert_eq!(floor_to_step(0.009, 0.01), 0.0);
    }

    #[test]
    fn circuit_breaker_trips_at_threshold_from_scenario_s5() {
        let cb = CircuitBreaker::new(Arc::new(FixedClock::new(Utc::now())));
        cb.record_realised(-2000.0);
        assert!(cb.is_tripped(&cfg(2000.0)));
    }

    #[test]
    fn circuit_breaker_ignores_disabled_limit() {
        let cb = CircuitBreaker::new(Arc::new(FixedClock::new(Utc::now())));
        cb.record_realised(-50_000.0);
        assert!(!cb.is_tripped(&cfg(0.0)));
    }

    #[test]
    fn circuit_breaker_resets_on_day_rollover() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let cb = CircuitBreaker::new(clock.clone());
        cb.record_realised(-2000.0);
        assert!(cb.is_tripped(&cfg(2000.0)));
        clock.advance(chrono::Duration::days(1));
        assert!(!cb.is_tripped(&cfg(2000.0)));
    }
}
