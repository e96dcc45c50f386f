// ===============================
// src/stoploss.rs
// ===============================
//
// State machine SL: Inactive -> Armed -> (Armed | BreakevenMoved) -> Triggered.
// Murni (tanpa I/O); engine yang mengeksekusi close + event.
// Urutan per tick: breakeven -> trailing -> trigger.
//
use rust_decimal::Decimal;

use crate::config::DealConfig;
use crate::domain::{MarketPrecision, Side};
use crate::precision::{offset_down, offset_up};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlPhase { Inactive, Armed, BreakevenMoved, Triggered }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlParams {
    pub side: Side,
    pub stop_loss_percent: Decimal,
    pub trailing_offset_percent: Decimal,
    pub move_to_breakeven: bool,
}

impl SlParams {
    pub fn from_config(cfg: &DealConfig) -> Self {
        Self {
            side: cfg.side,
            stop_loss_percent: cfg.stop_loss_percent,
            trailing_offset_percent: cfg.trailing_sl_offset_percent,
            move_to_breakeven: cfg.move_sl_to_breakeven,
        }
    }

    /// Is `candidate` a tighter stop than `current` for this side?
    fn tighter(&self, candidate: Decimal, current: Decimal) -> bool {
        match self.side {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlState {
    pub phase: SlPhase,
    pub stop_price: Decimal,
    pub best_price: Decimal,
    pub breakeven_applied: bool,
}

/// What changed during one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlTickOutcome {
    pub breakeven_moved: bool,
    pub trailed: bool,
    pub triggered: bool,
}

impl Default for SlState {
    fn default() -> Self { Self::inactive() }
}

impl SlState {
    pub fn inactive() -> Self {
        Self { phase: SlPhase::Inactive, stop_price: Decimal::ZERO, best_price: Decimal::ZERO, breakeven_applied: false }
    }

    /// Arm against the confirmed entry average.
    pub fn arm(params: &SlParams, avg: Decimal, precision: &MarketPrecision) -> Self {
        let raw = match params.side {
            Side::Long => offset_down(avg, params.stop_loss_percent),
            Side::Short => offset_up(avg, params.stop_loss_percent),
        };
        Self {
            phase: SlPhase::Armed,
            stop_price: precision.round_price_to_tick(raw),
            best_price: avg,
            breakeven_applied: false,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, SlPhase::Armed | SlPhase::BreakevenMoved)
    }

    /// Back out of `Triggered` after the close order failed. Stop and breakeven are kept.
    pub fn undo_trigger(&mut self) {
        if self.phase == SlPhase::Triggered {
            self.phase = if self.breakeven_applied { SlPhase::BreakevenMoved } else { SlPhase::Armed };
        }
    }

    /// Advance one tick. `tp_filled` = a tracked TP id vanished from open orders.
    pub fn tick(
        &mut self,
        params: &SlParams,
        precision: &MarketPrecision,
        last: Decimal,
        avg: Decimal,
        tp_filled: bool,
    ) -> SlTickOutcome {
        let mut out = SlTickOutcome::default();
        if !self.is_active() {
            return out;
        }

        if params.move_to_breakeven && !self.breakeven_applied && tp_filled && avg > Decimal::ZERO {
            let be = precision.round_price_to_tick(avg);
            // trailing yang sudah lewat breakeven tidak dilonggarkan
            if params.tighter(be, self.stop_price) {
                self.stop_price = be;
            }
            self.breakeven_applied = true;
            self.phase = SlPhase::BreakevenMoved;
            out.breakeven_moved = true;
        }

        if params.trailing_offset_percent > Decimal::ZERO {
            self.best_price = match params.side {
                Side::Long => self.best_price.max(last),
                Side::Short => self.best_price.min(last),
            };
            let raw = match params.side {
                Side::Long => offset_down(self.best_price, params.trailing_offset_percent),
                Side::Short => offset_up(self.best_price, params.trailing_offset_percent),
            };
            let candidate = precision.round_price_to_tick(raw);
            if params.tighter(candidate, self.stop_price) {
                self.stop_price = candidate;
                out.trailed = true;
            }
        }

        let hit = match params.side {
            Side::Long => last <= self.stop_price,
            Side::Short => last >= self.stop_price,
        };
        if hit {
            self.phase = SlPhase::Triggered;
            out.triggered = true;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc() -> MarketPrecision {
        MarketPrecision { amount_step: dec!(0.001), min_amount: dec!(0.001), price_tick: dec!(0.1) }
    }

    fn params(side: Side) -> SlParams {
        SlParams { side, stop_loss_percent: dec!(2), trailing_offset_percent: dec!(1), move_to_breakeven: true }
    }

    #[test]
    fn arms_two_percent_below_long_entry() {
        let sl = SlState::arm(&params(Side::Long), dec!(50000), &btc());
        assert_eq!(sl.phase, SlPhase::Armed);
        assert_eq!(sl.stop_price, dec!(49000));
        assert_eq!(sl.best_price, dec!(50000));
    }

    #[test]
    fn trailing_follows_best_price() {
        let p = params(Side::Long);
        let mut sl = SlState::arm(&p, dec!(50000), &btc());
        let out = sl.tick(&p, &btc(), dec!(51000), dec!(50000), false);
        assert!(out.trailed && !out.triggered);
        assert_eq!(sl.stop_price, dec!(50490));
    }

    #[test]
    fn stop_never_loosens() {
        let p = params(Side::Long);
        let mut sl = SlState::arm(&p, dec!(50000), &btc());
        let mut prev = sl.stop_price;
        for last in [dec!(50500), dec!(51200), dec!(50900), dec!(51100), dec!(51300), dec!(50800)] {
            sl.tick(&p, &btc(), last, dec!(50000), false);
            assert!(sl.stop_price >= prev);
            prev = sl.stop_price;
        }

        let p = params(Side::Short);
        let mut sl = SlState::arm(&p, dec!(50000), &btc());
        assert_eq!(sl.stop_price, dec!(51000));
        let mut prev = sl.stop_price;
        for last in [dec!(49500), dec!(48800), dec!(49100), dec!(48700)] {
            sl.tick(&p, &btc(), last, dec!(50000), false);
            assert!(sl.stop_price <= prev);
            prev = sl.stop_price;
        }
    }

    #[test]
    fn zero_offset_disables_trailing() {
        let mut p = params(Side::Long);
        p.trailing_offset_percent = Decimal::ZERO;
        let mut sl = SlState::arm(&p, dec!(50000), &btc());
        sl.tick(&p, &btc(), dec!(60000), dec!(50000), false);
        assert_eq!(sl.stop_price, dec!(49000));
    }

    #[test]
    fn breakeven_applies_once() {
        let mut p = params(Side::Long);
        p.trailing_offset_percent = Decimal::ZERO;
        let mut sl = SlState::arm(&p, dec!(50000), &btc());

        let out = sl.tick(&p, &btc(), dec!(50400), dec!(50000), true);
        assert!(out.breakeven_moved);
        assert_eq!(sl.phase, SlPhase::BreakevenMoved);
        assert_eq!(sl.stop_price, dec!(50000));

        // avg turun setelah grid fill; breakeven tidak diulang
        let out = sl.tick(&p, &btc(), dec!(50400), dec!(49500), true);
        assert!(!out.breakeven_moved);
        assert_eq!(sl.stop_price, dec!(50000));
    }

    #[test]
    fn breakeven_keeps_tighter_trailing_stop() {
        let p = params(Side::Long);
        let mut sl = SlState::arm(&p, dec!(50000), &btc());
        sl.tick(&p, &btc(), dec!(52000), dec!(50000), false);
        assert_eq!(sl.stop_price, dec!(51480));
        sl.tick(&p, &btc(), dec!(51600), dec!(50000), true);
        assert!(sl.breakeven_applied);
        assert_eq!(sl.stop_price, dec!(51480));
    }

    #[test]
    fn triggers_when_price_crosses_stop() {
        let p = params(Side::Long);
        let mut sl = SlState::arm(&p, dec!(50000), &btc());
        let out = sl.tick(&p, &btc(), dec!(48999.9), dec!(50000), false);
        assert!(out.triggered);
        assert_eq!(sl.phase, SlPhase::Triggered);
        assert!(!sl.is_active());
        // setelah Triggered tidak ada perubahan lagi
        assert_eq!(sl.tick(&p, &btc(), dec!(40000), dec!(50000), true), SlTickOutcome::default());

        let p = params(Side::Short);
        let mut sl = SlState::arm(&p, dec!(50000), &btc());
        assert!(sl.tick(&p, &btc(), dec!(51000), dec!(50000), false).triggered);
    }

    #[test]
    fn inactive_state_ignores_ticks() {
        let mut sl = SlState::inactive();
        assert_eq!(sl.tick(&params(Side::Long), &btc(), dec!(1), dec!(50000), true), SlTickOutcome::default());
    }

    #[test]
    fn undo_trigger_keeps_breakeven() {
        let mut p = params(Side::Long);
        p.trailing_offset_percent = Decimal::ZERO;
        let mut sl = SlState::arm(&p, dec!(50000), &btc());

        let out = sl.tick(&p, &btc(), dec!(49950), dec!(50000), true);
        assert!(out.breakeven_moved && out.triggered);

        sl.undo_trigger();
        assert_eq!(sl.phase, SlPhase::BreakevenMoved);
        assert_eq!(sl.stop_price, dec!(50000));
        assert!(sl.breakeven_applied);

        let out = sl.tick(&p, &btc(), dec!(49950), dec!(50000), true);
        assert!(!out.breakeven_moved && out.triggered);
    }
}
