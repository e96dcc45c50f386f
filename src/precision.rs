// ===============================
// src/precision.rs
// ===============================
//
// Pembulatan ke granularity exchange:
// - qty selalu floor ke amount_step (tidak pernah melebihi budget/posisi)
// - harga floor ke price_tick
// Semua pakai Decimal supaya 0.1 + 0.2 tetap 0.3.
//
use rust_decimal::Decimal;

/// Floor `value` to a multiple of `step`. A non-positive step leaves the value untouched.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).floor() * step).normalize()
}

/// Quantity bought by `budget` quote units at `price`, before rounding.
pub fn qty_for_budget(budget: Decimal, price: Decimal) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    budget / price
}

/// `base * (1 + pct/100)`.
pub fn offset_up(base: Decimal, pct: Decimal) -> Decimal {
    base * (Decimal::ONE + pct / Decimal::ONE_HUNDRED)
}

/// `base * (1 - pct/100)`.
pub fn offset_down(base: Decimal, pct: Decimal) -> Decimal {
    base * (Decimal::ONE - pct / Decimal::ONE_HUNDRED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn floors_to_lot_step() {
        assert_eq!(floor_to_step(dec!(0.0029), dec!(0.001)), dec!(0.002));
        assert_eq!(floor_to_step(dec!(0.002), dec!(0.001)), dec!(0.002));
        assert_eq!(floor_to_step(dec!(0.0009), dec!(0.001)), dec!(0));
    }

    #[test]
    fn floors_to_coarse_tick() {
        assert_eq!(floor_to_step(dec!(49499.99), dec!(0.5)), dec!(49499.5));
        assert_eq!(floor_to_step(dec!(123.456), dec!(10)), dec!(120));
    }

    #[test]
    fn zero_step_is_identity() {
        assert_eq!(floor_to_step(dec!(1.23456), Decimal::ZERO), dec!(1.23456));
    }

    #[test]
    fn entry_budget_at_50k_rounds_to_two_lots() {
        let raw = qty_for_budget(dec!(100), dec!(50000));
        assert_eq!(raw, dec!(0.002));
        assert_eq!(floor_to_step(raw, dec!(0.001)), dec!(0.002));
    }

    #[test]
    fn percent_offsets() {
        assert_eq!(offset_up(dec!(50000), dec!(1)), dec!(50500));
        assert_eq!(offset_down(dec!(50000), dec!(2)), dec!(49000));
    }
}
