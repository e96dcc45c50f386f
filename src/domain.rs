// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::precision;

/// Arah deal (posisi), bukan arah order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Long, Short }

impl Side {
    /// Order side that opens / adds to the position.
    pub fn entry(&self) -> OrderSide { match self { Side::Long => OrderSide::Buy, Side::Short => OrderSide::Sell } }
    /// Order side that reduces / closes the position.
    pub fn exit(&self) -> OrderSide { match self { Side::Long => OrderSide::Sell, Side::Short => OrderSide::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Long => "long", Side::Short => "short" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide { Buy, Sell }

impl OrderSide {
    pub fn as_str(&self) -> &'static str { match self { OrderSide::Buy => "buy", OrderSide::Sell => "sell" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode { Isolated, Cross }

/// Lot step / tick size / min qty per symbol. Fetched once per deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPrecision {
    pub amount_step: Decimal,
    pub min_amount: Decimal,
    pub price_tick: Decimal,
}

impl MarketPrecision {
    pub fn min_tradable_amount(&self) -> Decimal {
        self.amount_step.max(self.min_amount)
    }

    pub fn round_amount_down(&self, raw_qty: Decimal) -> Decimal {
        precision::floor_to_step(raw_qty, self.amount_step).max(Decimal::ZERO)
    }

    pub fn round_price_to_tick(&self, raw_price: Decimal) -> Decimal {
        precision::floor_to_step(raw_price, self.price_tick)
    }

    pub fn is_tradable(&self, qty: Decimal) -> bool {
        qty >= self.min_tradable_amount()
    }
}

/// Live position as reported by the venue. `size` is always absolute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub average_entry_price: Decimal,
    pub size: Decimal,
    pub side: Option<Side>,
}

impl PositionSnapshot {
    pub fn flat() -> Self { Self::default() }

    pub fn is_open(&self) -> bool {
        self.size > Decimal::ZERO && self.average_entry_price > Decimal::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind { Entry, Grid, Tp, Sl, SlMoveBe }

/// Record emitted to the event sink (recorder / dashboards).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub symbol: String,
    pub side: Option<OrderSide>,
    pub price: Option<Decimal>,
    pub qty: Option<Decimal>,
    pub ts: DateTime<Utc>,
}

impl DealEvent {
    pub fn new(kind: EventKind, symbol: &str, side: Option<OrderSide>, price: Option<Decimal>, qty: Option<Decimal>) -> Self {
        Self { kind, symbol: symbol.to_string(), side, price, qty, ts: Utc::now() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn min_tradable_is_larger_of_step_and_min() {
        let p = MarketPrecision { amount_step: dec!(0.001), min_amount: dec!(0.005), price_tick: dec!(0.1) };
        assert_eq!(p.min_tradable_amount(), dec!(0.005));
        let p = MarketPrecision { amount_step: dec!(0.01), min_amount: dec!(0.001), price_tick: dec!(0.1) };
        assert_eq!(p.min_tradable_amount(), dec!(0.01));
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let ev = DealEvent::new(EventKind::SlMoveBe, "BTCUSDT", None, Some(dec!(50000)), None);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "sl_move_be");
        assert_eq!(v["symbol"], "BTCUSDT");
        assert!(v["side"].is_null());
    }

    #[test]
    fn sides_map_to_order_sides() {
        assert_eq!(Side::Long.entry(), OrderSide::Buy);
        assert_eq!(Side::Long.exit(), OrderSide::Sell);
        assert_eq!(Side::Short.entry(), OrderSide::Sell);
        assert_eq!(Side::Short.exit(), OrderSide::Buy);
    }
}
