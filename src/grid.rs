// ===============================
// src/grid.rs
// ===============================
//
// Grid DCA: N limit order (post-only, bukan reduce-only) di sisi masuk,
// tersebar rata sampai range_percent dari harga referensi.
//
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::DealConfig;
use crate::domain::{EventKind, MarketPrecision, Side};
use crate::error::GatewayError;
use crate::gateway::{ExchangeGateway, LimitOrderRequest, PlaceOutcome};
use crate::metrics::{ORDERS_PLACED, ORDERS_SKIPPED};
use crate::recorder::EventSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridLevel {
    pub index: u32,
    pub price: Decimal,
    pub qty: Decimal,
}

/// Placed grid order ids, in level order. Filled ids are pruned by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridState {
    pub order_ids: Vec<String>,
}

pub fn raw_level_price(side: Side, reference: Decimal, range_percent: Decimal, i: u32, n: u32) -> Decimal {
    let frac = range_percent / Decimal::ONE_HUNDRED * Decimal::from(i) / Decimal::from(n);
    match side {
        Side::Long => reference * (Decimal::ONE - frac),
        Side::Short => reference * (Decimal::ONE + frac),
    }
}

/// Levels that survive rounding; untradable ones are dropped.
pub fn plan_levels(cfg: &DealConfig, precision: &MarketPrecision, reference: Decimal) -> Vec<GridLevel> {
    let n = cfg.limit_orders.orders_count;
    if n == 0 || cfg.limit_orders_amount <= Decimal::ZERO {
        return Vec::new();
    }
    let per_level = cfg.limit_orders_amount / Decimal::from(n);

    let mut out = Vec::with_capacity(n as usize);
    for i in 1..=n {
        let price = precision.round_price_to_tick(raw_level_price(cfg.side, reference, cfg.limit_orders.range_percent, i, n));
        if price <= Decimal::ZERO {
            warn!(level = i, "grid level price rounds to zero, skipped");
            continue;
        }
        let qty = precision.round_amount_down(per_level / price);
        if !precision.is_tradable(qty) {
            warn!(level = i, price = %price, qty = %qty, min = %precision.min_tradable_amount(), "grid level below min tradable, skipped");
            ORDERS_SKIPPED.with_label_values(&["grid"]).inc();
            continue;
        }
        out.push(GridLevel { index: i, price, qty });
    }
    out
}

/// Place every planned level. Soft rejections are skipped; hard errors abort the placement.
pub async fn place_grid(
    gw: &dyn ExchangeGateway,
    cfg: &DealConfig,
    precision: &MarketPrecision,
    reference: Decimal,
    sink: &EventSink,
) -> Result<GridState, GatewayError> {
    let mut state = GridState::default();
    let side = cfg.side.entry();

    for level in plan_levels(cfg, precision, reference) {
        let req = LimitOrderRequest { side, qty: level.qty, price: level.price, reduce_only: false, post_only: true };
        match gw.place_limit_order(&cfg.symbol, &req).await? {
            PlaceOutcome::Placed(id) => {
                info!(symbol = %cfg.symbol, level = level.index, price = %level.price, qty = %level.qty, order_id = %id, "grid order placed");
                ORDERS_PLACED.with_label_values(&["grid"]).inc();
                sink.emit(EventKind::Grid, &cfg.symbol, Some(side), Some(level.price), Some(level.qty));
                state.order_ids.push(id);
            }
            PlaceOutcome::Rejected(reason) => {
                warn!(symbol = %cfg.symbol, level = level.index, ?reason, "grid order rejected, skipped");
                ORDERS_SKIPPED.with_label_values(&["grid"]).inc();
            }
        }
    }
    Ok(state)
}
