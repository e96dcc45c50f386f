// ===============================
// src/takeprofit.rs
// ===============================
//
// TP ladder: selalu dibangun ulang dari posisi live (cancel semua -> pasang lagi).
// Level terakhir mengambil sisa posisi, jadi total TP tidak pernah > size.
//
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::DealConfig;
use crate::domain::{EventKind, MarketPrecision, PositionSnapshot, Side};
use crate::error::GatewayError;
use crate::gateway::{ExchangeGateway, LimitOrderRequest, PlaceOutcome};
use crate::metrics::{ORDERS_PLACED, ORDERS_SKIPPED};
use crate::precision::{offset_down, offset_up};
use crate::recorder::EventSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpLevel {
    pub index: usize,
    pub price: Decimal,
    pub qty: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpLadderState {
    pub order_ids: Vec<String>,
}

fn level_price(side: Side, avg: Decimal, pct: Decimal, precision: &MarketPrecision) -> Decimal {
    let raw = match side {
        Side::Long => offset_up(avg, pct),
        Side::Short => offset_down(avg, pct),
    };
    precision.round_price_to_tick(raw)
}

/// Rounded qty for one level, clamped to what is still unallocated. `None` = skip.
fn level_qty(precision: &MarketPrecision, target: Decimal, remaining: Decimal) -> Option<Decimal> {
    let mut qty = precision.round_amount_down(target);
    if !precision.is_tradable(qty) {
        return None;
    }
    if qty > remaining {
        qty = precision.round_amount_down(remaining);
        if !precision.is_tradable(qty) {
            return None;
        }
    }
    Some(qty)
}

fn level_target(cfg: &DealConfig, position: &PositionSnapshot, i: usize, remaining: Decimal) -> Decimal {
    if i + 1 == cfg.tp_orders.len() {
        remaining
    } else {
        position.size * cfg.tp_orders[i].quantity_percent / Decimal::ONE_HUNDRED
    }
}

/// Pure ladder plan against `position`, assuming every level gets placed.
pub fn plan_ladder(cfg: &DealConfig, precision: &MarketPrecision, position: &PositionSnapshot) -> Vec<TpLevel> {
    if !position.is_open() {
        return Vec::new();
    }
    let mut remaining = position.size;
    let mut out = Vec::with_capacity(cfg.tp_orders.len());
    for (i, tp) in cfg.tp_orders.iter().enumerate() {
        let price = level_price(cfg.side, position.average_entry_price, tp.price_percent, precision);
        match level_qty(precision, level_target(cfg, position, i, remaining), remaining) {
            Some(qty) if price > Decimal::ZERO => {
                remaining -= qty;
                out.push(TpLevel { index: i + 1, price, qty });
            }
            _ => debug!(level = i + 1, "tp level skipped"),
        }
    }
    out
}

/// Cancel the tracked ladder and re-place it against the live position.
/// A level that fails hard does not stop the later ones; the first error is
/// returned once every level has been tried.
pub async fn replace_ladder(
    gw: &dyn ExchangeGateway,
    cfg: &DealConfig,
    precision: &MarketPrecision,
    position: &PositionSnapshot,
    ladder: &mut TpLadderState,
    sink: &EventSink,
) -> Result<(), GatewayError> {
    if !ladder.order_ids.is_empty() {
        gw.cancel_orders(&cfg.symbol, &ladder.order_ids).await;
        ladder.order_ids.clear();
    }
    if !position.is_open() {
        debug!(symbol = %cfg.symbol, "no open position, tp ladder left empty");
        return Ok(());
    }

    debug!(symbol = %cfg.symbol, plan = ?plan_ladder(cfg, precision, position), "tp ladder plan");
    let side = cfg.side.exit();
    let mut remaining = position.size;
    let mut first_err: Option<GatewayError> = None;

    for (i, tp) in cfg.tp_orders.iter().enumerate() {
        let price = level_price(cfg.side, position.average_entry_price, tp.price_percent, precision);
        let Some(qty) = level_qty(precision, level_target(cfg, position, i, remaining), remaining) else {
            warn!(symbol = %cfg.symbol, level = i + 1, remaining = %remaining, "tp level below min tradable, skipped");
            ORDERS_SKIPPED.with_label_values(&["tp"]).inc();
            continue;
        };

        let req = LimitOrderRequest { side, qty, price, reduce_only: true, post_only: true };
        let placed = match gw.place_limit_order(&cfg.symbol, &req).await {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %cfg.symbol, level = i + 1, price = %price, error = %e, "tp order failed, trying next level");
                first_err.get_or_insert(e);
                continue;
            }
        };
        match placed {
            PlaceOutcome::Placed(id) => {
                // sisa dihitung dari order yang benar-benar terpasang
                remaining -= qty;
                info!(symbol = %cfg.symbol, level = i + 1, price = %price, qty = %qty, order_id = %id, "tp order placed");
                ORDERS_PLACED.with_label_values(&["tp"]).inc();
                sink.emit(EventKind::Tp, &cfg.symbol, Some(side), Some(price), Some(qty));
                ladder.order_ids.push(id);
            }
            PlaceOutcome::Rejected(reason) => {
                warn!(symbol = %cfg.symbol, level = i + 1, ?reason, "tp order rejected, skipped");
                ORDERS_SKIPPED.with_label_values(&["tp"]).inc();
            }
        }
    }
    // ladder tidak lengkap: caller harus membangun ulang
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
