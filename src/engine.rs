// ===============================
// src/engine.rs
// ===============================
//
// Satu deal = satu alur async berurutan:
//   setup (precision, margin, leverage, entry, SL, grid, TP) -> loop reconcile.
// Exchange adalah sumber kebenaran; setiap tick baca ulang open orders & posisi.
//
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use tokio::{
    sync::watch,
    time::{sleep, Duration},
};
use tracing::{debug, error, info, warn};

use crate::config::DealConfig;
use crate::domain::{EventKind, MarketPrecision, PositionSnapshot};
use crate::error::{classify, ConfigError, DealError, ErrorClass, GatewayError};
use crate::gateway::{ExchangeGateway, SettingOutcome};
use crate::grid::{self, GridState};
use crate::metrics::{self, DEAL_OUTCOMES, LAST_PRICE, ORDERS_PLACED, POSITION_SIZE, STOP_PRICE, TICKS, TICK_ERRORS};
use crate::precision::qty_for_budget;
use crate::reconcile;
use crate::recorder::EventSink;
use crate::stoploss::{SlParams, SlState};
use crate::takeprofit::{self, TpLadderState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealOutcome {
    StopLoss,
    Expired,
    PositionClosed,
    Aborted,
}

impl DealOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealOutcome::StopLoss => "stop_loss",
            DealOutcome::Expired => "expired",
            DealOutcome::PositionClosed => "position_closed",
            DealOutcome::Aborted => "aborted",
        }
    }
}

/// Everything the loop mutates. Owned by the engine for one deal.
#[derive(Debug, Clone)]
pub struct DealState {
    pub precision: MarketPrecision,
    pub grid: GridState,
    pub tp: TpLadderState,
    pub sl: SlState,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

pub struct DealEngine {
    gw: Arc<dyn ExchangeGateway>,
    cfg: DealConfig,
    sl_params: SlParams,
    sink: EventSink,
    poll_interval: Duration,
}

impl DealEngine {
    pub fn new(gw: Arc<dyn ExchangeGateway>, cfg: DealConfig, sink: EventSink, poll_interval: Duration) -> Self {
        let sl_params = SlParams::from_config(&cfg);
        Self { gw, cfg, sl_params, sink, poll_interval }
    }

    /// Run one deal to a terminal outcome. Setup failures are fatal; tick failures are not.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<DealOutcome, DealError> {
        let mut state = self.setup().await?;

        let outcome = loop {
            if *shutdown.borrow() {
                break DealOutcome::Aborted;
            }
            if self.wait_next_tick(&mut shutdown).await {
                break DealOutcome::Aborted;
            }

            TICKS.inc();
            match self.tick(&mut state).await {
                Ok(Some(done)) => break done,
                Ok(None) => {}
                Err(e) => {
                    TICK_ERRORS.inc();
                    warn!(symbol = %self.cfg.symbol, error = %e, "tick failed, retrying next interval");
                }
            }
        };

        DEAL_OUTCOMES.with_label_values(&[outcome.as_str()]).inc();
        info!(symbol = %self.cfg.symbol, outcome = outcome.as_str(), "deal finished");
        Ok(outcome)
    }

    /// Sleep one poll interval; `true` when shutdown was requested meanwhile.
    async fn wait_next_tick(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = sleep(self.poll_interval) => false,
            res = shutdown.changed() => match res {
                Ok(()) => *shutdown.borrow(),
                // sender sudah di-drop: tidak ada lagi yang bisa minta stop
                Err(_) => {
                    sleep(self.poll_interval).await;
                    false
                }
            },
        }
    }

    pub(crate) async fn setup(&self) -> Result<DealState, DealError> {
        let cfg = &self.cfg;
        let gw = self.gw.as_ref();
        cfg.validate()?;

        let precision = gw.precision(&cfg.symbol).await.map_err(DealError::exchange("precision"))?;

        if let Some(mode) = cfg.margin_mode {
            tolerate("margin_mode", gw.set_margin_mode(&cfg.symbol, mode).await)?;
        }
        tolerate("leverage", gw.set_leverage(&cfg.symbol, cfg.leverage).await)?;

        let last = gw.last_price(&cfg.symbol).await.map_err(DealError::exchange("last_price"))?;
        let qty = precision.round_amount_down(qty_for_budget(cfg.market_order_amount, last));
        if !precision.is_tradable(qty) {
            return Err(DealError::EntryQtyTooSmall { qty, min: precision.min_tradable_amount() });
        }

        // sebelum entry: durasi di luar jangkauan gagal tanpa posisi terbuka
        let started_at = Utc::now();
        let deadline = deal_deadline(started_at, cfg.limit_orders.deal_duration_minutes)?;

        let entry_side = cfg.side.entry();
        let order_id = gw
            .place_market_order(&cfg.symbol, entry_side, qty, false)
            .await
            .map_err(DealError::exchange("entry"))?;
        ORDERS_PLACED.with_label_values(&["entry"]).inc();
        info!(symbol = %cfg.symbol, side = cfg.side.as_str(), price = %last, qty = %qty, %order_id, "entry filled");
        self.sink.emit(EventKind::Entry, &cfg.symbol, Some(entry_side), Some(last), Some(qty));

        let mut position = gw.position(&cfg.symbol).await.map_err(DealError::exchange("position"))?;
        if !position.is_open() {
            // venue belum melaporkan posisi; pakai harga entry sebagai rata-rata sementara
            warn!(symbol = %cfg.symbol, "position not reported after entry, arming from entry price");
            position = PositionSnapshot { average_entry_price: last, size: qty, side: Some(cfg.side) };
        }
        let sl = SlState::arm(&self.sl_params, position.average_entry_price, &precision);
        STOP_PRICE.with_label_values(&[cfg.symbol.as_str()]).set(metrics::as_f64(sl.stop_price));
        info!(symbol = %cfg.symbol, avg = %position.average_entry_price, stop = %sl.stop_price, "stop-loss armed");

        let grid = grid::place_grid(gw, cfg, &precision, last, &self.sink)
            .await
            .map_err(DealError::exchange("grid"))?;

        let mut tp = TpLadderState::default();
        takeprofit::replace_ladder(gw, cfg, &precision, &position, &mut tp, &self.sink)
            .await
            .map_err(DealError::exchange("take_profit"))?;

        info!(
            symbol = %cfg.symbol,
            grid_orders = grid.order_ids.len(),
            tp_orders = tp.order_ids.len(),
            deadline = %deadline,
            "deal started"
        );
        Ok(DealState { precision, grid, tp, sl, started_at, deadline })
    }

    /// One reconciliation pass. `Some(outcome)` ends the deal.
    pub(crate) async fn tick(&self, st: &mut DealState) -> Result<Option<DealOutcome>, GatewayError> {
        let cfg = &self.cfg;
        let gw = self.gw.as_ref();

        let open = gw.open_order_ids(&cfg.symbol).await?;
        let obs = reconcile::observe(&open, &st.grid, &st.tp);
        let position = gw.position(&cfg.symbol).await?;
        POSITION_SIZE.with_label_values(&[cfg.symbol.as_str()]).set(metrics::as_f64(position.size));

        if !position.is_open() {
            info!(symbol = %cfg.symbol, "position flat, closing deal");
            self.cancel_all(st).await;
            return Ok(Some(DealOutcome::PositionClosed));
        }

        if obs.grid_changed() {
            info!(
                symbol = %cfg.symbol,
                filled = obs.filled_grid.len(),
                avg = %position.average_entry_price,
                size = %position.size,
                "grid fill detected, rebuilding tp ladder"
            );
            takeprofit::replace_ladder(gw, cfg, &st.precision, &position, &mut st.tp, &self.sink).await?;
            // baru di-prune setelah ladder lengkap; kalau gagal, tick berikutnya rebuild lagi
            reconcile::prune_grid(&mut st.grid, &obs.filled_grid);
        }

        if st.sl.is_active() {
            let last = gw.last_price(&cfg.symbol).await?;
            LAST_PRICE.set(metrics::as_f64(last));
            let step = st.sl.tick(&self.sl_params, &st.precision, last, position.average_entry_price, obs.tp_vanished);
            STOP_PRICE.with_label_values(&[cfg.symbol.as_str()]).set(metrics::as_f64(st.sl.stop_price));

            if step.breakeven_moved {
                info!(symbol = %cfg.symbol, stop = %st.sl.stop_price, "take-profit filled, stop moved to breakeven");
                self.sink.emit(EventKind::SlMoveBe, &cfg.symbol, None, Some(st.sl.stop_price), None);
            }
            if step.trailed {
                debug!(symbol = %cfg.symbol, best = %st.sl.best_price, stop = %st.sl.stop_price, "trailing stop moved");
            }
            if step.triggered {
                if let Err(e) = self.close_on_stop(st, last).await {
                    // coba lagi di tick berikutnya; breakeven yang sudah jalan tetap berlaku
                    st.sl.undo_trigger();
                    return Err(e);
                }
                return Ok(Some(DealOutcome::StopLoss));
            }
        }

        if Utc::now() >= st.deadline {
            info!(
                symbol = %cfg.symbol,
                elapsed_min = (Utc::now() - st.started_at).num_minutes(),
                grid_orders = st.grid.order_ids.len(),
                "deal duration reached, cancelling grid"
            );
            gw.cancel_orders(&cfg.symbol, &st.grid.order_ids).await;
            st.grid.order_ids.clear();
            return Ok(Some(DealOutcome::Expired));
        }
        Ok(None)
    }

    async fn close_on_stop(&self, st: &mut DealState, last: Decimal) -> Result<(), GatewayError> {
        let cfg = &self.cfg;
        // ukuran dibaca ulang: grid bisa saja fill di harga yang sama
        let live = self.gw.position(&cfg.symbol).await?;
        if live.is_open() {
            let side = cfg.side.exit();
            let order_id = self.gw.place_market_order(&cfg.symbol, side, live.size, true).await?;
            ORDERS_PLACED.with_label_values(&["sl"]).inc();
            error!(
                symbol = %cfg.symbol,
                last = %last,
                stop = %st.sl.stop_price,
                qty = %live.size,
                %order_id,
                "stop-loss triggered, position closed"
            );
            self.sink.emit(EventKind::Sl, &cfg.symbol, Some(side), Some(last), Some(live.size));
        }
        self.cancel_all(st).await;
        Ok(())
    }

    async fn cancel_all(&self, st: &mut DealState) {
        let ids: Vec<String> = st.grid.order_ids.drain(..).chain(st.tp.order_ids.drain(..)).collect();
        self.gw.cancel_orders(&self.cfg.symbol, &ids).await;
    }
}

/// `start + minutes`, or `ConfigInvalid` when it does not fit in a timestamp.
fn deal_deadline(start: DateTime<Utc>, minutes: u64) -> Result<DateTime<Utc>, DealError> {
    i64::try_from(minutes)
        .ok()
        .and_then(TimeDelta::try_minutes)
        .and_then(|d| start.checked_add_signed(d))
        .ok_or_else(|| ConfigError::invalid("limit_orders.deal_duration_minutes", "out of range").into())
}

fn tolerate(stage: &'static str, res: Result<SettingOutcome, GatewayError>) -> Result<(), DealError> {
    match res {
        Ok(SettingOutcome::Applied) => Ok(()),
        Ok(SettingOutcome::AlreadySet) => {
            info!(stage, "already set, continuing");
            Ok(())
        }
        Err(e) => match classify(&e) {
            ErrorClass::Soft(reason) => {
                warn!(stage, ?reason, "soft venue error, continuing");
                Ok(())
            }
            ErrorClass::Hard => Err(DealError::Exchange { stage, source: e }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DealEvent, Side};
    use crate::gateway::PaperGateway;
    use crate::stoploss::SlPhase;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    const DEAL: &str = r#"{
        "symbol": "BTCUSDT", "side": "long", "market_order_amount": 100, "leverage": 5,
        "stop_loss_percent": 2, "trailing_sl_offset_percent": 0, "move_sl_to_breakeven": true,
        "limit_orders_amount": 500,
        "limit_orders": { "range_percent": 5, "orders_count": 5, "deal_duration_minutes": 60 },
        "tp_orders": [ { "price_percent": 1, "quantity_percent": 50 }, { "price_percent": 2, "quantity_percent": 50 } ]
    }"#;

    fn deal() -> DealConfig {
        serde_json::from_str(DEAL).unwrap()
    }

    fn btc() -> MarketPrecision {
        MarketPrecision { amount_step: dec!(0.001), min_amount: dec!(0.001), price_tick: dec!(0.1) }
    }

    fn paper() -> Arc<PaperGateway> {
        Arc::new(PaperGateway::new(btc(), dec!(50000)))
    }

    fn engine(gw: Arc<PaperGateway>, cfg: DealConfig, sink: EventSink) -> DealEngine {
        DealEngine::new(gw, cfg, sink, Duration::from_millis(1))
    }

    fn drain(rx: &mut mpsc::Receiver<DealEvent>) -> Vec<EventKind> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev.kind);
        }
        out
    }

    #[tokio::test]
    async fn setup_buys_entry_and_lays_orders() {
        let gw = paper();
        let (tx, mut rx) = mpsc::channel(64);
        let st = engine(gw.clone(), deal(), EventSink::new(tx)).setup().await.unwrap();

        let pos = gw.position("BTCUSDT").await.unwrap();
        assert_eq!(pos.size, dec!(0.002));
        assert_eq!(gw.leverage().await, Some(5));
        assert_eq!(st.grid.order_ids.len(), 5);
        assert_eq!(st.tp.order_ids.len(), 2);
        assert_eq!(st.sl.stop_price, dec!(49000));
        assert_eq!(gw.resting_reduce_only_qty().await, dec!(0.002));

        let kinds = drain(&mut rx);
        assert_eq!(kinds[0], EventKind::Entry);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Grid).count(), 5);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Tp).count(), 2);
    }

    #[tokio::test]
    async fn tiny_entry_fails_before_any_order() {
        let gw = paper();
        let mut cfg = deal();
        cfg.market_order_amount = dec!(10);
        let err = engine(gw.clone(), cfg, EventSink::disabled()).setup().await.unwrap_err();
        assert!(matches!(err, DealError::EntryQtyTooSmall { .. }));
        assert_eq!(gw.position("BTCUSDT").await.unwrap(), PositionSnapshot::flat());
        assert_eq!(gw.resting_count().await, 0);
    }

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let mut cfg = deal();
        cfg.tp_orders[0].quantity_percent = dec!(10);
        let err = engine(paper(), cfg, EventSink::disabled()).setup().await.unwrap_err();
        assert!(matches!(err, DealError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn leverage_already_set_is_tolerated() {
        let gw = paper();
        gw.set_leverage("BTCUSDT", 5).await.unwrap();
        assert!(engine(gw, deal(), EventSink::disabled()).setup().await.is_ok());
    }

    #[tokio::test]
    async fn grid_fill_rebuilds_ladder_on_new_average() {
        let gw = paper();
        let eng = engine(gw.clone(), deal(), EventSink::disabled());
        let mut st = eng.setup().await.unwrap();

        gw.set_price(dec!(49400)).await;
        assert_eq!(eng.tick(&mut st).await.unwrap(), None);

        assert_eq!(st.grid.order_ids.len(), 4);
        assert_eq!(gw.resting_prices(true).await, vec![dec!(50247.5), dec!(50745)]);
        assert_eq!(gw.resting_reduce_only_qty().await, dec!(0.004));

        // fill yang sama tidak memicu rebuild lagi
        let ladder = st.tp.clone();
        assert_eq!(eng.tick(&mut st).await.unwrap(), None);
        assert_eq!(st.tp, ladder);
    }

    #[tokio::test]
    async fn tp_fill_moves_stop_to_breakeven() {
        let gw = paper();
        let (tx, mut rx) = mpsc::channel(64);
        let eng = engine(gw.clone(), deal(), EventSink::new(tx));
        let mut st = eng.setup().await.unwrap();
        drain(&mut rx);

        gw.set_price(dec!(50600)).await;
        assert_eq!(eng.tick(&mut st).await.unwrap(), None);
        assert_eq!(st.sl.phase, SlPhase::BreakevenMoved);
        assert_eq!(st.sl.stop_price, dec!(50000));
        assert_eq!(drain(&mut rx), vec![EventKind::SlMoveBe]);
    }

    #[tokio::test]
    async fn stop_loss_closes_and_cleans_up() {
        let gw = paper();
        let (tx, mut rx) = mpsc::channel(64);
        let eng = engine(gw.clone(), deal(), EventSink::new(tx));
        let mut st = eng.setup().await.unwrap();
        drain(&mut rx);

        // harga jatuh lewat grid dan stop dalam satu langkah
        gw.set_price(dec!(48000)).await;
        assert_eq!(eng.tick(&mut st).await.unwrap(), Some(DealOutcome::StopLoss));
        assert_eq!(st.sl.phase, SlPhase::Triggered);
        assert_eq!(gw.position("BTCUSDT").await.unwrap(), PositionSnapshot::flat());
        assert_eq!(gw.resting_count().await, 0);
        assert!(drain(&mut rx).contains(&EventKind::Sl));
    }

    #[tokio::test]
    async fn ladder_taken_ends_deal_as_closed() {
        let gw = paper();
        let eng = engine(gw.clone(), deal(), EventSink::disabled());
        let mut st = eng.setup().await.unwrap();

        gw.set_price(dec!(51500)).await;
        assert_eq!(eng.tick(&mut st).await.unwrap(), Some(DealOutcome::PositionClosed));
        assert_eq!(gw.resting_count().await, 0);
    }

    #[tokio::test]
    async fn expiry_cancels_open_grid_orders_only() {
        let gw = paper();
        let mut cfg = deal();
        cfg.limit_orders.orders_count = 2;
        cfg.limit_orders.deal_duration_minutes = 0;
        let (_tx, rx) = watch::channel(false);

        let outcome = engine(gw.clone(), cfg, EventSink::disabled()).run(rx).await.unwrap();
        assert_eq!(outcome, DealOutcome::Expired);
        assert!(gw.resting_prices(false).await.is_empty());
        assert_eq!(gw.resting_prices(true).await.len(), 2);
        assert_eq!(gw.position("BTCUSDT").await.unwrap().size, dec!(0.002));
    }

    #[tokio::test]
    async fn tick_errors_do_not_end_the_deal() {
        let gw = paper();
        let mut cfg = deal();
        cfg.limit_orders.deal_duration_minutes = 0;
        gw.fail_next_open_orders(2).await;
        let (_tx, rx) = watch::channel(false);
        let outcome = engine(gw, cfg, EventSink::disabled()).run(rx).await.unwrap();
        assert_eq!(outcome, DealOutcome::Expired);
    }

    #[tokio::test]
    async fn shutdown_aborts_without_touching_orders() {
        let gw = paper();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let outcome = engine(gw.clone(), deal(), EventSink::disabled()).run(rx).await.unwrap();
        assert_eq!(outcome, DealOutcome::Aborted);
        assert_eq!(gw.resting_count().await, 7);
    }

    #[tokio::test]
    async fn short_deal_arms_stop_above_entry() {
        let gw = paper();
        let mut cfg = deal();
        cfg.side = Side::Short;
        let st = engine(gw.clone(), cfg, EventSink::disabled()).setup().await.unwrap();
        assert_eq!(st.sl.stop_price, dec!(51000));
        assert_eq!(gw.position("BTCUSDT").await.unwrap().side, Some(Side::Short));
        assert!(gw.resting_prices(true).await.iter().all(|p| *p < Decimal::from(50000)));
    }

    #[tokio::test]
    async fn ladder_rebuild_retries_after_failed_level() {
        let gw = paper();
        let eng = engine(gw.clone(), deal(), EventSink::disabled());
        let mut st = eng.setup().await.unwrap();

        // grid level 1 fill -> avg 49750, lalu harga sudah lewat TP1 baru (50247.5)
        gw.set_price(dec!(49400)).await;
        gw.set_price(dec!(50300)).await;
        assert!(eng.tick(&mut st).await.is_err());
        assert_eq!(st.grid.order_ids.len(), 5);

        gw.set_price(dec!(49900)).await;
        assert_eq!(eng.tick(&mut st).await.unwrap(), None);
        assert_eq!(st.grid.order_ids.len(), 4);
        assert_eq!(gw.resting_prices(true).await, vec![dec!(50247.5), dec!(50745)]);
        let pos = gw.position("BTCUSDT").await.unwrap();
        assert_eq!(gw.resting_reduce_only_qty().await, pos.size);

        let ladder = st.tp.clone();
        assert_eq!(eng.tick(&mut st).await.unwrap(), None);
        assert_eq!(st.tp, ladder);
    }

    #[tokio::test]
    async fn oversized_duration_fails_before_entry() {
        let gw = paper();
        let mut cfg = deal();
        cfg.limit_orders.deal_duration_minutes = 1_000_000_000_000;
        let err = engine(gw.clone(), cfg, EventSink::disabled()).setup().await.unwrap_err();
        assert!(matches!(err, DealError::ConfigInvalid(_)));
        assert_eq!(gw.position("BTCUSDT").await.unwrap(), PositionSnapshot::flat());
        assert_eq!(gw.resting_count().await, 0);
    }

    #[test]
    fn deadline_overflow_is_an_error() {
        let start = Utc::now();
        assert_eq!(deal_deadline(start, 60).unwrap(), start + TimeDelta::minutes(60));
        assert!(deal_deadline(start, u64::MAX).is_err());
        assert!(deal_deadline(start, i64::MAX as u64).is_err());
    }

    #[tokio::test]
    async fn failed_close_keeps_breakeven_and_retries() {
        let gw = paper();
        let (tx, mut rx) = mpsc::channel(64);
        let eng = engine(gw.clone(), deal(), EventSink::new(tx));
        let mut st = eng.setup().await.unwrap();
        drain(&mut rx);

        // TP1 fill lalu harga balik di bawah breakeven sebelum tick
        gw.set_price(dec!(50600)).await;
        gw.set_price(dec!(49950)).await;
        gw.fail_next_market_orders(1).await;

        assert!(eng.tick(&mut st).await.is_err());
        assert_eq!(st.sl.phase, SlPhase::BreakevenMoved);
        assert_eq!(st.sl.stop_price, dec!(50000));
        assert_eq!(drain(&mut rx), vec![EventKind::SlMoveBe]);

        assert_eq!(eng.tick(&mut st).await.unwrap(), Some(DealOutcome::StopLoss));
        assert_eq!(drain(&mut rx), vec![EventKind::Sl]);
        assert_eq!(gw.position("BTCUSDT").await.unwrap(), PositionSnapshot::flat());
    }
}
