// ===============================
// src/gateway.rs
// ===============================
//
// Kontrak venue yang dipakai engine + venue "paper" (simulasi in-memory).
// - Engine hanya kenal `dyn ExchangeGateway`, tidak pernah tipe venue konkret.
// - Paper venue: market order fill di harga sekarang, limit order fill saat
//   harga menembus level, reduce-only hanya mengecilkan posisi.
//
use std::collections::VecDeque;

use ahash::AHashSet as HashSet;
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::{MarginMode, MarketPrecision, OrderSide, PositionSnapshot, Side};
use crate::error::{GatewayError, SoftError};

pub type OpenOrderIds = HashSet<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingOutcome { Applied, AlreadySet }

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceOutcome { Placed(String), Rejected(SoftError) }

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitOrderRequest {
    pub side: OrderSide,
    pub qty: Decimal,
    pub price: Decimal,
    pub reduce_only: bool,
    pub post_only: bool,
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn last_price(&self, symbol: &str) -> Result<Decimal, GatewayError>;

    /// `AlreadySet` when the venue reports the value is unchanged.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<SettingOutcome, GatewayError>;

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<SettingOutcome, GatewayError> {
        debug!(venue = self.name(), %symbol, ?mode, "margin mode not supported by venue, skipped");
        Ok(SettingOutcome::Applied)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<String, GatewayError>;

    /// Zero-after-truncation comes back as `Rejected`, not as an error.
    async fn place_limit_order(&self, symbol: &str, order: &LimitOrderRequest) -> Result<PlaceOutcome, GatewayError>;

    /// Best-effort: orders that are already gone are ignored.
    async fn cancel_orders(&self, symbol: &str, ids: &[String]);

    async fn open_order_ids(&self, symbol: &str) -> Result<OpenOrderIds, GatewayError>;

    /// Flat position comes back as `PositionSnapshot::flat()`.
    async fn position(&self, symbol: &str) -> Result<PositionSnapshot, GatewayError>;

    async fn precision(&self, symbol: &str) -> Result<MarketPrecision, GatewayError>;

    async fn round_amount_down(&self, symbol: &str, raw_qty: Decimal) -> Result<Decimal, GatewayError> {
        Ok(self.precision(symbol).await?.round_amount_down(raw_qty))
    }

    async fn round_price_to_tick(&self, symbol: &str, raw_price: Decimal) -> Result<Decimal, GatewayError> {
        Ok(self.precision(symbol).await?.round_price_to_tick(raw_price))
    }
}

// -----------------------------------------------------------------------------
// Paper venue
// -----------------------------------------------------------------------------

const POST_ONLY_REJECT: i64 = -5022;
const QTY_LE_ZERO: i64 = -4003;

#[derive(Debug, Clone)]
struct RestingOrder {
    id: String,
    side: OrderSide,
    qty: Decimal,
    price: Decimal,
    reduce_only: bool,
}

#[derive(Debug, Default)]
struct PaperBook {
    price: Decimal,
    script: VecDeque<Decimal>,
    resting: Vec<RestingOrder>,
    // signed: + long, - short
    net_qty: Decimal,
    avg_price: Decimal,
    leverage: Option<u32>,
    margin_mode: Option<MarginMode>,
    seq: u64,
    fail_open_orders: u32,
    fail_market_orders: u32,
    reject_limit_orders: u32,
}

impl PaperBook {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}-{}", self.seq)
    }

    fn apply_fill(&mut self, side: OrderSide, qty: Decimal, price: Decimal, reduce_only: bool) -> Decimal {
        let signed = match side { OrderSide::Buy => qty, OrderSide::Sell => -qty };
        let cur = self.net_qty;

        if reduce_only {
            // hanya boleh mengecilkan posisi lawan arah
            if cur.is_zero() || cur.is_sign_positive() == signed.is_sign_positive() {
                return Decimal::ZERO;
            }
            let filled = qty.min(cur.abs());
            self.net_qty = if cur.is_sign_positive() { cur - filled } else { cur + filled };
            if self.net_qty.is_zero() {
                self.avg_price = Decimal::ZERO;
            }
            return filled;
        }

        if cur.is_zero() || cur.is_sign_positive() == signed.is_sign_positive() {
            let total = cur.abs() + qty;
            self.avg_price = (self.avg_price * cur.abs() + price * qty) / total;
            self.net_qty = cur + signed;
        } else {
            let next = cur + signed;
            if next.is_zero() {
                self.avg_price = Decimal::ZERO;
            } else if next.is_sign_positive() != cur.is_sign_positive() {
                // flip: sisa posisi dibuka di harga fill
                self.avg_price = price;
            }
            self.net_qty = next;
        }
        qty
    }

    fn crosses(side: OrderSide, limit: Decimal, price: Decimal) -> bool {
        match side {
            OrderSide::Buy => price <= limit,
            OrderSide::Sell => price >= limit,
        }
    }

    fn match_resting(&mut self) {
        let price = self.price;
        let resting = std::mem::take(&mut self.resting);
        let mut keep = Vec::with_capacity(resting.len());
        for o in resting {
            if Self::crosses(o.side, o.price, price) {
                let filled = self.apply_fill(o.side, o.qty, o.price, o.reduce_only);
                debug!(id = %o.id, side = o.side.as_str(), qty = %filled, px = %o.price, "paper fill");
            } else {
                keep.push(o);
            }
        }
        self.resting = keep;
    }

    fn snapshot(&self) -> PositionSnapshot {
        if self.net_qty.is_zero() {
            return PositionSnapshot::flat();
        }
        PositionSnapshot {
            average_entry_price: self.avg_price,
            size: self.net_qty.abs(),
            side: Some(if self.net_qty.is_sign_positive() { Side::Long } else { Side::Short }),
        }
    }
}

/// Simulated single-symbol venue: scripted prices first, then an optional random walk.
pub struct PaperGateway {
    precision: MarketPrecision,
    walk_bps: u32,
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    pub fn new(precision: MarketPrecision, start_price: Decimal) -> Self {
        Self {
            precision,
            walk_bps: 0,
            book: Mutex::new(PaperBook { price: start_price, ..Default::default() }),
        }
    }

    /// Random walk of up to `bps` basis points per price read.
    pub fn with_random_walk(mut self, bps: u32) -> Self {
        self.walk_bps = bps;
        self
    }

    /// Prices returned by successive `last_price` calls before the walk takes over.
    pub fn with_script(mut self, prices: impl IntoIterator<Item = Decimal>) -> Self {
        self.book.get_mut().script.extend(prices);
        self
    }

    #[cfg(test)]
    pub async fn set_price(&self, price: Decimal) {
        let mut book = self.book.lock().await;
        book.price = price;
        book.match_resting();
    }

    #[cfg(test)]
    pub async fn leverage(&self) -> Option<u32> {
        self.book.lock().await.leverage
    }

    #[cfg(test)]
    pub async fn resting_count(&self) -> usize {
        self.book.lock().await.resting.len()
    }

    /// Sum of resting reduce-only quantity (TP ladder size).
    #[cfg(test)]
    pub async fn resting_reduce_only_qty(&self) -> Decimal {
        self.book.lock().await.resting.iter().filter(|o| o.reduce_only).map(|o| o.qty).sum()
    }

    #[cfg(test)]
    pub async fn fail_next_open_orders(&self, times: u32) {
        self.book.lock().await.fail_open_orders = times;
    }

    #[cfg(test)]
    pub async fn fail_next_market_orders(&self, times: u32) {
        self.book.lock().await.fail_market_orders = times;
    }

    /// Next `times` limit orders come back as a soft zero-qty rejection.
    #[cfg(test)]
    pub async fn soft_reject_next_limits(&self, times: u32) {
        self.book.lock().await.reject_limit_orders = times;
    }

    #[cfg(test)]
    pub async fn resting_prices(&self, reduce_only: bool) -> Vec<Decimal> {
        self.book.lock().await.resting.iter().filter(|o| o.reduce_only == reduce_only).map(|o| o.price).collect()
    }

    fn next_walk_price(&self, price: Decimal) -> Decimal {
        if self.walk_bps == 0 {
            return price;
        }
        // jangan simpan ThreadRng melewati .await
        let bps = rand::thread_rng().gen_range(-(self.walk_bps as i64)..=self.walk_bps as i64);
        let stepped = price * (Decimal::ONE + Decimal::new(bps, 4));
        self.precision.round_price_to_tick(stepped).max(self.precision.price_tick)
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    fn name(&self) -> &str { "paper" }

    async fn last_price(&self, _symbol: &str) -> Result<Decimal, GatewayError> {
        let mut book = self.book.lock().await;
        let next = match book.script.pop_front() {
            Some(p) => p,
            None => self.next_walk_price(book.price),
        };
        book.price = next;
        book.match_resting();
        Ok(next)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<SettingOutcome, GatewayError> {
        let mut book = self.book.lock().await;
        if book.leverage == Some(leverage) {
            return Ok(SettingOutcome::AlreadySet);
        }
        book.leverage = Some(leverage);
        info!(%symbol, leverage, "paper leverage set");
        Ok(SettingOutcome::Applied)
    }

    async fn set_margin_mode(&self, _symbol: &str, mode: MarginMode) -> Result<SettingOutcome, GatewayError> {
        let mut book = self.book.lock().await;
        if book.margin_mode == Some(mode) {
            return Ok(SettingOutcome::AlreadySet);
        }
        book.margin_mode = Some(mode);
        Ok(SettingOutcome::Applied)
    }

    async fn place_market_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<String, GatewayError> {
        let qty = self.precision.round_amount_down(qty);
        if qty.is_zero() {
            return Err(GatewayError::Api { code: QTY_LE_ZERO, msg: "Quantity less than or equal to zero.".into() });
        }
        let mut book = self.book.lock().await;
        if book.fail_market_orders > 0 {
            book.fail_market_orders -= 1;
            return Err(GatewayError::Decode("simulated market order outage".into()));
        }
        let px = book.price;
        book.apply_fill(side, qty, px, reduce_only);
        Ok(book.next_id("PM"))
    }

    async fn place_limit_order(&self, _symbol: &str, order: &LimitOrderRequest) -> Result<PlaceOutcome, GatewayError> {
        let qty = self.precision.round_amount_down(order.qty);
        if qty.is_zero() {
            return Ok(PlaceOutcome::Rejected(SoftError::ZeroQtyAfterTruncation));
        }
        let price = self.precision.round_price_to_tick(order.price);
        let mut book = self.book.lock().await;
        if book.reject_limit_orders > 0 {
            book.reject_limit_orders -= 1;
            return Ok(PlaceOutcome::Rejected(SoftError::ZeroQtyAfterTruncation));
        }
        if order.post_only && PaperBook::crosses(order.side, price, book.price) {
            return Err(GatewayError::Api {
                code: POST_ONLY_REJECT,
                msg: "Post Only order will be rejected: would execute as taker".into(),
            });
        }
        let id = book.next_id("PL");
        book.resting.push(RestingOrder { id: id.clone(), side: order.side, qty, price, reduce_only: order.reduce_only });
        Ok(PlaceOutcome::Placed(id))
    }

    async fn cancel_orders(&self, _symbol: &str, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut book = self.book.lock().await;
        book.resting.retain(|o| !ids.contains(&o.id));
    }

    async fn open_order_ids(&self, _symbol: &str) -> Result<OpenOrderIds, GatewayError> {
        let mut book = self.book.lock().await;
        if book.fail_open_orders > 0 {
            book.fail_open_orders -= 1;
            return Err(GatewayError::Decode("simulated openOrders outage".into()));
        }
        Ok(book.resting.iter().map(|o| o.id.clone()).collect())
    }

    async fn position(&self, _symbol: &str) -> Result<PositionSnapshot, GatewayError> {
        Ok(self.book.lock().await.snapshot())
    }

    async fn precision(&self, _symbol: &str) -> Result<MarketPrecision, GatewayError> {
        Ok(self.precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc() -> MarketPrecision {
        MarketPrecision { amount_step: dec!(0.001), min_amount: dec!(0.001), price_tick: dec!(0.1) }
    }

    fn limit(side: OrderSide, qty: Decimal, price: Decimal, reduce_only: bool) -> LimitOrderRequest {
        LimitOrderRequest { side, qty, price, reduce_only, post_only: true }
    }

    #[tokio::test]
    async fn market_order_opens_position_at_last_price() {
        let gw = PaperGateway::new(btc(), dec!(50000));
        gw.place_market_order("BTCUSDT", OrderSide::Buy, dec!(0.002), false).await.unwrap();
        let pos = gw.position("BTCUSDT").await.unwrap();
        assert_eq!(pos.size, dec!(0.002));
        assert_eq!(pos.average_entry_price, dec!(50000));
        assert_eq!(pos.side, Some(Side::Long));
    }

    #[tokio::test]
    async fn grid_fill_re_averages_position() {
        let gw = PaperGateway::new(btc(), dec!(50000));
        gw.place_market_order("BTCUSDT", OrderSide::Buy, dec!(0.002), false).await.unwrap();
        gw.place_limit_order("BTCUSDT", &limit(OrderSide::Buy, dec!(0.002), dec!(49000), false)).await.unwrap();
        gw.set_price(dec!(48900)).await;
        let pos = gw.position("BTCUSDT").await.unwrap();
        assert_eq!(pos.size, dec!(0.004));
        assert_eq!(pos.average_entry_price, dec!(49500));
        assert!(gw.open_order_ids("BTCUSDT").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reduce_only_never_flips_position() {
        let gw = PaperGateway::new(btc(), dec!(50000));
        gw.place_market_order("BTCUSDT", OrderSide::Buy, dec!(0.002), false).await.unwrap();
        gw.place_market_order("BTCUSDT", OrderSide::Sell, dec!(0.005), true).await.unwrap();
        assert_eq!(gw.position("BTCUSDT").await.unwrap(), PositionSnapshot::flat());
    }

    #[tokio::test]
    async fn zero_qty_limit_is_soft_rejected() {
        let gw = PaperGateway::new(btc(), dec!(50000));
        let out = gw.place_limit_order("BTCUSDT", &limit(OrderSide::Buy, dec!(0.0004), dec!(49000), false)).await.unwrap();
        assert_eq!(out, PlaceOutcome::Rejected(SoftError::ZeroQtyAfterTruncation));
    }

    #[tokio::test]
    async fn post_only_crossing_order_is_rejected() {
        let gw = PaperGateway::new(btc(), dec!(50000));
        let err = gw.place_limit_order("BTCUSDT", &limit(OrderSide::Buy, dec!(0.001), dec!(50100), false)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Api { code: POST_ONLY_REJECT, .. }));
    }

    #[tokio::test]
    async fn leverage_reports_already_set() {
        let gw = PaperGateway::new(btc(), dec!(50000));
        assert_eq!(gw.set_leverage("BTCUSDT", 5).await.unwrap(), SettingOutcome::Applied);
        assert_eq!(gw.set_leverage("BTCUSDT", 5).await.unwrap(), SettingOutcome::AlreadySet);
        assert_eq!(gw.leverage().await, Some(5));
    }

    #[tokio::test]
    async fn scripted_prices_come_first() {
        let gw = PaperGateway::new(btc(), dec!(50000)).with_script([dec!(50100), dec!(50200)]);
        assert_eq!(gw.last_price("BTCUSDT").await.unwrap(), dec!(50100));
        assert_eq!(gw.last_price("BTCUSDT").await.unwrap(), dec!(50200));
        // tanpa random walk harga diam
        assert_eq!(gw.last_price("BTCUSDT").await.unwrap(), dec!(50200));
    }

    #[tokio::test]
    async fn default_rounding_uses_precision() {
        let gw = PaperGateway::new(btc(), dec!(50000));
        assert_eq!(gw.round_amount_down("BTCUSDT", dec!(0.00299)).await.unwrap(), dec!(0.002));
        assert_eq!(gw.round_price_to_tick("BTCUSDT", dec!(49499.99)).await.unwrap(), dec!(49499.9));
    }
}
