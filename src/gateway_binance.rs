// ===============================
// src/gateway_binance.rs
// ===============================
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Method, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::binance::{
    encode_query, normalize_symbol, parse_decimal, sign_query, timestamp_ms, ApiErrorBody, ExchangeInfo,
    OpenOrder, PlacedOrder, PositionRisk, TickerPrice,
};
use crate::config::Args;
use crate::domain::{MarginMode, MarketPrecision, OrderSide, PositionSnapshot};
use crate::error::{classify, ErrorClass, GatewayError, SoftError};
use crate::gateway::{ExchangeGateway, LimitOrderRequest, OpenOrderIds, PlaceOutcome, SettingOutcome};

/// Binance USDⓈ-M Futures over signed REST (one-way position mode).
pub struct BinanceFutures {
    http: reqwest::Client,
    base: String,
    api_key: String,
    api_secret: String,
    recv_window: u64,
    // exchangeInfo cukup diambil sekali per simbol
    precision_cache: Mutex<HashMap<String, MarketPrecision>>,
}

impl BinanceFutures {
    pub fn from_env(args: &Args) -> Result<Self, GatewayError> {
        let api_key = std::env::var("BINANCE_API_KEY")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(GatewayError::Credentials("BINANCE_API_KEY"))?;
        let api_secret = std::env::var("BINANCE_API_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(GatewayError::Credentials("BINANCE_API_SECRET"))?;
        Ok(Self::new(&args.binance_rest_url, api_key, api_secret, args.binance_recv_window))
    }

    pub fn new(base: &str, api_key: String, api_secret: String, recv_window: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            recv_window,
            precision_cache: Mutex::new(HashMap::new()),
        }
    }

    fn public(&self, path: &str, params: &[(&str, String)]) -> RequestBuilder {
        let mut url = format!("{}{}", self.base, path);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&encode_query(params));
        }
        self.http.get(url)
    }

    fn signed(&self, method: Method, path: &str, mut params: Vec<(&str, String)>) -> Result<RequestBuilder, GatewayError> {
        params.push(("recvWindow", self.recv_window.to_string()));
        params.push(("timestamp", timestamp_ms().to_string()));
        let query = encode_query(&params);
        let sig = sign_query(&self.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base, path, query, sig);
        Ok(self.http.request(method, url).header("X-MBX-APIKEY", &self.api_key))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, GatewayError> {
        let rsp = builder.send().await?;
        let status = rsp.status();
        let body = rsp.text().await?;
        if !status.is_success() {
            return Err(match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(e) => GatewayError::Api { code: e.code, msg: e.msg },
                Err(_) => GatewayError::Api { code: -(status.as_u16() as i64), msg: body },
            });
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::Decode(format!("{e}: {body}")))
    }

    async fn send_order(&self, mut params: Vec<(&str, String)>) -> Result<String, GatewayError> {
        params.push(("newClientOrderId", client_order_id()));
        let req = self.signed(Method::POST, "/fapi/v1/order", params)?;
        let placed: PlacedOrder = self.send_json(req).await?;
        Ok(placed.order_id.to_string())
    }
}

fn client_order_id() -> String {
    let n: u64 = rand::thread_rng().gen();
    format!("dbr-{}-{:x}", timestamp_ms(), n & 0xffff_ffff)
}

fn side_param(side: OrderSide) -> String {
    match side { OrderSide::Buy => "BUY", OrderSide::Sell => "SELL" }.to_string()
}

fn num(d: Decimal) -> String {
    d.normalize().to_string()
}

#[async_trait]
impl ExchangeGateway for BinanceFutures {
    fn name(&self) -> &str { "binance" }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let sym = normalize_symbol(symbol);
        let t: TickerPrice = self.send_json(self.public("/fapi/v1/ticker/price", &[("symbol", sym)])).await?;
        parse_decimal("price", &t.price)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<SettingOutcome, GatewayError> {
        let sym = normalize_symbol(symbol);
        let req = self.signed(
            Method::POST,
            "/fapi/v1/leverage",
            vec![("symbol", sym.clone()), ("leverage", leverage.to_string())],
        )?;
        match self.send_json::<serde_json::Value>(req).await {
            Ok(_) => {
                info!(symbol = %sym, leverage, "leverage set");
                Ok(SettingOutcome::Applied)
            }
            Err(e) => match classify(&e) {
                ErrorClass::Soft(SoftError::LeverageAlreadySet) => Ok(SettingOutcome::AlreadySet),
                _ => Err(e),
            },
        }
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<SettingOutcome, GatewayError> {
        let sym = normalize_symbol(symbol);
        let margin_type = match mode { MarginMode::Isolated => "ISOLATED", MarginMode::Cross => "CROSSED" };
        let req = self.signed(
            Method::POST,
            "/fapi/v1/marginType",
            vec![("symbol", sym.clone()), ("marginType", margin_type.to_string())],
        )?;
        match self.send_json::<serde_json::Value>(req).await {
            Ok(_) => {
                info!(symbol = %sym, margin_type, "margin type set");
                Ok(SettingOutcome::Applied)
            }
            Err(e) => match classify(&e) {
                ErrorClass::Soft(SoftError::MarginModeAlreadySet) => Ok(SettingOutcome::AlreadySet),
                _ => Err(e),
            },
        }
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<String, GatewayError> {
        let sym = normalize_symbol(symbol);
        let qty = self.round_amount_down(&sym, qty).await?;
        let mut params = vec![
            ("symbol", sym.clone()),
            ("side", side_param(side)),
            ("type", "MARKET".to_string()),
            ("quantity", num(qty)),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        let id = self.send_order(params).await?;
        info!(symbol = %sym, side = side.as_str(), qty = %qty, reduce_only, order_id = %id, "market order sent");
        Ok(id)
    }

    async fn place_limit_order(&self, symbol: &str, order: &LimitOrderRequest) -> Result<PlaceOutcome, GatewayError> {
        let sym = normalize_symbol(symbol);
        let precision = self.precision(&sym).await?;
        let qty = precision.round_amount_down(order.qty);
        if qty.is_zero() {
            return Ok(PlaceOutcome::Rejected(SoftError::ZeroQtyAfterTruncation));
        }
        let price = precision.round_price_to_tick(order.price);
        // GTX = post-only di Binance Futures; kalau crossing, order diterima lalu EXPIRED (bukan ditolak)
        let tif = if order.post_only { "GTX" } else { "GTC" };
        let mut params = vec![
            ("symbol", sym.clone()),
            ("side", side_param(order.side)),
            ("type", "LIMIT".to_string()),
            ("timeInForce", tif.to_string()),
            ("quantity", num(qty)),
            ("price", num(price)),
        ];
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        match self.send_order(params).await {
            Ok(id) => {
                debug!(symbol = %sym, side = order.side.as_str(), qty = %qty, price = %price, order_id = %id, "limit order sent");
                Ok(PlaceOutcome::Placed(id))
            }
            Err(e) => match classify(&e) {
                ErrorClass::Soft(SoftError::ZeroQtyAfterTruncation) => {
                    Ok(PlaceOutcome::Rejected(SoftError::ZeroQtyAfterTruncation))
                }
                _ => Err(e),
            },
        }
    }

    async fn cancel_orders(&self, symbol: &str, ids: &[String]) {
        let sym = normalize_symbol(symbol);
        for id in ids {
            let req = match self.signed(Method::DELETE, "/fapi/v1/order", vec![("symbol", sym.clone()), ("orderId", id.clone())]) {
                Ok(r) => r,
                Err(e) => {
                    error!(?e, order_id = %id, "cancel request build failed");
                    continue;
                }
            };
            match self.send_json::<serde_json::Value>(req).await {
                Ok(_) => debug!(symbol = %sym, order_id = %id, "order cancelled"),
                // -2011 unknown order: sudah fill / sudah dibatalkan
                Err(e) => warn!(symbol = %sym, order_id = %id, %e, "cancel skipped"),
            }
        }
    }

    async fn open_order_ids(&self, symbol: &str) -> Result<OpenOrderIds, GatewayError> {
        let sym = normalize_symbol(symbol);
        let req = self.signed(Method::GET, "/fapi/v1/openOrders", vec![("symbol", sym)])?;
        let orders: Vec<OpenOrder> = self.send_json(req).await?;
        Ok(orders.into_iter().map(|o| o.order_id.to_string()).collect())
    }

    async fn position(&self, symbol: &str) -> Result<PositionSnapshot, GatewayError> {
        let sym = normalize_symbol(symbol);
        let req = self.signed(Method::GET, "/fapi/v2/positionRisk", vec![("symbol", sym.clone())])?;
        let rows: Vec<PositionRisk> = self.send_json(req).await?;
        for row in rows.iter().filter(|r| r.symbol == sym) {
            let snap = row.snapshot()?;
            if snap.is_open() {
                return Ok(snap);
            }
        }
        Ok(PositionSnapshot::flat())
    }

    async fn precision(&self, symbol: &str) -> Result<MarketPrecision, GatewayError> {
        let sym = normalize_symbol(symbol);
        if let Some(p) = self.precision_cache.lock().await.get(&sym) {
            return Ok(*p);
        }
        let info: ExchangeInfo = self.send_json(self.public("/fapi/v1/exchangeInfo", &[])).await?;
        let entry = info
            .symbols
            .iter()
            .find(|s| s.symbol == sym)
            .ok_or_else(|| GatewayError::UnknownSymbol(sym.clone()))?;
        let p = entry.precision()?;
        info!(symbol = %sym, step = %p.amount_step, min = %p.min_amount, tick = %p.price_tick, "market precision loaded");
        self.precision_cache.lock().await.insert(sym, p);
        Ok(p)
    }
}
