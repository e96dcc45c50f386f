// ===============================
// src/binance.rs
// ===============================
//
// Helper Binance USDⓈ-M Futures: signing, timestamp, model JSON REST,
// dan normalisasi simbol gaya "BTC/USDT:USDT" -> "BTCUSDT".
//
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;

use crate::domain::{MarketPrecision, PositionSnapshot, Side};
use crate::error::GatewayError;

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn sign_query(secret: &str, query: &str) -> Result<String, GatewayError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::Credentials("BINANCE_API_SECRET"))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `k=v&k=v` with url-encoded values, in insertion order (signature covers this exact string).
pub fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

const QUOTES: [&str; 4] = ["USDT", "USDC", "BUSD", "FDUSD"];

/// Unified / lowercase / base-only symbols to the venue-native form.
pub fn normalize_symbol(raw: &str) -> String {
    let s = raw.trim().to_ascii_uppercase();
    // "BTC/USDT:USDT" -> settle suffix dibuang
    let s = s.split(':').next().unwrap_or_default();
    let joined: String = s.chars().filter(|c| *c != '/' && *c != '-' && *c != '_').collect();
    if QUOTES.iter().any(|q| joined.ends_with(q) && joined.len() > q.len()) {
        joined
    } else {
        format!("{joined}USDT")
    }
}

pub fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, GatewayError> {
    Decimal::from_str(raw.trim()).map_err(|e| GatewayError::Decode(format!("{field}={raw:?}: {e}")))
}

// ---- REST models ----

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Deserialize)]
pub struct TickerPrice {
    pub price: String,
}

#[derive(Debug, Deserialize)]
pub struct PlacedOrder {
    #[serde(rename = "orderId")]
    pub order_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct OpenOrder {
    #[serde(rename = "orderId")]
    pub order_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(rename = "positionAmt")]
    pub position_amt: String,
    #[serde(rename = "entryPrice")]
    pub entry_price: String,
}

impl PositionRisk {
    /// Signed amount -> absolute size + side. Zero amount is flat.
    pub fn snapshot(&self) -> Result<PositionSnapshot, GatewayError> {
        let amt = parse_decimal("positionAmt", &self.position_amt)?;
        if amt.is_zero() {
            return Ok(PositionSnapshot::flat());
        }
        Ok(PositionSnapshot {
            average_entry_price: parse_decimal("entryPrice", &self.entry_price)?,
            size: amt.abs(),
            side: Some(if amt.is_sign_positive() { Side::Long } else { Side::Short }),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeSymbol {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER")]
    PriceFilter { tickSize: String },
    #[serde(rename = "LOT_SIZE")]
    LotSize { stepSize: String, minQty: String },
    #[serde(other)]
    Other,
}

impl ExchangeSymbol {
    pub fn precision(&self) -> Result<MarketPrecision, GatewayError> {
        let mut tick = None;
        let mut lot = None;
        for f in &self.filters {
            match f {
                SymbolFilter::PriceFilter { tickSize } => tick = Some(parse_decimal("tickSize", tickSize)?),
                SymbolFilter::LotSize { stepSize, minQty } => {
                    lot = Some((parse_decimal("stepSize", stepSize)?, parse_decimal("minQty", minQty)?))
                }
                SymbolFilter::Other => {}
            }
        }
        match (tick, lot) {
            (Some(price_tick), Some((amount_step, min_amount))) => Ok(MarketPrecision {
                amount_step: amount_step.normalize(),
                min_amount: min_amount.normalize(),
                price_tick: price_tick.normalize(),
            }),
            _ => Err(GatewayError::Decode(format!("{}: PRICE_FILTER/LOT_SIZE missing", self.symbol))),
        }
    }
}
