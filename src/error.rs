// ===============================
// src/error.rs
// ===============================
use rust_decimal::Decimal;
use thiserror::Error;

/// Raw failure coming back from a venue adapter.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("venue error {code}: {msg}")]
    Api { code: i64, msg: String },
    #[error("http transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bad venue payload: {0}")]
    Decode(String),
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("missing credential {0}")]
    Credentials(&'static str),
}

/// Expected venue responses that are not real failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftError {
    LeverageAlreadySet,
    MarginModeAlreadySet,
    ZeroQtyAfterTruncation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Soft(SoftError),
    Hard,
}

// Binance USDⓈ-M codes
const BINANCE_NO_NEED_TO_CHANGE_MARGIN: i64 = -4046;
const BINANCE_QTY_LE_ZERO: i64 = -4003;
// Bybit v5 "leverage not modified"
const BYBIT_LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Map a raw gateway error onto the deal error taxonomy.
pub fn classify(err: &GatewayError) -> ErrorClass {
    match err {
        GatewayError::Api { code, msg } => {
            let m = msg.to_ascii_lowercase();
            if *code == BYBIT_LEVERAGE_NOT_MODIFIED || m.contains("leverage not modified") {
                ErrorClass::Soft(SoftError::LeverageAlreadySet)
            } else if *code == BINANCE_NO_NEED_TO_CHANGE_MARGIN || m.contains("no need to change margin type") {
                ErrorClass::Soft(SoftError::MarginModeAlreadySet)
            } else if *code == BINANCE_QTY_LE_ZERO
                || m.contains("less than or equal to zero")
                || m.contains("truncated to zero")
            {
                ErrorClass::Soft(SoftError::ZeroQtyAfterTruncation)
            } else {
                ErrorClass::Hard
            }
        }
        _ => ErrorClass::Hard,
    }
}

/// Fatal reasons a deal cannot start (or continue past setup).
#[derive(Debug, Error)]
pub enum DealError {
    #[error("invalid deal config: {0}")]
    ConfigInvalid(#[from] ConfigError),
    #[error("entry qty {qty} below minimum tradable {min}")]
    EntryQtyTooSmall { qty: Decimal, min: Decimal },
    #[error("{stage} failed: {source}")]
    Exchange {
        stage: &'static str,
        #[source]
        source: GatewayError,
    },
}

impl DealError {
    pub fn exchange(stage: &'static str) -> impl FnOnce(GatewayError) -> DealError {
        move |source| DealError::Exchange { stage, source }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { field, reason: reason.into() }
    }
}
