// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : deal_bot_rust: single-deal DCA / take-profit / trailing-SL engine
Module  : config.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Opens one leveraged futures deal, lays a DCA grid, keeps a TP
          ladder on the live average entry, trails / breakevens the
          stop-loss, and reconciles against the venue until SL or expiry.
          Exposes Prometheus metrics and records JSONL deal events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::{env, fs, time::Duration};

use dotenvy::dotenv;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{MarginMode, MarketPrecision, Side};
use crate::error::ConfigError;

/// Mode venue trading
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Paper,
    BinanceTestnet,
    BinanceMainnet,
}

impl VenueMode {
    pub fn from_env(key: &str, default_mode: VenueMode) -> VenueMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "paper" | "mock"                    => VenueMode::Paper,
            "binance_testnet" | "binance_sandbox" => VenueMode::BinanceTestnet,
            "binance_mainnet"                   => VenueMode::BinanceMainnet,
            _ => default_mode,
        }
    }

    // Endpoint default per mode
    pub fn default_rest_url(&self) -> &'static str {
        match self {
            VenueMode::Paper          => "https://testnet.binancefuture.com", // tidak dipakai saat paper
            VenueMode::BinanceTestnet => "https://testnet.binancefuture.com",
            VenueMode::BinanceMainnet => "https://fapi.binance.com",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Paper          => "paper",
            VenueMode::BinanceTestnet => "binance_testnet",
            VenueMode::BinanceMainnet => "binance_mainnet",
        }
    }
}

/// Parameter simulasi untuk venue paper
#[derive(Clone, Debug)]
pub struct PaperSettings {
    pub start_price: Decimal,
    pub precision: MarketPrecision,
    pub walk_bps: u32,
    /// Prices served before the random walk (`PAPER_PRICE_PATH=50000,49800,...`).
    pub price_path: Vec<Decimal>,
}

#[derive(Clone, Debug)]
pub struct Args {
    // venue
    pub venue_mode: VenueMode,
    pub binance_rest_url: String,
    pub binance_recv_window: u64,
    pub paper: PaperSettings,

    // loop
    pub poll_interval: Duration,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn parse_price_path(raw: &str) -> Vec<Decimal> {
    raw.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}

pub fn load() -> Args {
    // Pastikan .env dibaca (agar RECORD_FILE, VENUE_MODE, dll ter-load)
    let _ = dotenv();

    // ===== Mode =====
    let venue_mode = VenueMode::from_env("VENUE_MODE", VenueMode::Paper);
    let binance_rest_url = env::var("BINANCE_REST_URL")
        .unwrap_or_else(|_| venue_mode.default_rest_url().to_string());
    let binance_recv_window = env_parse("BINANCE_RECV_WINDOW", 5000u64);

    // ===== Paper venue =====
    let paper = PaperSettings {
        start_price: env_parse("PAPER_PRICE", Decimal::from(50_000)),
        precision: MarketPrecision {
            amount_step: env_parse("PAPER_AMOUNT_STEP", Decimal::new(1, 3)),
            min_amount: env_parse("PAPER_MIN_AMOUNT", Decimal::new(1, 3)),
            price_tick: env_parse("PAPER_PRICE_TICK", Decimal::new(1, 1)),
        },
        walk_bps: env_parse("PAPER_WALK_BPS", 5u32),
        price_path: parse_price_path(&env::var("PAPER_PRICE_PATH").unwrap_or_default()),
    };

    // ===== Loop & output =====
    let poll_interval = Duration::from_millis(env_parse("POLL_INTERVAL_MS", 3000u64));
    let record_file = env::var("RECORD_FILE").ok().filter(|s| !s.trim().is_empty());
    let metrics_port = env_parse("METRICS_PORT", 9898u16);

    Args {
        venue_mode,
        binance_rest_url,
        binance_recv_window,
        paper,
        poll_interval,
        record_file,
        metrics_port,
    }
}

// ===== Deal file =====

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitOrders {
    pub range_percent: Decimal,
    pub orders_count: u32,
    pub deal_duration_minutes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TpOrder {
    pub price_percent: Decimal,
    pub quantity_percent: Decimal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DealConfig {
    pub symbol: String,
    pub side: Side,
    pub market_order_amount: Decimal,
    pub leverage: u32,
    pub stop_loss_percent: Decimal,
    #[serde(default)]
    pub trailing_sl_offset_percent: Decimal,
    #[serde(default)]
    pub move_sl_to_breakeven: bool,
    #[serde(default)]
    pub limit_orders_amount: Decimal,
    pub limit_orders: LimitOrders,
    pub tp_orders: Vec<TpOrder>,
    #[serde(default)]
    pub margin_mode: Option<MarginMode>,
}

/// Toleransi pembulatan untuk Σ quantity_percent.
const TP_SUM_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 6);
/// One year.
pub const MAX_DEAL_DURATION_MINUTES: u64 = 525_600;

impl DealConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_string(), source })?;
        Self::from_json(path, &raw)
    }

    pub fn from_json(path: &str, raw: &str) -> Result<Self, ConfigError> {
        let cfg: DealConfig = serde_json::from_str(raw)
            .map_err(|source| ConfigError::Parse { path: path.to_string(), source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let hundred = Decimal::ONE_HUNDRED;

        if self.symbol.trim().is_empty() {
            return Err(ConfigError::invalid("symbol", "must not be empty"));
        }
        if self.market_order_amount <= Decimal::ZERO {
            return Err(ConfigError::invalid("market_order_amount", "must be > 0"));
        }
        if self.leverage == 0 {
            return Err(ConfigError::invalid("leverage", "must be >= 1"));
        }
        if self.stop_loss_percent <= Decimal::ZERO || self.stop_loss_percent >= hundred {
            return Err(ConfigError::invalid("stop_loss_percent", "must be in (0, 100)"));
        }
        if self.trailing_sl_offset_percent < Decimal::ZERO || self.trailing_sl_offset_percent >= hundred {
            return Err(ConfigError::invalid("trailing_sl_offset_percent", "must be in [0, 100)"));
        }
        if self.limit_orders_amount < Decimal::ZERO {
            return Err(ConfigError::invalid("limit_orders_amount", "must be >= 0"));
        }
        let lo = &self.limit_orders;
        if lo.orders_count > 0 && (lo.range_percent <= Decimal::ZERO || lo.range_percent >= hundred) {
            return Err(ConfigError::invalid("limit_orders.range_percent", "must be in (0, 100)"));
        }

        if lo.deal_duration_minutes > MAX_DEAL_DURATION_MINUTES {
            return Err(ConfigError::invalid(
                "limit_orders.deal_duration_minutes",
                format!("must be <= {MAX_DEAL_DURATION_MINUTES}"),
            ));
        }

        if self.tp_orders.is_empty() {
            return Err(ConfigError::invalid("tp_orders", "at least one level required"));
        }
        for (i, tp) in self.tp_orders.iter().enumerate() {
            if tp.price_percent <= Decimal::ZERO || tp.quantity_percent <= Decimal::ZERO {
                return Err(ConfigError::invalid(
                    "tp_orders",
                    format!("level {} needs price_percent > 0 and quantity_percent > 0", i + 1),
                ));
            }
            if self.side == Side::Short && tp.price_percent >= hundred {
                return Err(ConfigError::invalid(
                    "tp_orders",
                    format!("level {}: short TP price_percent must be < 100", i + 1),
                ));
            }
        }
        let total: Decimal = self.tp_orders.iter().map(|t| t.quantity_percent).sum();
        if (total - hundred).abs() > TP_SUM_EPSILON {
            return Err(ConfigError::invalid(
                "tp_orders",
                format!("quantity_percent must sum to 100, got {total}"),
            ));
        }
        Ok(())
    }
}
