// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/deal_bot_rust

 # dry run di venue paper (default)
 cargo run -- check deal.json
 RUST_LOG=info,deal_bot_rust=debug cargo run -- run deal.json

 # state deal yang aktif
 curl -s localhost:9898/metrics | egrep '^deal_(stop_price|position_size|orders_placed_total)'

*/
/*
=============================================================================
Project : deal_bot_rust: single-deal DCA / take-profit / trailing-SL engine
Module  : main.rs
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
mod domain;
mod config;
mod error;
mod precision;
mod metrics;
mod recorder;
mod gateway;          // trait venue + paper venue (simulasi)
mod binance;          // helper (signer/models) for Binance Futures
mod gateway_binance;  // Binance USDⓈ-M Futures (signed REST)
mod grid;
mod takeprofit;
mod stoploss;
mod reconcile;
mod engine;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Args, DealConfig, VenueMode};
use crate::domain::DealEvent;
use crate::engine::DealEngine;
use crate::error::DealError;
use crate::gateway::{ExchangeGateway, PaperGateway};
use crate::gateway_binance::BinanceFutures;
use crate::recorder::EventSink;

#[derive(Parser, Debug)]
#[command(name = "deal_bot_rust", version, about = "Single-deal DCA grid / TP ladder / trailing-SL bot")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one deal until stop-loss, expiry or a flat position (Ctrl-C aborts)
    Run { deal: String },
    /// Load and validate a deal file only
    Check { deal: String },
    /// Flatten the current position with a reduce-only market order
    Close { symbol: String },
    /// Print venue name and last price
    Ping { symbol: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let args = config::load();

    let res = match cli.cmd {
        Command::Run { deal } => run_deal(&args, &deal).await,
        Command::Check { deal } => check_deal(&deal),
        Command::Close { symbol } => close_position(&args, &symbol).await,
        Command::Ping { symbol } => ping(&args, &symbol).await,
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::from(1)
        }
    }
}

fn build_gateway(args: &Args) -> Result<Arc<dyn ExchangeGateway>, DealError> {
    match args.venue_mode {
        VenueMode::Paper => Ok(Arc::new(
            PaperGateway::new(args.paper.precision, args.paper.start_price)
                .with_script(args.paper.price_path.iter().copied())
                .with_random_walk(args.paper.walk_bps),
        )),
        VenueMode::BinanceTestnet | VenueMode::BinanceMainnet => {
            let gw = BinanceFutures::from_env(args).map_err(DealError::exchange("credentials"))?;
            Ok(Arc::new(gw))
        }
    }
}

async fn run_deal(args: &Args, path: &str) -> Result<(), DealError> {
    let deal = DealConfig::from_file(path)?;

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);
    metrics::CONFIG_VENUE_MODE.with_label_values(&[args.venue_mode.as_str()]).set(1);
    metrics::CONFIG_SYMBOL.with_label_values(&[deal.symbol.as_str(), deal.side.as_str()]).set(1);

    info!(
        venue_mode = args.venue_mode.as_str(),
        rest = %args.binance_rest_url,
        symbol = %deal.symbol,
        side = deal.side.as_str(),
        leverage = deal.leverage,
        poll_ms = args.poll_interval.as_millis() as u64,
        "startup config"
    );

    // ---- Recorder (optional) ----
    let (sink, recorder) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<DealEvent>(1024);
            (EventSink::new(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (EventSink::disabled(), None),
    };

    // ---- Shutdown (Ctrl-C) ----
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received, aborting deal");
            let _ = stop_tx.send(true);
        }
    });

    let gw = build_gateway(args)?;
    let engine = DealEngine::new(gw, deal, sink, args.poll_interval);
    let outcome = engine.run(stop_rx).await;

    // sink ikut di-drop -> recorder flush & selesai
    drop(engine);
    if let Some(handle) = recorder {
        let _ = handle.await;
    }

    let outcome = outcome?;
    info!(outcome = outcome.as_str(), "done");
    Ok(())
}

fn check_deal(path: &str) -> Result<(), DealError> {
    let deal = DealConfig::from_file(path)?;
    info!(
        symbol = %deal.symbol,
        side = deal.side.as_str(),
        grid_orders = deal.limit_orders.orders_count,
        tp_levels = deal.tp_orders.len(),
        "deal config ok"
    );
    Ok(())
}

async fn close_position(args: &Args, symbol: &str) -> Result<(), DealError> {
    let gw = build_gateway(args)?;
    let pos = gw.position(symbol).await.map_err(DealError::exchange("position"))?;
    let Some(side) = pos.side.filter(|_| pos.is_open()) else {
        info!(%symbol, venue = gw.name(), "no open position, nothing to close");
        return Ok(());
    };
    let order_id = gw
        .place_market_order(symbol, side.exit(), pos.size, true)
        .await
        .map_err(DealError::exchange("close"))?;
    info!(%symbol, side = side.as_str(), qty = %pos.size, %order_id, "position closed");
    Ok(())
}

async fn ping(args: &Args, symbol: &str) -> Result<(), DealError> {
    let gw = build_gateway(args)?;
    let last = gw.last_price(symbol).await.map_err(DealError::exchange("last_price"))?;
    info!(venue = gw.name(), %symbol, %last, "pong");
    Ok(())
}
