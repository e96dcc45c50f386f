// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Reconciliation loop --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("deal_ticks_total", "reconciliation ticks").unwrap());

pub static TICK_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("deal_tick_errors_total", "reconciliation ticks that failed").unwrap());

// -------- Orders (label: kind = entry|grid|tp|sl) --------
pub static ORDERS_PLACED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("deal_orders_placed_total", "orders placed by kind"), &["kind"]).unwrap()
});

pub static ORDERS_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("deal_orders_skipped_total", "orders skipped (below min tradable / soft reject)"),
        &["kind"],
    )
    .unwrap()
});

// -------- Deal state --------
pub static STOP_PRICE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("deal_stop_price", "current stop-loss price"), &["symbol"]).unwrap()
});

pub static POSITION_SIZE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("deal_position_size", "live position size"), &["symbol"]).unwrap()
});

pub static LAST_PRICE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("deal_last_price", "last observed price").unwrap());

pub static DEAL_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("deal_outcomes_total", "finished deals by outcome"), &["outcome"]).unwrap()
});

pub static EVENTS_DROPPED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("deal_events_dropped_total", "events dropped by the sink").unwrap());

// ---- Config visibility ----
pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_venue_mode", "venue mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_symbol", "deal symbol and side (labels: symbol, side)"), &["symbol", "side"])
        .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICK_ERRORS.clone())),
        REGISTRY.register(Box::new(ORDERS_PLACED.clone())),
        REGISTRY.register(Box::new(ORDERS_SKIPPED.clone())),
        REGISTRY.register(Box::new(STOP_PRICE.clone())),
        REGISTRY.register(Box::new(POSITION_SIZE.clone())),
        REGISTRY.register(Box::new(LAST_PRICE.clone())),
        REGISTRY.register(Box::new(DEAL_OUTCOMES.clone())),
        REGISTRY.register(Box::new(EVENTS_DROPPED.clone())),
        REGISTRY.register(Box::new(CONFIG_VENUE_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        if let Err(e) = m {
            warn!(%e, "metric registration failed");
        }
    }
}

/// Decimal -> f64 for gauges (precision loss is fine for dashboards).
pub fn as_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics): tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Metrics server on a dedicated OS thread. Port 0 disables it.
pub fn serve_metrics(port: u16) {
    if port == 0 {
        info!("metrics exporter disabled");
        return;
    }
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, %e, "metrics bind failed, exporter disabled");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(%e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_text_contains_registered_families() {
        init();
        ORDERS_PLACED.with_label_values(&["grid"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("deal_orders_placed_total"));
    }
}
