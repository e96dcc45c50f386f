// ===============================
// src/recorder.rs
// ===============================
//
// Event deal -> file .jsonl (append):
// - Engine kirim lewat EventSink (try_send, fire-and-forget).
// - Writer pakai BufWriter, flush periodik tiap 1s dan saat channel ditutup.
// - Parent directory dibuat otomatis; kalau tulis gagal, reopen sekali.
//
// ENV: set `RECORD_FILE=/path/to/deal_events.jsonl` agar aktif.
//
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info};

use rust_decimal::Decimal;

use crate::domain::{DealEvent, EventKind, OrderSide};
use crate::metrics::EVENTS_DROPPED;

/// Fire-and-forget handle to the recorder. Never blocks and never fails the deal.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<DealEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<DealEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, kind: EventKind, symbol: &str, side: Option<OrderSide>, price: Option<Decimal>, qty: Option<Decimal>) {
        let Some(tx) = &self.tx else { return };
        if let Err(e) = tx.try_send(DealEvent::new(kind, symbol, side, price, qty)) {
            EVENTS_DROPPED.inc();
            debug!(%e, ?kind, "event dropped");
        }
    }
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<tokio::fs::File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<DealEvent>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, events will be discarded");
            // tetap kuras channel supaya sender tidak penuh
            while rx.recv().await.is_some() {}
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => {
                            writer = w;
                            if let Err(e2) = write_line(&mut writer, &line).await {
                                error!(?e2, "recorder: write failed again after reopen, drop event");
                            }
                        }
                        Err(e2) => error!(?e2, "recorder: reopen failed, drop event"),
                    }
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
            }
        }
    }
}
