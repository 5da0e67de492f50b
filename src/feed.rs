// =============================================================================
// Feed — reconnecting WebSocket ingest adapter
// =============================================================================
//
// Generalized from a per-stream connect/read/return-on-disconnect shape into
// a single source-agnostic adapter, with an exponential-backoff reconnect
// policy in place of a flat retry sleep. The wire format below is this
// engine's own contract, not any particular exchange's — it ingests one
// instrument from one configured feed URL.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

const BACKOFF_BASE_SECS: f64 = 1.0;
const BACKOFF_CAP_SECS: f64 = 30.0;
const BACKOFF_MULT: f64 = 1.5;

/// One parsed feed message. `side` on `Trade` reuses `Side` (`Long` =
/// aggressor buy, `Short` = aggressor sell) rather than inventing a second
/// buy/sell enum.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Trade {
        epoch_micros: i64,
        price: f64,
        size: f64,
        side: crate::types::Side,
    },
    Orderbook {
        epoch_micros: i64,
        /// `[price, size]` pairs, best-first.
        bids: Vec<[f64; 2]>,
        asks: Vec<[f64; 2]>,
    },
}

/// Handle to a running feed task. Dropping this does not stop the task —
/// call `stop()` explicitly so shutdown is an intentional act, matching the
/// engine's explicit-lifecycle requirement.
pub struct FeedHandle {
    shutdown_tx: watch::Sender<bool>,
    reconnect_count: Arc<AtomicU32>,
}

impl FeedHandle {
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::Relaxed)
    }
}

/// Spawn the reconnecting ingest loop against `url`. `on_message` is called
/// inline on the task for every successfully parsed message — it must not
/// block, since it's expected to do nothing heavier than folding a tick into
/// an `Aggregator` or `MicroStream`.
pub fn spawn(
    url: String,
    on_message: impl Fn(FeedMessage) + Send + Sync + 'static,
) -> FeedHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let reconnect_count = Arc::new(AtomicU32::new(0));
    let rc = reconnect_count.clone();

    tokio::spawn(async move {
        let mut backoff_secs = BACKOFF_BASE_SECS;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            info!(url = %url, "feed: connecting");
            match run_once(&url, &on_message, &mut shutdown_rx).await {
                Ok(()) => {
                    info!(url = %url, "feed: stream ended");
                    backoff_secs = BACKOFF_BASE_SECS;
                }
                Err(e) => {
                    error!(url = %url, error = %e, backoff_secs, "feed: connection failed, backing off");
                }
            }

            if *shutdown_rx.borrow() {
                break;
            }
            rc.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(backoff_secs)) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            backoff_secs = (backoff_secs * BACKOFF_MULT).min(BACKOFF_CAP_SECS);
        }
        info!(url = %url, "feed: shut down");
    });

    FeedHandle {
        shutdown_tx,
        reconnect_count,
    }
}

async fn run_once(
    url: &str,
    on_message: &(impl Fn(FeedMessage) + Send + Sync),
    shutdown_rx: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
    let (_, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<FeedMessage>(&text) {
                        Ok(parsed) => on_message(parsed),
                        Err(e) => warn!(error = %e, "feed: unparseable message, skipping"),
                    },
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
        }
    }
}
