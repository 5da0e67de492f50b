// =============================================================================
// MicroStream — cumulative volume delta, spread, depth imbalance
// =============================================================================
//
// Consumes a push feed of trade and orderbook-snapshot events (the feed
// itself — WebSocket dialing, reconnect/backoff — is an external adapter;
// this module only exposes `on_trade`/`on_orderbook` entry points). State is
// published as a single atomic `MicroSnapshot` record via `arc_swap::ArcSwap`
// so readers get a consistent whole-record view with no locking, single
// writer, atomic pointer swap. Generalized from a `TradeStreamProcessor`/
// `OrderBookManager` pair (separate RwLock-guarded fields, WS-dialing loops)
// into one push-driven, swap-based state holder with no outbound connection
// of its own.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::types::{MicroSnapshot, Side};

/// How many recent CVD samples feed the regression slope (`cvd_slope` is a
/// linear-regression slope over the trailing window).
const CVD_SLOPE_WINDOW: usize = 30;

#[derive(Debug, Clone, Copy)]
pub struct TradeEvent {
    pub epoch_micros: i64,
    pub price: f64,
    pub size: f64,
    pub side: Side,
}

#[derive(Debug, Clone, Copy)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

pub struct OrderbookEvent<'a> {
    pub epoch_micros: i64,
    pub bids: &'a [BookLevel],
    pub asks: &'a [BookLevel],
}

struct CvdSample {
    epoch_micros: i64,
    cvd: f64,
}

/// Mutable accumulator behind the atomic snapshot; only the micro ingestor
/// (single writer) touches this directly.
struct Mutable {
    cvd: f64,
    cvd_history: VecDeque<CvdSample>,
    depth_levels: usize,
}

pub struct MicroStream {
    staleness_ms: i64,
    mutable: Mutex<Mutable>,
    snapshot: ArcSwap<MicroSnapshot>,
}

impl MicroStream {
    pub fn new(staleness_ms: i64, depth_levels: usize) -> Self {
        Self {
            staleness_ms,
            mutable: Mutex::new(Mutable {
                cvd: 0.0,
                cvd_history: VecDeque::with_capacity(CVD_SLOPE_WINDOW),
                depth_levels: depth_levels.max(1),
            }),
            snapshot: ArcSwap::from_pointee(MicroSnapshot::unavailable()),
        }
    }

    /// Fold a trade into CVD. Does not by itself publish a new snapshot —
    /// `mid`/`bid`/`ask` only change on an orderbook update, so the published
    /// record is refreshed from `on_orderbook`, carrying the latest CVD
    /// alongside the latest book. This mirrors the single-writer discipline:
    /// trades update the accumulator, the book event republishes the whole
    /// record.
    pub fn on_trade(&self, trade: TradeEvent) {
        let mut m = self.mutable.lock();
        let signed = match trade.side {
            Side::Long => trade.size,
            Side::Short => -trade.size,
        };
        m.cvd += signed;
        m.cvd_history.push_back(CvdSample {
            epoch_micros: trade.epoch_micros,
            cvd: m.cvd,
        });
        while m.cvd_history.len() > CVD_SLOPE_WINDOW {
            m.cvd_history.pop_front();
        }

        // Republish with updated CVD, keeping the last-known book fields and
        // the trade price as the new last_trade_price.
        let prev = self.snapshot.load();
        let cvd_slope = cvd_slope(&m.cvd_history);
        let next = MicroSnapshot {
            epoch_micros: trade.epoch_micros,
            last_trade_price: trade.price,
            cvd: m.cvd,
            cvd_slope,
            available: prev.available,
            ..**prev
        };
        self.snapshot.store(Arc::new(next));
    }

    /// Fold an orderbook snapshot into the published record: best bid/ask,
    /// spread, summed top-K depth, and ladder imbalance.
    pub fn on_orderbook(&self, book: OrderbookEvent<'_>) {
        let mut m = self.mutable.lock();
        let k = m.depth_levels;

        let best_bid = book.bids.first().map(|l| l.price).unwrap_or(0.0);
        let best_ask = book.asks.first().map(|l| l.price).unwrap_or(0.0);
        let bid_depth: f64 = book.bids.iter().take(k).map(|l| l.size).sum();
        let ask_depth: f64 = book.asks.iter().take(k).map(|l| l.size).sum();

        let mid = (best_bid + best_ask) / 2.0;
        let spread_bps = if mid > 0.0 {
            (best_ask - best_bid) / mid * 10_000.0
        } else {
            0.0
        };
        let total_depth = bid_depth + ask_depth;
        let ladder_imbalance = if total_depth > 0.0 {
            (bid_depth - ask_depth) / total_depth
        } else {
            0.0
        };

        let prev = self.snapshot.load();
        let available = best_bid > 0.0 && best_ask > 0.0 && best_ask > best_bid;

        let next = MicroSnapshot {
            epoch_micros: book.epoch_micros,
            mid,
            bid: best_bid,
            ask: best_ask,
            spread_bps,
            bid_depth,
            ask_depth,
            ladder_imbalance,
            cvd: m.cvd,
            cvd_slope: cvd_slope(&m.cvd_history),
            last_trade_price: prev.last_trade_price,
            available,
        };
        self.snapshot.store(Arc::new(next));
    }

    /// Current snapshot, with `available` forced to `false` if the record
    /// is older than `staleness_ms` relative to `now_micros`.
    pub fn snapshot(&self, now_micros: i64) -> MicroSnapshot {
        let snap = self.snapshot.load();
        let age_ms = (now_micros - snap.epoch_micros) / 1_000;
        if snap.available && age_ms > self.staleness_ms {
            MicroSnapshot {
                available: false,
                ..**snap
            }
        } else {
            (**snap).clone()
        }
    }
}

/// OLS slope of `cvd` against sample index over the trailing window. Returns
/// `0.0` (rather than an `Option`, since `cvd_slope` is a plain `f64` field)
/// when fewer than two samples exist.
fn cvd_slope(history: &VecDeque<CvdSample>) -> f64 {
    let n = history.len();
    if n < 2 {
        return 0.0;
    }

    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let ys: Vec<f64> = history.iter().map(|s| s.cvd).collect();
    let x_mean = xs.iter().sum::<f64>() / n as f64;
    let y_mean = ys.iter().sum::<f64>() / n as f64;

    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..n {
        let dx = xs[i] - x_mean;
        num += dx * (ys[i] - y_mean);
        den += dx * dx;
    }

    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}
