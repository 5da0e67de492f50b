// =============================================================================
// Aggregator — folds price ticks into OHLCV bars per timeframe
// =============================================================================
//
// Generalized from a kline-ingestion loop that simply relayed pre-aggregated
// exchange klines into a real bucket-fold over raw ticks, as required for a
// single-feed instrument with no exchange-side bar service.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::candle_store::CandleStore;
use crate::types::{Bar, Timeframe};

/// A single incoming price tick.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub epoch_micros: i64,
    pub price: f64,
    pub size: f64,
}

/// Folds ticks into bars for one timeframe, publishing closed bars into a
/// shared `CandleStore`. One `Aggregator` instance per active timeframe, per
/// the concurrency model — each owns exclusive write access to its tf's slot.
pub struct Aggregator {
    tf: Timeframe,
    bucket_key: Option<i64>,
    last_price: f64,
    dropped_ticks: AtomicU64,
}

impl Aggregator {
    pub fn new(tf: Timeframe) -> Self {
        Self {
            tf,
            bucket_key: None,
            last_price: 0.0,
            dropped_ticks: AtomicU64::new(0),
        }
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks.load(Ordering::Relaxed)
    }

    /// Fold one tick into the current bucket, publishing any bars it closes
    /// (including synthetic gap-fill bars for skipped buckets) to `store`.
    pub fn on_tick(&mut self, tick: Tick, store: &CandleStore) {
        let width_micros = self.tf.micros();
        let key = tick.epoch_micros.div_euclid(width_micros);

        let current = match self.bucket_key {
            None => {
                self.open_bucket(key, tick.price, tick.size, store);
                self.last_price = tick.price;
                return;
            }
            Some(k) => k,
        };

        if key < current {
            self.dropped_ticks.fetch_add(1, Ordering::Relaxed);
            warn!(tf = %self.tf, tick_epoch = tick.epoch_micros, "dropped out-of-order tick");
            return;
        }

        if key == current {
            self.fold_into_open(tick.price, tick.size, store);
            self.last_price = tick.price;
            return;
        }

        // key > current: close the open bucket, gap-fill any skipped
        // buckets, then open the new one.
        self.close_open(store);
        let mut gap_key = current + 1;
        while gap_key < key {
            self.publish_synthetic(gap_key, store);
            gap_key += 1;
        }
        self.open_bucket(key, tick.price, tick.size, store);
        self.last_price = tick.price;
    }

    fn open_bucket(&mut self, key: i64, price: f64, size: f64, store: &CandleStore) {
        self.bucket_key = Some(key);
        let bar = Bar {
            epoch_start: key * self.tf.secs(),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size.max(0.0),
            synthetic: false,
        };
        store.set_open(self.tf, bar);
    }

    fn fold_into_open(&mut self, price: f64, size: f64, store: &CandleStore) {
        if let Some(mut bar) = store.get_open(self.tf) {
            bar.high = bar.high.max(price);
            bar.low = bar.low.min(price);
            bar.close = price;
            bar.volume += size.max(0.0);
            store.set_open(self.tf, bar);
        }
    }

    fn close_open(&mut self, store: &CandleStore) {
        if let Some(bar) = store.get_open(self.tf) {
            if let Err(e) = store.append(self.tf, bar) {
                warn!(tf = %self.tf, error = %e, "failed to append closed bar");
            }
            store.clear_open(self.tf);
        }
    }

    fn publish_synthetic(&mut self, key: i64, store: &CandleStore) {
        let bar = Bar {
            epoch_start: key * self.tf.secs(),
            open: self.last_price,
            high: self.last_price,
            low: self.last_price,
            close: self.last_price,
            volume: 0.0,
            synthetic: true,
        };
        if let Err(e) = store.append(self.tf, bar) {
            warn!(tf = %self.tf, error = %e, "failed to append synthetic gap-fill bar");
        }
    }

    /// Force-close the current open bucket without waiting for the next
    /// tick. Used on shutdown so the last partial bar isn't silently lost
    /// from the closed series during tests/backtests.
    pub fn flush(&mut self, store: &CandleStore) {
        self.close_open(store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(micros: i64, price: f64, size: f64) -> Tick {
        Tick {
            epoch_micros: micros,
            price,
            size,
        }
    }

    #[test]
    fn folds_ticks_within_bucket() {
        let store = CandleStore::new(10);
        let mut agg = Aggregator::new(Timeframe::S1);
        agg.on_tick(tick(0, 100.0, 1.0), &store);
        agg.on_tick(tick(500_000, 102.0, 2.0), &store);
        agg.on_tick(tick(900_000, 99.0, 1.0), &store);

        let open = store.get_open(Timeframe::S1).unwrap();
        assert_eq!(open.open, 100.0);
        assert_eq!(open.high, 102.0);
        assert_eq!(open.low, 99.0);
        assert_eq!(open.close, 99.0);
        assert_eq!(open.volume, 4.0);
    }

    #[test]
    fn closes_bucket_on_boundary_cross() {
        let store = CandleStore::new(10);
        let mut agg = Aggregator::new(Timeframe::S1);
        agg.on_tick(tick(0, 100.0, 1.0), &store);
        agg.on_tick(tick(1_000_000, 105.0, 1.0), &store);

        assert_eq!(store.size(Timeframe::S1), 1);
        let closed = store.last_closed(Timeframe::S1).unwrap();
        assert_eq!(closed.epoch_start, 0);
        assert_eq!(closed.close, 100.0);

        let open = store.get_open(Timeframe::S1).unwrap();
        assert_eq!(open.epoch_start, 1);
        assert_eq!(open.open, 105.0);
    }

    #[test]
    fn gap_fills_skipped_buckets() {
        let store = CandleStore::new(10);
        let mut agg = Aggregator::new(Timeframe::S1);
        agg.on_tick(tick(0, 100.0, 1.0), &store);
        // Skip straight to bucket 3 (2 intermediate buckets must be gap-filled).
        agg.on_tick(tick(3_000_000, 110.0, 1.0), &store);

        assert_eq!(store.size(Timeframe::S1), 3);
        let all = store.all(Timeframe::S1);
        assert_eq!(all[0].epoch_start, 0);
        assert!(!all[0].synthetic);
        assert_eq!(all[1].epoch_start, 1);
        assert!(all[1].synthetic);
        assert_eq!(all[1].volume, 0.0);
        assert_eq!(all[1].close, 100.0);
        assert_eq!(all[2].epoch_start, 2);
        assert!(all[2].synthetic);
    }

    #[test]
    fn drops_out_of_order_tick() {
        let store = CandleStore::new(10);
        let mut agg = Aggregator::new(Timeframe::S1);
        agg.on_tick(tick(2_000_000, 100.0, 1.0), &store);
        agg.on_tick(tick(500_000, 95.0, 1.0), &store);
        assert_eq!(agg.dropped_ticks(), 1);
        // The stale tick must not have mutated the current open bucket.
        let open = store.get_open(Timeframe::S1).unwrap();
        assert_eq!(open.open, 100.0);
    }

    #[test]
    fn flush_closes_partial_bar() {
        let store = CandleStore::new(10);
        let mut agg = Aggregator::new(Timeframe::S1);
        agg.on_tick(tick(0, 100.0, 1.0), &store);
        agg.flush(&store);
        assert_eq!(store.size(Timeframe::S1), 1);
        assert!(store.get_open(Timeframe::S1).is_none());
    }
}
