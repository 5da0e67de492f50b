// =============================================================================
// CandleStore — bounded, per-timeframe in-memory bar store
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use tracing::warn;

use crate::types::{Bar, Timeframe};

/// Typed, bounded-history store of closed bars indexed by timeframe, plus the
/// single in-progress ("open") bar per timeframe.
///
/// Single writer per timeframe (the aggregator, or the bulk CSV loader in
/// batch mode); multiple concurrent readers. Readers get an owned `Vec<Bar>`
/// copy of the requested slice rather than a reference into the ring.
pub struct CandleStore {
    capacity: usize,
    closed: RwLock<HashMap<Timeframe, VecDeque<Bar>>>,
    open: RwLock<HashMap<Timeframe, Bar>>,
}

impl CandleStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            closed: RwLock::new(HashMap::new()),
            open: RwLock::new(HashMap::new()),
        }
    }

    /// Append a closed bar to `tf`'s ring. Rejects out-of-order or
    /// misaligned bars; evicts the oldest entry once at capacity.
    pub fn append(&self, tf: Timeframe, bar: Bar) -> Result<(), String> {
        if bar.epoch_start % tf.secs() != 0 {
            return Err(format!(
                "bar.epoch_start {} not aligned to timeframe {tf} ({}s)",
                bar.epoch_start,
                tf.secs()
            ));
        }
        if !bar.is_valid() {
            return Err("bar fails OHLCV invariant".to_string());
        }

        let mut closed = self.closed.write();
        let ring = closed.entry(tf).or_insert_with(VecDeque::new);

        if let Some(last) = ring.back() {
            if bar.epoch_start <= last.epoch_start {
                return Err(format!(
                    "bar.epoch_start {} <= last closed epoch_start {} for {tf}",
                    bar.epoch_start, last.epoch_start
                ));
            }
            if bar.epoch_start != last.epoch_start + tf.secs() {
                warn!(
                    tf = %tf,
                    expected = last.epoch_start + tf.secs(),
                    got = bar.epoch_start,
                    "non-contiguous bar appended to CandleStore; caller should have gap-filled"
                );
            }
        }

        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(bar);
        Ok(())
    }

    /// Up to `n` most recent closed bars for `tf`, oldest-first. Never
    /// includes the in-progress bar.
    pub fn latest(&self, tf: Timeframe, n: usize) -> Vec<Bar> {
        let closed = self.closed.read();
        match closed.get(&tf) {
            Some(ring) => {
                let len = ring.len();
                let start = len.saturating_sub(n);
                ring.iter().skip(start).copied().collect()
            }
            None => Vec::new(),
        }
    }

    /// All closed bars for `tf`, oldest-first.
    pub fn all(&self, tf: Timeframe) -> Vec<Bar> {
        self.latest(tf, usize::MAX)
    }

    pub fn get_open(&self, tf: Timeframe) -> Option<Bar> {
        self.open.read().get(&tf).copied()
    }

    pub fn set_open(&self, tf: Timeframe, bar: Bar) {
        self.open.write().insert(tf, bar);
    }

    pub fn clear_open(&self, tf: Timeframe) {
        self.open.write().remove(&tf);
    }

    pub fn size(&self, tf: Timeframe) -> usize {
        self.closed.read().get(&tf).map(VecDeque::len).unwrap_or(0)
    }

    /// Last closed bar for `tf`, if any.
    pub fn last_closed(&self, tf: Timeframe) -> Option<Bar> {
        self.closed.read().get(&tf).and_then(|r| r.back()).copied()
    }

    /// Reset all state — used between CSV imports and at the start of a
    /// backtest run so it can be replayed deterministically.
    pub fn reset(&self) {
        self.closed.write().clear();
        self.open.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(epoch: i64, close: f64) -> Bar {
        Bar {
            epoch_start: epoch,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            synthetic: false,
        }
    }

    #[test]
    fn append_and_latest_in_order() {
        let store = CandleStore::new(10);
        for i in 0..5 {
            store.append(Timeframe::M5, bar(i * 300, 100.0 + i as f64)).unwrap();
        }
        let got = store.latest(Timeframe::M5, 3);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].epoch_start, 600);
        assert_eq!(got[2].epoch_start, 1200);
    }

    #[test]
    fn rejects_misaligned_bar() {
        let store = CandleStore::new(10);
        let err = store.append(Timeframe::M5, bar(301, 100.0));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_non_monotonic_append() {
        let store = CandleStore::new(10);
        store.append(Timeframe::M5, bar(600, 100.0)).unwrap();
        let err = store.append(Timeframe::M5, bar(300, 101.0));
        assert!(err.is_err());
        let err2 = store.append(Timeframe::M5, bar(600, 101.0));
        assert!(err2.is_err());
    }

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let store = CandleStore::new(3);
        for i in 0..5 {
            store.append(Timeframe::M5, bar(i * 300, 100.0)).unwrap();
        }
        assert_eq!(store.size(Timeframe::M5), 3);
        let all = store.all(Timeframe::M5);
        assert_eq!(all.first().unwrap().epoch_start, 600);
        assert_eq!(all.last().unwrap().epoch_start, 1200);
    }

    #[test]
    fn open_bar_not_returned_by_latest() {
        let store = CandleStore::new(10);
        store.append(Timeframe::M5, bar(0, 100.0)).unwrap();
        store.set_open(Timeframe::M5, bar(300, 101.0));
        assert_eq!(store.latest(Timeframe::M5, 10).len(), 1);
        assert!(store.get_open(Timeframe::M5).is_some());
    }

    #[test]
    fn reset_clears_everything() {
        let store = CandleStore::new(10);
        store.append(Timeframe::M5, bar(0, 100.0)).unwrap();
        store.set_open(Timeframe::M5, bar(300, 101.0));
        store.reset();
        assert_eq!(store.size(Timeframe::M5), 0);
        assert!(store.get_open(Timeframe::M5).is_none());
    }
}
