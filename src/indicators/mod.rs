// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the core technical indicators used
// by the trading engine.  Every public function returns `Option<T>` so callers
// are forced to handle insufficient-data and numerical-edge-case scenarios.

pub mod ema;
pub mod rsi;
pub mod bollinger;
pub mod atr;
pub mod volume_z;
pub mod obv;
pub mod extrema;

use crate::types::{Bar, IndicatorSnapshot};

/// Recomputes the full `IndicatorSnapshot` series aligned to a closed-bar
/// slice. Indices inside each indicator's warm-up window carry `None`.
///
/// This is a "full rebuild" path, separate from live incremental
/// maintenance — used by the backtest simulator, which needs the whole
/// aligned series up front, and by the live path on every new closed bar
/// (recomputing from the tail of the stored series rather than deriving true
/// O(1) update rules per indicator, which keeps every formula identical
/// between live and batch mode).
pub struct IndicatorEngine;

impl IndicatorEngine {
    /// Indicator snapshot at bar index `i`, computed from the prefix
    /// `bars[..=i]` only — no look-ahead.
    pub fn snapshot_at(bars: &[Bar], i: usize) -> IndicatorSnapshot {
        if i >= bars.len() {
            return IndicatorSnapshot::default();
        }
        let prefix = &bars[..=i];
        let closes: Vec<f64> = prefix.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = prefix.iter().map(|b| b.volume).collect();

        let atr14 = atr::calculate(prefix);
        let rsi14 = rsi::current_rsi(&closes, 14).map(|(v, _)| v);
        let bb = bollinger::calculate(&closes);
        let ema_fast = ema::calculate_ema(&closes, 9).last().copied();
        let ema_slow = ema::calculate_ema(&closes, 38).last().copied();
        let vol_z50 = volume_z::calculate(&volumes);
        let obv = obv::calculate_obv(prefix).last().copied();
        let obv_z10 = obv::calculate_z10(prefix);
        let is_local_high = extrema::is_local_high(bars, i, extrema::DEFAULT_WINDOW);
        let is_local_low = extrema::is_local_low(bars, i, extrema::DEFAULT_WINDOW);

        IndicatorSnapshot {
            atr14,
            rsi14,
            bb_upper: bb.as_ref().map(|b| b.upper),
            bb_lower: bb.as_ref().map(|b| b.lower),
            bb_width: bb.as_ref().map(|b| b.width),
            ema_fast,
            ema_slow,
            vol_z50,
            obv,
            obv_z10,
            is_local_high,
            is_local_low,
        }
    }

    /// Full aligned series, one snapshot per bar. `O(n^2)` in the worst case
    /// (each index recomputes from its own prefix) — acceptable for the
    /// backtest's bounded replay sizes; the live path only ever calls
    /// `snapshot_at` for the newest index.
    pub fn snapshot_series(bars: &[Bar]) -> Vec<IndicatorSnapshot> {
        (0..bars.len()).map(|i| Self::snapshot_at(bars, i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(i: i64, close: f64, volume: f64) -> Bar {
        Bar {
            epoch_start: i * 300,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume,
            synthetic: false,
        }
    }

    #[test]
    fn warm_up_indices_are_none() {
        let bars: Vec<Bar> = (0..5).map(|i| bar(i, 100.0 + i as f64, 10.0)).collect();
        let snap = IndicatorEngine::snapshot_at(&bars, 2);
        assert!(snap.atr14.is_none());
        assert!(snap.bb_upper.is_none());
    }

    #[test]
    fn warmed_up_series_produces_values() {
        let bars: Vec<Bar> = (0..60)
            .map(|i| bar(i, 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.1, 10.0 + i as f64))
            .collect();
        let snap = IndicatorEngine::snapshot_at(&bars, 59);
        assert!(snap.atr14.is_some());
        assert!(snap.rsi14.is_some());
        assert!(snap.bb_width.is_some());
        assert!(snap.ema_fast.is_some());
        assert!(snap.ema_slow.is_some());
        assert!(snap.vol_z50.is_some());
        assert!(snap.obv.is_some());
    }

    #[test]
    fn extrema_unavailable_near_tail() {
        let bars: Vec<Bar> = (0..20).map(|i| bar(i, 100.0, 10.0)).collect();
        let snap = IndicatorEngine::snapshot_at(&bars, 19);
        assert!(snap.is_local_high.is_none());
        assert!(snap.is_local_low.is_none());
    }

    #[test]
    fn snapshot_series_matches_snapshot_at() {
        let bars: Vec<Bar> = (0..30).map(|i| bar(i, 100.0 + i as f64, 10.0)).collect();
        let series = IndicatorEngine::snapshot_series(&bars);
        assert_eq!(series.len(), bars.len());
        let direct = IndicatorEngine::snapshot_at(&bars, 29);
        assert_eq!(series[29].atr14, direct.atr14);
    }
}
