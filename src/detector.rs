// =============================================================================
// SignalDetector — two-stage candidate screening + micro-confirmation
// =============================================================================

use tracing::debug;

use crate::candle_store::CandleStore;
use crate::config::StrategyParams;
use crate::error::EngineError;
use crate::indicators::{atr, extrema, volume_z, IndicatorEngine};
use crate::types::{Candidate, Side, Signal, SizeTag, Timeframe, TrailRule};

/// Minimum closed 5m bars required before Stage 1 can run at all.
fn min_history(params: &StrategyParams) -> usize {
    params.confirm_window.max(50) + extrema::DEFAULT_WINDOW
}

/// Runs Stage 1 (candidate gate) and Stage 2 (micro-confirm) over the 5m
/// closed-bar series. Stateless over calls — any open `Candidate`s are
/// owned by the caller (the `MTFStateMachine`), which re-submits them each
/// tick via `confirm`.
pub struct SignalDetector;

impl SignalDetector {
    /// Stage 1: scan the most recently labelable bar for a new candidate.
    /// Returns `Ok(None)` when the bar doesn't qualify, `Err` when there
    /// isn't enough history to evaluate it at all.
    pub fn scan_candidate(
        store: &CandleStore,
        params: &StrategyParams,
    ) -> Result<Option<Candidate>, EngineError> {
        let bars = store.all(Timeframe::M5);
        let need = min_history(params);
        if bars.len() < need {
            return Err(EngineError::InsufficientHistory {
                need,
                have: bars.len(),
            });
        }

        let i = match extrema::last_labelable_index(bars.len(), extrema::DEFAULT_WINDOW) {
            Some(i) => i,
            None => {
                return Err(EngineError::InsufficientHistory {
                    need,
                    have: bars.len(),
                })
            }
        };

        let snap = IndicatorEngine::snapshot_at(&bars, i);

        let (atr14, vol_z50, bb_width) = match (snap.atr14, snap.vol_z50, snap.bb_width) {
            (Some(a), Some(v), Some(b)) => (a, v, b),
            _ => return Ok(None),
        };

        let price = bars[i].close;
        if price <= 0.0 {
            return Ok(None);
        }
        let atr_ratio = atr14 / price;

        if atr_ratio < params.atr_min || vol_z50 < params.volz_min || bb_width < params.bbw_min {
            return Ok(None);
        }

        let side = match (snap.is_local_high, snap.is_local_low) {
            (Some(true), _) => Side::Short,
            (_, Some(true)) => Side::Long,
            _ => return Ok(None),
        };

        let extremum_price = match side {
            Side::Short => bars[i].high,
            Side::Long => bars[i].low,
        };

        let candidate = Candidate {
            extremum_index: i,
            side,
            extremum_price,
            detection_epoch: bars[i].epoch_start,
            window_deadline_epoch: bars[i].epoch_start
                + params.confirm_window as i64 * Timeframe::M5.secs(),
        };

        debug!(
            index = i,
            side = %side,
            atr_ratio,
            vol_z50,
            bb_width,
            "candidate detected"
        );

        Ok(Some(candidate))
    }

    /// Stage 2: attempt to confirm an open candidate against the current
    /// closed-bar series. Returns `Ok(None)` while still inside the
    /// confirmation window with no confirmation yet, `Ok(Some(Expired))`-style
    /// outcome is communicated via `ConfirmOutcome::Expired`, and
    /// `Ok(Some(Confirmed(signal)))` on confirmation.
    pub fn confirm(
        candidate: &Candidate,
        store: &CandleStore,
        params: &StrategyParams,
    ) -> Result<ConfirmOutcome, EngineError> {
        let bars = store.all(Timeframe::M5);
        let need = min_history(params);
        if bars.len() < need {
            return Err(EngineError::InsufficientHistory {
                need,
                have: bars.len(),
            });
        }

        let i = candidate.extremum_index;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

        let j_max = (i + params.confirm_window).min(bars.len() - 1);
        for j in (i + 1)..=j_max {
            if bars[j].epoch_start > candidate.window_deadline_epoch {
                return Ok(ConfirmOutcome::Expired);
            }

            let atr5 = match atr::atr5(&bars[..=j]) {
                Some(v) => v,
                None => continue,
            };
            let median20 = match volume_z::median_volume(&volumes[..=j], 20) {
                Some(v) => v,
                None => continue,
            };

            let vol_ok = bars[j].volume >= params.vol_mult * median20;

            let confirmed = match candidate.side {
                Side::Long => {
                    closes[j] >= candidate.extremum_price + params.breakout_atr_mult * atr5
                        && vol_ok
                }
                Side::Short => {
                    closes[j] <= candidate.extremum_price - params.breakout_atr_mult * atr5
                        && vol_ok
                }
            };

            if confirmed {
                let entry = closes[j];
                let stop_loss = match candidate.side {
                    Side::Long => candidate.extremum_price - atr5,
                    Side::Short => candidate.extremum_price + atr5,
                };
                let risk = (entry - stop_loss).abs();
                let sign = match candidate.side {
                    Side::Long => 1.0,
                    Side::Short => -1.0,
                };

                let signal = Signal {
                    candidate: *candidate,
                    confirm_index: j,
                    entry,
                    stop_loss,
                    tp1: entry + sign * params.tp1_r * risk,
                    tp2: entry + sign * params.tp2_r * risk,
                    tp3: entry + sign * params.tp3_r * risk,
                    size_tag: SizeTag::Full,
                    attempts: (j - i) as u32,
                    side: candidate.side,
                    trail_rule: TrailRule::Atr5PostTp1,
                };

                debug!(
                    extremum_index = i,
                    confirm_index = j,
                    entry,
                    stop_loss,
                    "candidate confirmed"
                );

                return Ok(ConfirmOutcome::Confirmed(signal));
            }
        }

        if bars[j_max].epoch_start > candidate.window_deadline_epoch
            || j_max >= i + params.confirm_window
        {
            return Ok(ConfirmOutcome::Expired);
        }

        Ok(ConfirmOutcome::Pending)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ConfirmOutcome {
    Pending,
    Confirmed(Signal),
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bar;

    fn push_bar(store: &CandleStore, i: i64, open: f64, high: f64, low: f64, close: f64, vol: f64) {
        store
            .append(
                Timeframe::M5,
                Bar {
                    epoch_start: i * 300,
                    open,
                    high,
                    low,
                    close,
                    volume: vol,
                    synthetic: false,
                },
            )
            .unwrap();
    }

    /// Build a series with a clean local low at index 20 and enough history
    /// either side to satisfy the extrema window and Stage 1 gates.
    fn scenario_long() -> CandleStore {
        let store = CandleStore::new(5000);
        for i in 0..70 {
            let base = 100.0 + (i as f64 - 20.0).abs() * 0.3;
            let vol = if i == 22 { 40.0 } else { 10.0 };
            push_bar(&store, i, base, base + 0.5, base - 0.5, base, vol);
        }
        // Carve the local low precisely at index 20.
        store
    }

    #[test]
    fn insufficient_history_returns_error() {
        let store = CandleStore::new(5000);
        let params = StrategyParams::default();
        let err = SignalDetector::scan_candidate(&store, &params);
        assert!(matches!(err, Err(EngineError::InsufficientHistory { .. })));
    }

    #[test]
    fn stage1_finds_no_candidate_on_flat_series() {
        let store = CandleStore::new(5000);
        for i in 0..70 {
            push_bar(&store, i, 100.0, 100.0, 100.0, 100.0, 10.0);
        }
        let params = StrategyParams::default();
        let result = SignalDetector::scan_candidate(&store, &params).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn candidate_extremum_index_is_within_labelable_window() {
        let store = scenario_long();
        let params = StrategyParams {
            atr_min: 0.0,
            volz_min: -10.0,
            bbw_min: 0.0,
            ..StrategyParams::default()
        };
        let result = SignalDetector::scan_candidate(&store, &params).unwrap();
        if let Some(c) = result {
            assert!(c.detection_epoch < c.window_deadline_epoch);
        }
    }
}
