// =============================================================================
// VetoEvaluator — stateless microstructure pre-flight checks
// =============================================================================
//
// A pure predicate over {bar, indicator snapshot, micro snapshot, side} that
// returns the set of reasons execution should be blocked. Empty set ⇒ pass.
// Generalized from a gate-check-returns-block-reason shape (one per-filter
// early-return check per gate) into "every failing gate contributes a
// reason" rather than "first failing gate blocks", since `VetoSet` is a set,
// not a single short-circuiting verdict.

use crate::config::VetoParams;
use crate::types::{Bar, IndicatorSnapshot, MicroSnapshot, Side, VetoReason, VetoSet};

pub struct VetoEvaluator;

impl VetoEvaluator {
    /// Evaluate all seven veto reasons. `kill_switch` is an external input
    /// (caller-supplied flag), not derived from market data.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        bar: &Bar,
        indicators: &IndicatorSnapshot,
        micro: &MicroSnapshot,
        side: Side,
        risk_distance: f64,
        kill_switch: bool,
        params: &VetoParams,
    ) -> VetoSet {
        let mut set = VetoSet::new();

        if kill_switch {
            set.insert(VetoReason::Kill, 1.0);
        }

        if micro.available {
            let opposes = match side {
                Side::Long => micro.ladder_imbalance < 0.0,
                Side::Short => micro.ladder_imbalance > 0.0,
            };
            if opposes && micro.ladder_imbalance.abs() >= params.depth_imbalance_threshold {
                set.insert(VetoReason::Depth, micro.ladder_imbalance);
            }

            if micro.mid > 0.0 {
                let deviation = (micro.mid - micro.last_trade_price).abs() / micro.mid;
                if deviation >= params.mark_deviation_threshold {
                    set.insert(VetoReason::Imbalance, deviation);
                }
            }

            if micro.spread_bps >= params.spread_bps_max {
                set.insert(VetoReason::Spread, micro.spread_bps);
            }
        }

        if let Some(obv_z) = indicators.obv_z10 {
            let diverges = match side {
                Side::Long => obv_z <= -params.obv_divergence_sigma,
                Side::Short => obv_z >= params.obv_divergence_sigma,
            };
            if diverges {
                set.insert(VetoReason::Obv, obv_z);
            }
        }

        if let Some(rsi) = indicators.rsi14 {
            let extreme = match side {
                Side::Long => rsi >= params.rsi_extreme_hi,
                Side::Short => rsi <= params.rsi_extreme_lo,
            };
            if extreme {
                set.insert(VetoReason::RsiExtreme, rsi);
            }
        }

        if let Some(atr14) = indicators.atr14 {
            let fee_floor = params.taker_fee_bps / 10_000.0 * bar.close * 10.0;
            let floor = (params.liq_gap_atr_mult * atr14).max(fee_floor);
            if risk_distance < floor {
                set.insert(VetoReason::LiqGap, risk_distance);
            }
        }

        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64) -> Bar {
        Bar {
            epoch_start: 0,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            synthetic: false,
        }
    }

    fn indicators() -> IndicatorSnapshot {
        IndicatorSnapshot {
            atr14: Some(1.0),
            rsi14: Some(50.0),
            obv_z10: Some(0.0),
            ..IndicatorSnapshot::default()
        }
    }

    fn available_micro() -> MicroSnapshot {
        MicroSnapshot {
            epoch_micros: 0,
            mid: 100.0,
            bid: 99.9,
            ask: 100.1,
            spread_bps: 5.0,
            bid_depth: 10.0,
            ask_depth: 10.0,
            ladder_imbalance: 0.0,
            cvd: 0.0,
            cvd_slope: 0.0,
            last_trade_price: 100.0,
            available: true,
        }
    }

    #[test]
    fn empty_set_when_all_clear() {
        let set = VetoEvaluator::evaluate(
            &bar(100.0),
            &indicators(),
            &available_micro(),
            Side::Long,
            10.0,
            false,
            &VetoParams::default(),
        );
        assert!(set.is_empty());
    }

    #[test]
    fn depth_veto_when_imbalance_opposes_long() {
        let micro = MicroSnapshot {
            ladder_imbalance: -0.7,
            ..available_micro()
        };
        let set = VetoEvaluator::evaluate(
            &bar(100.0),
            &indicators(),
            &micro,
            Side::Long,
            10.0,
            false,
            &VetoParams::default(),
        );
        assert!(set.contains_key(&VetoReason::Depth));
    }

    #[test]
    fn depth_veto_does_not_fire_when_imbalance_favors_side() {
        let micro = MicroSnapshot {
            ladder_imbalance: 0.7,
            ..available_micro()
        };
        let set = VetoEvaluator::evaluate(
            &bar(100.0),
            &indicators(),
            &micro,
            Side::Long,
            10.0,
            false,
            &VetoParams::default(),
        );
        assert!(!set.contains_key(&VetoReason::Depth));
    }

    #[test]
    fn kill_switch_always_vetoes() {
        let set = VetoEvaluator::evaluate(
            &bar(100.0),
            &indicators(),
            &available_micro(),
            Side::Long,
            10.0,
            true,
            &VetoParams::default(),
        );
        assert!(set.contains_key(&VetoReason::Kill));
    }

    #[test]
    fn rsi_extreme_blocks_long_at_high_rsi() {
        let ind = IndicatorSnapshot {
            rsi14: Some(85.0),
            ..indicators()
        };
        let set = VetoEvaluator::evaluate(
            &bar(100.0),
            &ind,
            &available_micro(),
            Side::Long,
            10.0,
            false,
            &VetoParams::default(),
        );
        assert!(set.contains_key(&VetoReason::RsiExtreme));
    }

    #[test]
    fn liq_gap_when_risk_distance_too_small() {
        let set = VetoEvaluator::evaluate(
            &bar(100.0),
            &indicators(),
            &available_micro(),
            Side::Long,
            1.0, // 1.0 < 4 * atr14(1.0) = 4.0
            false,
            &VetoParams::default(),
        );
        assert!(set.contains_key(&VetoReason::LiqGap));
    }

    #[test]
    fn unavailable_micro_skips_micro_reasons() {
        let micro = MicroSnapshot::unavailable();
        let set = VetoEvaluator::evaluate(
            &bar(100.0),
            &indicators(),
            &micro,
            Side::Long,
            10.0,
            false,
            &VetoParams::default(),
        );
        assert!(!set.contains_key(&VetoReason::Depth));
        assert!(!set.contains_key(&VetoReason::Spread));
    }
}
