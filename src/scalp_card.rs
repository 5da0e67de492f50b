// =============================================================================
// ScalpCardComposer — deterministic projection from Signal to trade card
// =============================================================================
//
// A confirmed `Signal` plus the `VetoSet`/`MicroSnapshot` in effect at
// confirmation time are folded into one immutable `ScalpCard`. Once
// composed, a card never changes — later microstructure moves republish a
// new `MicroSnapshot` on the bus, they don't mutate an already-issued card.
// Grounded on `decision_envelope.rs`'s `DecisionEnvelope::allow`/`blocked`
// pattern (a verdict-bearing value built once from its inputs, never
// mutated after), generalized from a pass/fail envelope into a full order
// ticket.

use crate::config::StrategyParams;
use crate::types::{
    MicroSnapshot, ScalpCard, ScalpCardChecks, ScalpCardIndices, Signal, Tier, VetoSet,
};

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

pub struct ScalpCardComposer;

impl ScalpCardComposer {
    /// `order_path` is a fixed, configured string describing the intended
    /// venue/route — this module has no connectivity of its own and never
    /// derives the route from market data.
    pub fn compose(
        symbol: &str,
        order_path: &str,
        tier: Tier,
        signal: &Signal,
        veto: &VetoSet,
        micro: &MicroSnapshot,
        params: &StrategyParams,
    ) -> ScalpCard {
        let confirm = confirm_description(signal, params);
        let spread_ok = micro.available && !veto.contains_key(&crate::types::VetoReason::Spread);

        ScalpCard {
            symbol: symbol.to_string(),
            play: signal.side,
            regime: tier.to_string(),
            size_tag: signal.size_tag,
            entry: round4(signal.entry),
            sl: round4(signal.stop_loss),
            tp1: round4(signal.tp1),
            tp2: round4(signal.tp2),
            tp3: round4(signal.tp3),
            trail_rule: signal.trail_rule.to_string(),
            order_path: order_path.to_string(),
            confirm,
            indices: ScalpCardIndices {
                extremum_idx: signal.candidate.extremum_index,
                confirm_idx: signal.confirm_index,
            },
            checks: ScalpCardChecks {
                spread_ok,
                micro_veto: veto.clone(),
            },
            attempts: signal.attempts,
        }
    }
}

/// Builds the human-readable confirmation predicate string, e.g.
/// "close>=low+0.5*ATR5 & vol>=1.5*med20" for a long.
fn confirm_description(signal: &Signal, params: &StrategyParams) -> String {
    match signal.side {
        crate::types::Side::Long => format!(
            "close>=low+{:.2}*ATR5 & vol>={:.2}*med20",
            params.breakout_atr_mult, params.vol_mult
        ),
        crate::types::Side::Short => format!(
            "close<=high-{:.2}*ATR5 & vol>={:.2}*med20",
            params.breakout_atr_mult, params.vol_mult
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candidate, Side, SizeTag, TrailRule, VetoReason};

    fn signal(side: Side) -> Signal {
        let candidate = Candidate {
            extremum_index: 40,
            side,
            extremum_price: 100.0,
            detection_epoch: 0,
            window_deadline_epoch: 1800,
        };
        Signal {
            candidate,
            confirm_index: 43,
            entry: 101.23456,
            stop_loss: 99.111119,
            tp1: 103.0,
            tp2: 105.0,
            tp3: 107.5,
            size_tag: SizeTag::Full,
            attempts: 3,
            side,
            trail_rule: TrailRule::Atr5PostTp1,
        }
    }

    fn clean_micro() -> MicroSnapshot {
        MicroSnapshot {
            available: true,
            ..MicroSnapshot::unavailable()
        }
    }

    #[test]
    fn rounds_prices_to_four_decimals() {
        let card = ScalpCardComposer::compose(
            "SOLUSD",
            "maker-post-only",
            Tier::A,
            &signal(Side::Long),
            &VetoSet::new(),
            &clean_micro(),
            &StrategyParams::default(),
        );
        assert_eq!(card.entry, 101.2346);
        assert_eq!(card.sl, 99.1111);
    }

    #[test]
    fn spread_ok_false_when_spread_veto_present() {
        let mut veto = VetoSet::new();
        veto.insert(VetoReason::Spread, 15.0);
        let card = ScalpCardComposer::compose(
            "SOLUSD",
            "maker-post-only",
            Tier::B,
            &signal(Side::Short),
            &veto,
            &clean_micro(),
            &StrategyParams::default(),
        );
        assert!(!card.checks.spread_ok);
        assert_eq!(card.checks.micro_veto.len(), 1);
    }

    #[test]
    fn confirm_string_reflects_side() {
        let long_card = ScalpCardComposer::compose(
            "SOLUSD",
            "maker-post-only",
            Tier::A,
            &signal(Side::Long),
            &VetoSet::new(),
            &clean_micro(),
            &StrategyParams::default(),
        );
        assert!(long_card.confirm.contains("close>=low+"));

        let short_card = ScalpCardComposer::compose(
            "SOLUSD",
            "maker-post-only",
            Tier::A,
            &signal(Side::Short),
            &VetoSet::new(),
            &clean_micro(),
            &StrategyParams::default(),
        );
        assert!(short_card.confirm.contains("close<=high-"));
    }

    #[test]
    fn order_path_is_passed_through_unchanged() {
        let card = ScalpCardComposer::compose(
            "SOLUSD",
            "ioc-limit@best-bid",
            Tier::A,
            &signal(Side::Long),
            &VetoSet::new(),
            &clean_micro(),
            &StrategyParams::default(),
        );
        assert_eq!(card.order_path, "ioc-limit@best-bid");
    }

    #[test]
    fn regime_label_carries_the_confluence_tier() {
        let card = ScalpCardComposer::compose(
            "SOLUSD",
            "maker-post-only",
            Tier::Skip,
            &signal(Side::Long),
            &VetoSet::new(),
            &clean_micro(),
            &StrategyParams::default(),
        );
        assert_eq!(card.regime, "SKIP");
    }
}
