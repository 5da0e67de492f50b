// =============================================================================
// MTFStateMachine — multi-timeframe confluence gate and candidate lifecycle
// =============================================================================
//
// Owns the single-instrument FSM: IDLE -> CANDIDATE -> CONFIRMING ->
// EXECUTABLE | REJECTED | EXPIRED -> IDLE. The state itself is an
// `RwLock`-guarded snapshot (cached classification behind a lock, read via a
// cheap clone). Confluence scoring is split out into `ConfluenceScorer`, a
// pure function over caller-supplied inputs, generalized from a regime-keyed
// `HashMap<String, f64>` weighted-sum scorer into the two fixed groups
// (context, micro) defined here.

use parking_lot::RwLock;
use tracing::debug;

use crate::config::{MtfParams, MtfWeights};
use crate::types::{
    Candidate, ContextGroup, ContextScores, FinalScore, MicroGroup, MicroScores, MtfConfluence,
    MtfPhase, MtfState, MtfStats, Side, Tier, VetoSet,
};

/// Raw per-side readings the caller assembles from `CandleStore`/indicator
/// snapshots/`MicroStream` each tick `CONFIRMING` needs to be scored. Any
/// indicator unavailable during warm-up is `None` and contributes no points
/// (neither for nor against) rather than being treated as a disagreement.
#[derive(Debug, Clone)]
pub struct ConfluenceInputs {
    pub side: Side,
    pub ema_fast_1h: Option<f64>,
    pub ema_slow_1h: Option<f64>,
    pub ema_fast_4h: Option<f64>,
    pub ema_slow_4h: Option<f64>,
    pub rsi_15m: Option<f64>,
    pub rsi_1h: Option<f64>,
    pub ema_fast_1d: Option<f64>,
    pub ema_slow_1d: Option<f64>,
    /// 0-100, precomputed by the caller from the `SignalDetector`'s
    /// confirmation margin (how far the confirming close exceeded the
    /// breakout level, normalized to ATR units).
    pub trigger_quality: f64,
    /// Net `close - open` of each of the last up to five 1m bars, oldest
    /// first. Fewer than five when warm-up hasn't filled the window yet.
    pub last_5_1m_moves: Vec<f64>,
    pub cvd_slope: f64,
}

/// Pure confluence arithmetic, kept separate from the FSM so it can be
/// scored and tested without wiring up candle history or micro state.
pub struct ConfluenceScorer;

impl ConfluenceScorer {
    pub fn score(inputs: &ConfluenceInputs, veto: &VetoSet, params: &MtfParams) -> MtfConfluence {
        let context = Self::context_group(inputs, &params.weights);
        let micro = Self::micro_group(inputs, veto, &params.weights, params.tape_micro_cvd_threshold);

        let final_score = 0.6 * context.total + 0.4 * micro.total;
        let tier = if final_score >= params.tier_a_threshold {
            Tier::A
        } else if final_score >= params.tier_b_threshold {
            Tier::B
        } else {
            Tier::Skip
        };

        MtfConfluence {
            context,
            micro,
            final_: FinalScore { final_score, tier },
        }
    }

    fn context_group(inputs: &ConfluenceInputs, weights: &MtfWeights) -> ContextGroup {
        let agrees = |fast: Option<f64>, slow: Option<f64>| -> Option<bool> {
            let (fast, slow) = (fast?, slow?);
            Some(match inputs.side {
                Side::Long => fast > slow,
                Side::Short => fast < slow,
            })
        };

        let agreements = [
            agrees(inputs.ema_fast_1h, inputs.ema_slow_1h),
            agrees(inputs.ema_fast_4h, inputs.ema_slow_4h),
        ];
        let known: Vec<bool> = agreements.into_iter().flatten().collect();
        let ema_alignment = if known.is_empty() {
            0.0
        } else {
            known.iter().filter(|a| **a).count() as f64 / known.len() as f64 * 100.0
        };

        let osc_sides = [
            inputs.rsi_15m.map(|r| match inputs.side {
                Side::Long => r > 50.0,
                Side::Short => r < 50.0,
            }),
            inputs.rsi_1h.map(|r| match inputs.side {
                Side::Long => r > 50.0,
                Side::Short => r < 50.0,
            }),
        ];
        let osc_known: Vec<bool> = osc_sides.into_iter().flatten().collect();
        let oscillator_agreement = if osc_known.is_empty() {
            0.0
        } else {
            osc_known.iter().filter(|a| **a).count() as f64 / osc_known.len() as f64 * 100.0
        };

        let macro_gate = match agrees(inputs.ema_fast_1d, inputs.ema_slow_1d) {
            Some(true) => 100.0,
            _ => 0.0,
        };

        let scores = ContextScores {
            ema_alignment,
            oscillator_agreement,
            macro_gate,
        };
        let weight_sum = weights.ema_alignment + weights.oscillator_agreement + weights.macro_gate;
        let total = if weight_sum > 0.0 {
            (scores.ema_alignment * weights.ema_alignment
                + scores.oscillator_agreement * weights.oscillator_agreement
                + scores.macro_gate * weights.macro_gate)
                / weight_sum
        } else {
            0.0
        };

        ContextGroup { total, scores }
    }

    fn micro_group(
        inputs: &ConfluenceInputs,
        veto: &VetoSet,
        weights: &MtfWeights,
        cvd_threshold: f64,
    ) -> MicroGroup {
        let trigger_5m = inputs.trigger_quality.clamp(0.0, 100.0);

        let impulse_1m = if inputs.last_5_1m_moves.is_empty() {
            0.0
        } else {
            let agreeing = inputs
                .last_5_1m_moves
                .iter()
                .filter(|&&mv| match inputs.side {
                    Side::Long => mv > 0.0,
                    Side::Short => mv < 0.0,
                })
                .count();
            agreeing as f64 / inputs.last_5_1m_moves.len() as f64 * 100.0
        };

        let aligned = match inputs.side {
            Side::Long => inputs.cvd_slope > 0.0,
            Side::Short => inputs.cvd_slope < 0.0,
        };
        let tape_micro = if aligned && cvd_threshold > 0.0 {
            50.0 + 50.0 * (inputs.cvd_slope.abs() / cvd_threshold).min(1.0)
        } else {
            0.0
        };

        let veto_hygiene = (100.0 - 25.0 * veto.len() as f64).max(0.0);

        let scores = MicroScores {
            trigger_5m,
            impulse_1m,
            tape_micro,
            veto_hygiene,
        };
        let weight_sum =
            weights.trigger_5m + weights.impulse_1m + weights.tape_micro + weights.veto_hygiene;
        let total = if weight_sum > 0.0 {
            (scores.trigger_5m * weights.trigger_5m
                + scores.impulse_1m * weights.impulse_1m
                + scores.tape_micro * weights.tape_micro
                + scores.veto_hygiene * weights.veto_hygiene)
                / weight_sum
        } else {
            0.0
        };

        MicroGroup { total, scores }
    }
}

/// Outcome of scoring a `CONFIRMING` candidate, returned by
/// `MTFStateMachine::on_confirmed` alongside the new phase.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmResult {
    pub confluence: MtfConfluence,
    pub phase: MtfPhase,
}

/// Single-instrument FSM. Cheap to clone the current state out via
/// `snapshot`; all mutation goes through the explicit transition methods so
/// every phase change can be logged and counted in `MtfStats`.
pub struct MtfStateMachine {
    state: RwLock<MtfState>,
    params: MtfParams,
}

impl MtfStateMachine {
    pub fn new(params: MtfParams) -> Self {
        Self {
            state: RwLock::new(MtfState::default()),
            params,
        }
    }

    pub fn snapshot(&self) -> MtfState {
        self.state.read().clone()
    }

    pub fn phase(&self) -> MtfPhase {
        self.state.read().phase
    }

    /// IDLE + a freshly detected candidate -> CANDIDATE. No-op (the new
    /// candidate is dropped) if a candidate is already in flight — only one
    /// candidate runs at a time per instrument.
    pub fn on_new_candidate(&self, candidate: Candidate, now: i64) -> MtfPhase {
        let mut state = self.state.write();
        if state.phase != MtfPhase::Idle {
            debug!(phase = %state.phase, "candidate ignored, one already in flight");
            return state.phase;
        }
        state.phase = MtfPhase::Candidate;
        state.candidate = Some(candidate);
        state.entered_at = now;
        state.stats.candidates_detected += 1;
        debug!(side = %candidate.side, "candidate -> CANDIDATE");
        state.phase
    }

    /// Stage 2 confirmed the open candidate: CANDIDATE -> CONFIRMING, then
    /// immediately score confluence and resolve to EXECUTABLE or REJECTED.
    /// `CONFIRMING` is transient within this call rather than a phase the
    /// caller has to separately drive, since both confluence inputs and the
    /// veto set are already in hand by the time Stage 2 confirms.
    pub fn on_confirmed(
        &self,
        now: i64,
        inputs: &ConfluenceInputs,
        veto: &VetoSet,
    ) -> ConfirmResult {
        let mut state = self.state.write();
        state.phase = MtfPhase::Confirming;
        state.entered_at = now;
        state.stats.micro_confirms += 1;

        let confluence = ConfluenceScorer::score(inputs, veto, &self.params);

        let vetoed = !veto.is_empty();
        let confluence_ok = confluence.context.total >= self.params.context_min
            && confluence.micro.total >= self.params.micro_min
            && confluence.final_.tier != Tier::Skip;
        let phase = if vetoed {
            state.stats.vetoes += 1;
            state.stats.micro_rejects += 1;
            MtfPhase::Rejected
        } else if !confluence_ok {
            state.stats.micro_rejects += 1;
            MtfPhase::Rejected
        } else {
            state.stats.executions += 1;
            MtfPhase::Executable
        };

        state.phase = phase;
        state.entered_at = now;
        debug!(tier = %confluence.final_.tier, final_score = confluence.final_.final_score, phase = %phase, "confirmation scored");

        ConfirmResult { confluence, phase }
    }

    /// Drive time-based expiry: a `CANDIDATE` past its `window_deadline_epoch`
    /// expires, and a terminal phase (`EXECUTABLE`/`REJECTED`/`EXPIRED`)
    /// resets to `IDLE` once the caller has had a chance to observe it (the
    /// caller is expected to call this once per tick after consuming the
    /// terminal state, e.g. after publishing the resulting `Signal`).
    pub fn on_tick(&self, now: i64) -> MtfPhase {
        let mut state = self.state.write();
        match state.phase {
            MtfPhase::Candidate => {
                if let Some(candidate) = state.candidate {
                    if now > candidate.window_deadline_epoch {
                        state.phase = MtfPhase::Expired;
                        state.entered_at = now;
                        state.stats.candidates_expired += 1;
                    }
                }
            }
            MtfPhase::Confirming => {
                if now - state.entered_at > self.params.confirm_timeout_secs {
                    state.phase = MtfPhase::Expired;
                    state.entered_at = now;
                    state.stats.candidates_expired += 1;
                }
            }
            MtfPhase::Executable | MtfPhase::Rejected | MtfPhase::Expired => {
                state.phase = MtfPhase::Idle;
                state.candidate = None;
                state.entered_at = now;
            }
            MtfPhase::Idle => {}
        }
        state.phase
    }

    pub fn reset(&self, now: i64) {
        let mut state = self.state.write();
        state.phase = MtfPhase::Idle;
        state.candidate = None;
        state.entered_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VetoReason;

    fn full_agreement_inputs(side: Side) -> ConfluenceInputs {
        let (fast, slow) = match side {
            Side::Long => (110.0, 100.0),
            Side::Short => (90.0, 100.0),
        };
        let rsi = match side {
            Side::Long => 60.0,
            Side::Short => 40.0,
        };
        let moves = match side {
            Side::Long => vec![1.0, 1.0, 1.0, 1.0, 1.0],
            Side::Short => vec![-1.0, -1.0, -1.0, -1.0, -1.0],
        };
        let cvd_slope = match side {
            Side::Long => 2.0,
            Side::Short => -2.0,
        };
        ConfluenceInputs {
            side,
            ema_fast_1h: Some(fast),
            ema_slow_1h: Some(slow),
            ema_fast_4h: Some(fast),
            ema_slow_4h: Some(slow),
            rsi_15m: Some(rsi),
            rsi_1h: Some(rsi),
            ema_fast_1d: Some(fast),
            ema_slow_1d: Some(slow),
            trigger_quality: 90.0,
            last_5_1m_moves: moves,
            cvd_slope,
        }
    }

    #[test]
    fn full_agreement_scores_near_max_and_tiers_a() {
        let inputs = full_agreement_inputs(Side::Long);
        let confluence = ConfluenceScorer::score(&inputs, &VetoSet::new(), &MtfParams::default());
        assert!(confluence.context.total > 95.0);
        assert!(confluence.micro.total > 90.0);
        assert_eq!(confluence.final_.tier, Tier::A);
    }

    #[test]
    fn warmup_missing_indicators_score_zero_not_penalized_twice() {
        let inputs = ConfluenceInputs {
            ema_fast_1h: None,
            ema_slow_1h: None,
            ema_fast_4h: None,
            ema_slow_4h: None,
            rsi_15m: None,
            rsi_1h: None,
            ema_fast_1d: None,
            ema_slow_1d: None,
            ..full_agreement_inputs(Side::Long)
        };
        let confluence = ConfluenceScorer::score(&inputs, &VetoSet::new(), &MtfParams::default());
        assert_eq!(confluence.context.scores.ema_alignment, 0.0);
        assert_eq!(confluence.context.scores.macro_gate, 0.0);
    }

    #[test]
    fn veto_present_drops_veto_hygiene() {
        let mut veto = VetoSet::new();
        veto.insert(VetoReason::Spread, 12.0);
        let inputs = full_agreement_inputs(Side::Long);
        let confluence = ConfluenceScorer::score(&inputs, &veto, &MtfParams::default());
        assert_eq!(confluence.micro.scores.veto_hygiene, 75.0);
    }

    #[test]
    fn tier_is_derived_from_final_score_alone() {
        // context.total = 100 (full agreement), micro.total = 50 (trigger
        // maxed, everything else zeroed out) -> final_score = 0.6*100 +
        // 0.4*50 = 80, which must tier A even though micro.total sits below
        // the default `micro_min` (60) gate used elsewhere for the
        // EXECUTABLE/REJECTED decision. The tier itself is a pure function
        // of `final_score`, not of the per-group minimums.
        let inputs = ConfluenceInputs {
            trigger_quality: 100.0,
            last_5_1m_moves: vec![-1.0; 5],
            cvd_slope: 0.0,
            ..full_agreement_inputs(Side::Long)
        };
        let confluence = ConfluenceScorer::score(&inputs, &VetoSet::new(), &MtfParams::default());
        assert_eq!(confluence.context.total, 100.0);
        assert_eq!(confluence.micro.total, 50.0);
        assert_eq!(confluence.final_.final_score, 80.0);
        assert_eq!(confluence.final_.tier, Tier::A);
    }

    #[test]
    fn confirmed_rejected_when_micro_below_minimum_despite_tier_a() {
        // Same inputs as above: tier is A, but `micro.total` (50) is below
        // `micro_min` (60), so the FSM must still reject per §4.7's
        // "context.total >= context_min AND micro.total >= micro_min"
        // EXECUTABLE gate rather than executing on tier alone.
        let fsm = MtfStateMachine::new(MtfParams::default());
        let candidate = Candidate {
            extremum_index: 10,
            side: Side::Long,
            extremum_price: 100.0,
            detection_epoch: 0,
            window_deadline_epoch: 1800,
        };
        fsm.on_new_candidate(candidate, 0);
        let inputs = ConfluenceInputs {
            trigger_quality: 100.0,
            last_5_1m_moves: vec![-1.0; 5],
            cvd_slope: 0.0,
            ..full_agreement_inputs(Side::Long)
        };
        let result = fsm.on_confirmed(300, &inputs, &VetoSet::new());
        assert_eq!(result.confluence.final_.tier, Tier::A);
        assert_eq!(result.phase, MtfPhase::Rejected);
    }

    #[test]
    fn disagreeing_ema_halves_alignment_score() {
        let inputs = ConfluenceInputs {
            ema_fast_4h: Some(90.0),
            ema_slow_4h: Some(100.0),
            ..full_agreement_inputs(Side::Long)
        };
        let confluence = ConfluenceScorer::score(&inputs, &VetoSet::new(), &MtfParams::default());
        assert_eq!(confluence.context.scores.ema_alignment, 50.0);
    }

    #[test]
    fn new_candidate_from_idle_enters_candidate_phase() {
        let fsm = MtfStateMachine::new(MtfParams::default());
        let candidate = Candidate {
            extremum_index: 10,
            side: Side::Long,
            extremum_price: 100.0,
            detection_epoch: 0,
            window_deadline_epoch: 1800,
        };
        let phase = fsm.on_new_candidate(candidate, 0);
        assert_eq!(phase, MtfPhase::Candidate);
    }

    #[test]
    fn second_candidate_ignored_while_one_in_flight() {
        let fsm = MtfStateMachine::new(MtfParams::default());
        let c1 = Candidate {
            extremum_index: 10,
            side: Side::Long,
            extremum_price: 100.0,
            detection_epoch: 0,
            window_deadline_epoch: 1800,
        };
        fsm.on_new_candidate(c1, 0);
        let c2 = Candidate {
            extremum_index: 20,
            side: Side::Short,
            extremum_price: 110.0,
            detection_epoch: 300,
            window_deadline_epoch: 2100,
        };
        fsm.on_new_candidate(c2, 300);
        assert_eq!(fsm.snapshot().candidate.unwrap().extremum_index, 10);
    }

    #[test]
    fn candidate_expires_past_deadline() {
        let fsm = MtfStateMachine::new(MtfParams::default());
        let candidate = Candidate {
            extremum_index: 10,
            side: Side::Long,
            extremum_price: 100.0,
            detection_epoch: 0,
            window_deadline_epoch: 1800,
        };
        fsm.on_new_candidate(candidate, 0);
        let phase = fsm.on_tick(1801);
        assert_eq!(phase, MtfPhase::Expired);
    }

    #[test]
    fn confirmed_with_clean_veto_and_strong_confluence_is_executable() {
        let fsm = MtfStateMachine::new(MtfParams::default());
        let candidate = Candidate {
            extremum_index: 10,
            side: Side::Long,
            extremum_price: 100.0,
            detection_epoch: 0,
            window_deadline_epoch: 1800,
        };
        fsm.on_new_candidate(candidate, 0);
        let inputs = full_agreement_inputs(Side::Long);
        let result = fsm.on_confirmed(300, &inputs, &VetoSet::new());
        assert_eq!(result.phase, MtfPhase::Executable);
        assert_eq!(fsm.phase(), MtfPhase::Executable);
    }

    #[test]
    fn confirmed_with_any_veto_is_rejected_regardless_of_score() {
        let fsm = MtfStateMachine::new(MtfParams::default());
        let candidate = Candidate {
            extremum_index: 10,
            side: Side::Long,
            extremum_price: 100.0,
            detection_epoch: 0,
            window_deadline_epoch: 1800,
        };
        fsm.on_new_candidate(candidate, 0);
        let inputs = full_agreement_inputs(Side::Long);
        let mut veto = VetoSet::new();
        veto.insert(VetoReason::Kill, 1.0);
        let result = fsm.on_confirmed(300, &inputs, &veto);
        assert_eq!(result.phase, MtfPhase::Rejected);
    }

    #[test]
    fn terminal_phase_resets_to_idle_on_next_tick() {
        let fsm = MtfStateMachine::new(MtfParams::default());
        let candidate = Candidate {
            extremum_index: 10,
            side: Side::Long,
            extremum_price: 100.0,
            detection_epoch: 0,
            window_deadline_epoch: 1800,
        };
        fsm.on_new_candidate(candidate, 0);
        let inputs = full_agreement_inputs(Side::Long);
        fsm.on_confirmed(300, &inputs, &VetoSet::new());
        let phase = fsm.on_tick(301);
        assert_eq!(phase, MtfPhase::Idle);
        assert!(fsm.snapshot().candidate.is_none());
    }
}
