// =============================================================================
// Shared types — bars, timeframes, candidates, signals, microstructure, MTF
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Timeframe
// =============================================================================

/// A bar width. Each timeframe owns its own slot in the `CandleStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    S1,
    S5,
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Bucket width in seconds.
    pub fn secs(self) -> i64 {
        match self {
            Self::S1 => 1,
            Self::S5 => 5,
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::H1 => 3600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
        }
    }

    /// Bucket width in microseconds, used directly against tick epochs.
    pub fn micros(self) -> i64 {
        self.secs() * 1_000_000
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::S1 => "1s",
            Self::S5 => "5s",
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Side
// =============================================================================

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

// =============================================================================
// Bar
// =============================================================================

/// A single OHLCV bar. Immutable once the bucket it belongs to has closed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    /// Start of the bucket, integer Unix seconds, divisible by the timeframe width.
    pub epoch_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// True when this bar was inserted as a gap-fill rather than from real ticks
    /// (open=high=low=close=last_price, volume=0). Downstream volume-based
    /// indicators should skip these when computing rolling statistics.
    pub synthetic: bool,
}

impl Bar {
    /// `low ≤ min(open,close) ≤ max(open,close) ≤ high`, `volume ≥ 0`.
    pub fn is_valid(&self) -> bool {
        let lo = self.open.min(self.close);
        let hi = self.open.max(self.close);
        self.low <= lo && lo <= hi && hi <= self.high && self.volume >= 0.0
    }
}

// =============================================================================
// IndicatorSnapshot
// =============================================================================

/// Parallel indicator series aligned one-to-one with the 5m closed bar series.
/// Each field is `None` while the underlying indicator is in its warm-up
/// window — "unavailable" is distinct from a computed zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub atr14: Option<f64>,
    pub rsi14: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_lower: Option<f64>,
    pub bb_width: Option<f64>,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub vol_z50: Option<f64>,
    pub obv: Option<f64>,
    pub obv_z10: Option<f64>,
    pub is_local_high: Option<bool>,
    pub is_local_low: Option<bool>,
}

// =============================================================================
// Candidate / Signal
// =============================================================================

/// A potential swing extremum that passed Stage 1 screening.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candidate {
    pub extremum_index: usize,
    pub side: Side,
    pub extremum_price: f64,
    pub detection_epoch: i64,
    pub window_deadline_epoch: i64,
}

/// Coarse position-size classification carried on a `Signal`/`ScalpCard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeTag {
    Full,
    Half,
    Quarter,
}

impl std::fmt::Display for SizeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "FULL"),
            Self::Half => write!(f, "HALF"),
            Self::Quarter => write!(f, "QUARTER"),
        }
    }
}

/// The trailing-stop rule attached to a confirmed signal's post-TP1 management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrailRule {
    /// Stop tracks `close ∓ atr5`, post-TP1.
    Atr5PostTp1,
}

impl std::fmt::Display for TrailRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Atr5PostTp1 => write!(f, "trail: close∓ATR5 after TP1"),
        }
    }
}

/// A confirmed candidate with entry/SL/TP parameters. Immutable once emitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Signal {
    pub candidate: Candidate,
    pub confirm_index: usize,
    pub entry: f64,
    pub stop_loss: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub tp3: f64,
    pub size_tag: SizeTag,
    pub attempts: u32,
    pub side: Side,
    pub trail_rule: TrailRule,
}

// =============================================================================
// MicroSnapshot
// =============================================================================

/// Atomic microstructure record. Replaced wholesale on every update; readers
/// always see a complete, consistent record or `available == false`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MicroSnapshot {
    pub epoch_micros: i64,
    pub mid: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread_bps: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
    /// (bid_depth − ask_depth) / (bid_depth + ask_depth), in [−1, 1].
    pub ladder_imbalance: f64,
    pub cvd: f64,
    pub cvd_slope: f64,
    pub last_trade_price: f64,
    pub available: bool,
}

impl MicroSnapshot {
    /// A snapshot carrying no data; `available` is false and all readers must
    /// treat the payload as meaningless.
    pub fn unavailable() -> Self {
        Self {
            epoch_micros: 0,
            mid: 0.0,
            bid: 0.0,
            ask: 0.0,
            spread_bps: 0.0,
            bid_depth: 0.0,
            ask_depth: 0.0,
            ladder_imbalance: 0.0,
            cvd: 0.0,
            cvd_slope: 0.0,
            last_trade_price: 0.0,
            available: false,
        }
    }
}

impl Default for MicroSnapshot {
    fn default() -> Self {
        Self::unavailable()
    }
}

// =============================================================================
// VetoSet
// =============================================================================

/// A fixed tagged variant for every veto reason. Stable, transport-facing names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoReason {
    Depth,
    Imbalance,
    Obv,
    Kill,
    Spread,
    RsiExtreme,
    LiqGap,
}

impl std::fmt::Display for VetoReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Depth => "depth",
            Self::Imbalance => "imbalance",
            Self::Obv => "obv",
            Self::Kill => "kill",
            Self::Spread => "spread",
            Self::RsiExtreme => "rsi_extreme",
            Self::LiqGap => "liq_gap",
        };
        write!(f, "{s}")
    }
}

/// Mapping from a fired veto reason to the scalar that explains it. An empty
/// set means the side passes all microstructure gates.
pub type VetoSet = HashMap<VetoReason, f64>;

// =============================================================================
// MTF confluence / state
// =============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ContextScores {
    pub ema_alignment: f64,
    pub oscillator_agreement: f64,
    pub macro_gate: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MicroScores {
    pub trigger_5m: f64,
    pub impulse_1m: f64,
    pub tape_micro: f64,
    pub veto_hygiene: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    A,
    B,
    Skip,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::Skip => write!(f, "SKIP"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ContextGroup {
    pub total: f64,
    pub scores: ContextScores,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MicroGroup {
    pub total: f64,
    pub scores: MicroScores,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FinalScore {
    pub final_score: f64,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MtfConfluence {
    pub context: ContextGroup,
    pub micro: MicroGroup,
    pub final_: FinalScore,
}

/// The FSM's current phase for a single instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MtfPhase {
    Idle,
    Candidate,
    Confirming,
    Executable,
    Rejected,
    Expired,
}

impl std::fmt::Display for MtfPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Candidate => "CANDIDATE",
            Self::Confirming => "CONFIRMING",
            Self::Executable => "EXECUTABLE",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MtfStats {
    pub candidates_detected: u64,
    pub candidates_expired: u64,
    pub micro_confirms: u64,
    pub micro_rejects: u64,
    pub executions: u64,
    pub vetoes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtfState {
    pub phase: MtfPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,
    pub entered_at: i64,
    pub stats: MtfStats,
}

impl Default for MtfState {
    fn default() -> Self {
        Self {
            phase: MtfPhase::Idle,
            candidate: None,
            entered_at: 0,
            stats: MtfStats::default(),
        }
    }
}

// =============================================================================
// ScalpCard
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScalpCardIndices {
    pub extremum_idx: usize,
    pub confirm_idx: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalpCardChecks {
    pub spread_ok: bool,
    pub micro_veto: VetoSet,
}

/// An immutable execution sheet projected from a confirmed `Signal`. Later
/// microstructure changes never mutate an already-issued card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalpCard {
    pub symbol: String,
    pub play: Side,
    pub regime: String,
    pub size_tag: SizeTag,
    pub entry: f64,
    pub sl: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub tp3: f64,
    pub trail_rule: String,
    pub order_path: String,
    pub confirm: String,
    pub indices: ScalpCardIndices,
    pub checks: ScalpCardChecks,
    pub attempts: u32,
}

// =============================================================================
// Trade (backtest)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Tp1,
    Tp2,
    Tp3,
    Sl,
    Trail,
    Timeout,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tp1 => "tp1",
            Self::Tp2 => "tp2",
            Self::Tp3 => "tp3",
            Self::Sl => "sl",
            Self::Trail => "trail",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Trade {
    pub entry_epoch: i64,
    pub exit_epoch: i64,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub exit_reason: ExitReason,
    pub pnl_abs: f64,
    pub pnl_r: f64,
    pub bars_held: u32,
    pub balance_after: f64,
}
