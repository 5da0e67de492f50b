// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the swing-signal engine. Every tunable
// parameter lives here so the engine can be reconfigured at runtime without
// a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry a serde default so that adding new fields never
// breaks loading an older config file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_false() -> bool {
    false
}

fn default_symbol() -> String {
    "SOLUSD".to_string()
}

fn default_atr_min() -> f64 {
    0.006
}

fn default_volz_min() -> f64 {
    0.5
}

fn default_bbw_min() -> f64 {
    0.005
}

fn default_confirm_window() -> usize {
    6
}

fn default_breakout_atr_mult() -> f64 {
    0.5
}

fn default_vol_mult() -> f64 {
    1.5
}

fn default_tp1_r() -> f64 {
    1.0
}

fn default_tp2_r() -> f64 {
    2.0
}

fn default_tp3_r() -> f64 {
    3.5
}

fn default_initial_capital() -> f64 {
    10_000.0
}

fn default_risk_per_trade() -> f64 {
    0.02
}

fn default_tp1_scale() -> f64 {
    0.5
}

fn default_tp2_scale() -> f64 {
    0.3
}

fn default_bar_timeout() -> u32 {
    200
}

fn default_candle_history_cap() -> usize {
    5000
}

fn default_staleness_ms() -> i64 {
    5000
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_tick_drop_threshold() -> usize {
    10_000
}

fn default_depth_levels() -> usize {
    10
}

fn default_csv_max_rows() -> usize {
    200_000
}

fn default_context_min() -> f64 {
    60.0
}

fn default_micro_min() -> f64 {
    60.0
}

fn default_confirm_timeout_secs() -> i64 {
    300
}

fn default_tape_micro_cvd_threshold() -> f64 {
    1.0
}

fn default_depth_veto_threshold() -> f64 {
    0.5
}

fn default_imbalance_veto_threshold() -> f64 {
    0.0015
}

fn default_obv_veto_sigma() -> f64 {
    1.5
}

fn default_spread_veto_bps() -> f64 {
    10.0
}

fn default_rsi_extreme_hi() -> f64 {
    80.0
}

fn default_rsi_extreme_lo() -> f64 {
    20.0
}

fn default_liq_gap_atr_mult() -> f64 {
    4.0
}

fn default_taker_fee_bps() -> f64 {
    4.0
}

fn default_weight_ema_alignment() -> f64 {
    35.0
}

fn default_weight_oscillator_agreement() -> f64 {
    25.0
}

fn default_weight_macro_gate() -> f64 {
    40.0
}

fn default_weight_trigger_5m() -> f64 {
    30.0
}

fn default_weight_impulse_1m() -> f64 {
    25.0
}

fn default_weight_tape_micro() -> f64 {
    25.0
}

fn default_weight_veto_hygiene() -> f64 {
    20.0
}

fn default_tier_a_threshold() -> f64 {
    80.0
}

fn default_tier_b_threshold() -> f64 {
    60.0
}

// =============================================================================
// StrategyParams
// =============================================================================

/// Stage 1 / Stage 2 detector thresholds and TP-ladder multipliers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Stage 1 ATR14/price ratio gate.
    #[serde(default = "default_atr_min")]
    pub atr_min: f64,

    /// Stage 1 volume Z-score gate.
    #[serde(default = "default_volz_min")]
    pub volz_min: f64,

    /// Stage 1 Bollinger width gate.
    #[serde(default = "default_bbw_min")]
    pub bbw_min: f64,

    /// Stage 2 confirmation window, in bars.
    #[serde(default = "default_confirm_window")]
    pub confirm_window: usize,

    /// Stage 2 breakout distance, in ATR5 units.
    #[serde(default = "default_breakout_atr_mult")]
    pub breakout_atr_mult: f64,

    /// Stage 2 volume-spike multiplier against median20.
    #[serde(default = "default_vol_mult")]
    pub vol_mult: f64,

    /// TP1 distance, in risk units (R).
    #[serde(default = "default_tp1_r")]
    pub tp1_r: f64,

    /// TP2 distance, in risk units (R).
    #[serde(default = "default_tp2_r")]
    pub tp2_r: f64,

    /// TP3 distance, in risk units (R).
    #[serde(default = "default_tp3_r")]
    pub tp3_r: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            atr_min: default_atr_min(),
            volz_min: default_volz_min(),
            bbw_min: default_bbw_min(),
            confirm_window: default_confirm_window(),
            breakout_atr_mult: default_breakout_atr_mult(),
            vol_mult: default_vol_mult(),
            tp1_r: default_tp1_r(),
            tp2_r: default_tp2_r(),
            tp3_r: default_tp3_r(),
        }
    }
}

// =============================================================================
// BacktestParams
// =============================================================================

/// Config consumed by `BacktestSimulator`. `tp1_scale + tp2_scale + tp3_scale`
/// must not exceed 1.0 — validated at call time, not at deserialization, since
/// `tp3_scale` is derived as the uncommitted remainder unless set explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestParams {
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,
    #[serde(default = "default_tp1_scale")]
    pub tp1_scale: f64,
    #[serde(default = "default_tp2_scale")]
    pub tp2_scale: f64,
    #[serde(default = "default_false")]
    pub trail_after_tp: bool,
    #[serde(default = "default_bar_timeout")]
    pub bar_timeout: u32,
}

impl Default for BacktestParams {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            risk_per_trade: default_risk_per_trade(),
            tp1_scale: default_tp1_scale(),
            tp2_scale: default_tp2_scale(),
            trail_after_tp: true,
            bar_timeout: default_bar_timeout(),
        }
    }
}

impl BacktestParams {
    /// `tp3_scale` is whatever fraction of the position remains after TP1/TP2.
    pub fn tp3_scale(&self) -> f64 {
        (1.0 - self.tp1_scale - self.tp2_scale).max(0.0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tp1_scale + self.tp2_scale > 1.0 {
            return Err(format!(
                "tp1_scale ({}) + tp2_scale ({}) exceeds 1.0",
                self.tp1_scale, self.tp2_scale
            ));
        }
        if self.risk_per_trade <= 0.0 || self.risk_per_trade >= 1.0 {
            return Err(format!(
                "risk_per_trade ({}) must be in (0, 1)",
                self.risk_per_trade
            ));
        }
        if self.initial_capital <= 0.0 {
            return Err("initial_capital must be positive".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// VetoParams
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VetoParams {
    #[serde(default = "default_depth_veto_threshold")]
    pub depth_imbalance_threshold: f64,
    #[serde(default = "default_imbalance_veto_threshold")]
    pub mark_deviation_threshold: f64,
    #[serde(default = "default_obv_veto_sigma")]
    pub obv_divergence_sigma: f64,
    #[serde(default = "default_spread_veto_bps")]
    pub spread_bps_max: f64,
    #[serde(default = "default_rsi_extreme_hi")]
    pub rsi_extreme_hi: f64,
    #[serde(default = "default_rsi_extreme_lo")]
    pub rsi_extreme_lo: f64,
    #[serde(default = "default_liq_gap_atr_mult")]
    pub liq_gap_atr_mult: f64,
    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: f64,
}

impl Default for VetoParams {
    fn default() -> Self {
        Self {
            depth_imbalance_threshold: default_depth_veto_threshold(),
            mark_deviation_threshold: default_imbalance_veto_threshold(),
            obv_divergence_sigma: default_obv_veto_sigma(),
            spread_bps_max: default_spread_veto_bps(),
            rsi_extreme_hi: default_rsi_extreme_hi(),
            rsi_extreme_lo: default_rsi_extreme_lo(),
            liq_gap_atr_mult: default_liq_gap_atr_mult(),
            taker_fee_bps: default_taker_fee_bps(),
        }
    }
}

// =============================================================================
// MtfParams
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtfWeights {
    #[serde(default = "default_weight_ema_alignment")]
    pub ema_alignment: f64,
    #[serde(default = "default_weight_oscillator_agreement")]
    pub oscillator_agreement: f64,
    #[serde(default = "default_weight_macro_gate")]
    pub macro_gate: f64,
    #[serde(default = "default_weight_trigger_5m")]
    pub trigger_5m: f64,
    #[serde(default = "default_weight_impulse_1m")]
    pub impulse_1m: f64,
    #[serde(default = "default_weight_tape_micro")]
    pub tape_micro: f64,
    #[serde(default = "default_weight_veto_hygiene")]
    pub veto_hygiene: f64,
}

impl Default for MtfWeights {
    fn default() -> Self {
        Self {
            ema_alignment: default_weight_ema_alignment(),
            oscillator_agreement: default_weight_oscillator_agreement(),
            macro_gate: default_weight_macro_gate(),
            trigger_5m: default_weight_trigger_5m(),
            impulse_1m: default_weight_impulse_1m(),
            tape_micro: default_weight_tape_micro(),
            veto_hygiene: default_weight_veto_hygiene(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtfParams {
    #[serde(default)]
    pub weights: MtfWeights,
    #[serde(default = "default_context_min")]
    pub context_min: f64,
    #[serde(default = "default_micro_min")]
    pub micro_min: f64,
    #[serde(default = "default_tier_a_threshold")]
    pub tier_a_threshold: f64,
    #[serde(default = "default_tier_b_threshold")]
    pub tier_b_threshold: f64,
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: i64,
    /// `|cvd_slope|` at which `tape_micro` saturates to its full 100 points.
    #[serde(default = "default_tape_micro_cvd_threshold")]
    pub tape_micro_cvd_threshold: f64,
}

impl Default for MtfParams {
    fn default() -> Self {
        Self {
            weights: MtfWeights::default(),
            context_min: default_context_min(),
            micro_min: default_micro_min(),
            tier_a_threshold: default_tier_a_threshold(),
            tier_b_threshold: default_tier_b_threshold(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            tape_micro_cvd_threshold: default_tape_micro_cvd_threshold(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the signal engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// The single instrument this engine instance tracks.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Whether VetoEvaluator blocks signal emission (false = advisory only).
    #[serde(default = "default_false")]
    pub enable_micro_gate: bool,

    #[serde(default)]
    pub strategy_params: StrategyParams,

    #[serde(default)]
    pub backtest_params: BacktestParams,

    #[serde(default)]
    pub veto_params: VetoParams,

    #[serde(default)]
    pub mtf_params: MtfParams,

    /// Closed-bar ring capacity, per timeframe.
    #[serde(default = "default_candle_history_cap")]
    pub candle_history_cap: usize,

    /// MicroSnapshot goes stale after this many milliseconds without an update.
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: i64,

    /// Orderbook depth levels summed into bid_depth/ask_depth.
    #[serde(default = "default_depth_levels")]
    pub depth_levels: usize,

    /// Per-subscriber EventBus buffer capacity.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Aggregator input-buffer capacity before dropping the oldest tick.
    #[serde(default = "default_tick_drop_threshold")]
    pub tick_drop_threshold: usize,

    /// Maximum accepted CSV row count; beyond this is `E_Oversize`.
    #[serde(default = "default_csv_max_rows")]
    pub csv_max_rows: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            enable_micro_gate: false,
            strategy_params: StrategyParams::default(),
            backtest_params: BacktestParams::default(),
            veto_params: VetoParams::default(),
            mtf_params: MtfParams::default(),
            candle_history_cap: default_candle_history_cap(),
            staleness_ms: default_staleness_ms(),
            depth_levels: default_depth_levels(),
            subscriber_buffer: default_subscriber_buffer(),
            tick_drop_threshold: default_tick_drop_threshold(),
            csv_max_rows: default_csv_max_rows(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbol, "SOLUSD");
        assert!(!cfg.enable_micro_gate);
        assert!((cfg.strategy_params.atr_min - 0.006).abs() < f64::EPSILON);
        assert!((cfg.strategy_params.bbw_min - 0.005).abs() < f64::EPSILON);
        assert_eq!(cfg.strategy_params.confirm_window, 6);
        assert_eq!(cfg.candle_history_cap, 5000);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "SOLUSD");
        assert_eq!(cfg.staleness_ms, 5000);
        assert_eq!(cfg.subscriber_buffer, 64);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ETHUSD", "strategy_params": { "atr_min": 0.01 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSD");
        assert!((cfg.strategy_params.atr_min - 0.01).abs() < f64::EPSILON);
        assert_eq!(cfg.strategy_params.confirm_window, 6);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbol, cfg2.symbol);
        assert_eq!(cfg.candle_history_cap, cfg2.candle_history_cap);
    }

    #[test]
    fn backtest_params_scale_validation() {
        let mut bp = BacktestParams::default();
        assert!(bp.validate().is_ok());
        assert!((bp.tp3_scale() - 0.2).abs() < 1e-9);

        bp.tp1_scale = 0.7;
        bp.tp2_scale = 0.5;
        assert!(bp.validate().is_err());
    }

    #[test]
    fn backtest_params_rejects_bad_risk() {
        let mut bp = BacktestParams::default();
        bp.risk_per_trade = 1.5;
        assert!(bp.validate().is_err());
    }
}
