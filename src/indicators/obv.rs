// =============================================================================
// On-Balance Volume (OBV) and its Z-score
// =============================================================================
//
// OBV is a running cumulative signed volume, signed by close-over-close
// direction: `obv[i] = obv[i-1] + sign(close[i] - close[i-1]) * volume[i]`.
// `obv_z10` is OBV's divergence against its own trailing-10 mean, used by
// VetoEvaluator to detect an "OBV cliff" against the trade direction.

use crate::types::Bar;

/// Compute the OBV series, one value per bar after the first (which has no
/// predecessor to compare against and is seeded at 0).
///
/// Synthetic gap-fill bars contribute zero volume and therefore zero signed
/// delta, so volume statistics can ignore them without a separate filter pass.
pub fn calculate_obv(bars: &[Bar]) -> Vec<f64> {
    if bars.is_empty() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(bars.len());
    let mut obv = 0.0;
    result.push(obv);

    for i in 1..bars.len() {
        let delta = bars[i].close - bars[i - 1].close;
        let signed_volume = if delta > 0.0 {
            bars[i].volume
        } else if delta < 0.0 {
            -bars[i].volume
        } else {
            0.0
        };
        obv += signed_volume;
        result.push(obv);
    }

    result
}

/// Z-score of the latest OBV value against the trailing `period` OBV window.
///
/// Returns `None` when there are fewer than `period + 1` bars (OBV needs one
/// bar of history to produce its first value), or when the trailing window
/// has zero variance.
pub fn obv_zscore(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let obv_series = calculate_obv(bars);
    if obv_series.len() < period {
        return None;
    }

    let window = &obv_series[obv_series.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    let stdev = variance.sqrt();

    if stdev == 0.0 {
        return None;
    }

    let latest = *obv_series.last()?;
    let z = (latest - mean) / stdev;
    if z.is_finite() {
        Some(z)
    } else {
        None
    }
}

/// Convenience function: `obv_z10`, the default window.
pub fn calculate_z10(bars: &[Bar]) -> Option<f64> {
    obv_zscore(bars, 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64, volume: f64) -> Bar {
        Bar {
            epoch_start: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume,
            synthetic: false,
        }
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(calculate_obv(&[]).is_empty());
    }

    #[test]
    fn single_bar_seeds_zero() {
        let bars = vec![bar(100.0, 50.0)];
        assert_eq!(calculate_obv(&bars), vec![0.0]);
    }

    #[test]
    fn rising_closes_accumulate_positive() {
        let bars = vec![bar(100.0, 10.0), bar(101.0, 5.0), bar(102.0, 3.0)];
        let obv = calculate_obv(&bars);
        assert_eq!(obv, vec![0.0, 5.0, 8.0]);
    }

    #[test]
    fn falling_closes_accumulate_negative() {
        let bars = vec![bar(100.0, 10.0), bar(99.0, 5.0), bar(98.0, 3.0)];
        let obv = calculate_obv(&bars);
        assert_eq!(obv, vec![0.0, -5.0, -8.0]);
    }

    #[test]
    fn unchanged_close_contributes_zero() {
        let bars = vec![bar(100.0, 10.0), bar(100.0, 5.0)];
        let obv = calculate_obv(&bars);
        assert_eq!(obv, vec![0.0, 0.0]);
    }

    #[test]
    fn synthetic_bar_has_zero_volume_contribution() {
        let mut synth = bar(100.0, 0.0);
        synth.synthetic = true;
        let bars = vec![bar(99.0, 10.0), synth, bar(101.0, 5.0)];
        let obv = calculate_obv(&bars);
        // Synthetic bar's close == prev close => zero delta => zero contribution anyway.
        assert_eq!(obv[1], 0.0);
    }

    #[test]
    fn zscore_insufficient_history() {
        let bars = vec![bar(100.0, 10.0); 5];
        assert!(obv_zscore(&bars, 10).is_none());
    }

    #[test]
    fn zscore_flat_obv_is_none() {
        // Constant close => OBV stays at 0 for every bar => zero variance.
        let bars = vec![bar(100.0, 10.0); 15];
        assert!(obv_zscore(&bars, 10).is_none());
    }

    #[test]
    fn zscore_spike_is_well_defined() {
        let mut bars: Vec<Bar> = (0..12).map(|i| bar(100.0 + i as f64, 1.0)).collect();
        bars.push(bar(200.0, 50.0));
        let z = obv_zscore(&bars, 10).unwrap();
        assert!(z > 0.0);
        assert!(z.is_finite());
    }
}
