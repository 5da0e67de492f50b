// =============================================================================
// Volume Z-Score
// =============================================================================
//
// `vol_z50 = (vol - mean50) / stdev50` — how many standard deviations the
// latest bar's volume sits from its trailing-50 mean. Used as a Stage 1
// volatility-of-participation gate alongside ATR and BB width.

/// Z-score of the most recent volume against the trailing `period` window
/// (the window includes the most recent value itself, per the `vol_z50`
/// definition above).
///
/// Returns `None` when there are fewer than `period` volumes, or when the
/// trailing window has zero variance (a flat-volume market has an undefined
/// Z-score rather than a divide-by-zero artifact).
pub fn volume_zscore(volumes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || volumes.len() < period {
        return None;
    }

    let window = &volumes[volumes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    let stdev = variance.sqrt();

    if stdev == 0.0 {
        return None;
    }

    let latest = *volumes.last()?;
    let z = (latest - mean) / stdev;
    if z.is_finite() {
        Some(z)
    } else {
        None
    }
}

/// Convenience function: `vol_z50`, the Stage 1 gate's default window.
pub fn calculate(volumes: &[f64]) -> Option<f64> {
    volume_zscore(volumes, 50)
}

/// Median of the most recent `n` volumes — used by Stage 2's volume-spike
/// confirmation (`volume[j] ≥ vol_mult · median_volume(last 20)`).
pub fn median_volume(volumes: &[f64], n: usize) -> Option<f64> {
    if n == 0 || volumes.len() < n {
        return None;
    }
    let mut window: Vec<f64> = volumes[volumes.len() - n..].to_vec();
    window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = window.len() / 2;
    let median = if window.len() % 2 == 0 {
        (window[mid - 1] + window[mid]) / 2.0
    } else {
        window[mid]
    };
    Some(median)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_returns_none() {
        assert!(volume_zscore(&[1.0, 2.0, 3.0], 50).is_none());
    }

    #[test]
    fn flat_volume_returns_none() {
        let volumes = vec![100.0; 50];
        assert!(volume_zscore(&volumes, 50).is_none());
    }

    #[test]
    fn spike_above_mean_is_positive() {
        let mut volumes = vec![100.0; 49];
        volumes.push(500.0);
        let z = volume_zscore(&volumes, 50).unwrap();
        assert!(z > 0.0);
    }

    #[test]
    fn drop_below_mean_is_negative() {
        let mut volumes = vec![100.0; 49];
        volumes.push(10.0);
        let z = volume_zscore(&volumes, 50).unwrap();
        assert!(z < 0.0);
    }

    #[test]
    fn median_volume_odd_and_even() {
        assert_eq!(median_volume(&[1.0, 5.0, 3.0], 3), Some(3.0));
        assert_eq!(median_volume(&[1.0, 2.0, 3.0, 4.0], 4), Some(2.5));
    }

    #[test]
    fn median_volume_insufficient_data() {
        assert!(median_volume(&[1.0, 2.0], 20).is_none());
    }
}
