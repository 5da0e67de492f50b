// =============================================================================
// Local Extrema Labeling (±W)
// =============================================================================
//
// Bar `i` is a local high if `high[i] == max(high[i-W..=i+W])`, strict on one
// side to break ties deterministically toward the earlier bar. Symmetric for
// local low. Requires `W` future bars, so labels for the most recent `W` bars
// are always `None` — the detector must not emit candidates there.

use crate::types::Bar;

/// Whether `bars[i]` is a local high over the window `[i-w, i+w]`.
///
/// Ties are broken strict-on-the-right: `bars[i]` must be `>=` every bar in
/// the window and strictly `>` every bar strictly after it, so that two equal
/// highs within the window resolve to the earlier index.
fn is_local_high_at(bars: &[Bar], i: usize, w: usize) -> bool {
    let lo = i.saturating_sub(w);
    let hi = (i + w).min(bars.len() - 1);
    let pivot = bars[i].high;

    for k in lo..=hi {
        if k == i {
            continue;
        }
        if k < i {
            if bars[k].high > pivot {
                return false;
            }
        } else if bars[k].high >= pivot {
            return false;
        }
    }
    true
}

fn is_local_low_at(bars: &[Bar], i: usize, w: usize) -> bool {
    let lo = i.saturating_sub(w);
    let hi = (i + w).min(bars.len() - 1);
    let pivot = bars[i].low;

    for k in lo..=hi {
        if k == i {
            continue;
        }
        if k < i {
            if bars[k].low < pivot {
                return false;
            }
        } else if bars[k].low <= pivot {
            return false;
        }
    }
    true
}

/// Local-high label for bar `i`. `None` when fewer than `w` bars exist on
/// either side (including when `i` itself is out of range).
pub fn is_local_high(bars: &[Bar], i: usize, w: usize) -> Option<bool> {
    if i >= bars.len() || i < w || i + w >= bars.len() {
        return None;
    }
    Some(is_local_high_at(bars, i, w))
}

/// Local-low label for bar `i`. `None` when fewer than `w` bars exist on
/// either side.
pub fn is_local_low(bars: &[Bar], i: usize, w: usize) -> Option<bool> {
    if i >= bars.len() || i < w || i + w >= bars.len() {
        return None;
    }
    Some(is_local_low_at(bars, i, w))
}

/// Default window used by the detector's Stage 1 gate.
pub const DEFAULT_WINDOW: usize = 12;

/// The last index at which extrema labels can be assigned, given the
/// currently-closed bar count. `None` when there aren't enough bars yet.
pub fn last_labelable_index(closed_len: usize, w: usize) -> Option<usize> {
    if closed_len < 2 * w + 1 {
        return None;
    }
    Some(closed_len - 1 - w)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars_from_highs(highs: &[f64]) -> Vec<Bar> {
        highs
            .iter()
            .map(|&h| Bar {
                epoch_start: 0,
                open: h,
                high: h,
                low: h - 10.0,
                close: h,
                volume: 1.0,
                synthetic: false,
            })
            .collect()
    }

    #[test]
    fn none_near_edges() {
        let bars = bars_from_highs(&[1.0; 10]);
        assert_eq!(is_local_high(&bars, 0, 3), None);
        assert_eq!(is_local_high(&bars, 9, 3), None);
    }

    #[test]
    fn detects_clear_peak() {
        let mut highs = vec![1.0; 25];
        highs[12] = 100.0;
        let bars = bars_from_highs(&highs);
        assert_eq!(is_local_high(&bars, 12, 12), Some(true));
        assert_eq!(is_local_high(&bars, 11, 12), Some(false));
    }

    #[test]
    fn tie_breaks_toward_earlier_index() {
        let mut highs = vec![1.0; 25];
        highs[10] = 100.0;
        highs[14] = 100.0; // equal peak later in the window
        let bars = bars_from_highs(&highs);
        assert_eq!(is_local_high(&bars, 10, 12), Some(true));
        assert_eq!(is_local_high(&bars, 14, 12), Some(false));
    }

    #[test]
    fn detects_local_low() {
        let lows: Vec<f64> = (0..25).map(|i| (i as f64 - 12.0).abs()).collect();
        let bars: Vec<Bar> = lows
            .iter()
            .map(|&l| Bar {
                epoch_start: 0,
                open: l,
                high: l + 10.0,
                low: l,
                close: l,
                volume: 1.0,
                synthetic: false,
            })
            .collect();
        assert_eq!(is_local_low(&bars, 12, 12), Some(true));
    }

    #[test]
    fn last_labelable_index_respects_window() {
        assert_eq!(last_labelable_index(10, 12), None);
        assert_eq!(last_labelable_index(25, 12), Some(12));
        assert_eq!(last_labelable_index(30, 12), Some(17));
    }
}
