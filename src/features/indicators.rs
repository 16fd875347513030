// =============================================================================
// Technical indicator math
// =============================================================================
//
// Pure functions over close-price slices and bar slices. Every function
// returns `None` (or an empty result) when the input is shorter than the
// required lookback -- absent, never zero.
// =============================================================================

use crate::market_data::PriceBar;

/// Simple moving average of the last `period` values.
///
/// # Edge cases
/// - `period == 0` => `None`
/// - fewer than `period` values => `None`
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let tail = &values[values.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// Population standard deviation of `values`.
///
/// Returns 0.0 for fewer than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Relative Strength Index over the whole `closes` slice using simple
/// average gain / average loss.
///
/// Saturation rules:
/// - both averages zero (flat input) => 50.0
/// - average loss zero (only gains)  => 100.0
/// - average gain zero (only losses) => 0.0
///
/// Returns `None` for fewer than two closes.
pub fn rsi(closes: &[f64]) -> Option<f64> {
    if closes.len() < 2 {
        return None;
    }

    let mut sum_gain = 0.0;
    let mut sum_loss = 0.0;
    for w in closes.windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            sum_gain += change;
        } else {
            sum_loss += -change;
        }
    }

    let n = (closes.len() - 1) as f64;
    let avg_gain = sum_gain / n;
    let avg_loss = sum_loss / n;

    let value = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    value.is_finite().then_some(value)
}

/// Bollinger bands: (upper, middle, lower) over the last `period` closes
/// with `k` standard deviations.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<(f64, f64, f64)> {
    let middle = sma(closes, period)?;
    let tail = &closes[closes.len() - period..];
    let sd = std_dev(tail);
    Some((middle + k * sd, middle, middle - k * sd))
}

/// Average True Range over `bars` (simple average of true ranges).
///
/// Needs at least two bars; the first bar only seeds the previous close.
pub fn atr(bars: &[PriceBar]) -> Option<f64> {
    if bars.len() < 2 {
        return None;
    }
    let mut sum = 0.0;
    for w in bars.windows(2) {
        let high_low = w[1].high - w[1].low;
        let high_close = (w[1].high - w[0].close).abs();
        let low_close = (w[1].low - w[0].close).abs();
        sum += high_low.max(high_close).max(low_close);
    }
    Some(sum / (bars.len() - 1) as f64)
}

/// Bar-over-bar simple returns of `closes`.
pub fn returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(minute: u32, high: f64, low: f64, close: f64) -> PriceBar {
        PriceBar {
            symbol: "TEST".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 2, 14, minute, 0).unwrap(),
            open: close,
            high,
            low,
            close,
            volume: 100.0,
        }
    }

    // ---- sma -------------------------------------------------------------

    #[test]
    fn sma_basic() {
        let closes = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&closes, 5), Some(3.0));
        assert_eq!(sma(&closes, 2), Some(4.5));
    }

    #[test]
    fn sma_insufficient_data_is_none() {
        assert_eq!(sma(&[1.0, 2.0], 5), None);
        assert_eq!(sma(&[], 1), None);
        assert_eq!(sma(&[1.0], 0), None);
    }

    // ---- rsi -------------------------------------------------------------

    #[test]
    fn rsi_all_gains_saturates_to_100() {
        let closes: Vec<f64> = (1..=15).map(|x| x as f64).collect();
        assert_eq!(rsi(&closes), Some(100.0));
    }

    #[test]
    fn rsi_all_losses_saturates_to_0() {
        let closes: Vec<f64> = (1..=15).rev().map(|x| x as f64).collect();
        let v = rsi(&closes).unwrap();
        assert!(v.abs() < 1e-10, "expected 0.0, got {v}");
    }

    #[test]
    fn rsi_flat_input_is_50() {
        let closes = vec![100.0; 15];
        assert_eq!(rsi(&closes), Some(50.0));
    }

    #[test]
    fn rsi_range_check() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89,
            46.03, 44.18, 44.22, 44.57,
        ];
        let v = rsi(&closes).unwrap();
        assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
    }

    #[test]
    fn rsi_too_short_is_none() {
        assert_eq!(rsi(&[100.0]), None);
        assert_eq!(rsi(&[]), None);
    }

    // ---- bollinger -------------------------------------------------------

    #[test]
    fn bollinger_bands_bracket_the_mean() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + (i % 4) as f64).collect();
        let (upper, middle, lower) = bollinger(&closes, 20, 2.0).unwrap();
        assert!(upper > middle);
        assert!(lower < middle);
        assert!((upper - middle - (middle - lower)).abs() < 1e-9);
    }

    #[test]
    fn bollinger_flat_input_collapses() {
        let closes = vec![50.0; 20];
        let (upper, middle, lower) = bollinger(&closes, 20, 2.0).unwrap();
        assert_eq!(upper, 50.0);
        assert_eq!(middle, 50.0);
        assert_eq!(lower, 50.0);
    }

    #[test]
    fn bollinger_insufficient_data_is_none() {
        assert_eq!(bollinger(&[1.0, 2.0], 20, 2.0), None);
    }

    // ---- atr -------------------------------------------------------------

    #[test]
    fn atr_uses_true_range() {
        // Gap up: true range is dominated by |high - prev_close|.
        let bars = vec![bar(0, 101.0, 99.0, 100.0), bar(1, 110.0, 108.0, 109.0)];
        let v = atr(&bars).unwrap();
        assert!((v - 10.0).abs() < 1e-9, "expected 10.0, got {v}");
    }

    #[test]
    fn atr_single_bar_is_none() {
        assert_eq!(atr(&[bar(0, 101.0, 99.0, 100.0)]), None);
    }

    // ---- returns ---------------------------------------------------------

    #[test]
    fn returns_basic() {
        let r = returns(&[100.0, 110.0, 99.0]);
        assert_eq!(r.len(), 2);
        assert!((r[0] - 0.10).abs() < 1e-12);
        assert!((r[1] + 0.10).abs() < 1e-12);
    }

    #[test]
    fn returns_skips_zero_base() {
        let r = returns(&[0.0, 10.0, 20.0]);
        assert_eq!(r.len(), 1);
        assert!((r[0] - 1.0).abs() < 1e-12);
    }
}
