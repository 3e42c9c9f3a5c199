use crate::{mean, variance};

/// Estimate the statistical inefficiency of a time series: the number of
/// raw samples per effectively independent sample. Accumulates the
/// normalized fluctuation autocorrelation with a triangular window and
/// stops at the first non-positive term. Constant or very short series
/// give 1 (every sample independent).
pub fn statistical_inefficiency(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 3 {
        return 1.0;
    }
    let m = mean(series);
    let var = variance(series);
    if var <= 0.0 || !var.is_finite() {
        return 1.0;
    }

    let mut g = 1.0;
    for t in 1..n - 1 {
        let mut c = 0.0;
        for i in 0..n - t {
            c += (series[i] - m) * (series[i + t] - m);
        }
        c /= (n - t) as f64 * var;
        if c <= 0.0 {
            break;
        }
        g += 2.0 * c * (1.0 - t as f64 / n as f64);
    }
    g.max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncorrelated_series_is_near_one() {
        // Deterministic pseudo-random walkless series.
        let mut state: u64 = 0x2545F4914F6CDD1D;
        let series: Vec<f64> = (0..2000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state % 10_000) as f64 / 10_000.0 - 0.5
            })
            .collect();
        let g = statistical_inefficiency(&series);
        assert!(g < 2.0, "expected near-independent samples, got g = {}", g);
    }

    #[test]
    fn strongly_correlated_series_is_large() {
        // Slow sinusoid: consecutive samples are almost identical.
        let series: Vec<f64> = (0..1000)
            .map(|i| (i as f64 * 0.01).sin())
            .collect();
        let g = statistical_inefficiency(&series);
        assert!(g > 10.0, "expected heavy correlation, got g = {}", g);
    }

    #[test]
    fn constant_and_short_series_are_one() {
        assert_eq!(statistical_inefficiency(&[1.0, 1.0, 1.0, 1.0]), 1.0);
        assert_eq!(statistical_inefficiency(&[1.0, 2.0]), 1.0);
        assert_eq!(statistical_inefficiency(&[]), 1.0);
    }
}
