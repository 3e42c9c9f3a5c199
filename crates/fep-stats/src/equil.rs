use serde::{Deserialize, Serialize};

use crate::mean;

/// Equilibration-detection method applied to the ensemble-average gradient
/// series of a lambda window. Returns whether the series is stationary and,
/// if so, the time at which equilibration is declared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EquilDetection {
    /// Block-average the series and declare equilibration at the first
    /// block boundary where the slope of the block averages crosses zero,
    /// or falls below `gradient_threshold` in magnitude when one is set
    /// (kcal mol^-1 ns^-1).
    BlockGradient {
        block_size_ns: f64,
        gradient_threshold: Option<f64>,
    },
    /// Declare equilibration after a fixed fraction of the run. Escape
    /// hatch for short test runs.
    Fixed { fraction: f64 },
}

impl EquilDetection {
    /// `times` and `series` are parallel arrays; times in ns.
    pub fn detect(&self, times: &[f64], series: &[f64]) -> (bool, Option<f64>) {
        if times.is_empty() || times.len() != series.len() {
            return (false, None);
        }
        match *self {
            EquilDetection::Fixed { fraction } => {
                let fraction = fraction.clamp(0.0, 1.0);
                let total = times[times.len() - 1];
                (true, Some(total * fraction))
            }
            EquilDetection::BlockGradient {
                block_size_ns,
                gradient_threshold,
            } => block_gradient(times, series, block_size_ns, gradient_threshold),
        }
    }
}

fn block_gradient(
    times: &[f64],
    series: &[f64],
    block_size_ns: f64,
    threshold: Option<f64>,
) -> (bool, Option<f64>) {
    if block_size_ns <= 0.0 {
        return (false, None);
    }
    // Partition into consecutive blocks of block_size_ns.
    let start = times[0];
    let mut block_means: Vec<f64> = Vec::new();
    let mut block_ends: Vec<f64> = Vec::new();
    let mut current: Vec<f64> = Vec::new();
    let mut boundary = start + block_size_ns;
    for (&t, &v) in times.iter().zip(series.iter()) {
        if t > boundary && !current.is_empty() {
            block_means.push(mean(&current));
            block_ends.push(boundary);
            current.clear();
            boundary += block_size_ns;
        }
        current.push(v);
    }
    if !current.is_empty() {
        block_means.push(mean(&current));
        block_ends.push(times[times.len() - 1]);
    }
    if block_means.len() < 3 {
        return (false, None);
    }

    let mut prev_slope: Option<f64> = None;
    for i in 1..block_means.len() {
        let slope = (block_means[i] - block_means[i - 1]) / block_size_ns;
        let hit = match threshold {
            Some(th) => slope.abs() < th,
            None => prev_slope.map(|p| p * slope < 0.0).unwrap_or(false),
        };
        if hit {
            // Equilibrated from the start of the block where the slope
            // settled.
            return (true, Some(block_ends[i - 1]));
        }
        prev_slope = Some(slope);
    }
    (false, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times(n: usize, dt: f64) -> Vec<f64> {
        (1..=n).map(|i| i as f64 * dt).collect()
    }

    #[test]
    fn fixed_fraction_always_equilibrates() {
        let t = times(100, 0.01);
        let series = vec![1.0; 100];
        let det = EquilDetection::Fixed { fraction: 0.5 };
        let (ok, time) = det.detect(&t, &series);
        assert!(ok);
        assert!((time.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn decaying_then_flat_series_equilibrates_with_threshold() {
        // Sharp initial decay, flat afterwards.
        let t = times(400, 0.01); // 4 ns
        let series: Vec<f64> = t
            .iter()
            .map(|&time| if time < 1.0 { 10.0 - 8.0 * time } else { 2.0 })
            .collect();
        let det = EquilDetection::BlockGradient {
            block_size_ns: 1.0,
            gradient_threshold: Some(0.5),
        };
        let (ok, time) = det.detect(&t, &series);
        assert!(ok);
        let time = time.unwrap();
        assert!(time >= 1.0 && time <= 3.0, "equil time {}", time);
    }

    #[test]
    fn monotone_drift_never_equilibrates() {
        let t = times(400, 0.01);
        let series: Vec<f64> = t.iter().map(|&time| 5.0 * time).collect();
        let det = EquilDetection::BlockGradient {
            block_size_ns: 1.0,
            gradient_threshold: Some(0.5),
        };
        let (ok, time) = det.detect(&t, &series);
        assert!(!ok);
        assert!(time.is_none());
    }

    #[test]
    fn too_short_series_is_not_equilibrated() {
        let det = EquilDetection::BlockGradient {
            block_size_ns: 1.0,
            gradient_threshold: None,
        };
        let (ok, _) = det.detect(&[0.01, 0.02], &[1.0, 1.1]);
        assert!(!ok);
    }
}
