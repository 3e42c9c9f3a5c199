//! Gradient processing across an ordered set of lambda windows: SEM
//! decomposition, integrated error curves, optimal lambda placement and a
//! predicted overlap matrix. `GradientData` is a read-only snapshot; it
//! never mutates its inputs.

use serde::{Deserialize, Serialize};
use tracing::debug;

use fep_core::{Error, Result};

use crate::inefficiency::statistical_inefficiency;
use crate::{mean, variance};

const GAS_CONSTANT: f64 = 8.314_462_618; // J mol^-1 K^-1

/// Raw per-window input: one gradient series per repeat run, plus the
/// sampling interval the series covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowGradients {
    pub lam: f64,
    pub repeat_series: Vec<Vec<f64>>,
    /// Start of the sampled region in ns (equilibration time when only
    /// equilibrated data is used, otherwise 0).
    pub start_time_ns: f64,
    /// Per-repeat total simulated time in ns (identical across repeats by
    /// construction).
    pub end_time_ns: f64,
    pub timestep_ns: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    Inter,
    Intra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Sem,
    RootVar,
}

/// Derived statistics for a fixed list of lambda windows. All arrays are
/// indexed consistently by window order (increasing lambda).
#[derive(Debug, Clone)]
pub struct GradientData {
    pub n_lam: usize,
    pub lam_vals: Vec<f64>,
    pub gradients: Vec<Vec<Vec<f64>>>,
    pub subsampled_gradients: Vec<Vec<Vec<f64>>>,
    pub means: Vec<f64>,
    pub sems_tot: Vec<f64>,
    pub sems_intra: Vec<f64>,
    pub sems_inter: Vec<f64>,
    pub vars_intra: Vec<f64>,
    /// Statistical inefficiencies in units of simulated time (ns).
    pub stat_ineffs: Vec<f64>,
    pub start_times: Vec<f64>,
    pub end_times: Vec<f64>,
    pub sampling_times: Vec<f64>,
}

impl GradientData {
    /// Construction is the algorithm: per repeat, decorrelate and compute
    /// variance; per window, combine intra- and inter-run components.
    pub fn new(windows: &[WindowGradients]) -> Result<Self> {
        if windows.is_empty() {
            return Err(Error::Configuration(
                "gradient data requires at least one lambda window".to_string(),
            ));
        }

        let n_lam = windows.len();
        let mut lam_vals = Vec::with_capacity(n_lam);
        let mut gradients = Vec::with_capacity(n_lam);
        let mut subsampled = Vec::with_capacity(n_lam);
        let mut means = Vec::with_capacity(n_lam);
        let mut sems_tot = Vec::with_capacity(n_lam);
        let mut sems_intra = Vec::with_capacity(n_lam);
        let mut sems_inter = Vec::with_capacity(n_lam);
        let mut vars_intra = Vec::with_capacity(n_lam);
        let mut stat_ineffs = Vec::with_capacity(n_lam);
        let mut start_times = Vec::with_capacity(n_lam);
        let mut end_times = Vec::with_capacity(n_lam);

        for win in windows {
            if win.repeat_series.is_empty() {
                return Err(Error::Configuration(format!(
                    "lambda window {} has no repeat runs",
                    win.lam
                )));
            }
            let ensemble_size = win.repeat_series.len();
            let mut repeat_means = Vec::with_capacity(ensemble_size);
            let mut repeat_vars = Vec::with_capacity(ensemble_size);
            let mut repeat_sq_sems = Vec::with_capacity(ensemble_size);
            let mut repeat_ineffs = Vec::with_capacity(ensemble_size);
            let mut repeat_subsampled = Vec::with_capacity(ensemble_size);

            for series in &win.repeat_series {
                if series.is_empty() {
                    return Err(Error::Configuration(format!(
                        "empty gradient series at lambda {}",
                        win.lam
                    )));
                }
                let g = statistical_inefficiency(series);
                // Take every g-th point to decorrelate.
                let stride = (g as usize).max(1);
                let sub: Vec<f64> = series.iter().copied().step_by(stride).collect();
                let var = variance(&sub);
                repeat_means.push(mean(series));
                repeat_vars.push(var);
                repeat_sq_sems.push(var / sub.len() as f64);
                repeat_ineffs.push(g);
                repeat_subsampled.push(sub);
            }

            let var_intra = mean(&repeat_vars);
            let sq_sem_intra = mean(&repeat_sq_sems) / ensemble_size as f64;
            let sq_sem_inter = variance(&repeat_means) / ensemble_size as f64;

            lam_vals.push(win.lam);
            means.push(mean(&repeat_means));
            vars_intra.push(var_intra);
            sems_intra.push(sq_sem_intra.sqrt());
            sems_inter.push(sq_sem_inter.sqrt());
            // Not independently meaningful; kept as a diagnostic.
            sems_tot.push((sq_sem_intra + sq_sem_inter).sqrt());
            stat_ineffs.push(mean(&repeat_ineffs) * win.timestep_ns);
            start_times.push(win.start_time_ns);
            end_times.push(win.end_time_ns);
            gradients.push(win.repeat_series.clone());
            subsampled.push(repeat_subsampled);
        }

        let sampling_times: Vec<f64> = start_times
            .iter()
            .zip(end_times.iter())
            .map(|(s, e)| e - s)
            .collect();
        debug!(n_lam, "computed gradient statistics");

        Ok(GradientData {
            n_lam,
            lam_vals,
            gradients,
            subsampled_gradients: subsampled,
            means,
            sems_tot,
            sems_intra,
            sems_inter,
            vars_intra,
            stat_ineffs,
            start_times,
            end_times,
            sampling_times,
        })
    }

    /// SEM series scaled by sqrt(total sampling time), which makes windows
    /// with different accumulated simulated time comparable. Optionally
    /// smoothed by a 3-point unweighted block average (edge windows average
    /// with their single neighbour).
    pub fn sems(&self, origin: ErrorOrigin, smoothen: bool) -> Vec<f64> {
        let raw = match origin {
            ErrorOrigin::Inter => &self.sems_inter,
            ErrorOrigin::Intra => &self.sems_intra,
        };
        let scaled: Vec<f64> = raw
            .iter()
            .zip(self.sampling_times.iter())
            .map(|(sem, t)| sem * t.max(0.0).sqrt())
            .collect();
        if !smoothen {
            return scaled;
        }
        smooth3(&scaled)
    }

    /// Cumulative trapezoidal integral of the chosen error series over
    /// lambda; the integral up to the first window alone is exactly zero.
    pub fn integrated_error(
        &self,
        er_type: ErrorType,
        origin: ErrorOrigin,
        smoothen: bool,
    ) -> Vec<f64> {
        let y = match er_type {
            ErrorType::Sem => self.sems(origin, smoothen),
            ErrorType::RootVar => self.vars_intra.iter().map(|v| v.sqrt()).collect(),
        };
        let mut out = Vec::with_capacity(self.n_lam);
        let mut acc = 0.0;
        out.push(0.0);
        for i in 1..self.n_lam {
            acc += 0.5 * (y[i] + y[i - 1]) * (self.lam_vals[i] - self.lam_vals[i - 1]);
            out.push(acc);
        }
        out
    }

    /// Optimal lambda placement from the integrated error curve. Exactly
    /// one of `delta_er` (target error per interval) or `n_lam_vals`
    /// (target window count) must be supplied.
    pub fn optimal_lam_vals(
        &self,
        er_type: ErrorType,
        origin: ErrorOrigin,
        smoothen: bool,
        delta_er: Option<f64>,
        n_lam_vals: Option<usize>,
    ) -> Result<Vec<f64>> {
        let integrated = self.integrated_error(er_type, origin, smoothen);
        let total = *integrated.last().unwrap_or(&0.0);

        let n = match (delta_er, n_lam_vals) {
            (Some(_), Some(_)) => {
                return Err(Error::Configuration(
                    "only one of delta_er or n_lam_vals can be provided".to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::Configuration(
                    "either delta_er or n_lam_vals must be provided".to_string(),
                ))
            }
            (Some(delta), None) => {
                if delta <= 0.0 {
                    return Err(Error::Configuration(
                        "delta_er must be positive".to_string(),
                    ));
                }
                (total / delta) as usize + 1
            }
            (None, Some(n)) => n,
        };
        if n < 2 {
            return Err(Error::Configuration(
                "at least two lambda values are required".to_string(),
            ));
        }

        let mut optimal = Vec::with_capacity(n);
        for k in 0..n {
            let target = total * k as f64 / (n - 1) as f64;
            let lam = interp(target, &integrated, &self.lam_vals);
            optimal.push((lam * 1000.0).round() / 1000.0);
        }
        Ok(optimal)
    }

    /// Symmetric matrix predicting pairwise sampling overlap between
    /// windows from intra-run variance alone, via an inverse-Gaussian-
    /// overlap approximation accumulated multiplicatively over the
    /// intervals between windows, then mirrored and row-normalized.
    pub fn predicted_overlap_mat(&self, temperature: f64) -> Vec<Vec<f64>> {
        let beta = (4.184 * 1000.0) / (GAS_CONSTANT * temperature); // kcal mol^-1
        let n = self.n_lam;
        let mut mat = vec![vec![0.0; n]; n];

        // Upper triangle, walking outward from each diagonal element.
        for base in 0..n {
            let mut overlap = 1.0;
            for i in 0..n - base {
                if i != 0 {
                    let delta_lam = self.lam_vals[base + i] - self.lam_vals[base + i - 1];
                    let av_var =
                        (self.vars_intra[base + i] + self.vars_intra[base + i - 1]) / 2.0;
                    overlap /= beta * delta_lam * av_var.sqrt();
                }
                mat[base][base + i] = overlap;
            }
        }

        // Mirror into the lower triangle without duplicating the diagonal.
        for i in 0..n {
            for j in 0..i {
                mat[i][j] = mat[j][i];
            }
        }

        // Row-normalize.
        for row in mat.iter_mut() {
            let sum: f64 = row.iter().sum();
            if sum > 0.0 {
                for v in row.iter_mut() {
                    *v /= sum;
                }
            }
        }
        mat
    }
}

/// Trapezoidal weight of each lambda value's contribution to the total
/// free-energy integral: half the straddling interval for interior
/// windows, half the single adjacent interval at the edges. The weights
/// sum to `lam_vals[last] - lam_vals[0]`.
pub fn lam_val_weights(lam_vals: &[f64]) -> Vec<f64> {
    let n = lam_vals.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let mut weights = Vec::with_capacity(n);
    for i in 0..n {
        let w = if i == 0 {
            0.5 * (lam_vals[1] - lam_vals[0])
        } else if i == n - 1 {
            0.5 * (lam_vals[n - 1] - lam_vals[n - 2])
        } else {
            0.5 * (lam_vals[i + 1] - lam_vals[i - 1])
        };
        weights.push(w);
    }
    weights
}

fn smooth3(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return values.to_vec();
    }
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let v = if i == 0 {
            (values[0] + values[1]) / 2.0
        } else if i == n - 1 {
            (values[n - 1] + values[n - 2]) / 2.0
        } else {
            (values[i - 1] + values[i] + values[i + 1]) / 3.0
        };
        out.push(v);
    }
    out
}

/// Linear interpolation of y(x) at `target`, clamping outside the range
/// (matching `np.interp` for monotonically non-decreasing xs).
fn interp(target: f64, xs: &[f64], ys: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    if target <= xs[0] {
        return ys[0];
    }
    if target >= xs[xs.len() - 1] {
        return ys[ys.len() - 1];
    }
    for i in 1..xs.len() {
        if target <= xs[i] {
            let span = xs[i] - xs[i - 1];
            if span <= 0.0 {
                return ys[i];
            }
            let frac = (target - xs[i - 1]) / span;
            return ys[i - 1] + frac * (ys[i] - ys[i - 1]);
        }
    }
    ys[ys.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_windows() -> Vec<WindowGradients> {
        // Three windows with one repeat of 100 deterministic samples each,
        // drawn around population means 1.8, 1.6 and 1.4 with the same
        // spread.
        let make = |lam: f64, mean: f64| {
            let series: Vec<f64> = (0..100)
                .map(|i| {
                    // +-0.05 alternating ripple around the mean, mean-free
                    // over the full series.
                    let offset = if i % 2 == 0 { 0.05 } else { -0.05 };
                    mean + offset
                })
                .collect();
            WindowGradients {
                lam,
                repeat_series: vec![series],
                start_time_ns: 0.0,
                end_time_ns: 1.0,
                timestep_ns: 4e-6,
            }
        };
        vec![make(0.0, 1.8), make(0.5, 1.6), make(1.0, 1.4)]
    }

    fn multi_repeat_windows() -> Vec<WindowGradients> {
        let make = |lam: f64, base: f64| {
            let repeats: Vec<Vec<f64>> = (0..3)
                .map(|r| {
                    (0..200)
                        .map(|i| {
                            let ripple = if (i + r) % 2 == 0 { 0.1 } else { -0.1 };
                            base + r as f64 * 0.01 + ripple
                        })
                        .collect()
                })
                .collect();
            WindowGradients {
                lam,
                repeat_series: repeats,
                start_time_ns: 0.0,
                end_time_ns: 2.0,
                timestep_ns: 4e-6,
            }
        };
        vec![make(0.0, 3.0), make(0.25, 2.5), make(0.75, 2.0), make(1.0, 1.5)]
    }

    #[test]
    fn means_and_variances_match_direct_computation() {
        let data = GradientData::new(&synthetic_windows()).expect("gradient data");
        let expected_means = [1.8, 1.6, 1.4];
        for (got, want) in data.means.iter().zip(expected_means.iter()) {
            assert!((got - want).abs() < 0.1, "mean {} vs {}", got, want);
        }
        // Alternating +-0.05 ripple has population variance 0.0025.
        for var in &data.vars_intra {
            assert!((var - 0.0025).abs() < 1e-3, "var {}", var);
        }
    }

    #[test]
    fn lam_val_weights_partition_the_lambda_range() {
        let lam_vals = [0.0, 0.1, 0.35, 0.6, 1.0];
        let weights = lam_val_weights(&lam_vals);
        let sum: f64 = weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);

        let uneven = [0.2, 0.25, 0.9];
        let sum: f64 = lam_val_weights(&uneven).iter().sum();
        assert!((sum - 0.7).abs() < 1e-12);
    }

    #[test]
    fn integrated_error_starts_at_zero() {
        let data = GradientData::new(&multi_repeat_windows()).expect("gradient data");
        for origin in [ErrorOrigin::Inter, ErrorOrigin::Intra] {
            for smoothen in [true, false] {
                let errs = data.integrated_error(ErrorType::Sem, origin, smoothen);
                assert_eq!(errs[0], 0.0);
                // Cumulative integral of non-negative values never
                // decreases.
                for pair in errs.windows(2) {
                    assert!(pair[1] >= pair[0]);
                }
            }
        }
        let errs = data.integrated_error(ErrorType::RootVar, ErrorOrigin::Inter, false);
        assert_eq!(errs[0], 0.0);
    }

    #[test]
    fn optimal_lam_vals_have_requested_count_and_endpoints() {
        let data = GradientData::new(&multi_repeat_windows()).expect("gradient data");
        for k in [2, 3, 5, 9] {
            let vals = data
                .optimal_lam_vals(ErrorType::RootVar, ErrorOrigin::Inter, false, None, Some(k))
                .expect("optimal lambdas");
            assert_eq!(vals.len(), k);
            assert_eq!(vals[0], data.lam_vals[0]);
            assert_eq!(vals[k - 1], *data.lam_vals.last().unwrap());
            for pair in vals.windows(2) {
                assert!(pair[1] >= pair[0], "non-monotone: {:?}", vals);
            }
        }
    }

    #[test]
    fn optimal_lam_vals_require_exactly_one_target() {
        let data = GradientData::new(&multi_repeat_windows()).expect("gradient data");
        assert!(data
            .optimal_lam_vals(ErrorType::Sem, ErrorOrigin::Inter, true, None, None)
            .is_err());
        assert!(data
            .optimal_lam_vals(ErrorType::Sem, ErrorOrigin::Inter, true, Some(0.1), Some(5))
            .is_err());
    }

    #[test]
    fn delta_er_derives_window_count_from_total_error() {
        let data = GradientData::new(&multi_repeat_windows()).expect("gradient data");
        let integrated = data.integrated_error(ErrorType::RootVar, ErrorOrigin::Inter, false);
        let total = *integrated.last().unwrap();
        let delta = total / 4.0 * 1.01; // just over a quarter
        let vals = data
            .optimal_lam_vals(ErrorType::RootVar, ErrorOrigin::Inter, false, Some(delta), None)
            .expect("optimal lambdas");
        // floor(total / delta) + 1 = 4.
        assert_eq!(vals.len(), 4);
    }

    #[test]
    fn predicted_overlap_rows_sum_to_one() {
        let data = GradientData::new(&synthetic_windows()).expect("gradient data");
        let mat = data.predicted_overlap_mat(298.0);
        assert_eq!(mat.len(), 3);
        for row in &mat {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "row sum {}", sum);
        }
        // Symmetric before normalization: check the unnormalized pattern
        // indirectly by symmetry of zero structure.
        for i in 0..3 {
            for j in 0..3 {
                assert!(mat[i][j] > 0.0);
            }
        }
    }

    #[test]
    fn sems_are_scaled_by_sampling_time() {
        let mut windows = multi_repeat_windows();
        // Double one window's sampling time; its scaled SEM must grow by
        // sqrt(2) relative to the unscaled series.
        let data_before = GradientData::new(&windows).expect("gradient data");
        windows[1].end_time_ns *= 2.0;
        let data_after = GradientData::new(&windows).expect("gradient data");
        let before = data_before.sems(ErrorOrigin::Inter, false);
        let after = data_after.sems(ErrorOrigin::Inter, false);
        let ratio = after[1] / before[1];
        assert!((ratio - 2.0_f64.sqrt()).abs() < 1e-9, "ratio {}", ratio);
    }

    #[test]
    fn empty_window_list_is_a_configuration_error() {
        assert!(GradientData::new(&[]).is_err());
    }
}
