//! Statistical engine for the adaptive control loops: decorrelation,
//! SEM decomposition across an ensemble of repeat runs, integrated error
//! curves and optimal lambda placement.

pub mod equil;
pub mod grads;
pub mod inefficiency;

pub use equil::EquilDetection;
pub use grads::{lam_val_weights, ErrorOrigin, ErrorType, GradientData, WindowGradients};
pub use inefficiency::statistical_inefficiency;

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (matching `np.var` with ddof = 0).
pub(crate) fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}
