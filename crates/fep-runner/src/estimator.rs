//! Free-energy estimation is delegated to an external analysis tool; the
//! runner only decides when to call it and on which slice of the data.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use fep_core::{Error, Result};

/// One repeat's estimate in kcal mol^-1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreeEnergyEstimate {
    pub delta_g: f64,
    pub uncertainty: f64,
}

/// Produces one estimate per repeat from the equilibrated output under
/// `output_dir`. `fraction` selects the leading fraction of the
/// equilibrated data to analyse (1.0 for a full analysis, smaller values
/// for convergence slices).
pub trait FreeEnergyEstimator: Sync {
    fn estimate(
        &self,
        output_dir: &Path,
        ensemble_size: usize,
        fraction: f64,
    ) -> Result<Vec<FreeEnergyEstimate>>;
}

/// Shells out to a configured analysis command, once per repeat:
///
/// ```text
/// <program> <args..> <run_dir> <fraction>
/// ```
///
/// and expects two whitespace-separated floats on stdout: the free-energy
/// change and its uncertainty.
#[derive(Debug, Clone)]
pub struct CommandEstimator {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandEstimator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandEstimator {
            program: program.into(),
            args,
        }
    }
}

impl FreeEnergyEstimator for CommandEstimator {
    fn estimate(
        &self,
        output_dir: &Path,
        ensemble_size: usize,
        fraction: f64,
    ) -> Result<Vec<FreeEnergyEstimate>> {
        let mut estimates = Vec::with_capacity(ensemble_size);
        for run_no in 1..=ensemble_size {
            let run_dir = output_dir.join(format!("run_{:02}", run_no));
            debug!(program = %self.program, run_dir = %run_dir.display(), fraction, "estimating");
            let output = Command::new(&self.program)
                .args(&self.args)
                .arg(&run_dir)
                .arg(fraction.to_string())
                .output()
                .map_err(|e| {
                    Error::JobControl(format!("cannot launch {}: {}", self.program, e))
                })?;
            if !output.status.success() {
                return Err(Error::JobControl(format!(
                    "{} failed for {}: {}",
                    self.program,
                    run_dir.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            let mut fields = stdout.split_whitespace();
            let delta_g: f64 = parse_field(fields.next(), &run_dir, &stdout)?;
            let uncertainty: f64 = parse_field(fields.next(), &run_dir, &stdout)?;
            estimates.push(FreeEnergyEstimate {
                delta_g,
                uncertainty,
            });
        }
        Ok(estimates)
    }
}

fn parse_field(field: Option<&str>, run_dir: &Path, stdout: &str) -> Result<f64> {
    field
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::parse(run_dir, format!("bad estimator output '{}'", stdout.trim())))
}

/// Deterministic estimator for tests.
pub mod testing {
    use std::path::Path;

    use fep_core::Result;

    use super::{FreeEnergyEstimate, FreeEnergyEstimator};

    /// Returns `base + run_no * spread` per repeat, scaled by the analysed
    /// fraction, so convergence slices are distinguishable.
    #[derive(Debug, Clone)]
    pub struct FixedEstimator {
        pub base: f64,
        pub spread: f64,
        pub uncertainty: f64,
    }

    impl Default for FixedEstimator {
        fn default() -> Self {
            FixedEstimator {
                base: -5.0,
                spread: 0.1,
                uncertainty: 0.2,
            }
        }
    }

    impl FreeEnergyEstimator for FixedEstimator {
        fn estimate(
            &self,
            _output_dir: &Path,
            ensemble_size: usize,
            fraction: f64,
        ) -> Result<Vec<FreeEnergyEstimate>> {
            Ok((1..=ensemble_size)
                .map(|run_no| FreeEnergyEstimate {
                    delta_g: (self.base + run_no as f64 * self.spread) * fraction,
                    uncertainty: self.uncertainty,
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedEstimator;
    use super::*;

    #[test]
    fn fixed_estimator_is_deterministic_per_repeat() {
        let est = FixedEstimator::default();
        let out = est.estimate(Path::new("/tmp"), 3, 1.0).expect("estimate");
        assert_eq!(out.len(), 3);
        assert!((out[0].delta_g - -4.9).abs() < 1e-9);
        assert!((out[2].delta_g - -4.7).abs() < 1e-9);
    }

    #[test]
    fn command_estimator_parses_two_floats() {
        let est =
            CommandEstimator::new("sh", vec!["-c".into(), "printf '%s\\n' '-4.2 0.3'".into()]);
        // The shell -c form ignores the appended run dir and fraction args.
        let out = est.estimate(Path::new("/tmp"), 1, 1.0).expect("estimate");
        assert_eq!(out.len(), 1);
        assert!((out[0].delta_g - -4.2).abs() < 1e-9);
        assert!((out[0].uncertainty - 0.3).abs() < 1e-9);
    }
}
