//! Read and rewrite the engine's `key = value` configuration file. Only the
//! handful of fields the orchestrator needs are touched; everything else is
//! preserved byte for byte.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::fsutil::atomic_write_bytes;

/// Per-run parameters read once from the engine config at construction
/// time. `time_per_cycle_ns` is immutable for the lifetime of a simulation.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SimParams {
    /// Integration timestep in ns (the config file stores fs).
    pub timestep_ns: f64,
    /// Moves per cycle.
    pub nmoves: u64,
    /// Timesteps between energy samples.
    pub nrg_freq: u64,
    /// Simulated time per cycle in ns: timestep_fs * nmoves / 1e6.
    pub time_per_cycle_ns: f64,
}

impl SimParams {
    pub fn from_simfile(path: &Path) -> Result<Self> {
        let timestep_fs: f64 = parse_option(path, "timestep")?;
        let nmoves: u64 = parse_option(path, "nmoves")?;
        let nrg_freq: u64 = parse_option(path, "energy frequency")?;
        Ok(SimParams {
            timestep_ns: timestep_fs / 1e6,
            nmoves,
            nrg_freq,
            time_per_cycle_ns: timestep_fs * nmoves as f64 / 1e6,
        })
    }
}

/// Look up `key = value`, matching the key exactly. Comment lines (led by
/// `#`) are skipped.
pub fn read_option(path: &Path, key: &str) -> Result<String> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::parse(path, format!("cannot read config: {}", e)))?;
    for line in contents.lines() {
        let line = line.trim_start();
        if line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix(key) {
            if let Some(value) = rest.trim_start().strip_prefix('=') {
                return Ok(value.trim().to_string());
            }
        }
    }
    Err(Error::parse(path, format!("option '{}' not found", key)))
}

fn parse_option<T: std::str::FromStr>(path: &Path, key: &str) -> Result<T> {
    let raw = read_option(path, key)?;
    // Some engines append a unit after the value.
    let first = raw.split_whitespace().next().unwrap_or("");
    first
        .parse::<T>()
        .map_err(|_| Error::parse(path, format!("option '{}' has invalid value '{}'", key, raw)))
}

/// Rewrite `key = value` in place, appending the line if the key is absent.
pub fn write_option(path: &Path, key: &str, value: &str) -> Result<()> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::parse(path, format!("cannot read config: {}", e)))?;
    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;
    for line in contents.lines() {
        let trimmed = line.trim_start();
        let is_match = !trimmed.starts_with('#')
            && trimmed
                .strip_prefix(key)
                .map(|rest| rest.trim_start().starts_with('='))
                .unwrap_or(false);
        if is_match && !replaced {
            lines.push(format!("{} = {}", key, value));
            replaced = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        lines.push(format!("{} = {}", key, value));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    atomic_write_bytes(path, out.as_bytes())
}

pub fn read_lambda_array(path: &Path) -> Result<Vec<f64>> {
    let raw = read_option(path, "lambda array")?;
    let mut lam_vals = Vec::new();
    for item in raw.split(',') {
        let item = item.trim();
        let lam: f64 = item
            .parse()
            .map_err(|_| Error::parse(path, format!("invalid lambda value '{}'", item)))?;
        lam_vals.push(lam);
    }
    if lam_vals.is_empty() {
        return Err(Error::parse(path, "empty lambda array"));
    }
    Ok(lam_vals)
}

pub fn write_lambda_array(path: &Path, lam_vals: &[f64]) -> Result<()> {
    let value = lam_vals
        .iter()
        .map(|lam| lam.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    write_option(path, "lambda array", &value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::ensure_dir;
    use chrono::Utc;
    use std::path::PathBuf;

    const SIMFILE: &str = "\
### simulation options ###
nmoves = 25000
ncycles = 60
# fs
timestep = 4.0
energy frequency = 250
lambda array = 0.0, 0.25, 0.5, 1.0
lambda_val = 0.25
";

    fn write_temp_simfile() -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "fep_simfile_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        let path = dir.join("engine.cfg");
        fs::write(&path, SIMFILE).expect("write simfile");
        (dir, path)
    }

    #[test]
    fn params_are_derived_from_config_fields() {
        let (dir, path) = write_temp_simfile();
        let params = SimParams::from_simfile(&path).expect("params");
        assert_eq!(params.nmoves, 25000);
        assert_eq!(params.nrg_freq, 250);
        assert!((params.timestep_ns - 4.0e-6).abs() < 1e-12);
        assert!((params.time_per_cycle_ns - 0.1).abs() < 1e-9);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn write_option_rewrites_exact_key_only() {
        let (dir, path) = write_temp_simfile();
        write_option(&path, "ncycles", "120").expect("write option");
        assert_eq!(read_option(&path, "ncycles").expect("read"), "120");
        // The similarly prefixed key must be untouched.
        assert_eq!(read_option(&path, "nmoves").expect("read"), "25000");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn lambda_array_round_trips() {
        let (dir, path) = write_temp_simfile();
        assert_eq!(
            read_lambda_array(&path).expect("read"),
            vec![0.0, 0.25, 0.5, 1.0]
        );
        write_lambda_array(&path, &[0.0, 0.125, 0.375, 1.0]).expect("write");
        assert_eq!(
            read_lambda_array(&path).expect("reread"),
            vec![0.0, 0.125, 0.375, 1.0]
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_option_is_a_parse_error() {
        let (dir, path) = write_temp_simfile();
        let err = read_option(&path, "no such key").expect_err("should fail");
        assert!(matches!(err, Error::Parse { .. }));
        let _ = fs::remove_dir_all(dir);
    }
}
