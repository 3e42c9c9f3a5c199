//! One repeat run at one lambda value: submission bookkeeping, duration
//! alignment, and gradient extraction from the engine's output stream.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use fep_core::simfile;
use fep_core::{atomic_write_bytes, Error, Result, SimParams};
use fep_queue::{JobId, VirtualQueue};

use crate::{ENGINE_CONFIG, ENGINE_LAUNCHER, SIMFILE, SIMFILE_EQUILIBRATED};

const STATE_FILE: &str = "simulation_state.json";
const STATE_VERSION: &str = "simulation_state_v1";

#[derive(Debug, Serialize, Deserialize)]
struct SimulationState {
    schema_version: String,
    lam: f64,
    run_no: usize,
    job: Option<JobId>,
    running: bool,
    tot_simtime_ns: f64,
    params: SimParams,
}

#[derive(Debug)]
pub struct Simulation {
    pub lam: f64,
    pub run_no: usize,
    base_dir: PathBuf,
    pub params: SimParams,
    pub job: Option<JobId>,
    pub running: bool,
    pub tot_simtime_ns: f64,
}

impl Simulation {
    /// Build a repeat simulation in `base_dir`, which must contain the
    /// engine config and launcher. Per-run parameters are read once here;
    /// the per-cycle time is immutable afterwards. A previously persisted
    /// state record in `base_dir` takes precedence over the arguments.
    pub fn new(lam: f64, run_no: usize, base_dir: &Path) -> Result<Self> {
        for required in [ENGINE_CONFIG, ENGINE_LAUNCHER] {
            if !base_dir.join(required).is_file() {
                return Err(Error::Configuration(format!(
                    "required input file {} not found in {}",
                    required,
                    base_dir.display()
                )));
            }
        }
        let state_path = base_dir.join(STATE_FILE);
        if state_path.is_file() {
            let state: SimulationState = serde_json::from_slice(&fs::read(&state_path)?)?;
            return Ok(Simulation {
                lam: state.lam,
                run_no: state.run_no,
                base_dir: base_dir.to_path_buf(),
                params: state.params,
                job: state.job,
                running: state.running,
                tot_simtime_ns: state.tot_simtime_ns,
            });
        }

        let params = SimParams::from_simfile(&base_dir.join(ENGINE_CONFIG))?;
        let sim = Simulation {
            lam,
            run_no,
            base_dir: base_dir.to_path_buf(),
            params,
            job: None,
            running: false,
            tot_simtime_ns: 0.0,
        };
        sim.save()?;
        Ok(sim)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Submit this simulation for `duration_ns`. The duration must be an
    /// exact multiple of the per-cycle time; the check happens before any
    /// external side effect. The cycle count is persisted into the engine
    /// config read by the next engine invocation.
    pub fn run(&mut self, duration_ns: f64, queue: &mut VirtualQueue) -> Result<()> {
        let cycle = self.params.time_per_cycle_ns;
        let n_cycles = duration_ns / cycle;
        if (n_cycles - n_cycles.round()).abs() > 1e-4 || n_cycles.round() < 1.0 {
            return Err(Error::DurationAlignment {
                duration_ns,
                cycle_ns: cycle,
            });
        }
        let n_cycles = n_cycles.round() as u64;
        simfile::write_option(
            &self.base_dir.join(ENGINE_CONFIG),
            "ncycles",
            &n_cycles.to_string(),
        )?;

        // The scheduler launch prefix is supplied by the queue, not here.
        let command = format!(
            "--chdir {} {} {}",
            self.base_dir.display(),
            ENGINE_LAUNCHER,
            self.lam
        );
        let job = queue.submit(&command)?;
        self.job = Some(job);
        self.running = true;
        self.tot_simtime_ns += duration_ns;
        info!(lam = self.lam, run_no = self.run_no, %job, duration_ns, "submitted");
        self.save()
    }

    /// Membership test against the queue; callers must have called
    /// `queue.update()` first. False if no job was ever submitted.
    pub fn check_running(&mut self, queue: &VirtualQueue) -> bool {
        self.running = match self.job {
            Some(job) => queue.contains(job),
            None => false,
        };
        self.running
    }

    pub fn kill(&mut self, queue: &mut VirtualQueue) -> Result<()> {
        let job = self.job.ok_or_else(|| {
            Error::JobControl(format!(
                "no job submitted for lambda {} run {}",
                self.lam, self.run_no
            ))
        })?;
        queue.kill(job)?;
        self.running = false;
        self.save()
    }

    /// A simulation that was submitted, has stopped, and never produced an
    /// output stream is counted as failed.
    pub fn has_failed(&self) -> bool {
        self.job.is_some() && !self.running && !self.base_dir.join(SIMFILE).is_file()
    }

    /// Parse the output stream into (times, values). `endstate` selects the
    /// energy difference between the two end-state Hamiltonians instead of
    /// the instantaneous gradient.
    pub fn read_gradients(
        &self,
        equilibrated_only: bool,
        endstate: bool,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let name = if equilibrated_only {
            SIMFILE_EQUILIBRATED
        } else {
            SIMFILE
        };
        let path = self.base_dir.join(name);
        let contents = fs::read_to_string(&path)
            .map_err(|_| Error::parse(&path, "output file not found"))?;

        let mut times = Vec::new();
        let mut grads = Vec::new();
        for line in contents.lines() {
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let cols: Vec<&str> = line.split_whitespace().collect();
            let step: u64 = cols
                .first()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::parse(&path, format!("bad step field in '{}'", line)))?;
            let value = if endstate {
                let start: f64 = parse_col(&cols, 5, &path, line)?;
                let end: f64 = parse_col(&cols, cols.len() - 1, &path, line)?;
                end - start
            } else {
                parse_col(&cols, 2, &path, line)?
            };
            times.push(step as f64 * self.params.timestep_ns);
            grads.push(value);
        }
        Ok((times, grads))
    }

    pub fn save(&self) -> Result<()> {
        let state = SimulationState {
            schema_version: STATE_VERSION.to_string(),
            lam: self.lam,
            run_no: self.run_no,
            job: self.job,
            running: self.running,
            tot_simtime_ns: self.tot_simtime_ns,
            params: self.params,
        };
        let bytes = serde_json::to_vec_pretty(&state)?;
        atomic_write_bytes(&self.base_dir.join(STATE_FILE), &bytes)
    }
}

fn parse_col(cols: &[&str], index: usize, path: &Path, line: &str) -> Result<f64> {
    cols.get(index)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::parse(path, format!("bad column {} in '{}'", index, line)))
}
