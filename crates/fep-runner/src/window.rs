//! A lambda window: an ensemble of repeat simulations at one lambda value,
//! owning equilibration-detection dispatch and aggregate running /
//! simulated-time state.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use fep_core::{atomic_write_bytes, Error, Result};
use fep_queue::VirtualQueue;
use fep_stats::{EquilDetection, WindowGradients};

use crate::simulation::Simulation;
use crate::{ENGINE_CONFIG, ENGINE_LAUNCHER};

const STATE_FILE: &str = "window_state.json";
const STATE_VERSION: &str = "window_state_v1";

#[derive(Debug, Serialize, Deserialize)]
struct WindowState {
    schema_version: String,
    lam: f64,
    lam_val_weight: f64,
    block_size_ns: f64,
    equil_detection: EquilDetection,
    equilibrated: bool,
    equil_time: Option<f64>,
    max_runtime_exceeded: bool,
}

#[derive(Debug)]
pub struct LamWindow {
    pub lam: f64,
    pub lam_val_weight: f64,
    pub block_size_ns: f64,
    pub equil_detection: EquilDetection,
    /// Cached result of the last explicit equilibration check. Mutated
    /// only by `check_equilibrated`.
    equilibrated: bool,
    equil_time: Option<f64>,
    /// Set when the window was force-retired at the runtime cap without
    /// equilibrating; recorded, not fatal.
    pub max_runtime_exceeded: bool,
    pub sims: Vec<Simulation>,
    base_dir: PathBuf,
}

impl LamWindow {
    /// Build the window under `base_dir`, creating one run dir per repeat
    /// with its own copy of the engine config and launcher from
    /// `input_dir`. A persisted record takes precedence for mutable state.
    pub fn new(
        lam: f64,
        lam_val_weight: f64,
        ensemble_size: usize,
        block_size_ns: f64,
        equil_detection: EquilDetection,
        base_dir: &Path,
        input_dir: &Path,
    ) -> Result<Self> {
        if ensemble_size == 0 {
            return Err(Error::Configuration(
                "ensemble size must be at least 1".to_string(),
            ));
        }
        fs::create_dir_all(base_dir)?;

        let mut sims = Vec::with_capacity(ensemble_size);
        for run_no in 1..=ensemble_size {
            let run_dir = base_dir.join(format!("run_{:02}", run_no));
            fs::create_dir_all(&run_dir)?;
            for file in [ENGINE_CONFIG, ENGINE_LAUNCHER] {
                let dest = run_dir.join(file);
                if !dest.is_file() {
                    fs::copy(input_dir.join(file), &dest).map_err(|e| {
                        Error::Configuration(format!(
                            "cannot stage input file {} into {}: {}",
                            file,
                            run_dir.display(),
                            e
                        ))
                    })?;
                }
            }
            sims.push(Simulation::new(lam, run_no, &run_dir)?);
        }

        let mut window = LamWindow {
            lam,
            lam_val_weight,
            block_size_ns,
            equil_detection,
            equilibrated: false,
            equil_time: None,
            max_runtime_exceeded: false,
            sims,
            base_dir: base_dir.to_path_buf(),
        };

        let state_path = base_dir.join(STATE_FILE);
        if state_path.is_file() {
            let state: WindowState = serde_json::from_slice(&fs::read(&state_path)?)?;
            window.lam = state.lam;
            window.lam_val_weight = state.lam_val_weight;
            window.block_size_ns = state.block_size_ns;
            window.equil_detection = state.equil_detection;
            window.equilibrated = state.equilibrated;
            window.equil_time = state.equil_time;
            window.max_runtime_exceeded = state.max_runtime_exceeded;
        } else {
            window.save()?;
        }
        Ok(window)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Run every repeat for the same duration. All repeats run identical
    /// durations by construction.
    pub fn run(&mut self, duration_ns: f64, queue: &mut VirtualQueue) -> Result<()> {
        for sim in &mut self.sims {
            sim.run(duration_ns, queue)?;
        }
        self.save()
    }

    /// True iff any repeat is still running; recomputed on every call.
    /// The queue must have been updated first.
    pub fn is_running(&mut self, queue: &VirtualQueue) -> bool {
        let mut running = false;
        for sim in &mut self.sims {
            running |= sim.check_running(queue);
        }
        running
    }

    /// Kill every repeat that has a submitted job.
    pub fn kill(&mut self, queue: &mut VirtualQueue) -> Result<()> {
        for sim in &mut self.sims {
            if sim.job.is_some() {
                sim.kill(queue)?;
            }
        }
        Ok(())
    }

    /// Per-repeat total simulated time (identical across repeats).
    pub fn tot_simtime(&self) -> f64 {
        self.sims.iter().map(|s| s.tot_simtime_ns).sum()
    }

    pub fn equilibrated(&self) -> bool {
        self.equilibrated
    }

    pub fn equil_time(&self) -> Option<f64> {
        self.equil_time
    }

    /// Run the equilibration-detection routine across the repeats'
    /// gradient series and cache the result. Explicit, so the expensive
    /// computation is visible at the call site.
    pub fn check_equilibrated(&mut self) -> Result<bool> {
        if self.equilibrated {
            return Ok(true);
        }
        let (times, mean_series) = self.ensemble_mean_series()?;
        let (equilibrated, equil_time) = self.equil_detection.detect(&times, &mean_series);
        self.equilibrated = equilibrated;
        self.equil_time = equil_time;
        if equilibrated {
            info!(lam = self.lam, equil_time, "window equilibrated");
        }
        self.save()?;
        Ok(equilibrated)
    }

    /// Mark the window as retired at the runtime cap without reaching
    /// equilibration. A recoverable, explicitly modeled outcome.
    pub fn mark_max_runtime_exceeded(&mut self) -> Result<()> {
        warn!(
            lam = self.lam,
            "window exceeded the maximum runtime without equilibrating"
        );
        self.max_runtime_exceeded = true;
        self.save()
    }

    /// Gradient series of all repeats, for the statistics engine.
    pub fn window_gradients(&self, equilibrated_only: bool) -> Result<WindowGradients> {
        let mut repeat_series = Vec::with_capacity(self.sims.len());
        for sim in &self.sims {
            let (_, grads) = sim.read_gradients(equilibrated_only, false)?;
            repeat_series.push(grads);
        }
        let start_time_ns = if equilibrated_only {
            self.equil_time.unwrap_or(0.0)
        } else {
            0.0
        };
        let end_time_ns = self
            .sims
            .first()
            .map(|s| s.tot_simtime_ns)
            .unwrap_or(0.0);
        let timestep_ns = self
            .sims
            .first()
            .map(|s| s.params.timestep_ns)
            .unwrap_or(0.0);
        Ok(WindowGradients {
            lam: self.lam,
            repeat_series,
            start_time_ns,
            end_time_ns,
            timestep_ns,
        })
    }

    /// Elementwise mean of the repeats' gradient series, truncated to the
    /// shortest repeat, with sample times.
    fn ensemble_mean_series(&self) -> Result<(Vec<f64>, Vec<f64>)> {
        let mut all: Vec<(Vec<f64>, Vec<f64>)> = Vec::with_capacity(self.sims.len());
        for sim in &self.sims {
            all.push(sim.read_gradients(false, false)?);
        }
        let min_len = all.iter().map(|(t, _)| t.len()).min().unwrap_or(0);
        if min_len == 0 {
            return Err(Error::parse(
                self.base_dir.clone(),
                "no gradient samples available for equilibration detection",
            ));
        }
        let times = all[0].0[..min_len].to_vec();
        let mut mean_series = vec![0.0; min_len];
        for (_, grads) in &all {
            for (acc, v) in mean_series.iter_mut().zip(grads.iter()) {
                *acc += v;
            }
        }
        let n = all.len() as f64;
        for v in &mut mean_series {
            *v /= n;
        }
        Ok((times, mean_series))
    }

    pub fn save(&self) -> Result<()> {
        for sim in &self.sims {
            sim.save()?;
        }
        let state = WindowState {
            schema_version: STATE_VERSION.to_string(),
            lam: self.lam,
            lam_val_weight: self.lam_val_weight,
            block_size_ns: self.block_size_ns,
            equil_detection: self.equil_detection,
            equilibrated: self.equilibrated,
            equil_time: self.equil_time,
            max_runtime_exceeded: self.max_runtime_exceeded,
        };
        let bytes = serde_json::to_vec_pretty(&state)?;
        atomic_write_bytes(&self.base_dir.join(STATE_FILE), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SIMFILE;
    use chrono::Utc;
    use fep_queue::testing::FakeScheduler;

    const CONFIG: &str = "\
nmoves = 25000
ncycles = 5
timestep = 4.0
energy frequency = 250
";

    fn setup(ensemble_size: usize) -> (PathBuf, LamWindow, VirtualQueue, FakeScheduler) {
        let root = std::env::temp_dir().join(format!(
            "fep_window_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let input = root.join("input");
        fs::create_dir_all(&input).expect("input dir");
        fs::write(input.join(ENGINE_CONFIG), CONFIG).expect("config");
        fs::write(input.join(ENGINE_LAUNCHER), "#!/bin/sh\n").expect("launcher");
        let scheduler = FakeScheduler::default();
        let queue =
            VirtualQueue::new(Box::new(scheduler.clone()), &root).expect("queue");
        let window = LamWindow::new(
            0.5,
            0.25,
            ensemble_size,
            1.0,
            EquilDetection::Fixed { fraction: 0.1 },
            &root.join("lambda_0.500"),
            &input,
        )
        .expect("window");
        (root, window, queue, scheduler)
    }

    fn write_simfile(window: &LamWindow, run_no: usize, rows: usize) {
        let mut contents = String::from("# header\n");
        for i in 1..=rows {
            contents.push_str(&format!("{} 0.0 {} \n", i * 250, 1.0 + (i % 3) as f64 * 0.1));
        }
        let dir = window.sims[run_no - 1].base_dir();
        fs::write(dir.join(SIMFILE), contents).expect("simfile");
    }

    #[test]
    fn all_repeats_run_the_same_duration() {
        let (root, mut window, mut queue, scheduler) = setup(3);
        window.run(0.5, &mut queue).expect("run");
        assert_eq!(scheduler.submitted().len(), 3);
        for sim in &window.sims {
            assert!((sim.tot_simtime_ns - 0.5).abs() < 1e-9);
        }
        assert!((window.tot_simtime() - 1.5).abs() < 1e-9);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn running_reflects_any_live_repeat() {
        let (root, mut window, mut queue, scheduler) = setup(2);
        window.run(0.1, &mut queue).expect("run");
        queue.update().expect("update");
        assert!(window.is_running(&queue));

        scheduler.finish_all();
        queue.update().expect("update");
        assert!(!window.is_running(&queue));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn equilibration_check_caches_its_result() {
        let (root, mut window, _queue, _scheduler) = setup(2);
        for run_no in 1..=2 {
            write_simfile(&window, run_no, 100);
        }
        assert!(!window.equilibrated());
        assert!(window.check_equilibrated().expect("check"));
        assert!(window.equilibrated());
        assert!(window.equil_time().is_some());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn window_state_survives_reload() {
        let (root, mut window, mut queue, _scheduler) = setup(2);
        window.run(0.2, &mut queue).expect("run");
        for run_no in 1..=2 {
            write_simfile(&window, run_no, 50);
        }
        window.check_equilibrated().expect("check");

        let input = root.join("input");
        let reloaded = LamWindow::new(
            0.0,
            0.0,
            2,
            9.0,
            EquilDetection::Fixed { fraction: 0.9 },
            &root.join("lambda_0.500"),
            &input,
        )
        .expect("reload");
        assert_eq!(reloaded.lam, 0.5);
        assert_eq!(reloaded.lam_val_weight, 0.25);
        assert_eq!(reloaded.block_size_ns, 1.0);
        assert_eq!(reloaded.equilibrated(), window.equilibrated());
        assert_eq!(reloaded.equil_time(), window.equil_time());
        assert!((reloaded.tot_simtime() - window.tot_simtime()).abs() < 1e-9);
        let _ = fs::remove_dir_all(root);
    }
}
