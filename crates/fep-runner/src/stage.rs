//! A stage owns an ordered set of lambda windows and its own virtual
//! queue, and drives them from a background control loop: submit, poll,
//! and decide per window whether more sampling is needed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use fep_core::simfile;
use fep_core::{atomic_write_bytes, Error, Result};
use fep_queue::{Scheduler, VirtualQueue};
use fep_stats::{
    lam_val_weights, EquilDetection, ErrorOrigin, ErrorType, GradientData,
};

use crate::estimator::{FreeEnergyEstimate, FreeEnergyEstimator};
use crate::runner::{append_status, SimulationRunner};
use crate::window::LamWindow;
use crate::{ENGINE_CONFIG, SIMFILE, SIMFILE_EQUILIBRATED};

const STATE_FILE: &str = "stage_state.json";
const STATE_VERSION: &str = "stage_state_v1";

/// Upper bound on efficiency-loop passes; the loop stops with a warning if
/// the fixed point has not been reached by then.
const MAX_EFFICIENCY_PASSES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageType {
    Restrain,
    Discharge,
    Vanish,
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageType::Restrain => "restrain",
            StageType::Discharge => "discharge",
            StageType::Vanish => "vanish",
        };
        write!(f, "{}", name)
    }
}

/// What the control loop does once the initial submissions are in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    /// Run every window once for `runtime_ns` and wait; equilibration and
    /// error are never inspected.
    NonAdaptive { runtime_ns: f64 },
    /// Resubmit each window one block at a time until it equilibrates or
    /// hits the per-simulation runtime cap.
    AdaptiveEquilibration { initial_runtime_ns: f64 },
    /// Resubmit towards the per-window sampling time that minimises the
    /// overall error for a fixed compute budget.
    AdaptiveEfficiency { initial_runtime_ns: f64 },
}

impl RunMode {
    /// Map the user-facing (adaptive, runtime) pair onto a mode. An
    /// explicit runtime is only meaningful for a non-adaptive run, and a
    /// non-adaptive run cannot do without one.
    pub fn from_args(
        adaptive: bool,
        runtime_ns: Option<f64>,
        runtime_constant: Option<f64>,
        initial_runtime_ns: f64,
    ) -> Result<RunMode> {
        match (adaptive, runtime_ns) {
            (true, Some(_)) => Err(Error::Configuration(
                "an explicit runtime cannot be combined with an adaptive run".to_string(),
            )),
            (false, None) => Err(Error::Configuration(
                "a non-adaptive run requires an explicit runtime".to_string(),
            )),
            (false, Some(runtime_ns)) => Ok(RunMode::NonAdaptive { runtime_ns }),
            (true, None) => Ok(if runtime_constant.is_some() {
                RunMode::AdaptiveEfficiency { initial_runtime_ns }
            } else {
                RunMode::AdaptiveEquilibration { initial_runtime_ns }
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StageStatus {
    Idle,
    Running,
    Settled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct StageConfig {
    pub stage_type: StageType,
    pub lam_vals: Vec<f64>,
    pub ensemble_size: usize,
    /// Resubmission quantum for adaptive equilibration, in ns.
    pub block_size_ns: f64,
    pub equil_detection: EquilDetection,
    /// Required for the efficiency mode: target SEM^2 per unit runtime.
    pub runtime_constant: Option<f64>,
    /// Per-simulation runtime cap for the adaptive modes, in ns.
    pub max_runtime_ns: f64,
    /// Poll interval of the control loop.
    pub cycle_pause: Duration,
}

impl StageConfig {
    pub fn new(stage_type: StageType, lam_vals: Vec<f64>, ensemble_size: usize) -> Self {
        StageConfig {
            stage_type,
            lam_vals,
            ensemble_size,
            block_size_ns: 1.0,
            equil_detection: EquilDetection::BlockGradient {
                block_size_ns: 1.0,
                gradient_threshold: None,
            },
            runtime_constant: None,
            max_runtime_ns: 30.0,
            cycle_pause: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StageState {
    schema_version: String,
    stage_type: StageType,
    lam_vals: Vec<f64>,
    maximally_efficient: bool,
}

/// Per-window view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct WindowSummary {
    pub lam: f64,
    pub equilibrated: bool,
    pub equil_time_ns: Option<f64>,
    pub simtime_per_run_ns: f64,
    pub max_runtime_exceeded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage_type: StageType,
    pub status: StageStatus,
    pub maximally_efficient: bool,
    pub tot_simtime_ns: f64,
    pub windows: Vec<WindowSummary>,
}

struct StageInner {
    stage_type: StageType,
    lam_vals: Vec<f64>,
    ensemble_size: usize,
    block_size_ns: f64,
    equil_detection: EquilDetection,
    runtime_constant: Option<f64>,
    max_runtime_ns: f64,
    windows: Vec<LamWindow>,
    queue: VirtualQueue,
    status: StageStatus,
    maximally_efficient: bool,
    base_dir: PathBuf,
    input_dir: PathBuf,
    output_dir: PathBuf,
}

pub struct Stage {
    inner: Arc<Mutex<StageInner>>,
    kill_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    stage_type: StageType,
    base_dir: PathBuf,
    cycle_pause: Duration,
}

impl Stage {
    /// Build the stage under `base_dir`; engine inputs come from
    /// `input_dir`, windows live under `base_dir/output`. A persisted
    /// stage record (lambda values, efficiency flag) takes precedence
    /// over the configuration.
    pub fn new(
        config: StageConfig,
        base_dir: &Path,
        input_dir: &Path,
        scheduler: Box<dyn Scheduler>,
    ) -> Result<Stage> {
        if config.ensemble_size == 0 {
            return Err(Error::Configuration(
                "ensemble size must be at least 1".to_string(),
            ));
        }
        validate_lam_vals(&config.lam_vals)?;
        fs::create_dir_all(base_dir)?;

        let mut lam_vals = config.lam_vals.clone();
        let mut maximally_efficient = false;
        let state_path = base_dir.join(STATE_FILE);
        if state_path.is_file() {
            let state: StageState = serde_json::from_slice(&fs::read(&state_path)?)?;
            lam_vals = state.lam_vals;
            maximally_efficient = state.maximally_efficient;
        }

        let output_dir = base_dir.join("output");
        let queue = VirtualQueue::new(scheduler, base_dir)?;
        let windows = build_windows(
            &lam_vals,
            config.ensemble_size,
            config.block_size_ns,
            config.equil_detection,
            &output_dir,
            input_dir,
        )?;

        let inner = StageInner {
            stage_type: config.stage_type,
            lam_vals,
            ensemble_size: config.ensemble_size,
            block_size_ns: config.block_size_ns,
            equil_detection: config.equil_detection,
            runtime_constant: config.runtime_constant,
            max_runtime_ns: config.max_runtime_ns,
            windows,
            queue,
            status: StageStatus::Idle,
            maximally_efficient,
            base_dir: base_dir.to_path_buf(),
            input_dir: input_dir.to_path_buf(),
            output_dir,
        };
        inner.save()?;

        Ok(Stage {
            inner: Arc::new(Mutex::new(inner)),
            kill_flag: Arc::new(AtomicBool::new(false)),
            handle: None,
            stage_type: config.stage_type,
            base_dir: base_dir.to_path_buf(),
            cycle_pause: config.cycle_pause,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, StageInner>> {
        lock_inner(&self.inner)
    }

    pub fn stage_type(&self) -> StageType {
        self.stage_type
    }

    pub fn status(&self) -> Result<StageStatus> {
        Ok(self.lock()?.status.clone())
    }

    pub fn summary(&self) -> Result<StageSummary> {
        let g = self.lock()?;
        let windows = g
            .windows
            .iter()
            .map(|win| WindowSummary {
                lam: win.lam,
                equilibrated: win.equilibrated(),
                equil_time_ns: win.equil_time(),
                simtime_per_run_ns: win
                    .sims
                    .first()
                    .map(|s| s.tot_simtime_ns)
                    .unwrap_or(0.0),
                max_runtime_exceeded: win.max_runtime_exceeded,
            })
            .collect();
        Ok(StageSummary {
            stage_type: g.stage_type,
            status: g.status.clone(),
            maximally_efficient: g.maximally_efficient,
            tot_simtime_ns: g.windows.par_iter().map(|w| w.tot_simtime()).sum(),
            windows,
        })
    }

    /// Start the control loop in a background thread. Configuration
    /// problems (misaligned runtimes, a missing runtime constant) are
    /// raised here, before anything is submitted.
    pub fn run(&mut self, mode: RunMode) -> Result<()> {
        let stage_type = {
            let mut g = self.lock()?;
            if g.status == StageStatus::Running {
                return Err(Error::State("stage is already running".to_string()));
            }
            match mode {
                RunMode::NonAdaptive { runtime_ns } => g.check_alignment(runtime_ns)?,
                RunMode::AdaptiveEquilibration { initial_runtime_ns } => {
                    g.check_alignment(initial_runtime_ns)?;
                    g.check_alignment(g.block_size_ns)?;
                }
                RunMode::AdaptiveEfficiency { initial_runtime_ns } => {
                    if g.runtime_constant.is_none() {
                        return Err(Error::Configuration(
                            "adaptive efficiency requires a runtime constant".to_string(),
                        ));
                    }
                    g.check_alignment(initial_runtime_ns)?;
                }
            }
            g.status = StageStatus::Running;
            append_status(&g.base_dir, &format!("run started: {:?}", mode));
            g.save()?;
            g.stage_type
        };

        self.kill_flag.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let kill = Arc::clone(&self.kill_flag);
        let pause = self.cycle_pause;
        let handle = thread::Builder::new()
            .name(format!("stage-{}", stage_type))
            .spawn(move || {
                let result = match mode {
                    RunMode::NonAdaptive { runtime_ns } => {
                        run_loop_non_adaptive(&inner, &kill, pause, runtime_ns)
                    }
                    RunMode::AdaptiveEquilibration { initial_runtime_ns } => {
                        run_loop_adaptive_equilibration(&inner, &kill, pause, initial_runtime_ns)
                    }
                    RunMode::AdaptiveEfficiency { initial_runtime_ns } => {
                        run_loop_adaptive_efficiency(&inner, &kill, pause, initial_runtime_ns)
                    }
                };
                finish_run_loop(&inner, &kill, result);
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Join the control loop and surface any error it hit.
    pub fn wait(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| Error::State("stage control loop panicked".to_string()))?;
        }
        let g = self.lock()?;
        if let StageStatus::Failed(reason) = &g.status {
            return Err(Error::State(reason.clone()));
        }
        Ok(())
    }

    /// Full analysis over the equilibrated data: truncate each repeat's
    /// output to the post-equilibration region, run the estimator across
    /// the ensemble, and append mean, 95 % CI and per-window statistics
    /// to the stage report.
    pub fn analyse(
        &self,
        estimator: &dyn FreeEnergyEstimator,
    ) -> Result<Vec<FreeEnergyEstimate>> {
        let g = self.lock()?;
        g.ensure_analysable()?;

        for win in &g.windows {
            let equil_time = win.equil_time().ok_or_else(|| {
                Error::State(format!(
                    "window at lambda {} has no equilibration time",
                    win.lam
                ))
            })?;
            let params = win.sims[0].params;
            // The first energy is only written after the first nrg_freq
            // steps, hence the -1.
            let sample_interval = params.timestep_ns * params.nrg_freq as f64;
            let equil_index = ((equil_time / sample_interval) as i64 - 1).max(0) as usize;
            for sim in &win.sims {
                write_equilibrated_data(
                    &sim.base_dir().join(SIMFILE),
                    &sim.base_dir().join(SIMFILE_EQUILIBRATED),
                    equil_index,
                )?;
            }
        }

        let estimates = estimator.estimate(&g.output_dir, g.ensemble_size, 1.0)?;
        let dgs: Vec<f64> = estimates.iter().map(|e| e.delta_g).collect();
        let n = dgs.len();
        if n == 0 {
            return Err(Error::State("estimator returned no estimates".to_string()));
        }
        let mean_dg = dgs.iter().sum::<f64>() / n as f64;
        let ci = if n > 1 {
            let var =
                dgs.iter().map(|v| (v - mean_dg).powi(2)).sum::<f64>() / (n as f64 - 1.0);
            t_95(n - 1) * (var / n as f64).sqrt()
        } else {
            0.0
        };
        g.write_overall_stats(mean_dg, ci, &dgs)?;
        append_status(&g.base_dir, "analysis complete");
        info!(mean_dg, ci, stage = %g.stage_type, "analysis complete");
        Ok(estimates)
    }

    /// Estimate once per 5 % slice of the equilibrated data, fanned out on
    /// the worker pool. Returns the fractions and a per-fraction list of
    /// per-repeat free-energy changes.
    pub fn analyse_convergence(
        &self,
        estimator: &dyn FreeEnergyEstimator,
    ) -> Result<(Vec<f64>, Vec<Vec<f64>>)> {
        let (output_dir, ensemble_size) = {
            let g = self.lock()?;
            g.ensure_analysable()?;
            (g.output_dir.clone(), g.ensemble_size)
        };
        let fracts: Vec<f64> = (1..=20).map(|i| i as f64 * 0.05).collect();
        let results: Result<Vec<Vec<FreeEnergyEstimate>>> = fracts
            .par_iter()
            .map(|&fract| estimator.estimate(&output_dir, ensemble_size, fract))
            .collect();
        let dg_overall = results?
            .into_iter()
            .map(|ests| ests.iter().map(|e| e.delta_g).collect())
            .collect();
        Ok((fracts, dg_overall))
    }

    /// Optimal lambda placement from the current (unequilibrated) samples.
    pub fn optimal_lam_vals(
        &self,
        er_type: ErrorType,
        delta_er: Option<f64>,
        n_lam_vals: Option<usize>,
    ) -> Result<Vec<f64>> {
        let g = self.lock()?;
        if g.status == StageStatus::Running {
            return Err(Error::State(
                "cannot compute optimal lambda values while the stage is running".to_string(),
            ));
        }
        let data = g.gradient_data(false)?;
        data.optimal_lam_vals(er_type, ErrorOrigin::Inter, true, delta_er, n_lam_vals)
    }

    /// Replace the lambda schedule: archive the previous output, rewrite
    /// the lambda array in the engine config, and rebuild the windows.
    pub fn update(&mut self, new_lam_vals: &[f64]) -> Result<()> {
        let mut g = self.lock()?;
        if g.status == StageStatus::Running {
            return Err(Error::State(
                "cannot rebuild windows while the stage is running".to_string(),
            ));
        }
        validate_lam_vals(new_lam_vals)?;

        if g.output_dir.is_dir() {
            let archive = g.base_dir.join(format!(
                "output_archived_{}",
                Utc::now().format("%Y%m%d_%H%M%S_%f")
            ));
            fs::rename(&g.output_dir, &archive)?;
            info!(archive = %archive.display(), "archived previous stage output");
        }
        simfile::write_lambda_array(&g.input_dir.join(ENGINE_CONFIG), new_lam_vals)?;
        g.lam_vals = new_lam_vals.to_vec();
        g.maximally_efficient = false;
        g.status = StageStatus::Idle;
        g.windows = build_windows(
            new_lam_vals,
            g.ensemble_size,
            g.block_size_ns,
            g.equil_detection,
            &g.output_dir,
            &g.input_dir,
        )?;
        append_status(
            &g.base_dir,
            &format!("windows rebuilt with lambda values {:?}", new_lam_vals),
        );
        g.save()
    }
}

impl SimulationRunner for Stage {
    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn is_running(&self) -> bool {
        self.inner
            .lock()
            .map(|g| g.status == StageStatus::Running)
            .unwrap_or(false)
    }

    fn tot_simtime(&self) -> f64 {
        self.inner
            .lock()
            .map(|g| g.windows.par_iter().map(|w| w.tot_simtime()).sum())
            .unwrap_or(0.0)
    }

    /// Stop the control loop and terminate in-flight jobs. A no-op on an
    /// idle stage.
    fn kill(&mut self) -> Result<()> {
        self.kill_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut g = self.lock()?;
        {
            let StageInner { windows, queue, .. } = &mut *g;
            for win in windows.iter_mut() {
                win.kill(queue)?;
            }
        }
        if g.status == StageStatus::Running {
            g.status = StageStatus::Idle;
        }
        append_status(&g.base_dir, "stage killed");
        g.save()?;
        drop(g);
        self.kill_flag.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn save(&self) -> Result<()> {
        self.lock()?.save()
    }
}

impl StageInner {
    fn check_alignment(&self, duration_ns: f64) -> Result<()> {
        for win in &self.windows {
            let cycle = win.sims[0].params.time_per_cycle_ns;
            let n = duration_ns / cycle;
            if (n - n.round()).abs() > 1e-4 || n.round() < 1.0 {
                return Err(Error::DurationAlignment {
                    duration_ns,
                    cycle_ns: cycle,
                });
            }
        }
        Ok(())
    }

    fn gradient_data(&self, equilibrated_only: bool) -> Result<GradientData> {
        let mut records = Vec::with_capacity(self.windows.len());
        for win in &self.windows {
            records.push(win.window_gradients(equilibrated_only)?);
        }
        GradientData::new(&records)
    }

    fn ensure_analysable(&self) -> Result<()> {
        if self.status == StageStatus::Running {
            return Err(Error::State(
                "cannot analyse while the stage is running".to_string(),
            ));
        }
        let failed: Vec<String> = self
            .windows
            .iter()
            .flat_map(|w| w.sims.iter())
            .filter(|s| s.has_failed())
            .map(|s| s.base_dir().display().to_string())
            .collect();
        if !failed.is_empty() {
            return Err(Error::State(format!(
                "simulations did not complete successfully: {}",
                failed.join(", ")
            )));
        }
        for win in &self.windows {
            if !win.equilibrated() || win.equil_time().is_none() {
                return Err(Error::State(format!(
                    "window at lambda {} has not equilibrated",
                    win.lam
                )));
            }
        }
        Ok(())
    }

    fn write_overall_stats(&self, mean_dg: f64, ci: f64, dgs: &[f64]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.output_dir.join("overall_stats.dat"))?;
        writeln!(file, "==========================================================")?;
        writeln!(
            file,
            "{} analysis of the {} stage",
            Utc::now().to_rfc3339(),
            self.stage_type
        )?;
        writeln!(
            file,
            "Free energy change: {:.3} +/- {:.3} kcal mol-1 (95% CI)",
            mean_dg, ci
        )?;
        writeln!(file, "Repeat free energies: {:?} kcal mol-1", dgs)?;
        for win in &self.windows {
            writeln!(
                file,
                "Equilibration time for lambda = {}: {:.3} ns per simulation",
                win.lam,
                win.equil_time().unwrap_or(0.0)
            )?;
            writeln!(
                file,
                "Total time simulated for lambda = {}: {:.3} ns per simulation",
                win.lam,
                win.sims.first().map(|s| s.tot_simtime_ns).unwrap_or(0.0)
            )?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        for win in &self.windows {
            win.save()?;
        }
        let state = StageState {
            schema_version: STATE_VERSION.to_string(),
            stage_type: self.stage_type,
            lam_vals: self.lam_vals.clone(),
            maximally_efficient: self.maximally_efficient,
        };
        let bytes = serde_json::to_vec_pretty(&state)?;
        atomic_write_bytes(&self.base_dir.join(STATE_FILE), &bytes)
    }
}

fn lock_inner(inner: &Mutex<StageInner>) -> Result<MutexGuard<'_, StageInner>> {
    inner
        .lock()
        .map_err(|_| Error::State("stage state lock poisoned".to_string()))
}

fn validate_lam_vals(lam_vals: &[f64]) -> Result<()> {
    if lam_vals.len() < 2 {
        return Err(Error::Configuration(
            "at least two lambda values are required".to_string(),
        ));
    }
    for pair in lam_vals.windows(2) {
        if pair[1] <= pair[0] {
            return Err(Error::Configuration(format!(
                "lambda values must be strictly increasing, got {} then {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

fn build_windows(
    lam_vals: &[f64],
    ensemble_size: usize,
    block_size_ns: f64,
    equil_detection: EquilDetection,
    output_dir: &Path,
    input_dir: &Path,
) -> Result<Vec<LamWindow>> {
    let weights = lam_val_weights(lam_vals);
    let mut windows = Vec::with_capacity(lam_vals.len());
    for (&lam, &weight) in lam_vals.iter().zip(weights.iter()) {
        windows.push(LamWindow::new(
            lam,
            weight,
            ensemble_size,
            block_size_ns,
            equil_detection,
            &output_dir.join(format!("lambda_{:.3}", lam)),
            input_dir,
        )?);
    }
    Ok(windows)
}

/// Round to the nearest whole number of engine cycles, at least one.
fn align_to_cycle(duration_ns: f64, cycle_ns: f64) -> f64 {
    let n = (duration_ns / cycle_ns).round().max(1.0);
    n * cycle_ns
}

fn finish_run_loop(inner: &Mutex<StageInner>, kill: &AtomicBool, result: Result<()>) {
    let Ok(mut g) = inner.lock() else {
        error!("stage state lock poisoned while finishing run loop");
        return;
    };
    match result {
        Ok(()) => {
            if g.status == StageStatus::Running {
                g.status = if kill.load(Ordering::SeqCst) {
                    StageStatus::Idle
                } else {
                    StageStatus::Settled
                };
            }
            append_status(&g.base_dir, "run loop finished");
        }
        Err(e) => {
            error!(stage = %g.stage_type, error = %e, "run loop failed");
            append_status(&g.base_dir, &format!("run loop failed: {}", e));
            g.status = StageStatus::Failed(e.to_string());
        }
    }
    if let Err(e) = g.save() {
        error!(error = %e, "failed to persist stage state after run loop");
    }
}

/// Poll until no window is running. Returns false if the loop was killed.
fn drain(inner: &Mutex<StageInner>, kill: &AtomicBool, pause: Duration) -> Result<bool> {
    loop {
        {
            let mut g = lock_inner(inner)?;
            match g.queue.update() {
                Ok(()) => {
                    let StageInner { windows, queue, .. } = &mut *g;
                    let any_running = windows.iter_mut().any(|w| w.is_running(queue));
                    if !any_running {
                        return Ok(true);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "queue update failed; retrying next cycle");
                }
            }
        }
        thread::sleep(pause);
        if kill.load(Ordering::SeqCst) {
            info!("kill requested; leaving run loop");
            return Ok(false);
        }
    }
}

fn run_loop_non_adaptive(
    inner: &Mutex<StageInner>,
    kill: &AtomicBool,
    pause: Duration,
    runtime_ns: f64,
) -> Result<()> {
    {
        let mut g = lock_inner(inner)?;
        let StageInner { windows, queue, .. } = &mut *g;
        for win in windows.iter_mut() {
            win.run(runtime_ns, queue)?;
        }
        append_status(
            &g.base_dir,
            &format!("submitted {} windows for {} ns", g.windows.len(), runtime_ns),
        );
        g.save()?;
    }
    if drain(inner, kill, pause)? {
        let g = lock_inner(inner)?;
        info!(stage = %g.stage_type, "all windows finished");
    }
    Ok(())
}

fn run_loop_adaptive_equilibration(
    inner: &Mutex<StageInner>,
    kill: &AtomicBool,
    pause: Duration,
    initial_runtime_ns: f64,
) -> Result<()> {
    let mut active: Vec<usize>;
    {
        let mut g = lock_inner(inner)?;
        let StageInner { windows, queue, .. } = &mut *g;
        active = (0..windows.len())
            .filter(|&i| !windows[i].equilibrated() && !windows[i].max_runtime_exceeded)
            .collect();
        for &i in &active {
            windows[i].run(initial_runtime_ns, queue)?;
        }
        append_status(
            &g.base_dir,
            &format!("adaptive equilibration across {} windows", active.len()),
        );
        g.save()?;
    }

    while !active.is_empty() {
        thread::sleep(pause);
        if kill.load(Ordering::SeqCst) {
            info!("kill requested; leaving run loop");
            return Ok(());
        }
        let mut g = lock_inner(inner)?;
        if let Err(e) = g.queue.update() {
            warn!(error = %e, "queue update failed; retrying next cycle");
            continue;
        }
        let block = g.block_size_ns;
        let cap = g.max_runtime_ns;
        let StageInner {
            windows,
            queue,
            base_dir,
            ..
        } = &mut *g;
        let mut next = Vec::new();
        for &i in &active {
            let win = &mut windows[i];
            if win.is_running(queue) {
                next.push(i);
                continue;
            }
            if win.check_equilibrated()? {
                append_status(
                    base_dir,
                    &format!(
                        "lambda {} equilibrated at {:.3} ns",
                        win.lam,
                        win.equil_time().unwrap_or(0.0)
                    ),
                );
            } else if win.sims[0].tot_simtime_ns >= cap {
                win.mark_max_runtime_exceeded()?;
                append_status(
                    base_dir,
                    &format!("lambda {} retired at the runtime cap", win.lam),
                );
            } else {
                let resubmit = align_to_cycle(block, win.sims[0].params.time_per_cycle_ns);
                info!(lam = win.lam, resubmit, "window not equilibrated; resubmitting");
                win.run(resubmit, queue)?;
                next.push(i);
            }
        }
        active = next;
        g.save()?;
    }
    Ok(())
}

fn run_loop_adaptive_efficiency(
    inner: &Mutex<StageInner>,
    kill: &AtomicBool,
    pause: Duration,
    initial_runtime_ns: f64,
) -> Result<()> {
    {
        let mut g = lock_inner(inner)?;
        let StageInner { windows, queue, .. } = &mut *g;
        for win in windows.iter_mut() {
            win.run(initial_runtime_ns, queue)?;
        }
        g.save()?;
    }

    let mut passes = 0;
    loop {
        if !drain(inner, kill, pause)? {
            return Ok(());
        }
        passes += 1;

        let mut g = lock_inner(inner)?;
        let runtime_constant = g.runtime_constant.ok_or_else(|| {
            Error::Configuration("adaptive efficiency requires a runtime constant".to_string())
        })?;
        let max_total_ns = g.max_runtime_ns * g.ensemble_size as f64;
        let sems = g.gradient_data(false)?.sems(ErrorOrigin::Inter, true);

        let StageInner { windows, queue, .. } = &mut *g;
        let mut resubmitted = false;
        for (i, win) in windows.iter_mut().enumerate() {
            let normalised_sem = sems[i] * win.lam_val_weight;
            let mut predicted_ns = normalised_sem / runtime_constant.sqrt();
            if predicted_ns > max_total_ns {
                info!(
                    lam = win.lam,
                    predicted_ns, "predicted time exceeds the runtime cap; clamping"
                );
                predicted_ns = max_total_ns;
            }
            let actual_ns = win.tot_simtime();
            // Small tolerance to avoid resubmitting over rounding noise.
            if actual_ns < predicted_ns - 0.1 {
                let per_run =
                    ((predicted_ns - actual_ns) / win.sims.len() as f64 * 10.0).round() / 10.0;
                if per_run > 0.0 {
                    let duration =
                        align_to_cycle(per_run, win.sims[0].params.time_per_cycle_ns);
                    info!(
                        lam = win.lam,
                        duration, "window below the efficient sampling time; resubmitting"
                    );
                    win.run(duration, queue)?;
                    resubmitted = true;
                }
            } else {
                info!(
                    lam = win.lam,
                    actual_ns, "window has reached the most efficient run time"
                );
            }
        }

        if !resubmitted {
            g.maximally_efficient = true;
            append_status(&g.base_dir, "stage reached maximum efficiency");
            g.save()?;
            return Ok(());
        }
        g.save()?;
        if passes >= MAX_EFFICIENCY_PASSES {
            warn!(passes, "efficiency loop did not converge; stopping");
            append_status(&g.base_dir, "efficiency loop stopped at the pass bound");
            return Ok(());
        }
    }
}

/// Copy `input` to `output` keeping every header line but only the data
/// rows from `equil_index` onwards.
fn write_equilibrated_data(input: &Path, output: &Path, equil_index: usize) -> Result<()> {
    let contents = fs::read_to_string(input)
        .map_err(|_| Error::parse(input, "output file not found"))?;
    let mut out = String::new();
    let mut data_seen = 0usize;
    for line in contents.lines() {
        if line.starts_with('#') {
            out.push_str(line);
            out.push('\n');
            continue;
        }
        if data_seen >= equil_index {
            out.push_str(line);
            out.push('\n');
        }
        data_seen += 1;
    }
    atomic_write_bytes(output, out.as_bytes())
}

/// Two-sided 95 % critical values of Student's t. Above 30 degrees of
/// freedom the normal approximation is used.
fn t_95(df: usize) -> f64 {
    const TABLE: [f64; 30] = [
        12.706, 4.303, 3.182, 2.776, 2.571, 2.447, 2.365, 2.306, 2.262, 2.228, 2.201, 2.179,
        2.160, 2.145, 2.131, 2.120, 2.110, 2.101, 2.093, 2.086, 2.080, 2.074, 2.069, 2.064,
        2.060, 2.056, 2.052, 2.048, 2.045, 2.042,
    ];
    match df {
        0 => f64::NAN,
        1..=30 => TABLE[df - 1],
        _ => 1.96,
    }
}
