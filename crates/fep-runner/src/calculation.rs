//! The top of the runner hierarchy: one calculation composed of legs,
//! each composed of stages. Setup materialises the directory tree; run,
//! kill and aggregation fan out through the legs.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use fep_core::simfile;
use fep_core::{atomic_write_bytes, Error, Result};
use fep_queue::Scheduler;
use fep_stats::{EquilDetection, ErrorType};

use crate::leg::{Leg, LegType};
use crate::runner::SimulationRunner;
use crate::stage::{RunMode, Stage, StageConfig, StageSummary, StageType};
use crate::{ENGINE_CONFIG, ENGINE_LAUNCHER};

const STATE_FILE: &str = "calculation_state.json";
const STATE_VERSION: &str = "calculation_state_v1";

#[derive(Debug, Clone)]
pub struct StageSpec {
    pub stage_type: StageType,
    /// Explicit lambda schedule; when absent the `lambda array` from the
    /// engine config is used.
    pub lam_vals: Option<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct LegSpec {
    pub leg_type: LegType,
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone)]
pub struct CalculationConfig {
    pub ensemble_size: usize,
    pub block_size_ns: f64,
    pub equil_detection: EquilDetection,
    pub runtime_constant: Option<f64>,
    pub max_runtime_ns: f64,
    pub cycle_pause: Duration,
    pub legs: Vec<LegSpec>,
}

impl CalculationConfig {
    /// Standard absolute binding free-energy layout: the bound leg runs
    /// restrain, discharge and vanish stages, the free leg discharge and
    /// vanish.
    pub fn new(ensemble_size: usize) -> Self {
        let spec = |stage_type| StageSpec {
            stage_type,
            lam_vals: None,
        };
        CalculationConfig {
            ensemble_size,
            block_size_ns: 1.0,
            equil_detection: EquilDetection::BlockGradient {
                block_size_ns: 1.0,
                gradient_threshold: None,
            },
            runtime_constant: None,
            max_runtime_ns: 30.0,
            cycle_pause: Duration::from_secs(60),
            legs: vec![
                LegSpec {
                    leg_type: LegType::Bound,
                    stages: vec![
                        spec(StageType::Restrain),
                        spec(StageType::Discharge),
                        spec(StageType::Vanish),
                    ],
                },
                LegSpec {
                    leg_type: LegType::Free,
                    stages: vec![spec(StageType::Discharge), spec(StageType::Vanish)],
                },
            ],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CalculationState {
    schema_version: String,
    setup_complete: bool,
}

pub struct Calculation {
    config: CalculationConfig,
    legs: Vec<Leg>,
    setup_complete: bool,
    base_dir: PathBuf,
    input_dir: PathBuf,
}

impl Calculation {
    /// Bind a calculation to `base_dir`; engine inputs are expected under
    /// `base_dir/input`. Whether setup already ran is read back from the
    /// persisted record, but the runner tree itself is only materialised
    /// by `setup`.
    pub fn new(config: CalculationConfig, base_dir: &Path) -> Result<Calculation> {
        if config.ensemble_size == 0 {
            return Err(Error::Configuration(
                "ensemble size must be at least 1".to_string(),
            ));
        }
        if config.legs.is_empty() {
            return Err(Error::Configuration(
                "a calculation requires at least one leg".to_string(),
            ));
        }
        fs::create_dir_all(base_dir)?;

        let mut setup_complete = false;
        let state_path = base_dir.join(STATE_FILE);
        if state_path.is_file() {
            let state: CalculationState = serde_json::from_slice(&fs::read(&state_path)?)?;
            setup_complete = state.setup_complete;
        }

        Ok(Calculation {
            input_dir: base_dir.join("input"),
            base_dir: base_dir.to_path_buf(),
            config,
            legs: Vec::new(),
            setup_complete,
        })
    }

    /// Materialise the leg and stage tree, handing each stage a scheduler
    /// of its own. Running setup on an already set-up calculation rebuilds
    /// the in-memory tree from the persisted records instead of starting
    /// over; a second call in the same process is a no-op.
    pub fn setup(
        &mut self,
        mut make_scheduler: impl FnMut() -> Box<dyn Scheduler>,
    ) -> Result<()> {
        if self.setup_complete && !self.legs.is_empty() {
            info!("setup already complete; nothing to do");
            return Ok(());
        }
        for required in [ENGINE_CONFIG, ENGINE_LAUNCHER] {
            if !self.input_dir.join(required).is_file() {
                return Err(Error::Configuration(format!(
                    "required input file {} not found in {}",
                    required,
                    self.input_dir.display()
                )));
            }
        }

        let resuming = self.setup_complete;
        let mut legs = Vec::with_capacity(self.config.legs.len());
        for leg_spec in &self.config.legs {
            let leg_dir = self.base_dir.join(leg_spec.leg_type.to_string());
            let mut stages = Vec::with_capacity(leg_spec.stages.len());
            for spec in &leg_spec.stages {
                let lam_vals = match &spec.lam_vals {
                    Some(vals) => vals.clone(),
                    None => simfile::read_lambda_array(&self.input_dir.join(ENGINE_CONFIG))?,
                };
                let mut stage_config =
                    StageConfig::new(spec.stage_type, lam_vals, self.config.ensemble_size);
                stage_config.block_size_ns = self.config.block_size_ns;
                stage_config.equil_detection = self.config.equil_detection;
                stage_config.runtime_constant = self.config.runtime_constant;
                stage_config.max_runtime_ns = self.config.max_runtime_ns;
                stage_config.cycle_pause = self.config.cycle_pause;
                stages.push(Stage::new(
                    stage_config,
                    &leg_dir.join(spec.stage_type.to_string()),
                    &self.input_dir,
                    make_scheduler(),
                )?);
            }
            legs.push(Leg::new(leg_spec.leg_type, &leg_dir, stages)?);
        }
        self.legs = legs;
        if resuming {
            info!("reloaded existing calculation state");
        } else {
            info!(legs = self.legs.len(), "calculation set up");
        }
        self.setup_complete = true;
        self.save()
    }

    pub fn legs(&self) -> &[Leg] {
        &self.legs
    }

    pub fn legs_mut(&mut self) -> &mut [Leg] {
        &mut self.legs
    }

    /// Run every stage to completion: all at once (`parallel`) or leg by
    /// leg, stage by stage.
    pub fn run(&mut self, mode: RunMode, parallel: bool) -> Result<()> {
        if !self.setup_complete || self.legs.is_empty() {
            return Err(Error::State(
                "setup has not been run for this calculation".to_string(),
            ));
        }
        if parallel {
            for leg in &mut self.legs {
                leg.start(mode)?;
            }
            for leg in &mut self.legs {
                leg.wait()?;
            }
        } else {
            for leg in &mut self.legs {
                leg.run(mode, false)?;
            }
        }
        Ok(())
    }

    /// Short non-adaptive run at the current schedule, then rebuild every
    /// stage's windows from its integrated error curve. Returns the new
    /// schedule per stage.
    pub fn optimal_lam_vals(
        &mut self,
        simtime_ns: f64,
        er_type: ErrorType,
        delta_er: Option<f64>,
        n_lam_vals: Option<usize>,
    ) -> Result<Vec<(LegType, StageType, Vec<f64>)>> {
        info!(
            simtime_ns,
            "running short simulations to determine optimal lambda values"
        );
        self.run(RunMode::NonAdaptive {
            runtime_ns: simtime_ns,
        }, true)?;

        let mut schedules = Vec::new();
        for leg in &mut self.legs {
            let leg_type = leg.leg_type;
            for stage in leg.stages_mut() {
                let stage_type = stage.stage_type();
                let vals = stage.optimal_lam_vals(er_type, delta_er, n_lam_vals)?;
                info!(%leg_type, %stage_type, ?vals, "optimal lambda values");
                stage.update(&vals)?;
                schedules.push((leg_type, stage_type, vals));
            }
        }
        self.save()?;
        Ok(schedules)
    }

    pub fn summaries(&self) -> Result<Vec<(LegType, Vec<StageSummary>)>> {
        self.legs
            .iter()
            .map(|leg| Ok((leg.leg_type, leg.summaries()?)))
            .collect()
    }
}

impl SimulationRunner for Calculation {
    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn is_running(&self) -> bool {
        self.legs.iter().any(|leg| leg.is_running())
    }

    fn tot_simtime(&self) -> f64 {
        self.legs.par_iter().map(|leg| leg.tot_simtime()).sum()
    }

    fn kill(&mut self) -> Result<()> {
        for leg in &mut self.legs {
            leg.kill()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        for leg in &self.legs {
            leg.save()?;
        }
        let state = CalculationState {
            schema_version: STATE_VERSION.to_string(),
            setup_complete: self.setup_complete,
        };
        let bytes = serde_json::to_vec_pretty(&state)?;
        atomic_write_bytes(&self.base_dir.join(STATE_FILE), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fep_queue::testing::FakeScheduler;
    use std::thread;

    const CONFIG: &str = "\
nmoves = 25000
ncycles = 5
timestep = 4.0
energy frequency = 250
lambda array = 0.0, 0.5, 1.0
";

    fn small_config() -> CalculationConfig {
        let mut config = CalculationConfig::new(1);
        config.cycle_pause = Duration::from_millis(20);
        config.legs = vec![LegSpec {
            leg_type: LegType::Free,
            stages: vec![StageSpec {
                stage_type: StageType::Vanish,
                lam_vals: None,
            }],
        }];
        config
    }

    fn setup_inputs() -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "fep_calc_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let input = root.join("input");
        fs::create_dir_all(&input).expect("input dir");
        fs::write(input.join(ENGINE_CONFIG), CONFIG).expect("config");
        fs::write(input.join(ENGINE_LAUNCHER), "#!/bin/sh\n").expect("launcher");
        root
    }

    #[test]
    fn run_before_setup_is_a_state_error() {
        let root = setup_inputs();
        let mut calc = Calculation::new(small_config(), &root).expect("calc");
        let err = calc
            .run(RunMode::NonAdaptive { runtime_ns: 0.1 }, true)
            .expect_err("setup missing");
        assert!(matches!(err, Error::State(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn setup_materialises_the_tree_and_is_idempotent() {
        let root = setup_inputs();
        let scheduler = FakeScheduler::default();
        let mut calc = Calculation::new(small_config(), &root).expect("calc");
        let make = || Box::new(scheduler.clone()) as Box<dyn Scheduler>;
        calc.setup(make).expect("setup");

        // The schedule comes from the engine config's lambda array.
        assert!(root.join("free/vanish/output/lambda_0.500").is_dir());
        assert_eq!(calc.legs().len(), 1);

        // A second setup in the same process changes nothing.
        calc.setup(make).expect("second setup");
        assert_eq!(calc.legs().len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn setup_without_input_files_is_a_configuration_error() {
        let root = setup_inputs();
        fs::remove_file(root.join("input").join(ENGINE_LAUNCHER)).expect("remove");
        let scheduler = FakeScheduler::default();
        let mut calc = Calculation::new(small_config(), &root).expect("calc");
        let err = calc
            .setup(|| Box::new(scheduler.clone()) as Box<dyn Scheduler>)
            .expect_err("missing launcher");
        assert!(matches!(err, Error::Configuration(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn non_adaptive_run_aggregates_simulated_time() {
        let root = setup_inputs();
        let scheduler = FakeScheduler::default();
        let mut calc = Calculation::new(small_config(), &root).expect("calc");
        calc.setup(|| Box::new(scheduler.clone()) as Box<dyn Scheduler>)
            .expect("setup");

        let finisher = scheduler.clone();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        thread::spawn(move || loop {
            finisher.finish_all();
            if rx.try_recv().is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        });
        calc.run(RunMode::NonAdaptive { runtime_ns: 0.2 }, true)
            .expect("run");
        let _ = tx.send(());

        // One stage, three windows, one repeat.
        assert!((calc.tot_simtime() - 0.6).abs() < 1e-9);
        assert!(!calc.is_running());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn resumed_calculation_reloads_persisted_state() {
        let root = setup_inputs();
        let scheduler = FakeScheduler::default();
        {
            let mut calc = Calculation::new(small_config(), &root).expect("calc");
            calc.setup(|| Box::new(scheduler.clone()) as Box<dyn Scheduler>)
                .expect("setup");
        }
        // A fresh process: the record says setup ran, and setup rebuilds
        // the tree from the persisted state.
        let mut calc = Calculation::new(small_config(), &root).expect("reload");
        assert!(calc.legs().is_empty());
        calc.setup(|| Box::new(scheduler.clone()) as Box<dyn Scheduler>)
            .expect("re-setup");
        assert_eq!(calc.legs().len(), 1);
        let _ = fs::remove_dir_all(root);
    }
}
