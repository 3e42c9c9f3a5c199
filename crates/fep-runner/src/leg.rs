//! A leg composes the stages of one thermodynamic cycle branch. It holds
//! no control logic of its own; everything fans out to the stages.

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use fep_core::{atomic_write_bytes, Result};

use crate::runner::SimulationRunner;
use crate::stage::{RunMode, Stage, StageSummary};

const STATE_FILE: &str = "leg_state.json";
const STATE_VERSION: &str = "leg_state_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegType {
    Bound,
    Free,
}

impl std::fmt::Display for LegType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LegType::Bound => "bound",
            LegType::Free => "free",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LegState {
    schema_version: String,
    leg_type: LegType,
}

pub struct Leg {
    pub leg_type: LegType,
    stages: Vec<Stage>,
    base_dir: PathBuf,
}

impl Leg {
    pub fn new(leg_type: LegType, base_dir: &Path, stages: Vec<Stage>) -> Result<Leg> {
        fs::create_dir_all(base_dir)?;
        let leg = Leg {
            leg_type,
            stages,
            base_dir: base_dir.to_path_buf(),
        };
        leg.save()?;
        Ok(leg)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stages_mut(&mut self) -> &mut [Stage] {
        &mut self.stages
    }

    /// Start every stage's control loop without waiting.
    pub fn start(&mut self, mode: RunMode) -> Result<()> {
        for stage in &mut self.stages {
            stage.run(mode)?;
        }
        Ok(())
    }

    /// Join every stage's control loop, surfacing the first error.
    pub fn wait(&mut self) -> Result<()> {
        for stage in &mut self.stages {
            stage.wait()?;
        }
        Ok(())
    }

    /// Run all stages to completion: everything at once (`parallel`) or
    /// one stage after the other.
    pub fn run(&mut self, mode: RunMode, parallel: bool) -> Result<()> {
        if parallel {
            self.start(mode)?;
            self.wait()
        } else {
            for stage in &mut self.stages {
                stage.run(mode)?;
                stage.wait()?;
            }
            Ok(())
        }
    }

    pub fn summaries(&self) -> Result<Vec<StageSummary>> {
        self.stages.iter().map(|s| s.summary()).collect()
    }
}

impl SimulationRunner for Leg {
    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn is_running(&self) -> bool {
        self.stages.iter().any(|s| s.is_running())
    }

    fn tot_simtime(&self) -> f64 {
        self.stages.par_iter().map(|s| s.tot_simtime()).sum()
    }

    fn kill(&mut self) -> Result<()> {
        for stage in &mut self.stages {
            stage.kill()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        for stage in &self.stages {
            stage.save()?;
        }
        let state = LegState {
            schema_version: STATE_VERSION.to_string(),
            leg_type: self.leg_type,
        };
        let bytes = serde_json::to_vec_pretty(&state)?;
        atomic_write_bytes(&self.base_dir.join(STATE_FILE), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageConfig, StageStatus, StageType};
    use crate::{ENGINE_CONFIG, ENGINE_LAUNCHER};
    use chrono::Utc;
    use fep_queue::testing::FakeScheduler;
    use std::thread;
    use std::time::Duration;

    const CONFIG: &str = "\
nmoves = 25000
ncycles = 5
timestep = 4.0
energy frequency = 250
";

    fn setup() -> (PathBuf, Leg, FakeScheduler) {
        let root = std::env::temp_dir().join(format!(
            "fep_leg_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let input = root.join("input");
        fs::create_dir_all(&input).expect("input dir");
        fs::write(input.join(ENGINE_CONFIG), CONFIG).expect("config");
        fs::write(input.join(ENGINE_LAUNCHER), "#!/bin/sh\n").expect("launcher");

        let scheduler = FakeScheduler::default();
        let leg_dir = root.join("bound");
        let mut stages = Vec::new();
        for stage_type in [StageType::Discharge, StageType::Vanish] {
            let mut config = StageConfig::new(stage_type, vec![0.0, 1.0], 1);
            config.cycle_pause = Duration::from_millis(20);
            stages.push(
                Stage::new(
                    config,
                    &leg_dir.join(stage_type.to_string()),
                    &input,
                    Box::new(scheduler.clone()),
                )
                .expect("stage"),
            );
        }
        let leg = Leg::new(LegType::Bound, &leg_dir, stages).expect("leg");
        (root, leg, scheduler)
    }

    /// Drain the fake scheduler in the background until `done` flips.
    fn spawn_finisher(scheduler: FakeScheduler) -> std::sync::mpsc::Sender<()> {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        thread::spawn(move || loop {
            scheduler.finish_all();
            if rx.try_recv().is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        });
        tx
    }

    #[test]
    fn parallel_run_settles_every_stage() {
        let (root, mut leg, scheduler) = setup();
        let stop = spawn_finisher(scheduler.clone());
        leg.run(RunMode::NonAdaptive { runtime_ns: 0.2 }, true)
            .expect("run");
        let _ = stop.send(());

        assert!(!leg.is_running());
        for summary in leg.summaries().expect("summaries") {
            assert_eq!(summary.status, StageStatus::Settled);
        }
        // Two stages, two windows each, one repeat: 0.8 ns in total.
        assert!((leg.tot_simtime() - 0.8).abs() < 1e-9);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn sequential_run_settles_every_stage() {
        let (root, mut leg, scheduler) = setup();
        let stop = spawn_finisher(scheduler.clone());
        leg.run(RunMode::NonAdaptive { runtime_ns: 0.1 }, false)
            .expect("run");
        let _ = stop.send(());

        for summary in leg.summaries().expect("summaries") {
            assert_eq!(summary.status, StageStatus::Settled);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn kill_fans_out_to_idle_stages_as_a_noop() {
        let (root, mut leg, scheduler) = setup();
        leg.kill().expect("kill");
        assert!(scheduler.submitted().is_empty());
        assert!(!leg.is_running());
        let _ = fs::remove_dir_all(root);
    }
}
