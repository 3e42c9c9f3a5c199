//! End-to-end persistence behaviour: a stage rebuilt from its persisted
//! records picks up where the previous process left off, without
//! resubmitting work that already ran.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use chrono::Utc;

use fep_queue::testing::FakeScheduler;
use fep_queue::Scheduler;
use fep_runner::{
    RunMode, SimulationRunner, Stage, StageConfig, StageStatus, StageType, ENGINE_CONFIG,
    ENGINE_LAUNCHER,
};

const CONFIG: &str = "\
nmoves = 25000
ncycles = 5
timestep = 4.0
energy frequency = 250
";

fn setup_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "fep_persist_{}_{}",
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let input = root.join("input");
    fs::create_dir_all(&input).expect("input dir");
    fs::write(input.join(ENGINE_CONFIG), CONFIG).expect("config");
    fs::write(input.join(ENGINE_LAUNCHER), "#!/bin/sh\n").expect("launcher");
    root
}

fn build_stage(root: &PathBuf, scheduler: &FakeScheduler) -> Stage {
    let mut config = StageConfig::new(StageType::Discharge, vec![0.0, 0.5, 1.0], 2);
    config.cycle_pause = Duration::from_millis(20);
    Stage::new(
        config,
        &root.join("discharge"),
        &root.join("input"),
        Box::new(scheduler.clone()) as Box<dyn Scheduler>,
    )
    .expect("stage")
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn rebuilt_stage_resumes_from_persisted_state() {
    let root = setup_root();
    let scheduler = FakeScheduler::default();
    {
        let mut stage = build_stage(&root, &scheduler);
        stage
            .run(RunMode::NonAdaptive { runtime_ns: 0.3 })
            .expect("run");
        wait_for("submissions", || scheduler.submitted().len() == 6);
        scheduler.finish_all();
        stage.wait().expect("wait");
        assert_eq!(stage.status().expect("status"), StageStatus::Settled);
    }

    // A fresh process with a fresh scheduler connection: simulated time
    // and per-window state must be read back, stale job ids must
    // reconcile as finished rather than erroring.
    let scheduler = FakeScheduler::default();
    let mut stage = build_stage(&root, &scheduler);
    assert_eq!(stage.status().expect("status"), StageStatus::Idle);
    assert!((stage.tot_simtime() - 1.8).abs() < 1e-9);
    let summary = stage.summary().expect("summary");
    for win in &summary.windows {
        assert!((win.simtime_per_run_ns - 0.3).abs() < 1e-9);
    }

    // Further work accumulates on top of the persisted totals.
    stage
        .run(RunMode::NonAdaptive { runtime_ns: 0.1 })
        .expect("second run");
    wait_for("resubmissions", || scheduler.submitted().len() == 6);
    scheduler.finish_all();
    stage.wait().expect("wait");
    assert!((stage.tot_simtime() - 2.4).abs() < 1e-9);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn killing_a_resumed_stage_is_a_noop() {
    let root = setup_root();
    let scheduler = FakeScheduler::default();
    {
        let mut stage = build_stage(&root, &scheduler);
        stage
            .run(RunMode::NonAdaptive { runtime_ns: 0.3 })
            .expect("run");
        wait_for("submissions", || scheduler.submitted().len() == 6);
        scheduler.finish_all();
        stage.wait().expect("wait");
    }

    // A fresh process reloads the queue's job table along with the window
    // state; killing finds only finished jobs and must stay silent.
    let scheduler = FakeScheduler::default();
    let mut stage = build_stage(&root, &scheduler);
    stage.kill().expect("kill after resume");
    assert_eq!(stage.status().expect("status"), StageStatus::Idle);
    assert!(scheduler.submitted().is_empty());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn rebuilding_twice_without_running_changes_nothing() {
    let root = setup_root();
    let scheduler = FakeScheduler::default();
    let first = build_stage(&root, &scheduler);
    let before = first.summary().expect("summary");
    drop(first);

    let second = build_stage(&root, &scheduler);
    let after = second.summary().expect("summary");
    assert_eq!(before.windows.len(), after.windows.len());
    for (a, b) in before.windows.iter().zip(after.windows.iter()) {
        assert_eq!(a.lam, b.lam);
        assert_eq!(a.equilibrated, b.equilibrated);
        assert!((a.simtime_per_run_ns - b.simtime_per_run_ns).abs() < 1e-12);
    }
    assert!(scheduler.submitted().is_empty());
    let _ = fs::remove_dir_all(root);
}
