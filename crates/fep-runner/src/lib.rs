//! Orchestration of an ensemble alchemical free-energy calculation: a
//! four-level runner hierarchy (calculation, leg, stage, lambda window,
//! repeat simulation) submitted through a per-stage virtual queue, with
//! adaptive control loops deciding how much further sampling each lambda
//! window needs.

pub mod calculation;
pub mod estimator;
pub mod leg;
pub mod runner;
pub mod simulation;
pub mod stage;
pub mod window;

pub use calculation::{Calculation, CalculationConfig, LegSpec, StageSpec};
pub use estimator::{CommandEstimator, FreeEnergyEstimate, FreeEnergyEstimator};
pub use leg::{Leg, LegType};
pub use runner::SimulationRunner;
pub use simulation::Simulation;
pub use stage::{
    RunMode, Stage, StageConfig, StageStatus, StageSummary, StageType, WindowSummary,
};
pub use window::LamWindow;

/// Name of the engine configuration file expected in every input dir.
pub const ENGINE_CONFIG: &str = "engine.cfg";
/// Launcher script invoked by the scheduler for one repeat run.
pub const ENGINE_LAUNCHER: &str = "run_engine.sh";
/// Raw per-repeat output stream produced by the engine.
pub const SIMFILE: &str = "simfile.dat";
/// Post-equilibration slice of the output stream, written by analysis.
pub const SIMFILE_EQUILIBRATED: &str = "simfile_equilibrated.dat";
