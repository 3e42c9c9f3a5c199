use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

use fep_queue::{Scheduler, SlurmScheduler};
use fep_runner::{
    Calculation, CalculationConfig, CommandEstimator, RunMode, SimulationRunner,
};
use fep_stats::ErrorType;

#[derive(Parser)]
#[command(name = "fep", version = "0.3.0", about = "Ensemble free-energy calculation runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ErTypeArg {
    #[value(name = "sem")]
    Sem,
    #[value(name = "root_var")]
    RootVar,
}

impl From<ErTypeArg> for ErrorType {
    fn from(value: ErTypeArg) -> Self {
        match value {
            ErTypeArg::Sem => ErrorType::Sem,
            ErTypeArg::RootVar => ErrorType::RootVar,
        }
    }
}

#[derive(clap::Args, Clone, Debug)]
struct CalcArgs {
    /// Calculation base directory (engine inputs under <dir>/input).
    base_dir: PathBuf,
    #[arg(long, default_value_t = 5)]
    ensemble_size: usize,
    /// Resubmission block for adaptive equilibration, in ns.
    #[arg(long, default_value_t = 1.0)]
    block_size: f64,
    /// Per-simulation runtime cap for adaptive runs, in ns.
    #[arg(long, default_value_t = 30.0)]
    max_runtime: f64,
    /// Target SEM^2 per unit runtime; switches adaptive runs to the
    /// efficiency loop.
    #[arg(long)]
    runtime_constant: Option<f64>,
    /// Gradient threshold for equilibration detection, kcal mol-1 ns-1.
    #[arg(long)]
    gradient_threshold: Option<f64>,
    /// Poll interval of the stage control loops, in seconds.
    #[arg(long, default_value_t = 60)]
    cycle_pause_seconds: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Set up (if needed) and run every stage to completion.
    Run {
        #[command(flatten)]
        calc: CalcArgs,
        #[arg(long)]
        adaptive: bool,
        /// Runtime per window in ns; required for a non-adaptive run.
        #[arg(long)]
        runtime: Option<f64>,
        /// Initial submission for adaptive runs, in ns.
        #[arg(long, default_value_t = 1.0)]
        initial_runtime: f64,
        /// Run legs and stages one after the other instead of all at once.
        #[arg(long)]
        sequential: bool,
        #[arg(long)]
        json: bool,
    },
    /// Report per-stage and per-window state.
    Status {
        #[command(flatten)]
        calc: CalcArgs,
        #[arg(long)]
        json: bool,
    },
    /// Analyse every stage with an external estimator command.
    Analyse {
        #[command(flatten)]
        calc: CalcArgs,
        /// Estimator program; called per repeat with the run dir and the
        /// data fraction, printing "<free energy> <uncertainty>".
        #[arg(long)]
        estimator: String,
        #[arg(long = "estimator-arg")]
        estimator_args: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Terminate the control loops and any in-flight jobs.
    Kill {
        #[command(flatten)]
        calc: CalcArgs,
        #[arg(long)]
        json: bool,
    },
    /// Run short simulations and rebuild each stage's lambda schedule
    /// from its integrated error curve.
    OptimalLambdas {
        #[command(flatten)]
        calc: CalcArgs,
        /// Length of the short probe simulations, in ns.
        #[arg(long, default_value_t = 0.1)]
        simtime: f64,
        #[arg(long, value_enum, default_value = "sem")]
        er_type: ErTypeArg,
        /// Target integrated error per interval.
        #[arg(long)]
        delta_er: Option<f64>,
        /// Target number of lambda windows.
        #[arg(long)]
        n_lam_vals: Option<usize>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            calc,
            adaptive,
            runtime,
            initial_runtime,
            sequential,
            json,
        } => {
            let mut calculation = build_calculation(&calc)?;
            let mode = RunMode::from_args(
                adaptive,
                runtime,
                calc.runtime_constant,
                initial_runtime,
            )?;
            calculation.run(mode, !sequential)?;
            let tot_simtime = calculation.tot_simtime();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "base_dir": calc.base_dir.display().to_string(),
                    "mode": format!("{:?}", mode),
                    "parallel": !sequential,
                    "tot_simtime_ns": tot_simtime,
                    "legs": summaries_to_json(&calculation)?,
                })));
            }
            println!("base_dir: {}", calc.base_dir.display());
            println!("tot_simtime_ns: {:.3}", tot_simtime);
            print_summaries(&calculation)?;
        }
        Commands::Status { calc, json } => {
            let calculation = build_calculation(&calc)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "base_dir": calc.base_dir.display().to_string(),
                    "tot_simtime_ns": calculation.tot_simtime(),
                    "legs": summaries_to_json(&calculation)?,
                })));
            }
            println!("base_dir: {}", calc.base_dir.display());
            println!("tot_simtime_ns: {:.3}", calculation.tot_simtime());
            print_summaries(&calculation)?;
        }
        Commands::Analyse {
            calc,
            estimator,
            estimator_args,
            json,
        } => {
            let calculation = build_calculation(&calc)?;
            let estimator = CommandEstimator::new(estimator, estimator_args);
            let mut results = Vec::new();
            for leg in calculation.legs() {
                for stage in leg.stages() {
                    let estimates = stage.analyse(&estimator)?;
                    results.push((leg.leg_type, stage.stage_type(), estimates));
                }
            }
            if json {
                let payload: Vec<Value> = results
                    .iter()
                    .map(|(leg_type, stage_type, estimates)| {
                        json!({
                            "leg": leg_type.to_string(),
                            "stage": stage_type.to_string(),
                            "estimates": estimates
                                .iter()
                                .map(|e| json!({
                                    "delta_g": e.delta_g,
                                    "uncertainty": e.uncertainty,
                                }))
                                .collect::<Vec<Value>>(),
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "analyse",
                    "base_dir": calc.base_dir.display().to_string(),
                    "results": payload,
                })));
            }
            for (leg_type, stage_type, estimates) in &results {
                println!("{}/{}:", leg_type, stage_type);
                for (i, e) in estimates.iter().enumerate() {
                    println!(
                        "  run_{:02}: {:.3} +/- {:.3} kcal mol-1",
                        i + 1,
                        e.delta_g,
                        e.uncertainty
                    );
                }
            }
        }
        Commands::Kill { calc, json } => {
            let mut calculation = build_calculation(&calc)?;
            calculation.kill()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "kill",
                    "base_dir": calc.base_dir.display().to_string(),
                })));
            }
            println!("killed: {}", calc.base_dir.display());
        }
        Commands::OptimalLambdas {
            calc,
            simtime,
            er_type,
            delta_er,
            n_lam_vals,
            json,
        } => {
            let mut calculation = build_calculation(&calc)?;
            let schedules =
                calculation.optimal_lam_vals(simtime, er_type.into(), delta_er, n_lam_vals)?;
            if json {
                let payload: Vec<Value> = schedules
                    .iter()
                    .map(|(leg_type, stage_type, vals)| {
                        json!({
                            "leg": leg_type.to_string(),
                            "stage": stage_type.to_string(),
                            "lam_vals": vals,
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "optimal-lambdas",
                    "base_dir": calc.base_dir.display().to_string(),
                    "schedules": payload,
                })));
            }
            for (leg_type, stage_type, vals) in &schedules {
                println!("{}/{}: {:?}", leg_type, stage_type, vals);
            }
        }
    }
    Ok(None)
}

fn build_calculation(args: &CalcArgs) -> Result<Calculation> {
    let mut config = CalculationConfig::new(args.ensemble_size);
    config.block_size_ns = args.block_size;
    config.max_runtime_ns = args.max_runtime;
    config.runtime_constant = args.runtime_constant;
    config.cycle_pause = Duration::from_secs(args.cycle_pause_seconds);
    if let fep_stats::EquilDetection::BlockGradient {
        gradient_threshold, ..
    } = &mut config.equil_detection
    {
        *gradient_threshold = args.gradient_threshold;
    }
    let mut calculation = Calculation::new(config, &args.base_dir)?;
    calculation.setup(|| Box::new(SlurmScheduler::new()) as Box<dyn Scheduler>)?;
    Ok(calculation)
}

fn summaries_to_json(calculation: &Calculation) -> Result<Value> {
    let mut legs = Vec::new();
    for (leg_type, stages) in calculation.summaries()? {
        legs.push(json!({
            "leg": leg_type.to_string(),
            "stages": serde_json::to_value(&stages)?,
        }));
    }
    Ok(Value::Array(legs))
}

fn print_summaries(calculation: &Calculation) -> Result<()> {
    for (leg_type, stages) in calculation.summaries()? {
        for stage in &stages {
            println!(
                "{}/{}: {:?}, {:.3} ns simulated",
                leg_type, stage.stage_type, stage.status, stage.tot_simtime_ns
            );
            for win in &stage.windows {
                let mut note = String::new();
                if win.equilibrated {
                    note = format!(
                        ", equilibrated at {:.3} ns",
                        win.equil_time_ns.unwrap_or(0.0)
                    );
                } else if win.max_runtime_exceeded {
                    note = ", retired at the runtime cap".to_string();
                }
                println!(
                    "  lambda {:.3}: {:.3} ns per run{}",
                    win.lam, win.simtime_per_run_ns, note
                );
            }
        }
    }
    Ok(())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Status { json, .. }
        | Commands::Analyse { json, .. }
        | Commands::Kill { json, .. }
        | Commands::OptimalLambdas { json, .. } => *json,
    }
}
