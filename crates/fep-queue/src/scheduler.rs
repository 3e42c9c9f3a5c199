use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fep_core::{Error, Result};

/// Identifier assigned by the real batch scheduler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SchedulerJobId(pub u64);

impl std::fmt::Display for SchedulerJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The real batch scheduler behind the virtual queue. Implementations own
/// the submission/polling syntax; the orchestrator only sees job ids.
pub trait Scheduler: Send {
    fn submit(&mut self, command: &str) -> Result<SchedulerJobId>;
    fn active_jobs(&mut self) -> Result<Vec<SchedulerJobId>>;
    fn cancel(&mut self, id: SchedulerJobId) -> Result<()>;
}

/// SLURM backend: sbatch/squeue/scancel via the shell.
pub struct SlurmScheduler {
    submit_prefix: Vec<String>,
}

impl SlurmScheduler {
    pub fn new() -> Self {
        SlurmScheduler {
            submit_prefix: vec!["sbatch".to_string(), "--parsable".to_string()],
        }
    }
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for SlurmScheduler {
    fn submit(&mut self, command: &str) -> Result<SchedulerJobId> {
        let mut cmd = Command::new(&self.submit_prefix[0]);
        cmd.args(&self.submit_prefix[1..]);
        cmd.args(command.split_whitespace());
        let output = cmd
            .output()
            .map_err(|e| Error::Scheduler(format!("failed to run sbatch: {}", e)))?;
        if !output.status.success() {
            return Err(Error::Scheduler(format!(
                "sbatch exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        // --parsable prints "<jobid>[;cluster]".
        let id_str = stdout.trim().split(';').next().unwrap_or("");
        let id = id_str
            .parse::<u64>()
            .map_err(|_| Error::Scheduler(format!("unparseable sbatch output '{}'", stdout.trim())))?;
        debug!(id, "sbatch accepted job");
        Ok(SchedulerJobId(id))
    }

    fn active_jobs(&mut self) -> Result<Vec<SchedulerJobId>> {
        let output = Command::new("squeue")
            .args(["-h", "-u", &whoami(), "-o", "%A"])
            .output()
            .map_err(|e| Error::Scheduler(format!("failed to run squeue: {}", e)))?;
        if !output.status.success() {
            return Err(Error::Scheduler(format!(
                "squeue exited with {}",
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut ids = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(id) = line.parse::<u64>() {
                ids.push(SchedulerJobId(id));
            }
        }
        Ok(ids)
    }

    fn cancel(&mut self, id: SchedulerJobId) -> Result<()> {
        let status = Command::new("scancel")
            .arg(id.to_string())
            .status()
            .map_err(|e| Error::Scheduler(format!("failed to run scancel: {}", e)))?;
        if !status.success() {
            return Err(Error::Scheduler(format!(
                "scancel {} exited with {}",
                id, status
            )));
        }
        Ok(())
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "nobody".to_string())
}
