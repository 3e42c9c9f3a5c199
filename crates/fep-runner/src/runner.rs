use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::Utc;

use fep_core::Result;

/// Shared lifecycle of every node in the runner hierarchy. Composite nodes
/// fan these calls out to their children and aggregate the results.
pub trait SimulationRunner {
    /// Directory holding this node's persisted state and status log.
    fn base_dir(&self) -> &Path;

    /// Whether any work below this node is still in flight.
    fn is_running(&self) -> bool;

    /// Total simulated time below this node, in ns.
    fn tot_simtime(&self) -> f64;

    /// Stop the node's control loop and terminate in-flight jobs.
    /// Idempotent; killing an idle node is a no-op.
    fn kill(&mut self) -> Result<()>;

    /// Persist this node's full state (and its children's) so a later
    /// process can resume from the last fully written record.
    fn save(&self) -> Result<()>;
}

/// Append a timestamped line to the node's human-readable status log.
/// Best-effort: status logging never fails the operation that triggered it.
pub fn append_status(base_dir: &Path, message: &str) {
    let path = base_dir.join("status.log");
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "{} {}", Utc::now().to_rfc3339(), message);
    }
}
