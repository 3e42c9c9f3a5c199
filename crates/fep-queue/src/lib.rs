//! In-process model of a batch-scheduler queue. The virtual queue hands out
//! synthetic job ids immediately on submission and reconciles its view of
//! the world against the real scheduler on `update()`. Callers must treat a
//! job's status as authoritative only straight after a reconciliation. The
//! job table is persisted after every mutation, so a fresh process resumes
//! with the previous submissions instead of an empty queue.

mod scheduler;

pub use scheduler::{Scheduler, SchedulerJobId, SlurmScheduler};

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fep_core::{atomic_write_bytes, ensure_dir, Error, Result};

const STATE_FILE: &str = "virtual_queue.json";
const STATE_VERSION: &str = "virtual_queue_v1";

/// Synthetic identifier owned by the virtual queue. Simulations hold only
/// this id, never queue-internal state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Killed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub status: JobStatus,
    pub scheduler_id: SchedulerJobId,
}

impl Job {
    fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Queued | JobStatus::Running)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueState {
    schema_version: String,
    next_id: u64,
    jobs: Vec<Job>,
}

/// One virtual queue per stage; never shared across stages.
pub struct VirtualQueue {
    scheduler: Box<dyn Scheduler>,
    jobs: BTreeMap<JobId, Job>,
    next_id: u64,
    log_path: PathBuf,
    state_path: PathBuf,
}

impl VirtualQueue {
    /// A persisted job table in `log_dir` is reloaded, so a rebuilt queue
    /// knows the previous process's submissions; their statuses are stale
    /// until the next `update()` reconciles them against the scheduler.
    pub fn new(scheduler: Box<dyn Scheduler>, log_dir: &std::path::Path) -> Result<Self> {
        ensure_dir(log_dir)?;
        let state_path = log_dir.join(STATE_FILE);
        let mut jobs = BTreeMap::new();
        let mut next_id = 1;
        if state_path.is_file() {
            let state: QueueState = serde_json::from_slice(&fs::read(&state_path)?)?;
            next_id = state.next_id;
            for job in state.jobs {
                jobs.insert(job.id, job);
            }
        }
        Ok(VirtualQueue {
            scheduler,
            jobs,
            next_id,
            log_path: log_dir.join("virtual_queue.log"),
            state_path,
        })
    }

    /// Enqueue a command for execution. Returns a synthetic id immediately;
    /// never blocks on job completion.
    pub fn submit(&mut self, command: &str) -> Result<JobId> {
        let scheduler_id = self.scheduler.submit(command)?;
        let id = JobId(self.next_id);
        self.next_id += 1;
        self.jobs.insert(
            id,
            Job {
                id,
                command: command.to_string(),
                status: JobStatus::Queued,
                scheduler_id,
            },
        );
        info!(%id, %scheduler_id, command, "submitted job");
        self.append_log(&format!("submitted {} as scheduler job {}", id, scheduler_id));
        self.save()?;
        Ok(id)
    }

    /// Reconcile against the real scheduler. On a scheduler failure the
    /// internal state is left untouched and the error is returned so the
    /// caller can retry at the next poll cycle; a transient failure is never
    /// treated as job completion.
    pub fn update(&mut self) -> Result<()> {
        let active = self.scheduler.active_jobs()?;
        let mut changed = false;
        for job in self.jobs.values_mut() {
            if !job.is_active() {
                continue;
            }
            let status = if active.contains(&job.scheduler_id) {
                JobStatus::Running
            } else {
                debug!(id = %job.id, "job left the scheduler queue");
                JobStatus::Finished
            };
            if job.status != status {
                job.status = status;
                changed = true;
            }
        }
        if changed {
            self.save()?;
        }
        Ok(())
    }

    /// Request termination. Silently succeeds if the job already finished;
    /// termination races are expected, not errors.
    pub fn kill(&mut self, id: JobId) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::JobControl(format!("unknown job {}", id)))?;
        if !job.is_active() {
            debug!(%id, "kill requested for job that already finished");
            return Ok(());
        }
        if let Err(e) = self.scheduler.cancel(job.scheduler_id) {
            // The job may have completed between our last update and the
            // cancel request.
            warn!(%id, error = %e, "cancel failed; treating as finished");
        }
        job.status = JobStatus::Killed;
        self.append_log(&format!("killed {}", id));
        self.save()?;
        Ok(())
    }

    /// Membership test for "is this job still active". Authoritative only
    /// immediately after `update()`.
    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.get(&id).map(Job::is_active).unwrap_or(false)
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn active_count(&self) -> usize {
        self.jobs.values().filter(|j| j.is_active()).count()
    }

    fn save(&self) -> Result<()> {
        let state = QueueState {
            schema_version: STATE_VERSION.to_string(),
            next_id: self.next_id,
            jobs: self.jobs.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&state)?;
        atomic_write_bytes(&self.state_path, &bytes)
    }

    fn append_log(&self, line: &str) {
        let stamped = format!("{} {}\n", Utc::now().to_rfc3339(), line);
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
        {
            let _ = file.write_all(stamped.as_bytes());
        }
    }
}

pub mod testing {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        next_id: u64,
        active: BTreeSet<SchedulerJobId>,
        submitted: Vec<String>,
        fail_next_update: bool,
    }

    /// In-memory scheduler for tests and dry runs. Jobs stay active until
    /// finished explicitly; clones share state, so a handle kept outside
    /// the queue can drain or fail it mid-test.
    #[derive(Clone, Default)]
    pub struct FakeScheduler {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeScheduler {
        /// Mark every outstanding job as finished, as if the scheduler had
        /// drained its queue.
        pub fn finish_all(&self) {
            self.state.lock().unwrap().active.clear();
        }

        pub fn finish(&self, id: SchedulerJobId) {
            self.state.lock().unwrap().active.remove(&id);
        }

        /// Make the next `active_jobs` call fail once, simulating a
        /// transient scheduler outage.
        pub fn fail_next_update(&self) {
            self.state.lock().unwrap().fail_next_update = true;
        }

        pub fn submitted(&self) -> Vec<String> {
            self.state.lock().unwrap().submitted.clone()
        }

        pub fn active_count(&self) -> usize {
            self.state.lock().unwrap().active.len()
        }
    }

    impl Scheduler for FakeScheduler {
        fn submit(&mut self, command: &str) -> Result<SchedulerJobId> {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = SchedulerJobId(state.next_id);
            state.active.insert(id);
            state.submitted.push(command.to_string());
            Ok(id)
        }

        fn active_jobs(&mut self) -> Result<Vec<SchedulerJobId>> {
            let mut state = self.state.lock().unwrap();
            if state.fail_next_update {
                state.fail_next_update = false;
                return Err(Error::Scheduler("squeue unavailable".to_string()));
            }
            Ok(state.active.iter().copied().collect())
        }

        fn cancel(&mut self, id: SchedulerJobId) -> Result<()> {
            self.state.lock().unwrap().active.remove(&id);
            Ok(())
        }
    }
}
