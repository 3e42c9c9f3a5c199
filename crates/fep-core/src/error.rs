use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared across the workspace. Lifecycle and configuration
/// errors abort the triggering call; transient scheduler failures are
/// surfaced so the poll loop can retry them at the next cycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(
        "duration of {duration_ns} ns is not a multiple of the \
         {cycle_ns} ns cycle time"
    )]
    DurationAlignment { duration_ns: f64, cycle_ns: f64 },

    #[error("invalid state: {0}")]
    State(String),

    #[error("job control error: {0}")]
    JobControl(String),

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
