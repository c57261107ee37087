use keel_core::JobKey;
use keel_state::StateError;
use keel_tasks::TaskError;
use thiserror::Error;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job {key}: {reason}")]
    InvalidJob { key: JobKey, reason: String },

    #[error("invalid cron schedule {schedule:?}: {message}")]
    InvalidSchedule { schedule: String, message: String },

    #[error("no job manager accepts {kind} job {key}")]
    NoManager { key: JobKey, kind: &'static str },

    #[error("{manager} does not manage {key}")]
    WrongKind { key: JobKey, manager: &'static str },

    #[error("unknown job: {0}")]
    UnknownJob(JobKey),

    #[error("not the active scheduler")]
    NotLeader,

    #[error("job storage failed: {0}")]
    Storage(#[from] StateError),

    #[error("task creation failed: {0}")]
    Task(#[from] TaskError),
}
