//! keel-jobs — turning job definitions into pending tasks.
//!
//! Job ingestion is a tagged dispatch: [`JobManagers::submit`] hands a
//! [`JobSpec`](keel_core::JobSpec) to the first manager that accepts its
//! [`JobKind`](keel_core::JobKind). Managers never mutate tasks directly;
//! they only call `insert_pending` (and, for cron collisions, `transition`)
//! on the task state machine.
//!
//! # Components
//!
//! - **`manager`** — `JobManager` capability and the dispatching registry
//! - **`immediate`** — Creates a job's tasks as soon as it arrives
//! - **`cron_manager`** — Persists cron jobs and fires them on schedule while leader

pub mod cron_manager;
pub mod error;
pub mod immediate;
pub mod manager;

pub use cron_manager::{CronJobManager, CronSchedule};
pub use error::{JobError, JobResult};
pub use immediate::ImmediateJobManager;
pub use manager::{JobManager, JobManagers, JobReceipt};
