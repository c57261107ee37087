//! Write operations accepted by the state store.

use keel_core::{HostAttributes, JobKey, JobSpec, Task, TaskId};

/// A single durable change. Several mutations can be committed atomically.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Write a task record.
    ///
    /// `expected_version` is the version the writer based its change on;
    /// `None` means the task must not exist yet.
    SaveTask {
        task: Task,
        expected_version: Option<u64>,
    },
    /// Remove task records. Missing ids are ignored.
    DeleteTasks { ids: Vec<TaskId> },
    /// Write a host's attributes and maintenance mode.
    SaveHost(HostAttributes),
    /// Write a cron job definition.
    SaveCronJob(JobSpec),
    /// Remove a cron job definition.
    DeleteCronJob(JobKey),
}

impl Mutation {
    pub fn save_task(task: Task, expected_version: Option<u64>) -> Self {
        Mutation::SaveTask {
            task,
            expected_version,
        }
    }
}

/// Table key for a job.
pub fn job_table_key(key: &JobKey) -> String {
    key.to_string()
}
