//! JobManager capability and tagged dispatch.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use keel_core::{JobKey, JobKind, JobSpec, TaskId};

use crate::error::{JobError, JobResult};

/// What a manager did with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReceipt {
    pub key: JobKey,
    pub manager: &'static str,
    /// Tasks created right away. Empty for jobs that run later.
    pub tasks: Vec<TaskId>,
}

pub trait JobManager: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, kind: &JobKind) -> bool;

    fn receive_job(&self, job: &JobSpec) -> JobResult<JobReceipt>;
}

/// Ordered set of managers. The first that accepts a job's kind gets it.
#[derive(Default)]
pub struct JobManagers {
    managers: Vec<Arc<dyn JobManager>>,
}

impl JobManagers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manager(mut self, manager: Arc<dyn JobManager>) -> Self {
        self.managers.push(manager);
        self
    }

    pub fn submit(&self, job: JobSpec) -> JobResult<JobReceipt> {
        if job.instances == 0 {
            return Err(JobError::InvalidJob {
                key: job.key,
                reason: "instances must be at least 1".into(),
            });
        }
        let manager = self
            .managers
            .iter()
            .find(|m| m.accepts(&job.kind))
            .ok_or_else(|| JobError::NoManager {
                key: job.key.clone(),
                kind: kind_name(&job.kind),
            })?;
        let receipt = manager.receive_job(&job)?;
        info!(job = %job.key, manager = manager.name(), tasks = receipt.tasks.len(), "job received");
        Ok(receipt)
    }
}

pub(crate) fn kind_name(kind: &JobKind) -> &'static str {
    match kind {
        JobKind::Immediate => "immediate",
        JobKind::Cron { .. } => "cron",
    }
}
