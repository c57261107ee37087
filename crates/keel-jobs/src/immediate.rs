//! Jobs whose tasks are created on receipt.

use std::sync::Arc;

use keel_core::{JobKind, JobSpec};
use keel_events::Cause;
use keel_tasks::TaskStateMachine;

use crate::error::{JobError, JobResult};
use crate::manager::{JobManager, JobReceipt};

pub struct ImmediateJobManager {
    tasks: Arc<TaskStateMachine>,
}

impl ImmediateJobManager {
    pub fn new(tasks: Arc<TaskStateMachine>) -> Self {
        Self { tasks }
    }
}

impl JobManager for ImmediateJobManager {
    fn name(&self) -> &'static str {
        "immediate"
    }

    fn accepts(&self, kind: &JobKind) -> bool {
        matches!(kind, JobKind::Immediate)
    }

    fn receive_job(&self, job: &JobSpec) -> JobResult<JobReceipt> {
        if !self.accepts(&job.kind) {
            return Err(JobError::WrongKind {
                key: job.key.clone(),
                manager: self.name(),
            });
        }
        let mut created = Vec::with_capacity(job.instances as usize);
        for instance in 0..job.instances {
            let transition = self.tasks.insert_pending(
                &job.key,
                instance,
                job.task.clone(),
                Cause::operator("job submitted"),
            )?;
            created.push(transition.task.id.clone());
        }
        Ok(JobReceipt {
            key: job.key.clone(),
            manager: self.name(),
            tasks: created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::JobManagers;
    use keel_core::{FakeClock, JobKey, Resources, TaskConfig, TaskState, TasksConfig};
    use keel_events::EventBus;
    use keel_state::StateStore;

    fn tasks() -> Arc<TaskStateMachine> {
        Arc::new(TaskStateMachine::new(
            StateStore::open_in_memory().unwrap(),
            Arc::new(EventBus::default()),
            FakeClock::new(0),
            &TasksConfig::default(),
        ))
    }

    fn job(kind: JobKind, instances: u32) -> JobSpec {
        JobSpec {
            key: JobKey::new("www", "prod", "api"),
            kind,
            task: TaskConfig::new(Resources::new(0.5, 64, 64, 0)),
            instances,
        }
    }

    #[test]
    fn submit_creates_one_pending_task_per_instance() {
        let tasks = tasks();
        let managers = JobManagers::new().with_manager(Arc::new(ImmediateJobManager::new(tasks.clone())));

        let receipt = managers.submit(job(JobKind::Immediate, 3)).unwrap();
        assert_eq!(receipt.manager, "immediate");
        assert_eq!(receipt.tasks.len(), 3);

        let mut instances: Vec<u32> = tasks
            .by_state(TaskState::Pending)
            .iter()
            .map(|t| t.instance)
            .collect();
        instances.sort();
        assert_eq!(instances, vec![0, 1, 2]);
    }

    #[test]
    fn zero_instances_rejected() {
        let managers = JobManagers::new().with_manager(Arc::new(ImmediateJobManager::new(tasks())));
        assert!(matches!(
            managers.submit(job(JobKind::Immediate, 0)),
            Err(JobError::InvalidJob { .. })
        ));
    }

    #[test]
    fn unhandled_kind_has_no_manager() {
        let managers = JobManagers::new().with_manager(Arc::new(ImmediateJobManager::new(tasks())));
        let cron = JobKind::Cron {
            schedule: "0 * * * * *".into(),
            collision: Default::default(),
        };
        assert!(matches!(
            managers.submit(job(cron.clone(), 1)),
            Err(JobError::NoManager { kind: "cron", .. })
        ));
        assert!(matches!(
            ImmediateJobManager::new(tasks()).receive_job(&job(cron, 1)),
            Err(JobError::WrongKind { .. })
        ));
    }
}
