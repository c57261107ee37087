//! TaskAssigner — consume one offer, assign at most one task.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use keel_core::{HostId, JobKey, Offer, OfferId, Task, TaskId, TaskState};
use keel_events::Cause;
use keel_state::AttributeStore;
use keel_tasks::{TaskError, TaskResult, TaskStateMachine};

use crate::filter::{FilterContext, SchedulingFilter, Veto};

/// A task bound to an offer. The task is already ASSIGNED when this is returned.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub offer_id: OfferId,
    pub host: HostId,
    pub task_id: TaskId,
    pub task: Arc<Task>,
}

pub struct TaskAssigner {
    tasks: Arc<TaskStateMachine>,
    attributes: Arc<AttributeStore>,
    filter: SchedulingFilter,
}

impl TaskAssigner {
    pub fn new(tasks: Arc<TaskStateMachine>, attributes: Arc<AttributeStore>) -> Self {
        Self {
            tasks,
            attributes,
            filter: SchedulingFilter::standard(),
        }
    }

    pub fn with_filter(mut self, filter: SchedulingFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Try `candidates` in order against `offer`.
    ///
    /// The first task that passes every filter is moved to ASSIGNED on the
    /// offer's host. `Ok(None)` means the offer should be declined. Host
    /// attributes are read once, so a concurrent maintenance change applies
    /// to the next attempt, never half of this one.
    pub fn assign(&self, offer: &Offer, candidates: &[Arc<Task>]) -> TaskResult<Option<Assignment>> {
        let host = self.attributes.snapshot(&offer.host);
        let mut contexts: HashMap<JobKey, FilterContext> = HashMap::new();

        for task in candidates {
            if task.state != TaskState::Pending {
                continue;
            }
            let ctx = contexts
                .entry(task.job.clone())
                .or_insert_with(|| self.context_for(&task.job));
            if let Err(veto) = self.filter.filter(&offer.resources, &host, task, ctx) {
                trace!(task = %task.id, host = %offer.host, %veto, "task vetoed");
                continue;
            }

            let cause = Cause::scheduler(format!("assigned to {} by offer {}", offer.host, offer.id));
            match self.tasks.assign(&task.id, &offer.host, cause) {
                Ok(transition) => {
                    debug!(task = %task.id, host = %offer.host, offer = %offer.id, "task assigned");
                    return Ok(Some(Assignment {
                        offer_id: offer.id.clone(),
                        host: offer.host.clone(),
                        task_id: task.id.clone(),
                        task: transition.task,
                    }));
                }
                // Someone else moved the task since the candidate list was taken.
                Err(TaskError::IllegalTransition { .. } | TaskError::UnknownTask(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// All vetoes `task` would get on `offer` right now.
    pub fn explain(&self, offer: &Offer, task: &Task) -> Vec<Veto> {
        let host = self.attributes.snapshot(&offer.host);
        let ctx = self.context_for(&task.job);
        self.filter.vetoes(&offer.resources, &host, task, &ctx)
    }

    fn context_for(&self, job: &JobKey) -> FilterContext {
        let job_placements = self
            .tasks
            .by_job(job)
            .iter()
            .filter(|t| t.state.is_active())
            .filter_map(|t| t.assigned_host.as_deref())
            .map(|host| self.attributes.snapshot(host))
            .collect();
        FilterContext { job_placements }
    }
}
