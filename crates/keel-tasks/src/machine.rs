//! TaskStateMachine — validated, durable, evented task transitions.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use keel_core::{
    JobKey, SharedClock, Task, TaskConfig, TaskEvent, TaskId, TaskState, TasksConfig,
    is_valid_transition,
};
use keel_events::{Cause, EventBus, LifecycleEvent};
use keel_state::{Mutation, StateStore};

use crate::error::{TaskError, TaskResult};
use crate::id::TaskIdGenerator;

/// Outcome of a committed change: the new record and the event published for it.
#[derive(Debug, Clone)]
pub struct Transition {
    pub task: Arc<Task>,
    pub event: LifecycleEvent,
}

struct TaskSlot {
    /// Serializes transitions of this task, held through publish.
    lock: Mutex<()>,
    /// Last committed record. Swapped after each commit.
    committed: RwLock<Arc<Task>>,
}

impl TaskSlot {
    fn new(task: Task) -> Arc<Self> {
        Arc::new(Self {
            lock: Mutex::new(()),
            committed: RwLock::new(Arc::new(task)),
        })
    }

    fn snapshot(&self) -> Arc<Task> {
        self.committed.read().clone()
    }
}

pub struct TaskStateMachine {
    store: StateStore,
    bus: Arc<EventBus>,
    clock: SharedClock,
    ids: TaskIdGenerator,
    tasks: DashMap<TaskId, Arc<TaskSlot>>,
    retention: Duration,
    retry_budget: u32,
}

impl TaskStateMachine {
    pub fn new(store: StateStore, bus: Arc<EventBus>, clock: SharedClock, config: &TasksConfig) -> Self {
        Self {
            store,
            bus,
            ids: TaskIdGenerator::new(clock.clone()),
            clock,
            tasks: DashMap::new(),
            retention: config.retention(),
            retry_budget: config.storage_retry_budget,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Create a task in PENDING. The only way a task enters the table.
    pub fn insert_pending(
        &self,
        job: &JobKey,
        instance: u32,
        config: TaskConfig,
        cause: Cause,
    ) -> TaskResult<Transition> {
        self.create(job.clone(), instance, config, 0, cause)
    }

    fn create(
        &self,
        job: JobKey,
        instance: u32,
        config: TaskConfig,
        failure_count: u32,
        cause: Cause,
    ) -> TaskResult<Transition> {
        debug_assert!(is_valid_transition(None, TaskState::Pending));
        let now = self.clock.now_millis();
        let task = Task {
            id: self.ids.generate(&job, instance),
            job,
            instance,
            state: TaskState::Pending,
            assigned_host: None,
            config,
            failure_count,
            history: vec![TaskEvent {
                timestamp: now,
                state: TaskState::Pending,
                message: cause.to_string(),
            }],
            version: 1,
            retain_until: None,
        };

        let slot = TaskSlot::new(task.clone());
        let _guard = slot.lock.lock();
        self.commit_new(&task)?;
        self.tasks.insert(task.id.clone(), slot.clone());

        let event = LifecycleEvent::TaskStateChange {
            task_id: task.id.clone(),
            job: task.job.clone(),
            host: None,
            from: None,
            to: TaskState::Pending,
            cause,
            timestamp: now,
        };
        debug!(task = %task.id, job = %task.job, instance, "task created");
        self.bus.publish(event.clone());

        Ok(Transition {
            task: slot.snapshot(),
            event,
        })
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Move a task to `target`.
    ///
    /// Fails with `IllegalTransition` (task unchanged) when the move is not in
    /// the table, and `UnknownTask` when the task is not in the live table.
    pub fn transition(&self, task_id: &str, target: TaskState, cause: Cause) -> TaskResult<Transition> {
        self.apply(task_id, target, None, cause)
    }

    /// `PENDING → ASSIGNED`, recording the host.
    pub fn assign(&self, task_id: &str, host: &str, cause: Cause) -> TaskResult<Transition> {
        self.apply(task_id, TaskState::Assigned, Some(host), cause)
    }

    fn apply(
        &self,
        task_id: &str,
        target: TaskState,
        host: Option<&str>,
        cause: Cause,
    ) -> TaskResult<Transition> {
        let slot = self.slot(task_id)?;
        let guard = slot.lock.lock();

        let mut base = slot.snapshot();
        let mut attempts = 0;
        let next = loop {
            if !base.state.can_transition_to(target) {
                return Err(TaskError::IllegalTransition {
                    task_id: task_id.to_string(),
                    from: base.state,
                    to: target,
                });
            }
            let next = self.next_record(&base, target, host, &cause);
            match self.store.commit(Mutation::save_task(next.clone(), Some(base.version))) {
                Ok(()) => break next,
                Err(e) if e.is_conflict() && attempts < self.retry_budget => {
                    attempts += 1;
                    warn!(task = %task_id, attempt = attempts, error = %e, "task commit conflicted, re-reading");
                    match self.store.get_task(task_id)? {
                        Some(stored) => {
                            base = Arc::new(stored);
                            *slot.committed.write() = base.clone();
                        }
                        None => {
                            self.tasks.remove(task_id);
                            return Err(TaskError::UnknownTask(task_id.to_string()));
                        }
                    }
                }
                Err(e) if e.is_transient() && attempts < self.retry_budget => {
                    attempts += 1;
                    warn!(task = %task_id, attempt = attempts, error = %e, "task commit failed, retrying");
                }
                Err(e) => {
                    error!(task = %task_id, to = %target, error = %e, "task commit failed");
                    return Err(e.into());
                }
            }
        };

        let from = base.state;
        let next = Arc::new(next);
        *slot.committed.write() = next.clone();

        let event = LifecycleEvent::TaskStateChange {
            task_id: next.id.clone(),
            job: next.job.clone(),
            host: next.assigned_host.clone(),
            from: Some(from),
            to: target,
            cause: cause.clone(),
            timestamp: next.last_transition_at(),
        };
        info!(task = %task_id, %from, to = %target, %cause, "task transitioned");
        self.bus.publish(event.clone());
        drop(guard);

        if let Some(failure_count) = replacement_failures(from, &next) {
            let replacement = self.create(
                next.job.clone(),
                next.instance,
                next.config.clone(),
                failure_count,
                Cause::scheduler(format!("rescheduled from {}", next.id)),
            )?;
            info!(task = %task_id, replacement = %replacement.task.id, "task rescheduled");
        }

        Ok(Transition { task: next, event })
    }

    /// Persist a new record, retrying transient failures within the budget.
    fn commit_new(&self, task: &Task) -> TaskResult<()> {
        let mut attempts = 0;
        loop {
            match self.store.commit(Mutation::save_task(task.clone(), None)) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempts < self.retry_budget => {
                    attempts += 1;
                    warn!(task = %task.id, attempt = attempts, error = %e, "task create failed, retrying");
                }
                Err(e) => {
                    error!(task = %task.id, error = %e, "task create failed");
                    return Err(e.into());
                }
            }
        }
    }

    fn next_record(&self, base: &Task, target: TaskState, host: Option<&str>, cause: &Cause) -> Task {
        let now = self.clock.now_millis();
        let mut next = base.clone();
        next.state = target;
        next.version = base.version + 1;
        if let Some(host) = host {
            next.assigned_host = Some(host.to_string());
        }
        if target == TaskState::Failed {
            next.failure_count += 1;
        }
        if target.is_terminal() {
            next.retain_until = Some(now + self.retention.as_millis() as u64);
        }
        next.history.push(TaskEvent {
            timestamp: now,
            state: target,
            message: cause.to_string(),
        });
        next
    }

    fn slot(&self, task_id: &str) -> TaskResult<Arc<TaskSlot>> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, task_id: &str) -> Option<Arc<Task>> {
        self.tasks.get(task_id).map(|entry| entry.value().snapshot())
    }

    /// All tasks, ordered by id.
    pub fn get_all(&self) -> Vec<Arc<Task>> {
        self.select(|_| true)
    }

    pub fn by_state(&self, state: TaskState) -> Vec<Arc<Task>> {
        self.select(|t| t.state == state)
    }

    pub fn by_host(&self, host: &str) -> Vec<Arc<Task>> {
        self.select(|t| t.assigned_host.as_deref() == Some(host))
    }

    pub fn by_job(&self, job: &JobKey) -> Vec<Arc<Task>> {
        self.select(|t| &t.job == job)
    }

    /// Tasks occupying `host`: assigned there and in an active state.
    pub fn active_on_host(&self, host: &str) -> Vec<Arc<Task>> {
        self.select(|t| t.state.is_active() && t.assigned_host.as_deref() == Some(host))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn select(&self, pred: impl Fn(&Task) -> bool) -> Vec<Arc<Task>> {
        let mut out: Vec<Arc<Task>> = self
            .tasks
            .iter()
            .map(|entry| entry.value().snapshot())
            .filter(|t| pred(t))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    // ── Recovery and retention ─────────────────────────────────────

    /// Replace the live table with the durable contents of the store.
    ///
    /// Must run while no transitions are in flight, before the scheduler
    /// becomes active.
    pub fn recover(&self) -> TaskResult<usize> {
        let tasks = self.store.load_tasks()?;
        self.tasks.clear();
        for task in tasks {
            self.tasks.insert(task.id.clone(), TaskSlot::new(task));
        }
        info!(count = self.tasks.len(), "task table recovered");
        Ok(self.tasks.len())
    }

    /// Remove terminal tasks whose retention window has passed.
    pub fn prune_expired(&self) -> TaskResult<Vec<TaskId>> {
        let now = self.clock.now_millis();
        let mut expired: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| {
                let task = entry.value().snapshot();
                task.state.is_terminal() && task.retain_until.is_some_and(|until| until <= now)
            })
            .map(|entry| entry.key().clone())
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }
        expired.sort();

        // Terminal tasks accept no transitions, so nothing can race the delete.
        self.store.commit(Mutation::DeleteTasks {
            ids: expired.clone(),
        })?;
        for id in &expired {
            self.tasks.remove(id);
        }
        info!(count = expired.len(), "pruned expired tasks");
        self.bus.publish(LifecycleEvent::TasksDeleted {
            task_ids: expired.clone(),
        });
        Ok(expired)
    }

    /// Periodically prune until shutdown.
    pub async fn run_pruner(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.prune_expired() {
                        error!(error = %e, "task pruning failed");
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        debug!("task pruner stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// Failure count to carry into a replacement task, if the task is rescheduled.
///
/// Restart requests and lost tasks always get a replacement; failures only
/// while the job still has failures to spend.
fn replacement_failures(from: TaskState, task: &Task) -> Option<u32> {
    if !task.state.is_terminal() {
        return None;
    }
    let reschedule = from == TaskState::Restarting
        || task.state == TaskState::Lost
        || (task.state == TaskState::Failed && task.failure_count < task.config.max_failures);
    reschedule.then_some(task.failure_count)
}
