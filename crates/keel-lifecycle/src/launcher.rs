//! Task launchers — who gets each offer.
//!
//! ```text
//! offer ──▶ Launchers
//!             ├── save host attributes carried by the offer
//!             ├── GcExecutorLauncher   (periodic per-host cleanup)
//!             ├── UserTaskLauncher     (pending tasks by priority)
//!             └── nobody wants it ──▶ decline
//!
//! status ──▶ first launcher that claims the task id, then acknowledge
//! ```
//!
//! A launch the driver refuses is handed back to the launcher that built
//! it, so nothing stays recorded as launched when it never was.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use keel_core::{GcExecutorConfig, HostId, Offer, SharedClock, TaskId, TaskState};
use keel_events::Cause;
use keel_health::PulseMonitor;
use keel_placement::TaskAssigner;
use keel_state::AttributeStore;
use keel_tasks::{TaskError, TaskStateMachine};

use crate::driver::{DriverEventHandler, DriverReference};
use crate::error::LifecycleResult;
use crate::resource::{LaunchSpec, StatusUpdate};

pub trait TaskLauncher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Claim the offer for one task, or pass.
    fn create_task(&self, offer: &Offer) -> LifecycleResult<Option<LaunchSpec>>;

    /// Handle a status report. `false` means the task is not ours.
    fn status_update(&self, update: &StatusUpdate) -> LifecycleResult<bool>;

    /// The driver refused a launch this launcher built.
    fn launch_failed(&self, spec: &LaunchSpec, reason: &str) -> LifecycleResult<()>;
}

/// Ordered launcher chain, installed as the driver's event handler.
pub struct Launchers {
    launchers: Vec<Arc<dyn TaskLauncher>>,
    attributes: Arc<AttributeStore>,
    driver: DriverReference,
}

impl Launchers {
    pub fn new(attributes: Arc<AttributeStore>, driver: DriverReference) -> Self {
        Self {
            launchers: Vec::new(),
            attributes,
            driver,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn TaskLauncher>) -> Self {
        self.launchers.push(launcher);
        self
    }
}

impl DriverEventHandler for Launchers {
    fn offer(&self, offer: Offer) -> LifecycleResult<()> {
        self.attributes.save_offer_attributes(&offer.host, &offer.attributes)?;

        let Some(driver) = self.driver.get() else {
            debug!(offer = %offer.id, "no live driver, dropping offer");
            return Ok(());
        };

        for launcher in &self.launchers {
            if let Some(spec) = launcher.create_task(&offer)? {
                info!(
                    launcher = launcher.name(),
                    task = %spec.task_id,
                    host = %offer.host,
                    offer = %offer.id,
                    "launching task"
                );
                if let Err(e) = driver.launch(&offer.id, spec.clone()) {
                    warn!(launcher = launcher.name(), task = %spec.task_id, offer = %offer.id, error = %e, "launch refused");
                    launcher.launch_failed(&spec, &e.to_string())?;
                    return Err(e.into());
                }
                return Ok(());
            }
        }

        trace!(offer = %offer.id, host = %offer.host, "declining offer");
        driver.decline(&offer.id)?;
        Ok(())
    }

    fn status(&self, update: StatusUpdate) -> LifecycleResult<()> {
        let mut claimed = false;
        for launcher in &self.launchers {
            if launcher.status_update(&update)? {
                claimed = true;
                break;
            }
        }
        if !claimed {
            debug!(task = %update.task_id, state = %update.state, "status for a task no launcher owns");
        }
        if let Some(driver) = self.driver.get() {
            driver.acknowledge(&update)?;
        }
        Ok(())
    }
}

// ── GC executor ─────────────────────────────────────────────────

/// Runs the GC executor on each host at most once per interval.
pub struct GcExecutorLauncher {
    config: GcExecutorConfig,
    pulses: PulseMonitor<HostId>,
    launched: Mutex<HashSet<TaskId>>,
}

impl GcExecutorLauncher {
    pub fn new(config: GcExecutorConfig, clock: SharedClock) -> Self {
        let pulses = PulseMonitor::new(clock, config.interval());
        Self {
            config,
            pulses,
            launched: Mutex::new(HashSet::new()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.launched.lock().len()
    }
}

impl TaskLauncher for GcExecutorLauncher {
    fn name(&self) -> &'static str {
        "gc-executor"
    }

    fn create_task(&self, offer: &Offer) -> LifecycleResult<Option<LaunchSpec>> {
        let Some(path) = &self.config.path else {
            return Ok(None);
        };
        if self.pulses.is_alive(&offer.host) {
            return Ok(None);
        }
        if !offer.resources.contains(&self.config.resources) {
            trace!(host = %offer.host, "offer too small for gc executor");
            return Ok(None);
        }

        let task_id = format!("system-gc-{}", uuid::Uuid::new_v4());
        self.pulses.pulse(offer.host.clone());
        self.launched.lock().insert(task_id.clone());
        Ok(Some(LaunchSpec {
            task_id,
            host: offer.host.clone(),
            resources: self.config.resources.clone(),
            command: path.clone(),
        }))
    }

    fn status_update(&self, update: &StatusUpdate) -> LifecycleResult<bool> {
        let mut launched = self.launched.lock();
        if !launched.contains(&update.task_id) {
            return Ok(false);
        }
        if update.state.is_terminal() {
            launched.remove(&update.task_id);
            if update.state != TaskState::Finished {
                warn!(task = %update.task_id, state = %update.state, message = %update.message, "gc executor did not finish cleanly");
            }
        }
        Ok(true)
    }

    fn launch_failed(&self, spec: &LaunchSpec, _reason: &str) -> LifecycleResult<()> {
        self.launched.lock().remove(&spec.task_id);
        // Let the next offer from this host try again.
        self.pulses.forget(&spec.host);
        Ok(())
    }
}

// ── User tasks ──────────────────────────────────────────────────

/// Places pending user tasks and feeds their status back into the task table.
pub struct UserTaskLauncher {
    tasks: Arc<TaskStateMachine>,
    assigner: TaskAssigner,
}

impl UserTaskLauncher {
    pub fn new(tasks: Arc<TaskStateMachine>, assigner: TaskAssigner) -> Self {
        Self { tasks, assigner }
    }
}

impl TaskLauncher for UserTaskLauncher {
    fn name(&self) -> &'static str {
        "user"
    }

    fn create_task(&self, offer: &Offer) -> LifecycleResult<Option<LaunchSpec>> {
        let mut pending = self.tasks.by_state(TaskState::Pending);
        if pending.is_empty() {
            return Ok(None);
        }
        pending.sort_by(|a, b| {
            b.config
                .priority
                .cmp(&a.config.priority)
                .then_with(|| a.id.cmp(&b.id))
        });

        let Some(assignment) = self.assigner.assign(offer, &pending)? else {
            return Ok(None);
        };
        Ok(Some(LaunchSpec {
            task_id: assignment.task_id,
            host: assignment.host,
            resources: assignment.task.config.resources.clone(),
            command: assignment.task.config.command.clone(),
        }))
    }

    fn status_update(&self, update: &StatusUpdate) -> LifecycleResult<bool> {
        let Some(current) = self.tasks.get(&update.task_id) else {
            return Ok(false);
        };
        if current.state == update.state {
            trace!(task = %update.task_id, state = %update.state, "duplicate status");
            return Ok(true);
        }

        let message = if update.message.is_empty() {
            format!("reported {}", update.state)
        } else {
            update.message.clone()
        };
        match self
            .tasks
            .transition(&update.task_id, update.state, Cause::resource_manager(message))
        {
            Ok(_) => Ok(true),
            Err(TaskError::IllegalTransition { from, to, .. }) => {
                warn!(task = %update.task_id, %from, %to, "ignoring status that does not follow the task's lifecycle");
                Ok(true)
            }
            Err(TaskError::UnknownTask(_)) => {
                debug!(task = %update.task_id, "status for pruned task");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The task was assigned but never reached the resource manager. LOST
    /// puts a replacement back into PENDING.
    fn launch_failed(&self, spec: &LaunchSpec, reason: &str) -> LifecycleResult<()> {
        let cause = Cause::scheduler(format!("launch failed: {reason}"));
        match self.tasks.transition(&spec.task_id, TaskState::Lost, cause) {
            Ok(_) => Ok(()),
            Err(TaskError::IllegalTransition { .. } | TaskError::UnknownTask(_)) => {
                debug!(task = %spec.task_id, "task moved on before launch failure was recorded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
