//! QuotaUsage — resources held by active tasks, per role.
//!
//! Tracks consumption only. Deciding whether a role may exceed its share is
//! left to whoever reads the snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Weak;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use keel_core::{Resources, Task, TaskId};
use keel_events::{EventKind, LifecycleEvent, Subscriber};
use keel_tasks::TaskStateMachine;

/// Resources held by one role's active tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoleUsage {
    pub tasks: u64,
    pub resources: Resources,
}

struct Held {
    role: String,
    resources: Resources,
}

pub struct QuotaUsage {
    tasks: Weak<TaskStateMachine>,
    held: Mutex<HashMap<TaskId, Held>>,
}

impl QuotaUsage {
    pub fn new(tasks: Weak<TaskStateMachine>) -> Self {
        Self {
            tasks,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Usage per role. Roles with nothing active are absent.
    pub fn snapshot(&self) -> BTreeMap<String, RoleUsage> {
        let held = self.held.lock();
        let mut usage: BTreeMap<String, RoleUsage> = BTreeMap::new();
        for h in held.values() {
            let entry = usage.entry(h.role.clone()).or_default();
            entry.tasks += 1;
            entry.resources.cpus += h.resources.cpus;
            entry.resources.ram_mb += h.resources.ram_mb;
            entry.resources.disk_mb += h.resources.disk_mb;
            entry.resources.ports += h.resources.ports;
        }
        usage
    }

    pub fn role(&self, role: &str) -> RoleUsage {
        self.snapshot().remove(role).unwrap_or_default()
    }

    fn hold(task: &Task) -> Held {
        Held {
            role: task.job.role.clone(),
            resources: task.config.resources.clone(),
        }
    }

    fn resync(&self) {
        let Some(tasks) = self.tasks.upgrade() else {
            return;
        };
        let held: HashMap<TaskId, Held> = tasks
            .get_all()
            .iter()
            .filter(|t| t.state.is_active())
            .map(|t| (t.id.clone(), Self::hold(t)))
            .collect();
        debug!(active = held.len(), "quota usage resynced");
        *self.held.lock() = held;
    }
}

impl Subscriber for QuotaUsage {
    fn name(&self) -> &str {
        "quota"
    }

    fn handles(&self, kind: EventKind) -> bool {
        matches!(
            kind,
            EventKind::TaskStateChange | EventKind::TasksDeleted | EventKind::LeaderAcquired
        )
    }

    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        match event {
            LifecycleEvent::TaskStateChange { task_id, to, .. } if to.is_active() => {
                if self.held.lock().contains_key(task_id) {
                    return Ok(());
                }
                // The record is committed before the event is published.
                let task = self.tasks.upgrade().and_then(|tasks| tasks.get(task_id));
                if let Some(task) = task {
                    self.held.lock().insert(task_id.clone(), Self::hold(&task));
                }
            }
            LifecycleEvent::TaskStateChange { task_id, .. } => {
                self.held.lock().remove(task_id);
            }
            LifecycleEvent::TasksDeleted { task_ids } => {
                let mut held = self.held.lock();
                for id in task_ids {
                    held.remove(id);
                }
            }
            LifecycleEvent::LeaderAcquired => self.resync(),
            _ => {}
        }
        Ok(())
    }
}
