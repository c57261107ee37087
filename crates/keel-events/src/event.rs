//! Event payloads.

use std::fmt;

use serde::Serialize;

use keel_core::{HostId, JobKey, MaintenanceMode, TaskId, TaskState};

/// Who asked for a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseOrigin {
    /// The scheduler itself (assignment, eviction, rescheduling, cron).
    Scheduler,
    /// A status update reported by the resource manager.
    ResourceManager,
    /// An operator request.
    Operator,
}

/// Origin plus a human-readable reason, recorded in task history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cause {
    pub origin: CauseOrigin,
    pub message: String,
}

impl Cause {
    pub fn scheduler(message: impl Into<String>) -> Self {
        Self {
            origin: CauseOrigin::Scheduler,
            message: message.into(),
        }
    }

    pub fn resource_manager(message: impl Into<String>) -> Self {
        Self {
            origin: CauseOrigin::ResourceManager,
            message: message.into(),
        }
    }

    pub fn operator(message: impl Into<String>) -> Self {
        Self {
            origin: CauseOrigin::Operator,
            message: message.into(),
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match self.origin {
            CauseOrigin::Scheduler => "scheduler",
            CauseOrigin::ResourceManager => "resource-manager",
            CauseOrigin::Operator => "operator",
        };
        write!(f, "{origin}: {}", self.message)
    }
}

/// A notification published on the bus. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    TaskStateChange {
        task_id: TaskId,
        job: JobKey,
        host: Option<HostId>,
        /// `None` when the task was just created.
        from: Option<TaskState>,
        to: TaskState,
        cause: Cause,
        /// Epoch milliseconds of the commit.
        timestamp: u64,
    },
    TasksDeleted {
        task_ids: Vec<TaskId>,
    },
    HostMaintenanceChange {
        host: HostId,
        from: MaintenanceMode,
        to: MaintenanceMode,
    },
    LeaderAcquired,
    LeaderLost,
}

/// Discriminant of [`LifecycleEvent`], used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskStateChange,
    TasksDeleted,
    HostMaintenanceChange,
    LeaderAcquired,
    LeaderLost,
}

impl LifecycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::TaskStateChange { .. } => EventKind::TaskStateChange,
            LifecycleEvent::TasksDeleted { .. } => EventKind::TasksDeleted,
            LifecycleEvent::HostMaintenanceChange { .. } => EventKind::HostMaintenanceChange,
            LifecycleEvent::LeaderAcquired => EventKind::LeaderAcquired,
            LifecycleEvent::LeaderLost => EventKind::LeaderLost,
        }
    }

    /// Task id for task-scoped events.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            LifecycleEvent::TaskStateChange { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}
