//! Forwards scheduler-side kills to the resource manager.

use tracing::{debug, warn};

use keel_core::TaskState;
use keel_events::{CauseOrigin, EventKind, LifecycleEvent, Subscriber};

use crate::driver::DriverReference;

/// Issues `kill` for launched tasks the scheduler or an operator moved to
/// KILLED or RESTARTING. Reports that came from the resource manager are
/// already known to it and are skipped.
pub struct KillForwarder {
    driver: DriverReference,
}

impl KillForwarder {
    pub fn new(driver: DriverReference) -> Self {
        Self { driver }
    }
}

impl Subscriber for KillForwarder {
    fn name(&self) -> &str {
        "kill-forwarder"
    }

    fn handles(&self, kind: EventKind) -> bool {
        kind == EventKind::TaskStateChange
    }

    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        let LifecycleEvent::TaskStateChange {
            task_id,
            from,
            to,
            cause,
            ..
        } = event
        else {
            return Ok(());
        };
        if !matches!(to, TaskState::Killed | TaskState::Restarting) {
            return Ok(());
        }
        if cause.origin == CauseOrigin::ResourceManager {
            return Ok(());
        }
        if !matches!(
            from,
            Some(TaskState::Assigned | TaskState::Starting | TaskState::Running)
        ) {
            return Ok(());
        }

        let Some(driver) = self.driver.get() else {
            warn!(task = %task_id, "no live driver, kill not forwarded");
            return Ok(());
        };
        debug!(task = %task_id, to = %to, "forwarding kill");
        driver.kill(task_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keel_events::Cause;

    use super::*;
    use crate::driver::testing::{Call, RecordingHandle};

    fn change(from: Option<TaskState>, to: TaskState, cause: Cause) -> LifecycleEvent {
        LifecycleEvent::TaskStateChange {
            task_id: "t1".into(),
            job: keel_core::JobKey::new("www", "prod", "api"),
            host: Some("host-a".into()),
            from,
            to,
            cause,
            timestamp: 0,
        }
    }

    fn forwarder() -> (KillForwarder, Arc<RecordingHandle>) {
        let driver = DriverReference::new();
        let handle = Arc::new(RecordingHandle::default());
        driver.set(handle.clone());
        (KillForwarder::new(driver), handle)
    }

    #[test]
    fn scheduler_kills_of_launched_tasks_are_forwarded() {
        let (fwd, handle) = forwarder();
        fwd.on_event(&change(Some(TaskState::Running), TaskState::Killed, Cause::operator("kill")))
            .unwrap();
        fwd.on_event(&change(
            Some(TaskState::Assigned),
            TaskState::Restarting,
            Cause::scheduler("host draining"),
        ))
        .unwrap();
        assert_eq!(handle.calls(), vec![Call::Kill("t1".into()), Call::Kill("t1".into())]);
    }

    #[test]
    fn resource_manager_reports_and_pending_kills_are_not_forwarded() {
        let (fwd, handle) = forwarder();
        fwd.on_event(&change(
            Some(TaskState::Running),
            TaskState::Killed,
            Cause::resource_manager("killed"),
        ))
        .unwrap();
        fwd.on_event(&change(Some(TaskState::Pending), TaskState::Killed, Cause::operator("kill")))
            .unwrap();
        fwd.on_event(&change(Some(TaskState::Running), TaskState::Finished, Cause::operator("x")))
            .unwrap();
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn missing_driver_is_not_an_error() {
        let fwd = KillForwarder::new(DriverReference::new());
        fwd.on_event(&change(Some(TaskState::Running), TaskState::Killed, Cause::operator("kill")))
            .unwrap();
    }
}
