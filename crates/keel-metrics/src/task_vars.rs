//! TaskVars — lifecycle counters fed by the event bus.

use std::collections::{BTreeMap, HashMap};
use std::sync::Weak;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use keel_core::{HostId, MaintenanceMode, TaskId, TaskState};
use keel_events::{LifecycleEvent, Subscriber};
use keel_tasks::TaskStateMachine;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskVarsSnapshot {
    pub leader: bool,
    /// Tasks in the live table per state. Every state is present.
    pub tasks_by_state: BTreeMap<TaskState, u64>,
    /// Tasks that went LOST, per host, since startup.
    pub lost_by_host: BTreeMap<HostId, u64>,
    /// Hosts currently in a non-NONE maintenance mode.
    pub host_modes: BTreeMap<HostId, MaintenanceMode>,
    /// Committed transitions observed, creation included.
    pub transitions_total: u64,
}

#[derive(Default)]
struct Vars {
    leader: bool,
    states: HashMap<TaskId, TaskState>,
    lost_by_host: BTreeMap<HostId, u64>,
    host_modes: BTreeMap<HostId, MaintenanceMode>,
    transitions_total: u64,
}

pub struct TaskVars {
    tasks: Weak<TaskStateMachine>,
    vars: Mutex<Vars>,
}

impl TaskVars {
    /// `tasks` is consulted on `LeaderAcquired` to pick up the recovered table.
    pub fn new(tasks: Weak<TaskStateMachine>) -> Self {
        Self {
            tasks,
            vars: Mutex::new(Vars::default()),
        }
    }

    pub fn snapshot(&self) -> TaskVarsSnapshot {
        let vars = self.vars.lock();
        let mut tasks_by_state: BTreeMap<TaskState, u64> =
            TaskState::ALL.iter().map(|s| (*s, 0)).collect();
        for state in vars.states.values() {
            *tasks_by_state.entry(*state).or_default() += 1;
        }
        TaskVarsSnapshot {
            leader: vars.leader,
            tasks_by_state,
            lost_by_host: vars.lost_by_host.clone(),
            host_modes: vars.host_modes.clone(),
            transitions_total: vars.transitions_total,
        }
    }

    fn resync(&self) {
        let Some(tasks) = self.tasks.upgrade() else {
            return;
        };
        let states: HashMap<TaskId, TaskState> = tasks
            .get_all()
            .iter()
            .map(|t| (t.id.clone(), t.state))
            .collect();
        debug!(count = states.len(), "task vars resynced");
        self.vars.lock().states = states;
    }
}

impl Subscriber for TaskVars {
    fn name(&self) -> &str {
        "task-vars"
    }

    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        match event {
            LifecycleEvent::TaskStateChange { task_id, host, to, .. } => {
                let mut vars = self.vars.lock();
                vars.transitions_total += 1;
                vars.states.insert(task_id.clone(), *to);
                if *to == TaskState::Lost {
                    let host = host.clone().unwrap_or_else(|| "unassigned".to_string());
                    *vars.lost_by_host.entry(host).or_default() += 1;
                }
            }
            LifecycleEvent::TasksDeleted { task_ids } => {
                let mut vars = self.vars.lock();
                for id in task_ids {
                    vars.states.remove(id);
                }
            }
            LifecycleEvent::HostMaintenanceChange { host, to, .. } => {
                let mut vars = self.vars.lock();
                if *to == MaintenanceMode::None {
                    vars.host_modes.remove(host);
                } else {
                    vars.host_modes.insert(host.clone(), *to);
                }
            }
            LifecycleEvent::LeaderAcquired => {
                self.resync();
                self.vars.lock().leader = true;
            }
            LifecycleEvent::LeaderLost => {
                self.vars.lock().leader = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{FakeClock, JobKey, Resources, TaskConfig, TasksConfig};
    use keel_events::{Cause, EventBus};
    use keel_state::StateStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<TaskStateMachine>, Arc<TaskVars>, Arc<EventBus>, Arc<FakeClock>) {
        let bus = Arc::new(EventBus::default());
        let clock = FakeClock::new(0);
        let tasks = Arc::new(TaskStateMachine::new(
            StateStore::open_in_memory().unwrap(),
            bus.clone(),
            clock.clone(),
            &TasksConfig::default(),
        ));
        let vars = Arc::new(TaskVars::new(Arc::downgrade(&tasks)));
        bus.register(vars.clone());
        (tasks, vars, bus, clock)
    }

    fn submit(tasks: &TaskStateMachine) -> String {
        tasks
            .insert_pending(
                &JobKey::new("www", "prod", "api"),
                0,
                TaskConfig::new(Resources::new(1.0, 1, 1, 0)),
                Cause::operator("submit"),
            )
            .unwrap()
            .task
            .id
            .clone()
    }

    #[test]
    fn counts_follow_transitions() {
        let (tasks, vars, _bus, _clock) = setup();
        let a = submit(&tasks);
        let _b = submit(&tasks);
        tasks.assign(&a, "host-a", Cause::scheduler("offer")).unwrap();

        let snap = vars.snapshot();
        assert_eq!(snap.tasks_by_state[&TaskState::Pending], 1);
        assert_eq!(snap.tasks_by_state[&TaskState::Assigned], 1);
        assert_eq!(snap.tasks_by_state[&TaskState::Running], 0);
        assert_eq!(snap.transitions_total, 3);
    }

    #[test]
    fn lost_tasks_are_counted_per_host() {
        let (tasks, vars, _bus, _clock) = setup();
        let a = submit(&tasks);
        tasks.assign(&a, "host-a", Cause::scheduler("offer")).unwrap();
        tasks
            .transition(&a, TaskState::Lost, Cause::resource_manager("agent gone"))
            .unwrap();

        let snap = vars.snapshot();
        assert_eq!(snap.lost_by_host.get("host-a"), Some(&1));
        // The replacement shows up as pending.
        assert_eq!(snap.tasks_by_state[&TaskState::Pending], 1);
    }

    #[test]
    fn pruned_tasks_leave_the_gauges() {
        let (tasks, vars, _bus, clock) = setup();
        let a = submit(&tasks);
        tasks.transition(&a, TaskState::Killed, Cause::operator("kill")).unwrap();
        assert_eq!(vars.snapshot().tasks_by_state[&TaskState::Killed], 1);

        clock.advance(Duration::from_secs(3_600));
        tasks.prune_expired().unwrap();
        assert_eq!(vars.snapshot().tasks_by_state[&TaskState::Killed], 0);
    }

    #[test]
    fn leadership_and_host_modes() {
        let (_tasks, vars, bus, _clock) = setup();
        bus.publish(LifecycleEvent::LeaderAcquired);
        bus.publish(LifecycleEvent::HostMaintenanceChange {
            host: "host-a".into(),
            from: MaintenanceMode::None,
            to: MaintenanceMode::Scheduled,
        });
        let snap = vars.snapshot();
        assert!(snap.leader);
        assert_eq!(snap.host_modes.get("host-a"), Some(&MaintenanceMode::Scheduled));

        bus.publish(LifecycleEvent::LeaderLost);
        bus.publish(LifecycleEvent::HostMaintenanceChange {
            host: "host-a".into(),
            from: MaintenanceMode::Scheduled,
            to: MaintenanceMode::None,
        });
        let snap = vars.snapshot();
        assert!(!snap.leader);
        assert!(snap.host_modes.is_empty());
    }

    #[test]
    fn leader_acquired_resyncs_from_recovered_table() {
        let (tasks, vars, bus, _clock) = setup();
        submit(&tasks);
        // Simulate counters drifting (e.g. events missed while standby).
        vars.vars.lock().states.clear();
        assert_eq!(vars.snapshot().tasks_by_state[&TaskState::Pending], 0);

        bus.publish(LifecycleEvent::LeaderAcquired);
        assert_eq!(vars.snapshot().tasks_by_state[&TaskState::Pending], 1);
    }
}
