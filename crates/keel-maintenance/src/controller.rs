//! MaintenanceController — per-host drain state machine.
//!
//! Operator actions and reconciliation only run on the leader, which the
//! controller learns from `LeaderAcquired` and `LeaderLost`. A standby
//! replica answers status queries and nothing else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use keel_core::{HostId, MaintenanceMode, TaskState};
use keel_events::{Cause, EventBus, EventKind, LifecycleEvent, Subscriber};
use keel_state::AttributeStore;
use keel_tasks::{TaskError, TaskStateMachine};

use crate::error::{MaintenanceError, MaintenanceResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub host: HostId,
    pub mode: MaintenanceMode,
}

pub struct MaintenanceController {
    attributes: Arc<AttributeStore>,
    tasks: Arc<TaskStateMachine>,
    bus: Arc<EventBus>,
    /// Serializes check-then-set of host modes. Never held while publishing
    /// or transitioning tasks, since both may call back into this controller.
    modes: Mutex<()>,
    leader: AtomicBool,
}

impl MaintenanceController {
    pub fn new(attributes: Arc<AttributeStore>, tasks: Arc<TaskStateMachine>, bus: Arc<EventBus>) -> Self {
        Self {
            attributes,
            tasks,
            bus,
            modes: Mutex::new(()),
            leader: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn ensure_leader(&self) -> MaintenanceResult<()> {
        if !self.is_leader() {
            return Err(MaintenanceError::NotLeader);
        }
        Ok(())
    }

    // ── Operator actions ───────────────────────────────────────────

    /// `NONE → SCHEDULED`. Rejects the whole batch if any host can't move.
    pub fn start_maintenance(&self, hosts: &[HostId]) -> MaintenanceResult<Vec<HostStatus>> {
        self.ensure_leader()?;
        self.move_all(hosts, MaintenanceMode::Scheduled)
    }

    /// `SCHEDULED → DRAINING`, then evict active tasks.
    ///
    /// Hosts with nothing running go straight to DRAINED.
    pub fn drain(&self, hosts: &[HostId]) -> MaintenanceResult<Vec<HostStatus>> {
        self.ensure_leader()?;
        self.move_all(hosts, MaintenanceMode::Draining)?;
        for host in hosts {
            self.evict(host)?;
            self.complete_drain(host)?;
        }
        Ok(self.get_status(hosts))
    }

    /// Return hosts to service. Hosts already in NONE are left alone.
    pub fn end_maintenance(&self, hosts: &[HostId]) -> MaintenanceResult<Vec<HostStatus>> {
        self.ensure_leader()?;
        let in_maintenance: Vec<HostId> = hosts
            .iter()
            .filter(|h| self.attributes.mode(h) != MaintenanceMode::None)
            .cloned()
            .collect();
        self.move_all(&in_maintenance, MaintenanceMode::None)?;
        Ok(self.get_status(hosts))
    }

    /// Mode of each host. An empty list means every known host.
    pub fn get_status(&self, hosts: &[HostId]) -> Vec<HostStatus> {
        if hosts.is_empty() {
            return self
                .attributes
                .all()
                .iter()
                .map(|a| HostStatus {
                    host: a.host.clone(),
                    mode: a.mode,
                })
                .collect();
        }
        hosts
            .iter()
            .map(|h| HostStatus {
                host: h.clone(),
                mode: self.attributes.mode(h),
            })
            .collect()
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Re-evict stragglers on DRAINING hosts and finish drains that are done.
    ///
    /// Returns hosts that became DRAINED. Does nothing unless leader.
    pub fn reconcile(&self) -> MaintenanceResult<Vec<HostId>> {
        if !self.is_leader() {
            return Ok(Vec::new());
        }
        let draining: Vec<HostId> = self
            .attributes
            .all()
            .iter()
            .filter(|a| a.mode == MaintenanceMode::Draining)
            .map(|a| a.host.clone())
            .collect();

        let mut drained = Vec::new();
        for host in draining {
            self.evict(&host)?;
            if self.complete_drain(&host)? {
                drained.push(host);
            }
        }
        Ok(drained)
    }

    pub async fn run(self: Arc<Self>, poll_interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile() {
                        Ok(drained) if !drained.is_empty() => {
                            info!(?drained, "maintenance reconcile finished drains");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "maintenance reconcile failed"),
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        debug!("maintenance loop stopping");
                        break;
                    }
                }
            }
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn move_all(&self, hosts: &[HostId], to: MaintenanceMode) -> MaintenanceResult<Vec<HostStatus>> {
        let mut changes = Vec::with_capacity(hosts.len());
        {
            let _guard = self.modes.lock();
            for host in hosts {
                let from = self.attributes.mode(host);
                if !from.can_transition_to(to) {
                    return Err(MaintenanceError::IllegalTransition {
                        host: host.clone(),
                        from,
                        to,
                    });
                }
            }
            for host in hosts {
                let from = self.attributes.set_mode(host, to)?;
                changes.push((host.clone(), from));
            }
        }

        let mut statuses = Vec::with_capacity(changes.len());
        for (host, from) in changes {
            info!(%host, %from, %to, "host maintenance mode changed");
            self.bus.publish(LifecycleEvent::HostMaintenanceChange {
                host: host.clone(),
                from,
                to,
            });
            statuses.push(HostStatus { host, mode: to });
        }
        Ok(statuses)
    }

    /// Ask every active task on `host` to restart elsewhere.
    fn evict(&self, host: &str) -> MaintenanceResult<usize> {
        let mut evicted = 0;
        for task in self.tasks.active_on_host(host) {
            if task.state == TaskState::Restarting {
                continue;
            }
            let cause = Cause::scheduler(format!("host {host} is draining"));
            match self.tasks.transition(&task.id, TaskState::Restarting, cause) {
                Ok(_) => evicted += 1,
                Err(TaskError::IllegalTransition { .. } | TaskError::UnknownTask(_)) => {
                    debug!(task = %task.id, %host, "task left host before eviction");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if evicted > 0 {
            info!(%host, evicted, "evicted tasks from draining host");
        }
        Ok(evicted)
    }

    /// `DRAINING → DRAINED` once no active task remains. Returns whether it moved.
    fn complete_drain(&self, host: &str) -> MaintenanceResult<bool> {
        let from = {
            let _guard = self.modes.lock();
            if self.attributes.mode(host) != MaintenanceMode::Draining
                || !self.tasks.active_on_host(host).is_empty()
            {
                return Ok(false);
            }
            self.attributes.set_mode(host, MaintenanceMode::Drained)?
        };
        info!(%host, "host drained");
        self.bus.publish(LifecycleEvent::HostMaintenanceChange {
            host: host.to_string(),
            from,
            to: MaintenanceMode::Drained,
        });
        Ok(true)
    }
}

impl Subscriber for MaintenanceController {
    fn name(&self) -> &str {
        "maintenance"
    }

    fn handles(&self, kind: EventKind) -> bool {
        matches!(
            kind,
            EventKind::TaskStateChange | EventKind::LeaderAcquired | EventKind::LeaderLost
        )
    }

    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        match event {
            LifecycleEvent::LeaderAcquired => {
                self.leader.store(true, Ordering::SeqCst);
                return Ok(());
            }
            LifecycleEvent::LeaderLost => {
                self.leader.store(false, Ordering::SeqCst);
                return Ok(());
            }
            _ => {}
        }
        let LifecycleEvent::TaskStateChange {
            host: Some(host),
            from: Some(from),
            to,
            ..
        } = event
        else {
            return Ok(());
        };
        if !from.is_active() || to.is_active() {
            return Ok(());
        }
        if self.attributes.mode(host) == MaintenanceMode::Draining {
            if let Err(e) = self.complete_drain(host) {
                warn!(%host, error = %e, "could not mark host drained");
                return Err(e.into());
            }
        }
        Ok(())
    }
}
