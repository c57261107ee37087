//! Control plane wiring.
//!
//! Assembles every subsystem around one store and one event bus:
//!
//! ```text
//! StateStore ─┬─ TaskStateMachine ──publish──▶ EventBus
//!             ├─ AttributeStore                 ├── MaintenanceController
//!             └─ CronJobManager                 ├── CronJobManager
//!                                               ├── TaskVars
//!                                               ├── QuotaUsage
//!                                               └── KillForwarder
//! SchedulerLifecycle
//!   └── DriverLifecycle ──pump──▶ Launchers (GC, user) ──▶ TaskAssigner
//! ```
//!
//! Background loops (pruner, maintenance reconciliation, cron ticks) run for
//! the life of the process. Each is safe on a standby replica: the pruner
//! only removes expired terminal records, and the reconciler and cron
//! manager do nothing until they have seen `LeaderAcquired`.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use keel_core::{JobKind, JobSpec, KeelConfig, SharedClock};
use keel_events::EventBus;
use keel_jobs::{CronJobManager, ImmediateJobManager, JobError, JobManagers, JobReceipt, JobResult};
use keel_lifecycle::{
    Candidate, DriverLifecycle, DriverReference, FrameworkInfo, GcExecutorLauncher, KillForwarder,
    LeadershipState, Launchers, Phase, ResourceManager, SchedulerLifecycle, UserTaskLauncher,
};
use keel_maintenance::MaintenanceController;
use keel_metrics::{QuotaUsage, TaskVars, render_prometheus, render_quota};
use keel_placement::TaskAssigner;
use keel_state::{AttributeStore, StateStore};
use keel_tasks::TaskStateMachine;

pub struct ControlPlane {
    config: KeelConfig,
    pub bus: Arc<EventBus>,
    pub tasks: Arc<TaskStateMachine>,
    pub attributes: Arc<AttributeStore>,
    pub maintenance: Arc<MaintenanceController>,
    pub cron: Arc<CronJobManager>,
    pub jobs: JobManagers,
    pub vars: Arc<TaskVars>,
    pub quota: Arc<QuotaUsage>,
    pub lifecycle: Arc<SchedulerLifecycle>,
}

impl ControlPlane {
    pub fn build(
        config: KeelConfig,
        store: StateStore,
        clock: SharedClock,
        replica: &str,
        candidate: Arc<dyn Candidate>,
        manager: Arc<dyn ResourceManager>,
    ) -> anyhow::Result<Self> {
        let bus = Arc::new(EventBus::new(std::time::Duration::from_millis(
            config.events.slow_subscriber_ms,
        )));
        let tasks = Arc::new(TaskStateMachine::new(
            store.clone(),
            bus.clone(),
            clock.clone(),
            &config.tasks,
        ));
        let attributes = Arc::new(AttributeStore::load(store.clone())?);

        let maintenance = Arc::new(MaintenanceController::new(
            attributes.clone(),
            tasks.clone(),
            bus.clone(),
        ));
        let cron = Arc::new(CronJobManager::new(store, tasks.clone(), clock.clone()));
        let jobs = JobManagers::new()
            .with_manager(Arc::new(ImmediateJobManager::new(tasks.clone())))
            .with_manager(cron.clone());
        let vars = Arc::new(TaskVars::new(Arc::downgrade(&tasks)));
        let quota = Arc::new(QuotaUsage::new(Arc::downgrade(&tasks)));

        let driver_ref = DriverReference::new();
        let launchers = Launchers::new(attributes.clone(), driver_ref.clone())
            .with_launcher(Arc::new(GcExecutorLauncher::new(
                config.gc_executor.clone(),
                clock,
            )))
            .with_launcher(Arc::new(UserTaskLauncher::new(
                tasks.clone(),
                TaskAssigner::new(tasks.clone(), attributes.clone()),
            )));

        bus.register(maintenance.clone());
        bus.register(cron.clone());
        bus.register(vars.clone());
        bus.register(quota.clone());
        bus.register(Arc::new(KillForwarder::new(driver_ref.clone())));

        let framework = FrameworkInfo {
            name: config.scheduler.framework_name.clone(),
            cluster: config.scheduler.cluster_name.clone(),
            replica: replica.to_string(),
        };
        let (driver, notices) = DriverLifecycle::new(manager, framework, Arc::new(launchers), driver_ref);
        let lifecycle = Arc::new(SchedulerLifecycle::new(
            replica,
            candidate,
            Arc::new(driver),
            notices,
            tasks.clone(),
            config.leadership.clone(),
        ));

        info!(replica, subscribers = bus.subscriber_count(), "control plane assembled");
        Ok(Self {
            config,
            bus,
            tasks,
            attributes,
            maintenance,
            cron,
            jobs,
            vars,
            quota,
            lifecycle,
        })
    }

    /// Submit a job. Only the active scheduler accepts jobs.
    pub fn submit(&self, job: JobSpec) -> JobResult<JobReceipt> {
        if self.lifecycle.leadership() != LeadershipState::Active {
            return Err(JobError::NotLeader);
        }
        self.jobs.submit(job)
    }

    /// Prometheus text exposition of the task counters and quota usage.
    pub fn render_metrics(&self) -> String {
        let mut out = render_prometheus(&self.vars.snapshot());
        out.push_str(&render_quota(&self.quota.snapshot()));
        out
    }

    /// Submit configured jobs that the store knows nothing about.
    fn seed_jobs(&self) {
        let known_cron: Vec<_> = self.cron.jobs().into_iter().map(|j| j.key).collect();
        for job in &self.config.jobs {
            let known = match job.kind {
                JobKind::Immediate => !self.tasks.by_job(&job.key).is_empty(),
                JobKind::Cron { .. } => known_cron.contains(&job.key),
            };
            if known {
                debug!(job = %job.key, "seed job already known");
                continue;
            }
            if let Err(e) = self.submit(job.clone()) {
                warn!(job = %job.key, error = %e, "seed job rejected");
            }
        }
    }

    /// Run until shutdown or a fatal lifecycle error.
    pub async fn run(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);

        let pruner = tokio::spawn(
            self.tasks
                .clone()
                .run_pruner(self.config.tasks.prune_interval(), stop_rx.clone()),
        );
        let reconciler = tokio::spawn(self.maintenance.clone().run(
            std::time::Duration::from_secs(self.config.maintenance.poll_interval_secs),
            stop_rx.clone(),
        ));
        let cron = tokio::spawn(self.cron.clone().run(
            std::time::Duration::from_secs(self.config.cron.tick_interval_secs),
            stop_rx.clone(),
        ));
        let seeder = tokio::spawn({
            let plane = self.clone();
            let mut phases = self.lifecycle.watch();
            let mut stop_rx = stop_rx.clone();
            async move {
                loop {
                    tokio::select! {
                        changed = phases.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let phase = *phases.borrow_and_update();
                            if phase == Phase::Active {
                                plane.seed_jobs();
                            }
                        }
                        result = stop_rx.changed() => {
                            if result.is_err() || *stop_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        let result = self.lifecycle.clone().run(shutdown_rx).await;

        let _ = stop_tx.send(true);
        let _ = tokio::join!(pruner, reconciler, cron, seeder);

        let vars = self.vars.snapshot();
        info!(
            tasks = self.tasks.len(),
            transitions = vars.transitions_total,
            "control plane stopped"
        );
        result.map_err(anyhow::Error::from)
    }
}

impl Drop for ControlPlane {
    /// Subscribers hold the state machine, which holds the bus, which holds
    /// the subscribers. Clearing the bus releases the store.
    fn drop(&mut self) {
        self.bus.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keel_core::FakeClock;
    use keel_lifecycle::LeaderGroup;

    use super::*;
    use crate::loopback::LoopbackResourceManager;

    #[tokio::test]
    async fn dropping_the_plane_releases_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.redb");
        let group = LeaderGroup::new(Duration::from_secs(1));
        let build = |store: StateStore| {
            ControlPlane::build(
                KeelConfig::default(),
                store,
                FakeClock::new(0),
                "r1",
                Arc::new(group.member("r1")),
                Arc::new(LoopbackResourceManager::new(Vec::new(), Duration::from_secs(1))),
            )
            .unwrap()
        };

        let plane = build(StateStore::open(&path).unwrap());
        let tasks = Arc::downgrade(&plane.tasks);
        let maintenance = Arc::downgrade(&plane.maintenance);
        drop(plane);

        assert!(tasks.upgrade().is_none());
        assert!(maintenance.upgrade().is_none());
        let reopened = build(StateStore::open(&path).unwrap());
        assert_eq!(reopened.bus.subscriber_count(), 5);
    }
}
