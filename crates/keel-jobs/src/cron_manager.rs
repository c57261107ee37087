//! CronJobManager — scheduled jobs.
//!
//! Cron jobs are persisted on receipt and fired by `tick` only while this
//! replica is the leader, which it learns from `LeaderAcquired` and
//! `LeaderLost` events. Runs missed while standby are skipped; the next
//! fire time is computed from the moment leadership is acquired.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ::cron::Schedule;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use keel_core::{CronCollisionPolicy, JobKey, JobKind, JobSpec, SharedClock, TaskId, TaskState};
use keel_events::{Cause, EventKind, LifecycleEvent, Subscriber};
use keel_state::{Mutation, StateStore};
use keel_tasks::{TaskError, TaskStateMachine};

use crate::error::{JobError, JobResult};
use crate::manager::{JobManager, JobReceipt};

// ── Schedule ───────────────────────────────────────────────────────

/// A parsed cron expression (seconds-resolution, six or seven fields).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> JobResult<Self> {
        let schedule = Schedule::from_str(expr).map_err(|e| JobError::InvalidSchedule {
            schedule: expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    /// First fire time strictly after `after_millis`, in epoch millis.
    pub fn next_after(&self, after_millis: u64) -> Option<u64> {
        let after: DateTime<Utc> = DateTime::from_timestamp_millis(after_millis as i64)?;
        self.schedule
            .after(&after)
            .next()
            .map(|t| t.timestamp_millis().max(0) as u64)
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }
}

// ── Manager ────────────────────────────────────────────────────────

struct CronEntry {
    spec: JobSpec,
    schedule: CronSchedule,
    collision: CronCollisionPolicy,
    next_fire: Option<u64>,
}

/// Outcome of firing a cron job once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronRun {
    Launched(Vec<TaskId>),
    /// Previous run still active under `CancelNew`.
    Skipped,
    /// Previous run is being killed; the launch happens once it is gone.
    Deferred,
}

pub struct CronJobManager {
    store: StateStore,
    tasks: Arc<TaskStateMachine>,
    clock: SharedClock,
    jobs: RwLock<HashMap<JobKey, CronEntry>>,
    leader: AtomicBool,
    /// `KillExisting` launches waiting for the previous run to terminate.
    deferred: Mutex<HashMap<JobKey, JobSpec>>,
}

impl CronJobManager {
    pub fn new(store: StateStore, tasks: Arc<TaskStateMachine>, clock: SharedClock) -> Self {
        Self {
            store,
            tasks,
            clock,
            jobs: RwLock::new(HashMap::new()),
            leader: AtomicBool::new(false),
            deferred: Mutex::new(HashMap::new()),
        }
    }

    /// Reload persisted jobs, scheduling each from now.
    pub fn load(&self) -> JobResult<usize> {
        let now = self.clock.now_millis();
        let mut loaded = HashMap::new();
        for spec in self.store.list_cron_jobs()? {
            match entry_for(&spec, now) {
                Ok(entry) => {
                    loaded.insert(spec.key.clone(), entry);
                }
                Err(e) => warn!(job = %spec.key, error = %e, "skipping unloadable cron job"),
            }
        }
        let count = loaded.len();
        *self.jobs.write() = loaded;
        info!(count, "cron jobs loaded");
        Ok(count)
    }

    pub fn delete_job(&self, key: &JobKey) -> JobResult<()> {
        if self.jobs.write().remove(key).is_none() {
            return Err(JobError::UnknownJob(key.clone()));
        }
        self.deferred.lock().remove(key);
        self.store.commit(Mutation::DeleteCronJob(key.clone()))?;
        info!(job = %key, "cron job deleted");
        Ok(())
    }

    pub fn jobs(&self) -> Vec<JobSpec> {
        let mut jobs: Vec<JobSpec> = self.jobs.read().values().map(|e| e.spec.clone()).collect();
        jobs.sort_by(|a, b| a.key.cmp(&b.key));
        jobs
    }

    pub fn next_fire(&self, key: &JobKey) -> Option<u64> {
        self.jobs.read().get(key).and_then(|e| e.next_fire)
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    // ── Firing ─────────────────────────────────────────────────────

    /// Fire every job that is due. Does nothing unless leader.
    pub fn tick(&self) -> JobResult<Vec<(JobKey, CronRun)>> {
        if !self.is_leader() {
            return Ok(Vec::new());
        }
        let now = self.clock.now_millis();
        let due: Vec<(JobSpec, CronCollisionPolicy)> = {
            let mut jobs = self.jobs.write();
            jobs.values_mut()
                .filter(|e| e.next_fire.is_some_and(|at| at <= now))
                .map(|e| {
                    e.next_fire = e.schedule.next_after(now);
                    (e.spec.clone(), e.collision)
                })
                .collect()
        };

        let mut runs = Vec::with_capacity(due.len());
        for (spec, collision) in due {
            let run = self.fire(&spec, collision)?;
            runs.push((spec.key, run));
        }
        Ok(runs)
    }

    /// Fire a job now, ignoring its schedule.
    pub fn trigger(&self, key: &JobKey) -> JobResult<CronRun> {
        if !self.is_leader() {
            return Err(JobError::NotLeader);
        }
        let (spec, collision) = {
            let jobs = self.jobs.read();
            let entry = jobs.get(key).ok_or_else(|| JobError::UnknownJob(key.clone()))?;
            (entry.spec.clone(), entry.collision)
        };
        info!(job = %key, "cron job triggered manually");
        self.fire(&spec, collision)
    }

    fn fire(&self, spec: &JobSpec, collision: CronCollisionPolicy) -> JobResult<CronRun> {
        let live = self.live_tasks(&spec.key);
        if live.is_empty() {
            return self.launch(spec).map(CronRun::Launched);
        }

        match collision {
            CronCollisionPolicy::RunOverlap => {
                debug!(job = %spec.key, live = live.len(), "cron run overlaps previous run");
                self.launch(spec).map(CronRun::Launched)
            }
            CronCollisionPolicy::CancelNew => {
                info!(job = %spec.key, live = live.len(), "cron run skipped, previous run still active");
                Ok(CronRun::Skipped)
            }
            CronCollisionPolicy::KillExisting => {
                self.kill_live(&spec.key)?;
                if self.live_tasks(&spec.key).is_empty() {
                    return self.launch(spec).map(CronRun::Launched);
                }
                // Park the run; the terminal event of the last live task launches it.
                self.deferred.lock().insert(spec.key.clone(), spec.clone());
                Ok(match self.launch_deferred(&spec.key)? {
                    Some(ids) => CronRun::Launched(ids),
                    None => CronRun::Deferred,
                })
            }
        }
    }

    fn live_tasks(&self, key: &JobKey) -> Vec<TaskId> {
        self.tasks
            .by_job(key)
            .iter()
            .filter(|t| !t.state.is_terminal())
            .map(|t| t.id.clone())
            .collect()
    }

    fn kill_live(&self, key: &JobKey) -> JobResult<()> {
        // Killing a restarting task spawns a replacement, so sweep until nothing new appears.
        loop {
            let mut killed = 0;
            for id in self.live_tasks(key) {
                match self.tasks.transition(&id, TaskState::Killed, Cause::scheduler("cron collision")) {
                    Ok(_) => killed += 1,
                    Err(TaskError::IllegalTransition { .. } | TaskError::UnknownTask(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if killed == 0 {
                return Ok(());
            }
            info!(job = %key, killed, "killed previous cron run");
        }
    }

    /// Launch a deferred run if its job has no live tasks left.
    fn launch_deferred(&self, key: &JobKey) -> JobResult<Option<Vec<TaskId>>> {
        if !self.live_tasks(key).is_empty() {
            return Ok(None);
        }
        let Some(spec) = self.deferred.lock().remove(key) else {
            return Ok(None);
        };
        self.launch(&spec).map(Some)
    }

    fn launch(&self, spec: &JobSpec) -> JobResult<Vec<TaskId>> {
        let mut created = Vec::with_capacity(spec.instances as usize);
        for instance in 0..spec.instances {
            let transition =
                self.tasks
                    .insert_pending(&spec.key, instance, spec.task.clone(), Cause::scheduler("cron run"))?;
            created.push(transition.task.id.clone());
        }
        info!(job = %spec.key, tasks = created.len(), "cron run launched");
        Ok(created)
    }

    // ── Background loop ────────────────────────────────────────────

    pub async fn run(self: Arc<Self>, tick_interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        error!(error = %e, "cron tick failed");
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        debug!("cron loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

fn entry_for(spec: &JobSpec, now: u64) -> JobResult<CronEntry> {
    let JobKind::Cron { schedule, collision } = &spec.kind else {
        return Err(JobError::WrongKind {
            key: spec.key.clone(),
            manager: "cron",
        });
    };
    let schedule = CronSchedule::parse(schedule)?;
    Ok(CronEntry {
        spec: spec.clone(),
        next_fire: schedule.next_after(now),
        schedule,
        collision: *collision,
    })
}

impl JobManager for CronJobManager {
    fn name(&self) -> &'static str {
        "cron"
    }

    fn accepts(&self, kind: &JobKind) -> bool {
        matches!(kind, JobKind::Cron { .. })
    }

    fn receive_job(&self, job: &JobSpec) -> JobResult<JobReceipt> {
        let entry = entry_for(job, self.clock.now_millis())?;
        self.store.commit(Mutation::SaveCronJob(job.clone()))?;
        info!(job = %job.key, schedule = entry.schedule.expr(), next_fire = ?entry.next_fire, "cron job scheduled");
        self.jobs.write().insert(job.key.clone(), entry);
        Ok(JobReceipt {
            key: job.key.clone(),
            manager: JobManager::name(self),
            tasks: Vec::new(),
        })
    }
}

impl Subscriber for CronJobManager {
    fn name(&self) -> &str {
        "cron"
    }

    fn handles(&self, kind: EventKind) -> bool {
        matches!(
            kind,
            EventKind::LeaderAcquired | EventKind::LeaderLost | EventKind::TaskStateChange
        )
    }

    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        match event {
            LifecycleEvent::LeaderAcquired => {
                self.load()?;
                self.leader.store(true, Ordering::SeqCst);
            }
            LifecycleEvent::LeaderLost => {
                self.leader.store(false, Ordering::SeqCst);
                self.deferred.lock().clear();
            }
            LifecycleEvent::TaskStateChange { job, to, .. } if to.is_terminal() => {
                let waiting = self.deferred.lock().contains_key(job);
                if waiting {
                    if let Some(ids) = self.launch_deferred(job)? {
                        debug!(%job, tasks = ids.len(), "deferred cron run launched");
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
