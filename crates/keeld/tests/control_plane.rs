//! End-to-end control plane tests.
//!
//! Each test assembles the full control plane in-process against a
//! scripted resource manager and drives it through offers and status
//! updates the way a real resource manager would.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use keel_core::{
    FakeClock, JobKey, JobKind, JobSpec, KeelConfig, LeadershipConfig, MaintenanceMode, Offer,
    OfferId, Resources, TaskConfig, TaskId, TaskState,
};
use keel_jobs::JobError;
use keel_lifecycle::{
    BoxFuture, DriverError, DriverEvent, DriverHandle, DriverResult, FrameworkInfo, LaunchSpec,
    LeaderGroup, Phase, Registration, ResourceManager, StatusUpdate,
};
use keel_maintenance::MaintenanceError;
use keel_state::StateStore;
use keeld::ControlPlane;

// ── Scripted resource manager ─────────────────────────────────────

#[derive(Default)]
struct Recorded {
    launched: Vec<LaunchSpec>,
    declined: Vec<OfferId>,
    killed: Vec<TaskId>,
}

#[derive(Default)]
struct ScriptedManager {
    registrations: AtomicUsize,
    hang: AtomicBool,
    events: Mutex<Option<mpsc::Sender<DriverEvent>>>,
    recorded: Arc<Mutex<Recorded>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedManager {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn send(&self, event: DriverEvent) {
        let tx = self.events.lock().clone().expect("not registered");
        tx.send(event).await.expect("driver gone");
    }

    async fn offer(&self, id: &str, host: &str) {
        self.send(DriverEvent::Offer(Offer {
            id: id.to_string(),
            host: host.to_string(),
            resources: Resources::new(4.0, 4096, 4096, 4),
            attributes: Default::default(),
        }))
        .await;
    }

    async fn status(&self, task_id: &str, state: TaskState) {
        self.send(DriverEvent::StatusUpdate(StatusUpdate {
            task_id: task_id.to_string(),
            state,
            message: format!("reported {state}"),
        }))
        .await;
    }

    fn launched(&self) -> Vec<TaskId> {
        self.recorded.lock().launched.iter().map(|s| s.task_id.clone()).collect()
    }

    fn declined(&self) -> Vec<OfferId> {
        self.recorded.lock().declined.clone()
    }

    fn killed(&self) -> Vec<TaskId> {
        self.recorded.lock().killed.clone()
    }
}

impl ResourceManager for ScriptedManager {
    fn register<'a>(&'a self, _framework: &'a FrameworkInfo) -> BoxFuture<'a, DriverResult<Registration>> {
        Box::pin(async move {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let (tx, rx) = mpsc::channel(64);
            *self.events.lock() = Some(tx);
            self.closed.store(false, Ordering::SeqCst);
            let handle = Arc::new(ScriptedHandle {
                recorded: self.recorded.clone(),
                closed: self.closed.clone(),
            });
            Ok(Registration { handle, events: rx })
        })
    }
}

struct ScriptedHandle {
    recorded: Arc<Mutex<Recorded>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedHandle {
    fn open(&self) -> DriverResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }
}

impl DriverHandle for ScriptedHandle {
    fn launch(&self, _offer_id: &OfferId, spec: LaunchSpec) -> DriverResult<()> {
        self.open()?;
        self.recorded.lock().launched.push(spec);
        Ok(())
    }

    fn decline(&self, offer_id: &OfferId) -> DriverResult<()> {
        self.open()?;
        self.recorded.lock().declined.push(offer_id.clone());
        Ok(())
    }

    fn kill(&self, task_id: &TaskId) -> DriverResult<()> {
        self.open()?;
        self.recorded.lock().killed.push(task_id.clone());
        Ok(())
    }

    fn acknowledge(&self, _update: &StatusUpdate) -> DriverResult<()> {
        self.open()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Harness ───────────────────────────────────────────────────────

struct Node {
    plane: Arc<ControlPlane>,
    manager: Arc<ScriptedManager>,
    shutdown: watch::Sender<bool>,
    run: JoinHandle<anyhow::Result<()>>,
}

fn config() -> KeelConfig {
    KeelConfig {
        leadership: LeadershipConfig {
            registration_timeout_ms: 500,
            reelection_backoff_ms: 10,
            max_reelection_backoff_ms: 50,
            session_timeout_ms: 500,
        },
        ..Default::default()
    }
}

fn start(group: &Arc<LeaderGroup>, replica: &str, store: StateStore, clock: Arc<FakeClock>) -> Node {
    start_with(group, replica, store, clock, ScriptedManager::new())
}

fn start_with(
    group: &Arc<LeaderGroup>,
    replica: &str,
    store: StateStore,
    clock: Arc<FakeClock>,
    manager: Arc<ScriptedManager>,
) -> Node {
    let plane = Arc::new(
        ControlPlane::build(
            config(),
            store,
            clock,
            replica,
            Arc::new(group.member(replica)),
            manager.clone(),
        )
        .unwrap(),
    );
    let (shutdown, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(plane.clone().run(shutdown_rx));
    Node {
        plane,
        manager,
        shutdown,
        run,
    }
}

async fn reach(node: &Node, phase: Phase) {
    let mut phases = node.plane.lifecycle.watch();
    tokio::time::timeout(Duration::from_secs(3), phases.wait_for(|p| *p == phase))
        .await
        .unwrap_or_else(|_| panic!("phase {phase:?} not reached"))
        .unwrap();
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

fn job(name: &str, instances: u32) -> JobSpec {
    JobSpec {
        key: JobKey::new("www", "prod", name),
        kind: JobKind::Immediate,
        task: TaskConfig::new(Resources::new(1.0, 512, 512, 0)),
        instances,
    }
}

fn state_of(node: &Node, id: &str) -> Option<TaskState> {
    node.plane.tasks.get(id).map(|t| t.state)
}

// ── Scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn task_runs_to_completion_and_is_pruned() {
    let group = LeaderGroup::new(Duration::from_secs(1));
    let clock = FakeClock::new(1_000_000);
    let node = start(&group, "r1", StateStore::open_in_memory().unwrap(), clock.clone());
    reach(&node, Phase::Active).await;

    let receipt = node.plane.submit(job("api", 1)).unwrap();
    let id = receipt.tasks[0].clone();
    assert_eq!(state_of(&node, &id), Some(TaskState::Pending));

    node.manager.offer("o1", "host-a").await;
    eventually("launch", || node.manager.launched() == vec![id.clone()]).await;
    assert_eq!(state_of(&node, &id), Some(TaskState::Assigned));

    node.manager.status(&id, TaskState::Starting).await;
    node.manager.status(&id, TaskState::Running).await;
    eventually("running", || state_of(&node, &id) == Some(TaskState::Running)).await;
    assert_eq!(node.plane.quota.role("www").tasks, 1);
    let metrics = node.plane.render_metrics();
    assert!(metrics.contains("keel_tasks{state=\"RUNNING\"} 1"));
    assert!(metrics.contains("keel_quota_tasks{role=\"www\"} 1"));

    node.manager.status(&id, TaskState::Finished).await;
    eventually("finish", || state_of(&node, &id) == Some(TaskState::Finished)).await;
    assert!(node.plane.quota.snapshot().is_empty());

    let task = node.plane.tasks.get(&id).unwrap();
    let walk: Vec<TaskState> = task.history.iter().map(|e| e.state).collect();
    assert_eq!(
        walk,
        vec![
            TaskState::Pending,
            TaskState::Assigned,
            TaskState::Starting,
            TaskState::Running,
            TaskState::Finished
        ]
    );

    // Still queryable inside the retention window.
    clock.advance(Duration::from_secs(60));
    assert!(node.plane.tasks.prune_expired().unwrap().is_empty());

    clock.advance(Duration::from_secs(900));
    assert_eq!(node.plane.tasks.prune_expired().unwrap(), vec![id.clone()]);
    assert!(node.plane.tasks.get(&id).is_none());

    let vars = node.plane.vars.snapshot();
    assert!(vars.leader);
    assert_eq!(vars.transitions_total, 5);
    assert_eq!(vars.tasks_by_state[&TaskState::Finished], 0);

    node.shutdown.send(true).unwrap();
    node.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn draining_host_evicts_and_vetoes_new_work() {
    let group = LeaderGroup::new(Duration::from_secs(1));
    let node = start(&group, "r1", StateStore::open_in_memory().unwrap(), FakeClock::new(0));
    reach(&node, Phase::Active).await;

    let id = node.plane.submit(job("api", 1)).unwrap().tasks[0].clone();
    node.manager.offer("o1", "host-a").await;
    eventually("launch", || !node.manager.launched().is_empty()).await;
    node.manager.status(&id, TaskState::Running).await;
    eventually("running", || state_of(&node, &id) == Some(TaskState::Running)).await;

    let hosts = vec!["host-a".to_string()];
    node.plane.maintenance.start_maintenance(&hosts).unwrap();
    node.plane.maintenance.drain(&hosts).unwrap();

    // Eviction goes through the driver.
    assert_eq!(state_of(&node, &id), Some(TaskState::Restarting));
    assert_eq!(node.manager.killed(), vec![id.clone()]);
    assert_eq!(
        node.plane.maintenance.get_status(&hosts)[0].mode,
        MaintenanceMode::Draining
    );

    node.manager.status(&id, TaskState::Killed).await;
    eventually("drained", || {
        node.plane.maintenance.get_status(&hosts)[0].mode == MaintenanceMode::Drained
    })
    .await;
    assert_eq!(state_of(&node, &id), Some(TaskState::Killed));

    // The replacement is pending and stays off the drained host.
    eventually("replacement", || node.plane.tasks.by_state(TaskState::Pending).len() == 1).await;
    let replacement = node.plane.tasks.by_state(TaskState::Pending);
    node.manager.offer("o2", "host-a").await;
    eventually("decline", || node.manager.declined() == vec!["o2".to_string()]).await;

    node.manager.offer("o3", "host-b").await;
    eventually("relaunch", || node.manager.launched().len() == 2).await;
    assert_eq!(node.manager.launched()[1], replacement[0].id);
    assert_eq!(
        node.plane.tasks.get(&replacement[0].id).unwrap().assigned_host.as_deref(),
        Some("host-b")
    );
}

#[tokio::test]
async fn leadership_hands_over_between_replicas() {
    let group = LeaderGroup::new(Duration::from_secs(1));
    let a = start(&group, "a", StateStore::open_in_memory().unwrap(), FakeClock::new(0));
    reach(&a, Phase::Active).await;
    let b = start(&group, "b", StateStore::open_in_memory().unwrap(), FakeClock::new(0));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(b.plane.lifecycle.phase(), Phase::Standby);
    assert!(matches!(b.plane.submit(job("api", 1)), Err(JobError::NotLeader)));

    group.revoke();
    reach(&b, Phase::Active).await;

    assert_ne!(a.plane.lifecycle.phase(), Phase::Active);
    assert!(!a.plane.lifecycle.driver().reference().is_set());
    assert!(a.manager.closed.load(Ordering::SeqCst));
    assert!(!a.plane.vars.snapshot().leader);
    eventually("b leader", || b.plane.vars.snapshot().leader).await;
    assert!(b.plane.submit(job("api", 1)).is_ok());

    // The demoted replica no longer acts on hosts.
    let hosts = vec!["host-a".to_string()];
    assert!(matches!(
        a.plane.maintenance.start_maintenance(&hosts),
        Err(MaintenanceError::NotLeader)
    ));
    assert_eq!(a.plane.maintenance.get_status(&hosts)[0].mode, MaintenanceMode::None);
    assert!(b.plane.maintenance.start_maintenance(&hosts).is_ok());
}

#[tokio::test]
async fn standby_replica_leaves_tasks_alone() {
    let group = LeaderGroup::new(Duration::from_secs(1));
    let a = start(&group, "a", StateStore::open_in_memory().unwrap(), FakeClock::new(0));
    reach(&a, Phase::Active).await;

    let id = a.plane.submit(job("api", 1)).unwrap().tasks[0].clone();
    a.manager.offer("o1", "host-a").await;
    eventually("launch", || !a.manager.launched().is_empty()).await;
    a.manager.status(&id, TaskState::Running).await;
    eventually("running", || state_of(&a, &id) == Some(TaskState::Running)).await;
    let hosts = vec!["host-a".to_string()];
    a.plane.maintenance.start_maintenance(&hosts).unwrap();

    let b = start(&group, "b", StateStore::open_in_memory().unwrap(), FakeClock::new(0));
    tokio::time::sleep(Duration::from_millis(50)).await;
    group.revoke();
    reach(&b, Phase::Active).await;
    assert_eq!(a.plane.lifecycle.phase(), Phase::Standby);

    assert!(matches!(
        a.plane.maintenance.drain(&hosts),
        Err(MaintenanceError::NotLeader)
    ));
    assert!(a.plane.maintenance.reconcile().unwrap().is_empty());
    assert_eq!(state_of(&a, &id), Some(TaskState::Running));
    assert!(a.manager.killed().is_empty());
}

#[tokio::test]
async fn leadership_lost_mid_registration_processes_no_offers() {
    let group = LeaderGroup::new(Duration::from_secs(1));
    let slow = ScriptedManager::new();
    slow.hang.store(true, Ordering::SeqCst);
    let a = start_with(
        &group,
        "a",
        StateStore::open_in_memory().unwrap(),
        FakeClock::new(0),
        slow,
    );
    reach(&a, Phase::Acquiring).await;
    let b = start(&group, "b", StateStore::open_in_memory().unwrap(), FakeClock::new(0));
    tokio::time::sleep(Duration::from_millis(50)).await;

    group.revoke();
    reach(&b, Phase::Active).await;

    assert!(!a.plane.lifecycle.driver().is_running().await);
    assert!(!a.plane.lifecycle.driver().reference().is_set());
    assert!(a.manager.events.lock().is_none());
    assert!(!a.plane.vars.snapshot().leader);
}

#[tokio::test]
async fn fatal_disconnect_terminates_the_control_plane() {
    let group = LeaderGroup::new(Duration::from_secs(1));
    let node = start(&group, "r1", StateStore::open_in_memory().unwrap(), FakeClock::new(0));
    reach(&node, Phase::Active).await;

    node.manager
        .send(DriverEvent::Disconnected {
            fatal: true,
            reason: "framework removed".into(),
        })
        .await;

    let result = tokio::time::timeout(Duration::from_secs(3), node.run)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_err());
    assert_eq!(node.plane.lifecycle.phase(), Phase::Terminated);
    assert!(!node.plane.vars.snapshot().leader);
}

#[tokio::test]
async fn storage_failure_past_retry_budget_terminates_the_control_plane() {
    let group = LeaderGroup::new(Duration::from_secs(1));
    let store = StateStore::open_in_memory().unwrap();
    let mut node = start(&group, "r1", store.clone(), FakeClock::new(0));
    reach(&node, Phase::Active).await;

    let id = node.plane.submit(job("api", 1)).unwrap().tasks[0].clone();
    node.manager.offer("o1", "host-a").await;
    eventually("launch", || !node.manager.launched().is_empty()).await;

    store.fail_next_commits(100);
    node.manager.status(&id, TaskState::Running).await;

    let result = tokio::time::timeout(Duration::from_secs(3), &mut node.run)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_err());
    assert_eq!(node.plane.lifecycle.phase(), Phase::Terminated);
    assert_eq!(state_of(&node, &id), Some(TaskState::Assigned));
    assert!(node.manager.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn restarted_scheduler_recovers_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.redb");
    let group = LeaderGroup::new(Duration::from_secs(1));

    let id = {
        let node = start(&group, "r1", StateStore::open(&path).unwrap(), FakeClock::new(0));
        reach(&node, Phase::Active).await;
        let id = node.plane.submit(job("api", 1)).unwrap().tasks[0].clone();
        node.manager.offer("o1", "host-a").await;
        eventually("launch", || !node.manager.launched().is_empty()).await;
        node.shutdown.send(true).unwrap();
        node.run.await.unwrap().unwrap();
        id
    };

    let node = start(&group, "r1", StateStore::open(&path).unwrap(), FakeClock::new(0));
    reach(&node, Phase::Active).await;
    let task = node.plane.tasks.get(&id).expect("task recovered");
    assert_eq!(task.state, TaskState::Assigned);
    assert_eq!(task.assigned_host.as_deref(), Some("host-a"));
    assert_eq!(node.plane.vars.snapshot().tasks_by_state[&TaskState::Assigned], 1);
}

#[tokio::test]
async fn seed_jobs_are_submitted_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.redb");
    let group = LeaderGroup::new(Duration::from_secs(1));
    let seeded = |store: StateStore| {
        let mut config = config();
        config.jobs = vec![job("seeded", 2)];
        let manager = ScriptedManager::new();
        let plane = Arc::new(
            ControlPlane::build(
                config,
                store,
                FakeClock::new(0),
                "r1",
                Arc::new(group.member("r1")),
                manager,
            )
            .unwrap(),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(plane.clone().run(shutdown_rx));
        (plane, shutdown, run)
    };

    let (plane, shutdown, run) = seeded(StateStore::open(&path).unwrap());
    eventually("seeding", || plane.tasks.len() == 2).await;
    shutdown.send(true).unwrap();
    run.await.unwrap().unwrap();
    drop(plane);

    let (plane, _shutdown, _run) = seeded(StateStore::open(&path).unwrap());
    let mut phases = plane.lifecycle.watch();
    tokio::time::timeout(Duration::from_secs(3), phases.wait_for(|p| *p == Phase::Active))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(plane.tasks.len(), 2);
}
