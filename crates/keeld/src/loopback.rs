//! Loopback resource manager for standalone mode.
//!
//! Offers the `[[hosts]]` from the config, minus whatever is running on
//! them, and "runs" launched tasks in memory: each launch is reported
//! STARTING then RUNNING. Tasks stay running until killed. System tasks
//! (ids starting with `system-`) finish right after they start.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use keel_core::{HostConfig, HostId, Offer, OfferId, Resources, TaskId, TaskState};
use keel_lifecycle::{
    BoxFuture, DriverError, DriverEvent, DriverHandle, DriverResult, FrameworkInfo, LaunchSpec,
    Registration, ResourceManager, StatusUpdate,
};

const EVENT_BUFFER: usize = 1024;

#[derive(Default)]
struct Cluster {
    running: HashMap<TaskId, (HostId, Resources)>,
    outstanding: HashMap<OfferId, HostId>,
    next_offer: u64,
}

impl Cluster {
    fn free(&self, host: &HostConfig) -> Resources {
        let mut free = host.resources.clone();
        for (h, used) in self.running.values() {
            if *h == host.host {
                free.cpus = (free.cpus - used.cpus).max(0.0);
                free.ram_mb = free.ram_mb.saturating_sub(used.ram_mb);
                free.disk_mb = free.disk_mb.saturating_sub(used.disk_mb);
                free.ports = free.ports.saturating_sub(used.ports);
            }
        }
        free
    }
}

pub struct LoopbackResourceManager {
    hosts: Vec<HostConfig>,
    offer_interval: Duration,
    cluster: Arc<Mutex<Cluster>>,
}

impl LoopbackResourceManager {
    pub fn new(hosts: Vec<HostConfig>, offer_interval: Duration) -> Self {
        Self {
            hosts,
            offer_interval,
            cluster: Arc::new(Mutex::new(Cluster::default())),
        }
    }

    /// Tasks currently running, per host.
    pub fn running_on(&self, host: &str) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .cluster
            .lock()
            .running
            .iter()
            .filter(|(_, (h, _))| h == host)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl ResourceManager for LoopbackResourceManager {
    fn register<'a>(&'a self, framework: &'a FrameworkInfo) -> BoxFuture<'a, DriverResult<Registration>> {
        Box::pin(async move {
            if self.hosts.is_empty() {
                warn!("loopback resource manager has no hosts configured");
            }
            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            let handle = Arc::new(LoopbackHandle {
                tx: tx.clone(),
                cluster: self.cluster.clone(),
                closed: Arc::new(AtomicBool::new(false)),
            });
            tokio::spawn(offer_loop(
                self.hosts.clone(),
                self.offer_interval,
                self.cluster.clone(),
                tx,
                handle.closed.clone(),
            ));
            info!(framework = %framework.name, replica = %framework.replica, hosts = self.hosts.len(), "loopback registration accepted");
            Ok(Registration { handle, events: rx })
        })
    }
}

async fn offer_loop(
    hosts: Vec<HostConfig>,
    interval: Duration,
    cluster: Arc<Mutex<Cluster>>,
    tx: mpsc::Sender<DriverEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let offers: Vec<Offer> = {
            let mut cluster = cluster.lock();
            let mut offers = Vec::new();
            for host in &hosts {
                if cluster.outstanding.values().any(|h| *h == host.host) {
                    continue;
                }
                cluster.next_offer += 1;
                let id = format!("loopback-{}", cluster.next_offer);
                cluster.outstanding.insert(id.clone(), host.host.clone());
                offers.push(Offer {
                    id,
                    host: host.host.clone(),
                    resources: cluster.free(host),
                    attributes: host.attribute_map(),
                });
            }
            offers
        };
        for offer in offers {
            trace!(offer = %offer.id, host = %offer.host, "sending offer");
            if tx.send(DriverEvent::Offer(offer)).await.is_err() {
                debug!("offer loop stopping, registration dropped");
                return;
            }
        }
    }
}

struct LoopbackHandle {
    tx: mpsc::Sender<DriverEvent>,
    cluster: Arc<Mutex<Cluster>>,
    closed: Arc<AtomicBool>,
}

impl LoopbackHandle {
    fn check_open(&self) -> DriverResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    fn report(&self, task_id: &TaskId, state: TaskState, message: &str) -> DriverResult<()> {
        let update = StatusUpdate {
            task_id: task_id.clone(),
            state,
            message: message.to_string(),
        };
        self.tx
            .try_send(DriverEvent::StatusUpdate(update))
            .map_err(|_| DriverError::Closed)
    }
}

impl DriverHandle for LoopbackHandle {
    fn launch(&self, offer_id: &OfferId, spec: LaunchSpec) -> DriverResult<()> {
        self.check_open()?;
        {
            let mut cluster = self.cluster.lock();
            cluster.outstanding.remove(offer_id);
            cluster
                .running
                .insert(spec.task_id.clone(), (spec.host.clone(), spec.resources.clone()));
        }
        debug!(task = %spec.task_id, host = %spec.host, command = %spec.command, "loopback launch");
        self.report(&spec.task_id, TaskState::Starting, "starting")?;
        self.report(&spec.task_id, TaskState::Running, "running")?;
        if spec.task_id.starts_with("system-") {
            self.cluster.lock().running.remove(&spec.task_id);
            self.report(&spec.task_id, TaskState::Finished, "system task complete")?;
        }
        Ok(())
    }

    fn decline(&self, offer_id: &OfferId) -> DriverResult<()> {
        self.check_open()?;
        self.cluster.lock().outstanding.remove(offer_id);
        Ok(())
    }

    fn kill(&self, task_id: &TaskId) -> DriverResult<()> {
        self.check_open()?;
        let removed = self.cluster.lock().running.remove(task_id).is_some();
        if removed {
            self.report(task_id, TaskState::Killed, "killed by scheduler")?;
        }
        Ok(())
    }

    fn acknowledge(&self, update: &StatusUpdate) -> DriverResult<()> {
        self.check_open()?;
        trace!(task = %update.task_id, state = %update.state, "status acknowledged");
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut cluster = self.cluster.lock();
            cluster.outstanding.clear();
            info!("loopback registration closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn host(name: &str) -> HostConfig {
        HostConfig {
            host: name.to_string(),
            resources: Resources::new(4.0, 4096, 4096, 4),
            attributes: [("rack".to_string(), "r1".to_string())].into_iter().collect(),
        }
    }

    fn framework() -> FrameworkInfo {
        FrameworkInfo {
            name: "keel".into(),
            cluster: "test".into(),
            replica: "r1".into(),
        }
    }

    #[tokio::test]
    async fn offers_every_host_until_answered() {
        let rm = LoopbackResourceManager::new(vec![host("a"), host("b")], Duration::from_millis(10));
        let mut reg = rm.register(&framework()).await.unwrap();

        let mut hosts = HashSet::new();
        for _ in 0..2 {
            let Some(DriverEvent::Offer(offer)) = reg.events.recv().await else {
                panic!("expected offer");
            };
            assert!(offer.attributes["rack"].contains("r1"));
            hosts.insert(offer.host);
        }
        assert_eq!(hosts.len(), 2);

        // No second offer per host while the first is outstanding.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(reg.events.try_recv().is_err());
        reg.handle.close();
    }

    #[tokio::test]
    async fn launch_reports_running_and_consumes_capacity() {
        let rm = LoopbackResourceManager::new(vec![host("a")], Duration::from_millis(10));
        let mut reg = rm.register(&framework()).await.unwrap();
        let Some(DriverEvent::Offer(offer)) = reg.events.recv().await else {
            panic!("expected offer");
        };

        reg.handle
            .launch(
                &offer.id,
                LaunchSpec {
                    task_id: "t1".into(),
                    host: "a".into(),
                    resources: Resources::new(1.0, 1024, 1024, 1),
                    command: "./serve".into(),
                },
            )
            .unwrap();

        let mut states = Vec::new();
        while states.len() < 2 {
            if let Some(DriverEvent::StatusUpdate(update)) = reg.events.recv().await {
                states.push(update.state);
            }
        }
        assert_eq!(states, vec![TaskState::Starting, TaskState::Running]);
        assert_eq!(rm.running_on("a"), vec!["t1".to_string()]);

        let next = loop {
            if let Some(DriverEvent::Offer(offer)) = reg.events.recv().await {
                break offer;
            }
        };
        assert_eq!(next.resources.ram_mb, 3072);

        reg.handle.kill(&"t1".to_string()).unwrap();
        assert!(rm.running_on("a").is_empty());
        reg.handle.close();
        assert!(matches!(reg.handle.decline(&next.id), Err(DriverError::Closed)));
    }
}
