//! DriverLifecycle — the live connection to the resource manager.
//!
//! `start()` registers, publishes the handle through the shared
//! [`DriverReference`], and spawns a pump that feeds inbound offers and
//! status updates to a [`DriverEventHandler`]. `stop()` undoes all of it.
//! Both are serialized and idempotent.
//!
//! Disconnects and fatal handler errors are reported on the notice channel
//! returned by [`DriverLifecycle::new`]; the scheduler lifecycle decides
//! what to do about them.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use keel_core::Offer;

use crate::error::{DriverResult, LifecycleResult};
use crate::resource::{DriverEvent, DriverHandle, FrameworkInfo, ResourceManager, StatusUpdate};

/// Shared, possibly empty, handle to the live registration.
///
/// Empty is the normal state on standby replicas and during transitions.
#[derive(Clone, Default)]
pub struct DriverReference {
    inner: Arc<RwLock<Option<Arc<dyn DriverHandle>>>>,
}

impl DriverReference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<dyn DriverHandle>> {
        self.inner.read().clone()
    }

    pub fn is_set(&self) -> bool {
        self.inner.read().is_some()
    }

    pub(crate) fn set(&self, handle: Arc<dyn DriverHandle>) {
        *self.inner.write() = Some(handle);
    }

    pub(crate) fn clear(&self) -> Option<Arc<dyn DriverHandle>> {
        self.inner.write().take()
    }
}

/// Consumer of inbound driver traffic.
pub trait DriverEventHandler: Send + Sync {
    fn offer(&self, offer: Offer) -> LifecycleResult<()>;

    fn status(&self, update: StatusUpdate) -> LifecycleResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverNotice {
    /// The registration ended. `fatal` means re-registering cannot help.
    Disconnected { fatal: bool, reason: String },
    /// The handler hit an error that must end the process.
    Fatal(String),
}

struct Running {
    handle: Arc<dyn DriverHandle>,
    pump: JoinHandle<()>,
}

pub struct DriverLifecycle {
    manager: Arc<dyn ResourceManager>,
    framework: FrameworkInfo,
    handler: Arc<dyn DriverEventHandler>,
    reference: DriverReference,
    notices: mpsc::UnboundedSender<DriverNotice>,
    running: Mutex<Option<Running>>,
}

impl DriverLifecycle {
    pub fn new(
        manager: Arc<dyn ResourceManager>,
        framework: FrameworkInfo,
        handler: Arc<dyn DriverEventHandler>,
        reference: DriverReference,
    ) -> (Self, mpsc::UnboundedReceiver<DriverNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let lifecycle = Self {
            manager,
            framework,
            handler,
            reference,
            notices,
            running: Mutex::new(None),
        };
        (lifecycle, notice_rx)
    }

    pub fn reference(&self) -> &DriverReference {
        &self.reference
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Register and start pumping events. A no-op if already running.
    ///
    /// Dropping the returned future before it completes leaves the driver
    /// stopped: nothing is published until registration has succeeded.
    pub async fn start(&self) -> DriverResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("driver already running");
            return Ok(());
        }

        info!(framework = %self.framework.name, cluster = %self.framework.cluster, "registering with resource manager");
        let registration = self.manager.register(&self.framework).await?;

        self.reference.set(registration.handle.clone());
        let pump = tokio::spawn(pump(
            registration.events,
            self.handler.clone(),
            self.notices.clone(),
        ));
        *running = Some(Running {
            handle: registration.handle,
            pump,
        });
        info!("driver registered");
        Ok(())
    }

    /// Stop pumping, clear the reference, close the registration.
    ///
    /// Returns whether a running driver was stopped.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            self.reference.clear();
            return false;
        };
        current.pump.abort();
        let _ = current.pump.await;
        self.reference.clear();
        current.handle.close();
        info!("driver stopped");
        true
    }
}

async fn pump(
    mut events: mpsc::Receiver<DriverEvent>,
    handler: Arc<dyn DriverEventHandler>,
    notices: mpsc::UnboundedSender<DriverNotice>,
) {
    while let Some(event) = events.recv().await {
        let result = match event {
            DriverEvent::Offer(offer) => handler.offer(offer),
            DriverEvent::StatusUpdate(update) => handler.status(update),
            DriverEvent::Disconnected { fatal, reason } => {
                warn!(fatal, reason = %reason, "resource manager disconnected");
                let _ = notices.send(DriverNotice::Disconnected { fatal, reason });
                return;
            }
        };
        if let Err(e) = result {
            if e.is_fatal() {
                error!(error = %e, "fatal error handling driver event");
                let _ = notices.send(DriverNotice::Fatal(e.to_string()));
                return;
            }
            warn!(error = %e, "driver event handling failed");
        }
    }
    let _ = notices.send(DriverNotice::Disconnected {
        fatal: false,
        reason: "event stream closed".to_string(),
    });
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted resource manager shared by this crate's tests.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use keel_core::{OfferId, TaskId};
    use parking_lot::Mutex as SyncMutex;

    use super::*;
    use crate::error::DriverError;
    use crate::resource::{BoxFuture, LaunchSpec, Registration};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Launch(OfferId, LaunchSpec),
        Decline(OfferId),
        Kill(TaskId),
        Acknowledge(TaskId),
    }

    #[derive(Default)]
    pub struct RecordingHandle {
        pub calls: SyncMutex<Vec<Call>>,
        pub closed: AtomicBool,
    }

    impl RecordingHandle {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn record(&self, call: Call) -> DriverResult<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(DriverError::Closed);
            }
            self.calls.lock().push(call);
            Ok(())
        }
    }

    impl DriverHandle for RecordingHandle {
        fn launch(&self, offer_id: &OfferId, spec: LaunchSpec) -> DriverResult<()> {
            self.record(Call::Launch(offer_id.clone(), spec))
        }

        fn decline(&self, offer_id: &OfferId) -> DriverResult<()> {
            self.record(Call::Decline(offer_id.clone()))
        }

        fn kill(&self, task_id: &TaskId) -> DriverResult<()> {
            self.record(Call::Kill(task_id.clone()))
        }

        fn acknowledge(&self, update: &StatusUpdate) -> DriverResult<()> {
            self.record(Call::Acknowledge(update.task_id.clone()))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// How the next registration attempt behaves.
    pub enum Script {
        Accept,
        Reject(String),
        Hang,
    }

    #[derive(Default)]
    pub struct FakeResourceManager {
        pub registrations: AtomicUsize,
        script: SyncMutex<VecDeque<Script>>,
        live: SyncMutex<Vec<(Arc<RecordingHandle>, mpsc::Sender<DriverEvent>)>>,
    }

    impl FakeResourceManager {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push(&self, script: Script) {
            self.script.lock().push_back(script);
        }

        pub fn latest(&self) -> Option<(Arc<RecordingHandle>, mpsc::Sender<DriverEvent>)> {
            self.live.lock().last().cloned()
        }
    }

    impl ResourceManager for FakeResourceManager {
        fn register<'a>(&'a self, _framework: &'a FrameworkInfo) -> BoxFuture<'a, DriverResult<Registration>> {
            Box::pin(async move {
                self.registrations.fetch_add(1, Ordering::SeqCst);
                let script = self.script.lock().pop_front().unwrap_or(Script::Accept);
                match script {
                    Script::Accept => {
                        let handle = Arc::new(RecordingHandle::default());
                        let (tx, rx) = mpsc::channel(64);
                        self.live.lock().push((handle.clone(), tx));
                        Ok(Registration { handle, events: rx })
                    }
                    Script::Reject(reason) => Err(DriverError::Registration(reason)),
                    Script::Hang => std::future::pending().await,
                }
            })
        }
    }

    #[derive(Default)]
    pub struct RecordingHandler {
        pub offers: SyncMutex<Vec<Offer>>,
        pub statuses: SyncMutex<Vec<StatusUpdate>>,
        pub fail_fatally: AtomicBool,
    }

    impl DriverEventHandler for RecordingHandler {
        fn offer(&self, offer: Offer) -> LifecycleResult<()> {
            if self.fail_fatally.load(Ordering::SeqCst) {
                return Err(crate::error::LifecycleError::Fatal("storage gone".into()));
            }
            self.offers.lock().push(offer);
            Ok(())
        }

        fn status(&self, update: StatusUpdate) -> LifecycleResult<()> {
            self.statuses.lock().push(update);
            Ok(())
        }
    }

    pub fn framework() -> FrameworkInfo {
        FrameworkInfo {
            name: "keel".into(),
            cluster: "test".into(),
            replica: "r1".into(),
        }
    }

    pub fn offer(id: &str, host: &str) -> Offer {
        Offer {
            id: id.into(),
            host: host.into(),
            resources: keel_core::Resources::new(4.0, 4096, 4096, 10),
            attributes: Default::default(),
        }
    }
}
