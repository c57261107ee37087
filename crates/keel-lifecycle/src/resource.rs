//! Resource manager boundary.
//!
//! The wire protocol is out of scope; these traits are what the scheduler
//! needs from it. A registration yields a handle for outbound calls and a
//! stream of inbound events. Outbound calls are fire-and-forget: they
//! enqueue and return without waiting on the resource manager.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use keel_core::{HostId, Offer, OfferId, Resources, TaskId, TaskState};

use crate::error::DriverResult;

/// Boxed future used by the async capability traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identity presented when registering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameworkInfo {
    pub name: String,
    pub cluster: String,
    /// Replica that performed the registration.
    pub replica: String,
}

/// What to run against an offer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchSpec {
    pub task_id: TaskId,
    pub host: HostId,
    pub resources: Resources,
    pub command: String,
}

/// A task status report from the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub state: TaskState,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Offer(Offer),
    StatusUpdate(StatusUpdate),
    /// The connection dropped. `fatal` means re-registering cannot help.
    Disconnected { fatal: bool, reason: String },
}

/// Outbound calls on a live registration.
pub trait DriverHandle: Send + Sync {
    fn launch(&self, offer_id: &OfferId, spec: LaunchSpec) -> DriverResult<()>;

    fn decline(&self, offer_id: &OfferId) -> DriverResult<()>;

    fn kill(&self, task_id: &TaskId) -> DriverResult<()>;

    fn acknowledge(&self, update: &StatusUpdate) -> DriverResult<()>;

    /// End the registration. Further calls fail with `Closed`.
    fn close(&self);
}

pub struct Registration {
    pub handle: Arc<dyn DriverHandle>,
    pub events: mpsc::Receiver<DriverEvent>,
}

pub trait ResourceManager: Send + Sync {
    fn register<'a>(&'a self, framework: &'a FrameworkInfo) -> BoxFuture<'a, DriverResult<Registration>>;
}
