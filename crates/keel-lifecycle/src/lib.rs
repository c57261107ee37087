//! keel-lifecycle — leadership and the resource manager connection.
//!
//! Only the elected replica talks to the resource manager. This crate owns
//! that rule:
//!
//! - **`candidate`** — Consensus capability (`Candidate`, `LeaderRegistry`) and the in-process `LeaderGroup`
//! - **`resource`** — Resource manager boundary (`ResourceManager`, `DriverHandle`, `DriverEvent`)
//! - **`driver`** — `DriverLifecycle`: register, pump events, tear down; `DriverReference`
//! - **`lifecycle`** — `SchedulerLifecycle`: elected → registered → active → relinquished
//! - **`launcher`** — Offer and status routing through the GC and user task launchers
//! - **`kill`** — Forwards scheduler-initiated kills to the resource manager
//!
//! # Architecture
//!
//! ```text
//! SchedulerLifecycle
//!   ├── Candidacy (Elected / Defeated / closed)
//!   └── DriverLifecycle
//!       ├── ResourceManager::register → DriverHandle + event stream
//!       ├── DriverReference (read by launchers, kill forwarder)
//!       └── pump → Launchers
//!           ├── GcExecutorLauncher (PulseMonitor per host)
//!           └── UserTaskLauncher → TaskAssigner → TaskStateMachine
//! ```

pub mod candidate;
pub mod driver;
pub mod error;
pub mod kill;
pub mod launcher;
pub mod lifecycle;
pub mod resource;

pub use candidate::{
    Abdicate, Candidacy, Candidate, GroupMember, LeaderGroup, LeaderRegistry, LeadershipSignal,
};
pub use driver::{DriverEventHandler, DriverLifecycle, DriverNotice, DriverReference};
pub use error::{DriverError, DriverResult, LifecycleError, LifecycleResult};
pub use kill::KillForwarder;
pub use launcher::{GcExecutorLauncher, Launchers, TaskLauncher, UserTaskLauncher};
pub use lifecycle::{LeadershipState, Phase, SchedulerLifecycle};
pub use resource::{
    BoxFuture, DriverEvent, DriverHandle, FrameworkInfo, LaunchSpec, Registration, ResourceManager,
    StatusUpdate,
};
