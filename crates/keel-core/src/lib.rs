//! keel-core — shared domain types for the Keel scheduler.
//!
//! Everything that crosses a crate boundary lives here: task identity and
//! lifecycle states (with the static transition table), resource vectors,
//! placement constraints, offers, host attributes, job specifications, the
//! clock abstraction, and the `keel.toml` configuration model.

pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, FakeClock, SharedClock, SystemClock};
pub use config::{
    ConfigError, CronConfig, EventsConfig, GcExecutorConfig, HostConfig, KeelConfig,
    LeadershipConfig, MaintenanceConfig, SchedulerConfig, TasksConfig,
};
pub use types::*;
