//! keel-metrics — observability for the Keel scheduler.
//!
//! [`TaskVars`] is an event bus subscriber that keeps live counters of
//! tasks per state, lost tasks per host, host maintenance modes, and
//! leadership. [`QuotaUsage`] sums the resources held by active tasks per
//! role. [`render_prometheus`] and [`render_quota`] turn snapshots into the
//! Prometheus text exposition format.
//!
//! # Architecture
//!
//! ```text
//! EventBus
//!   ├── TaskVars (subscriber)
//!   │   ├── on_event() ← every lifecycle event
//!   │   ├── snapshot() → TaskVarsSnapshot
//!   │   └── resync on LeaderAcquired from the recovered task table
//!   └── QuotaUsage (subscriber)
//!       └── snapshot() → role → RoleUsage
//!
//! Prometheus exposition
//!   ├── render_prometheus() → text/plain
//!   └── render_quota() → text/plain
//! ```

pub mod prometheus;
pub mod quota;
pub mod task_vars;

pub use prometheus::{render_prometheus, render_quota};
pub use quota::{QuotaUsage, RoleUsage};
pub use task_vars::{TaskVars, TaskVarsSnapshot};
