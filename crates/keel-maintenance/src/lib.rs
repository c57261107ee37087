//! keel-maintenance — taking hosts out of service without losing work.
//!
//! # Host modes
//!
//! ```text
//! NONE ──start──▶ SCHEDULED ──drain──▶ DRAINING ──last task leaves──▶ DRAINED
//!   ▲                 │                    │                              │
//!   └─────────────────┴───── end ──────────┴──────────────────────────────┘
//! ```
//!
//! Draining evicts every active task on the host (`→ RESTARTING`), which
//! reschedules it elsewhere once the resource manager confirms it is gone.
//! The placement filter keeps DRAINING and DRAINED hosts free of new work.
//!
//! Mode changes are durable through the
//! [`AttributeStore`](keel_state::AttributeStore) and published as
//! `HostMaintenanceChange` events.

pub mod controller;
pub mod error;

pub use controller::{HostStatus, MaintenanceController};
pub use error::{MaintenanceError, MaintenanceResult};
