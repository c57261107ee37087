//! keel-tasks — the authoritative task table.
//!
//! [`TaskStateMachine`] owns every [`Task`](keel_core::Task) record. All
//! changes go through its transition API, which validates against the static
//! transition table, commits to the [`StateStore`](keel_state::StateStore),
//! and publishes exactly one event per committed change on the
//! [`EventBus`](keel_events::EventBus).
//!
//! # Concurrency
//!
//! ```text
//! DashMap<TaskId, Arc<TaskSlot>>
//!   └── TaskSlot
//!       ├── transition lock   (held across validate → commit → publish)
//!       └── committed snapshot (swapped after commit, read without waiting)
//! ```
//!
//! Transitions of one task are serialized; different tasks never contend on
//! anything but the store's write transaction.

pub mod error;
pub mod id;
pub mod machine;

pub use error::{TaskError, TaskResult};
pub use id::TaskIdGenerator;
pub use machine::{TaskStateMachine, Transition};
