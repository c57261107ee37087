//! keel-placement — matching pending tasks to resource offers.
//!
//! This crate decides *whether* a task may run on an offered host. It does
//! not rank hosts or pack tasks; candidates are tried in the order the
//! caller provides.
//!
//! # Components
//!
//! - **`filter`** — Predicate chain (resources, constraints, maintenance) with veto reasons
//! - **`assigner`** — Consumes one offer, assigns at most one task through the state machine

pub mod assigner;
pub mod filter;

pub use assigner::{Assignment, TaskAssigner};
pub use filter::{
    ConstraintFilter, FilterContext, MaintenanceFilter, PlacementFilter, ResourceFilter,
    SchedulingFilter, Veto,
};
