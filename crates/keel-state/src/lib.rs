//! keel-state — durable state for the Keel scheduler.
//!
//! Backed by [redb](https://docs.rs/redb). Tasks, host attributes, and cron
//! job definitions are JSON-serialized into `&[u8]` value columns.
//!
//! # Architecture
//!
//! All writes go through [`StateStore::commit`], which applies one or more
//! [`Mutation`]s in a single write transaction. Task writes carry the
//! version the writer last read; a mismatch rejects the whole commit with
//! [`StateError::Conflict`] instead of overwriting.
//!
//! [`AttributeStore`] keeps an in-memory, read-copy view of host attributes
//! on top of the store so placement reads never race maintenance writes.

pub mod attributes;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use attributes::AttributeStore;
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
