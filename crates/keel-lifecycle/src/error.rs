//! Lifecycle error types.

use std::time::Duration;

use keel_state::StateError;
use keel_tasks::TaskError;
use thiserror::Error;

/// Errors at the resource manager boundary.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("registration rejected: {0}")]
    Registration(String),

    #[error("registration timed out after {0:?}")]
    Timeout(Duration),

    #[error("driver channel closed")]
    Closed,
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Errors that end or abort a leadership term.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("task store error: {0}")]
    Tasks(#[from] TaskError),

    #[error("storage error: {0}")]
    Storage(#[from] StateError),

    /// The consensus session ended; leadership can no longer be trusted.
    #[error("consensus lost")]
    ConsensusLost,

    /// Unrecoverable; the process should exit so a supervisor restarts it.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl LifecycleError {
    pub fn is_fatal(&self) -> bool {
        match self {
            LifecycleError::Fatal(_) | LifecycleError::Storage(_) => true,
            LifecycleError::Tasks(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
