//! Error types for task transitions.

use keel_core::{TaskId, TaskState};
use keel_state::StateError;
use thiserror::Error;

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Error)]
pub enum TaskError {
    /// Not in the transition table. The task is unchanged.
    #[error("illegal transition for task {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// Storage was unavailable or kept conflicting past the retry budget.
    #[error("task storage failed: {0}")]
    Storage(#[from] StateError),
}

impl TaskError {
    /// Storage failures invalidate the active scheduler's view.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskError::Storage(_))
    }
}
