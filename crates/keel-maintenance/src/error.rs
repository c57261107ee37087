use keel_core::{HostId, MaintenanceMode};
use keel_state::StateError;
use keel_tasks::TaskError;
use thiserror::Error;

pub type MaintenanceResult<T> = Result<T, MaintenanceError>;

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("not the leading scheduler")]
    NotLeader,

    #[error("host {host} cannot move from {from} to {to}")]
    IllegalTransition {
        host: HostId,
        from: MaintenanceMode,
        to: MaintenanceMode,
    },

    #[error("maintenance state storage failed: {0}")]
    Storage(#[from] StateError),

    #[error("task eviction failed: {0}")]
    Eviction(#[from] TaskError),
}
