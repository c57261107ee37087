//! Task id generation.

use keel_core::{JobKey, SharedClock};
use uuid::Uuid;

/// Produces ids of the form `{millis}-{role}-{env}-{name}-{instance}-{uuid}`.
///
/// The prefix keeps ids readable in logs; the uuid makes them unique across
/// replicas and restarts.
#[derive(Clone)]
pub struct TaskIdGenerator {
    clock: SharedClock,
}

impl TaskIdGenerator {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    pub fn generate(&self, job: &JobKey, instance: u32) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}",
            self.clock.now_millis(),
            job.role,
            job.environment,
            job.name,
            instance,
            Uuid::new_v4()
        )
    }
}
