//! keel-health — liveness primitives for the Keel scheduler.
//!
//! [`PulseMonitor`] answers "has this key checked in recently?" and backs the
//! GC executor launcher's per-host cadence. [`Backoff`] tracks consecutive
//! failures and grows a retry delay exponentially, resetting on success;
//! the scheduler lifecycle uses it between failed leadership terms.

pub mod backoff;
pub mod pulse;

pub use backoff::Backoff;
pub use pulse::PulseMonitor;
