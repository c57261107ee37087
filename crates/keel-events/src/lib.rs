//! keel-events — lifecycle event bus.
//!
//! Every committed task transition, host maintenance change, and leadership
//! change is published here as a [`LifecycleEvent`]. Subscribers consume
//! events independently: one failing or panicking subscriber never affects
//! delivery to the others, and `publish` itself never fails.

pub mod bus;
pub mod event;
pub mod subscriber;

pub use bus::EventBus;
pub use event::{Cause, CauseOrigin, EventKind, LifecycleEvent};
pub use subscriber::{ChannelSubscriber, FnSubscriber, Subscriber};
