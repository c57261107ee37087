//! Subscriber capability and the two stock adapters.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tracing::debug;

use crate::event::{EventKind, LifecycleEvent};

/// Anything that wants lifecycle events.
///
/// Handlers run on the publishing thread. They must not wait on another
/// task's transition, but they may publish; nested publishes are queued.
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;

    /// Kinds this subscriber receives. All kinds by default.
    fn handles(&self, _kind: EventKind) -> bool {
        true
    }

    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

type Handler = Box<dyn Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync>;

/// Wraps a closure as a subscriber.
pub struct FnSubscriber {
    name: String,
    kinds: Option<HashSet<EventKind>>,
    handler: Handler,
}

impl FnSubscriber {
    /// `kinds` empty means every kind.
    pub fn new<F>(name: impl Into<String>, kinds: &[EventKind], handler: F) -> Self
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kinds: (!kinds.is_empty()).then(|| kinds.iter().copied().collect()),
            handler: Box::new(handler),
        }
    }
}

impl Subscriber for FnSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().is_none_or(|k| k.contains(&kind))
    }

    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        (self.handler)(event)
    }
}

/// Forwards events into an unbounded channel for async consumers.
pub struct ChannelSubscriber {
    name: String,
    kinds: Option<HashSet<EventKind>>,
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelSubscriber {
    pub fn new(
        name: impl Into<String>,
        kinds: &[EventKind],
    ) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Self {
            name: name.into(),
            kinds: (!kinds.is_empty()).then(|| kinds.iter().copied().collect()),
            tx,
        };
        (subscriber, rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().is_none_or(|k| k.contains(&kind))
    }

    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        if self.tx.send(event.clone()).is_err() {
            debug!(subscriber = %self.name, "channel receiver dropped, event discarded");
        }
        Ok(())
    }
}
