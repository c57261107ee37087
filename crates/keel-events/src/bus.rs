//! EventBus — linearized, synchronous fan-out.
//!
//! Publishes from all threads land in one FIFO queue. The first publisher to
//! find the queue idle becomes the drainer and delivers queued events in
//! order until the queue is empty; concurrent or nested publishes only
//! enqueue. The subscriber set is captured when an event is enqueued, so
//! subscribers registered later never see earlier events.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::event::{EventKind, LifecycleEvent};
use crate::subscriber::{ChannelSubscriber, FnSubscriber, Subscriber};

type SubscriberList = Arc<Vec<Arc<dyn Subscriber>>>;

struct Envelope {
    event: LifecycleEvent,
    subscribers: SubscriberList,
}

#[derive(Default)]
struct Dispatch {
    queue: VecDeque<Envelope>,
    draining: bool,
}

pub struct EventBus {
    subscribers: RwLock<SubscriberList>,
    dispatch: Mutex<Dispatch>,
    slow_threshold: Duration,
}

impl EventBus {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            dispatch: Mutex::new(Dispatch::default()),
            slow_threshold,
        }
    }

    // ── Registration ───────────────────────────────────────────────

    pub fn register(&self, subscriber: Arc<dyn Subscriber>) {
        let mut guard = self.subscribers.write();
        let mut next = (**guard).clone();
        debug!(subscriber = %subscriber.name(), "subscriber registered");
        next.push(subscriber);
        *guard = Arc::new(next);
    }

    /// Remove every subscriber with this name. Returns how many were removed.
    pub fn unregister(&self, name: &str) -> usize {
        let mut guard = self.subscribers.write();
        let before = guard.len();
        let next: Vec<_> = guard.iter().filter(|s| s.name() != name).cloned().collect();
        let removed = before - next.len();
        *guard = Arc::new(next);
        removed
    }

    /// Drop every subscriber. Subscribers that hold components which in turn
    /// hold this bus keep each other alive until the bus is cleared.
    pub fn clear(&self) -> usize {
        let mut guard = self.subscribers.write();
        let removed = guard.len();
        *guard = Arc::new(Vec::new());
        if removed > 0 {
            debug!(removed, "subscribers cleared");
        }
        removed
    }

    /// Register a closure. `kinds` empty means every kind.
    pub fn subscribe_fn<F>(&self, name: &str, kinds: &[EventKind], handler: F)
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnSubscriber::new(name, kinds, handler)));
    }

    /// Register a channel and return its receiving end.
    pub fn subscribe_channel(
        &self,
        name: &str,
        kinds: &[EventKind],
    ) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (subscriber, rx) = ChannelSubscriber::new(name, kinds);
        self.register(Arc::new(subscriber));
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    // ── Publishing ─────────────────────────────────────────────────

    /// Publish an event. Never fails and never propagates subscriber errors.
    ///
    /// Returns after the event was either delivered by this thread or queued
    /// behind the delivery another thread is currently performing.
    ///
    /// The draining thread also delivers events other threads enqueue while
    /// it drains. Any lock the caller holds across `publish` (the task state
    /// machine holds the task's transition lock) is held for that whole
    /// drain, so a busy bus lengthens those critical sections.
    pub fn publish(&self, event: LifecycleEvent) {
        let subscribers = self.subscribers.read().clone();
        {
            let mut dispatch = self.dispatch.lock();
            dispatch.queue.push_back(Envelope { event, subscribers });
            if dispatch.draining {
                return;
            }
            dispatch.draining = true;
        }

        loop {
            let envelope = {
                let mut dispatch = self.dispatch.lock();
                match dispatch.queue.pop_front() {
                    Some(envelope) => envelope,
                    None => {
                        dispatch.draining = false;
                        return;
                    }
                }
            };
            self.deliver(&envelope);
        }
    }

    fn deliver(&self, envelope: &Envelope) {
        let kind = envelope.event.kind();
        for subscriber in envelope.subscribers.iter() {
            if !subscriber.handles(kind) {
                continue;
            }
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber.on_event(&envelope.event)));
            let elapsed = started.elapsed();

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(subscriber = %subscriber.name(), ?kind, error = %e, "subscriber failed");
                }
                Err(_) => {
                    error!(subscriber = %subscriber.name(), ?kind, "subscriber panicked");
                }
            }
            if elapsed > self.slow_threshold {
                warn!(
                    subscriber = %subscriber.name(),
                    ?kind,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "slow subscriber"
                );
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}
