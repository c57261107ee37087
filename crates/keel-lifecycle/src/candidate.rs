//! Consensus capability and an in-process leader group.
//!
//! A [`Candidate`] enters the election and gets back a [`Candidacy`]: a
//! signal stream plus an [`Abdicate`] handle. The stream yields `Elected`
//! when this replica wins and `Defeated` when the group takes leadership
//! away. A closed stream means the consensus session is gone.
//!
//! [`LeaderGroup`] implements the capability for replicas sharing one
//! process. Production deployments plug an external consensus service in
//! behind the same traits.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::LifecycleResult;
use crate::resource::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum LeadershipSignal {
    /// This replica holds leadership. `epoch` increases with every grant.
    Elected { epoch: u64 },
    /// Leadership was taken away; stop acting as leader and abdicate.
    Defeated,
}

/// Gives up leadership or withdraws a pending candidacy. Idempotent.
pub trait Abdicate: Send + Sync {
    fn abdicate(&self);
}

pub struct Candidacy {
    pub signals: mpsc::UnboundedReceiver<LeadershipSignal>,
    pub abdicator: Arc<dyn Abdicate>,
}

pub trait Candidate: Send + Sync {
    fn offer_leadership(&self) -> BoxFuture<'_, LifecycleResult<Candidacy>>;
}

/// Discovery of the current leader, for replicas that need to redirect.
pub trait LeaderRegistry: Send + Sync {
    fn current_leader(&self) -> Option<String>;
}

// ── LeaderGroup ─────────────────────────────────────────────────

struct Seat {
    token: u64,
    replica: String,
    tx: mpsc::UnboundedSender<LeadershipSignal>,
}

#[derive(Default)]
struct GroupState {
    leader: Option<Seat>,
    waiting: VecDeque<Seat>,
    epoch: u64,
    next_token: u64,
}

/// Leader election among replicas in one process.
///
/// At most one seat holds leadership. A leader keeps it until it abdicates
/// or its session expires; only then is the next waiting candidate elected.
pub struct LeaderGroup {
    state: Mutex<GroupState>,
    session_timeout: Duration,
}

impl LeaderGroup {
    /// `session_timeout` bounds how long a revoked leader may hold on.
    pub fn new(session_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GroupState::default()),
            session_timeout,
        })
    }

    /// Candidate handle for one replica.
    pub fn member(self: &Arc<Self>, replica: &str) -> GroupMember {
        GroupMember {
            group: self.clone(),
            replica: replica.to_string(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Ask the current leader to step down.
    ///
    /// The leader receives `Defeated`. If it has not abdicated within the
    /// session timeout its session is expired. Must be called from within a
    /// tokio runtime.
    pub fn revoke(self: &Arc<Self>) {
        let token = {
            let state = self.state.lock();
            let Some(leader) = &state.leader else {
                return;
            };
            info!(replica = %leader.replica, epoch = state.epoch, "revoking leadership");
            let _ = leader.tx.send(LeadershipSignal::Defeated);
            leader.token
        };

        let group: Weak<Self> = Arc::downgrade(self);
        let timeout = self.session_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(group) = group.upgrade() {
                group.expire_if_leader(token);
            }
        });
    }

    /// Drop the leader's session now. Its signal stream closes.
    pub fn expire_session(&self) {
        let mut state = self.state.lock();
        if let Some(leader) = state.leader.take() {
            warn!(replica = %leader.replica, "leader session expired");
            Self::promote(&mut state);
        }
    }

    fn expire_if_leader(&self, token: u64) {
        let mut state = self.state.lock();
        if state.leader.as_ref().is_some_and(|l| l.token == token) {
            if let Some(leader) = state.leader.take() {
                warn!(replica = %leader.replica, "revoked leader did not abdicate, expiring session");
            }
            Self::promote(&mut state);
        }
    }

    fn join(&self, replica: &str) -> (u64, mpsc::UnboundedReceiver<LeadershipSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let token = state.next_token;
        state.next_token += 1;
        state.waiting.push_back(Seat {
            token,
            replica: replica.to_string(),
            tx,
        });
        debug!(replica, token, waiting = state.waiting.len(), "candidate joined");
        if state.leader.is_none() {
            Self::promote(&mut state);
        }
        (token, rx)
    }

    fn release(&self, token: u64) {
        let mut state = self.state.lock();
        if state.leader.as_ref().is_some_and(|l| l.token == token) {
            if let Some(leader) = state.leader.take() {
                info!(replica = %leader.replica, epoch = state.epoch, "leader abdicated");
            }
            Self::promote(&mut state);
        } else {
            state.waiting.retain(|seat| seat.token != token);
        }
    }

    /// Elect the first waiting seat whose candidate is still listening.
    fn promote(state: &mut GroupState) {
        while let Some(seat) = state.waiting.pop_front() {
            let epoch = state.epoch + 1;
            if seat.tx.send(LeadershipSignal::Elected { epoch }).is_ok() {
                info!(replica = %seat.replica, epoch, "leader elected");
                state.epoch = epoch;
                state.leader = Some(seat);
                return;
            }
            debug!(replica = %seat.replica, "skipping departed candidate");
        }
    }
}

impl LeaderRegistry for LeaderGroup {
    fn current_leader(&self) -> Option<String> {
        self.state.lock().leader.as_ref().map(|l| l.replica.clone())
    }
}

/// One replica's view of a [`LeaderGroup`].
#[derive(Clone)]
pub struct GroupMember {
    group: Arc<LeaderGroup>,
    replica: String,
}

impl Candidate for GroupMember {
    fn offer_leadership(&self) -> BoxFuture<'_, LifecycleResult<Candidacy>> {
        Box::pin(async move {
            let (token, signals) = self.group.join(&self.replica);
            let abdicator: Arc<dyn Abdicate> = Arc::new(SeatRelease {
                group: Arc::downgrade(&self.group),
                token,
            });
            Ok(Candidacy { signals, abdicator })
        })
    }
}

struct SeatRelease {
    group: Weak<LeaderGroup>,
    token: u64,
}

impl Abdicate for SeatRelease {
    fn abdicate(&self) {
        if let Some(group) = self.group.upgrade() {
            group.release(self.token);
        }
    }
}
