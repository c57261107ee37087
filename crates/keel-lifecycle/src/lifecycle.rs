//! SchedulerLifecycle — binds leadership to the driver connection.
//!
//! ```text
//!            elected                 registered
//! STANDBY ─────────────▶ ACQUIRING ─────────────▶ ACTIVE
//!    ▲                       │                       │ defeated / consensus lost /
//!    │  failed or defeated   │                       │ disconnect / fatal
//!    └───────────────────────┘                       ▼
//!    ▲                                         RELINQUISHING
//!    └──────────────── (not fatal) ──────────────────┤
//!                                                    └──(fatal)──▶ TERMINATED
//! ```
//!
//! One task runs the whole sequence, so at most one acquire or relinquish is
//! ever in flight. The driver reference is only set while ACQUIRING has
//! completed registration and until RELINQUISHING stops the driver.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use keel_core::LeadershipConfig;
use keel_events::LifecycleEvent;
use keel_health::Backoff;
use keel_tasks::TaskStateMachine;

use crate::candidate::{Candidacy, Candidate, LeadershipSignal};
use crate::driver::{DriverLifecycle, DriverNotice};
use crate::error::{DriverError, LifecycleError, LifecycleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Standby,
    Acquiring,
    Active,
    Relinquishing,
    Terminated,
}

/// The coarse view most components care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadershipState {
    Standby,
    Active,
}

impl Phase {
    pub fn leadership(self) -> LeadershipState {
        match self {
            Phase::Active => LeadershipState::Active,
            _ => LeadershipState::Standby,
        }
    }
}

/// How a single candidacy ended.
enum Term {
    /// Leadership was given up voluntarily or taken away; contest again now.
    Relinquished,
    /// Acquisition failed or the connection dropped; contest again after backoff.
    Failed,
    Shutdown,
    Fatal(LifecycleError),
}

enum Acquire {
    Registered,
    Failed,
    Defeated,
    ConsensusLost,
    Shutdown,
}

pub struct SchedulerLifecycle {
    replica: String,
    candidate: Arc<dyn Candidate>,
    driver: Arc<DriverLifecycle>,
    notices: Mutex<Option<mpsc::UnboundedReceiver<DriverNotice>>>,
    tasks: Arc<TaskStateMachine>,
    config: LeadershipConfig,
    phase: watch::Sender<Phase>,
}

impl SchedulerLifecycle {
    pub fn new(
        replica: &str,
        candidate: Arc<dyn Candidate>,
        driver: Arc<DriverLifecycle>,
        notices: mpsc::UnboundedReceiver<DriverNotice>,
        tasks: Arc<TaskStateMachine>,
        config: LeadershipConfig,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Standby);
        Self {
            replica: replica.to_string(),
            candidate,
            driver,
            notices: Mutex::new(Some(notices)),
            tasks,
            config,
            phase,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn leadership(&self) -> LeadershipState {
        self.phase().leadership()
    }

    pub fn watch(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn driver(&self) -> &Arc<DriverLifecycle> {
        &self.driver
    }

    fn set_phase(&self, next: Phase) {
        let previous = self.phase.send_replace(next);
        if previous != next {
            info!(replica = %self.replica, from = ?previous, to = ?next, "scheduler phase changed");
        }
    }

    /// Contest leadership until shutdown or a fatal error.
    ///
    /// Returns `Err` only for fatal conditions; the caller should exit the
    /// process so a supervisor restarts it.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> LifecycleResult<()> {
        let Some(mut notices) = self.notices.lock().take() else {
            return Err(LifecycleError::Fatal("scheduler lifecycle is already running".into()));
        };
        let mut backoff = Backoff::new(
            self.config.reelection_backoff(),
            self.config.max_reelection_backoff(),
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.set_phase(Phase::Standby);

            let mut candidacy = match self.candidate.offer_leadership().await {
                Ok(candidacy) => candidacy,
                Err(e) if e.is_fatal() => {
                    self.set_phase(Phase::Terminated);
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.record_failure();
                    warn!(error = %e, ?delay, "could not enter candidacy");
                    if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            };

            let term = self
                .contest(&mut candidacy, &mut notices, &mut shutdown_rx, &mut backoff)
                .await;
            candidacy.abdicator.abdicate();

            match term {
                Term::Relinquished => {}
                Term::Failed => {
                    let delay = backoff.record_failure();
                    info!(
                        replica = %self.replica,
                        ?delay,
                        failures = backoff.consecutive_failures(),
                        "re-entering candidacy after backoff"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                        break;
                    }
                }
                Term::Shutdown => break,
                Term::Fatal(e) => {
                    error!(replica = %self.replica, error = %e, "scheduler terminating");
                    self.set_phase(Phase::Terminated);
                    return Err(e);
                }
            }
        }

        self.driver.stop().await;
        self.set_phase(Phase::Standby);
        info!(replica = %self.replica, "scheduler lifecycle stopped");
        Ok(())
    }

    async fn contest(
        &self,
        candidacy: &mut Candidacy,
        notices: &mut mpsc::UnboundedReceiver<DriverNotice>,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Term {
        // ── Wait for election ──
        let epoch = loop {
            tokio::select! {
                signal = candidacy.signals.recv() => match signal {
                    Some(LeadershipSignal::Elected { epoch }) => break epoch,
                    Some(LeadershipSignal::Defeated) => {
                        debug!("defeated while standing by");
                    }
                    None => {
                        warn!("consensus session lost while standing by");
                        return Term::Failed;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Term::Shutdown;
                    }
                }
            }
        };

        // ── Acquire ──
        self.set_phase(Phase::Acquiring);
        info!(replica = %self.replica, epoch, "elected, acquiring");
        while notices.try_recv().is_ok() {}

        match self.tasks.recover() {
            Ok(count) => debug!(tasks = count, "task store recovered"),
            Err(e) => {
                let e = LifecycleError::from(e);
                if e.is_fatal() {
                    return Term::Fatal(e);
                }
                warn!(error = %e, "task recovery failed");
                return Term::Failed;
            }
        }

        let timeout = self.config.registration_timeout();
        let acquired = {
            let registration = tokio::time::timeout(timeout, self.driver.start());
            tokio::pin!(registration);
            loop {
                tokio::select! {
                    result = &mut registration => match result {
                        Ok(Ok(())) => break Acquire::Registered,
                        Ok(Err(e)) => {
                            warn!(error = %e, "registration failed, relinquishing");
                            break Acquire::Failed;
                        }
                        Err(_) => {
                            let e = DriverError::Timeout(timeout);
                            warn!(error = %e, "registration failed, relinquishing");
                            break Acquire::Failed;
                        }
                    },
                    signal = candidacy.signals.recv() => match signal {
                        Some(LeadershipSignal::Elected { .. }) => debug!("duplicate election notice"),
                        Some(LeadershipSignal::Defeated) => break Acquire::Defeated,
                        None => break Acquire::ConsensusLost,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break Acquire::Shutdown;
                        }
                    }
                }
            }
        };

        match acquired {
            Acquire::Registered => {}
            Acquire::Failed => {
                self.relinquish(false).await;
                return Term::Failed;
            }
            Acquire::Defeated => {
                info!("leadership lost mid-registration");
                self.relinquish(false).await;
                return Term::Relinquished;
            }
            Acquire::ConsensusLost => {
                warn!("consensus lost mid-registration");
                self.relinquish(false).await;
                return Term::Failed;
            }
            Acquire::Shutdown => {
                self.relinquish(false).await;
                return Term::Shutdown;
            }
        }

        // ── Active ──
        self.set_phase(Phase::Active);
        backoff.record_success();
        self.tasks.bus().publish(LifecycleEvent::LeaderAcquired);
        info!(replica = %self.replica, epoch, "scheduler active");

        let term = loop {
            tokio::select! {
                signal = candidacy.signals.recv() => match signal {
                    Some(LeadershipSignal::Elected { .. }) => debug!("duplicate election notice"),
                    Some(LeadershipSignal::Defeated) => {
                        info!(replica = %self.replica, epoch, "leadership revoked");
                        break Term::Relinquished;
                    }
                    None => {
                        let e = LifecycleError::ConsensusLost;
                        warn!(replica = %self.replica, epoch, error = %e, "stopping driver");
                        break Term::Failed;
                    }
                },
                notice = notices.recv() => match notice {
                    Some(DriverNotice::Disconnected { fatal: false, reason }) => {
                        warn!(reason = %reason, "driver disconnected, relinquishing");
                        break Term::Failed;
                    }
                    Some(DriverNotice::Disconnected { fatal: true, reason }) => {
                        break Term::Fatal(LifecycleError::Fatal(reason));
                    }
                    Some(DriverNotice::Fatal(reason)) => {
                        break Term::Fatal(LifecycleError::Fatal(reason));
                    }
                    None => break Term::Fatal(LifecycleError::Fatal("driver notice channel closed".into())),
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break Term::Shutdown;
                    }
                }
            }
        };

        self.relinquish(true).await;
        term
    }

    async fn relinquish(&self, was_active: bool) {
        self.set_phase(Phase::Relinquishing);
        self.driver.stop().await;
        if was_active {
            self.tasks.bus().publish(LifecycleEvent::LeaderLost);
        }
    }
}

/// Returns `true` if shutdown was requested during the sleep.
async fn sleep_or_shutdown(delay: std::time::Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}
