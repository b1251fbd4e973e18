//! Background eviction of expired and dead sessions
//!
//! The reaper gives every session a bounded lifetime without relying on
//! callers to stop them. Each tick it:
//! 1. stops active sessions whose lifetime ran out (through the manager's
//!    normal termination path, so a tunnel is still released only once),
//! 2. fails active sessions whose tunnel died on its own,
//! 3. prunes terminal sessions older than the grace period.
//!
//! A failure on one session is logged and never holds up the others.

use crate::manager::SessionManager;
use crate::session::{SessionId, SessionState};
use futures::future::join_all;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one reaper pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    /// Sessions stopped because they expired
    pub expired: Vec<SessionId>,
    /// Sessions failed because their tunnel had exited
    pub dead: Vec<SessionId>,
    /// Terminal sessions removed from the registry
    pub pruned: Vec<SessionId>,
    /// Per-session failures, reported and skipped
    pub errors: Vec<(SessionId, String)>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty()
            && self.dead.is_empty()
            && self.pruned.is_empty()
            && self.errors.is_empty()
    }
}

/// Periodic scanner enforcing session lifetimes
pub struct Reaper {
    manager: SessionManager,
    interval: Duration,
}

impl Reaper {
    pub fn new(manager: SessionManager) -> Self {
        let interval = manager.config().reaper_interval;
        Self { manager, interval }
    }

    /// Override the tick interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run [`Reaper::tick`] every interval until `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.interval.as_millis() as u64, "Session reaper started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.tick().await;
                        if !report.is_empty() {
                            debug!(
                                expired = report.expired.len(),
                                dead = report.dead.len(),
                                pruned = report.pruned.len(),
                                errors = report.errors.len(),
                                "Reaper pass finished"
                            );
                        }
                    }
                }
            }

            info!("Session reaper stopped");
        })
    }

    /// One pass over the registry
    pub async fn tick(&self) -> ReapReport {
        let now = Instant::now();
        let mut report = ReapReport::default();

        let (expired, running): (Vec<_>, Vec<_>) = self
            .manager
            .registry()
            .list_active()
            .into_iter()
            .filter(|s| s.state == SessionState::Active)
            .partition(|s| s.is_expired(now));

        let results = join_all(expired.iter().map(|s| self.manager.expire(&s.id))).await;
        for (session, result) in expired.into_iter().zip(results) {
            match result {
                Ok(false) => {
                    debug!(session_id = %session.id, "Session ended before it could expire");
                }
                Ok(true) => {
                    info!(
                        session_id = %session.id,
                        forward = %session.target,
                        "Port-forward expired"
                    );
                    report.expired.push(session.id);
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Failed to stop expired session");
                    report.errors.push((session.id, e.to_string()));
                }
            }
        }

        for session in running {
            match self.manager.reap_dead_tunnel(&session.id).await {
                Ok(true) => report.dead.push(session.id),
                Ok(false) => {}
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Failed to check tunnel liveness");
                    report.errors.push((session.id, e.to_string()));
                }
            }
        }

        report.pruned = self
            .manager
            .registry()
            .prune_terminal(self.manager.config().grace_period, Instant::now());

        report
    }
}
