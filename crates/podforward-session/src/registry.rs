//! In-memory session registry
//!
//! The registry is the single source of truth for session state. It maps
//! session ids to entries and keeps a secondary index by target. All access
//! goes through one mutex that is only held for metadata updates, never
//! across a call into a tunnel primitive.

use crate::error::SessionError;
use crate::session::{LocalEndpoint, Session, SessionId, SessionState, StopReason, Target};
use crate::tunnel::LiveTunnel;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// A registered session together with the tunnel it owns
///
/// Only the session manager mutates entries, so a tunnel is released once.
pub struct SessionEntry {
    session: Session,
    handle: Option<Box<dyn LiveTunnel>>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionEntry {
    fn new(id: SessionId, target: Target, timeout: Duration) -> Self {
        let now = Instant::now();
        let (state_tx, _) = watch::channel(SessionState::Starting);
        Self {
            session: Session {
                id,
                target,
                local_port: None,
                local_endpoint: None,
                state: SessionState::Starting,
                created_at: Utc::now(),
                started: now,
                expires_at: now + timeout,
                ended_at: None,
                error: None,
                stop_reason: None,
            },
            handle: None,
            state_tx,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Move to `next`, rejecting anything that is not a forward edge
    pub(crate) fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        let current = self.session.state;
        if !current.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                id: self.session.id.clone(),
                from: current,
                to: next,
            });
        }

        self.session.state = next;
        if next.is_terminal() {
            self.session.ended_at = Some(Instant::now());
        }
        self.state_tx.send_replace(next);
        debug!(session_id = %self.session.id, from = %current, to = %next, "Session state changed");
        Ok(())
    }

    pub(crate) fn set_local_port(&mut self, port: u16) {
        self.session.local_port = Some(port);
    }

    pub(crate) fn set_error(&mut self, error: impl Into<String>) {
        self.session.error = Some(error.into());
    }

    pub(crate) fn set_stop_reason(&mut self, reason: StopReason) {
        self.session.stop_reason = Some(reason);
    }

    /// `Starting -> Active`, taking ownership of the tunnel
    pub(crate) fn activate(
        &mut self,
        endpoint: LocalEndpoint,
        handle: Box<dyn LiveTunnel>,
    ) -> Result<(), Box<dyn LiveTunnel>> {
        if self.transition(SessionState::Active).is_err() {
            return Err(handle);
        }
        self.session.local_endpoint = Some(endpoint);
        self.handle = Some(handle);
        Ok(())
    }

    /// Move the tunnel out of the entry; yields `Some` at most once
    pub(crate) fn take_handle(&mut self) -> Option<Box<dyn LiveTunnel>> {
        self.handle.take()
    }

    /// Whether the owned tunnel still reports itself alive
    pub(crate) fn tunnel_alive(&mut self) -> bool {
        self.handle.as_mut().map(|h| h.is_alive()).unwrap_or(false)
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionEntry>,
    by_target: HashMap<Target, HashSet<SessionId>>,
}

impl Inner {
    fn live_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|e| !e.state().is_terminal())
            .count()
    }

    fn remove_entry(&mut self, id: &SessionId) -> Option<SessionEntry> {
        let entry = self.sessions.remove(id)?;
        if let Some(ids) = self.by_target.get_mut(&entry.session.target) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_target.remove(&entry.session.target);
            }
        }
        Some(entry)
    }
}

/// Thread-safe store of sessions keyed by id
pub struct SessionRegistry {
    max_sessions: usize,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    /// Create an empty registry admitting at most `max_sessions` live sessions
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Reserve a slot for a new session in state `Starting`
    ///
    /// # Errors
    ///
    /// `RegistryFull` when `max_sessions` live sessions already exist.
    /// Terminal sessions waiting out their grace period do not count.
    pub fn insert(&self, target: Target, timeout: Duration) -> Result<SessionId, SessionError> {
        let mut inner = self.lock();

        if inner.live_count() >= self.max_sessions {
            return Err(SessionError::RegistryFull {
                max: self.max_sessions,
            });
        }

        let mut id = SessionId::generate();
        while inner.sessions.contains_key(&id) {
            id = SessionId::generate();
        }

        inner
            .by_target
            .entry(target.clone())
            .or_default()
            .insert(id.clone());
        inner
            .sessions
            .insert(id.clone(), SessionEntry::new(id.clone(), target, timeout));

        Ok(id)
    }

    /// Snapshot of one session
    pub fn get(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.lock()
            .sessions
            .get(id)
            .map(|e| e.session.clone())
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Apply `f` to a session atomically
    ///
    /// Outside this crate an entry is read-only; state changes and the
    /// tunnel handle stay with [`crate::SessionManager`].
    pub fn update<R, F>(&self, id: &SessionId, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&mut SessionEntry) -> Result<R, SessionError>,
    {
        let mut inner = self.lock();
        let entry = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        f(entry)
    }

    /// Watch a session's state, e.g. to wait out `Starting`
    pub fn subscribe(&self, id: &SessionId) -> Result<watch::Receiver<SessionState>, SessionError> {
        self.lock()
            .sessions
            .get(id)
            .map(SessionEntry::subscribe)
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Snapshot of every non-terminal session
    pub fn list_active(&self) -> Vec<Session> {
        self.lock()
            .sessions
            .values()
            .filter(|e| !e.state().is_terminal())
            .map(|e| e.session.clone())
            .collect()
    }

    /// Snapshot of every session still held, terminal ones included
    pub fn list(&self) -> Vec<Session> {
        self.lock()
            .sessions
            .values()
            .map(|e| e.session.clone())
            .collect()
    }

    /// Sessions forwarding to `target`
    pub fn find_by_target(&self, target: &Target) -> Vec<Session> {
        let inner = self.lock();
        inner
            .by_target
            .get(target)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id))
                    .map(|e| e.session.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delete a terminal session
    pub fn remove(&self, id: &SessionId) -> Result<Session, SessionError> {
        let mut inner = self.lock();
        let state = inner
            .sessions
            .get(id)
            .map(SessionEntry::state)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        if !state.is_terminal() {
            return Err(SessionError::NotTerminal {
                id: id.clone(),
                state,
            });
        }
        inner
            .remove_entry(id)
            .map(|e| e.session)
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Drop a reservation that never got a tunnel
    pub(crate) fn discard(&self, id: &SessionId) {
        self.lock().remove_entry(id);
    }

    /// Remove terminal sessions whose grace period has run out
    pub fn prune_terminal(&self, grace: Duration, now: Instant) -> Vec<SessionId> {
        let mut inner = self.lock();
        let expired: Vec<SessionId> = inner
            .sessions
            .values()
            .filter(|e| {
                e.session
                    .ended_at
                    .map(|ended| now >= ended + grace)
                    .unwrap_or(false)
            })
            .map(|e| e.session.id.clone())
            .collect();

        for id in &expired {
            inner.remove_entry(id);
            info!(session_id = %id, "Pruned terminal session");
        }
        expired
    }

    /// Number of sessions held, terminal ones included
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of non-terminal sessions
    pub fn active_count(&self) -> usize {
        self.lock().live_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn target(pod: &str) -> Target {
        Target::new("default", pod, 8080).unwrap()
    }

    #[tokio::test]
    async fn test_insert_starts_in_starting_state() {
        let registry = SessionRegistry::new(4);
        let id = registry.insert(target("web-1"), TTL).unwrap();

        let session = registry.get(&id).unwrap();
        assert_eq!(session.state, SessionState::Starting);
        assert_eq!(session.target, target("web-1"));
        assert_eq!(session.expires_at, session.started + TTL);
        assert!(session.ended_at.is_none());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let registry = SessionRegistry::new(100);
        let mut ids = HashSet::new();
        for _ in 0..100 {
            assert!(ids.insert(registry.insert(target("web-1"), TTL).unwrap()));
        }
        assert_eq!(registry.len(), 100);
    }

    #[tokio::test]
    async fn test_registry_full_counts_only_live_sessions() {
        let registry = SessionRegistry::new(2);
        let a = registry.insert(target("a"), TTL).unwrap();
        registry.insert(target("b"), TTL).unwrap();

        assert_eq!(
            registry.insert(target("c"), TTL),
            Err(SessionError::RegistryFull { max: 2 })
        );

        registry
            .update(&a, |e| e.transition(SessionState::Failed))
            .unwrap();
        assert!(registry.insert(target("c"), TTL).is_ok());
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.active_count(), 2);
    }

    #[tokio::test]
    async fn test_get_unknown_id() {
        let registry = SessionRegistry::new(1);
        let id = SessionId::from("missing");
        assert_eq!(registry.get(&id).unwrap_err(), SessionError::NotFound(id));
    }

    #[tokio::test]
    async fn test_update_rejects_backward_transition() {
        let registry = SessionRegistry::new(1);
        let id = registry.insert(target("web-1"), TTL).unwrap();

        let result = registry.update(&id, |e| e.transition(SessionState::Stopped));
        assert!(matches!(
            result,
            Err(SessionError::InvalidTransition {
                from: SessionState::Starting,
                to: SessionState::Stopped,
                ..
            })
        ));
        assert_eq!(registry.get(&id).unwrap().state, SessionState::Starting);
    }

    #[tokio::test]
    async fn test_terminal_transition_records_end_time() {
        let registry = SessionRegistry::new(1);
        let id = registry.insert(target("web-1"), TTL).unwrap();
        registry
            .update(&id, |e| e.transition(SessionState::Failed))
            .unwrap();
        assert!(registry.get(&id).unwrap().ended_at.is_some());
    }

    #[tokio::test]
    async fn test_list_active_excludes_terminal() {
        let registry = SessionRegistry::new(4);
        let a = registry.insert(target("a"), TTL).unwrap();
        let b = registry.insert(target("b"), TTL).unwrap();
        registry
            .update(&a, |e| e.transition(SessionState::Failed))
            .unwrap();

        let active = registry.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b);
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn test_find_by_target_allows_duplicates() {
        let registry = SessionRegistry::new(4);
        let a = registry.insert(target("web-1"), TTL).unwrap();
        let b = registry.insert(target("web-1"), TTL).unwrap();
        registry.insert(target("web-2"), TTL).unwrap();

        let found: HashSet<SessionId> = registry
            .find_by_target(&target("web-1"))
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(found, HashSet::from([a, b]));
        assert!(registry.find_by_target(&target("web-3")).is_empty());
    }

    #[tokio::test]
    async fn test_remove_requires_terminal_state() {
        let registry = SessionRegistry::new(2);
        let id = registry.insert(target("web-1"), TTL).unwrap();

        assert!(matches!(
            registry.remove(&id),
            Err(SessionError::NotTerminal { .. })
        ));

        registry
            .update(&id, |e| e.transition(SessionState::Failed))
            .unwrap();
        assert!(registry.remove(&id).is_ok());
        assert!(matches!(registry.get(&id), Err(SessionError::NotFound(_))));
        assert!(registry.find_by_target(&target("web-1")).is_empty());
        assert!(matches!(registry.remove(&id), Err(SessionError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_terminal_after_grace() {
        let registry = SessionRegistry::new(4);
        let done = registry.insert(target("a"), TTL).unwrap();
        let live = registry.insert(target("b"), TTL).unwrap();
        registry
            .update(&done, |e| e.transition(SessionState::Failed))
            .unwrap();

        let grace = Duration::from_secs(10);
        assert!(registry.prune_terminal(grace, Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(registry.prune_terminal(grace, Instant::now()), vec![done]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&live).is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_sees_transitions() {
        let registry = SessionRegistry::new(1);
        let id = registry.insert(target("web-1"), TTL).unwrap();
        let mut rx = registry.subscribe(&id).unwrap();
        assert_eq!(*rx.borrow(), SessionState::Starting);

        registry
            .update(&id, |e| e.transition(SessionState::Failed))
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Failed);
    }
}
