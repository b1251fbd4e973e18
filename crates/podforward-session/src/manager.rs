//! Session manager: creates, tracks and tears down port-forward sessions
//!
//! The manager is the only component allowed to call the tunnel primitive.
//! It keeps the invariant that a session's tunnel is established at most
//! once and released exactly once, no matter how `stop`, the reaper and
//! shutdown interleave.
//!
//! Slow work (establishing and terminating tunnels) runs in spawned tasks so
//! a caller that goes away mid-request can never strand a session in
//! `Starting` or `Stopping`.

use crate::config::SessionConfig;
use crate::error::{SessionError, TunnelError};
use crate::port_allocator::LocalPortAllocator;
use crate::registry::SessionRegistry;
use crate::session::{SessionId, SessionState, SessionView, StopReason, Target};
use crate::tunnel::{EstablishedTunnel, LiveTunnel, TunnelPrimitive, TunnelRequest};
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const TUNNEL_EXITED: &str = "tunnel process exited unexpectedly";
const EXPIRED_BEFORE_READY: &str = "session expired before the tunnel was ready";

/// What a termination attempt has to do after inspecting the state
enum StopStep {
    /// Session is in a gate state; wait for it to move on
    Wait,
    /// We own the teardown of this handle
    Release(Option<Box<dyn LiveTunnel>>),
    /// Already terminal
    Done,
}

/// Orchestrates the lifecycle of port-forward sessions
///
/// Cloning is cheap; clones share the same registry, tunnel primitive and
/// port pool.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    tunnels: Arc<dyn TunnelPrimitive>,
    ports: Arc<LocalPortAllocator>,
    config: Arc<SessionConfig>,
}

impl SessionManager {
    /// Create a manager with its own registry
    pub fn new(config: SessionConfig, tunnels: Arc<dyn TunnelPrimitive>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        Self::with_registry(config, tunnels, registry)
    }

    /// Create a manager over an existing registry
    pub fn with_registry(
        config: SessionConfig,
        tunnels: Arc<dyn TunnelPrimitive>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        info!(
            max_sessions = registry.max_sessions(),
            timeout_secs = config.session_timeout.as_secs(),
            ports = %format!("{}-{}", config.port_range.start(), config.port_range.end()),
            "Creating session manager"
        );
        Self {
            ports: Arc::new(LocalPortAllocator::new(config.port_range.clone())),
            registry,
            tunnels,
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a port-forward to `port` on `pod` in `namespace`
    ///
    /// Returns the new session's view, carrying the id callers use to stop or
    /// query it. A failed establishment is reported once and not retried; the
    /// failed session stays queryable for the grace period.
    pub async fn start(
        &self,
        namespace: &str,
        pod: &str,
        port: u32,
    ) -> Result<SessionView, SessionError> {
        let target = Target::new(namespace, pod, port)?;
        let id = self
            .registry
            .insert(target.clone(), self.config.session_timeout)?;

        let Some(local_port) = self.ports.allocate(&id) else {
            self.registry.discard(&id);
            return Err(SessionError::PortsExhausted {
                start: *self.config.port_range.start(),
                end: *self.config.port_range.end(),
            });
        };
        self.registry.update(&id, |entry| {
            entry.set_local_port(local_port);
            Ok(())
        })?;

        info!(
            session_id = %id,
            namespace = %target.namespace,
            pod = %target.pod,
            port = target.remote_port,
            local_port,
            "Starting port-forward"
        );

        let request = TunnelRequest {
            target,
            local_port,
            bind_address: self.config.bind_address.clone(),
        };

        let this = self.clone();
        let task_id = id.clone();
        match tokio::spawn(async move { this.establish(task_id, request).await }).await {
            Ok(result) => result,
            Err(e) => {
                let reason = format!("establish task aborted: {}", e);
                self.fail_start(&id, &reason);
                Err(SessionError::TunnelEstablishFailed { id, reason })
            }
        }
    }

    async fn establish(
        &self,
        id: SessionId,
        request: TunnelRequest,
    ) -> Result<SessionView, SessionError> {
        // Never wait past the session's own expiry
        let timeout = match self.registry.get(&id) {
            Ok(session) => self
                .config
                .establish_timeout
                .min(session.ttl_remaining(Instant::now())),
            Err(_) => self.config.establish_timeout,
        };
        let outcome =
            match tokio::time::timeout(timeout, self.tunnels.establish(&request, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(TunnelError::Timeout(timeout)),
            };

        match outcome {
            Ok(tunnel) => self.activate(&id, tunnel).await,
            Err(e) => {
                let reason = e.to_string();
                warn!(session_id = %id, forward = %request.target, error = %reason, "Port-forward failed to start");
                self.fail_start(&id, &reason);
                Err(SessionError::TunnelEstablishFailed { id, reason })
            }
        }
    }

    async fn activate(
        &self,
        id: &SessionId,
        tunnel: EstablishedTunnel,
    ) -> Result<SessionView, SessionError> {
        let EstablishedTunnel { endpoint, handle } = tunnel;
        let mut orphan: Option<Box<dyn LiveTunnel>> = None;
        let mut slot = Some(handle);

        let activated = self.registry.update(id, |entry| {
            let Some(handle) = slot.take() else {
                return Ok(());
            };
            let expired = entry.session().is_expired(Instant::now());
            if entry.state() == SessionState::Starting && expired {
                orphan = Some(handle);
                entry.set_error(EXPIRED_BEFORE_READY);
                entry.transition(SessionState::Failed)?;
                return Err(SessionError::TunnelEstablishFailed {
                    id: id.clone(),
                    reason: EXPIRED_BEFORE_READY.to_string(),
                });
            }
            match entry.activate(endpoint.clone(), handle) {
                Ok(()) => Ok(()),
                Err(handle) => {
                    orphan = Some(handle);
                    Err(SessionError::InvalidTransition {
                        id: id.clone(),
                        from: entry.state(),
                        to: SessionState::Active,
                    })
                }
            }
        });

        if let Err(e) = activated {
            // Nothing owns the tunnel now; release it here so it cannot leak.
            error!(session_id = %id, error = %e, "Could not activate established tunnel");
            if let Some(mut handle) = orphan.or(slot) {
                if let Err(te) = handle.terminate().await {
                    warn!(session_id = %id, error = %te, "Failed to release orphaned tunnel");
                }
            }
            self.ports.release(id);
            return Err(e);
        }

        info!(session_id = %id, endpoint = %endpoint, "Port-forward active");
        self.status(id)
    }

    fn fail_start(&self, id: &SessionId, reason: &str) {
        self.ports.release(id);
        let result = self.registry.update(id, |entry| {
            entry.set_error(reason);
            entry.transition(SessionState::Failed)
        });
        if let Err(e) = result {
            error!(session_id = %id, error = %e, "Could not record failed session");
        }
    }

    /// Stop a session; stopping a session that already ended succeeds
    ///
    /// # Errors
    ///
    /// `NotFound` if the id was never issued or has been pruned.
    /// `TeardownFailed` if the tunnel could not be terminated cleanly; the
    /// session still ends up `Stopped`.
    pub async fn stop(&self, id: &SessionId) -> Result<(), SessionError> {
        self.terminate_session(id, StopReason::Requested).await.map(|_| ())
    }

    /// Stop a session whose lifetime ran out
    ///
    /// Returns `false` when the session had already ended by other means.
    pub async fn expire(&self, id: &SessionId) -> Result<bool, SessionError> {
        self.terminate_session(id, StopReason::Expired).await
    }

    /// The single termination path shared by stop, expiry and shutdown
    ///
    /// `Ok(true)` only for the call that released the tunnel.
    async fn terminate_session(
        &self,
        id: &SessionId,
        reason: StopReason,
    ) -> Result<bool, SessionError> {
        loop {
            let step = self.registry.update(id, |entry| match entry.state() {
                SessionState::Starting | SessionState::Stopping => Ok(StopStep::Wait),
                SessionState::Active => {
                    entry.transition(SessionState::Stopping)?;
                    entry.set_stop_reason(reason);
                    Ok(StopStep::Release(entry.take_handle()))
                }
                SessionState::Stopped | SessionState::Failed => Ok(StopStep::Done),
            })?;

            match step {
                StopStep::Done => {
                    debug!(session_id = %id, "Session already ended");
                    return Ok(false);
                }
                StopStep::Wait => {
                    let mut rx = self.registry.subscribe(id)?;
                    let _ = rx
                        .wait_for(|s| !matches!(s, SessionState::Starting | SessionState::Stopping))
                        .await;
                }
                StopStep::Release(handle) => {
                    let this = self.clone();
                    let task_id = id.clone();
                    return match tokio::spawn(async move { this.release(&task_id, handle, reason).await })
                        .await
                    {
                        Ok(result) => result.map(|()| true),
                        Err(e) => Err(SessionError::TeardownFailed {
                            id: id.clone(),
                            reason: format!("teardown task aborted: {}", e),
                        }),
                    };
                }
            }
        }
    }

    async fn release(
        &self,
        id: &SessionId,
        handle: Option<Box<dyn LiveTunnel>>,
        reason: StopReason,
    ) -> Result<(), SessionError> {
        let teardown_error = match handle {
            Some(mut handle) => handle.terminate().await.err().map(|e| e.to_string()),
            None => None,
        };
        self.ports.release(id);

        self.registry.update(id, |entry| {
            if let Some(error) = &teardown_error {
                entry.set_error(error.clone());
            }
            entry.transition(SessionState::Stopped)
        })?;

        match teardown_error {
            Some(reason) => {
                warn!(session_id = %id, error = %reason, "Port-forward stopped with teardown error");
                Err(SessionError::TeardownFailed {
                    id: id.clone(),
                    reason,
                })
            }
            None => {
                info!(session_id = %id, reason = ?reason, "Port-forward stopped");
                Ok(())
            }
        }
    }

    /// Fail an active session whose tunnel died on its own
    ///
    /// Returns `true` when the session was found dead and moved to `Failed`.
    pub async fn reap_dead_tunnel(&self, id: &SessionId) -> Result<bool, SessionError> {
        let handle = self.registry.update(id, |entry| {
            if entry.state() != SessionState::Active || entry.tunnel_alive() {
                return Ok(None);
            }
            entry.transition(SessionState::Failed)?;
            entry.set_error(TUNNEL_EXITED);
            entry.set_stop_reason(StopReason::TunnelExited);
            Ok(Some(entry.take_handle()))
        })?;

        let Some(handle) = handle else {
            return Ok(false);
        };

        warn!(session_id = %id, "Tunnel exited on its own");
        if let Some(mut handle) = handle {
            if let Err(e) = handle.terminate().await {
                warn!(session_id = %id, error = %e, "Failed to clean up exited tunnel");
            }
        }
        self.ports.release(id);
        Ok(true)
    }

    /// Status of one session
    pub fn status(&self, id: &SessionId) -> Result<SessionView, SessionError> {
        self.registry.get(id).map(|s| s.view(Instant::now()))
    }

    /// Status of every session still held, oldest first
    pub fn status_all(&self) -> Vec<SessionView> {
        let now = Instant::now();
        let mut sessions = self.registry.list();
        sessions.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.id.cmp(&b.id)));
        sessions.iter().map(|s| s.view(now)).collect()
    }

    /// Sessions forwarding to a given pod port
    pub fn find_by_target(
        &self,
        namespace: &str,
        pod: &str,
        port: u32,
    ) -> Result<Vec<SessionView>, SessionError> {
        let target = Target::new(namespace, pod, port)?;
        let now = Instant::now();
        Ok(self
            .registry
            .find_by_target(&target)
            .iter()
            .map(|s| s.view(now))
            .collect())
    }

    /// Stop every live session, e.g. before the process exits
    pub async fn shutdown(&self) {
        let live = self.registry.list_active();
        if live.is_empty() {
            return;
        }

        info!(count = live.len(), "Stopping all port-forwards");
        let results = join_all(
            live.iter()
                .map(|s| self.terminate_session(&s.id, StopReason::Shutdown)),
        )
        .await;

        for (session, result) in live.iter().zip(results) {
            if let Err(e) = result {
                warn!(session_id = %session.id, error = %e, "Failed to stop session during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LocalEndpoint;
    use crate::tunnel::{MockLiveTunnel, MockTunnelPrimitive};
    use std::time::Duration;

    fn config(range: std::ops::RangeInclusive<u16>) -> SessionConfig {
        SessionConfig::default()
            .with_max_sessions(4)
            .with_session_timeout(Duration::from_secs(60))
            .with_reaper_interval(Duration::from_secs(1))
            .with_grace_period(Duration::from_secs(30))
            .with_port_range(range)
    }

    fn live_tunnel(terminations: usize, alive: bool) -> MockLiveTunnel {
        let mut handle = MockLiveTunnel::new();
        handle
            .expect_terminate()
            .times(terminations)
            .returning(|| Ok(()));
        handle.expect_is_alive().returning(move || alive);
        handle
    }

    fn establishing(terminations: usize, alive: bool) -> MockTunnelPrimitive {
        let mut tunnels = MockTunnelPrimitive::new();
        tunnels
            .expect_establish()
            .times(1)
            .returning(move |request: &TunnelRequest, _timeout: Duration| {
                Ok(EstablishedTunnel {
                    endpoint: LocalEndpoint::new("127.0.0.1", request.local_port),
                    handle: Box::new(live_tunnel(terminations, alive)),
                })
            });
        tunnels
    }

    #[tokio::test]
    async fn test_start_activates_session() {
        let manager = SessionManager::new(config(22000..=22099), Arc::new(establishing(0, true)));

        let view = manager.start("default", "web-1", 8080).await.unwrap();
        assert_eq!(view.state, SessionState::Active);
        assert_eq!(view.namespace, "default");
        assert_eq!(view.pod, "web-1");
        assert_eq!(view.remote_port, 8080);
        let local_port = view.local_port.unwrap();
        assert!((22000..=22099).contains(&local_port));
        assert_eq!(
            view.local_endpoint.as_deref(),
            Some(format!("127.0.0.1:{}", local_port).as_str())
        );
        assert!(view.ttl_remaining_secs > 0);

        let status = manager.status(&view.id).unwrap();
        assert_eq!(status.state, SessionState::Active);
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_tunnel() {
        let mut tunnels = MockTunnelPrimitive::new();
        tunnels.expect_establish().times(0);
        let manager = SessionManager::new(config(22100..=22199), Arc::new(tunnels));

        let err = manager.start("", "web-1", 8080).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRequest(_)));
        let err = manager.start("default", "web-1", 70000).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRequest(_)));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_failed_establish_is_recorded() {
        let mut tunnels = MockTunnelPrimitive::new();
        tunnels.expect_establish().times(1).returning(|_, _| {
            Err(TunnelError::Exited {
                status: "exit status: 1".to_string(),
                stderr: "pods \"web-1\" not found".to_string(),
            })
        });
        let manager = SessionManager::new(config(22200..=22299), Arc::new(tunnels));

        let err = manager.start("default", "web-1", 8080).await.unwrap_err();
        let id = match err {
            SessionError::TunnelEstablishFailed { id, reason } => {
                assert!(reason.contains("not found"));
                id
            }
            other => panic!("unexpected error: {other:?}"),
        };

        let status = manager.status(&id).unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert!(status.error.unwrap().contains("not found"));
        assert_eq!(manager.ports.allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_twice_releases_once() {
        let manager = SessionManager::new(config(22300..=22349), Arc::new(establishing(1, true)));
        let view = manager.start("default", "web-1", 8080).await.unwrap();

        manager.stop(&view.id).await.unwrap();
        manager.stop(&view.id).await.unwrap();

        let status = manager.status(&view.id).unwrap();
        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.stop_reason, Some(StopReason::Requested));
        assert_eq!(status.ttl_remaining_secs, 0);
        assert_eq!(manager.ports.allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_expire_after_stop_is_not_counted() {
        let manager = SessionManager::new(config(22450..=22499), Arc::new(establishing(1, true)));
        let view = manager.start("default", "web-1", 8080).await.unwrap();

        manager.stop(&view.id).await.unwrap();
        assert!(!manager.expire(&view.id).await.unwrap());

        let status = manager.status(&view.id).unwrap();
        assert_eq!(status.stop_reason, Some(StopReason::Requested));
    }

    #[tokio::test]
    async fn test_expire_reports_release() {
        let manager = SessionManager::new(config(22350..=22399), Arc::new(establishing(1, true)));
        let view = manager.start("default", "web-1", 8080).await.unwrap();

        assert!(manager.expire(&view.id).await.unwrap());
        assert_eq!(
            manager.status(&view.id).unwrap().stop_reason,
            Some(StopReason::Expired)
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_session() {
        let manager = SessionManager::new(config(22400..=22449), Arc::new(MockTunnelPrimitive::new()));
        let id = SessionId::from("nope");
        assert_eq!(manager.stop(&id).await, Err(SessionError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_teardown_error_still_stops_session() {
        let mut tunnels = MockTunnelPrimitive::new();
        tunnels.expect_establish().times(1).returning(|request, _| {
            let mut handle = MockLiveTunnel::new();
            handle
                .expect_terminate()
                .times(1)
                .returning(|| Err(TunnelError::Terminate("permission denied".to_string())));
            Ok(EstablishedTunnel {
                endpoint: LocalEndpoint::new("127.0.0.1", request.local_port),
                handle: Box::new(handle),
            })
        });
        let manager = SessionManager::new(config(22500..=22599), Arc::new(tunnels));
        let view = manager.start("default", "web-1", 8080).await.unwrap();

        let err = manager.stop(&view.id).await.unwrap_err();
        assert!(matches!(err, SessionError::TeardownFailed { .. }));
        assert_eq!(manager.status(&view.id).unwrap().state, SessionState::Stopped);
        assert!(manager.stop(&view.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_reap_dead_tunnel() {
        let manager = SessionManager::new(config(22600..=22699), Arc::new(establishing(1, false)));
        let view = manager.start("default", "web-1", 8080).await.unwrap();

        assert!(manager.reap_dead_tunnel(&view.id).await.unwrap());
        let status = manager.status(&view.id).unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.stop_reason, Some(StopReason::TunnelExited));

        assert!(!manager.reap_dead_tunnel(&view.id).await.unwrap());
        assert!(manager.stop(&view.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_live_tunnel_is_not_reaped() {
        let manager = SessionManager::new(config(22700..=22799), Arc::new(establishing(1, true)));
        let view = manager.start("default", "web-1", 8080).await.unwrap();

        assert!(!manager.reap_dead_tunnel(&view.id).await.unwrap());
        assert_eq!(manager.status(&view.id).unwrap().state, SessionState::Active);
        manager.shutdown().await;
        assert_eq!(
            manager.status(&view.id).unwrap().stop_reason,
            Some(StopReason::Shutdown)
        );
    }

    #[tokio::test]
    async fn test_ports_exhausted_discards_reservation() {
        let manager = SessionManager::new(config(22800..=22800), Arc::new(establishing(0, true)));
        manager.start("default", "web-1", 8080).await.unwrap();

        let err = manager.start("default", "web-2", 8080).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::PortsExhausted {
                start: 22800,
                end: 22800
            }
        );
        assert_eq!(manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_inverted_port_range_is_exhausted() {
        let mut tunnels = MockTunnelPrimitive::new();
        tunnels.expect_establish().times(0);
        #[allow(clippy::reversed_empty_ranges)]
        let range = 22850..=22840;
        let manager = SessionManager::new(config(range), Arc::new(tunnels));

        let err = manager.start("default", "web-1", 8080).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::PortsExhausted {
                start: 22850,
                end: 22840
            }
        );
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_find_by_target() {
        let manager = SessionManager::new(config(22900..=22999), Arc::new(establishing(0, true)));
        let view = manager.start("default", "web-1", 8080).await.unwrap();

        let found = manager.find_by_target("default", "web-1", 8080).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, view.id);
        assert!(manager.find_by_target("default", "web-1", 9090).unwrap().is_empty());
    }
}
