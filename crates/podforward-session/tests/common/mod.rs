//! Instrumented tunnel primitive shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use podforward_session::{
    EstablishedTunnel, LiveTunnel, LocalEndpoint, SessionConfig, TunnelError, TunnelPrimitive,
    TunnelRequest,
};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Clone)]
pub enum Behavior {
    Succeed,
    Fail(String),
    /// Take this long before succeeding
    Delay(Duration),
    /// Wait for the notify before succeeding
    Gate(Arc<Notify>),
    /// Succeed, but every handle fails to terminate
    FailTeardown,
}

/// Tunnel primitive that counts establishments and releases
pub struct CountingTunnel {
    behavior: Behavior,
    pub establish_calls: AtomicUsize,
    pub established: AtomicUsize,
    pub terminated: Arc<AtomicUsize>,
    /// Liveness reported by every handle created from here
    pub alive: Arc<AtomicBool>,
}

impl CountingTunnel {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            establish_calls: AtomicUsize::new(0),
            established: AtomicUsize::new(0),
            terminated: Arc::new(AtomicUsize::new(0)),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(Behavior::Succeed)
    }

    pub fn established(&self) -> usize {
        self.established.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelPrimitive for CountingTunnel {
    async fn establish(
        &self,
        request: &TunnelRequest,
        _timeout: Duration,
    ) -> Result<EstablishedTunnel, TunnelError> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);

        let fail_teardown = match &self.behavior {
            Behavior::Succeed => false,
            Behavior::Fail(reason) => {
                return Err(TunnelError::Exited {
                    status: "exit status: 1".to_string(),
                    stderr: reason.clone(),
                })
            }
            Behavior::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                false
            }
            Behavior::Gate(gate) => {
                gate.notified().await;
                false
            }
            Behavior::FailTeardown => true,
        };

        self.established.fetch_add(1, Ordering::SeqCst);
        Ok(EstablishedTunnel {
            endpoint: LocalEndpoint::new("127.0.0.1", request.local_port),
            handle: Box::new(CountingHandle {
                terminated: self.terminated.clone(),
                alive: self.alive.clone(),
                released: false,
                fail_teardown,
            }),
        })
    }
}

struct CountingHandle {
    terminated: Arc<AtomicUsize>,
    alive: Arc<AtomicBool>,
    released: bool,
    fail_teardown: bool,
}

#[async_trait]
impl LiveTunnel for CountingHandle {
    fn is_alive(&mut self) -> bool {
        !self.released && self.alive.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self) -> Result<(), TunnelError> {
        assert!(!self.released, "tunnel handle released twice");
        self.released = true;
        self.terminated.fetch_add(1, Ordering::SeqCst);
        if self.fail_teardown {
            return Err(TunnelError::Terminate("process refused to die".to_string()));
        }
        Ok(())
    }
}

/// Config with short timings and a dedicated local port range
pub fn test_config(ports: RangeInclusive<u16>) -> SessionConfig {
    SessionConfig::default()
        .with_max_sessions(8)
        .with_session_timeout(Duration::from_secs(60))
        .with_reaper_interval(Duration::from_secs(1))
        .with_grace_period(Duration::from_secs(5))
        .with_establish_timeout(Duration::from_secs(3))
        .with_port_range(ports)
        .with_bind_address("127.0.0.1")
}
