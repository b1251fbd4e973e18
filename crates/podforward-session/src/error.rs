//! Error taxonomy for the session core

use crate::session::{SessionId, SessionState};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the session registry and manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session limit reached ({max} concurrent sessions)")]
    RegistryFull { max: usize },

    #[error("Failed to establish tunnel for session {id}: {reason}")]
    TunnelEstablishFailed { id: SessionId, reason: String },

    #[error("Session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },

    #[error("No free local port in {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("Tunnel teardown failed for session {id}: {reason}")]
    TeardownFailed { id: SessionId, reason: String },

    #[error("Session {id} is still {state}")]
    NotTerminal { id: SessionId, state: SessionState },
}

impl SessionError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidRequest(_) => "INVALID_REQUEST",
            SessionError::NotFound(_) => "SESSION_NOT_FOUND",
            SessionError::RegistryFull { .. } => "REGISTRY_FULL",
            SessionError::TunnelEstablishFailed { .. } => "TUNNEL_ESTABLISH_FAILED",
            SessionError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SessionError::PortsExhausted { .. } => "PORTS_EXHAUSTED",
            SessionError::TeardownFailed { .. } => "TEARDOWN_FAILED",
            SessionError::NotTerminal { .. } => "SESSION_NOT_TERMINAL",
        }
    }
}

/// Errors reported by a tunnel primitive
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Failed to spawn tunnel process: {0}")]
    Spawn(String),

    #[error("Tunnel process exited ({status}): {stderr}")]
    Exited { status: String, stderr: String },

    #[error("Tunnel not ready after {0:?}")]
    Timeout(Duration),

    #[error("Tunnel I/O error: {0}")]
    Io(String),

    #[error("Failed to terminate tunnel: {0}")]
    Terminate(String),
}

impl From<std::io::Error> for TunnelError {
    fn from(e: std::io::Error) -> Self {
        TunnelError::Io(e.to_string())
    }
}

/// Invalid session configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_sessions must be at least 1")]
    NoSessionsAllowed,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("reaper interval ({interval:?}) must be shorter than the session timeout ({timeout:?})")]
    ReaperTooSlow { interval: Duration, timeout: Duration },

    #[error("establish timeout ({establish:?}) must be shorter than the session timeout ({timeout:?})")]
    EstablishTooSlow { establish: Duration, timeout: Duration },

    #[error("Invalid port range: {0}")]
    PortRange(String),
}
