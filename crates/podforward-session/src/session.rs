//! Session model: identifiers, targets, lifecycle states and views
//!
//! A session is one tracked port-forward to a single pod. Its lifecycle only
//! moves forward:
//!
//! ```text
//! Starting ──▶ Active ──▶ Stopping ──▶ Stopped
//!    │           │
//!    └─▶ Failed ◀┘
//! ```

use crate::error::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
#[cfg(feature = "openapi")]
use utoipa::ToSchema;

const MAX_NAMESPACE_LEN: usize = 63;
const MAX_POD_NAME_LEN: usize = 253;

/// Opaque session identifier handed to callers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::str::FromStr for SessionId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SessionError::InvalidRequest(
                "session id must not be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

/// What a session forwards to: a port on a pod in a namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Target {
    pub namespace: String,
    pub pod: String,
    pub remote_port: u16,
}

impl Target {
    /// Validate and build a target
    ///
    /// Namespace must be a DNS-1123 label and the pod name a DNS-1123
    /// subdomain, which also rules out anything a command line would parse
    /// as a flag.
    pub fn new(namespace: &str, pod: &str, port: u32) -> Result<Self, SessionError> {
        let namespace = namespace.trim();
        let pod = pod.trim();

        if namespace.is_empty() || pod.is_empty() {
            return Err(SessionError::InvalidRequest(
                "namespace and pod are required".to_string(),
            ));
        }
        if !is_dns_label(namespace) {
            return Err(SessionError::InvalidRequest(format!(
                "invalid namespace '{}'",
                namespace
            )));
        }
        if !is_dns_subdomain(pod) {
            return Err(SessionError::InvalidRequest(format!(
                "invalid pod name '{}'",
                pod
            )));
        }
        let remote_port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                SessionError::InvalidRequest(format!("port {} is out of range 1-65535", port))
            })?;

        Ok(Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            remote_port,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.pod, self.remote_port)
    }
}

fn is_dns_label(value: &str) -> bool {
    value.len() <= MAX_NAMESPACE_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && starts_and_ends_alphanumeric(value)
}

fn is_dns_subdomain(value: &str) -> bool {
    value.len() <= MAX_POD_NAME_LEN
        && value.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.'
        })
        && starts_and_ends_alphanumeric(value)
}

fn starts_and_ends_alphanumeric(value: &str) -> bool {
    let bytes = value.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric()
        }
        _ => false,
    }
}

/// Where a tunnel is reachable from the proxy's side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct LocalEndpoint {
    /// Address the tunnel listens on (e.g. "127.0.0.1" or "0.0.0.0")
    pub address: String,
    /// Local port
    pub port: u16,
}

impl LocalEndpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Browser link for the forwarded port
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Slot reserved, tunnel being established
    Starting,
    /// Tunnel is up
    Active,
    /// Tunnel is being torn down
    Stopping,
    /// Tunnel released (terminal)
    Stopped,
    /// Establishment failed or the tunnel died (terminal)
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }

    /// Whether `next` is a legal forward edge from this state
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Active)
                | (Starting, Failed)
                | (Active, Stopping)
                | (Active, Failed)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Starting => write!(f, "starting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a session left the active state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Caller asked for it
    Requested,
    /// Lifetime limit reached
    Expired,
    /// The tunnel process went away on its own
    TunnelExited,
    /// Proxy is shutting down
    Shutdown,
}

/// Point-in-time copy of a session
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub target: Target,
    pub local_port: Option<u16>,
    pub local_endpoint: Option<LocalEndpoint>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub started: Instant,
    pub expires_at: Instant,
    pub ended_at: Option<Instant>,
    pub error: Option<String>,
    pub stop_reason: Option<StopReason>,
}

impl Session {
    /// Time left before the reaper evicts this session
    pub fn ttl_remaining(&self, now: Instant) -> std::time::Duration {
        self.expires_at.saturating_duration_since(now)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Read-only projection for status reporting
    pub fn view(&self, now: Instant) -> SessionView {
        let lifetime = self.expires_at.saturating_duration_since(self.started);
        let expires_at = chrono::Duration::from_std(lifetime)
            .map(|d| self.created_at + d)
            .unwrap_or(self.created_at);
        let ttl_remaining_secs = if self.state.is_terminal() {
            0
        } else {
            self.ttl_remaining(now).as_secs()
        };

        SessionView {
            id: self.id.clone(),
            namespace: self.target.namespace.clone(),
            pod: self.target.pod.clone(),
            remote_port: self.target.remote_port,
            local_port: self.local_port,
            local_endpoint: self.local_endpoint.as_ref().map(|e| e.to_string()),
            local_url: self.local_endpoint.as_ref().map(LocalEndpoint::url),
            state: self.state,
            created_at: self.created_at,
            expires_at,
            ttl_remaining_secs,
            error: self.error.clone(),
            stop_reason: self.stop_reason,
        }
    }
}

/// Status projection of a session (serializable for API responses)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct SessionView {
    /// Session identifier, the handle for stop and status calls
    pub id: SessionId,
    pub namespace: String,
    pub pod: String,
    /// Port on the pod
    pub remote_port: u16,
    /// Local port reserved for the tunnel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// Address the tunnel is reachable on, once active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_url: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Seconds until eviction (0 once terminal)
    pub ttl_remaining_secs: u64,
    /// Failure reason, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}
