//! Tunnel primitive abstraction
//!
//! The session core never moves bytes itself. A [`TunnelPrimitive`] opens a
//! live network path to a pod and hands back a [`LiveTunnel`] that the
//! session owns until it is terminated. Implementations report failures
//! upward and must not retry on their own.

use crate::error::TunnelError;
use crate::session::{LocalEndpoint, Target};
use async_trait::async_trait;
use std::time::Duration;

/// Everything a primitive needs to open one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub target: Target,
    /// Local port reserved for this tunnel
    pub local_port: u16,
    /// Address the local side should listen on
    pub bind_address: String,
}

/// A freshly established tunnel
pub struct EstablishedTunnel {
    pub endpoint: LocalEndpoint,
    pub handle: Box<dyn LiveTunnel>,
}

impl std::fmt::Debug for EstablishedTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedTunnel")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Opens tunnels to pods
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelPrimitive: Send + Sync {
    /// Establish a tunnel, giving up after `timeout`
    async fn establish(
        &self,
        request: &TunnelRequest,
        timeout: Duration,
    ) -> Result<EstablishedTunnel, TunnelError>;
}

/// Ownership of one live tunnel resource
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LiveTunnel: Send {
    /// Whether the tunnel is still up
    fn is_alive(&mut self) -> bool;

    /// Release the tunnel. Called at most once per handle.
    async fn terminate(&mut self) -> Result<(), TunnelError>;
}
