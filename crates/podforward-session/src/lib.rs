//! Port-forward session core
//!
//! Creates, tracks, bounds the lifetime of, and tears down concurrent
//! port-forward sessions to pods. Establishing the actual tunnel is delegated
//! to a [`TunnelPrimitive`].
pub mod config;
pub mod error;
pub mod manager;
pub mod port_allocator;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod tunnel;

pub use config::{parse_port_range, SessionConfig};
pub use error::{ConfigError, SessionError, TunnelError};
pub use manager::SessionManager;
pub use port_allocator::LocalPortAllocator;
pub use reaper::{ReapReport, Reaper};
pub use registry::{SessionEntry, SessionRegistry};
pub use session::{
    LocalEndpoint, Session, SessionId, SessionState, SessionView, StopReason, Target,
};
pub use tunnel::{EstablishedTunnel, LiveTunnel, TunnelPrimitive, TunnelRequest};
