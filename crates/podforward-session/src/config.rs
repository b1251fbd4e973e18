//! Session manager configuration

use crate::error::ConfigError;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Default lifetime of a port-forward (one hour)
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;
/// Default first local port handed to tunnels
pub const DEFAULT_PORT_RANGE_START: u16 = 9000;
/// Default last local port handed to tunnels
pub const DEFAULT_PORT_RANGE_END: u16 = 9999;

/// Limits and timings for the session core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum number of live (non-terminal) sessions
    pub max_sessions: usize,
    /// Lifetime of a session before the reaper stops it
    pub session_timeout: Duration,
    /// How often the reaper scans the registry
    pub reaper_interval: Duration,
    /// How long a terminal session stays queryable
    pub grace_period: Duration,
    /// Upper bound on tunnel establishment
    pub establish_timeout: Duration,
    /// Local ports handed out to tunnels
    pub port_range: RangeInclusive<u16>,
    /// Address tunnels listen on
    pub bind_address: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            reaper_interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(60),
            establish_timeout: Duration::from_secs(15),
            port_range: DEFAULT_PORT_RANGE_START..=DEFAULT_PORT_RANGE_END,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_establish_timeout(mut self, timeout: Duration) -> Self {
        self.establish_timeout = timeout;
        self
    }

    pub fn with_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Check internal consistency
    ///
    /// The reaper must tick faster than the shortest session lifetime so
    /// expiry is noticed promptly, and a tunnel must be given up on before
    /// its session would already have expired.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::NoSessionsAllowed);
        }
        for (name, value) in [
            ("session_timeout", self.session_timeout),
            ("reaper_interval", self.reaper_interval),
            ("establish_timeout", self.establish_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.reaper_interval >= self.session_timeout {
            return Err(ConfigError::ReaperTooSlow {
                interval: self.reaper_interval,
                timeout: self.session_timeout,
            });
        }
        if self.establish_timeout >= self.session_timeout {
            return Err(ConfigError::EstablishTooSlow {
                establish: self.establish_timeout,
                timeout: self.session_timeout,
            });
        }
        if self.port_range.is_empty() || *self.port_range.start() == 0 {
            return Err(ConfigError::PortRange(format!(
                "{}-{}",
                self.port_range.start(),
                self.port_range.end()
            )));
        }
        Ok(())
    }
}

/// Parse a `START-END` port range
pub fn parse_port_range(range_str: &str) -> Result<RangeInclusive<u16>, ConfigError> {
    let (start, end) = range_str.split_once('-').ok_or_else(|| {
        ConfigError::PortRange(format!(
            "'{}' (expected START-END, e.g. 9000-9999)",
            range_str
        ))
    })?;

    let start: u16 = start
        .trim()
        .parse()
        .map_err(|_| ConfigError::PortRange(format!("invalid start port '{}'", start)))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|_| ConfigError::PortRange(format!("invalid end port '{}'", end)))?;

    if start == 0 || start > end {
        return Err(ConfigError::PortRange(format!("{}-{}", start, end)));
    }

    Ok(start..=end)
}
