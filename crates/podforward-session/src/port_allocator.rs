//! Local port allocation for tunnels
//!
//! Each session gets a local port from a fixed range. The preferred port is
//! derived from a hash of the session id so ports spread across the range;
//! nearby ports and then any free port are tried when it is taken.

use crate::session::SessionId;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::Mutex;
use tracing::{debug, warn};

/// How far around the preferred port to look before falling back
const NEARBY_SPAN: u16 = 10;

struct Pool {
    available: BTreeSet<u16>,
    allocated: HashMap<SessionId, u16>,
}

/// Hands out local ports from a range, one per session
pub struct LocalPortAllocator {
    range: RangeInclusive<u16>,
    pool: Mutex<Pool>,
}

impl LocalPortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let available = range.clone().filter(|port| *port != 0).collect();
        Self {
            range,
            pool: Mutex::new(Pool {
                available,
                allocated: HashMap::new(),
            }),
        }
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    /// Check the port is actually free at the OS level
    fn is_port_free(port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }

    /// `None` for an empty (inverted) range
    fn hash_to_port(&self, id: &SessionId) -> Option<u16> {
        let start = *self.range.start();
        let width = self.range.end().checked_sub(start)?;
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let span = u64::from(width) + 1;
        Some(start + (hasher.finish() % span) as u16)
    }

    /// Reserve a port for `id`
    ///
    /// Returns the already reserved port when called twice for the same id.
    pub fn allocate(&self, id: &SessionId) -> Option<u16> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(port) = pool.allocated.get(id) {
            return Some(*port);
        }

        let Some(preferred) = self.hash_to_port(id) else {
            warn!(
                start = *self.range.start(),
                end = *self.range.end(),
                "Local port range is empty"
            );
            return None;
        };
        let mut candidates = vec![preferred];
        for offset in 1..=NEARBY_SPAN {
            candidates.push(preferred.saturating_add(offset));
            candidates.push(preferred.saturating_sub(offset));
        }

        for port in candidates {
            if self.range.contains(&port) && pool.available.contains(&port) {
                if Self::is_port_free(port) {
                    pool.available.remove(&port);
                    pool.allocated.insert(id.clone(), port);
                    debug!(session_id = %id, port, preferred, "Allocated local port");
                    return Some(port);
                }
                warn!(port, "Port is in use by another process, skipping");
            }
        }

        let remaining: Vec<u16> = pool.available.iter().copied().collect();
        for port in remaining {
            if Self::is_port_free(port) {
                pool.available.remove(&port);
                pool.allocated.insert(id.clone(), port);
                debug!(session_id = %id, port, preferred, "Allocated fallback local port");
                return Some(port);
            }
        }

        warn!(
            session_id = %id,
            start = *self.range.start(),
            end = *self.range.end(),
            "No free local port left in range"
        );
        None
    }

    /// Return the port reserved for `id` to the pool
    pub fn release(&self, id: &SessionId) -> Option<u16> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        let port = pool.allocated.remove(id)?;
        pool.available.insert(port);
        debug!(session_id = %id, port, "Released local port");
        Some(port)
    }

    pub fn port_for(&self, id: &SessionId) -> Option<u16> {
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.allocated.get(id).copied()
    }

    pub fn allocated_count(&self) -> usize {
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.allocated.len()
    }
}
