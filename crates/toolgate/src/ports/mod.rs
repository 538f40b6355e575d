use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

pub const DEFAULT_REUSE_COOLDOWN: Duration = Duration::from_secs(10);

/// Contiguous port range with per-server reservations.
///
/// A released port drains for a cooldown before any *other* server may take
/// it; the releasing server may reclaim its own draining port immediately.
/// The supervisor is the only writer.
pub struct PortPool {
    start: u16,
    end: u16,
    assigned: HashMap<String, u16>,
    draining: HashMap<u16, Draining>,
    cooldown: Duration,
}

struct Draining {
    reserved_for: String,
    released_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub range_start: u16,
    pub range_end: u16,
    pub total: usize,
    pub allocated: usize,
    pub draining: usize,
    pub free: usize,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self::with_cooldown(start, end, DEFAULT_REUSE_COOLDOWN)
    }

    pub fn with_cooldown(start: u16, end: u16, cooldown: Duration) -> Self {
        debug_assert!(start <= end);
        Self {
            start,
            end,
            assigned: HashMap::new(),
            draining: HashMap::new(),
            cooldown,
        }
    }

    /// Idempotent: a server that already holds a port gets the same port
    /// back. Otherwise the lowest free port in the range, preferring the
    /// server's own draining port if one exists.
    pub fn allocate(&mut self, server_id: &str) -> Option<u16> {
        if let Some(port) = self.assigned.get(server_id) {
            return Some(*port);
        }

        self.expire_draining();

        // Reclaim our own draining port without waiting out the cooldown.
        let own = self
            .draining
            .iter()
            .find(|(_, d)| d.reserved_for == server_id)
            .map(|(port, _)| *port);
        if let Some(port) = own {
            self.draining.remove(&port);
            self.assigned.insert(server_id.to_string(), port);
            debug!(server_id, port, "reclaimed draining port");
            return Some(port);
        }

        let taken: std::collections::HashSet<u16> = self.assigned.values().copied().collect();
        for port in self.start..=self.end {
            if !taken.contains(&port) && !self.draining.contains_key(&port) {
                self.assigned.insert(server_id.to_string(), port);
                debug!(server_id, port, "allocated port");
                return Some(port);
            }
        }
        None
    }

    /// Removes the mapping; the port becomes allocatable to other servers
    /// only after the reuse cooldown has elapsed.
    pub fn release(&mut self, server_id: &str) {
        if let Some(port) = self.assigned.remove(server_id) {
            debug!(server_id, port, "released port, draining");
            self.draining.insert(
                port,
                Draining {
                    reserved_for: server_id.to_string(),
                    released_at: Instant::now(),
                },
            );
        }
    }

    pub fn port_of(&self, server_id: &str) -> Option<u16> {
        self.assigned.get(server_id).copied()
    }

    pub fn is_available(&mut self, port: u16) -> bool {
        if port < self.start || port > self.end {
            return false;
        }
        self.expire_draining();
        !self.assigned.values().any(|p| *p == port) && !self.draining.contains_key(&port)
    }

    pub fn stats(&mut self) -> PoolStats {
        self.expire_draining();
        let total = (self.end - self.start) as usize + 1;
        let allocated = self.assigned.len();
        let draining = self.draining.len();
        PoolStats {
            range_start: self.start,
            range_end: self.end,
            total,
            allocated,
            draining,
            free: total.saturating_sub(allocated + draining),
        }
    }

    /// Current `(server_id, port)` pairs, sorted by port.
    pub fn entries(&self) -> Vec<(String, u16)> {
        let mut out: Vec<(String, u16)> = self
            .assigned
            .iter()
            .map(|(id, port)| (id.clone(), *port))
            .collect();
        out.sort_by_key(|(_, port)| *port);
        out
    }

    fn expire_draining(&mut self) {
        let cooldown = self.cooldown;
        self.draining
            .retain(|_, d| d.released_at.elapsed() < cooldown);
    }
}
