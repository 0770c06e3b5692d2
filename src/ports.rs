//! Host port reservation.

use rand::Rng;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Lowest port handed out to instances. Everything below is privileged.
pub const MIN_PORT: u16 = 1024;

const ALLOCATABLE_PORTS: usize = (u16::MAX - MIN_PORT) as usize + 1;

/// Issues unique host ports in `[1024, 65536)`, never touching the fixed
/// reserved set (database, backend UI, SSH, the runner itself).
#[derive(Debug)]
pub struct PortAllocator {
    reserved: HashSet<u16>,
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(reserved: impl IntoIterator<Item = u16>) -> Self {
        Self {
            reserved: reserved.into_iter().collect(),
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve `count` distinct ports in one step, or none at all when the
    /// port space cannot hold them.
    pub fn allocate(&self, count: usize) -> Option<Vec<u16>> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let blocked = used.len()
            + self
                .reserved
                .iter()
                .filter(|port| **port >= MIN_PORT && !used.contains(*port))
                .count();
        if blocked + count > ALLOCATABLE_PORTS {
            return None;
        }

        let mut rng = rand::rng();
        let mut ports = Vec::with_capacity(count);
        while ports.len() < count {
            let port = rng.random_range(MIN_PORT..=u16::MAX);
            if self.reserved.contains(&port) || !used.insert(port) {
                continue;
            }
            ports.push(port);
        }
        Some(ports)
    }

    /// Mark a specific port as used. Returns false if it was already taken
    /// or is reserved.
    pub fn claim(&self, port: u16) -> bool {
        if self.reserved.contains(&port) {
            return false;
        }
        self.used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port)
    }

    pub fn release(&self, ports: &[u16]) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        for port in ports {
            used.remove(port);
        }
    }

    pub fn is_used(&self, port: u16) -> bool {
        self.reserved.contains(&port)
            || self
                .used
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&port)
    }

    pub fn in_use(&self) -> usize {
        self.used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
