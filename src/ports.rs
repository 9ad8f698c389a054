//! Exclusive host port reservation
//!
//! The reservation set is the single source of truth for "in use": a port
//! enters it the moment it is chosen and leaves only on explicit release.

use std::collections::HashSet;

use parking_lot::Mutex;
use rand::Rng;

use crate::config::PortRange;

pub struct PortAllocator {
    range: PortRange,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Draw a random free port from the range and reserve it.
    ///
    /// Retries are unbounded: the range must be sized well above the number
    /// of concurrently live containers, or this spins until one is released.
    ///
    /// The lock is held for a single draw only, so releases can land while
    /// a caller waits on a full range.
    pub fn allocate(&self) -> u16 {
        let mut rng = rand::rng();
        loop {
            let candidate = rng.random_range(self.range.min..self.range.max);
            if self.reserved.lock().insert(candidate) {
                tracing::debug!(port = candidate, "Port allocated");
                return candidate;
            }
            std::thread::yield_now();
        }
    }

    /// Reserve a specific port. Returns false if it was already reserved.
    pub fn reserve(&self, port: u16) -> bool {
        self.reserved.lock().insert(port)
    }

    /// Idempotent removal from the reservation set
    pub fn release(&self, port: u16) {
        if self.reserved.lock().remove(&port) {
            tracing::debug!(port, "Port released");
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }

    pub fn reserved(&self) -> Vec<u16> {
        let mut ports: Vec<_> = self.reserved.lock().iter().copied().collect();
        ports.sort_unstable();
        ports
    }
}
