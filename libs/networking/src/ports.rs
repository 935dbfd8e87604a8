//! Node-port allocation.
//!
//! One allocator exists per infrastructure and is stored inside the
//! platform product's configuration, so it must round-trip through serde.
//!
//! The allocator keeps a high-water mark (`next_port`) and the set of
//! claimed ports. Every port in `[start, next_port)` handed out by
//! [`PortAllocator::get_new_free_port`] stays claimed until liberated, and
//! liberating a port below the mark rewinds the mark so freed low ports
//! are reused first.
//!
//! There is no internal locking; callers serialize access.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::NetworkError;

pub const NODE_PORT_START: u16 = 30000;
pub const NODE_PORT_END: u16 = 32767;

/// Inclusive port window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: NODE_PORT_START,
            end: NODE_PORT_END,
        }
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, NetworkError> {
        if start > end {
            return Err(NetworkError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    fn out_of_range(&self, port: u16) -> NetworkError {
        NetworkError::PortOutOfRange {
            port,
            start: self.start,
            end: self.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocator {
    range: PortRange,
    next_port: u16,
    claimed: BTreeSet<u16>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortRange::default())
    }
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            next_port: range.start,
            claimed: BTreeSet::new(),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Next candidate port.
    pub fn high_water_mark(&self) -> u16 {
        self.next_port
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.claimed.contains(&port)
    }

    pub fn claimed(&self) -> impl Iterator<Item = u16> + '_ {
        self.claimed.iter().copied()
    }

    /// Hands out the first unclaimed port at or above the high-water mark
    /// and marks it claimed.
    pub fn get_new_free_port(&mut self) -> Result<u16, NetworkError> {
        let mut candidate = u32::from(self.next_port.max(self.range.start));
        while u16::try_from(candidate).is_ok_and(|p| self.claimed.contains(&p)) {
            candidate += 1;
        }

        let port = u16::try_from(candidate)
            .ok()
            .filter(|p| self.range.contains(*p))
            .ok_or(NetworkError::PortsExhausted {
                start: self.range.start,
                end: self.range.end,
            })?;

        self.claimed.insert(port);
        self.next_port = port.saturating_add(1);
        Ok(port)
    }

    /// Marks a specific port as claimed.
    pub fn claim_port(&mut self, port: u16) -> Result<(), NetworkError> {
        if !self.range.contains(port) {
            return Err(self.range.out_of_range(port));
        }
        if !self.claimed.insert(port) {
            return Err(NetworkError::PortInUse(port));
        }
        Ok(())
    }

    /// Releases `port`. Releasing an unclaimed port is a no-op on the
    /// claimed set but still rewinds the high-water mark.
    pub fn liberate_port(&mut self, port: u16) {
        self.claimed.remove(&port);
        if port < self.next_port {
            self.next_port = port;
        }
    }
}
