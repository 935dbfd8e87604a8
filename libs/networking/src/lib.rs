//! Networking rules shared by providers and provisioners.
//!
//! - Node-port allocation within a fixed numeric range, per infrastructure.
//! - Hostname normalization for newly created compute nodes.

mod hostname;
mod ports;

pub use hostname::{sanitize_hostname, MAX_HOSTNAME_LEN};
pub use ports::{PortAllocator, PortRange, NODE_PORT_END, NODE_PORT_START};

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Port lies outside the allocator's range.
    #[error("port {port} is outside the allowed range {start}-{end}")]
    PortOutOfRange { port: u16, start: u16, end: u16 },

    /// Port is already held by another product.
    #[error("port {0} is already in use")]
    PortInUse(u16),

    /// No free port left at or above the high-water mark.
    #[error("port range {start}-{end} exhausted")]
    PortsExhausted { start: u16, end: u16 },

    /// Invalid range bounds.
    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    /// Hostname empty or too long after normalization.
    #[error("invalid hostname '{raw}': must normalize to 1-{max} characters")]
    InvalidHostname { raw: String, max: usize },
}
