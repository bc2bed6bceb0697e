//! Network value types shared by ports and connections.

use std::fmt;
use std::net::SocketAddr;
use std::ops::{Add, AddAssign};
use std::sync::Weak;

/// A TCP port number.
pub type PortValue = u16;

/// Application protocol spoken on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    Http,
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("HTTP"),
        }
    }
}

/// Byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkMetrics {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl NetworkMetrics {
    pub fn inbound(bytes: u64) -> Self {
        Self {
            bytes_in: bytes,
            bytes_out: 0,
        }
    }

    pub fn outbound(bytes: u64) -> Self {
        Self {
            bytes_in: 0,
            bytes_out: bytes,
        }
    }
}

impl Add for NetworkMetrics {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            bytes_in: self.bytes_in + rhs.bytes_in,
            bytes_out: self.bytes_out + rhs.bytes_out,
        }
    }
}

impl AddAssign for NetworkMetrics {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Receiver of byte counts from the data path.
pub trait TrafficObserver: Send + Sync {
    fn notify_network_traffic_metrics(&self, delta: NetworkMetrics);
}

impl<T: TrafficObserver> TrafficObserver for Weak<T> {
    fn notify_network_traffic_metrics(&self, delta: NetworkMetrics) {
        if let Some(observer) = self.upgrade() {
            observer.notify_network_traffic_metrics(delta);
        }
    }
}

/// Address of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub description: String,
    pub ip_address: String,
    pub port: PortValue,
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            description: addr.to_string(),
            ip_address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}
