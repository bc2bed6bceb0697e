//! Tunables of the firewall subsystem.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the firewall and its shared network context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FirewallSettings {
    /// Quiet period after a port change before its listener is rebuilt.
    pub reconfiguration_delay_ms: u64,

    /// Worker threads of the shared network context.
    pub worker_threads: usize,

    /// Address every listener binds to.
    pub bind_host: IpAddr,

    /// Pause after a failed `accept` before trying again.
    pub accept_backoff_ms: u64,
}

impl FirewallSettings {
    pub const DEFAULT_RECONFIGURATION_DELAY_MS: u64 = 200;

    pub fn reconfiguration_delay(&self) -> Duration {
        Duration::from_millis(self.reconfiguration_delay_ms)
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            reconfiguration_delay_ms: Self::DEFAULT_RECONFIGURATION_DELAY_MS,
            worker_threads: std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1),
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            accept_backoff_ms: 50,
        }
    }
}
