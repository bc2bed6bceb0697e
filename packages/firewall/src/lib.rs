//! # Ingress Firewall
//!
//! Local TCP ingress for the engine. The firewall owns one [`FirewallPort`]
//! per listening model; each port owns the [`FirewallConnection`]s it has
//! accepted.
//!
//! ## Layers
//!
//! ```text
//! Firewall ── is_enabled, port set, aggregate status
//!   └─ FirewallPort ── declared config (enabled, value, backlog)
//!        └─ PortRuntime ── debounced reconciliation, listener, accept loop
//!             └─ FirewallConnection ── one accepted socket, metered
//! ```
//!
//! A port is online only while the engine is running, the firewall is
//! enabled, the port is enabled and it has a number assigned. Every change
//! to one of those inputs wakes the port's reconciliation worker, which waits
//! for a quiet period and then converges the listener to the latest target.
//!
//! All sockets are driven by the [`FirewallContext`], one lazily created
//! worker pool per engine.

pub mod connection;
pub mod connection_runtime;
pub mod context;
pub mod controller;
pub mod firewall;
pub mod metered;
pub mod network;
pub mod port;
pub mod port_runtime;
pub mod settings;

pub use connection::{ConnectionConfig, ConnectionStatus, FirewallConnection};
pub use context::FirewallContext;
pub use controller::{controller_for, HttpEchoController, PortController, HANG_PATH};
pub use firewall::{port_hash, Firewall, FirewallConfig, FirewallStatus};
pub use metered::MeteredStream;
pub use network::{NetworkAddress, NetworkMetrics, NetworkProtocol, PortValue, TrafficObserver};
pub use port::{FirewallPort, PortConfig, PortConfigSnapshot, PortMetrics, PortStatus};
pub use settings::FirewallSettings;
