//! Listening ports.
//!
//! A [`FirewallPort`] is the model of one TCP listener. Writing its fields is
//! the only way to drive the listener: every change is handed to its
//! [`PortRuntime`], which reconciles the socket in the background.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ingress_dynamo::{
    ChangeNotifier, Dynamo, Identifier, IngressError, OperatingStatus, Result, Runtime,
    Shutdownable, ShutdownResult,
};
use tokio::sync::watch;

use crate::connection::FirewallConnection;
use crate::context::FirewallContext;
use crate::controller::controller_for;
use crate::network::{NetworkMetrics, NetworkProtocol, PortValue};
use crate::port_runtime::PortRuntime;

/// Declared configuration of a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Shared with the model owning the port.
    pub id: Identifier,
    pub protocol: NetworkProtocol,
    pub is_enabled: bool,
    /// `None` means unassigned: the port never comes online.
    pub value: Option<PortValue>,
    pub default_value: Option<PortValue>,
    pub client_backlog: u16,
    pub reuse_addr: bool,
}

impl PortConfig {
    pub const DEFAULT_CLIENT_BACKLOG: u16 = 4;

    /// A new, enabled port waiting for the host to assign its number.
    pub fn new(id: Identifier, protocol: NetworkProtocol, default_value: Option<PortValue>) -> Self {
        Self {
            id,
            protocol,
            is_enabled: true,
            value: None,
            default_value,
            client_backlog: Self::DEFAULT_CLIENT_BACKLOG,
            reuse_addr: true,
        }
    }

    /// URL the listener answers on, once a number is assigned.
    pub fn target_url(&self) -> Option<String> {
        self.value.map(|value| format!("http://localhost:{value}"))
    }
}

/// Live status of a port's listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PortStatus {
    #[default]
    Offline,
    Starting,
    Online,
    Degraded,
    Stopping,
    Reconfiguring,
    Error(IngressError),
}

impl PortStatus {
    /// Whether the status is a resting point rather than a transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Online | Self::Offline | Self::Error(_))
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => f.write_str("offline"),
            Self::Starting => f.write_str("starting"),
            Self::Online => f.write_str("online"),
            Self::Degraded => f.write_str("degraded"),
            Self::Stopping => f.write_str("stopping"),
            Self::Reconfiguring => f.write_str("reconfiguring"),
            Self::Error(cause) => write!(f, "failed: {cause}"),
        }
    }
}

/// Counters of a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortMetrics {
    /// Traffic of every connection the port has served.
    pub network_metrics: NetworkMetrics,
    /// Reconciliation passes that changed the listener's target.
    pub rebuilds: u64,
}

/// Everything the listener's target depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfigSnapshot {
    pub is_firewall_enabled: bool,
    pub config: PortConfig,
    pub is_paused: bool,
}

impl PortConfigSnapshot {
    /// Whether a listener should be bound.
    pub fn is_online(&self) -> bool {
        !self.is_paused
            && self.is_firewall_enabled
            && self.config.is_enabled
            && self.config.value.is_some()
    }
}

/// One TCP listener owned by the firewall.
pub struct FirewallPort {
    dynamo: Dynamo<PortRuntime>,
}

impl FirewallPort {
    pub(crate) fn connect(
        config: PortConfig,
        context: Arc<FirewallContext>,
        engine_paused: watch::Receiver<bool>,
        firewall_enabled: watch::Receiver<bool>,
        firewall_changes: ChangeNotifier,
    ) -> Result<Arc<Self>> {
        let id = config.id;
        let label = format!("{} port {}", config.protocol, id.brief_id());
        let runtime = PortRuntime::new(
            config.clone(),
            context,
            controller_for(config.protocol),
            engine_paused.clone(),
            firewall_enabled,
        )?;

        let changes = runtime.core().subscribe();
        tokio::spawn(forward_status_changes(
            Arc::downgrade(&runtime),
            changes,
            firewall_changes.clone(),
        ));

        let dynamo = Dynamo::new(id, label, runtime, engine_paused);
        dynamo.set_config_observer(Arc::new(move |_: Identifier, _: &PortConfig| {
            firewall_changes.notify()
        }));
        Ok(Arc::new(Self { dynamo }))
    }

    pub fn id(&self) -> Identifier {
        self.dynamo.id()
    }

    pub fn config(&self) -> PortConfig {
        self.dynamo.config()
    }

    pub fn protocol(&self) -> NetworkProtocol {
        self.config().protocol
    }

    pub fn is_enabled(&self) -> bool {
        self.config().is_enabled
    }

    pub fn set_enabled(&self, is_enabled: bool) {
        self.dynamo
            .update_config(|config| config.is_enabled = is_enabled);
    }

    pub fn value(&self) -> Option<PortValue> {
        self.config().value
    }

    /// Assign or clear the port number. `Some(0)` binds an ephemeral port.
    pub fn set_value(&self, value: Option<PortValue>) {
        self.dynamo.update_config(|config| config.value = value);
    }

    pub fn default_value(&self) -> Option<PortValue> {
        self.config().default_value
    }

    pub fn client_backlog(&self) -> u16 {
        self.config().client_backlog
    }

    pub fn set_client_backlog(&self, client_backlog: u16) {
        self.dynamo
            .update_config(|config| config.client_backlog = client_backlog);
    }

    /// Replace the whole configuration; the identifier cannot change.
    pub fn apply_config(&self, config: PortConfig) -> Result<bool> {
        if config.id != self.id() || config.protocol != self.protocol() {
            return Err(IngressError::BadArguments(
                "a port's identifier and protocol are fixed".into(),
            ));
        }
        Ok(self.dynamo.apply_config(config))
    }

    pub fn target_url(&self) -> Option<String> {
        self.config().target_url()
    }

    pub fn port_status(&self) -> PortStatus {
        self.dynamo
            .runtime()
            .map(|runtime| runtime.port_status())
            .unwrap_or(PortStatus::Offline)
    }

    pub fn port_metrics(&self) -> PortMetrics {
        self.dynamo
            .runtime()
            .map(|runtime| runtime.port_metrics())
            .unwrap_or_default()
    }

    /// The live connections, as one consistent snapshot.
    pub fn connections(&self) -> Vec<Arc<FirewallConnection>> {
        self.dynamo
            .runtime()
            .map(|runtime| runtime.connections())
            .unwrap_or_default()
    }

    /// Address the listener is actually bound to.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.dynamo
            .runtime()
            .and_then(|runtime| runtime.local_address())
    }

    pub fn operating_status(&self) -> OperatingStatus {
        self.dynamo.operating_status()
    }

    /// Observe runtime state changes: status, metrics and connections.
    pub fn subscribe_state(&self) -> Option<watch::Receiver<u64>> {
        self.dynamo.subscribe_state()
    }

    pub fn subscribe_config(&self) -> watch::Receiver<u64> {
        self.dynamo.subscribe_config()
    }

    pub async fn shutdown(&self) -> ShutdownResult {
        self.dynamo.shutdown().await
    }
}

impl fmt::Debug for FirewallPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirewallPort")
            .field("config", &self.config())
            .field("status", &self.port_status())
            .finish()
    }
}

#[async_trait]
impl Shutdownable for FirewallPort {
    async fn shutdown(&self) -> ShutdownResult {
        FirewallPort::shutdown(self).await
    }
}

/// Poke the firewall whenever the port's status changes.
async fn forward_status_changes(
    runtime: std::sync::Weak<PortRuntime>,
    mut changes: watch::Receiver<u64>,
    firewall_changes: ChangeNotifier,
) {
    let mut last = None;
    while changes.changed().await.is_ok() {
        let Some(status) = runtime.upgrade().map(|runtime| runtime.port_status()) else {
            break;
        };
        if last.as_ref() != Some(&status) {
            last = Some(status);
            firewall_changes.notify();
        }
    }
    firewall_changes.notify();
}
