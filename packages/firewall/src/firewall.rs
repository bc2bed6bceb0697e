//! The firewall: owner of every port of an engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ingress_dynamo::{
    ChangeNotifier, Dynamo, Identifier, IngressError, OperatingStatus, Result, Runtime,
    RuntimeCore, Shutdownable, ShutdownResult, ShutdownResultExt,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::context::FirewallContext;
use crate::network::{NetworkProtocol, PortValue};
use crate::port::{FirewallPort, PortConfig, PortStatus};

/// Configuration of the firewall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FirewallConfig {
    /// Master switch: no port is online while this is `false`.
    pub is_enabled: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self { is_enabled: true }
    }
}

/// Combined status of all ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallStatus {
    Offline,
    Warning,
    Error,
    Online,
}

impl fmt::Display for FirewallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Offline => "offline",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Online => "online",
        };
        f.write_str(text)
    }
}

/// Ports owned by the firewall.
#[derive(Default)]
pub struct FirewallState {
    ports: Vec<Arc<FirewallPort>>,
    port_map: HashMap<Identifier, Arc<FirewallPort>>,
    port_hash: String,
}

impl FirewallState {
    /// Register `port` unless its identifier is taken.
    fn add_port(&mut self, port: Arc<FirewallPort>) -> bool {
        if self.port_map.contains_key(&port.id()) {
            return false;
        }
        self.port_map.insert(port.id(), Arc::clone(&port));
        self.ports.push(port);
        self.port_hash = port_hash(self.ports.iter().map(|port| port.id()));
        true
    }
}

/// Hex SHA-256 of the sorted port identifiers joined with `.`.
pub fn port_hash(ids: impl IntoIterator<Item = Identifier>) -> String {
    let mut ids: Vec<String> = ids.into_iter().map(|id| id.to_string()).collect();
    ids.sort();
    hex::encode(Sha256::digest(ids.join(".").as_bytes()))
}

/// Runtime of the firewall; publishes its enablement to the ports.
pub struct FirewallRuntime {
    core: RuntimeCore<FirewallConfig, FirewallState>,
    enabled: watch::Sender<bool>,
}

impl FirewallRuntime {
    fn new(config: FirewallConfig, is_paused: bool) -> Self {
        let (enabled, _) = watch::channel(config.is_enabled);
        Self {
            core: RuntimeCore::new(config, is_paused, FirewallState::default()),
            enabled,
        }
    }
}

#[async_trait]
impl Runtime for FirewallRuntime {
    type Config = FirewallConfig;
    type State = FirewallState;

    fn core(&self) -> &RuntimeCore<FirewallConfig, FirewallState> {
        &self.core
    }

    async fn configuration_changed(&self) {
        let is_enabled = self.core.config().is_enabled;
        self.enabled.send_if_modified(|current| {
            let changed = *current != is_enabled;
            *current = is_enabled;
            changed
        });
    }

    async fn shutdown_runtime(&self, _config: FirewallConfig) -> ShutdownResult {
        let ports = self
            .core
            .with_state_if_running(|state| {
                state.port_map.clear();
                std::mem::take(&mut state.ports)
            })
            .unwrap_or_default();

        let mut result: ShutdownResult = Ok(());
        for port in ports {
            match port.shutdown().await {
                Err(IngressError::NotProcessing) => {}
                other => result.append(other),
            }
        }
        result
    }
}

/// The aggregate of every listening port.
pub struct Firewall {
    dynamo: Dynamo<FirewallRuntime>,
    context: Arc<FirewallContext>,
    engine_paused: watch::Receiver<bool>,
    enabled: watch::Receiver<bool>,
    changes: ChangeNotifier,
}

impl Firewall {
    pub fn new(
        config: FirewallConfig,
        context: Arc<FirewallContext>,
        engine_paused: watch::Receiver<bool>,
    ) -> Self {
        let runtime = Arc::new(FirewallRuntime::new(config, *engine_paused.borrow()));
        let enabled = runtime.enabled.subscribe();
        let dynamo = Dynamo::new(
            Identifier::new(),
            "firewall",
            runtime,
            engine_paused.clone(),
        );

        let changes = ChangeNotifier::new();
        let observer = changes.clone();
        dynamo.set_config_observer(Arc::new(move |_: Identifier, _: &FirewallConfig| {
            observer.notify()
        }));

        Self {
            dynamo,
            context,
            engine_paused,
            enabled,
            changes,
        }
    }

    pub fn id(&self) -> Identifier {
        self.dynamo.id()
    }

    pub fn config(&self) -> FirewallConfig {
        self.dynamo.config()
    }

    pub fn is_enabled(&self) -> bool {
        self.config().is_enabled
    }

    pub fn set_enabled(&self, is_enabled: bool) {
        if self.dynamo.update_config(|config| config.is_enabled = is_enabled) {
            info!(
                "{} firewall",
                if is_enabled { "Enabling" } else { "Disabling" }
            );
        }
    }

    pub fn context(&self) -> &Arc<FirewallContext> {
        &self.context
    }

    pub fn operating_status(&self) -> OperatingStatus {
        self.dynamo.operating_status()
    }

    /// Ports in the order they were connected.
    pub fn ports(&self) -> Vec<Arc<FirewallPort>> {
        self.read_state(|state| state.ports.clone())
            .unwrap_or_default()
    }

    pub fn port(&self, id: Identifier) -> Option<Arc<FirewallPort>> {
        self.read_state(|state| state.port_map.get(&id).cloned())
            .flatten()
    }

    /// Digest identifying the current set of ports.
    pub fn port_hash(&self) -> String {
        self.read_state(|state| state.port_hash.clone())
            .unwrap_or_default()
    }

    /// Create a port for the model identified by `id`.
    ///
    /// The port starts enabled but unassigned; it comes online once the host
    /// gives it a number.
    pub fn connect_port(
        &self,
        protocol: NetworkProtocol,
        default_value: Option<PortValue>,
        id: Identifier,
    ) -> Result<Arc<FirewallPort>> {
        let runtime = self.dynamo.runtime().ok_or(IngressError::NotProcessing)?;
        let duplicate = || IngressError::BadArguments(format!("a port for {id} is already connected"));
        if self.port(id).is_some() {
            return Err(duplicate());
        }

        let port = FirewallPort::connect(
            PortConfig::new(id, protocol, default_value),
            Arc::clone(&self.context),
            self.engine_paused.clone(),
            self.enabled.clone(),
            self.changes.clone(),
        )?;
        let added = runtime
            .core()
            .with_state_if_running(|state| state.add_port(Arc::clone(&port)));
        if added != Some(true) {
            let orphan = Arc::clone(&port);
            tokio::spawn(async move {
                let _ = orphan.shutdown().await;
            });
            return Err(match added {
                Some(_) => duplicate(),
                None => IngressError::NotProcessing,
            });
        }

        debug!(port = %id.brief_id(), "Connected {protocol} port");
        self.changes.notify();
        Ok(port)
    }

    /// Aggregate status of the enabled ports.
    pub fn firewall_status(&self) -> FirewallStatus {
        let ports = self.ports();
        if !self.is_enabled() || ports.is_empty() {
            return FirewallStatus::Offline;
        }

        let (mut online, mut error, mut invalid) = (0, 0, 0);
        for port in ports.iter().filter(|port| port.is_enabled()) {
            match port.port_status() {
                PortStatus::Online => online += 1,
                PortStatus::Error(_) => error += 1,
                PortStatus::Degraded | PortStatus::Offline => invalid += 1,
                _ => {}
            }
        }

        if online == ports.len() {
            FirewallStatus::Online
        } else if error == ports.len() {
            FirewallStatus::Error
        } else if (invalid > 0 || online > 0) && !self.dynamo.is_engine_paused() {
            FirewallStatus::Warning
        } else {
            FirewallStatus::Offline
        }
    }

    /// Observe port set, port status and enablement changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub async fn shutdown(&self) -> ShutdownResult {
        let result = self.dynamo.shutdown().await;
        self.changes.notify();
        result
    }

    fn read_state<R>(&self, f: impl FnOnce(&FirewallState) -> R) -> Option<R> {
        self.dynamo
            .runtime()
            .and_then(|runtime| runtime.core().read_state(f))
    }
}

impl fmt::Debug for Firewall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Firewall")
            .field("config", &self.config())
            .field("ports", &self.ports().len())
            .field("status", &self.firewall_status())
            .finish()
    }
}

#[async_trait]
impl Shutdownable for Firewall {
    async fn shutdown(&self) -> ShutdownResult {
        Firewall::shutdown(self).await
    }
}
