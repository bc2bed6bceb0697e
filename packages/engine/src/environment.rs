//! The engine environment: everything one engine instance owns.
//!
//! The environment is shared by the engine facade and every node. It holds
//! the persisted configuration, the live nodes, the firewall and the network
//! context the firewall runs on, and publishes the engine-wide pause flag to
//! every dynamo.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use ingress_dynamo::{
    Atomic, DynamoSnapshot, Identifier, IngressError, OperatingStatus, Result, ShutdownResult,
    ShutdownResultExt,
};
use ingress_firewall::{Firewall, FirewallConfig, FirewallContext};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, NodeSnapshot};
use crate::node::{Node, NodeRegistry};
use crate::settings::EngineSettings;
use crate::snapshot::EngineSnapshot;

pub struct EngineEnvironment {
    this: Weak<EngineEnvironment>,
    config: Atomic<EngineConfig>,
    /// `None` once shut down.
    nodes: Atomic<Option<BTreeMap<Identifier, Node>>>,
    status: Atomic<OperatingStatus>,
    paused: watch::Sender<bool>,
    context: Arc<FirewallContext>,
    firewall: Arc<Firewall>,
}

impl EngineEnvironment {
    /// Create an environment without nodes. Must be called within a tokio
    /// runtime.
    pub fn new(config: EngineConfig, settings: &EngineSettings) -> Arc<Self> {
        let context = Arc::new(FirewallContext::new(settings.firewall.clone()));
        let (paused, paused_rx) = watch::channel(settings.start_paused);
        let firewall = Arc::new(Firewall::new(
            FirewallConfig::default(),
            Arc::clone(&context),
            paused_rx,
        ));

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config: Atomic::new(config),
            nodes: Atomic::new(Some(BTreeMap::new())),
            status: Atomic::new(OperatingStatus::Running),
            paused,
            context,
            firewall,
        })
    }

    /// A handle that does not keep the environment alive.
    pub fn downgrade(&self) -> Weak<Self> {
        self.this.clone()
    }

    pub fn repository_id(&self) -> Identifier {
        self.config.with_lock(|config| config.repository_id())
    }

    pub fn is_engine_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Flip the engine-wide pause flag. Returns whether it changed.
    pub fn set_engine_paused(&self, is_paused: bool) -> bool {
        self.paused.send_if_modified(|current| {
            let changed = *current != is_paused;
            *current = is_paused;
            changed
        })
    }

    /// The pause flag as seen by dynamos.
    pub fn subscribe_paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    pub fn operating_status(&self) -> OperatingStatus {
        self.status.get().displayed(self.is_engine_paused())
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    pub fn context(&self) -> &Arc<FirewallContext> {
        &self.context
    }

    /// A copy of the persisted configuration.
    pub fn config(&self) -> EngineConfig {
        self.config.get()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes
            .with_lock(|nodes| nodes.iter().flat_map(|nodes| nodes.values().cloned()).collect())
    }

    pub fn node(&self, id: Identifier) -> Option<Node> {
        self.nodes
            .with_lock(|nodes| nodes.as_ref().and_then(|nodes| nodes.get(&id).cloned()))
    }

    /// Add a live node.
    pub fn insert_node(&self, node: Node) -> Result<()> {
        self.nodes.with_lock(|nodes| {
            let nodes = nodes.as_mut().ok_or(IngressError::NotProcessing)?;
            nodes.insert(node.id(), node);
            Ok(())
        })
    }

    /// Record a point-in-time copy of a node for the next save.
    pub fn save_node_snapshot(&self, snapshot: DynamoSnapshot) {
        debug!(node = %snapshot.id().brief_id(), "Recording {} snapshot", snapshot.type_id());
        self.config
            .with_lock(|config| config.save_node_snapshot(snapshot));
    }

    /// Encode the current configuration.
    pub fn snapshot(&self) -> Result<EngineSnapshot> {
        EngineSnapshot::new(&self.config())
    }

    /// Decode every node still held as cached bytes and bring it to life.
    pub fn reload_nodes(&self, registry: &NodeRegistry) -> Result<()> {
        let cached: Vec<(Identifier, Arc<[u8]>)> = self.config.with_lock(|config| {
            config
                .node_snapshots()
                .filter_map(|(id, snapshot)| match snapshot {
                    NodeSnapshot::Cached { bytes, .. } => Some((id, Arc::clone(bytes))),
                    NodeSnapshot::Computed { .. } => None,
                })
                .collect()
        });

        for (id, bytes) in cached {
            let node = registry.decode(&bytes, self)?;
            if node.id() != id {
                return Err(IngressError::invalid_resource(
                    format!("nodes/{id}.json"),
                    format!("the file describes node {}", node.id()),
                ));
            }
            self.insert_node(node)?;
        }
        Ok(())
    }

    /// Shut down every node, then the firewall, then the network context.
    pub async fn shutdown(&self) -> ShutdownResult {
        let Some(nodes) = self.nodes.replace(None) else {
            return Err(IngressError::NotProcessing);
        };
        let repository = self.repository_id();
        self.status.set(OperatingStatus::ShuttingDown);
        info!("Beginning shutdown of the engine for repository {}", repository.brief_id());

        let mut result: ShutdownResult = Ok(());
        for node in nodes.into_values() {
            result.append(node.shutdown().await);
        }
        result.append(self.firewall.shutdown().await);
        result.append(self.context.shutdown().await);

        match &result {
            Ok(()) => {
                self.status.set(OperatingStatus::Offline);
                info!("Completed shutdown of the engine for repository {}", repository.brief_id());
            }
            Err(err) => {
                self.status.set(OperatingStatus::Failed);
                warn!(error = %err, "Failed to shut down the engine for repository {}", repository.brief_id());
            }
        }
        result
    }
}

impl fmt::Debug for EngineEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEnvironment")
            .field("repository_id", &self.repository_id())
            .field("status", &self.operating_status())
            .field("nodes", &self.nodes().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment() -> Arc<EngineEnvironment> {
        EngineEnvironment::new(EngineConfig::new(Identifier::new()), &EngineSettings::default())
    }

    #[tokio::test]
    async fn pause_flag_reaches_subscribers() {
        let env = environment();
        let mut paused = env.subscribe_paused();
        assert!(env.is_engine_paused());
        assert_eq!(env.operating_status(), OperatingStatus::Paused);

        assert!(env.set_engine_paused(false));
        assert!(!env.set_engine_paused(false));
        paused.changed().await.unwrap();
        assert!(!*paused.borrow());
        assert_eq!(env.operating_status(), OperatingStatus::Running);

        env.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let env = environment();
        assert_eq!(env.shutdown().await, Ok(()));
        assert_eq!(env.operating_status(), OperatingStatus::Offline);
        assert_eq!(env.shutdown().await, Err(IngressError::NotProcessing));
        assert!(env.nodes().is_empty());
    }
}
