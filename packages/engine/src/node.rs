//! Nodes: the persisted building blocks of a repository.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ingress_dynamo::{
    Codable, CodableRecord, CodableRegistry, Decoder, Dynamo, DynamoSnapshot, Identifier,
    OperatingStatus, Result, Runtime, RuntimeCore, Shutdownable, ShutdownResult,
};
use ingress_firewall::{FirewallPort, NetworkProtocol, PortConfig, PortValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::environment::EngineEnvironment;

/// Configuration of an HTTP trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpTriggerConfig {
    /// Human-readable purpose of the node.
    pub name: Option<String>,
    /// Port number offered to the host when assigning one.
    pub default_port_number: Option<PortValue>,
    pub client_backlog: u16,
}

impl Default for HttpTriggerConfig {
    fn default() -> Self {
        Self {
            name: None,
            default_port_number: None,
            client_backlog: PortConfig::DEFAULT_CLIENT_BACKLOG,
        }
    }
}

/// Keeps the trigger's port in line with the trigger's configuration.
pub struct HttpTriggerRuntime {
    core: RuntimeCore<HttpTriggerConfig, ()>,
    port: Weak<FirewallPort>,
}

#[async_trait]
impl Runtime for HttpTriggerRuntime {
    type Config = HttpTriggerConfig;
    type State = ();

    fn core(&self) -> &RuntimeCore<HttpTriggerConfig, ()> {
        &self.core
    }

    async fn configuration_changed(&self) {
        let Some(port) = self.port.upgrade() else {
            return;
        };
        let config = self.core.config();
        let mut desired = port.config();
        desired.default_value = config.default_port_number;
        desired.client_backlog = config.client_backlog;
        if let Err(err) = port.apply_config(desired) {
            warn!(port = %port.id().brief_id(), error = %err, "Failed to update trigger port");
        }
    }
}

/// A node that accepts HTTP traffic on its own firewall port.
pub struct HttpTriggerNode {
    dynamo: Dynamo<HttpTriggerRuntime>,
    port: Arc<FirewallPort>,
}

impl Codable for HttpTriggerNode {
    const TYPE_ID: &'static str = "trigger.http";
    type Config = HttpTriggerConfig;
}

impl HttpTriggerNode {
    /// Create a new trigger and record it for the next save.
    pub fn create(name: Option<String>, environment: &EngineEnvironment) -> Result<Arc<Self>> {
        let config = HttpTriggerConfig {
            name,
            ..HttpTriggerConfig::default()
        };
        let node = Self::connect(Identifier::new(), config, environment)?;
        environment.save_node_snapshot(node.snapshot());
        Ok(node)
    }

    /// Decoder registered for [`HttpTriggerNode::TYPE_ID`].
    pub fn decode(record: CodableRecord, environment: &EngineEnvironment) -> Result<Node> {
        let config = record.config()?;
        Ok(Node::HttpTrigger(Self::connect(record.id, config, environment)?))
    }

    fn connect(
        id: Identifier,
        config: HttpTriggerConfig,
        environment: &EngineEnvironment,
    ) -> Result<Arc<Self>> {
        let port = environment.firewall().connect_port(
            NetworkProtocol::Http,
            config.default_port_number,
            id,
        )?;
        port.set_client_backlog(config.client_backlog);

        let runtime = Arc::new(HttpTriggerRuntime {
            core: RuntimeCore::new(config, environment.is_engine_paused(), ()),
            port: Arc::downgrade(&port),
        });
        let dynamo = Dynamo::new(
            id,
            format!("HTTP trigger {}", id.brief_id()),
            runtime,
            environment.subscribe_paused(),
        );

        let recorder = environment.downgrade();
        dynamo.set_config_observer(Arc::new(move |id: Identifier, config: &HttpTriggerConfig| {
            if let Some(environment) = recorder.upgrade() {
                environment.save_node_snapshot(DynamoSnapshot::capture::<HttpTriggerNode>(id, config));
            }
        }));
        debug!(node = %id.brief_id(), "Connected HTTP trigger");
        Ok(Arc::new(Self { dynamo, port }))
    }

    pub fn id(&self) -> Identifier {
        self.dynamo.id()
    }

    pub fn config(&self) -> HttpTriggerConfig {
        self.dynamo.config()
    }

    pub fn name(&self) -> Option<String> {
        self.config().name
    }

    pub fn set_name(&self, name: Option<String>) {
        self.dynamo.update_config(|config| config.name = name);
    }

    pub fn default_port_number(&self) -> Option<PortValue> {
        self.config().default_port_number
    }

    pub fn set_default_port_number(&self, value: Option<PortValue>) {
        self.dynamo
            .update_config(|config| config.default_port_number = value);
    }

    pub fn client_backlog(&self) -> u16 {
        self.config().client_backlog
    }

    pub fn set_client_backlog(&self, client_backlog: u16) {
        self.dynamo
            .update_config(|config| config.client_backlog = client_backlog);
    }

    /// The firewall port sharing this node's identifier.
    pub fn port(&self) -> &Arc<FirewallPort> {
        &self.port
    }

    pub fn operating_status(&self) -> OperatingStatus {
        self.dynamo.operating_status()
    }

    pub fn snapshot(&self) -> DynamoSnapshot {
        DynamoSnapshot::capture::<Self>(self.id(), &self.config())
    }

    pub async fn shutdown(&self) -> ShutdownResult {
        self.dynamo.shutdown().await
    }
}

impl fmt::Debug for HttpTriggerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTriggerNode")
            .field("id", &self.id())
            .field("config", &self.config())
            .finish()
    }
}

#[async_trait]
impl Shutdownable for HttpTriggerNode {
    async fn shutdown(&self) -> ShutdownResult {
        HttpTriggerNode::shutdown(self).await
    }
}

/// Every kind of node an engine can hold.
#[derive(Debug, Clone)]
pub enum Node {
    HttpTrigger(Arc<HttpTriggerNode>),
}

impl Node {
    pub fn id(&self) -> Identifier {
        match self {
            Self::HttpTrigger(node) => node.id(),
        }
    }

    pub fn type_id(&self) -> &'static str {
        match self {
            Self::HttpTrigger(_) => HttpTriggerNode::TYPE_ID,
        }
    }

    pub fn name(&self) -> Option<String> {
        match self {
            Self::HttpTrigger(node) => node.name(),
        }
    }

    pub fn operating_status(&self) -> OperatingStatus {
        match self {
            Self::HttpTrigger(node) => node.operating_status(),
        }
    }

    pub fn snapshot(&self) -> DynamoSnapshot {
        match self {
            Self::HttpTrigger(node) => node.snapshot(),
        }
    }

    pub fn as_http_trigger(&self) -> Option<&Arc<HttpTriggerNode>> {
        match self {
            Self::HttpTrigger(node) => Some(node),
        }
    }

    pub async fn shutdown(&self) -> ShutdownResult {
        match self {
            Self::HttpTrigger(node) => node.shutdown().await,
        }
    }
}

#[async_trait]
impl Shutdownable for Node {
    async fn shutdown(&self) -> ShutdownResult {
        Node::shutdown(self).await
    }
}

/// Decoders for every node type an engine can load.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    decoders: CodableRegistry<Node, EngineEnvironment>,
}

impl NodeRegistry {
    /// A registry without any node type.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in node types.
    pub fn standard() -> Self {
        let built_in: [(&str, Decoder<Node, EngineEnvironment>); 1] =
            [(HttpTriggerNode::TYPE_ID, HttpTriggerNode::decode)];

        let mut registry = Self::new();
        for (type_id, decoder) in built_in {
            if let Err(err) = registry.register(type_id, decoder) {
                warn!(error = %err, "Skipping built-in node type");
            }
        }
        registry
    }

    pub fn register(
        &mut self,
        type_id: impl Into<String>,
        decoder: Decoder<Node, EngineEnvironment>,
    ) -> Result<()> {
        self.decoders.register(type_id, decoder)
    }

    pub fn is_registered(&self, type_id: &str) -> bool {
        self.decoders.is_registered(type_id)
    }

    pub fn type_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.decoders.type_ids()
    }

    /// Decode one node file into a live node.
    pub fn decode(&self, bytes: &[u8], environment: &EngineEnvironment) -> Result<Node> {
        self.decoders.decode(bytes, environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::settings::EngineSettings;
    use ingress_dynamo::IngressError;

    fn environment() -> Arc<EngineEnvironment> {
        EngineEnvironment::new(EngineConfig::new(Identifier::new()), &EngineSettings::default())
    }

    #[test]
    fn trigger_config_defaults() {
        let config: HttpTriggerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, HttpTriggerConfig::default());
        assert_eq!(config.client_backlog, 4);
    }

    #[test]
    fn standard_registry_knows_http_triggers() {
        let registry = NodeRegistry::standard();
        assert!(registry.is_registered("trigger.http"));
        assert_eq!(registry.type_ids().collect::<Vec<_>>(), vec!["trigger.http"]);
        assert!(!NodeRegistry::new().is_registered("trigger.http"));
    }

    #[tokio::test]
    async fn trigger_connects_port_with_same_id() {
        let env = environment();
        let node = HttpTriggerNode::create(Some("webhook".into()), &env).unwrap();

        assert_eq!(node.port().id(), node.id());
        assert_eq!(env.firewall().port(node.id()).map(|port| port.id()), Some(node.id()));
        assert!(env.config().node_snapshot(node.id()).is_some());

        env.shutdown().await.unwrap();
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn trigger_edits_are_recorded() {
        let env = environment();
        let node = HttpTriggerNode::create(None, &env).unwrap();
        node.set_name(Some("orders".into()));

        let bytes = env
            .config()
            .node_snapshot(node.id())
            .unwrap()
            .encode()
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["name"], "orders");
        assert_eq!(json["typeId"], "trigger.http");
        assert_eq!(json["clientBacklog"], 4);

        node.shutdown().await.unwrap();
        env.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn decode_rejects_duplicate_port() {
        let env = environment();
        let node = HttpTriggerNode::create(None, &env).unwrap();
        let bytes = node.snapshot().encode().unwrap();

        let duplicate = NodeRegistry::standard().decode(&bytes, &env);
        assert!(matches!(duplicate, Err(IngressError::BadArguments(_))));

        node.shutdown().await.unwrap();
        env.shutdown().await.unwrap();
    }
}
