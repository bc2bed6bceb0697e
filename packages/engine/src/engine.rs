//! The engine facade handed to host applications.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ingress_dynamo::{
    Identifier, IngressError, OperatingStatus, Result, ShutdownResult, Version,
};
use ingress_firewall::Firewall;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::environment::EngineEnvironment;
use crate::node::{HttpTriggerNode, Node, NodeRegistry};
use crate::settings::EngineSettings;
use crate::snapshot::{self, EngineSnapshot};

/// The organizing processor of one repository.
///
/// An engine is always on: it is never restarted, only paused. Engines start
/// paused so that two instances of one repository can coexist, and must be
/// [`start`](Engine::start)ed before any port comes online.
///
/// Engines must be created inside a tokio runtime.
///
/// # Example
///
/// ```ignore
/// let engine = Engine::new(EngineSettings::default());
/// let trigger = engine.add_http_trigger(Some("webhook".into()))?;
/// trigger.port().set_value(Some(8083));
/// engine.start();
///
/// engine.save_to("orders.ingress")?;
/// engine.shutdown().await?;
/// ```
pub struct Engine {
    env: Arc<EngineEnvironment>,
    was_started: AtomicBool,
}

impl Engine {
    /// The operating version of the engine.
    pub const VERSION: Version = Version::new(0, 1, 0);

    /// An empty engine for a new repository.
    pub fn new(settings: EngineSettings) -> Self {
        let env = EngineEnvironment::new(EngineConfig::new(Identifier::new()), &settings);
        Self::with_environment(env)
    }

    /// Load the repository package at `path`.
    pub fn load(
        path: impl AsRef<Path>,
        registry: &NodeRegistry,
        settings: EngineSettings,
    ) -> Result<Self> {
        let config = snapshot::load_config(path)?;
        let env = EngineEnvironment::new(config, &settings);
        if let Err(err) = env.reload_nodes(registry) {
            let orphan = Arc::clone(&env);
            tokio::spawn(async move {
                let _ = orphan.shutdown().await;
            });
            return Err(err);
        }
        Ok(Self::with_environment(env))
    }

    fn with_environment(env: Arc<EngineEnvironment>) -> Self {
        Self {
            env,
            was_started: AtomicBool::new(false),
        }
    }

    /// Begin processing. Only the first call has an effect.
    pub fn start(&self) {
        if !self.was_started.swap(true, Ordering::SeqCst) {
            self.set_paused(false);
        }
    }

    /// Temporarily stop all processing without reconfiguring anything.
    pub fn set_paused(&self, is_paused: bool) {
        if self.env.set_engine_paused(is_paused) {
            info!(
                "{} the engine operation for repository {}",
                if is_paused { "Pausing" } else { "Unpausing" },
                self.repository_id().brief_id()
            );
        }
    }

    pub fn is_paused(&self) -> bool {
        self.env.is_engine_paused()
    }

    pub fn operating_status(&self) -> OperatingStatus {
        self.env.operating_status()
    }

    pub fn repository_id(&self) -> Identifier {
        self.env.repository_id()
    }

    /// Local network management for engine ingress.
    pub fn firewall(&self) -> &Firewall {
        self.env.firewall()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.env.nodes()
    }

    pub fn node(&self, id: Identifier) -> Option<Node> {
        self.env.node(id)
    }

    /// Add an HTTP trigger with its own, not yet assigned, port.
    pub fn add_http_trigger(&self, name: Option<String>) -> Result<Arc<HttpTriggerNode>> {
        if !self.operating_status().is_processing() {
            return Err(IngressError::NotProcessing);
        }
        let node = HttpTriggerNode::create(name, &self.env)?;
        if let Err(err) = self.env.insert_node(Node::HttpTrigger(Arc::clone(&node))) {
            let orphan = Arc::clone(&node);
            tokio::spawn(async move {
                let _ = orphan.shutdown().await;
            });
            return Err(err);
        }
        Ok(node)
    }

    /// A point-in-time, fully encoded copy of the configuration.
    pub fn snapshot(&self) -> Result<EngineSnapshot> {
        self.env.snapshot()
    }

    /// Save the repository as a package at `path`.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        self.snapshot()?.save_to(path)
    }

    /// Shut down every node, the firewall and the network context.
    ///
    /// A second call reports [`IngressError::NotProcessing`].
    pub async fn shutdown(&self) -> ShutdownResult {
        self.env.shutdown().await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("env", &self.env)
            .field("was_started", &self.was_started.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.env.operating_status().is_processing() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            debug!("Dropped engine outside of a runtime; relying on its parts to shut down");
            return;
        };
        let env = Arc::clone(&self.env);
        handle.spawn(async move {
            let _ = env.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_version() {
        assert_eq!(Engine::VERSION.to_string(), "0.1.0");
    }

    #[tokio::test]
    async fn engine_starts_once() {
        let engine = Engine::new(EngineSettings::default());
        assert!(engine.is_paused());
        assert_eq!(engine.operating_status(), OperatingStatus::Paused);

        engine.start();
        assert!(!engine.is_paused());
        assert_eq!(engine.operating_status(), OperatingStatus::Running);

        engine.set_paused(true);
        engine.start();
        assert!(engine.is_paused());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn engine_shutdown_twice() {
        let engine = Engine::new(EngineSettings::default());
        engine.add_http_trigger(None).unwrap();

        assert_eq!(engine.shutdown().await, Ok(()));
        assert_eq!(engine.operating_status(), OperatingStatus::Offline);
        assert_eq!(engine.shutdown().await, Err(IngressError::NotProcessing));
        assert_eq!(
            engine.add_http_trigger(None).err(),
            Some(IngressError::NotProcessing)
        );
    }
}
