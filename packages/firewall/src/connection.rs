//! Accepted connections.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ingress_dynamo::{
    Dynamo, Identifier, OperatingStatus, Runtime, Shutdownable, ShutdownResult,
};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use crate::connection_runtime::{ConnectionLink, ConnectionRuntime};
use crate::controller::PortController;
use crate::metered::MeteredStream;
use crate::network::{NetworkAddress, NetworkMetrics, NetworkProtocol, TrafficObserver};
use crate::port_runtime::PortRuntime;

/// Configuration of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Setting this to `false` requests disconnection.
    pub allow_connection: bool,
    pub protocol: NetworkProtocol,
}

impl ConnectionConfig {
    pub fn new(protocol: NetworkProtocol) -> Self {
        Self {
            allow_connection: true,
            protocol,
        }
    }
}

/// Status of a connection. `Offline` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Disconnecting,
    Offline,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Online => "online",
            Self::Disconnecting => "disconnecting",
            Self::Offline => "offline",
        };
        f.write_str(text)
    }
}

/// One accepted socket under a port.
pub struct FirewallConnection {
    dynamo: Dynamo<ConnectionRuntime>,
    remote_address: NetworkAddress,
}

impl FirewallConnection {
    /// Wrap a freshly accepted socket and start serving it.
    pub(crate) fn accept(
        stream: TcpStream,
        remote: SocketAddr,
        port: &Arc<PortRuntime>,
        controller: Arc<dyn PortController>,
        engine_paused: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let remote_address = NetworkAddress::from(remote);
        let config = ConnectionConfig::new(controller.protocol());
        let (runtime, link) =
            ConnectionRuntime::new(config, *engine_paused.borrow(), remote_address.clone());
        let runtime = Arc::new(runtime);

        let id = Identifier::new();
        let dynamo = Dynamo::new(
            id,
            format!("connection from {remote_address}"),
            Arc::clone(&runtime),
            engine_paused,
        );
        debug!(connection = %id.brief_id(), remote = %remote_address, "Accepted connection");

        tokio::spawn(watch_disconnect(
            id,
            Arc::downgrade(&runtime),
            Arc::downgrade(port),
        ));
        tokio::spawn(serve(
            stream,
            controller,
            runtime,
            Arc::downgrade(port),
            link,
        ));

        Arc::new(Self {
            dynamo,
            remote_address,
        })
    }

    pub fn id(&self) -> Identifier {
        self.dynamo.id()
    }

    pub fn remote_address(&self) -> &NetworkAddress {
        &self.remote_address
    }

    pub fn config(&self) -> ConnectionConfig {
        self.dynamo.config()
    }

    pub fn operating_status(&self) -> OperatingStatus {
        self.dynamo.operating_status()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let connected = self
            .dynamo
            .runtime()
            .is_some_and(|runtime| runtime.is_connected());
        match (connected, self.config().allow_connection) {
            (true, true) => ConnectionStatus::Online,
            (true, false) => ConnectionStatus::Disconnecting,
            (false, _) => ConnectionStatus::Offline,
        }
    }

    pub fn network_metrics(&self) -> NetworkMetrics {
        self.dynamo
            .runtime()
            .map(|runtime| runtime.metrics())
            .unwrap_or_default()
    }

    /// Request disconnection. Repeated calls are no-ops.
    pub fn disconnect(&self) {
        self.dynamo
            .update_config(|config| config.allow_connection = false);
    }

    /// Observe runtime state changes.
    pub fn subscribe_state(&self) -> Option<watch::Receiver<u64>> {
        self.dynamo.subscribe_state()
    }

    pub async fn shutdown(&self) -> ShutdownResult {
        self.dynamo.shutdown().await
    }
}

impl fmt::Debug for FirewallConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirewallConnection")
            .field("id", &self.id())
            .field("remote_address", &self.remote_address)
            .field("status", &self.connection_status())
            .finish()
    }
}

#[async_trait]
impl Shutdownable for FirewallConnection {
    async fn shutdown(&self) -> ShutdownResult {
        FirewallConnection::shutdown(self).await
    }
}

/// Run the protocol on the socket until it closes or is aborted.
async fn serve(
    stream: TcpStream,
    controller: Arc<dyn PortController>,
    runtime: Arc<ConnectionRuntime>,
    port: Weak<PortRuntime>,
    mut link: ConnectionLink,
) {
    let observers: Vec<Arc<dyn TrafficObserver>> = vec![runtime.clone(), Arc::new(port)];
    let stream = MeteredStream::new(stream, observers);

    tokio::select! {
        result = controller.serve(stream) => {
            if let Err(err) = result {
                debug!(remote = %runtime.remote_address(), error = %err, "Connection ended with an error");
            }
        }
        _ = link.aborted() => {}
    }

    runtime.notify_disconnected();
    link.finish();
}

/// Remove the connection from its port once the socket is gone.
async fn watch_disconnect(id: Identifier, runtime: Weak<ConnectionRuntime>, port: Weak<PortRuntime>) {
    let Some(mut changes) = runtime.upgrade().map(|runtime| runtime.core().subscribe()) else {
        return;
    };
    loop {
        let connected = runtime
            .upgrade()
            .is_some_and(|runtime| runtime.is_connected());
        if !connected || changes.changed().await.is_err() {
            break;
        }
    }
    if let Some(port) = port.upgrade() {
        port.connection_was_disconnected(id);
    }
}
