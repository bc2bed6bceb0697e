//! Background side of an accepted connection.

use async_trait::async_trait;
use ingress_dynamo::{Runtime, RuntimeCore, ShutdownResult};
use tokio::sync::{watch, OnceCell};
use tracing::debug;

use crate::connection::ConnectionConfig;
use crate::network::{NetworkAddress, NetworkMetrics, TrafficObserver};

/// Mutable state of a connection runtime.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub metrics: NetworkMetrics,
}

/// Runtime of one accepted socket.
///
/// The socket itself is owned by the data-path task, which holds the
/// matching [`ConnectionLink`]. Aborting signals that task and waits until it
/// has dropped the socket.
pub struct ConnectionRuntime {
    core: RuntimeCore<ConnectionConfig, ConnectionState>,
    remote_address: NetworkAddress,
    abort_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    abort_outcome: OnceCell<ShutdownResult>,
}

/// The data-path end of a connection.
pub struct ConnectionLink {
    abort_rx: watch::Receiver<bool>,
    closed_tx: watch::Sender<bool>,
}

impl ConnectionLink {
    /// Resolves once an abort was requested or the runtime went away.
    pub async fn aborted(&mut self) {
        let _ = self.abort_rx.wait_for(|aborted| *aborted).await;
    }

    /// Report that the socket has been dropped.
    pub fn finish(self) {
        let _ = self.closed_tx.send(true);
    }
}

impl ConnectionRuntime {
    pub fn new(
        config: ConnectionConfig,
        is_paused: bool,
        remote_address: NetworkAddress,
    ) -> (Self, ConnectionLink) {
        let (abort_tx, abort_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let state = ConnectionState {
            is_connected: true,
            metrics: NetworkMetrics::default(),
        };
        let runtime = Self {
            core: RuntimeCore::new(config, is_paused, state),
            remote_address,
            abort_tx,
            closed_rx,
            abort_outcome: OnceCell::new(),
        };
        (runtime, ConnectionLink { abort_rx, closed_tx })
    }

    pub fn remote_address(&self) -> &NetworkAddress {
        &self.remote_address
    }

    pub fn is_connected(&self) -> bool {
        self.core
            .read_state(|state| state.is_connected)
            .unwrap_or(false)
    }

    pub fn metrics(&self) -> NetworkMetrics {
        self.core
            .read_state(|state| state.metrics)
            .unwrap_or_default()
    }

    /// Mark the socket as gone.
    pub fn notify_disconnected(&self) {
        self.core
            .with_state_if_running(|state| state.is_connected = false);
    }

    /// Hard-close the socket and wait until it is dropped.
    ///
    /// Concurrent and repeated calls share the outcome of the first one.
    pub async fn abort_connection(&self) -> ShutdownResult {
        self.abort_outcome
            .get_or_init(|| async {
                debug!(remote = %self.remote_address, "Aborting connection");
                let _ = self.abort_tx.send(true);
                let mut closed = self.closed_rx.clone();
                // An error means the data path dropped its link, which also
                // means the socket is gone.
                let _ = closed.wait_for(|closed| *closed).await;
                Ok(())
            })
            .await
            .clone()
    }
}

impl TrafficObserver for ConnectionRuntime {
    fn notify_network_traffic_metrics(&self, delta: NetworkMetrics) {
        self.core
            .with_state_if_running(|state| state.metrics += delta);
    }
}

#[async_trait]
impl Runtime for ConnectionRuntime {
    type Config = ConnectionConfig;
    type State = ConnectionState;

    fn core(&self) -> &RuntimeCore<ConnectionConfig, ConnectionState> {
        &self.core
    }

    async fn configuration_changed(&self) {
        if !self.core.config().allow_connection {
            let _ = self.abort_connection().await;
        }
    }

    async fn paused_status_changed(&self) {
        if self.core.is_paused() {
            let _ = self.abort_connection().await;
        }
    }

    async fn shutdown_runtime(&self, _config: ConnectionConfig) -> ShutdownResult {
        if self.is_connected() {
            debug!(remote = %self.remote_address, "Aborting active connection for shutdown");
            self.abort_connection().await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkProtocol;
    use ingress_dynamo::RuntimeExt;
    use std::sync::Arc;

    fn runtime() -> (Arc<ConnectionRuntime>, ConnectionLink) {
        let (runtime, link) = ConnectionRuntime::new(
            ConnectionConfig::new(NetworkProtocol::Http),
            false,
            "127.0.0.1:50000".parse::<std::net::SocketAddr>().unwrap().into(),
        );
        (Arc::new(runtime), link)
    }

    /// Stand-in for the data path: closes once aborted.
    fn spawn_data_path(runtime: &Arc<ConnectionRuntime>, mut link: ConnectionLink) {
        let runtime = Arc::clone(runtime);
        tokio::spawn(async move {
            link.aborted().await;
            runtime.notify_disconnected();
            link.finish();
        });
    }

    #[tokio::test]
    async fn traffic_metrics_accumulate() {
        let (runtime, _link) = runtime();
        runtime.notify_network_traffic_metrics(NetworkMetrics::inbound(7));
        runtime.notify_network_traffic_metrics(NetworkMetrics::outbound(3));
        assert_eq!(
            runtime.metrics(),
            NetworkMetrics {
                bytes_in: 7,
                bytes_out: 3
            }
        );
    }

    #[tokio::test]
    async fn abort_is_shared_between_callers() {
        let (runtime, link) = runtime();
        spawn_data_path(&runtime, link);

        let (first, second) = tokio::join!(runtime.abort_connection(), runtime.abort_connection());
        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert!(!runtime.is_connected());
        assert_eq!(runtime.abort_connection().await, Ok(()));
    }

    #[tokio::test]
    async fn abort_completes_when_data_path_is_gone() {
        let (runtime, link) = runtime();
        drop(link);
        assert_eq!(runtime.abort_connection().await, Ok(()));
    }

    #[tokio::test]
    async fn disallowing_aborts() {
        let (runtime, link) = runtime();
        spawn_data_path(&runtime, link);

        let mut config = runtime.core().config();
        config.allow_connection = false;
        runtime.apply(config).await;
        assert!(!runtime.is_connected());
    }

    #[tokio::test]
    async fn pausing_aborts() {
        let (runtime, link) = runtime();
        spawn_data_path(&runtime, link);

        runtime.pause(true).await;
        assert!(!runtime.is_connected());
    }

    #[tokio::test]
    async fn shutdown_aborts_live_socket() {
        let (runtime, link) = runtime();
        spawn_data_path(&runtime, link);

        assert_eq!(runtime.shutdown().await, Ok(()));
        assert!(!runtime.core().is_running());
    }
}
