//! Background side of a port: the reconciliation loop.
//!
//! Every configuration, pause or firewall-enablement change wakes the port's
//! worker task. The worker waits for a quiet period, so bursts of edits
//! collapse into one rebuild, then converges the listener:
//!
//! ```text
//! loop {
//!     desired = snapshot(firewall enabled, config, paused)
//!     if desired == applied { break }
//!     stop the listener if one is bound, then drain its connections
//!     bind a new listener if desired.is_online()
//!     applied = desired
//! }
//! ```
//!
//! The desired snapshot is re-read on every iteration, so a change that lands
//! while a bind or close is in flight is picked up by the next pass.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use ingress_dynamo::{
    Atomic, Identifier, IngressError, Reconcilable, Result, Runtime, RuntimeCore, ShutdownResult,
    ShutdownResultExt,
};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::FirewallConnection;
use crate::context::FirewallContext;
use crate::controller::PortController;
use crate::network::{NetworkMetrics, TrafficObserver};
use crate::port::{PortConfig, PortConfigSnapshot, PortMetrics, PortStatus};

/// A bound listener and its accept loop.
struct ServerHandle {
    local_addr: Option<SocketAddr>,
    close: oneshot::Sender<()>,
    accept_loop: JoinHandle<()>,
}

/// Mutable state of a port runtime.
#[derive(Default)]
pub struct PortState {
    rebuilding: bool,
    reconfiguring: bool,
    status: PortStatus,
    metrics: PortMetrics,
    connections: Vec<Arc<FirewallConnection>>,
    applied: Option<PortConfigSnapshot>,
    server: Option<ServerHandle>,
}

impl PortState {
    fn set_status(&mut self, status: PortStatus) {
        self.reconfiguring = false;
        self.status = status;
    }
}

/// Runtime of one listener.
pub struct PortRuntime {
    core: RuntimeCore<PortConfig, PortState>,
    this: Weak<PortRuntime>,
    context: Arc<FirewallContext>,
    controller: Arc<dyn PortController>,
    engine_paused: watch::Receiver<bool>,
    firewall_enabled: watch::Receiver<bool>,
    wake: Arc<Notify>,
    stop: watch::Sender<bool>,
    worker: Atomic<Option<JoinHandle<()>>>,
}

impl PortRuntime {
    /// Create the runtime and start its reconciliation worker on the pool.
    pub fn new(
        config: PortConfig,
        context: Arc<FirewallContext>,
        controller: Arc<dyn PortController>,
        engine_paused: watch::Receiver<bool>,
        firewall_enabled: watch::Receiver<bool>,
    ) -> Result<Arc<Self>> {
        let is_paused = *engine_paused.borrow();
        let (stop, stop_rx) = watch::channel(false);
        let runtime = Arc::new_cyclic(|this| Self {
            core: RuntimeCore::new(config, is_paused, PortState::default()),
            this: this.clone(),
            context,
            controller,
            engine_paused,
            firewall_enabled,
            wake: Arc::new(Notify::new()),
            stop,
            worker: Atomic::new(None),
        });

        let settings = runtime.context.settings();
        let worker = runtime.context.spawn(reconcile_worker(
            Arc::downgrade(&runtime),
            Arc::clone(&runtime.wake),
            runtime.firewall_enabled.clone(),
            stop_rx,
            settings.reconfiguration_delay(),
        ))?;
        runtime.worker.set(Some(worker));
        Ok(runtime)
    }

    /// Current status; `Reconfiguring` while a rebuild is replacing the
    /// listener.
    pub fn port_status(&self) -> PortStatus {
        self.core
            .read_state(|state| {
                if state.reconfiguring {
                    PortStatus::Reconfiguring
                } else {
                    state.status.clone()
                }
            })
            .unwrap_or(PortStatus::Offline)
    }

    pub fn port_metrics(&self) -> PortMetrics {
        self.core
            .read_state(|state| state.metrics)
            .unwrap_or_default()
    }

    pub fn connections(&self) -> Vec<Arc<FirewallConnection>> {
        self.core
            .read_state(|state| state.connections.clone())
            .unwrap_or_default()
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.core
            .read_state(|state| state.server.as_ref().and_then(|server| server.local_addr))
            .flatten()
    }

    /// The listener's target as of now.
    pub fn desired_snapshot(&self) -> PortConfigSnapshot {
        PortConfigSnapshot {
            is_firewall_enabled: *self.firewall_enabled.borrow(),
            config: self.core.config(),
            is_paused: self.core.is_paused(),
        }
    }

    /// Register a freshly accepted connection. Duplicates are ignored.
    pub fn connection_was_created(&self, connection: Arc<FirewallConnection>) {
        let registered = self.core.with_state_if_running(|state| {
            if !state.connections.iter().any(|known| known.id() == connection.id()) {
                state.connections.push(Arc::clone(&connection));
            }
        });
        if registered.is_none() {
            tokio::spawn(async move {
                let _ = connection.shutdown().await;
            });
        }
    }

    /// Forget a connection whose socket is gone and shut it down.
    pub fn connection_was_disconnected(&self, id: Identifier) {
        let removed = self
            .core
            .with_state_if_running(|state| {
                let index = state.connections.iter().position(|known| known.id() == id)?;
                Some(state.connections.remove(index))
            })
            .flatten();

        if let Some(connection) = removed {
            debug!(connection = %id.brief_id(), "Connection disconnected");
            tokio::spawn(async move {
                if let Err(err) = connection.shutdown().await {
                    if err != IngressError::NotProcessing {
                        warn!(connection = %id.brief_id(), error = %err, "Failed to shut down connection");
                    }
                }
            });
        }
    }

    fn accept_connection(&self, stream: tokio::net::TcpStream, remote: SocketAddr) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if !self.core.is_running() {
            return;
        }
        let connection = FirewallConnection::accept(
            stream,
            remote,
            &this,
            Arc::clone(&self.controller),
            self.engine_paused.clone(),
        );
        self.connection_was_created(connection);
    }

    async fn rebuild_for_new_configuration(&self) {
        let began = self.core.with_state_if_running(|state| {
            if state.rebuilding {
                false
            } else {
                state.rebuilding = true;
                true
            }
        });
        if began != Some(true) {
            return;
        }

        loop {
            let desired = self.desired_snapshot();
            let Some(applied) = self.core.read_state(|state| state.applied.clone()) else {
                return;
            };
            if applied.as_ref() == Some(&desired) {
                break;
            }

            let was_online = applied.as_ref().is_some_and(PortConfigSnapshot::is_online);
            self.log_rebuild_start(was_online, &desired);
            self.core.with_state_if_running(|state| {
                state.reconfiguring = was_online || desired.is_online();
            });

            self.stop_server().await;
            if desired.is_online() {
                self.start_server(&desired.config).await;
            }

            self.core.with_state_if_running(|state| {
                state.applied = Some(desired.clone());
                state.reconfiguring = false;
                state.metrics.rebuilds += 1;
            });
            self.log_rebuild_complete(&desired);
        }

        self.core
            .with_state_if_running(|state| state.rebuilding = false);
    }

    async fn start_server(&self, config: &PortConfig) {
        let Some(value) = config.value else {
            return;
        };
        self.core
            .with_state_if_running(|state| state.set_status(PortStatus::Starting));

        let reuse_addr = config.reuse_addr;
        let bound = self
            .context
            .bootstrap_server(value, u32::from(config.client_backlog), move |socket| {
                socket.set_reuseaddr(reuse_addr)
            })
            .await;

        let server = bound.and_then(|listener| self.spawn_accept_loop(listener));
        self.core.with_state_if_running(|state| match server {
            Ok(server) => {
                state.server = Some(server);
                state.set_status(PortStatus::Online);
            }
            Err(err) => state.set_status(PortStatus::Error(err)),
        });
    }

    fn spawn_accept_loop(&self, listener: TcpListener) -> Result<ServerHandle> {
        let local_addr = listener.local_addr().ok();
        let (close, close_rx) = oneshot::channel();
        let accept_loop = self.context.spawn(accept_loop(
            self.this.clone(),
            listener,
            close_rx,
            self.context.settings().accept_backoff(),
        ))?;
        Ok(ServerHandle {
            local_addr,
            close,
            accept_loop,
        })
    }

    /// Close the listener, then drain every connection it accepted.
    async fn stop_server(&self) {
        let server = self
            .core
            .with_state_if_running(|state| {
                let server = state.server.take()?;
                state.set_status(PortStatus::Stopping);
                Some(server)
            })
            .flatten();
        let Some(server) = server else {
            self.core.with_state_if_running(|state| {
                if !matches!(state.status, PortStatus::Offline) {
                    state.set_status(PortStatus::Offline);
                }
            });
            return;
        };

        // No socket is accepted once the accept loop has returned.
        let _ = server.close.send(());
        if let Err(err) = server.accept_loop.await {
            warn!(port = %self.core.config().id.brief_id(), error = %err, "Listener did not close cleanly");
        }

        let connections = self
            .core
            .with_state_if_running(|state| std::mem::take(&mut state.connections))
            .unwrap_or_default();
        for connection in connections {
            let id = connection.id();
            if let Err(err) = connection.shutdown().await {
                if err != IngressError::NotProcessing {
                    warn!(connection = %id.brief_id(), error = %err, "Failed to shut down connection");
                }
            }
        }

        self.core
            .with_state_if_running(|state| state.set_status(PortStatus::Offline));
    }

    fn log_rebuild_start(&self, was_online: bool, desired: &PortConfigSnapshot) {
        let config = &desired.config;
        let verb = if desired.is_paused && was_online {
            "Pausing"
        } else if was_online && desired.is_online() {
            "Reconfiguring"
        } else if desired.is_online() {
            "Enabling"
        } else if was_online {
            "Disabling"
        } else {
            debug!(port = %config.id.brief_id(), "Updating offline {} port", config.protocol);
            return;
        };
        info!(port = %config.id.brief_id(), "{verb} {} port", config.protocol);
    }

    fn log_rebuild_complete(&self, desired: &PortConfigSnapshot) {
        let config = &desired.config;
        match self.port_status() {
            PortStatus::Online => info!(
                port = %config.id.brief_id(),
                "{} port is online as {}",
                config.protocol,
                config.target_url().unwrap_or_default()
            ),
            PortStatus::Error(err) => warn!(
                port = %config.id.brief_id(),
                error = %err,
                "{} port failed to come online",
                config.protocol
            ),
            status => debug!(port = %config.id.brief_id(), "{} port is {status}", config.protocol),
        }
    }
}

impl TrafficObserver for PortRuntime {
    fn notify_network_traffic_metrics(&self, delta: NetworkMetrics) {
        self.core
            .with_state_if_running(|state| state.metrics.network_metrics += delta);
    }
}

#[async_trait]
impl Reconcilable for PortRuntime {
    fn request_reconciliation(&self) {
        self.wake.notify_one();
    }

    async fn reconcile(&self) {
        self.rebuild_for_new_configuration().await;
    }
}

#[async_trait]
impl Runtime for PortRuntime {
    type Config = PortConfig;
    type State = PortState;

    fn core(&self) -> &RuntimeCore<PortConfig, PortState> {
        &self.core
    }

    async fn configuration_changed(&self) {
        self.request_reconciliation();
    }

    async fn paused_status_changed(&self) {
        self.request_reconciliation();
    }

    async fn shutdown_runtime(&self, config: PortConfig) -> ShutdownResult {
        let _ = self.stop.send(true);
        if let Some(worker) = self.worker.replace(None) {
            let _ = worker.await;
        }

        let connections = self
            .core
            .with_state_if_running(|state| std::mem::take(&mut state.connections))
            .unwrap_or_default();
        let mut result: ShutdownResult = Ok(());
        for connection in connections {
            match connection.shutdown().await {
                Err(IngressError::NotProcessing) => {}
                other => result.append(other),
            }
        }

        self.stop_server().await;
        debug!(port = %config.id.brief_id(), "{} port shut down", config.protocol);
        result
    }
}

/// Debounce wake-ups, then reconcile. Exits when stopped or orphaned.
async fn reconcile_worker(
    runtime: Weak<PortRuntime>,
    wake: Arc<Notify>,
    mut firewall_enabled: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
    delay: Duration,
) {
    let mut firewall_open = true;
    loop {
        tokio::select! {
            _ = wake.notified() => {}
            changed = firewall_enabled.changed(), if firewall_open => {
                if changed.is_err() {
                    firewall_open = false;
                    continue;
                }
            }
            _ = stop.changed() => return,
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => break,
                _ = wake.notified() => {}
                changed = firewall_enabled.changed(), if firewall_open => {
                    if changed.is_err() {
                        firewall_open = false;
                    }
                }
                _ = stop.changed() => return,
            }
        }

        let Some(runtime) = runtime.upgrade() else {
            return;
        };
        runtime.reconcile().await;
    }
}

/// Accept sockets until told to close.
async fn accept_loop(
    port: Weak<PortRuntime>,
    listener: TcpListener,
    mut close: oneshot::Receiver<()>,
    backoff: Duration,
) {
    loop {
        tokio::select! {
            _ = &mut close => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let Some(port) = port.upgrade() else {
                        break;
                    };
                    port.accept_connection(stream, remote);
                }
                Err(err) => {
                    warn!(error = %err, "Failed to accept a connection");
                    tokio::time::sleep(backoff).await;
                }
            },
        }
    }
}
