//! The shared network context of one engine.
//!
//! Every listener and connection of an engine runs on one multi-threaded
//! tokio runtime owned by the [`FirewallContext`]. The pool is created on
//! first use and shut down exactly once.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use ingress_dynamo::{Atomic, IngressError, Result, ShutdownResult};
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::network::PortValue;
use crate::settings::FirewallSettings;

/// How long shutdown waits for in-flight tasks before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

enum Pool {
    Idle,
    Running(Runtime),
    Closed,
}

/// Owner of the worker pool shared by all ports of an engine.
pub struct FirewallContext {
    pool: Atomic<Pool>,
    settings: FirewallSettings,
}

impl FirewallContext {
    pub fn new(settings: FirewallSettings) -> Self {
        Self {
            pool: Atomic::new(Pool::Idle),
            settings,
        }
    }

    pub fn settings(&self) -> &FirewallSettings {
        &self.settings
    }

    /// Whether the pool has been created and not yet shut down.
    pub fn is_started(&self) -> bool {
        self.pool.with_lock(|pool| matches!(pool, Pool::Running(_)))
    }

    /// A handle to the pool, creating it on first use.
    ///
    /// Using the context after shutdown is a programming error and reports
    /// [`IngressError::AssertionFailed`].
    pub fn handle(&self) -> Result<Handle> {
        self.pool.with_lock(|pool| match pool {
            Pool::Running(runtime) => Ok(runtime.handle().clone()),
            Pool::Idle => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(self.settings.worker_threads.max(1))
                    .thread_name("ingress-net")
                    .enable_all()
                    .build()?;
                let handle = runtime.handle().clone();
                info!(
                    workers = self.settings.worker_threads.max(1),
                    "Started firewall network context"
                );
                *pool = Pool::Running(runtime);
                Ok(handle)
            }
            Pool::Closed => {
                error!("Detected late usage of the firewall context after shutdown");
                Err(IngressError::AssertionFailed)
            }
        })
    }

    /// Run `future` on the pool.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Ok(self.handle()?.spawn(future))
    }

    /// Bind a listener on `port` of the configured host.
    ///
    /// `configure` runs on the socket before it is bound. The bind itself
    /// happens on the pool so the listener is driven by its reactor.
    pub async fn bootstrap_server<C>(
        &self,
        port: PortValue,
        backlog: u32,
        configure: C,
    ) -> Result<TcpListener>
    where
        C: FnOnce(&TcpSocket) -> io::Result<()> + Send + 'static,
    {
        let addr = SocketAddr::new(self.settings.bind_host, port);
        let task = self.spawn(async move {
            let socket = match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4()?,
                SocketAddr::V6(_) => TcpSocket::new_v6()?,
            };
            configure(&socket)?;
            socket.bind(addr)?;
            Ok::<_, io::Error>(socket.listen(backlog)?)
        })?;

        match task.await {
            Ok(listener) => Ok(listener?),
            Err(err) => Err(IngressError::Io(err.to_string())),
        }
    }

    /// Drain and release the pool. Later calls do nothing.
    pub async fn shutdown(&self) -> ShutdownResult {
        let Pool::Running(runtime) = self.pool.replace(Pool::Closed) else {
            return Ok(());
        };

        info!("Shutting down firewall network context");
        let (done_tx, done_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("ingress-net-shutdown".into())
            .spawn(move || {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
                let _ = done_tx.send(());
            })?;

        done_rx.await.map_err(|_| IngressError::AssertionFailed)
    }
}

impl Drop for FirewallContext {
    fn drop(&mut self) {
        if let Pool::Running(runtime) = self.pool.replace(Pool::Closed) {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> FirewallContext {
        FirewallContext::new(FirewallSettings {
            worker_threads: 2,
            ..FirewallSettings::default()
        })
    }

    #[tokio::test]
    async fn context_created_lazily() {
        let context = context();
        assert!(!context.is_started());

        let value = context.spawn(async { 40 + 2 }).unwrap().await.unwrap();
        assert_eq!(value, 42);
        assert!(context.is_started());

        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn context_bootstrap_ephemeral_port() {
        let context = context();
        let listener = context
            .bootstrap_server(0, 4, |socket| socket.set_reuseaddr(true))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        drop(listener);
        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn context_bootstrap_reports_bind_error() {
        let context = context();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = context.bootstrap_server(port, 4, |_| Ok(())).await;
        assert!(matches!(result, Err(IngressError::Io(_))));

        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn context_shutdown_once() {
        let context = context();
        context.handle().unwrap();

        assert_eq!(context.shutdown().await, Ok(()));
        assert_eq!(context.shutdown().await, Ok(()));
        assert!(!context.is_started());
        assert_eq!(context.handle().err(), Some(IngressError::AssertionFailed));
    }
}
