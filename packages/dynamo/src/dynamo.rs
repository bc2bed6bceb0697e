//! The dynamo: a configurable model paired with a background runtime.
//!
//! The model side owns the identifier, the configuration and the operating
//! status. Configuration and pause changes cross to the runtime as typed
//! commands over a channel; a driver task applies them one at a time.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::atomic::Atomic;
use crate::capability::Shutdownable;
use crate::error::{IngressError, ShutdownResult};
use crate::identifier::Identifier;
use crate::notify::ChangeNotifier;
use crate::runtime::{Runtime, RuntimeExt};
use crate::status::OperatingStatus;

/// Callback invoked on the model side after every configuration change.
pub type ConfigObserver<C> = Arc<dyn Fn(Identifier, &C) + Send + Sync>;

enum Command<C> {
    Apply(C),
    Shutdown,
}

struct DynamoData<C> {
    config: C,
    status: OperatingStatus,
}

/// A processing unit pairing a configuration with a background runtime.
pub struct Dynamo<R: Runtime> {
    id: Identifier,
    label: String,
    data: Atomic<DynamoData<R::Config>>,
    runtime: Atomic<Option<Arc<R>>>,
    commands: Atomic<Option<mpsc::UnboundedSender<Command<R::Config>>>>,
    engine_paused: watch::Receiver<bool>,
    config_changes: ChangeNotifier,
    config_observer: Atomic<Option<ConfigObserver<R::Config>>>,
}

impl<R: Runtime> Dynamo<R> {
    /// Pair `runtime` with a new model and start its driver task.
    ///
    /// The runtime's current configuration becomes the dynamo's initial
    /// configuration and is applied once. Must be called from within a tokio
    /// runtime.
    pub fn new(
        id: Identifier,
        label: impl Into<String>,
        runtime: Arc<R>,
        engine_paused: watch::Receiver<bool>,
    ) -> Self {
        let label = label.into();
        let config = runtime.core().config();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(
            Arc::clone(&runtime),
            rx,
            engine_paused.clone(),
            label.clone(),
        ));
        let _ = tx.send(Command::Apply(config.clone()));

        Self {
            id,
            label,
            data: Atomic::new(DynamoData {
                config,
                status: OperatingStatus::Running,
            }),
            runtime: Atomic::new(Some(runtime)),
            commands: Atomic::new(Some(tx)),
            engine_paused,
            config_changes: ChangeNotifier::new(),
            config_observer: Atomic::new(None),
        }
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    /// Human-readable name used in log lines.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> R::Config {
        self.data.with_lock(|data| data.config.clone())
    }

    /// Replace the configuration.
    ///
    /// Returns `false` without notifying anyone when `config` equals the
    /// current configuration.
    pub fn apply_config(&self, config: R::Config) -> bool {
        let changed = self.data.with_lock(|data| {
            if data.config == config {
                false
            } else {
                data.config = config.clone();
                true
            }
        });
        if !changed {
            return false;
        }

        self.config_changes.notify();
        if let Some(observer) = self.config_observer.get() {
            observer(self.id, &config);
        }
        self.commands.with_lock(|commands| {
            if let Some(commands) = commands {
                let _ = commands.send(Command::Apply(config));
            }
        });
        true
    }

    /// Edit a copy of the configuration and apply it.
    pub fn update_config(&self, edit: impl FnOnce(&mut R::Config)) -> bool {
        let mut config = self.config();
        edit(&mut config);
        self.apply_config(config)
    }

    /// Register the callback run after every configuration change.
    pub fn set_config_observer(&self, observer: ConfigObserver<R::Config>) {
        self.config_observer.set(Some(observer));
    }

    /// The stored status, shown as `Paused` while the engine is paused.
    pub fn operating_status(&self) -> OperatingStatus {
        let stored = self.data.with_lock(|data| data.status);
        stored.displayed(self.is_engine_paused())
    }

    pub fn is_engine_paused(&self) -> bool {
        *self.engine_paused.borrow()
    }

    /// The runtime, until the dynamo is shut down.
    pub fn runtime(&self) -> Option<Arc<R>> {
        self.runtime.get()
    }

    /// Observe configuration changes.
    pub fn subscribe_config(&self) -> watch::Receiver<u64> {
        self.config_changes.subscribe()
    }

    /// Observe runtime state changes, if the runtime is still attached.
    pub fn subscribe_state(&self) -> Option<watch::Receiver<u64>> {
        self.runtime
            .with_lock(|runtime| runtime.as_ref().map(|runtime| runtime.core().subscribe()))
    }

    /// Shut the runtime down. Only the first call does any work.
    pub async fn shutdown(&self) -> ShutdownResult {
        let Some(runtime) = self.runtime.replace(None) else {
            return Err(IngressError::NotProcessing);
        };
        let commands = self.commands.replace(None);
        self.set_status(OperatingStatus::ShuttingDown);
        debug!(dynamo = %self.id.brief_id(), "Beginning shutdown of {}", self.label);

        let result = runtime.shutdown().await;
        drop(commands);

        match &result {
            Ok(()) => {
                self.set_status(OperatingStatus::Offline);
                debug!(dynamo = %self.id.brief_id(), "Completed shutdown of {}", self.label);
            }
            Err(err) => {
                self.set_status(OperatingStatus::Failed);
                warn!(dynamo = %self.id.brief_id(), error = %err, "Failed to shut down {}", self.label);
            }
        }
        result
    }

    fn set_status(&self, status: OperatingStatus) {
        self.data.with_lock(|data| data.status = status);
        self.config_changes.notify();
    }
}

impl<R: Runtime> fmt::Debug for Dynamo<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dynamo")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("config", &self.config())
            .field("status", &self.operating_status())
            .finish()
    }
}

#[async_trait]
impl<R: Runtime> Shutdownable for Dynamo<R> {
    async fn shutdown(&self) -> ShutdownResult {
        Dynamo::shutdown(self).await
    }
}

impl<R: Runtime> Drop for Dynamo<R> {
    fn drop(&mut self) {
        if self.runtime.replace(None).is_none() {
            return;
        }
        let sent = self.commands.replace(None).map(|commands| commands.send(Command::Shutdown));
        if !matches!(sent, Some(Ok(()))) {
            warn!(dynamo = %self.id.brief_id(), "Dropped {} without a driver to shut it down", self.label);
        }
    }
}

/// Apply commands and pause changes to `runtime`, one at a time.
async fn drive<R: Runtime>(
    runtime: Arc<R>,
    mut commands: mpsc::UnboundedReceiver<Command<R::Config>>,
    mut engine_paused: watch::Receiver<bool>,
    label: String,
) {
    let is_paused = *engine_paused.borrow_and_update();
    runtime.pause(is_paused).await;

    let mut pause_open = true;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Apply(config)) => runtime.apply(config).await,
                Some(Command::Shutdown) => {
                    debug!("Beginning shutdown of orphaned {}", label);
                    if let Err(err) = runtime.shutdown().await {
                        warn!(error = %err, "Failed to shut down orphaned {}", label);
                    }
                    break;
                }
                None => break,
            },
            changed = engine_paused.changed(), if pause_open => {
                if changed.is_err() {
                    pause_open = false;
                    continue;
                }
                let is_paused = *engine_paused.borrow_and_update();
                runtime.pause(is_paused).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeCore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Config {
        name: String,
    }

    struct RecordingRuntime {
        core: RuntimeCore<Config, Vec<String>>,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl Runtime for RecordingRuntime {
        type Config = Config;
        type State = Vec<String>;

        fn core(&self) -> &RuntimeCore<Config, Vec<String>> {
            &self.core
        }

        async fn configuration_changed(&self) {
            let name = self.core.config().name;
            self.core.with_state_if_running(|seen| seen.push(name));
        }

        async fn paused_status_changed(&self) {
            let label = format!("paused={}", self.core.is_paused());
            self.core.with_state_if_running(|seen| seen.push(label));
        }

        async fn shutdown_runtime(&self, _config: Config) -> ShutdownResult {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dynamo(paused: &watch::Sender<bool>) -> (Dynamo<RecordingRuntime>, Arc<RecordingRuntime>) {
        let runtime = Arc::new(RecordingRuntime {
            core: RuntimeCore::new(
                Config {
                    name: "initial".into(),
                },
                *paused.borrow(),
                Vec::new(),
            ),
            shutdowns: AtomicUsize::new(0),
        });
        let dynamo = Dynamo::new(
            Identifier::new(),
            "recording dynamo",
            Arc::clone(&runtime),
            paused.subscribe(),
        );
        (dynamo, runtime)
    }

    async fn seen(runtime: &RecordingRuntime, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let seen = runtime.core.read_state(|seen| seen.clone()).unwrap_or_default();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("runtime never saw {count} events");
    }

    #[tokio::test]
    async fn dynamo_equal_config_is_noop() {
        let (paused, _) = watch::channel(false);
        let (dynamo, runtime) = dynamo(&paused);
        let mut changes = dynamo.subscribe_config();

        assert!(!dynamo.apply_config(Config {
            name: "initial".into()
        }));
        assert!(!changes.has_changed().unwrap());

        assert!(dynamo.update_config(|config| config.name = "renamed".into()));
        assert!(changes.has_changed().unwrap());
        assert_eq!(seen(&runtime, 2).await, vec!["initial", "renamed"]);
    }

    #[tokio::test]
    async fn dynamo_config_observer_runs() {
        let (paused, _) = watch::channel(false);
        let (dynamo, _runtime) = dynamo(&paused);
        let observed = Arc::new(Atomic::new(Vec::new()));
        let sink = Arc::clone(&observed);
        dynamo.set_config_observer(Arc::new(move |_, config: &Config| {
            sink.with_lock(|names| names.push(config.name.clone()));
        }));

        dynamo.update_config(|config| config.name = "one".into());
        dynamo.update_config(|config| config.name = "one".into());
        dynamo.update_config(|config| config.name = "two".into());

        assert_eq!(observed.get(), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn dynamo_pause_propagates_to_runtime() {
        let (paused, _) = watch::channel(false);
        let (dynamo, runtime) = dynamo(&paused);
        assert_eq!(dynamo.operating_status(), OperatingStatus::Running);
        seen(&runtime, 1).await;

        paused.send(true).unwrap();
        assert_eq!(seen(&runtime, 2).await, vec!["initial", "paused=true"]);
        assert_eq!(dynamo.operating_status(), OperatingStatus::Paused);
    }

    #[tokio::test]
    async fn dynamo_shutdown_is_terminal() {
        let (paused, _) = watch::channel(false);
        let (dynamo, runtime) = dynamo(&paused);

        assert_eq!(dynamo.shutdown().await, Ok(()));
        assert_eq!(dynamo.operating_status(), OperatingStatus::Offline);
        assert!(dynamo.runtime().is_none());
        assert!(!runtime.core().is_running());

        assert_eq!(dynamo.shutdown().await, Err(IngressError::NotProcessing));
        assert_eq!(runtime.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dynamo_drop_shuts_runtime_down() {
        let (paused, _) = watch::channel(false);
        let (dynamo, runtime) = dynamo(&paused);
        drop(dynamo);

        for _ in 0..200 {
            if !runtime.core().is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!runtime.core().is_running());
        assert_eq!(runtime.shutdowns.load(Ordering::SeqCst), 1);
    }
}
