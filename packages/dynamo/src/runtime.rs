//! Background runtimes of dynamos.
//!
//! A runtime is the background half of a dynamo. It is responsible for:
//! - Mirroring the dynamo's configuration and the engine's pause flag
//! - Guarding its typed state, which only exists while it is running
//! - Reacting to configuration and pause changes
//! - Releasing its resources exactly once on shutdown

use async_trait::async_trait;
use tokio::sync::watch;

use crate::atomic::Atomic;
use crate::capability::Configurable;
use crate::error::{IngressError, ShutdownResult};
use crate::notify::ChangeNotifier;

struct RuntimeSettings<C> {
    is_paused: bool,
    is_shutting_down: bool,
    config: C,
}

/// Shared bookkeeping embedded in every [`Runtime`].
pub struct RuntimeCore<C, S> {
    settings: Atomic<RuntimeSettings<C>>,
    state: Atomic<Option<S>>,
    changes: ChangeNotifier,
}

impl<C: Configurable, S> RuntimeCore<C, S> {
    /// Create a running core with its initial state.
    pub fn new(config: C, is_paused: bool, state: S) -> Self {
        Self {
            settings: Atomic::new(RuntimeSettings {
                is_paused,
                is_shutting_down: false,
                config,
            }),
            state: Atomic::new(Some(state)),
            changes: ChangeNotifier::new(),
        }
    }

    /// The most recently applied configuration.
    pub fn config(&self) -> C {
        self.settings.with_lock(|settings| settings.config.clone())
    }

    pub fn is_paused(&self) -> bool {
        self.settings.with_lock(|settings| settings.is_paused)
    }

    /// Whether the state still exists.
    pub fn is_running(&self) -> bool {
        self.state.with_lock(|state| state.is_some())
    }

    /// Mutate the state if the runtime is still running.
    ///
    /// Observers of [`RuntimeCore::subscribe`] are notified after every
    /// successful mutation.
    pub fn with_state_if_running<R>(&self, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        let result = self.state.with_lock(|state| state.as_mut().map(f));
        if result.is_some() {
            self.changes.notify();
        }
        result
    }

    /// Read the state if the runtime is still running, without notifying.
    pub fn read_state<R>(&self, f: impl FnOnce(&S) -> R) -> Option<R> {
        self.state.with_lock(|state| state.as_ref().map(f))
    }

    /// Observe state mutations.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn set_config(&self, config: C) {
        self.settings.with_lock(|settings| settings.config = config);
    }

    fn set_paused(&self, is_paused: bool) -> bool {
        self.settings.with_lock(|settings| {
            let changed = settings.is_paused != is_paused;
            settings.is_paused = is_paused;
            changed
        })
    }

    fn begin_shutdown(&self) -> bool {
        let running = self.is_running();
        self.settings.with_lock(|settings| {
            let first = running && !settings.is_shutting_down;
            settings.is_shutting_down = true;
            first
        })
    }

    fn clear_state(&self) {
        drop(self.state.replace(None));
        self.changes.notify();
    }
}

/// The background half of a dynamo.
///
/// Implementations embed a [`RuntimeCore`] and override the hooks they care
/// about. The hooks are invoked serially by the dynamo's driver task.
#[async_trait]
pub trait Runtime: Send + Sync + 'static {
    type Config: Configurable;
    type State: Send + 'static;

    fn core(&self) -> &RuntimeCore<Self::Config, Self::State>;

    /// A new configuration has been stored in the core.
    async fn configuration_changed(&self) {}

    /// The engine's pause flag flipped.
    async fn paused_status_changed(&self) {}

    /// Release every resource held by the state. Called at most once.
    async fn shutdown_runtime(&self, _config: Self::Config) -> ShutdownResult {
        Ok(())
    }
}

/// Entry points driving a [`Runtime`]; not meant to be overridden.
#[async_trait]
pub trait RuntimeExt: Runtime {
    /// Store `config` and run the configuration hook.
    async fn apply(&self, config: Self::Config) {
        self.core().set_config(config);
        self.configuration_changed().await;
    }

    /// Store the pause flag and run the pause hook when it changed.
    ///
    /// Repeated flags are not forwarded. A runtime created while paused
    /// reads the flag from its core instead of waiting for the hook.
    async fn pause(&self, is_paused: bool) {
        if self.core().set_paused(is_paused) {
            self.paused_status_changed().await;
        }
    }

    /// Shut the runtime down and clear its state for good.
    async fn shutdown(&self) -> ShutdownResult {
        if !self.core().begin_shutdown() {
            return Err(IngressError::NotProcessing);
        }
        let result = self.shutdown_runtime(self.core().config()).await;
        self.core().clear_state();
        result
    }
}

impl<R: Runtime + ?Sized> RuntimeExt for R {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        configured: AtomicUsize,
        paused: AtomicUsize,
        shutdown: AtomicUsize,
    }

    struct CountingRuntime {
        core: RuntimeCore<u32, Vec<u32>>,
        calls: Calls,
    }

    impl CountingRuntime {
        fn new(config: u32) -> Self {
            Self {
                core: RuntimeCore::new(config, false, Vec::new()),
                calls: Calls::default(),
            }
        }
    }

    #[async_trait]
    impl Runtime for CountingRuntime {
        type Config = u32;
        type State = Vec<u32>;

        fn core(&self) -> &RuntimeCore<u32, Vec<u32>> {
            &self.core
        }

        async fn configuration_changed(&self) {
            self.calls.configured.fetch_add(1, Ordering::SeqCst);
            let config = self.core.config();
            self.core.with_state_if_running(|seen| seen.push(config));
        }

        async fn paused_status_changed(&self) {
            self.calls.paused.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown_runtime(&self, _config: u32) -> ShutdownResult {
            self.calls.shutdown.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn runtime_apply_updates_config_and_state() {
        let runtime = CountingRuntime::new(1);
        runtime.apply(2).await;
        runtime.apply(3).await;

        assert_eq!(runtime.core().config(), 3);
        assert_eq!(runtime.core().read_state(|seen| seen.clone()), Some(vec![2, 3]));
        assert_eq!(runtime.calls.configured.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn runtime_pause_only_fires_on_change() {
        let runtime = CountingRuntime::new(1);
        runtime.pause(false).await;
        runtime.pause(true).await;
        runtime.pause(true).await;

        assert!(runtime.core().is_paused());
        assert_eq!(runtime.calls.paused.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn runtime_shutdown_clears_state_once() {
        let runtime = CountingRuntime::new(1);
        assert!(runtime.core().is_running());

        assert_eq!(runtime.shutdown().await, Ok(()));
        assert!(!runtime.core().is_running());
        assert_eq!(runtime.core().with_state_if_running(|_| ()), None);

        assert_eq!(runtime.shutdown().await, Err(IngressError::NotProcessing));
        assert_eq!(runtime.calls.shutdown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn runtime_state_mutation_notifies() {
        let runtime = CountingRuntime::new(1);
        let mut changes = runtime.core().subscribe();

        runtime.core().with_state_if_running(|seen| seen.push(9));
        changes.changed().await.unwrap();

        assert_eq!(runtime.core().read_state(|seen| seen.len()), Some(1));
    }
}
