//! One-way change notification.
//!
//! A [`ChangeNotifier`] publishes a generation counter over a tokio `watch`
//! channel. Observers wake on every bump and re-read whatever state they are
//! interested in; the counter carries no payload.

use std::sync::Arc;

use tokio::sync::watch;

/// Publishes "something changed" to any number of observers.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: Arc<watch::Sender<u64>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Bump the generation, waking every observer.
    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// The current generation.
    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Observe future changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifier_wakes_subscribers() {
        let notifier = ChangeNotifier::new();
        let mut rx = notifier.subscribe();

        notifier.notify();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
        assert_eq!(notifier.generation(), 1);
    }

    #[test]
    fn notifier_without_subscribers() {
        let notifier = ChangeNotifier::new();
        notifier.notify();
        notifier.notify();
        assert_eq!(notifier.generation(), 2);
    }
}
