//! Capability traits implemented by the concrete dynamo kinds.

use std::fmt;

use async_trait::async_trait;

use crate::error::ShutdownResult;

/// A configuration value that can drive a runtime.
///
/// Configurations are replaced as a whole and compared by value; equal
/// replacements are dropped without notifying anyone.
pub trait Configurable: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<T> Configurable for T where T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

/// An entity with a terminal, single-shot shutdown.
#[async_trait]
pub trait Shutdownable: Send + Sync {
    /// Shut the entity down.
    ///
    /// Returns [`IngressError::NotProcessing`](crate::IngressError::NotProcessing)
    /// when the entity was already shut down.
    async fn shutdown(&self) -> ShutdownResult;
}

/// An entity that converges live state to a desired configuration.
#[async_trait]
pub trait Reconcilable: Send + Sync {
    /// Schedule a reconciliation pass. Bursts of requests collapse into one.
    fn request_reconciliation(&self);

    /// Converge now, looping until the desired state stops changing.
    async fn reconcile(&self);
}
