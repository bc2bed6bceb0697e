//! A lock-guarded value holder.
//!
//! [`Atomic`] wraps a value in a mutex and exposes small, closure-scoped
//! accessors so that no guard ever escapes into an `.await`.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// A value guarded by a mutual-exclusion lock.
///
/// A poisoned lock is recovered rather than propagated: the guarded values
/// are plain data whose invariants do not depend on a panicking writer
/// finishing.
#[derive(Default)]
pub struct Atomic<T> {
    value: Mutex<T>,
}

impl<T> Atomic<T> {
    /// Wrap `value`.
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` with exclusive access to the value.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }

    /// Overwrite the value.
    pub fn set(&self, value: T) {
        *self.lock() = value;
    }

    /// Store `value` and return the previous one.
    pub fn replace(&self, value: T) -> T {
        std::mem::replace(&mut *self.lock(), value)
    }

    /// Consume the holder and return the value.
    pub fn into_inner(self) -> T {
        self.value
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Atomic<T> {
    /// A copy of the current value.
    pub fn get(&self) -> T {
        self.lock().clone()
    }
}

impl<T: Default> Atomic<T> {
    /// Take the value, leaving the default in its place.
    pub fn take(&self) -> T {
        std::mem::take(&mut *self.lock())
    }
}

impl<T: fmt::Debug> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Atomic").field(&*self.lock()).finish()
    }
}
