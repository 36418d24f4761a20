//! Live-swappable values shared between a handle and its background task.
//!
//! The refresher keeps its schedule in a [`DynamicConfig`] so that a second
//! `start` can re-arm a running task with new parameters without restarting it.
//! Default uses `ArcSwap` for lock-free reads; feature `adaptive-rwlock`
//! switches to an `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::{PoisonError, RwLock};

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Cheap reads, whole-value replacement. Clones observe the same value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(value);
        }
    }
}
