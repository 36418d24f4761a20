//! Fan-out of bucket updates to registered observers.
//!
//! Listeners are called synchronously, in registration order, outside the
//! registry lock. A listener that returns an error or panics is logged and
//! skipped; delivery to the remaining listeners continues and the triggering
//! call never sees the failure.
//!
//! Delivery order across concurrent publishers is not serialized with the
//! store: each update carries a full state, and the next update supersedes it.
//!
//! The registry holds listeners by handle, not by ownership of the observer:
//! callers keep the [`SubscriptionId`] and unsubscribe explicitly.

use crate::bucket::BucketState;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Error a listener may report; it is logged and otherwise ignored.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Observer of bucket updates.
pub trait Listener: Send + Sync {
    fn on_update(&self, bucket: &str, state: &BucketState) -> Result<(), ListenerError>;
}

struct FnListener<F>(F);

impl<F> Listener for FnListener<F>
where
    F: Fn(&str, &BucketState) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_update(&self, bucket: &str, state: &BucketState) -> Result<(), ListenerError> {
        (self.0)(bucket, state)
    }
}

/// Handle returned by [`ListenerRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What happened during one [`ListenerRegistry::publish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Listeners that failed, with the error or panic message.
    pub failures: Vec<(SubscriptionId, String)>,
}

type Entries = Vec<(SubscriptionId, Arc<dyn Listener>)>;

/// Registry of update listeners. Clones share the same registrations.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    entries: Arc<Mutex<Entries>>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry").field("listeners", &self.len()).finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &BucketState) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.subscribe_listener(Arc::new(FnListener(callback)))
    }

    /// Register a shared [`Listener`] implementation.
    pub fn subscribe_listener(&self, listener: Arc<dyn Listener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, listener));
        tracing::debug!(target: "quotakeeper::listener", id = %id, "listener subscribed");
        id
    }

    /// Remove a registration. Returns `false` if the handle was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|(existing, _)| *existing != id);
        before != guard.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one update to every listener.
    pub fn publish(&self, bucket: &str, state: &BucketState) -> PublishReport {
        let listeners: Entries = self.lock().clone();
        let mut report = PublishReport::default();
        for (id, listener) in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_update(bucket, state)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            match failure {
                None => report.delivered += 1,
                Some(message) => {
                    tracing::warn!(
                        target: "quotakeeper::listener",
                        id = %id,
                        bucket = %bucket,
                        error = %message,
                        "listener failed; continuing"
                    );
                    report.failures.push((id, message));
                }
            }
        }
        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

/// A bucket update as carried through broadcast channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketUpdate {
    pub bucket: String,
    pub state: BucketState,
}

/// Listener that rebroadcasts updates on a bounded tokio broadcast channel.
///
/// Sending never blocks. A receiver that falls more than `capacity` updates
/// behind skips ahead and sees `RecvError::Lagged`.
#[derive(Clone, Debug)]
pub struct BroadcastListener {
    sender: tokio::sync::broadcast::Sender<BucketUpdate>,
    undelivered: Arc<AtomicU64>,
}

impl BroadcastListener {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender, undelivered: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BucketUpdate> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Updates published while nobody was receiving.
    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }
}

impl Listener for BroadcastListener {
    fn on_update(&self, bucket: &str, state: &BucketState) -> Result<(), ListenerError> {
        let update = BucketUpdate { bucket: bucket.to_string(), state: state.clone() };
        if self.sender.send(update).is_err() {
            self.undelivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
