//! The state-propagation path shared by the governor, the refresher, and the
//! bridge: record a snapshot, reset the refresh timer if it came from real
//! traffic, fan the result out to listeners, and report to telemetry.

use crate::bucket::{BucketState, BucketStore};
use crate::listener::{ListenerRegistry, PublishReport};
use crate::refresher::Activity;
use crate::snapshot::Snapshot;
use crate::telemetry::{GovernorEvent, ListenerEvent, SinkHandle, SnapshotEvent, UpdateSource};
use std::sync::Arc;

/// Store, listeners, and telemetry bundled together. Clones share everything.
#[derive(Debug, Clone)]
pub struct StateHub {
    store: BucketStore,
    listeners: ListenerRegistry,
    sink: SinkHandle,
    activity: Arc<Activity>,
}

impl StateHub {
    pub fn new(store: BucketStore, listeners: ListenerRegistry) -> Self {
        Self { store, listeners, sink: SinkHandle::default(), activity: Arc::default() }
    }

    pub fn with_sink(mut self, sink: SinkHandle) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn sink(&self) -> &SinkHandle {
        &self.sink
    }

    /// Organic-update bookkeeping the refresher consults.
    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    /// Apply `snapshot` to `bucket` and propagate the resulting state.
    ///
    /// Snapshots from anywhere but the refresher count as real traffic and
    /// restart the refresh timer. Returns `None` when the snapshot was empty.
    pub fn apply(&self, bucket: &str, snapshot: Snapshot, source: UpdateSource) -> Option<BucketState> {
        self.apply_observed(bucket, snapshot, source, None)
    }

    /// [`apply`](Self::apply) with the sender's observation time, see
    /// [`BucketStore::apply_observed`].
    pub fn apply_observed(
        &self,
        bucket: &str,
        snapshot: Snapshot,
        source: UpdateSource,
        observed_at: Option<u64>,
    ) -> Option<BucketState> {
        let state = self.store.apply_observed(bucket, snapshot, observed_at)?;
        if source != UpdateSource::Refresh {
            self.activity.touch(self.store.clock().now_millis());
        }
        self.sink.emit_detached(GovernorEvent::Snapshot(SnapshotEvent::Applied {
            bucket: bucket.to_string(),
            source,
            limit: state.limit,
            remaining: state.remaining,
        }));
        self.publish(bucket, &state);
        Some(state)
    }

    /// Fan `state` out to listeners, reporting failures to telemetry.
    ///
    /// Runs after the store lock is released. Two concurrent updates to one
    /// bucket may therefore reach listeners, and bridge readers, in the
    /// opposite order from the store; a listener can hold the older state
    /// until the next update. Read [`BucketStore::get`] when the latest value
    /// matters.
    pub fn publish(&self, bucket: &str, state: &BucketState) -> PublishReport {
        let report = self.listeners.publish(bucket, state);
        for (id, error) in &report.failures {
            self.sink.emit_detached(GovernorEvent::Listener(ListenerEvent::Failed {
                bucket: bucket.to_string(),
                subscription: id.to_string(),
                error: error.clone(),
            }));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn apply_publishes_and_tracks_real_traffic() {
        let clock = ManualClock::at_secs(50);
        let hub = StateHub::new(BucketStore::with_clock(clock), ListenerRegistry::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        hub.listeners().subscribe(move |_, state| {
            assert_eq!(state.remaining, Some(42));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        hub.apply("core", Snapshot::new(60, 42, 100), UpdateSource::Traffic);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(hub.activity().last_real_update(), Some(50_000));
    }

    #[test]
    fn out_of_order_delivery_is_superseded_by_next_update() {
        let hub = StateHub::new(BucketStore::with_clock(ManualClock::at_secs(1)), ListenerRegistry::new());
        let last = Arc::new(std::sync::Mutex::new(None));
        let seen = last.clone();
        hub.listeners().subscribe(move |_, state| {
            *seen.lock().unwrap() = Some(state.clone());
            Ok(())
        });

        let older = hub.apply("core", Snapshot::new(60, 50, 100), UpdateSource::Traffic).unwrap();
        hub.apply("core", Snapshot::new(60, 48, 100), UpdateSource::Traffic);
        hub.publish("core", &older);
        assert_eq!(last.lock().unwrap().as_ref().and_then(|s| s.remaining), Some(50));

        hub.apply("core", Snapshot::new(60, 47, 100), UpdateSource::Traffic);
        assert_eq!(*last.lock().unwrap(), hub.store().get("core"));
    }

    #[test]
    fn refresh_updates_do_not_count_as_traffic() {
        let hub = StateHub::new(BucketStore::with_clock(ManualClock::at_secs(1)), ListenerRegistry::new());
        hub.apply("core", Snapshot::new(60, 59, 100), UpdateSource::Refresh);
        assert_eq!(hub.activity().last_real_update(), None);
        assert_eq!(hub.store().get("core").unwrap().remaining, Some(59));
    }

    #[test]
    fn empty_snapshot_is_not_published() {
        let hub = StateHub::new(BucketStore::new(), ListenerRegistry::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        hub.listeners().subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(hub.apply("core", Snapshot::default(), UpdateSource::Traffic).is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
