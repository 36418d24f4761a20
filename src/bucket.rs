//! Latest known quota state per named bucket.
//!
//! The store is the only owner of bucket state. Every read hands out an
//! immutable [`BucketState`] copy; every write happens under one store-wide
//! mutex, so a reader never observes a half-applied snapshot.
//!
//! Buckets appear the first time a snapshot names them and are never removed.
//! [`BucketStore::list`] reports them in first-seen order.

use crate::clock::{Clock, SystemClock};
use crate::snapshot::Snapshot;
use crate::throttle::{self, Decision, ThrottleConfig, Verdict};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Immutable view of one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketState {
    /// Bucket name, unique within a store.
    pub name: String,
    /// Total quota per window; `0` means unknown.
    pub limit: u64,
    /// Units left in the window, never negative; `None` until a reading reports it.
    pub remaining: Option<u64>,
    /// Window refill instant, Unix seconds; `0` means unknown.
    pub reset_at: u64,
    /// When a snapshot or local decrement last touched the bucket, Unix millis.
    pub last_updated_at: u64,
}

impl BucketState {
    /// Whether a limit has been observed, i.e. throttling decisions are possible.
    pub fn is_known(&self) -> bool {
        self.limit > 0
    }

    /// Units consumed in the current window, when the limit is known.
    pub fn used(&self) -> Option<u64> {
        let remaining = self.remaining.filter(|_| self.is_known())?;
        Some(self.limit.saturating_sub(remaining))
    }

    /// Time left until the window refills, measured from `now_millis`.
    pub fn reset_in(&self, now_millis: u64) -> Duration {
        if self.reset_at == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.reset_at.saturating_mul(1_000).saturating_sub(now_millis))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    limit: u64,
    // May dip below zero internally; clamped on every external read.
    remaining: Option<i64>,
    reset_at: u64,
    last_updated_at: u64,
    // Set once the local refill for the current `reset_at` has happened.
    window_refilled: bool,
    // Bumped by every authoritative reading.
    generation: u64,
}

impl Entry {
    fn empty() -> Self {
        Self {
            limit: 0,
            remaining: None,
            reset_at: 0,
            last_updated_at: 0,
            window_refilled: false,
            generation: 0,
        }
    }

    fn window_elapsed(&self, now_millis: u64) -> bool {
        self.reset_at != 0 && now_millis >= self.reset_at.saturating_mul(1_000)
    }

    fn refill(&mut self) {
        self.remaining = Some(i64::try_from(self.limit).unwrap_or(i64::MAX));
        self.window_refilled = true;
    }

    fn view(&self, name: &str, now_millis: u64) -> BucketState {
        let remaining = if self.limit > 0 && self.window_elapsed(now_millis) && !self.window_refilled
        {
            Some(self.limit)
        } else {
            self.remaining.map(clamp)
        };
        BucketState {
            name: name.to_string(),
            limit: self.limit,
            remaining,
            reset_at: self.reset_at,
            last_updated_at: self.last_updated_at,
        }
    }
}

fn clamp(remaining: i64) -> u64 {
    u64::try_from(remaining.max(0)).unwrap_or(0)
}

#[derive(Debug, Default)]
struct Buckets {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
}

impl Buckets {
    fn entry_mut(&mut self, name: &str) -> &mut Entry {
        if !self.entries.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.entries.entry(name.to_string()).or_insert_with(Entry::empty)
    }
}

/// Result of [`BucketStore::reserve`]: the throttle decision plus the bucket
/// state right after it was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub decision: Decision,
    /// `None` when the bucket has never been observed.
    pub state: Option<BucketState>,
    pub(crate) reading: u64,
}

/// Thread-safe, insertion-ordered bucket store. Clones share state.
#[derive(Debug, Clone)]
pub struct BucketStore {
    inner: Arc<Mutex<Buckets>>,
    clock: Arc<dyn Clock>,
}

impl Default for BucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Use a custom clock for staleness checks and timestamps.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self::with_shared_clock(Arc::new(clock))
    }

    pub(crate) fn with_shared_clock(clock: Arc<dyn Clock>) -> Self {
        Self { inner: Arc::default(), clock }
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        // Entries are only ever replaced by whole values, so a poisoned guard is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current view of `name`, or `None` if the bucket was never observed.
    pub fn get(&self, name: &str) -> Option<BucketState> {
        let now = self.clock.now_millis();
        let guard = self.lock();
        guard.entries.get(name).map(|entry| entry.view(name, now))
    }

    /// All buckets in first-seen order.
    pub fn list(&self) -> Vec<BucketState> {
        let now = self.clock.now_millis();
        let guard = self.lock();
        guard
            .order
            .iter()
            .filter_map(|name| guard.entries.get(name).map(|entry| entry.view(name, now)))
            .collect()
    }

    /// Number of buckets seen so far.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Authoritative overwrite of the fields present in `snapshot`.
    ///
    /// Always wins over optimistic local accounting, even when it reports fewer
    /// units than the local estimate. Returns the resulting state, or `None` when
    /// the snapshot carried no fields (nothing is recorded in that case).
    pub fn apply_snapshot(&self, name: &str, snapshot: Snapshot) -> Option<BucketState> {
        self.apply_observed(name, snapshot, None)
    }

    /// Like [`apply_snapshot`](Self::apply_snapshot), stamping `last_updated_at`
    /// with `observed_at` (Unix millis) when given. Times ahead of the local
    /// clock are capped at now.
    pub fn apply_observed(
        &self,
        name: &str,
        snapshot: Snapshot,
        observed_at: Option<u64>,
    ) -> Option<BucketState> {
        if snapshot.is_empty() {
            return None;
        }
        let now = self.clock.now_millis();
        let stamp = observed_at.map_or(now, |at| at.min(now));
        let mut guard = self.lock();
        let entry = guard.entry_mut(name);
        if let Some(limit) = snapshot.limit {
            entry.limit = limit;
        }
        if let Some(remaining) = snapshot.remaining {
            entry.remaining = Some(remaining.max(0));
            entry.window_refilled = false;
        }
        if let Some(reset_at) = snapshot.reset_at {
            if reset_at != entry.reset_at {
                entry.window_refilled = false;
            }
            entry.reset_at = reset_at;
        }
        entry.last_updated_at = stamp;
        entry.generation += 1;
        let state = entry.view(name, now);
        drop(guard);

        tracing::debug!(
            target: "quotakeeper::bucket",
            bucket = %name,
            limit = state.limit,
            remaining = ?state.remaining,
            reset_at = state.reset_at,
            "applied snapshot"
        );
        Some(state)
    }

    /// Take a soft-floor decision for `name` and, when it allows proceeding,
    /// record the optimistic decrement in the same critical section.
    pub fn reserve(&self, name: &str, config: &ThrottleConfig) -> Reservation {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        let Some(entry) = guard.entries.get_mut(name) else {
            return Reservation {
                decision: Decision::Proceed { remaining: None },
                state: None,
                reading: 0,
            };
        };

        if entry.limit > 0 && entry.window_elapsed(now) && !entry.window_refilled {
            entry.refill();
        }

        let decision = match throttle::decide(entry.limit, entry.remaining, entry.reset_at, now, config)
        {
            Verdict::Unknown => Decision::Proceed { remaining: None },
            Verdict::Consume => {
                let remaining = entry.remaining.map(|r| r - 1);
                entry.remaining = remaining;
                entry.last_updated_at = now;
                Decision::Proceed { remaining: remaining.map(clamp) }
            }
            Verdict::Wait { wait, floor } => Decision::Suspend {
                wait,
                remaining: entry.remaining.map(clamp).unwrap_or(0),
                floor,
                reset_at: entry.reset_at,
            },
        };
        let state = entry.view(name, now);
        Reservation { decision, state: Some(state), reading: entry.generation }
    }

    /// Optimistically consume one unit of `name` if that needs no wait.
    ///
    /// Returns `false` when the bucket sits at or below its soft floor; nothing is
    /// consumed in that case.
    pub fn try_consume(&self, name: &str, config: &ThrottleConfig) -> bool {
        self.reserve(name, config).decision.is_proceed()
    }

    /// Mark the window of `name` as refilled after a throttle wait elapsed.
    ///
    /// `reading` is the generation the suspension was decided on. A reading
    /// applied during the wait, or a refill already done by another waiter,
    /// is kept as is.
    pub(crate) fn refill(&self, name: &str, reading: u64) -> Option<BucketState> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        let entry = guard.entries.get_mut(name)?;
        if entry.generation == reading && !entry.window_refilled {
            entry.refill();
            entry.last_updated_at = now;
        } else {
            tracing::debug!(
                target: "quotakeeper::bucket",
                bucket = %name,
                "window already refreshed during wait; keeping current state"
            );
        }
        Some(entry.view(name, now))
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
