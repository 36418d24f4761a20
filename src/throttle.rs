//! Soft-floor throttling.
//!
//! Semantics:
//! - With no known limit or remaining count, calls proceed immediately.
//! - `soft_floor = max(floor(limit * soft_floor_fraction), soft_floor_min)`.
//! - Once the announced reset instant has passed, the window counts as refilled
//!   (`remaining = limit`) before evaluating.
//! - Above the floor a call proceeds and optimistically consumes one unit.
//! - At or below the floor the call waits `max(0, reset_at - now) + safety_buffer`,
//!   after which the window is treated as refilled and the call proceeds without
//!   another check. A reading that arrived during the wait replaces the refill.
//!
//! Invariants:
//! - The client's own traffic never drives `remaining` to zero; the floor is kept
//!   as headroom against burst detection the client cannot observe.
//! - A wait is never shorter than `safety_buffer`, so stale data cannot cause a spin.
//! - The store lock is released before suspending.

use crate::bucket::{BucketState, BucketStore};
use crate::config::ConfigError;
use crate::error::GovernorError;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{GovernorEvent, SinkHandle, ThrottleEvent};
use std::sync::Arc;
use std::time::Duration;

/// Default fraction of the limit held back as headroom.
pub const DEFAULT_SOFT_FLOOR_FRACTION: f64 = 0.20;
/// Default absolute lower bound of the soft floor.
pub const DEFAULT_SOFT_FLOOR_MIN: u64 = 10;
/// Default slack added on top of the time left in a window.
pub const DEFAULT_SAFETY_BUFFER: Duration = Duration::from_secs(5);

/// Validated soft-floor parameters. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleConfig {
    soft_floor_fraction: f64,
    soft_floor_min: u64,
    safety_buffer: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            soft_floor_fraction: DEFAULT_SOFT_FLOOR_FRACTION,
            soft_floor_min: DEFAULT_SOFT_FLOOR_MIN,
            safety_buffer: DEFAULT_SAFETY_BUFFER,
        }
    }
}

impl ThrottleConfig {
    /// Create a config with validation; `soft_floor_fraction` must be finite and
    /// within `0.0..=1.0`.
    pub fn new(
        soft_floor_fraction: f64,
        soft_floor_min: u64,
        safety_buffer: Duration,
    ) -> Result<Self, ConfigError> {
        if !soft_floor_fraction.is_finite() || !(0.0..=1.0).contains(&soft_floor_fraction) {
            return Err(ConfigError::InvalidSoftFloorFraction(soft_floor_fraction));
        }
        Ok(Self { soft_floor_fraction, soft_floor_min, safety_buffer })
    }

    pub fn soft_floor_fraction(&self) -> f64 {
        self.soft_floor_fraction
    }

    pub fn soft_floor_min(&self) -> u64 {
        self.soft_floor_min
    }

    pub fn safety_buffer(&self) -> Duration {
        self.safety_buffer
    }

    /// The remaining-quota threshold for a bucket with `limit` units per window.
    pub fn soft_floor(&self, limit: u64) -> u64 {
        let fractional = (limit as f64 * self.soft_floor_fraction).floor() as u64;
        fractional.max(self.soft_floor_min)
    }
}

/// Outcome of a soft-floor check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Proceed now. `remaining` is the count after the optimistic decrement, or
    /// `None` when the bucket's limit or remaining count is unknown.
    Proceed { remaining: Option<u64> },
    /// Suspend for `wait` before proceeding.
    Suspend { wait: Duration, remaining: u64, floor: u64, reset_at: u64 },
}

impl Decision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Decision::Proceed { .. })
    }

    /// Required wait, zero for `Proceed`.
    pub fn wait(&self) -> Duration {
        match self {
            Decision::Proceed { .. } => Duration::ZERO,
            Decision::Suspend { wait, .. } => *wait,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Unknown,
    Consume,
    Wait { wait: Duration, floor: u64 },
}

/// Pure decision step; the caller has already applied any elapsed-window refill.
pub(crate) fn decide(
    limit: u64,
    remaining: Option<i64>,
    reset_at: u64,
    now_millis: u64,
    config: &ThrottleConfig,
) -> Verdict {
    let Some(remaining) = remaining.filter(|_| limit > 0) else {
        return Verdict::Unknown;
    };
    let floor = config.soft_floor(limit);
    if remaining > i64::try_from(floor).unwrap_or(i64::MAX) {
        return Verdict::Consume;
    }
    let until_reset = Duration::from_millis(reset_at.saturating_mul(1_000).saturating_sub(now_millis));
    Verdict::Wait { wait: until_reset + config.safety_buffer, floor }
}

/// How a governed call got through the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceeded without suspension.
    Proceed,
    /// Proceeded after suspending for the given duration.
    Waited(Duration),
}

impl Admission {
    pub fn waited(&self) -> Option<Duration> {
        match self {
            Admission::Proceed => None,
            Admission::Waited(d) => Some(*d),
        }
    }
}

/// Result of [`Throttle::acquire`].
#[derive(Debug, Clone, PartialEq)]
pub struct Acquired {
    pub admission: Admission,
    /// Bucket state after the decision, `None` for never-observed buckets.
    pub state: Option<BucketState>,
}

/// Applies soft-floor decisions against a [`BucketStore`], suspending the
/// calling task when required.
#[derive(Debug, Clone)]
pub struct Throttle {
    store: BucketStore,
    sleeper: Arc<dyn Sleeper>,
    sink: SinkHandle,
}

impl Throttle {
    pub fn new(store: BucketStore) -> Self {
        Self { store, sleeper: Arc::new(TokioSleeper), sink: SinkHandle::default() }
    }

    /// Report suspensions and exceeded bounds to `sink`.
    pub fn with_sink(mut self, sink: SinkHandle) -> Self {
        self.sink = sink;
        self
    }

    /// Override the sleeper (useful for deterministic tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub(crate) fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    /// Wait, if needed, until one call against `bucket` may proceed.
    ///
    /// # Errors
    /// Returns `GovernorError::WaitExceeded` without sleeping when the required
    /// wait is longer than `max_wait`.
    pub async fn acquire(
        &self,
        bucket: &str,
        config: &ThrottleConfig,
        max_wait: Option<Duration>,
    ) -> Result<Acquired, GovernorError> {
        let reservation = self.store.reserve(bucket, config);
        match reservation.decision {
            Decision::Proceed { .. } => {
                Ok(Acquired { admission: Admission::Proceed, state: reservation.state })
            }
            Decision::Suspend { wait, remaining, floor, reset_at } => {
                if let Some(max_wait) = max_wait {
                    if wait > max_wait {
                        tracing::debug!(
                            target: "quotakeeper::throttle",
                            bucket = %bucket,
                            wait_ms = wait.as_millis() as u64,
                            max_wait_ms = max_wait.as_millis() as u64,
                            "throttle wait exceeds caller bound"
                        );
                        self.sink
                            .emit(GovernorEvent::Throttle(ThrottleEvent::WaitExceeded {
                                bucket: bucket.to_string(),
                                wait,
                                max_wait,
                            }))
                            .await;
                        return Err(GovernorError::WaitExceeded { wait, max_wait });
                    }
                }
                tracing::warn!(
                    target: "quotakeeper::throttle",
                    bucket = %bucket,
                    remaining,
                    floor,
                    reset_at,
                    wait_secs = wait.as_secs_f64(),
                    "quota low; suspending until window resets"
                );
                self.sink
                    .emit(GovernorEvent::Throttle(ThrottleEvent::Suspended {
                        bucket: bucket.to_string(),
                        wait,
                        remaining,
                        floor,
                    }))
                    .await;
                self.sleeper.sleep(wait).await;
                let state = self.store.refill(bucket, reservation.reading);
                Ok(Acquired { admission: Admission::Waited(wait), state })
            }
        }
    }
}
