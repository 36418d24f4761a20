//! Operator-armed hard stop.
//!
//! Two states: inactive, or armed until a deadline with a reason. Expiry is
//! lazy: [`KillSwitch::check`] compares the deadline with the clock and drops
//! back to inactive once it has passed, so no background task is involved.
//! The killswitch is independent of throttling and stays effective when
//! throttling is disabled.

use crate::clock::{Clock, SystemClock};
use crate::error::GovernorError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Reason reported when none was given on arm.
pub const DEFAULT_REASON: &str = "killswitch active";

/// Observable killswitch state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillSwitchState {
    Inactive,
    /// Blocking until `until_millis` (Unix epoch millis).
    Armed { until_millis: u64, reason: String },
}

impl KillSwitchState {
    pub fn is_active(&self) -> bool {
        matches!(self, KillSwitchState::Armed { .. })
    }
}

/// Clones share the same switch.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    state: Arc<Mutex<KillSwitchState>>,
    clock: Arc<dyn Clock>,
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self::with_shared_clock(Arc::new(clock))
    }

    pub(crate) fn with_shared_clock(clock: Arc<dyn Clock>) -> Self {
        Self { state: Arc::new(Mutex::new(KillSwitchState::Inactive)), clock }
    }

    fn lock(&self) -> MutexGuard<'_, KillSwitchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block governed calls for `duration` from now.
    pub fn arm_for(&self, duration: Duration, reason: Option<&str>) {
        let delta = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.arm_until(self.clock.now_millis().saturating_add(delta), reason);
    }

    /// Block governed calls until `until_millis` (Unix epoch millis).
    pub fn arm_until(&self, until_millis: u64, reason: Option<&str>) {
        let reason = reason.unwrap_or(DEFAULT_REASON).to_string();
        tracing::warn!(
            target: "quotakeeper::killswitch",
            until_millis,
            reason = %reason,
            "killswitch armed"
        );
        *self.lock() = KillSwitchState::Armed { until_millis, reason };
    }

    /// Re-enable governed calls immediately. Safe when already inactive.
    pub fn clear(&self) {
        let mut guard = self.lock();
        if guard.is_active() {
            tracing::info!(target: "quotakeeper::killswitch", "killswitch cleared");
        }
        *guard = KillSwitchState::Inactive;
    }

    /// Current state after resolving expiry.
    pub fn status(&self) -> KillSwitchState {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        Self::expire(&mut guard, now);
        guard.clone()
    }

    /// Gate for governed calls.
    ///
    /// # Errors
    /// `GovernorError::KillSwitchActive` with the reason and time left while armed.
    pub fn check(&self) -> Result<(), GovernorError> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        Self::expire(&mut guard, now);
        match &*guard {
            KillSwitchState::Inactive => Ok(()),
            KillSwitchState::Armed { until_millis, reason } => Err(GovernorError::KillSwitchActive {
                reason: reason.clone(),
                remaining: Duration::from_millis(until_millis.saturating_sub(now)),
            }),
        }
    }

    fn expire(state: &mut KillSwitchState, now: u64) {
        if let KillSwitchState::Armed { until_millis, .. } = state {
            if now >= *until_millis {
                tracing::info!(target: "quotakeeper::killswitch", "killswitch expired");
                *state = KillSwitchState::Inactive;
            }
        }
    }
}
