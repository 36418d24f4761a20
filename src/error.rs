//! Error types for governed calls
use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

/// Unified error type for governed calls.
///
/// `E` is the error of the wrapped operation; calls that wrap nothing (such as
/// [`QuotaGovernor::try_consume`](crate::QuotaGovernor::try_consume)) use the
/// default `Infallible`.
#[derive(Debug, Clone, PartialEq)]
pub enum GovernorError<E = Infallible> {
    /// The killswitch is armed; nothing is sent until it expires or is cleared.
    KillSwitchActive { reason: String, remaining: Duration },
    /// The soft-floor wait is longer than the caller is willing to suspend.
    WaitExceeded { wait: Duration, max_wait: Duration },
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GovernorError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KillSwitchActive { reason, remaining } => {
                write!(f, "killswitch active for another {:.1}s: {}", remaining.as_secs_f64(), reason)
            }
            Self::WaitExceeded { wait, max_wait } => {
                write!(f, "throttle wait of {:?} exceeds the allowed {:?}", wait, max_wait)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GovernorError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl GovernorError<Infallible> {
    /// Re-type a gate error for a call that wraps an operation error `E`.
    pub fn widen<E>(self) -> GovernorError<E> {
        match self {
            Self::KillSwitchActive { reason, remaining } => {
                GovernorError::KillSwitchActive { reason, remaining }
            }
            Self::WaitExceeded { wait, max_wait } => GovernorError::WaitExceeded { wait, max_wait },
            Self::Inner(never) => match never {},
        }
    }
}

impl<E> GovernorError<E> {
    /// Check if the call was blocked by the killswitch
    pub fn is_killswitch(&self) -> bool {
        matches!(self, Self::KillSwitchActive { .. })
    }
    /// Check if the throttle wait exceeded the caller's bound
    pub fn is_wait_exceeded(&self) -> bool {
        matches!(self, Self::WaitExceeded { .. })
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Killswitch reason and time left, if blocked by the killswitch.
    pub fn killswitch_details(&self) -> Option<(&str, Duration)> {
        match self {
            Self::KillSwitchActive { reason, remaining } => Some((reason.as_str(), *remaining)),
            _ => None,
        }
    }
    /// Required and allowed wait, if the wait bound was exceeded.
    pub fn wait_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::WaitExceeded { wait, max_wait } => Some((*wait, *max_wait)),
            _ => None,
        }
    }
}
