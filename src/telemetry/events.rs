use std::fmt;
use std::time::Duration;

/// Governor events emitted while gating calls and propagating quota state.
///
/// Events describe decisions, not raw traffic: a call that proceeds without
/// waiting emits nothing beyond its snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum GovernorEvent {
    /// Soft-floor throttle events
    Throttle(ThrottleEvent),
    /// Killswitch events
    KillSwitch(KillSwitchEvent),
    /// A snapshot was applied to the store
    Snapshot(SnapshotEvent),
    /// Background refresher events
    Refresh(RefreshEvent),
    /// Listener delivery failures
    Listener(ListenerEvent),
    /// Cross-process bridge events
    Bridge(BridgeEvent),
}

/// Events emitted by the soft-floor throttle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleEvent {
    /// A call was suspended until its window resets.
    Suspended {
        bucket: String,
        wait: Duration,
        /// Remaining units when the decision was taken
        remaining: u64,
        floor: u64,
    },
    /// The required wait was longer than the caller's bound; the call failed.
    WaitExceeded { bucket: String, wait: Duration, max_wait: Duration },
}

/// Events emitted by the killswitch gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillSwitchEvent {
    Armed { until_millis: u64, reason: String },
    Cleared,
    /// A governed call was refused.
    Blocked { reason: String, remaining: Duration },
}

/// Where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Headers of a real call made by this process.
    Traffic,
    /// The background refresher.
    Refresh,
    /// Another process, via the bridge.
    Bridge,
}

/// Snapshot bookkeeping events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotEvent {
    Applied { bucket: String, source: UpdateSource, limit: u64, remaining: Option<u64> },
}

/// Background refresher events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEvent {
    /// Organic traffic kept the bucket fresh.
    Skipped { bucket: String, since_update: Duration },
    Completed { bucket: String },
    Failed { bucket: String, error: String },
}

/// Listener delivery events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Failed { bucket: String, subscription: String, error: String },
}

/// Cross-process bridge events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The local channel could not be established; running in-process only.
    Unavailable { endpoint: String, error: String },
    PeerConnected { peers: usize },
    PeerDisconnected { peers: usize },
    /// A reader fell behind and skipped intermediate updates.
    ReaderLagged { missed: u64 },
    /// A line on the wire could not be decoded.
    InvalidMessage { error: String },
}

impl fmt::Display for GovernorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GovernorEvent::Throttle(event) => write!(f, "Throttle::{}", event),
            GovernorEvent::KillSwitch(event) => write!(f, "KillSwitch::{}", event),
            GovernorEvent::Snapshot(event) => write!(f, "Snapshot::{}", event),
            GovernorEvent::Refresh(event) => write!(f, "Refresh::{}", event),
            GovernorEvent::Listener(event) => write!(f, "Listener::{}", event),
            GovernorEvent::Bridge(event) => write!(f, "Bridge::{}", event),
        }
    }
}

impl fmt::Display for ThrottleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleEvent::Suspended { bucket, wait, remaining, floor } => write!(
                f,
                "Suspended({}, wait={:?}, remaining={}, floor={})",
                bucket, wait, remaining, floor
            ),
            ThrottleEvent::WaitExceeded { bucket, wait, max_wait } => {
                write!(f, "WaitExceeded({}, wait={:?}, max={:?})", bucket, wait, max_wait)
            }
        }
    }
}

impl fmt::Display for KillSwitchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillSwitchEvent::Armed { until_millis, reason } => {
                write!(f, "Armed(until={}, reason={})", until_millis, reason)
            }
            KillSwitchEvent::Cleared => write!(f, "Cleared"),
            KillSwitchEvent::Blocked { reason, remaining } => {
                write!(f, "Blocked(reason={}, remaining={:?})", reason, remaining)
            }
        }
    }
}

impl fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UpdateSource::Traffic => "traffic",
            UpdateSource::Refresh => "refresh",
            UpdateSource::Bridge => "bridge",
        };
        f.write_str(label)
    }
}

impl fmt::Display for SnapshotEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotEvent::Applied { bucket, source, limit, remaining } => {
                match remaining {
                    Some(remaining) => {
                        write!(f, "Applied({}, source={}, {}/{})", bucket, source, remaining, limit)
                    }
                    None => write!(f, "Applied({}, source={}, ?/{})", bucket, source, limit),
                }
            }
        }
    }
}

impl fmt::Display for RefreshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshEvent::Skipped { bucket, since_update } => {
                write!(f, "Skipped({}, since_update={:?})", bucket, since_update)
            }
            RefreshEvent::Completed { bucket } => write!(f, "Completed({})", bucket),
            RefreshEvent::Failed { bucket, error } => write!(f, "Failed({}, {})", bucket, error),
        }
    }
}

impl fmt::Display for ListenerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerEvent::Failed { bucket, subscription, error } => {
                write!(f, "Failed({}, {}, {})", subscription, bucket, error)
            }
        }
    }
}

impl fmt::Display for BridgeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeEvent::Unavailable { endpoint, error } => {
                write!(f, "Unavailable({}, {})", endpoint, error)
            }
            BridgeEvent::PeerConnected { peers } => write!(f, "PeerConnected(peers={})", peers),
            BridgeEvent::PeerDisconnected { peers } => {
                write!(f, "PeerDisconnected(peers={})", peers)
            }
            BridgeEvent::ReaderLagged { missed } => write!(f, "ReaderLagged(missed={})", missed),
            BridgeEvent::InvalidMessage { error } => write!(f, "InvalidMessage({})", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_event_display() {
        let event = GovernorEvent::Throttle(ThrottleEvent::Suspended {
            bucket: "search".into(),
            wait: Duration::from_secs(17),
            remaining: 5,
            floor: 10,
        });
        let text = event.to_string();
        assert!(text.starts_with("Throttle::Suspended(search"));
        assert!(text.contains("floor=10"));
    }

    #[test]
    fn snapshot_event_display_names_source() {
        let event = SnapshotEvent::Applied {
            bucket: "core".into(),
            source: UpdateSource::Bridge,
            limit: 60,
            remaining: Some(48),
        };
        assert_eq!(event.to_string(), "Applied(core, source=bridge, 48/60)");
    }

    #[test]
    fn bridge_event_display() {
        let event = GovernorEvent::Bridge(BridgeEvent::ReaderLagged { missed: 3 });
        assert_eq!(event.to_string(), "Bridge::ReaderLagged(missed=3)");
    }
}
