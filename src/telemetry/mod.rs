//! Telemetry for the governor.
//!
//! Every notable decision (a throttle wait, a killswitch refusal, a refresh, a
//! bridge peer coming or going) is described by a [`GovernorEvent`] and handed
//! to a caller-constructed sink. Sinks implement [`TelemetrySink`], a
//! `tower::Service<GovernorEvent>`, so they compose with standard tower
//! combinators. The governor defaults to [`NullSink`]; nothing is installed
//! globally.

pub mod events;
pub mod sinks;

pub use events::{
    BridgeEvent, GovernorEvent, KillSwitchEvent, ListenerEvent, RefreshEvent, SnapshotEvent,
    ThrottleEvent, UpdateSource,
};
pub use sinks::{
    emit_best_effort, LogSink, MemorySink, NullSink, SinkHandle, StreamingSink, TelemetrySink,
};
