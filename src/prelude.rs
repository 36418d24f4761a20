//! Convenient re-exports for common quotakeeper types.
pub use crate::{
    config::{CallOptions, GovernorConfig},
    error::GovernorError,
    governor::QuotaGovernor,
    layer::QuotaLayer,
    listener::{ListenerError, SubscriptionId},
    refresher::{refresh_fn, RefreshSource},
    snapshot::{ReportsQuota, Snapshot},
    telemetry::{GovernorEvent, LogSink, MemorySink, TelemetrySink},
    throttle::{Admission, ThrottleConfig},
    BucketState,
};
