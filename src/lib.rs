#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotakeeper
//!
//! Client-side quota governance for rate-limited HTTP APIs.
//!
//! The service you call is the authority on how much quota is left; it says so
//! in `X-RateLimit-*` headers. `quotakeeper` keeps the latest reading per bucket
//! and uses it to keep a client polite:
//!
//! - **Soft-floor throttling**: calls stop short of exhausting a window and wait
//!   for the reset instead, leaving headroom for traffic the client cannot see.
//! - **Killswitch**: a caller-armed hard stop that refuses every governed call
//!   until it expires or is cleared.
//! - **Listeners**: in-process callbacks and broadcast channels that see every
//!   bucket update.
//! - **Background refresh**: polls a caller-supplied source only while organic
//!   traffic is quiet.
//! - **Cross-process bridge** (feature `bridge`, Unix): JSON-lines updates over a
//!   local socket so a dashboard in another process sees the same state.
//!
//! ## Quick Start
//!
//! ```rust
//! use quotakeeper::{CallOptions, QuotaGovernor, Snapshot};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let governor = QuotaGovernor::new();
//!     governor.subscribe(|bucket, state| {
//!         println!("{bucket}: {:?} of {}", state.remaining, state.limit);
//!         Ok(())
//!     });
//!
//!     let response = governor
//!         .execute(CallOptions::bucket("core").with_max_wait(Duration::from_secs(30)), || async {
//!             // issue the real request here and hand back its rate-limit headers
//!             Ok::<_, std::io::Error>(Snapshot::new(5000, 4999, 1_700_000_000))
//!         })
//!         .await;
//!     assert!(response.is_ok());
//! }
//! ```

pub mod adaptive;
#[cfg(feature = "bridge")]
pub mod bridge;
pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod governor;
pub mod hub;
pub mod killswitch;
pub mod layer;
pub mod listener;
pub mod prelude;
pub mod refresher;
pub mod sleeper;
pub mod snapshot;
pub mod telemetry;
pub mod throttle;

// Re-exports
pub use adaptive::DynamicConfig;
#[cfg(feature = "bridge")]
pub use bridge::{BridgeError, BridgeMessage};
#[cfg(all(feature = "bridge", unix))]
pub use bridge::{emit_update, BridgePublisher, BridgeSubscriber};
pub use bucket::{BucketState, BucketStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BridgeConfig, CallOptions, ConfigError, GovernorConfig, GovernorConfigBuilder};
pub use error::GovernorError;
pub use governor::{GovernorBuilder, QuotaGovernor};
pub use hub::StateHub;
pub use killswitch::{KillSwitch, KillSwitchState};
pub use layer::{QuotaLayer, QuotaService};
pub use listener::{
    BroadcastListener, BucketUpdate, Listener, ListenerError, ListenerRegistry, PublishReport,
    SubscriptionId,
};
pub use refresher::{refresh_fn, FetchError, RefreshError, RefreshSource};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use snapshot::{ReportsQuota, Snapshot};
pub use throttle::{Admission, Decision, Throttle, ThrottleConfig};
