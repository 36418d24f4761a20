//! The client-facing governor.
//!
//! [`QuotaGovernor`] ties the pieces together: every governed call passes the
//! killswitch, then the soft-floor throttle for its bucket; every snapshot from
//! real traffic lands in the store, restarts the refresh timer, and fans out to
//! listeners (and through them to the bridge, when one is running).
//!
//! ```no_run
//! use quotakeeper::{CallOptions, QuotaGovernor, Snapshot};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let governor = QuotaGovernor::new();
//! governor.apply_external_snapshot("core", Snapshot::new(5000, 4999, 1_700_000_000));
//! governor.try_consume(CallOptions::bucket("core")).await?;
//! # Ok(())
//! # }
//! ```

use crate::bucket::{BucketState, BucketStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{CallOptions, GovernorConfig};
use crate::error::GovernorError;
use crate::hub::StateHub;
use crate::killswitch::{KillSwitch, KillSwitchState};
use crate::listener::{Listener, ListenerError, ListenerRegistry, SubscriptionId};
use crate::refresher::{RefreshError, RefreshParams, RefreshSource, Refresher};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::snapshot::{ReportsQuota, Snapshot};
use crate::telemetry::{GovernorEvent, KillSwitchEvent, SinkHandle, TelemetrySink, UpdateSource};
use crate::throttle::{Admission, Throttle};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "bridge")]
use crate::bridge::BridgeError;
#[cfg(feature = "bridge")]
use crate::config::BridgeConfig;
#[cfg(feature = "bridge")]
use crate::telemetry::BridgeEvent;
#[cfg(all(feature = "bridge", unix))]
use crate::bridge::{BridgePublisher, BridgeSubscriber};
#[cfg(all(feature = "bridge", unix))]
use std::sync::{Mutex, PoisonError};

/// Builder for [`QuotaGovernor`].
#[derive(Debug)]
pub struct GovernorBuilder {
    config: GovernorConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: SinkHandle,
}

impl Default for GovernorBuilder {
    fn default() -> Self {
        Self {
            config: GovernorConfig::default(),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            sink: SinkHandle::default(),
        }
    }
}

impl GovernorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: GovernorConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the sleeper used for throttle waits.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Attach a telemetry sink. Defaults to `NullSink`.
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        self.sink = SinkHandle::new(sink);
        self
    }

    pub fn build(self) -> QuotaGovernor {
        let store = BucketStore::with_shared_clock(self.clock.clone());
        let hub = StateHub::new(store.clone(), ListenerRegistry::new()).with_sink(self.sink.clone());
        let throttle =
            Throttle::new(store).with_shared_sleeper(self.sleeper).with_sink(self.sink.clone());
        QuotaGovernor {
            config: self.config,
            killswitch: KillSwitch::with_shared_clock(self.clock),
            refresher: Refresher::new(hub.clone()),
            throttle,
            hub,
            #[cfg(all(feature = "bridge", unix))]
            bridge: Mutex::default(),
        }
    }
}

#[cfg(all(feature = "bridge", unix))]
#[derive(Debug, Default)]
struct BridgeTasks {
    publisher: Option<BridgePublisher>,
    subscriber: Option<BridgeSubscriber>,
}

/// Client-side quota governor for one rate-limited service.
///
/// Share it behind an `Arc`; every operation takes `&self`.
#[derive(Debug)]
pub struct QuotaGovernor {
    config: GovernorConfig,
    hub: StateHub,
    throttle: Throttle,
    killswitch: KillSwitch,
    refresher: Refresher,
    #[cfg(all(feature = "bridge", unix))]
    bridge: Mutex<BridgeTasks>,
}

impl Default for QuotaGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaGovernor {
    /// A governor with default configuration, system clock, and no telemetry.
    pub fn new() -> Self {
        GovernorBuilder::new().build()
    }

    pub fn builder() -> GovernorBuilder {
        GovernorBuilder::new()
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// The shared store/listener/telemetry path, for wiring custom components.
    pub fn hub(&self) -> &StateHub {
        &self.hub
    }

    fn resolve_bucket(&self, opts: &CallOptions) -> String {
        opts.bucket.clone().unwrap_or_else(|| self.config.default_bucket().to_string())
    }

    // ----- snapshots -------------------------------------------------------

    /// Record an authoritative reading from real traffic and propagate it.
    ///
    /// Returns the stored state, or `None` when `snapshot` carried nothing.
    pub fn apply_external_snapshot(&self, bucket: &str, snapshot: Snapshot) -> Option<BucketState> {
        self.hub.apply(bucket, snapshot, UpdateSource::Traffic)
    }

    /// Record the `X-RateLimit-*` headers of a response.
    pub fn apply_headers<'a, I>(&self, bucket: &str, headers: I) -> Option<BucketState>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.apply_external_snapshot(bucket, Snapshot::from_headers(headers))
    }

    pub fn bucket(&self, name: &str) -> Option<BucketState> {
        self.hub.store().get(name)
    }

    /// Every observed bucket, in first-seen order.
    pub fn buckets(&self) -> Vec<BucketState> {
        self.hub.store().list()
    }

    // ----- governed calls --------------------------------------------------

    /// Gate one call: killswitch first, then the soft-floor throttle.
    ///
    /// # Errors
    /// - `KillSwitchActive` while the killswitch is armed.
    /// - `WaitExceeded` when the throttle wait is longer than `opts.max_wait`.
    pub async fn try_consume(&self, opts: CallOptions) -> Result<Admission, GovernorError> {
        let bucket = self.resolve_bucket(&opts);
        self.check_killswitch().await?;
        if !self.config.throttling_enabled() {
            return Ok(Admission::Proceed);
        }

        let throttle = opts.throttle.unwrap_or_else(|| *self.config.throttle_for(&bucket));
        let acquired = self.throttle.acquire(&bucket, &throttle, opts.max_wait).await?;
        if let Some(state) = &acquired.state {
            self.hub.publish(&bucket, state);
        }
        Ok(acquired.admission)
    }

    /// Gate `op`, run it, and record the quota reading its response carries.
    ///
    /// # Errors
    /// Gate errors as for [`try_consume`](Self::try_consume); failures of `op`
    /// come back as `GovernorError::Inner`.
    pub async fn execute<F, Fut, T, E>(&self, opts: CallOptions, op: F) -> Result<T, GovernorError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: ReportsQuota,
    {
        let bucket = self.resolve_bucket(&opts);
        self.try_consume(opts).await.map_err(GovernorError::widen)?;
        let response = op().await.map_err(GovernorError::Inner)?;
        if let Some(snapshot) = response.quota_snapshot() {
            self.apply_external_snapshot(&bucket, snapshot);
        }
        Ok(response)
    }

    async fn check_killswitch(&self) -> Result<(), GovernorError> {
        if let Err(err) = self.killswitch.check() {
            if let Some((reason, remaining)) = err.killswitch_details() {
                self.hub
                    .sink()
                    .emit(GovernorEvent::KillSwitch(KillSwitchEvent::Blocked {
                        reason: reason.to_string(),
                        remaining,
                    }))
                    .await;
            }
            return Err(err);
        }
        Ok(())
    }

    // ----- killswitch ------------------------------------------------------

    /// Refuse governed calls for `duration`, with an optional reason.
    pub fn arm_killswitch(&self, duration: Duration, reason: Option<&str>) {
        self.killswitch.arm_for(duration, reason);
        self.report_armed();
    }

    /// Refuse governed calls until `until_millis` (Unix epoch millis).
    pub fn arm_killswitch_until(&self, until_millis: u64, reason: Option<&str>) {
        self.killswitch.arm_until(until_millis, reason);
        self.report_armed();
    }

    pub fn clear_killswitch(&self) {
        self.killswitch.clear();
        self.hub.sink().emit_detached(GovernorEvent::KillSwitch(KillSwitchEvent::Cleared));
    }

    pub fn killswitch_status(&self) -> KillSwitchState {
        self.killswitch.status()
    }

    fn report_armed(&self) {
        if let KillSwitchState::Armed { until_millis, reason } = self.killswitch.status() {
            self.hub
                .sink()
                .emit_detached(GovernorEvent::KillSwitch(KillSwitchEvent::Armed { until_millis, reason }));
        }
    }

    // ----- listeners -------------------------------------------------------

    /// Register a callback for every bucket update.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &BucketState) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.hub.listeners().subscribe(callback)
    }

    pub fn subscribe_listener(&self, listener: Arc<dyn Listener>) -> SubscriptionId {
        self.hub.listeners().subscribe_listener(listener)
    }

    /// Returns `false` when `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.listeners().unsubscribe(id)
    }

    // ----- refresh ---------------------------------------------------------

    /// Poll `source` for `bucket` whenever real traffic has been quiet for
    /// `interval`. Re-arms with the new parameters when already running.
    ///
    /// # Errors
    /// `RefreshError::NoRuntime` when called outside a tokio runtime.
    pub fn start_refresh<S>(&self, interval: Duration, bucket: impl Into<String>, source: S) -> Result<(), RefreshError>
    where
        S: RefreshSource + 'static,
    {
        self.refresher.start(RefreshParams::new(interval, bucket, Arc::new(source)))
    }

    /// Stop the refresher. Safe when it is not running.
    pub fn stop_refresh(&self) {
        self.refresher.stop();
    }

    pub fn refresh_running(&self) -> bool {
        self.refresher.is_running()
    }

    // ----- bridge ----------------------------------------------------------

    /// Serve this governor's updates on the local socket in `config`.
    ///
    /// Returns `false`, after logging, when the bridge is disabled or cannot be
    /// established; the governor keeps working in-process.
    #[cfg(feature = "bridge")]
    pub async fn start_bridge_publisher(&self, config: &BridgeConfig) -> bool {
        #[cfg(unix)]
        {
            let replaced = {
                let mut tasks = self.bridge.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(publisher) = tasks.publisher.as_ref() {
                    let same = Some(publisher.endpoint()) == config.socket_path.as_deref();
                    if same && publisher.is_active() {
                        return true;
                    }
                }
                tasks.publisher.take()
            };
            drop(replaced);
            match BridgePublisher::bind(self.hub.clone(), config).await {
                Ok(publisher) => {
                    self.bridge.lock().unwrap_or_else(PoisonError::into_inner).publisher = Some(publisher);
                    true
                }
                Err(err) => {
                    self.bridge_unavailable(config, &err).await;
                    false
                }
            }
        }
        #[cfg(not(unix))]
        {
            self.bridge_unavailable(config, &BridgeError::Unsupported).await;
            false
        }
    }

    /// Follow another process's publisher at the socket in `config`, replaying
    /// its updates into this governor.
    ///
    /// Returns `false`, after logging, when the bridge is disabled or the
    /// publisher cannot be reached.
    #[cfg(feature = "bridge")]
    pub async fn connect_bridge(&self, config: &BridgeConfig) -> bool {
        #[cfg(unix)]
        {
            match BridgeSubscriber::connect(self.hub.clone(), config).await {
                Ok(subscriber) => {
                    let previous = self
                        .bridge
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .subscriber
                        .replace(subscriber);
                    drop(previous);
                    true
                }
                Err(err) => {
                    self.bridge_unavailable(config, &err).await;
                    false
                }
            }
        }
        #[cfg(not(unix))]
        {
            self.bridge_unavailable(config, &BridgeError::Unsupported).await;
            false
        }
    }

    /// Whether a publisher or subscriber is currently running.
    #[cfg(feature = "bridge")]
    pub fn bridge_active(&self) -> bool {
        #[cfg(unix)]
        {
            let tasks = self.bridge.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.publisher.as_ref().map_or(false, BridgePublisher::is_active)
                || tasks.subscriber.as_ref().map_or(false, BridgeSubscriber::is_active)
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Shut down any bridge publisher and subscriber.
    #[cfg(feature = "bridge")]
    pub fn stop_bridge(&self) {
        #[cfg(unix)]
        {
            let tasks = std::mem::take(&mut *self.bridge.lock().unwrap_or_else(PoisonError::into_inner));
            if let Some(publisher) = tasks.publisher {
                publisher.shutdown();
            }
            if let Some(subscriber) = tasks.subscriber {
                subscriber.shutdown();
            }
        }
    }

    #[cfg(feature = "bridge")]
    async fn bridge_unavailable(&self, config: &BridgeConfig, err: &BridgeError) {
        if matches!(err, BridgeError::Disabled) {
            tracing::debug!(target: "quotakeeper::bridge", "bridge disabled; running in-process only");
            return;
        }
        let endpoint = config
            .socket_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        tracing::warn!(
            target: "quotakeeper::bridge",
            endpoint = %endpoint,
            error = %err,
            "bridge unavailable; running in-process only"
        );
        self.hub
            .sink()
            .emit(GovernorEvent::Bridge(BridgeEvent::Unavailable { endpoint, error: err.to_string() }))
            .await;
    }

    /// Stop background work: the refresher and any bridge tasks.
    pub fn shutdown(&self) {
        self.stop_refresh();
        #[cfg(feature = "bridge")]
        self.stop_bridge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::killswitch::DEFAULT_REASON;
    use crate::sleeper::TrackingSleeper;
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn governor_at(secs: u64) -> (QuotaGovernor, ManualClock, TrackingSleeper, MemorySink) {
        let clock = ManualClock::at_secs(secs);
        let sleeper = TrackingSleeper::with_clock(clock.clone());
        let sink = MemorySink::new();
        let governor = QuotaGovernor::builder()
            .clock(clock.clone())
            .sleeper(sleeper.clone())
            .sink(sink.clone())
            .build();
        (governor, clock, sleeper, sink)
    }

    #[tokio::test]
    async fn unknown_default_bucket_proceeds() {
        let (governor, _, sleeper, _) = governor_at(0);
        let admission = governor.try_consume(CallOptions::default()).await.unwrap();
        assert_eq!(admission, Admission::Proceed);
        assert!(sleeper.calls().is_empty());
        assert!(governor.bucket("core").is_none());
    }

    #[tokio::test]
    async fn killswitch_blocks_before_throttle() {
        let (governor, clock, sleeper, sink) = governor_at(100);
        governor.apply_external_snapshot("core", Snapshot::new(60, 1, 160));
        governor.arm_killswitch(Duration::from_secs(2), None);

        let err = governor.try_consume(CallOptions::default()).await.unwrap_err();
        let (reason, remaining) = err.killswitch_details().unwrap();
        assert_eq!(reason, DEFAULT_REASON);
        assert_eq!(remaining, Duration::from_secs(2));
        assert!(sleeper.calls().is_empty());
        assert!(sink.events().iter().any(|e| matches!(e, GovernorEvent::KillSwitch(KillSwitchEvent::Blocked { .. }))));

        clock.advance(Duration::from_millis(2_001));
        assert!(!governor.killswitch_status().is_active());
    }

    #[tokio::test]
    async fn disabled_throttling_still_honors_killswitch() {
        let clock = ManualClock::at_secs(100);
        let sleeper = TrackingSleeper::with_clock(clock.clone());
        let config = GovernorConfig::builder().throttling_enabled(false).build().unwrap();
        let governor =
            QuotaGovernor::builder().config(config).clock(clock).sleeper(sleeper.clone()).build();
        governor.apply_external_snapshot("core", Snapshot::new(60, 0, 160));

        assert_eq!(governor.try_consume(CallOptions::default()).await.unwrap(), Admission::Proceed);
        assert!(sleeper.calls().is_empty());

        governor.arm_killswitch(Duration::from_secs(5), Some("maintenance"));
        assert!(governor.try_consume(CallOptions::default()).await.unwrap_err().is_killswitch());
        governor.clear_killswitch();
        assert!(governor.try_consume(CallOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn consumption_is_published_to_listeners() {
        let (governor, _, _, _) = governor_at(1_000);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();
        governor.subscribe(move |bucket, state| {
            log.lock().unwrap().push((bucket.to_string(), state.remaining));
            Ok(())
        });

        governor.apply_external_snapshot("search", Snapshot::new(30, 29, 1_060));
        governor.try_consume(CallOptions::bucket("search")).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![("search".to_string(), Some(29)), ("search".to_string(), Some(28))]);
    }

    #[tokio::test]
    async fn per_call_bound_surfaces_wait_exceeded() {
        let (governor, _, sleeper, sink) = governor_at(1_000);
        governor.apply_external_snapshot("core", Snapshot::new(60, 2, 1_600));

        let err = governor
            .try_consume(CallOptions::bucket("core").with_max_wait(Duration::from_secs(10)))
            .await
            .unwrap_err();

        let (wait, max_wait) = err.wait_details().unwrap();
        assert_eq!(wait, Duration::from_secs(605));
        assert_eq!(max_wait, Duration::from_secs(10));
        assert!(sleeper.calls().is_empty());
        assert!(sink.events().iter().any(|e| matches!(e, GovernorEvent::Throttle(_))));
    }

    #[tokio::test]
    async fn execute_records_response_snapshot() {
        let (governor, _, _, _) = governor_at(1_000);
        let calls = AtomicUsize::new(0);

        let body = governor
            .execute(CallOptions::bucket("graphql"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(("payload", Snapshot::new(5000, 4321, 4_600)))
            })
            .await
            .unwrap();

        assert_eq!(body.0, "payload");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(governor.bucket("graphql").unwrap().remaining, Some(4321));
    }

    #[tokio::test]
    async fn execute_surfaces_inner_errors_and_skips_blocked_ops() {
        let (governor, _, _, _) = governor_at(1_000);
        let err = governor
            .execute(CallOptions::default(), || async {
                Err::<Snapshot, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.into_inner().unwrap().to_string(), "boom");

        governor.arm_killswitch(Duration::from_secs(60), Some("abuse detected"));
        let ran = AtomicUsize::new(0);
        let err = governor
            .execute(CallOptions::default(), || async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(Snapshot::default())
            })
            .await
            .unwrap_err();
        assert!(err.is_killswitch());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn headers_feed_the_store() {
        let (governor, _, _, _) = governor_at(1_000);
        let state = governor
            .apply_headers(
                "core",
                [("x-ratelimit-limit", "60"), ("x-ratelimit-remaining", "59"), ("x-ratelimit-reset", "1060")],
            )
            .unwrap();
        assert_eq!((state.limit, state.remaining, state.reset_at), (60, Some(59), 1_060));
        assert_eq!(governor.buckets().len(), 1);
    }

    #[cfg(feature = "bridge")]
    #[tokio::test]
    async fn disabled_bridge_degrades_quietly() {
        let (governor, _, _, sink) = governor_at(0);
        assert!(!governor.start_bridge_publisher(&BridgeConfig::disabled()).await);
        assert!(!governor.connect_bridge(&BridgeConfig::disabled()).await);
        assert!(!governor.bridge_active());
        assert!(sink.is_empty());
        governor.shutdown();
    }
}
