//! Background refresh of one bucket while organic traffic is quiet.
//!
//! A [`Refresher`] wakes every `interval`. If a real snapshot (from governed
//! calls or the bridge) landed within the last `interval`, the tick is
//! skipped; otherwise the caller-supplied [`RefreshSource`] is asked for a
//! fresh snapshot, which is applied like any other. Every real update restarts
//! the timer, so a busy client never polls.

use crate::adaptive::DynamicConfig;
use crate::hub::StateHub;
use crate::snapshot::Snapshot;
use crate::telemetry::{GovernorEvent, RefreshEvent, UpdateSource};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Shortest interval accepted; anything smaller is raised to this.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

const NEVER: u64 = u64::MAX;

/// Error returned by a [`RefreshSource`].
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// Errors starting the refresher.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("no tokio runtime available to drive the refresher")]
    NoRuntime,
}

/// Supplies a fresh snapshot for a bucket on demand.
#[async_trait]
pub trait RefreshSource: Send + Sync {
    async fn fetch(&self, bucket: &str) -> Result<Snapshot, FetchError>;
}

/// [`RefreshSource`] backed by an async closure. See [`refresh_fn`].
#[derive(Clone)]
pub struct FnSource<F>(F);

/// Wrap `f` as a [`RefreshSource`]. The closure receives the bucket name.
pub fn refresh_fn<F, Fut>(f: F) -> FnSource<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Snapshot, FetchError>> + Send + 'static,
{
    FnSource(f)
}

#[async_trait]
impl<F, Fut> RefreshSource for FnSource<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Snapshot, FetchError>> + Send + 'static,
{
    async fn fetch(&self, bucket: &str) -> Result<Snapshot, FetchError> {
        (self.0)(bucket.to_string()).await
    }
}

/// When real traffic last updated the store, plus a wake-up for the refresh
/// loop so it can restart its timer.
pub struct Activity {
    last_real: AtomicU64,
    rearm: Notify,
}

impl Default for Activity {
    fn default() -> Self {
        Self { last_real: AtomicU64::new(NEVER), rearm: Notify::new() }
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity").field("last_real", &self.last_real_update()).finish()
    }
}

impl Activity {
    /// Record a real update at `now_millis` and restart the refresh timer.
    pub fn touch(&self, now_millis: u64) {
        self.last_real.store(now_millis, Ordering::SeqCst);
        self.rearm.notify_one();
    }

    /// Unix millis of the last real update, if any.
    pub fn last_real_update(&self) -> Option<u64> {
        match self.last_real.load(Ordering::SeqCst) {
            NEVER => None,
            at => Some(at),
        }
    }

    fn rearm(&self) {
        self.rearm.notify_one();
    }

    async fn rearmed(&self) {
        self.rearm.notified().await
    }
}

/// True when nothing real has updated the bucket for at least `interval`.
pub fn should_refresh(now_millis: u64, last_real_millis: Option<u64>, interval: Duration) -> bool {
    let Some(last) = last_real_millis else {
        return true;
    };
    let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    now_millis.saturating_sub(last) >= interval_ms
}

/// What the refresh loop is currently doing.
#[derive(Clone)]
pub struct RefreshParams {
    interval: Duration,
    bucket: String,
    source: Arc<dyn RefreshSource>,
}

impl fmt::Debug for RefreshParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshParams")
            .field("interval", &self.interval)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl RefreshParams {
    pub fn new(interval: Duration, bucket: impl Into<String>, source: Arc<dyn RefreshSource>) -> Self {
        Self { interval: interval.max(MIN_INTERVAL), bucket: bucket.into(), source }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

struct Running {
    params: DynamicConfig<RefreshParams>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Cancellable periodic refresh task bound to one [`StateHub`].
pub struct Refresher {
    hub: StateHub,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for Refresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refresher").field("running", &self.is_running()).finish()
    }
}

impl Refresher {
    pub fn new(hub: StateHub) -> Self {
        Self { hub, running: Mutex::new(None) }
    }

    /// Start refreshing. Calling again while running swaps in the new
    /// parameters and restarts the timer without spawning a second task.
    pub fn start(&self, params: RefreshParams) -> Result<(), RefreshError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = running.as_ref().filter(|r| !r.task.is_finished()) {
            tracing::debug!(
                target: "quotakeeper::refresher",
                bucket = %params.bucket,
                interval_ms = params.interval.as_millis() as u64,
                "refresher re-armed"
            );
            current.params.set(params);
            self.hub.activity().rearm();
            return Ok(());
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|_| RefreshError::NoRuntime)?;
        tracing::info!(
            target: "quotakeeper::refresher",
            bucket = %params.bucket,
            interval_ms = params.interval.as_millis() as u64,
            "refresher started"
        );
        let params = DynamicConfig::new(params);
        let (stop, stopped) = watch::channel(false);
        let task = handle.spawn(run(self.hub.clone(), params.clone(), stopped));
        *running = Some(Running { params, stop, task });
        Ok(())
    }

    /// Stop refreshing. In-flight waits and fetches are abandoned. No-op when
    /// not running.
    pub fn stop(&self) {
        let taken = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(running) = taken {
            let _ = running.stop.send(true);
            tracing::info!(target: "quotakeeper::refresher", "refresher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |r| !r.task.is_finished())
    }

    /// Parameters of the running task, if any.
    pub fn params(&self) -> Option<Arc<RefreshParams>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).as_ref().map(|r| r.params.get())
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        let running = self.running.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = running.take() {
            running.task.abort();
        }
    }
}

async fn run(hub: StateHub, params: DynamicConfig<RefreshParams>, mut stop: watch::Receiver<bool>) {
    loop {
        let current = params.get();
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = hub.activity().rearmed() => continue,
            _ = tokio::time::sleep(current.interval) => {}
        }
        let event = tokio::select! {
            biased;
            _ = stop.changed() => break,
            event = tick(&hub, &current) => event,
        };
        hub.sink().emit(GovernorEvent::Refresh(event)).await;
    }
}

/// One refresh decision: skip when real traffic is recent, otherwise fetch
/// and apply.
pub(crate) async fn tick(hub: &StateHub, params: &RefreshParams) -> RefreshEvent {
    let now = hub.store().clock().now_millis();
    let last = hub.activity().last_real_update();
    if !should_refresh(now, last, params.interval) {
        let since_update = Duration::from_millis(now.saturating_sub(last.unwrap_or(now)));
        tracing::trace!(
            target: "quotakeeper::refresher",
            bucket = %params.bucket,
            since_update_ms = since_update.as_millis() as u64,
            "refresh skipped"
        );
        return RefreshEvent::Skipped { bucket: params.bucket.clone(), since_update };
    }

    match params.source.fetch(&params.bucket).await {
        Ok(snapshot) => {
            hub.apply(&params.bucket, snapshot, UpdateSource::Refresh);
            RefreshEvent::Completed { bucket: params.bucket.clone() }
        }
        Err(error) => {
            tracing::warn!(
                target: "quotakeeper::refresher",
                bucket = %params.bucket,
                error = %error,
                "refresh failed"
            );
            RefreshEvent::Failed { bucket: params.bucket.clone(), error: error.to_string() }
        }
    }
}
