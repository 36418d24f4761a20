use super::events::GovernorEvent;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

/// A telemetry sink that consumes governor events.
pub trait TelemetrySink:
    tower::Service<GovernorEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: GovernorEvent)
where
    S: tower::Service<GovernorEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

type EmitFn = dyn Fn(GovernorEvent) -> BoxFuture<'static, ()> + Send + Sync;

/// Type-erased handle to a caller-supplied sink, shared by the governor and
/// its background tasks. Defaults to [`NullSink`].
#[derive(Clone)]
pub struct SinkHandle {
    emit: Arc<EmitFn>,
}

impl fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SinkHandle(<sink>)")
    }
}

impl Default for SinkHandle {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl SinkHandle {
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        Self {
            emit: Arc::new(move |event| -> BoxFuture<'static, ()> {
                Box::pin(emit_best_effort(sink.clone(), event))
            }),
        }
    }

    /// Deliver `event` and wait for the sink to accept it.
    pub async fn emit(&self, event: GovernorEvent) {
        (self.emit)(event).await;
    }

    /// Deliver `event` from synchronous code. Spawns onto the current tokio
    /// runtime; the event is dropped when called outside one.
    pub fn emit_detached(&self, event: GovernorEvent) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn((self.emit)(event));
        }
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<GovernorEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: GovernorEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<GovernorEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GovernorEvent) -> Self::Future {
        match &event {
            GovernorEvent::Throttle(_) | GovernorEvent::KillSwitch(_) => {
                tracing::warn!(target: "quotakeeper::telemetry", event = %event, "governor_event")
            }
            GovernorEvent::Listener(_) | GovernorEvent::Bridge(_) => {
                tracing::info!(target: "quotakeeper::telemetry", event = %event, "governor_event")
            }
            _ => tracing::debug!(target: "quotakeeper::telemetry", event = %event, "governor_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory, evicting the oldest beyond capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<GovernorEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<GovernorEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<GovernorEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GovernorEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// A telemetry sink that rebroadcasts events to any number of live receivers,
/// e.g. a dashboard task.
///
/// ```rust
/// use quotakeeper::telemetry::{GovernorEvent, KillSwitchEvent, StreamingSink};
/// use tower::Service;
///
/// # #[tokio::main]
/// # async fn main() {
/// let sink = StreamingSink::new(64);
/// let mut receiver = sink.subscribe();
///
/// sink.clone().call(GovernorEvent::KillSwitch(KillSwitchEvent::Cleared)).await.unwrap();
///
/// assert_eq!(receiver.recv().await.unwrap(), GovernorEvent::KillSwitch(KillSwitchEvent::Cleared));
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: tokio::sync::broadcast::Sender<GovernorEvent>,
    dropped: Arc<AtomicU64>,
}

impl StreamingSink {
    /// Slow receivers skip the oldest events once `capacity` is buffered.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<GovernorEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events sent while nobody was subscribed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<GovernorEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GovernorEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for StreamingSink {
    type SinkError = Infallible;
}
