use super::{BridgeError, BridgeMessage};
use crate::config::BridgeConfig;
use crate::hub::StateHub;
use crate::listener::{BroadcastListener, BucketUpdate, SubscriptionId};
use crate::telemetry::{BridgeEvent, GovernorEvent, UpdateSource};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Upper bound on a one-shot [`emit_update`].
pub const EMIT_TIMEOUT: Duration = Duration::from_secs(1);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

fn endpoint_of(path: &Path) -> String {
    path.display().to_string()
}

fn unavailable(path: &Path, source: io::Error) -> BridgeError {
    BridgeError::Unavailable { endpoint: endpoint_of(path), source }
}

/// Serves this process's bucket updates to any number of local readers and
/// ingests lines that peers send back.
///
/// Each reader gets its own bounded buffer. A stalled reader only loses
/// intermediate updates; it never holds up other readers or governed calls.
#[derive(Debug)]
pub struct BridgePublisher {
    path: PathBuf,
    hub: StateHub,
    subscription: SubscriptionId,
    peers: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
    closed: bool,
}

impl BridgePublisher {
    /// Bind the socket named by `config` and start accepting readers.
    ///
    /// A leftover socket file from a dead publisher is replaced; a live one is
    /// reported as unavailable.
    pub async fn bind(hub: StateHub, config: &BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let path = config.socket_path.clone().ok_or(BridgeError::Disabled)?;

        if path.exists() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(unavailable(
                    &path,
                    io::Error::new(io::ErrorKind::AddrInUse, "another publisher is serving this endpoint"),
                ));
            }
            std::fs::remove_file(&path).map_err(|e| unavailable(&path, e))?;
        }
        let listener = UnixListener::bind(&path).map_err(|e| unavailable(&path, e))?;

        let feed = BroadcastListener::new(config.channel_capacity);
        let subscription = hub.listeners().subscribe_listener(Arc::new(feed.clone()));
        let (shutdown, stopped) = watch::channel(false);
        let peers = Arc::new(AtomicUsize::new(0));
        let accept = tokio::spawn(accept_loop(listener, hub.clone(), feed, peers.clone(), stopped));

        tracing::info!(target: "quotakeeper::bridge", endpoint = %path.display(), "bridge publisher listening");
        Ok(Self { path, hub, subscription, peers, shutdown, accept, closed: false })
    }

    pub fn endpoint(&self) -> &Path {
        &self.path
    }

    /// Readers currently connected.
    pub fn peers(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        !self.closed && !self.accept.is_finished()
    }

    /// Stop accepting, disconnect readers, and remove the socket file.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.shutdown.send(true);
        self.accept.abort();
        self.hub.listeners().unsubscribe(self.subscription);
        let _ = std::fs::remove_file(&self.path);
        tracing::info!(target: "quotakeeper::bridge", endpoint = %self.path.display(), "bridge publisher stopped");
    }
}

impl Drop for BridgePublisher {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: UnixListener,
    hub: StateHub,
    feed: BroadcastListener,
    peers: Arc<AtomicUsize>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stopped.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    // subscribe before spawning so nothing published after accept is missed
                    let updates = feed.subscribe();
                    let count = peers.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::debug!(target: "quotakeeper::bridge", peers = count, "bridge peer connected");
                    hub.sink().emit(GovernorEvent::Bridge(BridgeEvent::PeerConnected { peers: count })).await;
                    tokio::spawn(serve_peer(stream, hub.clone(), updates, peers.clone(), stopped.clone()));
                }
                Err(error) => {
                    tracing::warn!(target: "quotakeeper::bridge", error = %error, "bridge accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

async fn serve_peer(
    stream: UnixStream,
    hub: StateHub,
    mut updates: broadcast::Receiver<BucketUpdate>,
    peers: Arc<AtomicUsize>,
    mut stopped: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            biased;
            _ = stopped.changed() => break,
            update = updates.recv() => match update {
                Ok(update) => {
                    let line = match BridgeMessage::from_state(&update.state).encode_line() {
                        Ok(line) => line,
                        Err(error) => {
                            tracing::warn!(target: "quotakeeper::bridge", error = %error, "bridge encode failed");
                            continue;
                        }
                    };
                    let written = tokio::select! {
                        biased;
                        _ = stopped.changed() => break,
                        written = write_half.write_all(line.as_bytes()) => written,
                    };
                    if written.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(target: "quotakeeper::bridge", missed, "bridge reader lagged");
                    hub.sink().emit(GovernorEvent::Bridge(BridgeEvent::ReaderLagged { missed })).await;
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => ingest(&hub, &line).await,
                Ok(None) | Err(_) => break,
            },
        }
    }

    let count = peers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    tracing::debug!(target: "quotakeeper::bridge", peers = count, "bridge peer disconnected");
    hub.sink().emit(GovernorEvent::Bridge(BridgeEvent::PeerDisconnected { peers: count })).await;
}

/// Apply one received line to the local store and listeners.
async fn ingest(hub: &StateHub, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match BridgeMessage::decode_line(line) {
        Ok(message) => {
            hub.apply_observed(&message.bucket, message.to_snapshot(), UpdateSource::Bridge, message.observed_at);
        }
        Err(error) => {
            tracing::debug!(target: "quotakeeper::bridge", error = %error, "dropping invalid bridge line");
            hub.sink()
                .emit(GovernorEvent::Bridge(BridgeEvent::InvalidMessage { error: error.to_string() }))
                .await;
        }
    }
}

/// Reads a publisher's feed into the local store and listeners.
#[derive(Debug)]
pub struct BridgeSubscriber {
    path: PathBuf,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BridgeSubscriber {
    /// Dial the publisher named by `config`. The first dial must succeed; with
    /// `reconnect_delay` set, later disconnects are followed by re-dials.
    pub async fn connect(hub: StateHub, config: &BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let path = config.socket_path.clone().ok_or(BridgeError::Disabled)?;
        let stream = UnixStream::connect(&path).await.map_err(|e| unavailable(&path, e))?;

        let connected = Arc::new(AtomicBool::new(true));
        let (shutdown, stopped) = watch::channel(false);
        let task = tokio::spawn(follow(
            hub,
            path.clone(),
            stream,
            config.reconnect_delay,
            connected.clone(),
            stopped,
        ));
        tracing::info!(target: "quotakeeper::bridge", endpoint = %path.display(), "bridge subscriber connected");
        Ok(Self { path, connected, shutdown, task })
    }

    pub fn endpoint(&self) -> &Path {
        &self.path
    }

    /// Whether the subscriber is currently attached to a publisher.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Whether the subscriber is still running, connected or re-dialing.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop reading; pending reads and re-dials are abandoned.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for BridgeSubscriber {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

async fn follow(
    hub: StateHub,
    path: PathBuf,
    mut stream: UnixStream,
    reconnect_delay: Option<Duration>,
    connected: Arc<AtomicBool>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        let mut lines = BufReader::new(stream).lines();
        loop {
            tokio::select! {
                biased;
                _ = stopped.changed() => return,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => ingest(&hub, &line).await,
                    Ok(None) | Err(_) => break,
                },
            }
        }
        connected.store(false, Ordering::SeqCst);
        tracing::info!(target: "quotakeeper::bridge", endpoint = %path.display(), "bridge publisher went away");

        let Some(delay) = reconnect_delay else {
            return;
        };
        stream = loop {
            tokio::select! {
                biased;
                _ = stopped.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match UnixStream::connect(&path).await {
                Ok(stream) => break stream,
                Err(error) => {
                    tracing::trace!(target: "quotakeeper::bridge", error = %error, "bridge re-dial failed");
                }
            }
        };
        connected.store(true, Ordering::SeqCst);
        tracing::info!(target: "quotakeeper::bridge", endpoint = %path.display(), "bridge subscriber reconnected");
    }
}

/// Send one message to the publisher at `path` and disconnect.
pub async fn emit_update(path: impl AsRef<Path>, message: &BridgeMessage) -> Result<(), BridgeError> {
    let path = path.as_ref();
    let line = message.encode_line()?;
    let send = async {
        let mut stream = UnixStream::connect(path).await?;
        stream.write_all(line.as_bytes()).await?;
        stream.shutdown().await
    };
    match tokio::time::timeout(EMIT_TIMEOUT, send).await {
        Ok(result) => result.map_err(|e| unavailable(path, e)),
        Err(_) => Err(unavailable(path, io::Error::new(io::ErrorKind::TimedOut, "bridge emit timed out"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketStore;
    use crate::listener::ListenerRegistry;
    use crate::snapshot::Snapshot;

    fn hub() -> StateHub {
        StateHub::new(BucketStore::new(), ListenerRegistry::new())
    }

    #[tokio::test]
    async fn disabled_config_is_reported() {
        let err = BridgePublisher::bind(hub(), &BridgeConfig::disabled()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Disabled));
        let err = BridgeSubscriber::connect(hub(), &BridgeConfig::disabled()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Disabled));
    }

    #[tokio::test]
    async fn missing_publisher_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let err = BridgeSubscriber::connect(hub(), &BridgeConfig::at(&path)).await.unwrap_err();
        assert_eq!(err.endpoint(), Some(path.display().to_string().as_str()));

        let message = BridgeMessage::new("core", Snapshot::new(60, 1, 2));
        assert!(emit_update(&path, &message).await.is_err());
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced_and_removed_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let publisher = BridgePublisher::bind(hub(), &BridgeConfig::at(&path)).await.unwrap();
        assert!(publisher.is_active());
        publisher.shutdown();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn second_publisher_on_live_endpoint_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.sock");
        let _first = BridgePublisher::bind(hub(), &BridgeConfig::at(&path)).await.unwrap();
        let err = BridgePublisher::bind(hub(), &BridgeConfig::at(&path)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable { .. }));
    }
}
