//! Cross-process bridge.
//!
//! A publisher process serves its bucket updates on a local Unix socket as
//! JSON lines, one [`BridgeMessage`] per line. Subscribers replay each line
//! into their own store and listeners, so a dashboard in another process sees
//! the same updates a local listener would. Short-lived tools can also push a
//! single reading to a publisher with [`emit_update`].
//!
//! The channel is local, unauthenticated and lossy. Each message carries a full
//! reading rather than a delta, so a reader that falls behind resynchronizes
//! on the next one.

use crate::bucket::BucketState;
use crate::config::ConfigError;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::io;

#[cfg(unix)]
mod socket;

#[cfg(unix)]
pub use socket::{emit_update, BridgePublisher, BridgeSubscriber};

/// One bucket reading on the wire.
///
/// `reset_at` is also accepted under the older key `reset_ts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub bucket: String,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub remaining: Option<i64>,
    #[serde(default, alias = "reset_ts")]
    pub reset_at: Option<u64>,
    /// When the sender recorded the reading, Unix millis.
    #[serde(default)]
    pub observed_at: Option<u64>,
}

impl BridgeMessage {
    /// A message carrying `snapshot` for `bucket`.
    pub fn new(bucket: impl Into<String>, snapshot: Snapshot) -> Self {
        Self {
            bucket: bucket.into(),
            limit: snapshot.limit,
            remaining: snapshot.remaining,
            reset_at: snapshot.reset_at,
            observed_at: None,
        }
    }

    /// Build a message straight from `X-RateLimit-*` response headers.
    pub fn from_headers<'a, I>(bucket: impl Into<String>, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self::new(bucket, Snapshot::from_headers(headers))
    }

    /// The message a publisher sends for a stored state. Unknown fields are
    /// left out.
    pub fn from_state(state: &BucketState) -> Self {
        Self {
            bucket: state.name.clone(),
            limit: (state.limit > 0).then_some(state.limit),
            remaining: state.remaining.map(|r| i64::try_from(r).unwrap_or(i64::MAX)),
            reset_at: (state.reset_at > 0).then_some(state.reset_at),
            observed_at: Some(state.last_updated_at),
        }
    }

    pub fn with_observed_at(mut self, millis: u64) -> Self {
        self.observed_at = Some(millis);
        self
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot { limit: self.limit, remaining: self.remaining, reset_at: self.reset_at }
    }

    /// Serialize as a single newline-terminated JSON line.
    pub fn encode_line(&self) -> Result<String, BridgeError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line. Surrounding whitespace is ignored; a blank bucket name
    /// is rejected.
    pub fn decode_line(line: &str) -> Result<Self, BridgeError> {
        let message: BridgeMessage = serde_json::from_str(line.trim())?;
        if message.bucket.trim().is_empty() {
            return Err(BridgeError::InvalidMessage("empty bucket name".into()));
        }
        Ok(message)
    }
}

/// Bridge failures. None of these are fatal to the governor: it keeps
/// working in-process when the bridge cannot run.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("bridge disabled")]
    Disabled,
    #[error("bridge endpoint {endpoint} unavailable: {source}")]
    Unavailable {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("bridge io error: {0}")]
    Io(#[from] io::Error),
    #[error("bridge message codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("invalid bridge message: {0}")]
    InvalidMessage(String),
    #[error("invalid bridge configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("local sockets are not supported on this platform")]
    Unsupported,
}

impl BridgeError {
    /// The endpoint involved, for errors that name one.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            BridgeError::Unavailable { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_keys_match_protocol() {
        let msg = BridgeMessage::new("core", Snapshot::new(60, 12, 1_700_000_000)).with_observed_at(5);
        let value: serde_json::Value = serde_json::from_str(&msg.encode_line().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "bucket": "core",
                "limit": 60,
                "remaining": 12,
                "reset_at": 1_700_000_000u64,
                "observed_at": 5
            })
        );
    }

    #[test]
    fn encoded_message_is_one_line() {
        let line = BridgeMessage::new("search", Snapshot::new(30, 1, 9)).encode_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn decodes_legacy_reset_key_and_nulls() {
        let msg = BridgeMessage::decode_line(
            r#"{"bucket": "graphql", "limit": null, "remaining": 4999, "reset_ts": 1700000000}"#,
        )
        .unwrap();
        assert_eq!(msg.limit, None);
        assert_eq!(msg.remaining, Some(4999));
        assert_eq!(msg.reset_at, Some(1_700_000_000));
        assert_eq!(msg.observed_at, None);
    }

    #[test]
    fn rejects_garbage_and_blank_buckets() {
        assert!(matches!(BridgeMessage::decode_line("not json"), Err(BridgeError::Codec(_))));
        assert!(matches!(
            BridgeMessage::decode_line(r#"{"bucket": " "}"#),
            Err(BridgeError::InvalidMessage(_))
        ));
    }

    #[test]
    fn from_state_omits_unknown_fields() {
        let state = BucketState {
            name: "core".into(),
            limit: 0,
            remaining: None,
            reset_at: 0,
            last_updated_at: 42,
        };
        let msg = BridgeMessage::from_state(&state);
        assert_eq!(msg.limit, None);
        assert_eq!(msg.reset_at, None);
        assert_eq!(msg.remaining, None);
        assert_eq!(msg.observed_at, Some(42));
    }

    #[test]
    fn from_headers_reads_rate_limit_headers() {
        let msg = BridgeMessage::from_headers(
            "core",
            [("X-RateLimit-Limit", "5000"), ("X-RateLimit-Remaining", "17")],
        );
        assert_eq!(msg.to_snapshot(), Snapshot { limit: Some(5000), remaining: Some(17), reset_at: None });
    }
}
