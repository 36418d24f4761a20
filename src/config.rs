//! Governor configuration.
//!
//! Everything here is a plain value built once and passed by value: the
//! governor never mutates its configuration, and per-call adjustments travel in
//! [`CallOptions`] rather than being stored.

use crate::throttle::ThrottleConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Bucket used when a call does not name one.
pub const DEFAULT_BUCKET: &str = "core";
/// Environment variable naming the bridge socket; `none` or empty disables the bridge.
pub const SOCKET_ENV: &str = "QUOTAKEEPER_SOCKET";
/// Bridge socket used when [`SOCKET_ENV`] is unset.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/quotakeeper.sock";
/// Messages buffered per bridge reader before it starts missing updates.
pub const DEFAULT_BRIDGE_CAPACITY: usize = 256;

/// Errors produced when validating configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("soft_floor_fraction must be a finite value in 0.0..=1.0 (got {0})")]
    InvalidSoftFloorFraction(f64),
    #[error("default bucket name must not be empty")]
    EmptyBucketName,
    #[error("bridge channel capacity must be > 0")]
    InvalidBridgeCapacity,
}

/// Validated configuration for a [`QuotaGovernor`](crate::QuotaGovernor).
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    throttle: ThrottleConfig,
    bucket_overrides: HashMap<String, ThrottleConfig>,
    default_bucket: String,
    throttling_enabled: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            throttle: ThrottleConfig::default(),
            bucket_overrides: HashMap::new(),
            default_bucket: DEFAULT_BUCKET.to_string(),
            throttling_enabled: true,
        }
    }
}

impl GovernorConfig {
    pub fn builder() -> GovernorConfigBuilder {
        GovernorConfigBuilder::default()
    }

    /// Soft-floor parameters applied to buckets without an override.
    pub fn throttle(&self) -> &ThrottleConfig {
        &self.throttle
    }

    /// Soft-floor parameters for `bucket`, honouring per-bucket overrides.
    pub fn throttle_for(&self, bucket: &str) -> &ThrottleConfig {
        self.bucket_overrides.get(bucket).unwrap_or(&self.throttle)
    }

    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    /// When false, the soft-floor throttle is bypassed; the killswitch still applies.
    pub fn throttling_enabled(&self) -> bool {
        self.throttling_enabled
    }
}

/// Builder for [`GovernorConfig`].
#[derive(Debug, Clone, Default)]
pub struct GovernorConfigBuilder {
    config: GovernorConfig,
}

impl GovernorConfigBuilder {
    pub fn throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.config.throttle = throttle;
        self
    }

    /// Use `throttle` for `bucket` instead of the default parameters.
    pub fn bucket_override(mut self, bucket: impl Into<String>, throttle: ThrottleConfig) -> Self {
        self.config.bucket_overrides.insert(bucket.into(), throttle);
        self
    }

    pub fn default_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.default_bucket = bucket.into();
        self
    }

    pub fn throttling_enabled(mut self, enabled: bool) -> Self {
        self.config.throttling_enabled = enabled;
        self
    }

    pub fn build(self) -> Result<GovernorConfig, ConfigError> {
        if self.config.default_bucket.trim().is_empty() {
            return Err(ConfigError::EmptyBucketName);
        }
        Ok(self.config)
    }
}

/// Per-call options for governed operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    /// Bucket to charge; the governor's default bucket when `None`.
    pub bucket: Option<String>,
    /// Longest acceptable throttle wait; unbounded when `None`.
    pub max_wait: Option<Duration>,
    /// Soft-floor parameters for this call only.
    pub throttle: Option<ThrottleConfig>,
}

impl CallOptions {
    pub fn bucket(bucket: impl Into<String>) -> Self {
        Self { bucket: Some(bucket.into()), ..Self::default() }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = Some(throttle);
        self
    }
}

/// Where and how the cross-process bridge runs.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Local socket path; `None` disables the bridge.
    pub socket_path: Option<PathBuf>,
    /// Per-reader buffer; a reader further behind than this skips to newer updates.
    pub channel_capacity: usize,
    /// Subscriber re-dial delay after the publisher goes away; no re-dial when `None`.
    pub reconnect_delay: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: Some(PathBuf::from(DEFAULT_SOCKET_PATH)),
            channel_capacity: DEFAULT_BRIDGE_CAPACITY,
            reconnect_delay: None,
        }
    }
}

impl BridgeConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { socket_path: Some(path.into()), ..Self::default() }
    }

    pub fn disabled() -> Self {
        Self { socket_path: None, ..Self::default() }
    }

    /// Read the socket path from [`SOCKET_ENV`].
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(SOCKET_ENV).ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None => Self::default(),
            Some("") => Self::disabled(),
            Some(v) if v.eq_ignore_ascii_case("none") => Self::disabled(),
            Some(v) => Self::at(v),
        }
    }

    pub fn with_reconnect(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidBridgeCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_per_bucket() {
        let search = ThrottleConfig::new(0.5, 2, Duration::from_secs(1)).unwrap();
        let config = GovernorConfig::builder().bucket_override("search", search).build().unwrap();
        assert_eq!(*config.throttle_for("search"), search);
        assert_eq!(*config.throttle_for("core"), ThrottleConfig::default());
        assert_eq!(config.default_bucket(), "core");
        assert!(config.throttling_enabled());
    }

    #[test]
    fn empty_default_bucket_is_rejected() {
        let err = GovernorConfig::builder().default_bucket("  ").build().unwrap_err();
        assert_eq!(err, ConfigError::EmptyBucketName);
    }

    #[test]
    fn bridge_env_values() {
        assert_eq!(BridgeConfig::from_env_value(None), BridgeConfig::default());
        assert_eq!(BridgeConfig::from_env_value(Some("none")).socket_path, None);
        assert_eq!(BridgeConfig::from_env_value(Some("")).socket_path, None);
        assert_eq!(
            BridgeConfig::from_env_value(Some("/run/q.sock")).socket_path,
            Some(PathBuf::from("/run/q.sock"))
        );
    }

    #[test]
    fn zero_bridge_capacity_is_invalid() {
        let cfg = BridgeConfig { channel_capacity: 0, ..BridgeConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidBridgeCapacity));
    }
}
