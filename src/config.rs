//! Timing policy and host settings.
//!
//! The defaults are the fixed field policy: retry every 5 s, give an
//! association attempt 10 s (checked once per second), stop after 3
//! consecutive failures, pause 100 ms after a control-channel error.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Spacing between uplink loop cycles, whatever their outcome.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on a single association attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Granularity at which an association attempt is polled.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between forcing a disassociation and starting a new attempt.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Consecutive failed attempts before the uplink is exhausted.
pub const MAX_RETRIES: u32 = 3;

/// BLE advertising interval.
pub const ADVERTISING_INTERVAL: Duration = Duration::from_millis(250);

/// Pause before the control-channel loops retry after an error.
pub const ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Status display refresh period.
pub const DISPLAY_INTERVAL: Duration = Duration::from_secs(2);

/// What the uplink does once `max_retries` consecutive attempts failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Log and stop retrying for good; the uplink task ends.
    Stop,
    /// Wait for the given time (cut short by a credential update), then reset
    /// the failure count and resume.
    Backoff(Duration),
}

/// Uplink reconnection policy.
#[derive(Debug, Clone, Copy)]
pub struct UplinkConfig {
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub max_retries: u32,
    pub exhaustion: ExhaustionPolicy,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            retry_interval: RETRY_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            settle_delay: SETTLE_DELAY,
            max_retries: MAX_RETRIES,
            exhaustion: ExhaustionPolicy::Stop,
        }
    }
}

impl UplinkConfig {
    /// Default policy, but resume after `backoff` instead of stopping.
    pub fn with_backoff(backoff: Duration) -> Self {
        Self {
            exhaustion: ExhaustionPolicy::Backoff(backoff),
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be > 0"));
        }
        if self.connect_timeout < self.poll_interval {
            return Err(ConfigError::Invalid(
                "connect_timeout must be >= poll_interval",
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::Invalid("retry_interval must be > 0"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be > 0"));
        }
        if let ExhaustionPolicy::Backoff(backoff) = self.exhaustion {
            if backoff.is_zero() {
                return Err(ConfigError::Invalid("exhaustion backoff must be > 0"));
            }
        }
        Ok(())
    }

    /// Number of polls that fit in one association attempt.
    pub fn polls_per_attempt(&self) -> u32 {
        let polls = self.connect_timeout.as_millis() / self.poll_interval.as_millis().max(1);
        polls.clamp(1, u32::MAX as u128) as u32
    }
}

/// Control-channel timing.
#[derive(Debug, Clone, Copy)]
pub struct ControlConfig {
    pub advertising_interval: Duration,
    pub error_pause: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            advertising_interval: ADVERTISING_INTERVAL,
            error_pause: ERROR_PAUSE,
        }
    }
}

impl ControlConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // BLE allows 20 ms .. 10.24 s advertising intervals.
        if self.advertising_interval < Duration::from_millis(20)
            || self.advertising_interval > Duration::from_millis(10_240)
        {
            return Err(ConfigError::Invalid(
                "advertising_interval must be within 20ms..=10.24s",
            ));
        }
        Ok(())
    }
}

/// Settings the host binary reads from the environment.
#[derive(Debug, Clone)]
pub struct HostSettings {
    /// Credential document location (`NODE_CONFIG_PATH`).
    pub config_path: PathBuf,
    /// Hardware address to derive the identity from (`NODE_MAC`).
    pub mac: Option<[u8; 6]>,
    /// Uplink policy (`NODE_UPLINK_BACKOFF_SECS` selects the backoff variant).
    pub uplink: UplinkConfig,
}

impl HostSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup` (for tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config_path = match lookup("NODE_CONFIG_PATH") {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => {
                let home = lookup("HOME").ok_or(ConfigError::Invalid(
                    "HOME not set and NODE_CONFIG_PATH not given",
                ))?;
                PathBuf::from(home).join(".sensor-link").join("config.json")
            }
        };

        let mac = lookup("NODE_MAC")
            .map(|value| crate::identity::parse_mac(&value))
            .transpose()
            .map_err(|_| ConfigError::Invalid("NODE_MAC must look like AA:BB:CC:DD:EE:FF"))?;

        let uplink = match lookup("NODE_UPLINK_BACKOFF_SECS") {
            Some(secs) => {
                let secs: u64 = secs
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid("NODE_UPLINK_BACKOFF_SECS must be a number"))?;
                UplinkConfig::with_backoff(Duration::from_secs(secs))
            }
            None => UplinkConfig::default(),
        };
        uplink.validate()?;

        Ok(Self {
            config_path,
            mac,
            uplink,
        })
    }
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
