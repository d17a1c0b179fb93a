//! Runtime configuration for the detector and the broadcast layer.
//!
//! Durations are written as float seconds (`heartbeat_period: 2.5`), the
//! same unit the runtime's tuning parameters have always used.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// Default time without a heartbeat before the observed daemon is reported.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shortest accepted period or timeout; the detector counts whole
/// milliseconds.
pub const MIN_DETECTOR_DURATION: Duration = Duration::from_millis(1);

/// Broadcast frames at least this large are zlib-compressed.
pub const DEFAULT_COMPRESS_LIMIT: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("heartbeat_period must be at least 1 ms")]
    PeriodTooShort,
    #[error("heartbeat_timeout must be at least 1 ms")]
    TimeoutTooShort,
}

/// Ring failure detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Run the ring detector at all (default: true)
    pub enabled: bool,
    /// How often to heartbeat our observer (default: 5s)
    #[serde(with = "duration_secs")]
    pub heartbeat_period: Duration,
    /// Silence after which the observed daemon is reported (default: 10s)
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

impl DetectorConfig {
    /// Check the settings can drive a detector.
    ///
    /// A timeout shorter than the period is accepted but almost always
    /// produces false suspicions, so it is logged.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_period < MIN_DETECTOR_DURATION {
            return Err(ConfigError::PeriodTooShort);
        }
        if self.heartbeat_timeout < MIN_DETECTOR_DURATION {
            return Err(ConfigError::TimeoutTooShort);
        }
        if self.heartbeat_timeout < self.heartbeat_period {
            warn!(
                period = ?self.heartbeat_period,
                timeout = ?self.heartbeat_timeout,
                "heartbeat timeout is shorter than the period; expect false suspicions"
            );
        }
        Ok(())
    }
}

/// Reliable broadcast settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Minimum frame size in bytes before compression is attempted
    pub compress_limit: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            compress_limit: DEFAULT_COMPRESS_LIMIT,
        }
    }
}

/// All settings for one daemon's fault core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingwatchConfig {
    pub detector: DetectorConfig,
    pub broadcast: BroadcastConfig,
}

impl RingwatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detector.validate()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
