//! Session configuration and persisted delta state
//!
//! Preferences are passed into a session explicitly; nothing here is global.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Default device clock tolerance in minutes
pub const DEFAULT_TIME_TOLERANCE_MINUTES: i64 = 15;

/// Which records to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// Everything the device holds
    All,
    /// Only records after the stored `lastEndPosition`
    Delta,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::All => "all",
            Period::Delta => "delta",
        }
    }
}

impl Default for Period {
    fn default() -> Self {
        Period::All
    }
}

/// Bounded retry for transient errors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts for handshakes and commands
    pub attempts: u32,
    /// Attempts per ASTM frame before giving up
    pub frame_attempts: u32,
    /// Pause between attempts in milliseconds
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            frame_attempts: 6,
            backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Per-family response timeouts in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    pub dexcom_ms: u64,
    pub bayer_ms: u64,
    pub onetouch_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            dexcom_ms: 1000,
            bayer_ms: 5000,
            onetouch_ms: 2000,
        }
    }
}

/// Preferences for one upload session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// IANA timezone the user selected
    pub timezone: String,
    pub period: Period,
    /// Write the reference time to the device when its clock is off
    pub set_device_time: bool,
    pub time_tolerance_minutes: i64,
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
    /// Uploader version stamped into `SessionInfo`
    pub version: String,
    /// Upload batch size
    pub batch_size: usize,
    /// Offset rounding granularity in minutes
    pub offset_rounding_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            period: Period::All,
            set_device_time: false,
            time_tolerance_minutes: DEFAULT_TIME_TOLERANCE_MINUTES,
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            version: format!("uplink {}", env!("CARGO_PKG_VERSION")),
            batch_size: crate::upload::DEFAULT_BATCH_SIZE,
            offset_rounding_minutes: crate::timezone::DEFAULT_ROUNDING_MINUTES,
        }
    }
}

impl SessionConfig {
    pub fn new(timezone: &str) -> Self {
        Self {
            timezone: timezone.to_string(),
            ..Self::default()
        }
    }

    pub fn with_period(mut self, period: Period) -> Self {
        self.period = period;
        self
    }

    pub fn with_set_device_time(mut self, enabled: bool) -> Self {
        self.set_device_time = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_offset_rounding(mut self, minutes: i64) -> Self {
        self.offset_rounding_minutes = minutes;
        self
    }

    /// Load configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "unknown timezone {}",
                self.timezone
            )));
        }
        if self.offset_rounding_minutes <= 0 || 60 % self.offset_rounding_minutes != 0 {
            return Err(ConfigError::Invalid(format!(
                "offset rounding must divide 60, got {}",
                self.offset_rounding_minutes
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be positive".to_string()));
        }
        Ok(())
    }
}

/// Persisted `deviceId -> lastEndPosition` map for delta uploads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaStore {
    positions: BTreeMap<String, u64>,
}

impl DeltaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_end_position(&self, device_id: &str) -> Option<u64> {
        self.positions.get(device_id).copied()
    }

    pub fn record(&mut self, device_id: &str, last_end_position: u64) {
        self.positions
            .insert(device_id.to_string(), last_end_position);
    }

    pub fn forget(&mut self, device_id: &str) -> Option<u64> {
        self.positions.remove(device_id)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Load delta store from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize delta store to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Load from disk; a missing file is an empty store
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json).map_err(|e| ConfigError::Invalid(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = self
            .to_json()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.period, Period::All);
        assert_eq!(config.time_tolerance_minutes, 15);
        assert_eq!(config.retry.frame_attempts, 6);
        assert_eq!(config.batch_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            SessionConfig::from_json(r#"{"timezone": "US/Eastern", "period": "delta"}"#).unwrap();
        assert_eq!(config.timezone, "US/Eastern");
        assert_eq!(config.period, Period::Delta);
        assert!(!config.set_device_time);
        assert_eq!(config.timeouts.bayer_ms, 5000);
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        let err = SessionConfig::from_json(r#"{"timezone": "Mars/Olympus"}"#).unwrap_err();
        assert!(err.to_string().contains("Mars/Olympus"));
    }

    #[test]
    fn test_bad_rounding_rejected() {
        let config = SessionConfig::new("UTC").with_offset_rounding(7);
        assert!(config.validate().is_err());
        assert!(SessionConfig::new("UTC").with_offset_rounding(30).validate().is_ok());
    }

    #[test]
    fn test_delta_store_serialization() {
        let mut store = DeltaStore::new();
        store.record("DexG4Rec-SM123", 41);
        let json = store.to_json().unwrap();
        let restored = DeltaStore::from_json(&json).unwrap();
        assert_eq!(restored.last_end_position("DexG4Rec-SM123"), Some(41));
        assert_eq!(restored.last_end_position("other"), None);
    }

    #[test]
    fn test_delta_store_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delta.json");

        let empty = DeltaStore::load(&path).unwrap();
        assert!(empty.is_empty());

        let mut store = DeltaStore::new();
        store.record("InsOmn-1", 9);
        store.save(&path).unwrap();
        assert_eq!(DeltaStore::load(&path).unwrap().last_end_position("InsOmn-1"), Some(9));
    }
}
