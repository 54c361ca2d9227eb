//! Tunable thresholds for every stage of the tracking pipeline.
//!
//! All configs deserialize from JSON with per-field defaults, so a host app
//! only needs to override what it cares about.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// Thresholds for the sample filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Samples reporting worse horizontal accuracy are discarded outright.
    /// Default: 100m
    pub max_accuracy_meters: f64,
    /// Minimum movement before a sample becomes a route point.
    /// Default: 5m
    pub min_move_meters: f64,
    /// Lower bound on the accuracy term of the adaptive threshold.
    /// Default: 5m
    pub min_accuracy_meters: f64,
    /// Movement at or below this is treated as GPS drift and never adds distance.
    /// Default: 3m
    pub drift_floor_meters: f64,
    /// Implied speed versus the last accepted sample above this is a jump.
    /// Default: 200 m/s
    pub max_plausible_speed_mps: f64,
    /// Raw samples retained for downstream map-matching before the oldest
    /// are dropped.
    /// Default: 5000
    pub raw_buffer_limit: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_accuracy_meters: 100.0,
            min_move_meters: 5.0,
            min_accuracy_meters: 5.0,
            drift_floor_meters: 3.0,
            max_plausible_speed_mps: 200.0,
            raw_buffer_limit: 5000,
        }
    }
}

/// Sliding window speed estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    /// Entries received longer ago than this are evicted. Default: 3000ms
    pub window_ms: i64,
    /// Hard ceiling for any speed reading. Default: 200 m/s
    pub max_plausible_speed_mps: f64,
    /// Safety cap on window length for very high update rates. Default: 64
    pub max_window_entries: usize,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            window_ms: 3_000,
            max_plausible_speed_mps: 200.0,
            max_window_entries: 64,
        }
    }
}

/// Stationary detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DwellConfig {
    /// Below this speed the detector starts counting toward a dwell.
    /// Default: 1.5 m/s
    pub stationary_speed_mps: f64,
    /// Low speed must hold this long before dwelling. Default: 5000ms
    pub debounce_ms: i64,
}

impl Default for DwellConfig {
    fn default() -> Self {
        Self {
            stationary_speed_mps: 1.5,
            debounce_ms: 5_000,
        }
    }
}

/// Checkpoint cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Minimum spacing between periodic checkpoints. Default: 5000ms
    pub interval_ms: i64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { interval_ms: 5_000 }
    }
}

/// Offline sync queue retry discipline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncQueueConfig {
    /// A request is abandoned once its retry count reaches this. Default: 5
    pub max_retries: u32,
    /// Base delay of the exponential backoff. Default: 1000ms
    pub backoff_base_ms: i64,
    /// Upper bound on any single backoff. Default: 60000ms
    pub backoff_cap_ms: i64,
    /// Pause between sends while draining. Default: 250ms
    pub inter_request_delay_ms: u64,
    /// How often the controller enqueues a progress sync. Default: 30000ms
    pub sync_interval_ms: i64,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            inter_request_delay_ms: 250,
            sync_interval_ms: 30_000,
        }
    }
}

/// Complete tracker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub filter: FilterConfig,
    pub speed: SpeedConfig,
    pub dwell: DwellConfig,
    pub checkpoint: CheckpointConfig,
    pub sync: SyncQueueConfig,
}

impl TrackerConfig {
    /// Parse a config from JSON, filling omitted fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrackerConfig = serde_json::from_str(json).map_err(|e| {
            TrackerError::Config {
                message: e.to_string(),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or invert the pipeline.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 8] = [
            (self.filter.max_accuracy_meters > 0.0, "filter.max_accuracy_meters must be > 0"),
            (self.filter.drift_floor_meters >= 0.0, "filter.drift_floor_meters must be >= 0"),
            (self.filter.max_plausible_speed_mps > 0.0, "filter.max_plausible_speed_mps must be > 0"),
            (self.speed.window_ms > 0, "speed.window_ms must be > 0"),
            (self.speed.max_window_entries >= 2, "speed.max_window_entries must be >= 2"),
            (self.dwell.debounce_ms >= 0, "dwell.debounce_ms must be >= 0"),
            (self.checkpoint.interval_ms >= 0, "checkpoint.interval_ms must be >= 0"),
            (
                self.sync.backoff_base_ms > 0 && self.sync.backoff_cap_ms >= self.sync.backoff_base_ms,
                "sync backoff must satisfy 0 < base <= cap",
            ),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(TrackerError::Config {
                message: message.to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(TrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TrackerConfig::from_json(r#"{"dwell": {"debounce_ms": 8000}}"#).unwrap();
        assert_eq!(config.dwell.debounce_ms, 8000);
        assert_eq!(config.dwell.stationary_speed_mps, 1.5);
        assert_eq!(config.filter.max_accuracy_meters, 100.0);
        assert_eq!(config.sync.max_retries, 5);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = TrackerConfig::from_json(r#"{"speed": {"window_ms": 0}}"#);
        assert!(matches!(result, Err(TrackerError::Config { .. })));

        let result = TrackerConfig::from_json("{not json");
        assert!(matches!(result, Err(TrackerError::Config { .. })));
    }
}
