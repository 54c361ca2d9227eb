//! # Trip Tracker
//!
//! Noise-tolerant live trip statistics for GPS tracking on mobile.
//!
//! This library provides:
//! - Accuracy, distance and speed gating of raw GPS samples
//! - Windowed position-derived speed estimation
//! - Debounced stationary ("dwell") detection that freezes drift
//! - Durable checkpoints shared between foreground and background contexts
//! - Foreground/background reconciliation and crash recovery
//! - A durable offline sync queue with priority and exponential backoff
//!
//! ## Features
//!
//! - **`http`** - Enable reqwest transport for the sync queue
//! - **`persistence`** - Enable SQLite key-value storage
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use trip_tracker::{LocationSample, TrackAccumulator, TrackerConfig};
//!
//! let mut tracker = TrackAccumulator::new(TrackerConfig::default());
//! tracker.start(0, None).unwrap();
//!
//! for i in 0..10 {
//!     let t = i * 1000;
//!     let sample = LocationSample::new(i as f64 * 0.0001, 0.0, t).with_accuracy(5.0);
//!     tracker.on_sample(sample, t).unwrap();
//! }
//!
//! let stats = tracker.stats(9_000).unwrap();
//! assert!(stats.distance_km > 0.09);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TrackerError};

// Pipeline configuration
pub mod config;
pub use config::{
    CheckpointConfig, DwellConfig, FilterConfig, SpeedConfig, SyncQueueConfig, TrackerConfig,
};

// Geographic utilities (haversine, unit conversion)
pub mod geo_utils;

// Accuracy / distance / speed gating
pub mod filter;
pub use filter::{FilterDecision, RejectReason, SampleFilter};

// Windowed speed estimation
pub mod speed;
pub use speed::{SpeedEstimator, WindowEntry};

// Stationary detection
pub mod dwell;
pub use dwell::{DwellDetector, DwellState};

// Session state machine
pub mod accumulator;
pub use accumulator::{SampleOutcome, TrackAccumulator, TrackSession};

// Key-value storage contract and backends
pub mod storage;
#[cfg(feature = "persistence")]
pub use storage::SqliteStore;
pub use storage::{FileStore, KeyValueStore, MemoryStore};

// Durable checkpoints
pub mod persistence;
pub use persistence::{CheckpointSource, CheckpointWrite, PersistedState, PersistenceBridge};

// Foreground/background merge
pub mod reconcile;
pub use reconcile::{ColdStart, ReconciliationService, ResumeOutcome};

// Background execution entry point
pub mod background;
pub use background::BackgroundTracker;

// Remote endpoints and response decoding
pub mod remote;
pub use remote::{HttpMethod, RemoteResponse, ResponseClass, SyncEndpoint, TripSyncReply};

// Offline request queue
pub mod sync_queue;
pub use sync_queue::{
    DrainReport, OfflineSyncQueue, Priority, QueuedRequest, RequestState, SyncTransport,
    TransportError,
};

// HTTP transport for the sync queue
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::HttpTransport;

// Foreground controller and input pipeline
pub mod tracker;
pub use tracker::{sample_channel, StatsSink, TripController};

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("TripTrackerRust"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A single fix from the device location provider.
///
/// Samples are immutable once created. Optional fields are absent when the
/// provider did not report them.
///
/// # Example
/// ```
/// use trip_tracker::LocationSample;
/// let sample = LocationSample::new(51.5074, -0.1278, 1_700_000_000_000)
///     .with_accuracy(8.0)
///     .with_speed(4.2);
/// assert!(sample.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Fix time in milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    /// Device-reported ground speed in m/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_speed_mps: Option<f64>,
    /// Horizontal accuracy radius in meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude_meters: Option<f64>,
}

impl LocationSample {
    /// Create a sample with only position and time.
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp_ms,
            reported_speed_mps: None,
            accuracy_meters: None,
            altitude_meters: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy_meters: f64) -> Self {
        self.accuracy_meters = Some(accuracy_meters);
        self
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.reported_speed_mps = Some(speed_mps);
        self
    }

    pub fn with_altitude(mut self, altitude_meters: f64) -> Self {
        self.altitude_meters = Some(altitude_meters);
        self
    }

    /// Check if the sample has usable coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Where the trip is headed, used for progress reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Destination {
    pub latitude: f64,
    pub longitude: f64,
    /// Planned trip length, used as the progress denominator
    #[serde(default)]
    pub estimated_total_distance_km: Option<f64>,
    #[serde(default)]
    pub origin_name: Option<String>,
    #[serde(default)]
    pub destination_name: Option<String>,
}

/// Stats update emitted after every accumulation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct TripStats {
    pub session_id: String,
    pub distance_km: f64,
    /// Time spent moving, excluding dwells
    pub moving_time_s: f64,
    /// Wall-clock time since the session started
    pub total_time_s: f64,
    /// Distance over moving time
    pub avg_speed_kmh: f64,
    pub top_speed_kmh: f64,
    /// Zero while dwelling
    pub current_speed_kmh: f64,
    /// 0.0 - 1.0 toward the destination (0 without one)
    pub progress: f64,
    pub distance_remaining_km: Option<f64>,
    pub dwelling: bool,
}
