//! # Persistence Bridge
//!
//! Durable snapshots of the live session, shared between the foreground
//! tracker and the OS-scheduled background context.
//!
//! ## Contract
//!
//! - One snapshot per active session, stored under [`STATE_KEY`]. Absence
//!   means no active session.
//! - Writes replace the whole snapshot atomically (the storage backend
//!   guarantees this), so either side can resume from whatever is there.
//! - Every snapshot is stamped with a sequence number, the writer and the
//!   write time, so a reader can tell which side produced it.
//! - A snapshot that fails to parse is treated as absent.
//! - Periodic checkpoints never replace a snapshot the other side wrote
//!   after this bridge last saw the store. The writer that finds such a
//!   snapshot reports [`CheckpointWrite::Superseded`] and must reconcile
//!   before its next write lands.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::accumulator::TrackSession;
use crate::config::CheckpointConfig;
use crate::dwell::DwellState;
use crate::error::Result;
use crate::storage::KeyValueStore;
use crate::{Destination, LocationSample};

/// Storage key of the session snapshot.
pub const STATE_KEY: &str = "trip_tracker.state";
/// Storage key of the active session id.
pub const SESSION_ID_KEY: &str = "trip_tracker.session_id";

/// Which execution context wrote a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum CheckpointSource {
    Foreground,
    Background,
}

/// Result of a periodic checkpoint attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointWrite {
    Written { sequence: u64 },
    /// The throttle interval has not elapsed.
    NotDue,
    /// The other context wrote a newer snapshot of this session.
    Superseded { sequence: u64, writer: CheckpointSource },
}

/// Just the stamp of a stored snapshot.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotStamp {
    session_id: String,
    sequence: u64,
    writer: CheckpointSource,
}

// ============================================================================
// Snapshot
// ============================================================================

/// Durable snapshot of a [`TrackSession`] plus destination metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub session_id: String,
    pub start_timestamp_ms: i64,
    pub cumulative_distance_km: f64,
    pub moving_time_seconds: f64,
    pub top_speed_kmh: f64,

    // Last accepted sample, flattened
    pub last_latitude: Option<f64>,
    pub last_longitude: Option<f64>,
    pub last_timestamp_ms: Option<i64>,
    #[serde(default)]
    pub last_accuracy_meters: Option<f64>,
    #[serde(default)]
    pub last_reported_speed_mps: Option<f64>,
    #[serde(default)]
    pub last_altitude_meters: Option<f64>,
    /// Ordering guard: timestamp of the last screened sample
    #[serde(default)]
    pub last_processed_timestamp_ms: Option<i64>,

    #[serde(default)]
    pub dwell_state: DwellState,
    #[serde(default)]
    pub route_points: Vec<LocationSample>,
    #[serde(default)]
    pub raw_points_buffer: Vec<LocationSample>,

    #[serde(default)]
    pub destination_latitude: Option<f64>,
    #[serde(default)]
    pub destination_longitude: Option<f64>,
    #[serde(default)]
    pub estimated_total_distance_km: Option<f64>,
    #[serde(default)]
    pub origin_name: Option<String>,
    #[serde(default)]
    pub destination_name: Option<String>,

    // Stamping
    pub sequence: u64,
    pub writer: CheckpointSource,
    pub written_at_ms: i64,
}

impl PersistedState {
    /// Snapshot `session` with the given stamp.
    pub fn from_session(
        session: &TrackSession,
        writer: CheckpointSource,
        sequence: u64,
        written_at_ms: i64,
    ) -> Self {
        let last = session.last_accepted_sample.as_ref();
        let dest = session.destination.as_ref();

        Self {
            session_id: session.session_id.clone(),
            start_timestamp_ms: session.start_timestamp_ms,
            cumulative_distance_km: session.cumulative_distance_km,
            moving_time_seconds: session.moving_time_seconds,
            top_speed_kmh: session.top_speed_kmh,
            last_latitude: last.map(|s| s.latitude),
            last_longitude: last.map(|s| s.longitude),
            last_timestamp_ms: last.map(|s| s.timestamp_ms),
            last_accuracy_meters: last.and_then(|s| s.accuracy_meters),
            last_reported_speed_mps: last.and_then(|s| s.reported_speed_mps),
            last_altitude_meters: last.and_then(|s| s.altitude_meters),
            last_processed_timestamp_ms: session.last_sample_timestamp_ms,
            dwell_state: session.dwell_state,
            route_points: session.route_points.clone(),
            raw_points_buffer: session.raw_buffer.iter().copied().collect(),
            destination_latitude: dest.map(|d| d.latitude),
            destination_longitude: dest.map(|d| d.longitude),
            estimated_total_distance_km: dest.and_then(|d| d.estimated_total_distance_km),
            origin_name: dest.and_then(|d| d.origin_name.clone()),
            destination_name: dest.and_then(|d| d.destination_name.clone()),
            sequence,
            writer,
            written_at_ms,
        }
    }

    /// The last accepted sample, if one was recorded.
    pub fn last_sample(&self) -> Option<LocationSample> {
        match (self.last_latitude, self.last_longitude, self.last_timestamp_ms) {
            (Some(latitude), Some(longitude), Some(timestamp_ms)) => Some(LocationSample {
                latitude,
                longitude,
                timestamp_ms,
                reported_speed_mps: self.last_reported_speed_mps,
                accuracy_meters: self.last_accuracy_meters,
                altitude_meters: self.last_altitude_meters,
            }),
            _ => None,
        }
    }

    pub fn destination(&self) -> Option<Destination> {
        match (self.destination_latitude, self.destination_longitude) {
            (Some(latitude), Some(longitude)) => Some(Destination {
                latitude,
                longitude,
                estimated_total_distance_km: self.estimated_total_distance_km,
                origin_name: self.origin_name.clone(),
                destination_name: self.destination_name.clone(),
            }),
            _ => None,
        }
    }

    /// Rebuild a live session. The speed window starts empty; callers reseed it.
    pub fn to_session(&self) -> TrackSession {
        let mut session = TrackSession::new(self.session_id.clone(), self.start_timestamp_ms);
        session.cumulative_distance_km = self.cumulative_distance_km;
        session.moving_time_seconds = self.moving_time_seconds;
        session.top_speed_kmh = self.top_speed_kmh;
        session.last_accepted_sample = self.last_sample();
        session.last_sample_timestamp_ms = self
            .last_processed_timestamp_ms
            .or(self.last_timestamp_ms);
        session.dwell_state = self.dwell_state;
        session.route_points = self.route_points.clone();
        session.raw_buffer = self.raw_points_buffer.iter().copied().collect();
        session.destination = self.destination();
        session
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Reads and writes [`PersistedState`] through a [`KeyValueStore`].
pub struct PersistenceBridge {
    store: Arc<dyn KeyValueStore>,
    source: CheckpointSource,
    config: CheckpointConfig,
    last_checkpoint_ms: Option<i64>,
    sequence: u64,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn KeyValueStore>, source: CheckpointSource, config: CheckpointConfig) -> Self {
        Self {
            store,
            source,
            config,
            last_checkpoint_ms: None,
            sequence: 0,
        }
    }

    pub fn source(&self) -> CheckpointSource {
        self.source
    }

    /// Highest sequence this bridge has written or observed.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Write a snapshot now, ignoring the periodic throttle.
    ///
    /// Overwrites whatever is stored. Returns the sequence number written.
    pub fn checkpoint(&mut self, session: &TrackSession, now_ms: i64) -> Result<u64> {
        let sequence = self.sequence + 1;
        let state = PersistedState::from_session(session, self.source, sequence, now_ms);
        let bytes = serde_json::to_vec(&state)?;

        self.store.put(STATE_KEY, &bytes)?;
        self.store.put(SESSION_ID_KEY, session.session_id.as_bytes())?;

        self.sequence = sequence;
        self.last_checkpoint_ms = Some(now_ms);
        debug!(
            "[PersistenceBridge] {:?} checkpoint #{} ({:.3} km, {} bytes)",
            self.source,
            sequence,
            session.cumulative_distance_km,
            bytes.len()
        );
        Ok(sequence)
    }

    /// Write a snapshot if the checkpoint interval has elapsed.
    ///
    /// A failed or superseded write leaves the throttle untouched so the next
    /// tick retries.
    pub fn maybe_checkpoint(&mut self, session: &TrackSession, now_ms: i64) -> Result<CheckpointWrite> {
        let due = self
            .last_checkpoint_ms
            .map_or(true, |last| now_ms - last >= self.config.interval_ms);
        if !due {
            return Ok(CheckpointWrite::NotDue);
        }

        if let Some(stamp) = self.unseen_foreign_stamp(&session.session_id)? {
            info!(
                "[PersistenceBridge] {:?} checkpoint skipped: {:?} wrote #{} (last seen #{})",
                self.source, stamp.writer, stamp.sequence, self.sequence
            );
            return Ok(CheckpointWrite::Superseded {
                sequence: stamp.sequence,
                writer: stamp.writer,
            });
        }

        let sequence = self.checkpoint(session, now_ms)?;
        Ok(CheckpointWrite::Written { sequence })
    }

    /// Stamp of a snapshot of `session_id` the other context wrote after the
    /// highest sequence this bridge has seen.
    fn unseen_foreign_stamp(&self, session_id: &str) -> Result<Option<SnapshotStamp>> {
        let bytes = match self.store.get(STATE_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        Ok(serde_json::from_slice::<SnapshotStamp>(&bytes)
            .ok()
            .filter(|stamp| {
                stamp.session_id == session_id
                    && stamp.writer != self.source
                    && stamp.sequence > self.sequence
            }))
    }

    /// Load the stored snapshot. Corrupt data is reported as absent.
    pub fn load(&mut self) -> Result<Option<PersistedState>> {
        let bytes = match self.store.get(STATE_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        match serde_json::from_slice::<PersistedState>(&bytes) {
            Ok(state) => {
                self.sequence = self.sequence.max(state.sequence);
                Ok(Some(state))
            }
            Err(e) => {
                warn!("[PersistenceBridge] Ignoring corrupted snapshot: {}", e);
                Ok(None)
            }
        }
    }

    /// Session id of the stored snapshot without parsing it.
    pub fn active_session_id(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(SESSION_ID_KEY)?
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }

    /// Remove the snapshot; the session is over.
    pub fn clear(&mut self) -> Result<()> {
        self.store.delete(STATE_KEY)?;
        self.store.delete(SESSION_ID_KEY)?;
        self.last_checkpoint_ms = None;
        info!("[PersistenceBridge] Cleared persisted session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn bridge(store: Arc<dyn KeyValueStore>, source: CheckpointSource) -> PersistenceBridge {
        PersistenceBridge::new(store, source, CheckpointConfig::default())
    }

    fn sample_session() -> TrackSession {
        let mut session = TrackSession::new("trip-1".to_string(), 1_000);
        session.cumulative_distance_km = 1.234_567_891;
        session.moving_time_seconds = 321.5;
        session.top_speed_kmh = 47.25;
        let last = LocationSample::new(51.5074, -0.1278, 400_000)
            .with_accuracy(6.5)
            .with_speed(9.75);
        session.last_accepted_sample = Some(last);
        session.last_sample_timestamp_ms = Some(401_000);
        session.route_points = vec![last];
        session.raw_buffer.push_back(last);
        session.destination = Some(Destination {
            latitude: 51.52,
            longitude: -0.10,
            estimated_total_distance_km: Some(4.0),
            origin_name: None,
            destination_name: Some("Office".to_string()),
        });
        session
    }

    #[test]
    fn test_round_trip() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut b = bridge(store, CheckpointSource::Foreground);
        let session = sample_session();

        b.checkpoint(&session, 500_000).unwrap();
        let state = b.load().unwrap().unwrap();

        assert_eq!(state.cumulative_distance_km, session.cumulative_distance_km);
        assert_eq!(state.moving_time_seconds, session.moving_time_seconds);
        assert_eq!(state.top_speed_kmh, session.top_speed_kmh);
        assert_eq!(state.last_sample(), session.last_accepted_sample);
        assert_eq!(state.writer, CheckpointSource::Foreground);
        assert_eq!(state.to_session(), session);
    }

    #[test]
    fn test_absent_and_corrupted_are_none() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut b = bridge(store.clone(), CheckpointSource::Foreground);
        assert!(b.load().unwrap().is_none());

        store.put(STATE_KEY, b"{\"sessionId\": truncated").unwrap();
        assert!(b.load().unwrap().is_none());
    }

    #[test]
    fn test_periodic_throttle() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut b = bridge(store, CheckpointSource::Foreground);
        let session = sample_session();

        assert_eq!(
            b.maybe_checkpoint(&session, 0).unwrap(),
            CheckpointWrite::Written { sequence: 1 }
        );
        assert_eq!(b.maybe_checkpoint(&session, 4_999).unwrap(), CheckpointWrite::NotDue);
        assert_eq!(
            b.maybe_checkpoint(&session, 5_000).unwrap(),
            CheckpointWrite::Written { sequence: 2 }
        );
        // Forced checkpoints ignore the throttle
        b.checkpoint(&session, 5_001).unwrap();
        assert_eq!(b.sequence(), 3);
    }

    #[test]
    fn test_sequence_continues_across_writers() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut foreground = bridge(store.clone(), CheckpointSource::Foreground);
        let mut background = bridge(store, CheckpointSource::Background);
        let session = sample_session();

        foreground.checkpoint(&session, 0).unwrap();
        foreground.checkpoint(&session, 10_000).unwrap();

        // Background observes the foreground's sequence before writing
        background.load().unwrap();
        let seq = background.checkpoint(&session, 20_000).unwrap();
        assert_eq!(seq, 3);

        let state = foreground.load().unwrap().unwrap();
        assert_eq!(state.writer, CheckpointSource::Background);
        assert_eq!(foreground.sequence(), 3);
    }

    #[test]
    fn test_clear() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut b = bridge(store, CheckpointSource::Foreground);
        b.checkpoint(&sample_session(), 0).unwrap();
        assert_eq!(b.active_session_id().unwrap().as_deref(), Some("trip-1"));

        b.clear().unwrap();
        assert!(b.load().unwrap().is_none());
        assert!(b.active_session_id().unwrap().is_none());
    }

    #[test]
    fn test_periodic_write_never_clobbers_newer_background_snapshot() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut foreground = bridge(store.clone(), CheckpointSource::Foreground);
        let mut background = bridge(store, CheckpointSource::Background);
        let stale = sample_session();

        foreground.checkpoint(&stale, 0).unwrap();

        background.load().unwrap();
        let mut advanced = stale.clone();
        advanced.cumulative_distance_km += 2.0;
        background.checkpoint(&advanced, 10_000).unwrap();

        // Foreground timer fires before it reconciled
        assert_eq!(
            foreground.maybe_checkpoint(&stale, 20_000).unwrap(),
            CheckpointWrite::Superseded {
                sequence: 2,
                writer: CheckpointSource::Background
            }
        );
        let stored = foreground.load().unwrap().unwrap();
        assert_eq!(stored.cumulative_distance_km, advanced.cumulative_distance_km);

        // Having seen the newer snapshot, the next write goes through
        assert_eq!(
            foreground.maybe_checkpoint(&advanced, 20_000).unwrap(),
            CheckpointWrite::Written { sequence: 3 }
        );
    }

    #[test]
    fn test_own_or_other_session_snapshot_does_not_block() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut background = bridge(store.clone(), CheckpointSource::Background);
        let mut other = sample_session();
        other.session_id = "trip-0".to_string();
        background.checkpoint(&other, 0).unwrap();

        let mut foreground = bridge(store, CheckpointSource::Foreground);
        assert!(matches!(
            foreground.maybe_checkpoint(&sample_session(), 1_000).unwrap(),
            CheckpointWrite::Written { .. }
        ));
        assert!(matches!(
            foreground.maybe_checkpoint(&sample_session(), 6_000).unwrap(),
            CheckpointWrite::Written { .. }
        ));
    }
}
