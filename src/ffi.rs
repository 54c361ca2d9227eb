//! FFI bindings for mobile platforms (iOS/Android).
//!
//! A [`TripTrackerHandle`] owns the foreground accumulator and its checkpoint
//! bridge. Background wake-ups go through [`ffi_run_background_batch`], which
//! shares nothing with the handle except the storage directory.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};

use crate::accumulator::TrackAccumulator;
use crate::persistence::{CheckpointSource, CheckpointWrite, PersistedState, PersistenceBridge};
use crate::reconcile::{ColdStart, ReconciliationService, ResumeOutcome};
use crate::storage::{FileStore, KeyValueStore};
use crate::{
    init_logging, BackgroundTracker, Destination, LocationSample, TrackerConfig, TrackerError,
    TripStats,
};

struct Inner {
    tracker: TrackAccumulator,
    bridge: PersistenceBridge,
    /// Found by `recover`, waiting for the host's decision
    orphan: Option<PersistedState>,
}

/// What [`TripTrackerHandle::recover`] found.
#[derive(Debug, Clone, PartialEq, uniffi::Enum)]
pub enum RecoveredTrip {
    Nothing,
    /// Tracking continues from the snapshot.
    Resumed { stats: TripStats },
    /// No background schedule was running. Call `adopt_orphan` or
    /// `discard_orphan`; the snapshot is kept until then.
    Orphaned { stats: TripStats },
}

/// Foreground trip tracker exposed to Kotlin/Swift.
#[derive(uniffi::Object)]
pub struct TripTrackerHandle {
    inner: Mutex<Inner>,
    reconciliation: ReconciliationService,
}

fn parse_config(config_json: Option<String>) -> Result<TrackerConfig, TrackerError> {
    let config = match config_json {
        Some(json) => TrackerConfig::from_json(&json)?,
        None => TrackerConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[uniffi::export]
impl TripTrackerHandle {
    /// Open a tracker persisting to `storage_dir`.
    #[uniffi::constructor]
    pub fn new(storage_dir: String, config_json: Option<String>) -> Result<Arc<Self>, TrackerError> {
        init_logging();
        let config = parse_config(config_json)?;
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&storage_dir)?);
        info!("[FFI] Tracker opened at {}", storage_dir);

        Ok(Arc::new(Self {
            inner: Mutex::new(Inner {
                tracker: TrackAccumulator::new(config.clone()),
                bridge: PersistenceBridge::new(store, CheckpointSource::Foreground, config.checkpoint.clone()),
                orphan: None,
            }),
            reconciliation: ReconciliationService::new(config),
        }))
    }

    pub fn start(&self, destination: Option<Destination>, now_ms: i64) -> Result<TripStats, TrackerError> {
        let mut inner = self.lock()?;
        let Inner { tracker, bridge, .. } = &mut *inner;
        let session = tracker.start(now_ms, destination)?;
        bridge.checkpoint(session, now_ms)?;
        tracker.stats(now_ms)
    }

    /// Apply one sample and return the updated stats.
    ///
    /// A newer background snapshot found at checkpoint time is merged in.
    pub fn push_sample(&self, sample: LocationSample, now_ms: i64) -> Result<TripStats, TrackerError> {
        let mut inner = self.lock()?;
        let Inner { tracker, bridge, .. } = &mut *inner;
        let outcome = tracker.on_sample(sample, now_ms)?;
        let superseded = match tracker.session().map(|s| bridge.maybe_checkpoint(s, now_ms)) {
            Some(Ok(CheckpointWrite::Superseded { .. })) => true,
            Some(Err(e)) => {
                warn!("[FFI] Checkpoint failed: {}", e);
                false
            }
            _ => false,
        };

        if superseded {
            if let ResumeOutcome::AdoptedPersisted { .. } =
                self.reconciliation.on_resume(tracker, bridge, now_ms)?
            {
                return tracker.stats(now_ms);
            }
        }
        Ok(outcome.stats)
    }

    pub fn current_stats(&self, now_ms: i64) -> Option<TripStats> {
        let inner = self.inner.lock().ok()?;
        inner.tracker.stats(now_ms).ok()
    }

    pub fn suspend(&self, now_ms: i64) -> Result<(), TrackerError> {
        let mut inner = self.lock()?;
        let Inner { tracker, bridge, .. } = &mut *inner;
        self.reconciliation.on_suspend(tracker, bridge, now_ms)?;
        Ok(())
    }

    /// Returns true when background progress was adopted.
    pub fn resume(&self, now_ms: i64) -> Result<bool, TrackerError> {
        let mut inner = self.lock()?;
        let Inner { tracker, bridge, .. } = &mut *inner;
        let outcome = self.reconciliation.on_resume(tracker, bridge, now_ms)?;
        Ok(matches!(outcome, ResumeOutcome::AdoptedPersisted { .. }))
    }

    /// Look for an interrupted trip after a process restart.
    ///
    /// A trip the background schedule was still tracking resumes
    /// immediately. An orphan is reported with its last known stats and left
    /// untouched until the host adopts or discards it.
    pub fn recover(&self, background_active: bool, now_ms: i64) -> Result<RecoveredTrip, TrackerError> {
        let mut inner = self.lock()?;
        if inner.tracker.is_active() {
            return Ok(RecoveredTrip::Nothing);
        }

        let Inner { tracker, bridge, orphan } = &mut *inner;
        match self.reconciliation.on_cold_start(bridge, background_active, now_ms)? {
            ColdStart::NoSession => Ok(RecoveredTrip::Nothing),
            ColdStart::Recovered(recovered) => {
                *tracker = recovered;
                Ok(RecoveredTrip::Resumed {
                    stats: tracker.stats(now_ms)?,
                })
            }
            ColdStart::Orphaned(state) => {
                let stats = state.to_session().stats(now_ms);
                info!("[FFI] Orphaned session {} awaiting decision", state.session_id);
                *orphan = Some(state);
                Ok(RecoveredTrip::Orphaned { stats })
            }
        }
    }

    /// Continue the orphan reported by `recover`.
    pub fn adopt_orphan(&self, now_ms: i64) -> Result<TripStats, TrackerError> {
        let mut inner = self.lock()?;
        let Inner { tracker, bridge, orphan } = &mut *inner;
        if let Some(session) = tracker.session() {
            return Err(TrackerError::SessionAlreadyActive {
                session_id: session.session_id.clone(),
            });
        }
        let state = orphan.take().ok_or(TrackerError::NoActiveSession)?;

        *tracker = self.reconciliation.resume_from(&state, now_ms);
        if let Some(session) = tracker.session() {
            bridge.checkpoint(session, now_ms)?;
        }
        info!("[FFI] Adopted orphaned session {}", state.session_id);
        tracker.stats(now_ms)
    }

    /// Drop the orphan reported by `recover` and remove its snapshot.
    ///
    /// Returns its final stats so the host can close the trip with its
    /// backend; this handle has no network path of its own.
    pub fn discard_orphan(&self, now_ms: i64) -> Result<Option<TripStats>, TrackerError> {
        let mut inner = self.lock()?;
        let Inner { bridge, orphan, .. } = &mut *inner;
        let state = match orphan.take() {
            Some(state) => Some(state),
            None => bridge.load()?,
        };

        bridge.clear()?;
        Ok(state.map(|state| {
            warn!("[FFI] Discarded orphaned session {}", state.session_id);
            state.to_session().stats(now_ms)
        }))
    }

    /// Hand raw samples to the map-matcher.
    pub fn drain_raw_buffer(&self) -> Vec<LocationSample> {
        match self.inner.lock() {
            Ok(mut inner) => inner.tracker.drain_raw_buffer(),
            Err(_) => Vec::new(),
        }
    }

    /// End the trip and remove its snapshot.
    pub fn end(&self, now_ms: i64) -> Result<TripStats, TrackerError> {
        let mut inner = self.lock()?;
        let stats = inner.tracker.end(now_ms)?;
        inner.bridge.clear()?;
        inner.orphan = None;
        Ok(stats)
    }
}

impl TripTrackerHandle {
    fn lock(&self) -> Result<MutexGuard<'_, Inner>, TrackerError> {
        self.inner.lock().map_err(|_| TrackerError::Internal {
            message: "tracker lock poisoned".to_string(),
        })
    }
}

/// Apply a batch of deferred fixes from a background wake-up.
#[uniffi::export]
pub fn ffi_run_background_batch(
    storage_dir: String,
    config_json: Option<String>,
    samples: Vec<LocationSample>,
    now_ms: i64,
) -> Option<TripStats> {
    init_logging();
    let run = || -> Result<Option<TripStats>, TrackerError> {
        let config = parse_config(config_json)?;
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&storage_dir)?);
        BackgroundTracker::new(store, config).run_batch(&samples, now_ms)
    };

    match run() {
        Ok(stats) => stats,
        Err(e) => {
            warn!("[FFI] Background batch failed: {}", e);
            None
        }
    }
}

/// Default configuration as JSON, for hosts that persist overrides.
#[uniffi::export]
pub fn ffi_default_config_json() -> String {
    serde_json::to_string(&TrackerConfig::default()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn northbound(i: i64) -> LocationSample {
        LocationSample::new(i as f64 * 0.0001, 0.0, i * 1000).with_accuracy(5.0)
    }

    #[test]
    fn test_handle_and_background_share_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();

        let handle = TripTrackerHandle::new(path.clone(), None).unwrap();
        handle.start(None, 0).unwrap();
        for i in 0..5 {
            handle.push_sample(northbound(i), i * 1000).unwrap();
        }
        handle.suspend(4_000).unwrap();

        let batch: Vec<LocationSample> = (5..10).map(northbound).collect();
        let bg = ffi_run_background_batch(path.clone(), None, batch, 10_000).unwrap();
        assert!(bg.distance_km > 0.09);

        assert!(handle.resume(11_000).unwrap());
        let stats = handle.current_stats(11_000).unwrap();
        assert_eq!(stats.distance_km, bg.distance_km);

        handle.end(12_000).unwrap();
        assert!(handle.current_stats(12_000).is_none());
        assert!(ffi_run_background_batch(path, None, vec![northbound(11)], 13_000).is_none());
    }

    #[test]
    fn test_bad_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        assert!(TripTrackerHandle::new(path, Some("{not json".to_string())).is_err());
        assert!(ffi_default_config_json().contains("max_accuracy_meters"));
    }

    #[test]
    fn test_orphan_is_reported_then_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        {
            let handle = TripTrackerHandle::new(path.clone(), None).unwrap();
            handle.start(None, 0).unwrap();
            for i in 0..5 {
                handle.push_sample(northbound(i), i * 1000).unwrap();
            }
            handle.suspend(4_000).unwrap();
        }

        let handle = TripTrackerHandle::new(path, None).unwrap();
        let orphan = match handle.recover(false, 60_000).unwrap() {
            RecoveredTrip::Orphaned { stats } => stats,
            other => panic!("expected orphan, got {:?}", other),
        };
        assert!(orphan.distance_km > 0.04);
        assert!(handle.current_stats(60_000).is_none());

        let adopted = handle.adopt_orphan(60_000).unwrap();
        assert_eq!(adopted.session_id, orphan.session_id);
        assert_eq!(adopted.distance_km, orphan.distance_km);
        assert!(handle.current_stats(60_000).is_some());
        assert!(handle.adopt_orphan(60_000).is_err());
    }

    #[test]
    fn test_discarded_orphan_returns_final_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        {
            let handle = TripTrackerHandle::new(path.clone(), None).unwrap();
            handle.start(None, 0).unwrap();
            handle.push_sample(northbound(0), 0).unwrap();
            handle.push_sample(northbound(1), 1_000).unwrap();
            handle.suspend(1_000).unwrap();
        }

        let handle = TripTrackerHandle::new(path, None).unwrap();
        assert!(matches!(
            handle.recover(false, 60_000).unwrap(),
            RecoveredTrip::Orphaned { .. }
        ));
        let last = handle.discard_orphan(60_000).unwrap().unwrap();
        assert!(last.distance_km > 0.0);
        assert_eq!(handle.recover(false, 61_000).unwrap(), RecoveredTrip::Nothing);
    }

    #[test]
    fn test_push_sample_merges_newer_background_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();

        let handle = TripTrackerHandle::new(path.clone(), None).unwrap();
        handle.start(None, 0).unwrap();
        for i in 0..5 {
            handle.push_sample(northbound(i), i * 1000).unwrap();
        }
        handle.suspend(4_000).unwrap();

        let batch: Vec<LocationSample> = (5..10).map(northbound).collect();
        let bg = ffi_run_background_batch(path, None, batch, 10_000).unwrap();

        // Stale fix delivered before the resume event
        let stats = handle.push_sample(northbound(3), 11_000).unwrap();
        assert_eq!(stats.distance_km, bg.distance_km);
    }
}
