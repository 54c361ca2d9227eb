//! Foreground/background reconciliation.
//!
//! The foreground accumulator and the background context update independent
//! copies of the session. They meet only at lifecycle transitions, where the
//! persisted snapshot is treated as the single source of truth:
//!
//! - **Suspend**: the live totals are written immediately so the background
//!   context starts from accurate figures.
//! - **Resume**: if the snapshot has more distance than the live session
//!   (the background kept tracking), its totals become the new baseline.
//! - **Cold start**: a snapshot with an active background schedule is a
//!   crash-recovered session; without one it is an orphan and the decision
//!   is left to the caller.

use log::{info, warn};

use crate::accumulator::TrackAccumulator;
use crate::config::TrackerConfig;
use crate::error::Result;
use crate::persistence::{PersistedState, PersistenceBridge};

/// What happened when the app returned to the foreground.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// No live session to reconcile; use [`ReconciliationService::on_cold_start`]
    NoLiveSession,
    /// Live totals were already at least as far along
    KeptLive,
    /// Background totals were adopted as the new baseline
    AdoptedPersisted {
        previous_distance_km: f64,
        adopted_distance_km: f64,
    },
    /// The snapshot belongs to another session; nothing was merged
    SessionMismatch {
        live_session_id: String,
        persisted_session_id: String,
    },
}

/// What a freshly started process found on disk.
#[derive(Debug)]
pub enum ColdStart {
    /// No snapshot: nothing to resume
    NoSession,
    /// Background schedule still running: tracking continues from the snapshot
    Recovered(TrackAccumulator),
    /// Snapshot without a background schedule: caller decides resume vs terminate
    Orphaned(PersistedState),
}

/// Merges foreground and background copies of a session.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationService {
    config: TrackerConfig,
}

impl ReconciliationService {
    pub fn new(config: TrackerConfig) -> Self {
        Self { config }
    }

    /// App is being suspended: push live totals to disk, bypassing the throttle.
    pub fn on_suspend(
        &self,
        tracker: &TrackAccumulator,
        bridge: &mut PersistenceBridge,
        now_ms: i64,
    ) -> Result<Option<u64>> {
        match tracker.session() {
            Some(session) => {
                let sequence = bridge.checkpoint(session, now_ms)?;
                info!(
                    "[Reconciliation] Suspend checkpoint #{} at {:.3} km",
                    sequence, session.cumulative_distance_km
                );
                Ok(Some(sequence))
            }
            None => Ok(None),
        }
    }

    /// App returned to the foreground: adopt background progress if ahead.
    pub fn on_resume(
        &self,
        tracker: &mut TrackAccumulator,
        bridge: &mut PersistenceBridge,
        now_ms: i64,
    ) -> Result<ResumeOutcome> {
        let (live_id, live_distance) = match tracker.session() {
            Some(s) => (s.session_id.clone(), s.cumulative_distance_km),
            None => return Ok(ResumeOutcome::NoLiveSession),
        };

        let persisted = match bridge.load()? {
            Some(state) => state,
            None => return Ok(ResumeOutcome::KeptLive),
        };

        if persisted.session_id != live_id {
            warn!(
                "[Reconciliation] Snapshot session {} does not match live session {}",
                persisted.session_id, live_id
            );
            return Ok(ResumeOutcome::SessionMismatch {
                live_session_id: live_id,
                persisted_session_id: persisted.session_id,
            });
        }

        if persisted.cumulative_distance_km <= live_distance {
            return Ok(ResumeOutcome::KeptLive);
        }

        if let Some(session) = tracker.session_mut() {
            let restored = persisted.to_session();
            session.cumulative_distance_km = restored.cumulative_distance_km;
            session.moving_time_seconds = session.moving_time_seconds.max(restored.moving_time_seconds);
            session.top_speed_kmh = session.top_speed_kmh.max(restored.top_speed_kmh);
            if restored.last_accepted_sample.is_some() {
                session.last_accepted_sample = restored.last_accepted_sample;
            }
            session.last_sample_timestamp_ms = session
                .last_sample_timestamp_ms
                .max(restored.last_sample_timestamp_ms);
            session.dwell_state = restored.dwell_state;
            session.current_speed_mps = 0.0;
            session.route_points = restored.route_points;
            session.raw_buffer = restored.raw_buffer;
            if session.destination.is_none() {
                session.destination = restored.destination;
            }
        }
        tracker.reseed_window(now_ms);

        info!(
            "[Reconciliation] Adopted background totals: {:.3} km -> {:.3} km",
            live_distance, persisted.cumulative_distance_km
        );
        Ok(ResumeOutcome::AdoptedPersisted {
            previous_distance_km: live_distance,
            adopted_distance_km: persisted.cumulative_distance_km,
        })
    }

    /// Fresh process with no live session.
    pub fn on_cold_start(
        &self,
        bridge: &mut PersistenceBridge,
        background_active: bool,
        now_ms: i64,
    ) -> Result<ColdStart> {
        let state = match bridge.load()? {
            Some(state) => state,
            None => return Ok(ColdStart::NoSession),
        };

        if background_active {
            info!("[Reconciliation] Recovering session {}", state.session_id);
            Ok(ColdStart::Recovered(self.resume_from(&state, now_ms)))
        } else {
            warn!(
                "[Reconciliation] Found orphaned session {} ({:.3} km)",
                state.session_id, state.cumulative_distance_km
            );
            Ok(ColdStart::Orphaned(state))
        }
    }

    /// Rebuild a live accumulator from a snapshot.
    pub fn resume_from(&self, state: &PersistedState, now_ms: i64) -> TrackAccumulator {
        let mut tracker = TrackAccumulator::with_session(self.config.clone(), state.to_session());
        tracker.reseed_window(now_ms);
        tracker
    }
}
