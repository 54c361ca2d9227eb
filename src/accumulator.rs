//! # Track Accumulator
//!
//! The session state machine. Every sample is fully processed before the
//! next one is admitted:
//!
//! ```text
//! sample ─▶ screen ─▶ speed window ─▶ dwell ─▶ accept / credit ─▶ totals
//! ```
//!
//! The accumulator is an explicitly owned value. Foreground and background
//! contexts each hold their own instance and only meet through the
//! persisted snapshot.

use std::collections::VecDeque;

use log::{debug, info};

use crate::config::TrackerConfig;
use crate::dwell::{DwellDetector, DwellState};
use crate::error::{OptionExt, Result, TrackerError};
use crate::filter::{RejectReason, SampleFilter};
use crate::geo_utils::{haversine_meters, mps_to_kmh};
use crate::speed::{SpeedEstimator, WindowEntry};
use crate::{Destination, LocationSample, TripStats};

// ============================================================================
// Session
// ============================================================================

/// Live state of one tracked trip.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSession {
    pub session_id: String,
    pub start_timestamp_ms: i64,
    /// Monotonically non-decreasing while active
    pub cumulative_distance_km: f64,
    pub moving_time_seconds: f64,
    /// Monotonically non-decreasing while active
    pub top_speed_kmh: f64,
    pub last_accepted_sample: Option<LocationSample>,
    /// Timestamp of the last sample that passed screening (ordering guard)
    pub last_sample_timestamp_ms: Option<i64>,
    pub dwell_state: DwellState,
    /// Last speed estimate, already zeroed while dwelling
    pub current_speed_mps: f64,
    pub recent_window: VecDeque<WindowEntry>,
    pub route_points: Vec<LocationSample>,
    /// Every in-order sample, pending downstream map-matching
    pub raw_buffer: VecDeque<LocationSample>,
    pub destination: Option<Destination>,
}

impl TrackSession {
    pub fn new(session_id: String, start_timestamp_ms: i64) -> Self {
        Self {
            session_id,
            start_timestamp_ms,
            cumulative_distance_km: 0.0,
            moving_time_seconds: 0.0,
            top_speed_kmh: 0.0,
            last_accepted_sample: None,
            last_sample_timestamp_ms: None,
            dwell_state: DwellState::Moving,
            current_speed_mps: 0.0,
            recent_window: VecDeque::new(),
            route_points: Vec::new(),
            raw_buffer: VecDeque::new(),
            destination: None,
        }
    }

    /// Straight-line distance from the last accepted fix to the destination.
    pub fn distance_remaining_km(&self) -> Option<f64> {
        let dest = self.destination.as_ref()?;
        let last = self.last_accepted_sample.as_ref()?;
        Some(haversine_meters(last.latitude, last.longitude, dest.latitude, dest.longitude) / 1000.0)
    }

    /// Progress toward the destination in [0, 1].
    pub fn progress(&self) -> f64 {
        let total = match self
            .destination
            .as_ref()
            .and_then(|d| d.estimated_total_distance_km)
        {
            Some(total) if total > 0.0 => total,
            _ => return 0.0,
        };

        let ratio = match self.distance_remaining_km() {
            Some(remaining) => 1.0 - remaining / total,
            None => self.cumulative_distance_km / total,
        };
        ratio.clamp(0.0, 1.0)
    }

    /// Snapshot the statistics at wall-clock `now_ms`.
    pub fn stats(&self, now_ms: i64) -> TripStats {
        let avg_speed_kmh = if self.moving_time_seconds > 0.0 {
            self.cumulative_distance_km / (self.moving_time_seconds / 3600.0)
        } else {
            0.0
        };

        TripStats {
            session_id: self.session_id.clone(),
            distance_km: self.cumulative_distance_km,
            moving_time_s: self.moving_time_seconds,
            total_time_s: ((now_ms - self.start_timestamp_ms) as f64 / 1000.0).max(0.0),
            avg_speed_kmh,
            top_speed_kmh: self.top_speed_kmh,
            current_speed_kmh: mps_to_kmh(self.current_speed_mps),
            progress: self.progress(),
            distance_remaining_km: self.distance_remaining_km(),
            dwelling: self.dwell_state.is_dwelling(),
        }
    }
}

/// Result of feeding one sample to the accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOutcome {
    pub stats: TripStats,
    /// Sample became a route point
    pub accepted: bool,
    /// Set when the sample was dropped before estimation
    pub rejection: Option<RejectReason>,
}

// ============================================================================
// Accumulator
// ============================================================================

/// Owns a [`TrackSession`] and applies samples to it.
#[derive(Debug, Clone)]
pub struct TrackAccumulator {
    filter: SampleFilter,
    estimator: SpeedEstimator,
    dwell: DwellDetector,
    session: Option<TrackSession>,
}

impl TrackAccumulator {
    /// Create an idle accumulator.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            filter: SampleFilter::new(config.filter),
            estimator: SpeedEstimator::new(config.speed),
            dwell: DwellDetector::new(config.dwell),
            session: None,
        }
    }

    /// Create an accumulator that continues an existing session.
    pub fn with_session(config: TrackerConfig, session: TrackSession) -> Self {
        let mut accumulator = Self::new(config);
        accumulator.session = Some(session);
        accumulator
    }

    /// Begin a new session.
    pub fn start(&mut self, now_ms: i64, destination: Option<Destination>) -> Result<&TrackSession> {
        if let Some(existing) = self.session.as_ref() {
            return Err(TrackerError::SessionAlreadyActive {
                session_id: existing.session_id.clone(),
            });
        }

        let mut session = TrackSession::new(uuid::Uuid::new_v4().to_string(), now_ms);
        session.destination = destination;
        info!("[TrackAccumulator] Started session {}", session.session_id);

        Ok(self.session.insert(session))
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&TrackSession> {
        self.session.as_ref()
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut TrackSession> {
        self.session.as_mut()
    }

    /// Restart the speed window from the last accepted sample.
    pub(crate) fn reseed_window(&mut self, now_ms: i64) {
        if let Some(session) = self.session.as_mut() {
            if let Some(last) = session.last_accepted_sample {
                self.estimator.reseed(session, &last, now_ms);
            }
        }
    }

    /// Current statistics.
    pub fn stats(&self, now_ms: i64) -> Result<TripStats> {
        Ok(self.session.as_ref().ok_or_no_session()?.stats(now_ms))
    }

    /// Apply one sample received at `now_ms`.
    pub fn on_sample(&mut self, sample: LocationSample, now_ms: i64) -> Result<SampleOutcome> {
        let session = self.session.as_mut().ok_or_no_session()?;

        if let Some(reason) = self.filter.screen(session, &sample) {
            // Out-of-order and unusable coordinates would corrupt raw density
            if !matches!(
                reason,
                RejectReason::OutOfOrder { .. } | RejectReason::InvalidCoordinates
            ) {
                push_raw(session, sample, self.filter.config().raw_buffer_limit);
            }
            debug!(
                "[TrackAccumulator] Rejected sample at {}: {:?}",
                sample.timestamp_ms, reason
            );
            return Ok(SampleOutcome {
                stats: session.stats(now_ms),
                accepted: false,
                rejection: Some(reason),
            });
        }

        push_raw(session, sample, self.filter.config().raw_buffer_limit);
        let previous_ts = session.last_sample_timestamp_ms.replace(sample.timestamp_ms);

        let speed_mps = self.estimator.estimate(session, &sample, now_ms);
        let dwelling = self
            .dwell
            .update(session, speed_mps, sample.timestamp_ms)
            .is_dwelling();
        let threshold = self.dwell.moving_threshold_mps();
        let moving = !dwelling && speed_mps >= threshold;

        let decision = self
            .filter
            .filter(session, &sample, speed_mps, threshold, dwelling);

        if decision.accept {
            session.route_points.push(sample);
            session.last_accepted_sample = Some(sample);
            session.cumulative_distance_km += decision.distance_delta_km;
        }

        if moving {
            if let Some(prev) = previous_ts {
                let elapsed_s = (sample.timestamp_ms - prev).max(0) as f64 / 1000.0;
                session.moving_time_seconds += elapsed_s;
            }
            session.top_speed_kmh = session.top_speed_kmh.max(mps_to_kmh(speed_mps));
        }

        // Moving time can never exceed wall-clock session time
        let wall_clock_s = ((now_ms - session.start_timestamp_ms) as f64 / 1000.0).max(0.0);
        if session.moving_time_seconds > wall_clock_s {
            session.moving_time_seconds = wall_clock_s;
        }

        session.current_speed_mps = if dwelling { 0.0 } else { speed_mps };

        Ok(SampleOutcome {
            stats: session.stats(now_ms),
            accepted: decision.accept,
            rejection: None,
        })
    }

    /// Hand pending raw samples to the downstream map-matcher.
    pub fn drain_raw_buffer(&mut self) -> Vec<LocationSample> {
        self.session
            .as_mut()
            .map(|s| s.raw_buffer.drain(..).collect())
            .unwrap_or_default()
    }

    /// Finish the session and clear all state.
    ///
    /// Returns the final statistics; anything else (route points, raw
    /// buffer) must be captured before calling this.
    pub fn end(&mut self, now_ms: i64) -> Result<TripStats> {
        let session = self.session.take().ok_or_no_session()?;
        let stats = session.stats(now_ms);
        info!(
            "[TrackAccumulator] Ended session {}: {:.3} km, {:.0}s moving",
            session.session_id, stats.distance_km, stats.moving_time_s
        );
        Ok(stats)
    }

    /// Drop the session without computing final stats.
    pub fn clear(&mut self) {
        if let Some(session) = self.session.take() {
            info!("[TrackAccumulator] Cleared session {}", session.session_id);
        }
    }
}

fn push_raw(session: &mut TrackSession, sample: LocationSample, limit: usize) {
    session.raw_buffer.push_back(sample);
    while session.raw_buffer.len() > limit {
        session.raw_buffer.pop_front();
    }
}
