//! Sample gating and route-point acceptance.
//!
//! Filtering happens in two passes around speed estimation:
//!
//! 1. [`SampleFilter::screen`] rejects samples that must not touch any
//!    statistic: out-of-order timestamps, invalid coordinates, accuracy above
//!    the hard ceiling, and teleport-like jumps whose implied speed against
//!    the last accepted sample is implausible.
//! 2. [`SampleFilter::filter`] decides whether a screened sample becomes a
//!    route point and how much distance it contributes, given the current
//!    speed estimate and dwell state.

use crate::accumulator::TrackSession;
use crate::config::FilterConfig;
use crate::geo_utils::haversine_distance;
use crate::LocationSample;

/// Why a sample was dropped before reaching the estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    /// Timestamp earlier than the last processed sample
    OutOfOrder { last_timestamp_ms: i64 },
    /// Non-finite or out-of-range coordinates
    InvalidCoordinates,
    /// Reported accuracy worse than the ceiling
    PoorAccuracy { accuracy_meters: f64 },
    /// Implied speed from the last accepted sample exceeds the ceiling
    ImplausibleJump { implied_speed_mps: f64 },
}

/// Outcome of the acceptance pass for a screened sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterDecision {
    /// Sample becomes a route point and the new last-accepted sample
    pub accept: bool,
    /// Distance credited to the session (0 unless accepted, moving, above drift)
    pub distance_delta_km: f64,
    /// Raw distance from the last accepted sample
    pub moved_meters: f64,
}

/// Validates and classifies raw GPS samples.
#[derive(Debug, Clone, Default)]
pub struct SampleFilter {
    config: FilterConfig,
}

impl SampleFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Hard gates. `None` means the sample may proceed.
    pub fn screen(&self, session: &TrackSession, sample: &LocationSample) -> Option<RejectReason> {
        if let Some(last_ts) = session.last_sample_timestamp_ms {
            if sample.timestamp_ms < last_ts {
                return Some(RejectReason::OutOfOrder {
                    last_timestamp_ms: last_ts,
                });
            }
        }

        if !sample.is_valid() {
            return Some(RejectReason::InvalidCoordinates);
        }

        if let Some(accuracy) = sample.accuracy_meters {
            if accuracy > self.config.max_accuracy_meters {
                return Some(RejectReason::PoorAccuracy {
                    accuracy_meters: accuracy,
                });
            }
        }

        if let Some(last) = session.last_accepted_sample.as_ref() {
            let elapsed_s = (sample.timestamp_ms - last.timestamp_ms) as f64 / 1000.0;
            let moved = haversine_distance(last, sample);
            // Same-timestamp duplicates only count as a jump if they moved past drift
            let implied = if elapsed_s > 0.0 {
                moved / elapsed_s
            } else if moved > self.config.drift_floor_meters {
                f64::INFINITY
            } else {
                0.0
            };
            if implied > self.config.max_plausible_speed_mps {
                return Some(RejectReason::ImplausibleJump {
                    implied_speed_mps: implied,
                });
            }
        }

        None
    }

    /// Acceptance and distance credit for a screened sample.
    ///
    /// `speed_mps` is the current speed estimate; `dwelling` is the dwell
    /// state after this sample was applied to the detector.
    pub fn filter(
        &self,
        session: &TrackSession,
        sample: &LocationSample,
        speed_mps: f64,
        moving_speed_mps: f64,
        dwelling: bool,
    ) -> FilterDecision {
        let last = match session.last_accepted_sample.as_ref() {
            Some(last) => last,
            None => {
                return FilterDecision {
                    accept: true,
                    distance_delta_km: 0.0,
                    moved_meters: 0.0,
                }
            }
        };

        let moved = haversine_distance(last, sample);
        let min_acceptable = self.min_acceptable_meters(last, sample);
        // Position-derived speed only; the device-reported value is never
        // consulted here since it spikes while stationary
        let genuinely_moving = speed_mps >= moving_speed_mps;
        let floor = self.config.drift_floor_meters;

        let accept = moved >= min_acceptable || (genuinely_moving && moved > floor);
        let credit = accept && !dwelling && moved > floor;

        FilterDecision {
            accept,
            distance_delta_km: if credit { moved / 1000.0 } else { 0.0 },
            moved_meters: moved,
        }
    }

    /// Adaptive acceptance threshold: noisier fixes must move further.
    pub fn min_acceptable_meters(&self, last: &LocationSample, sample: &LocationSample) -> f64 {
        self.config
            .min_move_meters
            .max(self.config.min_accuracy_meters)
            .max(last.accuracy_meters.unwrap_or(0.0))
            .max(sample.accuracy_meters.unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_last(sample: LocationSample) -> TrackSession {
        let mut session = TrackSession::new("test".to_string(), 0);
        session.last_accepted_sample = Some(sample);
        session.last_sample_timestamp_ms = Some(sample.timestamp_ms);
        session
    }

    #[test]
    fn test_first_sample_accepted() {
        let filter = SampleFilter::default();
        let session = TrackSession::new("test".to_string(), 0);
        let sample = LocationSample::new(51.5, -0.1, 1000).with_accuracy(10.0);

        assert!(filter.screen(&session, &sample).is_none());
        let decision = filter.filter(&session, &sample, 0.0, 1.5, false);
        assert!(decision.accept);
        assert_eq!(decision.distance_delta_km, 0.0);
    }

    #[test]
    fn test_poor_accuracy_rejected() {
        let filter = SampleFilter::default();
        let session = TrackSession::new("test".to_string(), 0);
        let sample = LocationSample::new(51.5, -0.1, 1000).with_accuracy(150.0);

        assert_eq!(
            filter.screen(&session, &sample),
            Some(RejectReason::PoorAccuracy {
                accuracy_meters: 150.0
            })
        );
    }

    #[test]
    fn test_out_of_order_rejected() {
        let filter = SampleFilter::default();
        let session = session_with_last(LocationSample::new(0.0, 0.0, 5000));
        let sample = LocationSample::new(0.0001, 0.0, 4000);

        assert!(matches!(
            filter.screen(&session, &sample),
            Some(RejectReason::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_teleport_rejected() {
        let filter = SampleFilter::default();
        let session = session_with_last(LocationSample::new(0.0, 0.0, 0));
        // ~11 km in one second
        let sample = LocationSample::new(0.1, 0.0, 1000);

        assert!(matches!(
            filter.screen(&session, &sample),
            Some(RejectReason::ImplausibleJump { .. })
        ));
    }

    #[test]
    fn test_adaptive_threshold_uses_worst_accuracy() {
        let filter = SampleFilter::default();
        let last = LocationSample::new(0.0, 0.0, 0).with_accuracy(20.0);
        let next = LocationSample::new(0.0, 0.0, 1000).with_accuracy(8.0);
        assert_eq!(filter.min_acceptable_meters(&last, &next), 20.0);

        let precise = LocationSample::new(0.0, 0.0, 1000).with_accuracy(2.0);
        let precise_last = LocationSample::new(0.0, 0.0, 0).with_accuracy(1.0);
        assert_eq!(filter.min_acceptable_meters(&precise_last, &precise), 5.0);
    }

    #[test]
    fn test_small_move_accepted_when_moving() {
        let filter = SampleFilter::default();
        let session = session_with_last(LocationSample::new(0.0, 0.0, 0).with_accuracy(20.0));
        // ~4.4m, under the 20m threshold but above the drift floor
        let sample = LocationSample::new(0.00004, 0.0, 1000).with_accuracy(20.0);

        let stopped = filter.filter(&session, &sample, 0.5, 1.5, false);
        assert!(!stopped.accept);
        assert_eq!(stopped.distance_delta_km, 0.0);

        let moving = filter.filter(&session, &sample, 4.0, 1.5, false);
        assert!(moving.accept);
        assert!(moving.distance_delta_km > 0.004);
    }

    #[test]
    fn test_no_distance_while_dwelling() {
        let filter = SampleFilter::default();
        let session = session_with_last(LocationSample::new(0.0, 0.0, 0).with_accuracy(5.0));
        let sample = LocationSample::new(0.0001, 0.0, 1000).with_accuracy(5.0);

        let decision = filter.filter(&session, &sample, 0.0, 1.5, true);
        assert!(decision.accept);
        assert_eq!(decision.distance_delta_km, 0.0);
    }
}
