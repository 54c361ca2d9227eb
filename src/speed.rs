//! Windowed speed estimation.
//!
//! Device-reported speed spikes and drops at low update rates. Speed is
//! instead derived from the displacement between the oldest and newest
//! samples of a short sliding window, falling back to the reported value
//! only when no plausible position-derived speed exists. A window whose
//! displacement stays inside the reported accuracy radius reads as zero.

use std::collections::VecDeque;

use crate::accumulator::TrackSession;
use crate::config::SpeedConfig;
use crate::geo_utils::haversine_distance;
use crate::LocationSample;

/// A sample in the estimation window with its arrival time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowEntry {
    pub sample: LocationSample,
    pub received_at_ms: i64,
}

/// Derives a smoothed speed from recent accepted samples.
#[derive(Debug, Clone, Default)]
pub struct SpeedEstimator {
    config: SpeedConfig,
}

impl SpeedEstimator {
    pub fn new(config: SpeedConfig) -> Self {
        Self { config }
    }

    /// Push `sample` into the session window and return the speed in m/s.
    pub fn estimate(&self, session: &mut TrackSession, sample: &LocationSample, now_ms: i64) -> f64 {
        let window = &mut session.recent_window;
        window.push_back(WindowEntry {
            sample: *sample,
            received_at_ms: now_ms,
        });
        self.evict(window, now_ms);

        match self.windowed_speed(window) {
            Some(speed) if self.is_plausible(speed) => speed,
            _ => sample
                .reported_speed_mps
                .filter(|&s| self.is_plausible(s))
                .unwrap_or(0.0),
        }
    }

    /// Replace the window with a single seed entry.
    ///
    /// Used after adopting persisted totals so the next live sample measures
    /// speed against the last known position instead of starting cold.
    pub fn reseed(&self, session: &mut TrackSession, sample: &LocationSample, now_ms: i64) {
        session.recent_window.clear();
        session.recent_window.push_back(WindowEntry {
            sample: *sample,
            received_at_ms: now_ms,
        });
    }

    fn evict(&self, window: &mut VecDeque<WindowEntry>, now_ms: i64) {
        while window
            .front()
            .map_or(false, |e| now_ms - e.received_at_ms > self.config.window_ms)
        {
            window.pop_front();
        }
        while window.len() > self.config.max_window_entries {
            window.pop_front();
        }
    }

    fn windowed_speed(&self, window: &VecDeque<WindowEntry>) -> Option<f64> {
        if window.len() < 2 {
            return None;
        }
        let oldest = window.front()?;
        let newest = window.back()?;
        let elapsed_s = (newest.sample.timestamp_ms - oldest.sample.timestamp_ms) as f64 / 1000.0;
        if elapsed_s <= 0.0 {
            return None;
        }
        let displacement = haversine_distance(&oldest.sample, &newest.sample);
        // Movement inside the fix uncertainty is indistinguishable from jitter
        if displacement <= noise_radius(&oldest.sample, &newest.sample) {
            return Some(0.0);
        }
        Some(displacement / elapsed_s)
    }

    fn is_plausible(&self, speed_mps: f64) -> bool {
        speed_mps.is_finite() && speed_mps >= 0.0 && speed_mps <= self.config.max_plausible_speed_mps
    }
}

fn noise_radius(a: &LocationSample, b: &LocationSample) -> f64 {
    a.accuracy_meters
        .unwrap_or(0.0)
        .max(b.accuracy_meters.unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TrackSession {
        TrackSession::new("test".to_string(), 0)
    }

    #[test]
    fn test_single_entry_uses_reported_speed() {
        let estimator = SpeedEstimator::default();
        let mut s = session();
        let sample = LocationSample::new(0.0, 0.0, 0).with_speed(7.5);
        assert_eq!(estimator.estimate(&mut s, &sample, 0), 7.5);

        let mut s = session();
        let sample = LocationSample::new(0.0, 0.0, 0);
        assert_eq!(estimator.estimate(&mut s, &sample, 0), 0.0);
    }

    #[test]
    fn test_windowed_speed_ignores_reported_spike() {
        let estimator = SpeedEstimator::default();
        let mut s = session();
        for i in 0..4 {
            let t = i * 1000;
            // Reported speed is wildly wrong; position moves ~11.1 m/s
            let sample = LocationSample::new(i as f64 * 0.0001, 0.0, t).with_speed(60.0);
            let speed = estimator.estimate(&mut s, &sample, t);
            if i > 0 {
                assert!((speed - 11.12).abs() < 0.1, "got {}", speed);
            }
        }
    }

    #[test]
    fn test_window_evicts_old_entries() {
        let estimator = SpeedEstimator::default();
        let mut s = session();
        for i in 0..10 {
            let t = i * 1000;
            let sample = LocationSample::new(i as f64 * 0.0001, 0.0, t);
            estimator.estimate(&mut s, &sample, t);
        }
        // Entries older than 3s are gone: t = 6, 7, 8, 9 remain
        assert_eq!(s.recent_window.len(), 4);
        assert_eq!(s.recent_window.front().unwrap().received_at_ms, 6000);
    }

    #[test]
    fn test_implausible_window_falls_back() {
        let estimator = SpeedEstimator::default();
        let mut s = session();
        estimator.estimate(&mut s, &LocationSample::new(0.0, 0.0, 0), 0);
        // 1 degree in one second is far above the ceiling
        let jump = LocationSample::new(1.0, 0.0, 1000).with_speed(12.0);
        assert_eq!(estimator.estimate(&mut s, &jump, 1000), 12.0);

        let mut s = session();
        estimator.estimate(&mut s, &LocationSample::new(0.0, 0.0, 0), 0);
        let jump = LocationSample::new(1.0, 0.0, 1000).with_speed(900.0);
        assert_eq!(estimator.estimate(&mut s, &jump, 1000), 0.0);
    }

    #[test]
    fn test_reseed() {
        let estimator = SpeedEstimator::default();
        let mut s = session();
        for i in 0..3 {
            let sample = LocationSample::new(i as f64 * 0.0001, 0.0, i * 1000);
            estimator.estimate(&mut s, &sample, i * 1000);
        }
        let seed = LocationSample::new(0.01, 0.0, 60_000);
        estimator.reseed(&mut s, &seed, 60_000);
        assert_eq!(s.recent_window.len(), 1);

        let next = LocationSample::new(0.0101, 0.0, 61_000);
        let speed = estimator.estimate(&mut s, &next, 61_000);
        assert!((speed - 11.12).abs() < 0.1);
    }

    #[test]
    fn test_jitter_inside_accuracy_reads_as_stopped() {
        let estimator = SpeedEstimator::default();
        let mut s = session();
        for t in 0..6 {
            // ~5.6 m back and forth with 10 m accuracy
            let lat = if t % 2 == 0 { 0.0 } else { 0.00005 };
            let sample = LocationSample::new(lat, 0.0, t * 1000).with_accuracy(10.0);
            assert_eq!(estimator.estimate(&mut s, &sample, t * 1000), 0.0);
        }

        // Same displacement with a tight fix is real movement
        let mut s = session();
        let a = LocationSample::new(0.0, 0.0, 0).with_accuracy(3.0);
        let b = LocationSample::new(0.00005, 0.0, 1000).with_accuracy(3.0);
        estimator.estimate(&mut s, &a, 0);
        assert!(estimator.estimate(&mut s, &b, 1000) > 5.0);
    }
}
