//! Debounced stationary detection.
//!
//! ```text
//!              speed < threshold              held for debounce
//!   Moving ─────────────────────▶ Candidate ─────────────────▶ Dwelling
//!     ▲                               │                           │
//!     └───────────────────────────────┴───────────────────────────┘
//!                        speed >= threshold (immediate)
//! ```
//!
//! A single low reading never freezes the display; resuming movement is
//! never delayed.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::accumulator::TrackSession;
use crate::config::DwellConfig;

/// Stationary state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum DwellState {
    #[default]
    Moving,
    /// Low speed observed, debounce running
    Candidate {
        #[serde(rename = "sinceMs")]
        since_ms: i64,
    },
    /// Low speed held for the full debounce interval
    Dwelling {
        #[serde(rename = "sinceMs")]
        since_ms: i64,
    },
}

impl DwellState {
    pub fn is_dwelling(&self) -> bool {
        matches!(self, DwellState::Dwelling { .. })
    }
}

/// Drives the [`DwellState`] of a session from speed estimates.
#[derive(Debug, Clone, Default)]
pub struct DwellDetector {
    config: DwellConfig,
}

impl DwellDetector {
    pub fn new(config: DwellConfig) -> Self {
        Self { config }
    }

    /// Speed at or above which the session counts as genuinely moving.
    pub fn moving_threshold_mps(&self) -> f64 {
        self.config.stationary_speed_mps
    }

    /// Apply one speed reading taken at `at_ms` and return the new state.
    pub fn update(&self, session: &mut TrackSession, speed_mps: f64, at_ms: i64) -> DwellState {
        let low = speed_mps < self.config.stationary_speed_mps;
        let next = match (session.dwell_state, low) {
            (_, false) => DwellState::Moving,
            (DwellState::Moving, true) => DwellState::Candidate { since_ms: at_ms },
            (DwellState::Candidate { since_ms }, true) => {
                if at_ms - since_ms >= self.config.debounce_ms {
                    DwellState::Dwelling { since_ms }
                } else {
                    DwellState::Candidate { since_ms }
                }
            }
            (dwelling @ DwellState::Dwelling { .. }, true) => dwelling,
        };

        if next.is_dwelling() != session.dwell_state.is_dwelling() {
            debug!(
                "[DwellDetector] {} at {} ({:.2} m/s)",
                if next.is_dwelling() { "Dwelling" } else { "Resumed moving" },
                at_ms,
                speed_mps
            );
        }

        session.dwell_state = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TrackSession {
        TrackSession::new("test".to_string(), 0)
    }

    #[test]
    fn test_debounce_before_dwelling() {
        let detector = DwellDetector::default();
        let mut s = session();

        assert_eq!(
            detector.update(&mut s, 0.2, 1000),
            DwellState::Candidate { since_ms: 1000 }
        );
        for t in [2000, 3000, 4000, 5000] {
            assert!(!detector.update(&mut s, 0.2, t).is_dwelling());
        }
        assert_eq!(
            detector.update(&mut s, 0.2, 6000),
            DwellState::Dwelling { since_ms: 1000 }
        );
    }

    #[test]
    fn test_single_low_reading_does_not_dwell() {
        let detector = DwellDetector::default();
        let mut s = session();

        detector.update(&mut s, 0.1, 1000);
        assert_eq!(detector.update(&mut s, 5.0, 2000), DwellState::Moving);
        // Debounce restarts from scratch
        assert_eq!(
            detector.update(&mut s, 0.1, 7000),
            DwellState::Candidate { since_ms: 7000 }
        );
    }

    #[test]
    fn test_resume_is_immediate() {
        let detector = DwellDetector::default();
        let mut s = session();
        s.dwell_state = DwellState::Dwelling { since_ms: 0 };

        assert_eq!(detector.update(&mut s, 0.3, 60_000).is_dwelling(), true);
        assert_eq!(detector.update(&mut s, 2.0, 61_000), DwellState::Moving);
    }

    #[test]
    fn test_state_serializes_with_tag() {
        let json = serde_json::to_string(&DwellState::Dwelling { since_ms: 42 }).unwrap();
        assert_eq!(json, r#"{"state":"dwelling","sinceMs":42}"#);
        let back: DwellState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DwellState::Dwelling { since_ms: 42 });
    }
}
