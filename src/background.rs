//! Background execution entry point.
//!
//! When the OS wakes the app with a batch of deferred fixes there is no live
//! accumulator. Each batch rebuilds one from the persisted snapshot, applies
//! the fixes, and checkpoints the result so the foreground can adopt it on
//! resume.

use std::sync::Arc;

use log::{debug, info};

use crate::config::TrackerConfig;
use crate::error::Result;
use crate::persistence::{CheckpointSource, PersistenceBridge};
use crate::reconcile::ReconciliationService;
use crate::storage::KeyValueStore;
use crate::{LocationSample, TripStats};

/// Applies deferred location batches to the persisted session.
pub struct BackgroundTracker {
    bridge: PersistenceBridge,
    reconciliation: ReconciliationService,
}

impl BackgroundTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, config: TrackerConfig) -> Self {
        Self {
            bridge: PersistenceBridge::new(
                store,
                CheckpointSource::Background,
                config.checkpoint.clone(),
            ),
            reconciliation: ReconciliationService::new(config),
        }
    }

    /// Apply a batch of fixes delivered at `now_ms`.
    ///
    /// Returns `None` when there is no persisted session (the trip ended
    /// while the batch was pending); the batch is discarded. Fixes are
    /// replayed on their own timestamps since they were buffered by the OS.
    pub fn run_batch(&mut self, samples: &[LocationSample], now_ms: i64) -> Result<Option<TripStats>> {
        let state = match self.bridge.load()? {
            Some(state) => state,
            None => {
                debug!("[BackgroundTracker] No persisted session, dropping {} fixes", samples.len());
                return Ok(None);
            }
        };

        let seed_ms = state.last_timestamp_ms.unwrap_or(now_ms);
        let mut tracker = self.reconciliation.resume_from(&state, seed_ms);

        let mut accepted = 0;
        for sample in samples {
            if tracker.on_sample(*sample, sample.timestamp_ms)?.accepted {
                accepted += 1;
            }
        }

        let session = match tracker.session() {
            Some(session) => session,
            None => return Ok(None),
        };
        self.bridge.checkpoint(session, now_ms)?;

        info!(
            "[BackgroundTracker] Batch of {} fixes ({} accepted), now {:.3} km",
            samples.len(),
            accepted,
            session.cumulative_distance_km
        );
        Ok(Some(session.stats(now_ms)))
    }
}
