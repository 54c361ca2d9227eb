//! # Trip Controller
//!
//! Foreground orchestration of a trip: owns the live accumulator, the
//! foreground checkpoint bridge and the sync queue, and wires lifecycle
//! events between them.
//!
//! Samples arrive through a bounded channel and are processed one at a time
//! on the task that drives [`TripController::run`], so no two samples are
//! ever applied concurrently. Sync drains run on a separate task sharing the
//! queue, so a slow or hung request never holds up sample processing.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;

use crate::accumulator::TrackAccumulator;
use crate::config::TrackerConfig;
use crate::error::{OptionExt, Result, TrackerError};
use crate::persistence::{CheckpointSource, CheckpointWrite, PersistedState, PersistenceBridge};
use crate::reconcile::{ColdStart, ReconciliationService, ResumeOutcome};
use crate::remote::{SyncEndpoint, TripSyncReply};
use crate::storage::KeyValueStore;
use crate::sync_queue::{DrainReport, OfflineSyncQueue, Priority, SyncTransport};
use crate::{Destination, LocationSample, TripStats};

/// Receives a stats update after every accumulation step.
pub trait StatsSink: Send + Sync {
    fn on_stats(&self, stats: &TripStats);
}

impl<F> StatsSink for F
where
    F: Fn(&TripStats) + Send + Sync,
{
    fn on_stats(&self, stats: &TripStats) {
        self(stats)
    }
}

/// Bounded sample channel feeding [`TripController::run`].
pub fn sample_channel(
    capacity: usize,
) -> (mpsc::Sender<LocationSample>, mpsc::Receiver<LocationSample>) {
    mpsc::channel(capacity.max(1))
}

/// What a fresh process found when it looked for an interrupted trip.
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    Nothing,
    /// Tracking continues from the snapshot
    Resumed(TripStats),
    /// Caller decides: [`TripController::adopt_orphan`] or [`TripController::force_clear`]
    Orphaned(PersistedState),
}

/// Foreground owner of a trip.
pub struct TripController<S: StatsSink> {
    config: TrackerConfig,
    tracker: TrackAccumulator,
    bridge: PersistenceBridge,
    queue: OfflineSyncQueue,
    reconciliation: ReconciliationService,
    sink: S,
    last_progress_sync_ms: Option<i64>,
    /// Wakes the sync task after an enqueue
    sync_wake: Arc<Notify>,
}

impl<S: StatsSink> TripController<S> {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn SyncTransport>,
        config: TrackerConfig,
        sink: S,
    ) -> Result<Self> {
        config.validate()?;
        let queue = OfflineSyncQueue::open(store.clone(), transport, config.sync.clone())?;

        Ok(Self {
            tracker: TrackAccumulator::new(config.clone()),
            bridge: PersistenceBridge::new(store, CheckpointSource::Foreground, config.checkpoint.clone()),
            queue,
            reconciliation: ReconciliationService::new(config.clone()),
            config,
            sink,
            last_progress_sync_ms: None,
            sync_wake: Arc::new(Notify::new()),
        })
    }

    pub fn is_active(&self) -> bool {
        self.tracker.is_active()
    }

    pub fn tracker(&self) -> &TrackAccumulator {
        &self.tracker
    }

    pub fn queue(&self) -> &OfflineSyncQueue {
        &self.queue
    }

    pub fn stats(&self, now_ms: i64) -> Result<TripStats> {
        self.tracker.stats(now_ms)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a trip and write its first checkpoint.
    pub fn start(&mut self, destination: Option<Destination>, now_ms: i64) -> Result<TripStats> {
        let session = self.tracker.start(now_ms, destination)?;
        self.bridge.checkpoint(session, now_ms)?;
        self.last_progress_sync_ms = None;

        let stats = self.tracker.stats(now_ms)?;
        self.sink.on_stats(&stats);
        Ok(stats)
    }

    /// Apply one sample, emit stats, and checkpoint/sync when due.
    ///
    /// When the periodic checkpoint finds a newer background snapshot, that
    /// snapshot is reconciled in before anything else is written. Checkpoint
    /// and enqueue failures are logged; tracking continues.
    pub fn handle_sample(&mut self, sample: LocationSample, now_ms: i64) -> Result<TripStats> {
        let outcome = self.tracker.on_sample(sample, now_ms)?;
        self.sink.on_stats(&outcome.stats);
        let mut stats = outcome.stats;

        let superseded = match self.tracker.session() {
            Some(session) => match self.bridge.maybe_checkpoint(session, now_ms) {
                Ok(CheckpointWrite::Superseded { .. }) => true,
                Ok(_) => false,
                Err(e) => {
                    warn!("[TripController] Checkpoint failed: {}", e);
                    false
                }
            },
            None => false,
        };
        if superseded {
            match self.resume(now_ms) {
                Ok(ResumeOutcome::AdoptedPersisted { .. }) => stats = self.tracker.stats(now_ms)?,
                Ok(_) => {}
                Err(e) => warn!("[TripController] Reconciling newer snapshot failed: {}", e),
            }
        }

        let sync_due = self
            .last_progress_sync_ms
            .map_or(true, |last| now_ms - last >= self.config.sync.sync_interval_ms);
        if sync_due {
            let endpoint = SyncEndpoint::TripProgress {
                session_id: stats.session_id.clone(),
            };
            let payload = endpoint.payload(Some(&stats), now_ms);
            match self.queue.enqueue_endpoint(&endpoint, payload, Priority::Low, now_ms) {
                Ok(_) => {
                    self.last_progress_sync_ms = Some(now_ms);
                    self.sync_wake.notify_one();
                }
                Err(e) => warn!("[TripController] Failed to queue progress sync: {}", e),
            }
        }

        Ok(stats)
    }

    /// App is going to the background.
    pub fn suspend(&mut self, now_ms: i64) -> Result<Option<u64>> {
        self.reconciliation.on_suspend(&self.tracker, &mut self.bridge, now_ms)
    }

    /// App is back in the foreground.
    pub fn resume(&mut self, now_ms: i64) -> Result<ResumeOutcome> {
        let outcome = self
            .reconciliation
            .on_resume(&mut self.tracker, &mut self.bridge, now_ms)?;
        if let ResumeOutcome::AdoptedPersisted { .. } = outcome {
            let stats = self.tracker.stats(now_ms)?;
            self.sink.on_stats(&stats);
        }
        Ok(outcome)
    }

    /// Look for an interrupted trip after a process restart.
    pub fn recover(&mut self, background_active: bool, now_ms: i64) -> Result<Recovery> {
        if self.tracker.is_active() {
            return Ok(Recovery::Nothing);
        }

        match self
            .reconciliation
            .on_cold_start(&mut self.bridge, background_active, now_ms)?
        {
            ColdStart::NoSession => Ok(Recovery::Nothing),
            ColdStart::Recovered(tracker) => {
                self.tracker = tracker;
                let stats = self.tracker.stats(now_ms)?;
                self.sink.on_stats(&stats);
                Ok(Recovery::Resumed(stats))
            }
            ColdStart::Orphaned(state) => Ok(Recovery::Orphaned(state)),
        }
    }

    /// Continue an orphaned trip found by [`TripController::recover`].
    pub fn adopt_orphan(&mut self, state: &PersistedState, now_ms: i64) -> Result<TripStats> {
        if let Some(session) = self.tracker.session() {
            return Err(TrackerError::SessionAlreadyActive {
                session_id: session.session_id.clone(),
            });
        }

        self.tracker = self.reconciliation.resume_from(state, now_ms);
        let session = self.tracker.session().ok_or_internal("resumed tracker has no session")?;
        self.bridge.checkpoint(session, now_ms)?;
        info!("[TripController] Adopted orphaned session {}", state.session_id);

        let stats = self.tracker.stats(now_ms)?;
        self.sink.on_stats(&stats);
        Ok(stats)
    }

    /// Finish the trip: final checkpoint, queue the end request, clear state.
    pub async fn stop(&mut self, now_ms: i64) -> Result<TripStats> {
        let session = self.tracker.session().ok_or_no_session()?;
        let stats = session.stats(now_ms);
        self.bridge.checkpoint(session, now_ms)?;

        let endpoint = SyncEndpoint::TripEnd {
            session_id: stats.session_id.clone(),
        };
        let payload = endpoint.payload(Some(&stats), now_ms);
        self.queue
            .enqueue_endpoint(&endpoint, payload, Priority::High, now_ms)?;

        // The end request is durable now; the snapshot can go
        self.bridge.clear()?;
        let final_stats = self.tracker.end(now_ms)?;
        self.last_progress_sync_ms = None;

        let report = self.queue.drain(now_ms).await;
        self.log_report(&report);
        Ok(final_stats)
    }

    /// Drop the current trip without a normal end.
    ///
    /// Sends a best-effort force-end request for the session (live or
    /// persisted) and clears all local state.
    pub fn force_clear(&mut self, now_ms: i64) -> Result<()> {
        let session_id = match self.tracker.session() {
            Some(session) => Some(session.session_id.clone()),
            None => self.bridge.active_session_id()?,
        };

        if let Some(session_id) = session_id {
            warn!("[TripController] Force-clearing session {}", session_id);
            let endpoint = SyncEndpoint::TripForceEnd { session_id };
            let payload = endpoint.payload(None, now_ms);
            self.queue.fire_and_forget(&endpoint, payload);
        }

        self.tracker.clear();
        self.last_progress_sync_ms = None;
        self.bridge.clear()
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Connectivity changed.
    pub async fn set_online(&mut self, online: bool, now_ms: i64) -> Result<()> {
        match self.queue.set_online(online, now_ms).await {
            Some(report) => self.apply_report(&report, now_ms),
            None => Ok(()),
        }
    }

    /// Drain due requests and act on the replies.
    pub async fn sync(&mut self, now_ms: i64) -> Result<DrainReport> {
        let report = self.queue.drain(now_ms).await;
        self.apply_report(&report, now_ms)?;
        Ok(report)
    }

    /// Process samples from `receiver` until every sender is dropped.
    ///
    /// A sync task drains the queue every sync interval and whenever a
    /// progress update is queued; its reports come back here. Closing the
    /// channel cancels the sync task. Requests it was sending stay queued
    /// and go out on the next drain.
    pub async fn run(&mut self, mut receiver: mpsc::Receiver<LocationSample>) -> Result<()> {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let period = Duration::from_millis(self.config.sync.sync_interval_ms.max(1) as u64);
        let syncer = tokio::spawn(sync_loop(
            self.queue.clone(),
            Arc::clone(&self.sync_wake),
            period,
            report_tx,
        ));

        let result = loop {
            tokio::select! {
                sample = receiver.recv() => {
                    let sample = match sample {
                        Some(sample) => sample,
                        None => break Ok(()),
                    };
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    match self.handle_sample(sample, now_ms) {
                        Ok(_) => {}
                        Err(TrackerError::NoActiveSession) => {
                            debug!("[TripController] Sample without active session dropped");
                        }
                        Err(e) => break Err(e),
                    }
                }
                Some(report) = report_rx.recv() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    if let Err(e) = self.apply_report(&report, now_ms) {
                        break Err(e);
                    }
                }
            }
        };

        syncer.abort();
        let now_ms = chrono::Utc::now().timestamp_millis();
        while let Ok(report) = report_rx.try_recv() {
            self.apply_report(&report, now_ms)?;
        }
        debug!("[TripController] Sample channel closed");
        result
    }

    /// The service may tell us a trip is gone; stop tracking it.
    fn apply_report(&mut self, report: &DrainReport, now_ms: i64) -> Result<()> {
        self.log_report(report);

        let live_id = match self.tracker.session() {
            Some(session) => session.session_id.clone(),
            None => return Ok(()),
        };
        let progress_path = SyncEndpoint::TripProgress {
            session_id: live_id.clone(),
        }
        .path();

        let abandoned = report.outcomes.iter().any(|outcome| {
            outcome.endpoint == progress_path
                && outcome.response.as_ref().map_or(false, |r| {
                    matches!(TripSyncReply::decode(r), TripSyncReply::SessionAbandoned { .. })
                })
        });

        if abandoned {
            warn!("[TripController] Service abandoned session {}", live_id);
            self.force_clear(now_ms)?;
        }
        Ok(())
    }

    fn log_report(&self, report: &DrainReport) {
        if report.went_offline {
            info!(
                "[TripController] Sync halted offline, {} requests queued",
                self.queue.len()
            );
        }
    }
}

/// Drain `queue` on every tick or wake-up. Runs until aborted.
async fn sync_loop(
    queue: OfflineSyncQueue,
    wake: Arc<Notify>,
    period: Duration,
    reports: mpsc::UnboundedSender<DrainReport>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }
        if !queue.is_online() || queue.is_empty() {
            continue;
        }

        let report = queue.drain(chrono::Utc::now().timestamp_millis()).await;
        if !report.outcomes.is_empty() && reports.send(report).is_err() {
            break;
        }
    }
    debug!("[TripController] Sync task stopped");
}
