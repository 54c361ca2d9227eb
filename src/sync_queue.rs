//! # Offline Sync Queue
//!
//! Durable outbound requests with priority ordering and bounded retry.
//!
//! ## Request lifecycle
//!
//! ```text
//! Pending ─▶ Sending ─┬─▶ Succeeded        (2xx, removed)
//!                     ├─▶ TerminalFailed   (4xx or retries exhausted, removed)
//!                     └─▶ RetryableFailed  (5xx / 429 / network, backoff)
//! ```
//!
//! The backlog is rewritten to storage after every mutation. A request found
//! in `Sending` on load was interrupted mid-flight and goes back to
//! `Pending`.
//!
//! Drains run only while online, in `(priority, enqueued_at_ms)` order, one
//! request at a time with a small pause between sends. A network failure
//! flips the queue offline and ends the pass. Clones of the queue share one
//! backlog, and only one drain pass runs at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SyncQueueConfig;
use crate::error::Result;
use crate::remote::{HttpMethod, RemoteResponse, ResponseClass, SyncEndpoint};
use crate::storage::KeyValueStore;

/// Storage key of the durable backlog.
pub const QUEUE_KEY: &str = "trip_tracker.sync_queue";

// ============================================================================
// Types
// ============================================================================

/// Send priority. Ordering is `High < Normal < Low`, so ascending sorts
/// put urgent requests first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Persisted state of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestState {
    Pending,
    Sending,
    RetryableFailed,
}

/// A request waiting to be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    pub id: String,
    pub enqueued_at_ms: i64,
    pub endpoint: String,
    pub method: HttpMethod,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub priority: Priority,
    pub state: RequestState,
    /// Not eligible for sending before this time
    #[serde(default)]
    pub next_attempt_at_ms: i64,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Transport-level failure: nothing came back from the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Network error: {message}")]
    Network { message: String },
}

/// Remote endpoint consumed by the queue.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn request(
        &self,
        endpoint: &str,
        method: HttpMethod,
        payload: &serde_json::Value,
    ) -> std::result::Result<RemoteResponse, TransportError>;
}

/// Final disposition of one send attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    Succeeded,
    RetryScheduled { retry_count: u32, delay_ms: i64 },
    TerminalFailed { reason: String },
}

/// One request processed during a drain.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainOutcome {
    pub request_id: String,
    pub endpoint: String,
    pub result: SendResult,
    /// Absent on network failure
    pub response: Option<RemoteResponse>,
}

/// Summary of a drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub outcomes: Vec<DrainOutcome>,
    /// Due requests left unsent because the pass halted
    pub skipped: usize,
    /// The pass ended early on a network failure
    pub went_offline: bool,
}

impl DrainReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.result == SendResult::Succeeded)
            .count()
    }

    pub fn terminal_failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, SendResult::TerminalFailed { .. }))
            .count()
    }
}

// ============================================================================
// Queue
// ============================================================================

struct QueueState {
    requests: Vec<QueuedRequest>,
    online: bool,
}

struct Shared {
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn SyncTransport>,
    config: SyncQueueConfig,
    state: Mutex<QueueState>,
    /// Serializes drain passes; never held by enqueue
    drain_lock: tokio::sync::Mutex<()>,
}

/// Durable prioritized request queue.
///
/// Cloning is cheap and every clone shares one backlog, so a drain can run
/// on its own task while the owner keeps enqueueing. The backlog lock is
/// only held for in-memory updates and the storage write that follows
/// them, never across a network call.
#[derive(Clone)]
pub struct OfflineSyncQueue {
    shared: Arc<Shared>,
}

impl OfflineSyncQueue {
    /// Open the queue, restoring any persisted backlog.
    ///
    /// A corrupted backlog is discarded with a warning.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn SyncTransport>,
        config: SyncQueueConfig,
    ) -> Result<Self> {
        let mut requests: Vec<QueuedRequest> = match store.get(QUEUE_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("[SyncQueue] Discarding corrupted backlog: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        for request in requests.iter_mut().filter(|r| r.state == RequestState::Sending) {
            request.state = RequestState::Pending;
        }
        if !requests.is_empty() {
            info!("[SyncQueue] Restored {} queued requests", requests.len());
        }

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                transport,
                config,
                state: Mutex::new(QueueState {
                    requests,
                    online: true,
                }),
                drain_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.state().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().requests.is_empty()
    }

    pub fn is_online(&self) -> bool {
        self.state().online
    }

    /// Snapshot of the queued requests in send order.
    pub fn requests(&self) -> Vec<QueuedRequest> {
        let mut ordered = self.state().requests.clone();
        ordered.sort_by_key(|r| (r.priority, r.enqueued_at_ms));
        ordered
    }

    pub fn get(&self, id: &str) -> Option<QueuedRequest> {
        self.state().requests.iter().find(|r| r.id == id).cloned()
    }

    /// Append a request to the durable backlog and return its id.
    ///
    /// The request is only kept in memory once the backlog write succeeded.
    pub fn enqueue(
        &self,
        endpoint: impl Into<String>,
        method: HttpMethod,
        payload: serde_json::Value,
        priority: Priority,
        now_ms: i64,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let endpoint = endpoint.into();
        debug!("[SyncQueue] Enqueue {} {} ({:?})", method.as_str(), endpoint, priority);

        let mut state = self.state();
        state.requests.push(QueuedRequest {
            id: id.clone(),
            enqueued_at_ms: now_ms,
            endpoint,
            method,
            payload,
            retry_count: 0,
            priority,
            state: RequestState::Pending,
            next_attempt_at_ms: now_ms,
            last_error: None,
        });
        if let Err(e) = self.write(&state.requests) {
            state.requests.pop();
            return Err(e);
        }
        Ok(id)
    }

    /// Enqueue a trip sync operation.
    pub fn enqueue_endpoint(
        &self,
        endpoint: &SyncEndpoint,
        payload: serde_json::Value,
        priority: Priority,
        now_ms: i64,
    ) -> Result<String> {
        self.enqueue(endpoint.path(), endpoint.method(), payload, priority, now_ms)
    }

    /// Connectivity changed. Coming back online drains the queue.
    pub async fn set_online(&self, online: bool, now_ms: i64) -> Option<DrainReport> {
        let (was_online, queued) = {
            let mut state = self.state();
            let was_online = state.online;
            state.online = online;
            (was_online, state.requests.len())
        };

        if online && !was_online {
            info!("[SyncQueue] Back online, draining {} requests", queued);
            Some(self.drain(now_ms).await)
        } else {
            if !online && was_online {
                info!("[SyncQueue] Offline");
            }
            None
        }
    }

    /// Backoff before retry number `retry_count`: `min(base * 2^retry_count, cap)`.
    pub fn backoff_ms(&self, retry_count: u32) -> i64 {
        let config = &self.shared.config;
        let factor = 1i64 << retry_count.min(32);
        config
            .backoff_base_ms
            .saturating_mul(factor)
            .min(config.backoff_cap_ms)
    }

    /// Send every due request once, in priority order.
    ///
    /// Requests enqueued while a pass is running wait for the next pass.
    pub async fn drain(&self, now_ms: i64) -> DrainReport {
        let _pass = self.shared.drain_lock.lock().await;
        let mut report = DrainReport::default();

        let due: Vec<String> = {
            let state = self.state();
            if !state.online {
                return report;
            }
            let mut ordered: Vec<&QueuedRequest> = state
                .requests
                .iter()
                .filter(|r| r.next_attempt_at_ms <= now_ms)
                .collect();
            ordered.sort_by_key(|r| (r.priority, r.enqueued_at_ms));
            ordered.into_iter().map(|r| r.id.clone()).collect()
        };

        let delay_ms = self.shared.config.inter_request_delay_ms;
        for (i, id) in due.iter().enumerate() {
            if report.went_offline || !self.is_online() {
                report.skipped = due.len() - i;
                break;
            }
            if i > 0 && delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            let request = {
                let mut state = self.state();
                let request = match state.requests.iter_mut().find(|r| &r.id == id) {
                    Some(request) => {
                        request.state = RequestState::Sending;
                        request.clone()
                    }
                    None => continue,
                };
                self.write_logged(&state.requests);
                request
            };

            let sent = self
                .shared
                .transport
                .request(&request.endpoint, request.method, &request.payload)
                .await;

            let mut state = self.state();
            let outcome = match sent {
                Ok(response) => match response.class() {
                    ResponseClass::Success => {
                        state.requests.retain(|r| &r.id != id);
                        debug!("[SyncQueue] {} {} -> {}", request.method.as_str(), request.endpoint, response.status);
                        DrainOutcome {
                            request_id: id.clone(),
                            endpoint: request.endpoint.clone(),
                            result: SendResult::Succeeded,
                            response: Some(response),
                        }
                    }
                    ResponseClass::ClientError => {
                        state.requests.retain(|r| &r.id != id);
                        warn!(
                            "[SyncQueue] Dropping {} {}: HTTP {}",
                            request.method.as_str(),
                            request.endpoint,
                            response.status
                        );
                        DrainOutcome {
                            request_id: id.clone(),
                            endpoint: request.endpoint.clone(),
                            result: SendResult::TerminalFailed {
                                reason: format!("HTTP {}", response.status),
                            },
                            response: Some(response),
                        }
                    }
                    ResponseClass::RateLimited | ResponseClass::ServerError => {
                        let result =
                            self.schedule_retry(&mut state.requests, id, format!("HTTP {}", response.status), now_ms);
                        DrainOutcome {
                            request_id: id.clone(),
                            endpoint: request.endpoint.clone(),
                            result,
                            response: Some(response),
                        }
                    }
                },
                Err(TransportError::Network { message }) => {
                    let result = self.schedule_retry(&mut state.requests, id, message, now_ms);
                    state.online = false;
                    report.went_offline = true;
                    warn!("[SyncQueue] Network failure, halting drain");
                    DrainOutcome {
                        request_id: id.clone(),
                        endpoint: request.endpoint.clone(),
                        result,
                        response: None,
                    }
                }
            };

            report.outcomes.push(outcome);
            self.write_logged(&state.requests);
        }

        if !report.outcomes.is_empty() {
            info!(
                "[SyncQueue] Drain: {} sent, {} dropped, {} remaining",
                report.succeeded(),
                report.terminal_failures(),
                self.len()
            );
        }
        report
    }

    /// Send once without queueing, ignoring the outcome.
    ///
    /// Used for terminal requests that must not block teardown. Requires a
    /// running tokio runtime; without one the request is skipped.
    pub fn fire_and_forget(&self, endpoint: &SyncEndpoint, payload: serde_json::Value) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("[SyncQueue] No runtime for fire-and-forget {}", endpoint.path());
                return;
            }
        };

        let transport = Arc::clone(&self.shared.transport);
        let path = endpoint.path();
        let method = endpoint.method();
        handle.spawn(async move {
            match transport.request(&path, method, &payload).await {
                Ok(response) => debug!("[SyncQueue] Fire-and-forget {} -> {}", path, response.status),
                Err(e) => debug!("[SyncQueue] Fire-and-forget {} failed: {}", path, e),
            }
        });
    }

    /// Drop every queued request.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state();
        state.requests.clear();
        self.write(&state.requests)
    }

    /// A poisoned lock still holds a consistent backlog: every mutation is
    /// a single push, retain or field update.
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_retry(
        &self,
        requests: &mut Vec<QueuedRequest>,
        id: &str,
        error: String,
        now_ms: i64,
    ) -> SendResult {
        let max_retries = self.shared.config.max_retries;
        let idx = match requests.iter().position(|r| r.id == id) {
            Some(idx) => idx,
            None => {
                return SendResult::TerminalFailed {
                    reason: "request vanished".to_string(),
                }
            }
        };

        let retry_count = requests[idx].retry_count + 1;
        if retry_count >= max_retries {
            let request = requests.remove(idx);
            warn!(
                "[SyncQueue] Giving up on {} after {} attempts: {}",
                request.endpoint, retry_count, error
            );
            return SendResult::TerminalFailed {
                reason: format!("retries exhausted: {}", error),
            };
        }

        let delay_ms = self.backoff_ms(retry_count);
        let request = &mut requests[idx];
        request.retry_count = retry_count;
        request.state = RequestState::RetryableFailed;
        request.next_attempt_at_ms = now_ms + delay_ms;
        request.last_error = Some(error);
        debug!(
            "[SyncQueue] Retry {} for {} in {} ms",
            retry_count, request.endpoint, delay_ms
        );
        SendResult::RetryScheduled {
            retry_count,
            delay_ms,
        }
    }

    fn write(&self, requests: &[QueuedRequest]) -> Result<()> {
        let bytes = serde_json::to_vec(requests)?;
        self.shared.store.put(QUEUE_KEY, &bytes)
    }

    fn write_logged(&self, requests: &[QueuedRequest]) {
        if let Err(e) = self.write(requests) {
            warn!("[SyncQueue] Failed to persist backlog: {}", e);
        }
    }
}
