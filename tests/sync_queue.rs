//! Offline queue behavior across restarts and connectivity changes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use trip_tracker::{
    FileStore, HttpMethod, KeyValueStore, OfflineSyncQueue, Priority, RemoteResponse,
    SyncEndpoint, SyncQueueConfig, SyncTransport, TransportError,
};

/// Online transport that records every request in order.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, HttpMethod)>>,
}

#[async_trait]
impl SyncTransport for Recorder {
    async fn request(
        &self,
        endpoint: &str,
        method: HttpMethod,
        _payload: &serde_json::Value,
    ) -> Result<RemoteResponse, TransportError> {
        self.seen.lock().unwrap().push((endpoint.to_string(), method));
        Ok(RemoteResponse::status_only(204))
    }
}

/// Transport with no network at all.
struct Unreachable;

#[async_trait]
impl SyncTransport for Unreachable {
    async fn request(
        &self,
        _endpoint: &str,
        _method: HttpMethod,
        _payload: &serde_json::Value,
    ) -> Result<RemoteResponse, TransportError> {
        Err(TransportError::Network {
            message: "no route to host".to_string(),
        })
    }
}

fn config() -> SyncQueueConfig {
    SyncQueueConfig {
        inter_request_delay_ms: 0,
        ..SyncQueueConfig::default()
    }
}

#[tokio::test]
async fn test_offline_backlog_replayed_after_restart() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();

    {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).unwrap());
        let queue = OfflineSyncQueue::open(store, Arc::new(Unreachable), config()).unwrap();

        let progress = SyncEndpoint::TripProgress {
            session_id: "trip-1".to_string(),
        };
        let end = SyncEndpoint::TripEnd {
            session_id: "trip-1".to_string(),
        };
        queue
            .enqueue_endpoint(&progress, json!({"distanceKm": 1.0}), Priority::Low, 1_000)
            .unwrap();
        queue
            .enqueue_endpoint(&end, json!({"distanceKm": 2.0}), Priority::High, 2_000)
            .unwrap();

        let report = queue.drain(2_000).await;
        assert!(report.went_offline);
        assert!(!queue.is_online());
        assert_eq!(queue.len(), 2);
    }

    // New process, network is back
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let recorder = Arc::new(Recorder::default());
    let queue = OfflineSyncQueue::open(store, recorder.clone(), config()).unwrap();
    assert_eq!(queue.len(), 2);

    // The failed request is backing off; only the other one is due yet
    let report = queue.drain(2_500).await;
    assert_eq!(report.succeeded(), 1);
    assert_eq!(queue.len(), 1);

    let report = queue.drain(120_000).await;
    assert_eq!(report.succeeded(), 1);
    assert!(queue.is_empty());

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.contains(&("/trips/trip-1/end".to_string(), HttpMethod::Post)));
    assert!(seen.contains(&("/trips/trip-1/progress".to_string(), HttpMethod::Put)));
}

#[tokio::test]
async fn test_reconnect_drains_in_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let recorder = Arc::new(Recorder::default());
    let queue = OfflineSyncQueue::open(store, recorder.clone(), config()).unwrap();

    assert!(queue.set_online(false, 0).await.is_none());
    queue.enqueue("/low", HttpMethod::Post, json!({}), Priority::Low, 1).unwrap();
    queue.enqueue("/normal", HttpMethod::Post, json!({}), Priority::Normal, 2).unwrap();
    queue.enqueue("/high", HttpMethod::Post, json!({}), Priority::High, 3).unwrap();
    assert!(queue.drain(10).await.outcomes.is_empty());

    let report = queue.set_online(true, 10).await.unwrap();
    assert_eq!(report.succeeded(), 3);

    let order: Vec<String> = recorder
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|(endpoint, _)| endpoint.clone())
        .collect();
    assert_eq!(order, vec!["/high", "/normal", "/low"]);
}
