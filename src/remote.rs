//! Remote sync endpoints and the single decode boundary for their replies.
//!
//! Everything that talks to the remote service goes through the sync queue as
//! `(endpoint, method, payload)`. Replies are classified once here; call
//! sites match on [`ResponseClass`] and [`TripSyncReply`] instead of poking
//! at optional JSON fields.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::TripStats;

/// HTTP-shaped request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Trip sync operations the tracker pushes upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEndpoint {
    /// Periodic progress update during the trip
    TripProgress { session_id: String },
    /// Normal end of trip with final stats
    TripEnd { session_id: String },
    /// Best-effort terminal request for an abandoned session
    TripForceEnd { session_id: String },
}

impl SyncEndpoint {
    pub fn path(&self) -> String {
        match self {
            SyncEndpoint::TripProgress { session_id } => format!("/trips/{}/progress", session_id),
            SyncEndpoint::TripEnd { session_id } => format!("/trips/{}/end", session_id),
            SyncEndpoint::TripForceEnd { session_id } => format!("/trips/{}/force-end", session_id),
        }
    }

    pub fn method(&self) -> HttpMethod {
        match self {
            SyncEndpoint::TripProgress { .. } => HttpMethod::Put,
            SyncEndpoint::TripEnd { .. } | SyncEndpoint::TripForceEnd { .. } => HttpMethod::Post,
        }
    }

    /// JSON body for this endpoint.
    pub fn payload(&self, stats: Option<&TripStats>, now_ms: i64) -> serde_json::Value {
        match (self, stats) {
            (SyncEndpoint::TripForceEnd { .. }, _) | (_, None) => json!({ "sentAtMs": now_ms }),
            (_, Some(stats)) => json!({
                "sentAtMs": now_ms,
                "distanceKm": stats.distance_km,
                "movingTimeS": stats.moving_time_s,
                "avgSpeedKmh": stats.avg_speed_kmh,
                "topSpeedKmh": stats.top_speed_kmh,
                "currentSpeedKmh": stats.current_speed_kmh,
                "progress": stats.progress,
                "distanceRemainingKm": stats.distance_remaining_km,
            }),
        }
    }
}

/// Raw reply from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RemoteResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn status_only(status: u16) -> Self {
        Self::new(status, Vec::new())
    }

    pub fn class(&self) -> ResponseClass {
        ResponseClass::from_status(self.status)
    }
}

/// Retry classification of a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 2xx
    Success,
    /// 4xx that will never succeed on retry (also unexpected 1xx/3xx)
    ClientError,
    /// 408 / 429: the server asked us to come back later
    RateLimited,
    /// 5xx
    ServerError,
}

impl ResponseClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => ResponseClass::Success,
            408 | 429 => ResponseClass::RateLimited,
            500..=599 => ResponseClass::ServerError,
            _ => ResponseClass::ClientError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ResponseClass::RateLimited | ResponseClass::ServerError)
    }
}

/// Decoded reply to a trip sync request.
#[derive(Debug, Clone, PartialEq)]
pub enum TripSyncReply {
    Acknowledged { server_time_ms: Option<i64> },
    /// The service no longer tracks this session
    SessionAbandoned { reason: Option<String> },
    Rejected { status: u16 },
    /// 2xx with a body we do not understand
    Unrecognized,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WireReply {
    Ok {
        #[serde(default, rename = "serverTimeMs")]
        server_time_ms: Option<i64>,
    },
    Abandoned {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl TripSyncReply {
    /// Decode a trip sync response.
    pub fn decode(response: &RemoteResponse) -> Self {
        if response.status == 410 {
            return TripSyncReply::SessionAbandoned { reason: None };
        }
        if response.class() != ResponseClass::Success {
            return TripSyncReply::Rejected {
                status: response.status,
            };
        }
        if response.body.iter().all(|b| b.is_ascii_whitespace()) {
            return TripSyncReply::Acknowledged {
                server_time_ms: None,
            };
        }

        match serde_json::from_slice::<WireReply>(&response.body) {
            Ok(WireReply::Ok { server_time_ms }) => TripSyncReply::Acknowledged { server_time_ms },
            Ok(WireReply::Abandoned { reason }) => TripSyncReply::SessionAbandoned { reason },
            Err(_) => TripSyncReply::Unrecognized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert_eq!(ResponseClass::from_status(200), ResponseClass::Success);
        assert_eq!(ResponseClass::from_status(204), ResponseClass::Success);
        assert_eq!(ResponseClass::from_status(400), ResponseClass::ClientError);
        assert_eq!(ResponseClass::from_status(404), ResponseClass::ClientError);
        assert_eq!(ResponseClass::from_status(429), ResponseClass::RateLimited);
        assert_eq!(ResponseClass::from_status(503), ResponseClass::ServerError);
        assert!(ResponseClass::ServerError.is_retryable());
        assert!(!ResponseClass::ClientError.is_retryable());
    }

    #[test]
    fn test_endpoint_routes() {
        let ep = SyncEndpoint::TripProgress {
            session_id: "abc".to_string(),
        };
        assert_eq!(ep.path(), "/trips/abc/progress");
        assert_eq!(ep.method(), HttpMethod::Put);

        let payload = SyncEndpoint::TripForceEnd {
            session_id: "abc".to_string(),
        }
        .payload(None, 42);
        assert_eq!(payload, json!({ "sentAtMs": 42 }));
    }

    #[test]
    fn test_decode_replies() {
        let ok = RemoteResponse::new(200, r#"{"status":"ok","serverTimeMs":99}"#);
        assert_eq!(
            TripSyncReply::decode(&ok),
            TripSyncReply::Acknowledged {
                server_time_ms: Some(99)
            }
        );

        let abandoned = RemoteResponse::new(200, r#"{"status":"abandoned","reason":"expired"}"#);
        assert_eq!(
            TripSyncReply::decode(&abandoned),
            TripSyncReply::SessionAbandoned {
                reason: Some("expired".to_string())
            }
        );

        assert_eq!(
            TripSyncReply::decode(&RemoteResponse::status_only(410)),
            TripSyncReply::SessionAbandoned { reason: None }
        );
        assert_eq!(
            TripSyncReply::decode(&RemoteResponse::status_only(204)),
            TripSyncReply::Acknowledged {
                server_time_ms: None
            }
        );
        assert_eq!(
            TripSyncReply::decode(&RemoteResponse::new(200, "<html>")),
            TripSyncReply::Unrecognized
        );
        assert_eq!(
            TripSyncReply::decode(&RemoteResponse::status_only(400)),
            TripSyncReply::Rejected { status: 400 }
        );
    }

    #[test]
    fn test_method_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&HttpMethod::Patch).unwrap(), "\"PATCH\"");
    }
}
