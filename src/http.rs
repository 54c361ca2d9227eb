//! HTTP transport for the offline sync queue.
//!
//! Requests are sent as JSON against a base URL with HTTP Basic auth. Any
//! reply that carries a status code is handed back to the queue for
//! classification; only failures to reach the server at all become
//! [`TransportError::Network`].

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use log::debug;
use reqwest::Client;

use crate::error::{Result, TrackerError};
use crate::remote::{HttpMethod, RemoteResponse};
use crate::sync_queue::{SyncTransport, TransportError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// reqwest-backed [`SyncTransport`].
pub struct HttpTransport {
    client: Client,
    base_url: String,
    auth_header: String,
}

impl HttpTransport {
    /// Create a transport for `base_url` authenticating as `user:secret`.
    pub fn new(base_url: &str, user: &str, secret: &str) -> Result<Self> {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, secret));

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TrackerError::Transport {
                message: format!("Failed to create HTTP client: {}", e),
                status_code: None,
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header: format!("Basic {}", auth),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn request(
        &self,
        endpoint: &str,
        method: HttpMethod,
        payload: &serde_json::Value,
    ) -> std::result::Result<RemoteResponse, TransportError> {
        let url = self.url(endpoint);
        let builder = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url).json(payload),
            HttpMethod::Put => self.client.put(&url).json(payload),
            HttpMethod::Patch => self.client.patch(&url).json(payload),
            HttpMethod::Delete => self.client.delete(&url),
        };

        let response = builder
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(|e| TransportError::Network {
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        // A truncated body still carries a usable status
        let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        debug!("[HttpTransport] {} {} -> {}", method.as_str(), url, status);

        Ok(RemoteResponse { status, body })
    }
}
