//! HTTP client for the remote processing API.
//!
//! [`RemoteJobApi`] is the trait seam the coordinator polls through;
//! [`HttpRemoteApi`] implements it over [`reqwest`]. Unary calls carry a
//! per-request timeout; the SSE stream endpoint uses a separate client
//! without a total-request timeout, since the connection is long-lived.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};

use harvest_core::types::JobId;

use crate::error::RemoteApiError;
use crate::responses::{ActiveProbe, BulkPoll, JobResults, RemoteStatus};

/// Raw byte sequence of an open push-mode connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RemoteApiError>> + Send>>;

/// The remote API surface the coordinator depends on.
///
/// Implemented by [`HttpRemoteApi`] in production and by in-memory fakes
/// in tests.
#[async_trait]
pub trait RemoteJobApi: Send + Sync {
    /// Cheap status check for a single job.
    async fn check_status(&self, job_id: &JobId) -> Result<RemoteStatus, RemoteApiError>;

    /// Fetch the full payload of a completed job. Only issued once
    /// [`check_status`](Self::check_status) reports completion, so large
    /// payloads are never transferred for jobs still in progress.
    async fn fetch_results(&self, job_id: &JobId) -> Result<JobResults, RemoteApiError>;

    /// Fetch all completed-but-undelivered results for a scope in one
    /// round trip.
    async fn poll_bulk(&self, scope_key: &str) -> Result<BulkPoll, RemoteApiError>;

    /// Acknowledge a delivered result to the remote. Best-effort from the
    /// caller's perspective.
    async fn mark_delivered(&self, remote_id: &str) -> Result<(), RemoteApiError>;

    /// Cheap "any active jobs?" probe used while idle.
    async fn any_active(&self, scope_key: &str) -> Result<bool, RemoteApiError>;

    /// Open a push-mode (SSE) connection for a single job.
    async fn open_stream(&self, job_id: &JobId) -> Result<ByteStream, RemoteApiError>;
}

/// HTTP implementation of [`RemoteJobApi`].
pub struct HttpRemoteApi {
    client: reqwest::Client,
    /// Client without a total-request timeout, for long-lived streams.
    stream_client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteApi {
    /// Create a client for the remote API.
    ///
    /// * `base_url` - base HTTP URL, e.g. `http://host:8080`.
    /// * `request_timeout` - timeout applied to each unary request.
    pub fn new(base_url: String, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("Failed to build reqwest HTTP client");
        let stream_client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .expect("Failed to build reqwest HTTP client");
        Self {
            client,
            stream_client,
            base_url,
        }
    }

    /// Base HTTP API URL (e.g. `http://host:8080`).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the response
    /// unchanged on success, or a [`RemoteApiError::Status`] containing the
    /// status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RemoteApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(RemoteApiError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    ///
    /// Decodes from the body text so that an unparseable body surfaces as
    /// [`RemoteApiError::Malformed`] rather than a transport error.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteApiError> {
        let response = Self::ensure_success(response).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl RemoteJobApi for HttpRemoteApi {
    async fn check_status(&self, job_id: &JobId) -> Result<RemoteStatus, RemoteApiError> {
        let response = self
            .client
            .get(format!("{}/jobs/{}/status", self.base_url, job_id))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn fetch_results(&self, job_id: &JobId) -> Result<JobResults, RemoteApiError> {
        let response = self
            .client
            .get(format!("{}/jobs/{}/results", self.base_url, job_id))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn poll_bulk(&self, scope_key: &str) -> Result<BulkPoll, RemoteApiError> {
        let response = self
            .client
            .get(format!("{}/results", self.base_url))
            .query(&[("scope", scope_key)])
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn mark_delivered(&self, remote_id: &str) -> Result<(), RemoteApiError> {
        let response = self
            .client
            .post(format!("{}/results/{}/delivered", self.base_url, remote_id))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn any_active(&self, scope_key: &str) -> Result<bool, RemoteApiError> {
        let response = self
            .client
            .get(format!("{}/jobs/active", self.base_url))
            .query(&[("scope", scope_key)])
            .send()
            .await?;
        let probe: ActiveProbe = Self::parse_response(response).await?;
        Ok(probe.active)
    }

    async fn open_stream(&self, job_id: &JobId) -> Result<ByteStream, RemoteApiError> {
        // A fresh client id per connection lets the remote address frames
        // to this specific subscriber.
        let client_id = uuid::Uuid::new_v4().to_string();
        let response = self
            .stream_client
            .get(format!("{}/jobs/{}/events", self.base_url, job_id))
            .query(&[("client_id", client_id.as_str())])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        tracing::info!(
            job_id = %job_id,
            client_id = %client_id,
            "Opened event stream",
        );

        Ok(Box::pin(response.bytes_stream().map_err(RemoteApiError::from)))
    }
}
