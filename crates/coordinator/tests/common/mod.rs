//! Shared in-memory fakes for coordinator integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use harvest_coordinator::delivery::{
    CollaboratorError, ContentApplier, PersistentStore, StoredResult,
};
use harvest_core::config::CoordinatorConfig;
use harvest_core::types::{JobId, TokensInfo};
use harvest_remote::api::{ByteStream, RemoteJobApi};
use harvest_remote::error::RemoteApiError;
use harvest_remote::responses::{BulkPoll, BulkResult, JobResults, RemoteStatus};

/// A generic retryable remote failure.
pub fn server_error() -> RemoteApiError {
    RemoteApiError::Status {
        code: 500,
        body: "internal error".into(),
    }
}

// ---------------------------------------------------------------------------
// MockRemote
// ---------------------------------------------------------------------------

/// Scriptable in-memory remote API.
///
/// Scripted responses are consumed front-to-back; once a job's status
/// script is exhausted the mock reports an empty `Processing` poll, and an
/// exhausted bulk script reports "no results".
#[derive(Default)]
pub struct MockRemote {
    statuses: Mutex<HashMap<JobId, VecDeque<Result<RemoteStatus, RemoteApiError>>>>,
    results: Mutex<HashMap<JobId, VecDeque<JobResults>>>,
    bulk: Mutex<VecDeque<Result<BulkPoll, RemoteApiError>>>,
    streams: Mutex<HashMap<JobId, VecDeque<String>>>,
    pub active: AtomicBool,
    pub fail_mark_delivered: AtomicBool,
    pub delivered: Mutex<Vec<String>>,
    pub status_calls: AtomicU32,
    pub fetch_calls: AtomicU32,
    pub bulk_calls: AtomicU32,
    pub active_calls: AtomicU32,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn script_status(
        &self,
        job_id: &str,
        script: Vec<Result<RemoteStatus, RemoteApiError>>,
    ) {
        self.statuses
            .lock()
            .await
            .entry(job_id.to_string())
            .or_default()
            .extend(script);
    }

    pub async fn script_results(&self, job_id: &str, results: JobResults) {
        self.results
            .lock()
            .await
            .entry(job_id.to_string())
            .or_default()
            .push_back(results);
    }

    pub async fn script_bulk(&self, response: Result<BulkPoll, RemoteApiError>) {
        self.bulk.lock().await.push_back(response);
    }

    /// Queue the raw SSE body served on the next stream connection.
    pub async fn script_stream(&self, job_id: &str, raw_sse: String) {
        self.streams
            .lock()
            .await
            .entry(job_id.to_string())
            .or_default()
            .push_back(raw_sse);
    }

    pub async fn delivered_ids(&self) -> Vec<String> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl RemoteJobApi for MockRemote {
    async fn check_status(&self, job_id: &JobId) -> Result<RemoteStatus, RemoteApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().await;
        match statuses.get_mut(job_id).and_then(|q| q.pop_front()) {
            Some(response) => response,
            None => Ok(RemoteStatus::Processing { progress: None }),
        }
    }

    async fn fetch_results(&self, job_id: &JobId) -> Result<JobResults, RemoteApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut results = self.results.lock().await;
        match results.get_mut(job_id).and_then(|q| q.pop_front()) {
            Some(results) => Ok(results),
            None => Err(RemoteApiError::Status {
                code: 404,
                body: format!("no results for {job_id}"),
            }),
        }
    }

    async fn poll_bulk(&self, _scope_key: &str) -> Result<BulkPoll, RemoteApiError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        match self.bulk.lock().await.pop_front() {
            Some(response) => response,
            None => Ok(BulkPoll {
                has_results: false,
                results: Vec::new(),
                balance: None,
            }),
        }
    }

    async fn mark_delivered(&self, remote_id: &str) -> Result<(), RemoteApiError> {
        if self.fail_mark_delivered.load(Ordering::SeqCst) {
            return Err(server_error());
        }
        self.delivered.lock().await.push(remote_id.to_string());
        Ok(())
    }

    async fn any_active(&self, _scope_key: &str) -> Result<bool, RemoteApiError> {
        self.active_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.active.load(Ordering::SeqCst))
    }

    async fn open_stream(&self, job_id: &JobId) -> Result<ByteStream, RemoteApiError> {
        let mut streams = self.streams.lock().await;
        match streams.get_mut(job_id).and_then(|q| q.pop_front()) {
            Some(raw) => {
                let chunks: Vec<Result<Bytes, RemoteApiError>> = vec![Ok(Bytes::from(raw))];
                Ok(Box::pin(futures::stream::iter(chunks)))
            }
            None => Err(RemoteApiError::Status {
                code: 404,
                body: format!("no stream for {job_id}"),
            }),
        }
    }
}

/// Convenience constructor for scripted results.
pub fn results(content: &str, tokens_used: Option<u64>, remote_id: Option<&str>) -> JobResults {
    JobResults {
        content: content.into(),
        tokens: tokens_used.map(|used| TokensInfo {
            used,
            balance: None,
        }),
        remote_request_id: remote_id.map(Into::into),
    }
}

/// Convenience constructor for one bulk result entry.
pub fn bulk_result(job_id: &str, content: &str, remote_id: Option<&str>) -> BulkResult {
    BulkResult {
        job_id: job_id.into(),
        content: content.into(),
        tokens: None,
        remote_request_id: remote_id.map(Into::into),
    }
}

// ---------------------------------------------------------------------------
// MockStore / MockApplier
// ---------------------------------------------------------------------------

/// In-memory persistent store with injectable failures.
#[derive(Default)]
pub struct MockStore {
    pub saved: Mutex<Vec<(JobId, StoredResult)>>,
    pub attempts: AtomicU32,
    /// Number of upcoming `save` calls that fail.
    pub fail_times: AtomicU32,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn saved_ids(&self) -> Vec<JobId> {
        self.saved.lock().await.iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl PersistentStore for MockStore {
    async fn save(&self, job_id: &JobId, result: &StoredResult) -> Result<(), CollaboratorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_times.load(Ordering::SeqCst) > 0 {
            self.fail_times.fetch_sub(1, Ordering::SeqCst);
            return Err("store unavailable".into());
        }
        self.saved
            .lock()
            .await
            .push((job_id.clone(), result.clone()));
        Ok(())
    }
}

/// Records fire-and-forget notifications.
#[derive(Default)]
pub struct MockApplier {
    pub completed: Mutex<Vec<(JobId, String)>>,
    pub balances: Mutex<Vec<f64>>,
}

impl MockApplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ContentApplier for MockApplier {
    async fn on_job_completed(&self, job_id: &JobId, content: &str) {
        self.completed
            .lock()
            .await
            .push((job_id.clone(), content.to_string()));
    }

    async fn on_balance_updated(&self, balance: f64) {
        self.balances.lock().await.push(balance);
    }
}

// ---------------------------------------------------------------------------
// Test configuration
// ---------------------------------------------------------------------------

/// Default configuration for tests; individual tests override fields.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
}
