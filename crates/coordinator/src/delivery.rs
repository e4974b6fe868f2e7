//! At-most-once hand-off of completed results to downstream consumers.
//!
//! [`DeliveryCoordinator::deliver`] persists a completed job's result,
//! marks the job delivered, acknowledges the result to the remote
//! (best-effort), and notifies the content applier. Local persistence is
//! the durability boundary: only a successful store write marks the job
//! delivered; the remote acknowledgment and the notifications are side
//! effects that never block completion.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use harvest_core::registry::JobRegistry;
use harvest_core::types::{Job, JobId, JobStatus, PollOutcome, TokensInfo};
use harvest_remote::api::RemoteJobApi;

use crate::events::CoordinatorEvent;

/// Error type collaborators may return from their fallible operations.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Durable storage for delivered results.
///
/// `save` must be idempotent keyed by job id: the coordinator retries a
/// failed delivery on the next cycle with the same id.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn save(&self, job_id: &JobId, result: &StoredResult) -> Result<(), CollaboratorError>;
}

/// Downstream consumer of completed content. Notifications are
/// fire-and-forget.
#[async_trait]
pub trait ContentApplier: Send + Sync {
    async fn on_job_completed(&self, job_id: &JobId, content: &str);
    async fn on_balance_updated(&self, balance: f64);
}

/// The durable form of one completed result.
#[derive(Debug, Clone, Serialize)]
pub struct StoredResult {
    pub content: String,
    pub tokens: Option<TokensInfo>,
    pub remote_request_id: Option<String>,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Outcomes of a delivery attempt that did not complete the hand-off.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Persisting to the store failed; the job stays undelivered and is
    /// retried next cycle.
    #[error("failed to persist result for job '{job_id}': {message}")]
    Store { job_id: JobId, message: String },

    /// The job left the registry before the result could be applied
    /// (cancelled or swept). The result is discarded.
    #[error("job '{0}' is no longer registered")]
    Gone(JobId),

    /// The job was already delivered; a stale duplicate observation.
    #[error("job '{0}' was already delivered")]
    AlreadyDelivered(JobId),
}

// ---------------------------------------------------------------------------
// DeliveryCoordinator
// ---------------------------------------------------------------------------

/// Performs the persist → acknowledge → notify sequence for one
/// completed job.
pub struct DeliveryCoordinator {
    registry: Arc<JobRegistry>,
    remote: Arc<dyn RemoteJobApi>,
    store: Arc<dyn PersistentStore>,
    applier: Arc<dyn ContentApplier>,
    event_tx: broadcast::Sender<CoordinatorEvent>,
}

impl DeliveryCoordinator {
    pub fn new(
        registry: Arc<JobRegistry>,
        remote: Arc<dyn RemoteJobApi>,
        store: Arc<dyn PersistentStore>,
        applier: Arc<dyn ContentApplier>,
        event_tx: broadcast::Sender<CoordinatorEvent>,
    ) -> Self {
        Self {
            registry,
            remote,
            store,
            applier,
            event_tx,
        }
    }

    /// Deliver a completed job's result downstream, at most once.
    ///
    /// The registry is re-checked at apply time, so a result observed for
    /// a job that was cancelled or already delivered in the meantime is
    /// discarded, not re-delivered.
    pub async fn deliver(&self, job: &Job, outcome: &PollOutcome) -> Result<(), DeliveryError> {
        let Some(current) = self.registry.get(&job.id).await else {
            return Err(DeliveryError::Gone(job.id.clone()));
        };
        if current.delivered {
            return Err(DeliveryError::AlreadyDelivered(job.id.clone()));
        }

        let content = outcome
            .content
            .clone()
            .or_else(|| current.accumulated_content.clone())
            .unwrap_or_default();
        let stored = StoredResult {
            content: content.clone(),
            tokens: outcome.tokens,
            remote_request_id: outcome
                .remote_request_id
                .clone()
                .or_else(|| current.remote_request_id.clone()),
            completed_at: Utc::now(),
        };

        // Step 1: durability boundary. Failure leaves the job undelivered
        // for a retry on the next cycle.
        if let Err(e) = self.store.save(&job.id, &stored).await {
            tracing::warn!(job_id = %job.id, error = %e, "Persisting result failed, will retry");
            return Err(DeliveryError::Store {
                job_id: job.id.clone(),
                message: e.to_string(),
            });
        }

        self.registry
            .update(&job.id, |j| {
                j.status = JobStatus::Completed;
                j.progress = 100;
                j.delivered = true;
            })
            .await;
        self.registry.remove(&job.id).await;

        // Step 2: best-effort remote acknowledgment. The remote may
        // re-offer the result on a future poll; the delivered flag guards
        // against double hand-off locally.
        if let Some(remote_id) = &stored.remote_request_id {
            if let Err(e) = self.remote.mark_delivered(remote_id).await {
                tracing::warn!(
                    job_id = %job.id,
                    remote_id = %remote_id,
                    error = %e,
                    "Remote delivery acknowledgment failed",
                );
            }
        }

        // Step 3: fire-and-forget notifications.
        self.applier.on_job_completed(&job.id, &content).await;
        let _ = self.event_tx.send(CoordinatorEvent::JobCompleted {
            job_id: job.id.clone(),
            content,
        });

        if let Some(balance) = stored.tokens.and_then(|t| t.balance) {
            self.applier.on_balance_updated(balance).await;
            let _ = self
                .event_tx
                .send(CoordinatorEvent::BalanceUpdated { balance });
        }

        tracing::info!(job_id = %job.id, "Job result delivered");
        Ok(())
    }
}
