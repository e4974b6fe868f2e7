//! Coordinator-level events broadcast to subscribers.
//!
//! Callers subscribe via
//! [`Coordinator::subscribe`](crate::poller::Coordinator::subscribe) and
//! receive every event on a `tokio::sync::broadcast` channel. Publishing
//! with zero subscribers silently drops the event.

use serde::Serialize;

use harvest_core::types::JobId;

/// A lifecycle event emitted by the coordinator.
#[derive(Debug, Clone, Serialize)]
pub enum CoordinatorEvent {
    /// A job's result was persisted and delivered downstream.
    JobCompleted { job_id: JobId, content: String },

    /// A job exhausted its retries or failed remotely.
    JobFailed { job_id: JobId, error: String },

    /// A job was cancelled by the caller.
    JobCancelled { job_id: JobId },

    /// The remote reported an updated account balance.
    BalanceUpdated { balance: f64 },
}
