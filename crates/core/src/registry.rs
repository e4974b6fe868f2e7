//! In-memory registry of outstanding jobs.
//!
//! The registry is the only shared mutable state in the coordinator.
//! Jobs are stored behind a per-job mutex inside a shared map, so updates
//! for one job serialize while distinct jobs proceed concurrently (a
//! manual refresh racing the scheduled cycle for the same job is safe).
//! All mutation goes through registry methods that return the updated
//! snapshot; no other component touches a [`Job`] directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::error::RegistryError;
use crate::types::{Job, JobId, JobStatus};

/// Default retention window for the stale-entry sweep.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Thread-safe map of `JobId -> Job`.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<Job>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job for polling.
    ///
    /// Fails with [`RegistryError::DuplicateJob`] if the id is already
    /// present and not yet delivered. A lingering delivered entry is
    /// replaced, since its lifecycle is over.
    pub async fn register(&self, job: Job) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&job.id) {
            if !existing.lock().await.delivered {
                return Err(RegistryError::DuplicateJob(job.id));
            }
        }
        tracing::debug!(job_id = %job.id, kind = job.kind.as_str(), "Job registered");
        jobs.insert(job.id.clone(), Arc::new(Mutex::new(job)));
        Ok(())
    }

    /// Snapshot of a single job.
    pub async fn get(&self, id: &str) -> Option<Job> {
        let jobs = self.jobs.read().await;
        let slot = jobs.get(id)?.clone();
        drop(jobs);
        let snapshot = slot.lock().await.clone();
        Some(snapshot)
    }

    /// Atomic read-modify-write of one job, returning the updated snapshot.
    ///
    /// The mutation runs against a scratch copy and is committed only if it
    /// passes the transition guards (no terminal regression, no un-setting
    /// of the delivered flag); progress regressions are clamped instead of
    /// rejected. An update for an unknown or already-removed id is a no-op
    /// that logs a warning: a late-arriving response for a delivered job is
    /// expected and must be idempotent.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let jobs = self.jobs.read().await;
        let Some(slot) = jobs.get(id).cloned() else {
            drop(jobs);
            tracing::warn!(job_id = %id, "Update for unknown job ignored");
            return None;
        };
        drop(jobs);

        let mut current = slot.lock().await;
        let mut updated = current.clone();
        mutate(&mut updated);

        if let Err(reason) = validate_transition(&current, &mut updated) {
            tracing::warn!(
                job_id = %id,
                from = current.status.as_str(),
                to = updated.status.as_str(),
                reason,
                "Discarding invalid job update",
            );
            return Some(current.clone());
        }

        *current = updated.clone();
        Some(updated)
    }

    /// Remove a job, returning its final snapshot if it existed.
    pub async fn remove(&self, id: &str) -> Option<Job> {
        let slot = self.jobs.write().await.remove(id)?;
        let job = slot.lock().await.clone();
        tracing::debug!(job_id = %id, status = job.status.as_str(), "Job removed from registry");
        Some(job)
    }

    /// Snapshots of all jobs the coordinator still needs to act on.
    pub async fn list_active(&self) -> Vec<Job> {
        let mut active = Vec::new();
        for job in self.list_all().await {
            if job.needs_polling() {
                active.push(job);
            }
        }
        active
    }

    /// Snapshots of every entry, including terminal ones awaiting cleanup.
    pub async fn list_all(&self) -> Vec<Job> {
        let slots: Vec<Arc<Mutex<Job>>> = self.jobs.read().await.values().cloned().collect();
        let mut all = Vec::with_capacity(slots.len());
        for slot in slots {
            all.push(slot.lock().await.clone());
        }
        all
    }

    /// Number of entries currently in the registry.
    pub async fn count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Remove entries older than the retention window.
    ///
    /// Safety net against leaks from jobs that never reached a terminal
    /// state. Returns the number of removed entries.
    pub async fn sweep_stale(&self, retention: Duration) -> usize {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::hours(24));

        let mut stale = Vec::new();
        for job in self.list_all().await {
            if job.submitted_at < cutoff {
                stale.push(job.id);
            }
        }

        let mut jobs = self.jobs.write().await;
        for id in &stale {
            jobs.remove(id);
            tracing::warn!(job_id = %id, "Swept stale job past retention window");
        }
        stale.len()
    }
}

/// Reject updates that would violate lifecycle invariants.
///
/// Progress regressions while processing are clamped rather than rejected,
/// since a stale-but-otherwise-valid observation may still carry content.
fn validate_transition(old: &Job, new: &mut Job) -> Result<(), &'static str> {
    if old.delivered && !new.delivered {
        return Err("delivered flag cannot be cleared");
    }
    if old.delivered && matches!(new.status, JobStatus::Pending | JobStatus::Processing) {
        return Err("delivered job cannot re-enter processing");
    }
    if old.status.is_terminal() && new.status != old.status {
        return Err("terminal status cannot change");
    }
    if new.status == JobStatus::Processing && new.progress < old.progress {
        new.progress = old.progress;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
