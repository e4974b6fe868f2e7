//! The adaptive polling loop.
//!
//! [`Coordinator`] owns the whole job set and runs a single loop: while
//! the registry is empty it probes a cheap "any active jobs?" endpoint at
//! a long fixed interval (idle mode); as soon as a job is registered it
//! switches to per-cycle polling (active mode), dispatching pull fetches
//! or push-stream workers per job, applying outcomes through the
//! registry, and handing newly completed results to the delivery
//! coordinator. The next cycle's delay is the minimum of all per-job
//! backoff delays, so an urgent job is never starved by a quiet one.
//!
//! Constructed with its dependencies injected and an explicit
//! `start()`/`stop()` lifecycle; there is no process-wide state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use harvest_core::backoff::{self, BackoffConfig, BackoffState};
use harvest_core::config::CoordinatorConfig;
use harvest_core::error::RegistryError;
use harvest_core::registry::JobRegistry;
use harvest_core::types::{Job, JobId, JobKind, JobStatus, PollMode, PollOutcome};
use harvest_remote::api::RemoteJobApi;
use harvest_remote::error::{ErrorClass, RemoteApiError};
use harvest_remote::responses::RemoteStatus;
use harvest_remote::stream::StreamProcessor;

use crate::delivery::{ContentApplier, DeliveryCoordinator, DeliveryError, PersistentStore};
use crate::events::CoordinatorEvent;

/// Broadcast channel capacity for coordinator events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Counters accumulated since the coordinator was created.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorStats {
    pub cycles: u64,
    pub jobs_delivered: u64,
    pub jobs_failed: u64,
}

/// Point-in-time view of the coordinator for callers.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Whether the polling loop is running at all.
    pub is_running: bool,
    /// Whether any job is outstanding (active mode).
    pub is_active: bool,
    /// The delay chosen for the current cycle.
    pub interval: Duration,
    pub active_jobs: Vec<Job>,
    pub stats: CoordinatorStats,
}

/// Bookkeeping for one push-mode stream worker task.
struct StreamWorker {
    handle: JoinHandle<()>,
    /// Child of the run token; cancelled when the job is cancelled.
    cancel: CancellationToken,
}

/// Run-scoped lifecycle state, replaced on every `start()`.
struct Lifecycle {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// The job polling and delivery coordinator.
///
/// Created once via [`Coordinator::new`] with the remote API, persistent
/// store, and content applier injected. The returned `Arc` can be cheaply
/// cloned into whatever owns the lifecycle.
pub struct Coordinator {
    /// Handle to self for spawned tasks; always upgradable while a method
    /// is borrowing `self`.
    weak_self: Weak<Coordinator>,
    config: CoordinatorConfig,
    backoff_config: BackoffConfig,
    registry: Arc<JobRegistry>,
    remote: Arc<dyn RemoteJobApi>,
    applier: Arc<dyn ContentApplier>,
    delivery: DeliveryCoordinator,
    event_tx: broadcast::Sender<CoordinatorEvent>,
    /// Per-job backoff counters, keyed like the registry.
    backoff: Mutex<HashMap<JobId, BackoffState>>,
    /// Stream worker tasks for push-mode jobs.
    streams: Mutex<HashMap<JobId, StreamWorker>>,
    /// Pokes the loop out of its sleep (registration, terminal stream
    /// events).
    wake: Notify,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
    backgrounded: AtomicBool,
    /// Consecutive whole-cycle remote failures (bulk poll / idle probe).
    cycle_failures: AtomicU32,
    current_interval_ms: AtomicU64,
    cycles: AtomicU64,
    jobs_delivered: AtomicU64,
    jobs_failed: AtomicU64,
}

impl Coordinator {
    /// Build a coordinator with its collaborators injected.
    pub fn new(
        config: CoordinatorConfig,
        remote: Arc<dyn RemoteJobApi>,
        store: Arc<dyn PersistentStore>,
        applier: Arc<dyn ContentApplier>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(JobRegistry::new());
        let delivery = DeliveryCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&remote),
            store,
            Arc::clone(&applier),
            event_tx.clone(),
        );

        let base_interval_ms = config.base_interval.as_millis() as u64;
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            backoff_config: config.backoff(),
            config,
            registry,
            remote,
            applier,
            delivery,
            event_tx,
            backoff: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            lifecycle: Mutex::new(Lifecycle {
                cancel: CancellationToken::new(),
                handle: None,
            }),
            running: AtomicBool::new(false),
            backgrounded: AtomicBool::new(false),
            cycle_failures: AtomicU32::new(0),
            current_interval_ms: AtomicU64::new(base_interval_ms),
            cycles: AtomicU64::new(0),
            jobs_delivered: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
        })
    }

    /// Subscribe to coordinator events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.event_tx.subscribe()
    }

    /// The job registry (read access for embedders; all mutation still
    /// goes through registry methods).
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Strong handle to self for spawned tasks.
    fn arc(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("coordinator is alive")
    }

    /// Start the polling loop. A no-op with a warning if already running.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Coordinator is already running");
            return;
        }

        let cancel = CancellationToken::new();
        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.cancel = cancel.clone();
        let this = self.arc();
        lifecycle.handle = Some(tokio::spawn(async move {
            this.run_loop(cancel).await;
        }));
        tracing::info!("Coordinator started");
    }

    /// Stop the polling loop and abort all stream connections.
    ///
    /// The registry is left intact for inspection; `start()` resumes
    /// polling where it left off.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping coordinator");

        let handle = {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.cancel.cancel();
            lifecycle.handle.take()
        };

        let mut streams = self.streams.lock().await;
        for (job_id, worker) in streams.drain() {
            worker.cancel.cancel();
            worker.handle.abort();
            tracing::debug!(job_id = %job_id, "Aborted stream worker");
        }
        drop(streams);

        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        tracing::info!("Coordinator stopped");
    }

    /// Cancel the coordinator entirely: abort every connection and timer.
    /// Equivalent to [`stop`](Self::stop).
    pub async fn cancel_all(&self) {
        self.stop().await;
    }

    /// Register a job for polling.
    ///
    /// In idle mode this wakes the loop, so the switch to active mode
    /// happens within one cycle.
    pub async fn register_job(
        &self,
        job_id: impl Into<JobId>,
        kind: JobKind,
        mode: PollMode,
    ) -> Result<(), RegistryError> {
        let job = Job::new(job_id, kind, mode);
        let id = job.id.clone();
        self.registry.register(job).await?;
        self.backoff
            .lock()
            .await
            .insert(id.clone(), BackoffState::new(&self.backoff_config));
        self.wake.notify_one();
        tracing::info!(job_id = %id, kind = kind.as_str(), "Job registered for polling");
        Ok(())
    }

    /// Cancel a single job: remove it from the registry and abort any
    /// open stream connection for it. Other jobs are unaffected.
    pub async fn cancel(&self, job_id: &str) -> Option<Job> {
        if let Some(worker) = self.streams.lock().await.remove(job_id) {
            worker.cancel.cancel();
            worker.handle.abort();
        }
        self.backoff.lock().await.remove(job_id);

        let removed = self.registry.remove(job_id).await;
        if let Some(job) = &removed {
            let _ = self.event_tx.send(CoordinatorEvent::JobCancelled {
                job_id: job.id.clone(),
            });
            tracing::info!(job_id = %job.id, "Job cancelled");
        }
        removed
    }

    /// Hint from the host environment that it is backgrounded: all
    /// intervals are multiplied by the configured factor until restored.
    /// Backoff counters are untouched.
    pub fn set_backgrounded(&self, backgrounded: bool) {
        self.backgrounded.store(backgrounded, Ordering::Relaxed);
    }

    /// Point-in-time view for callers.
    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let active_jobs = self.registry.list_active().await;
        StatusSnapshot {
            is_running: self.running.load(Ordering::Relaxed),
            is_active: !active_jobs.is_empty(),
            interval: Duration::from_millis(self.current_interval_ms.load(Ordering::Relaxed)),
            stats: CoordinatorStats {
                cycles: self.cycles.load(Ordering::Relaxed),
                jobs_delivered: self.jobs_delivered.load(Ordering::Relaxed),
                jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            },
            active_jobs,
        }
    }

    // ---- the loop ----

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let delay = if self.registry.count().await == 0 {
                self.idle_probe().await
            } else {
                self.active_cycle().await
            };

            let failures = self.cycle_failures.load(Ordering::Relaxed);
            if failures >= self.config.max_cycle_failures {
                tracing::error!(
                    failures,
                    "Coordinator-level polling failed repeatedly, stopping loop",
                );
                break;
            }

            let delay = self.effective_delay(delay);
            self.current_interval_ms
                .store(delay.as_millis() as u64, Ordering::Relaxed);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // Stream workers must not outlive the loop, whichever way it
        // exited.
        let mut streams = self.streams.lock().await;
        for (_, worker) in streams.drain() {
            worker.cancel.cancel();
            worker.handle.abort();
        }
        drop(streams);

        self.running.store(false, Ordering::SeqCst);
    }

    /// Idle mode: one cheap probe, then sleep the long idle interval.
    async fn idle_probe(&self) -> Duration {
        match self.remote.any_active(&self.config.scope_key).await {
            Ok(active) => {
                self.cycle_failures.store(0, Ordering::Relaxed);
                if active {
                    tracing::debug!("Remote reports active jobs, none registered locally");
                }
            }
            Err(e) => {
                let failures = self.cycle_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(error = %e, failures, "Idle probe failed");
            }
        }
        self.config.idle_interval
    }

    /// Active mode: one full polling cycle over the current job set.
    async fn active_cycle(&self) -> Duration {
        self.cycles.fetch_add(1, Ordering::Relaxed);

        let swept = self.registry.sweep_stale(self.config.retention).await;
        if swept > 0 {
            tracing::warn!(swept, "Removed stale jobs past the retention window");
        }

        let jobs = self.registry.list_active().await;
        let pull_jobs: Vec<Job> = jobs
            .iter()
            .filter(|j| {
                j.mode == PollMode::Pull
                    && matches!(j.status, JobStatus::Pending | JobStatus::Processing)
            })
            .cloned()
            .collect();

        for job in &jobs {
            if job.mode == PollMode::Stream && !job.status.is_terminal() {
                self.ensure_stream(&job.id).await;
            }
        }

        // Bulk mode bounds the round trips to O(1) per cycle once enough
        // jobs are outstanding.
        if pull_jobs.len() >= self.config.bulk_poll_threshold {
            self.bulk_poll_cycle(&pull_jobs).await;
        } else {
            futures::future::join_all(pull_jobs.iter().map(|job| self.poll_single(job))).await;
            self.cycle_failures.store(0, Ordering::Relaxed);
        }

        self.deliver_completed().await;
        self.finish_failed().await;
        self.prune_orphans().await;

        self.next_delay().await
    }

    /// Pull one job: cheap status check, then the full results fetch only
    /// on completion.
    async fn poll_single(&self, job: &Job) {
        let outcome = match self.remote.check_status(&job.id).await {
            Ok(RemoteStatus::Completed) => self
                .remote
                .fetch_results(&job.id)
                .await
                .map(|results| results.into_outcome()),
            Ok(status) => Ok(status.into_outcome()),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => self.apply_outcome(&job.id, outcome).await,
            Err(e) => self.note_job_error(&job.id, e).await,
        }
    }

    /// One bulk poll covering every outstanding pull-mode job.
    async fn bulk_poll_cycle(&self, pull_jobs: &[Job]) {
        let bulk = match self.remote.poll_bulk(&self.config.scope_key).await {
            Ok(bulk) => {
                self.cycle_failures.store(0, Ordering::Relaxed);
                bulk
            }
            Err(e) => {
                let failures = self.cycle_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(error = %e, failures, "Bulk poll failed");
                return;
            }
        };

        if let Some(balance) = bulk.balance {
            self.applier.on_balance_updated(balance).await;
            let _ = self
                .event_tx
                .send(CoordinatorEvent::BalanceUpdated { balance });
        }

        let mut matched: HashSet<JobId> = HashSet::new();
        for result in bulk.results {
            let job_id = result.job_id.clone();
            match self.registry.get(&job_id).await {
                None => {
                    tracing::debug!(job_id = %job_id, "Bulk result for unregistered job discarded");
                }
                Some(job) if job.delivered => {
                    // Stale duplicate from a race; the delivered flag
                    // guards the second hand-off.
                    tracing::debug!(job_id = %job_id, "Bulk result for delivered job skipped");
                }
                Some(_) => {
                    matched.insert(job_id.clone());
                    self.apply_outcome(&job_id, result.into_outcome()).await;
                }
            }
        }

        // Jobs the bulk poll had nothing for count an empty poll.
        let mut backoff = self.backoff.lock().await;
        for job in pull_jobs {
            if !matched.contains(&job.id) {
                backoff
                    .entry(job.id.clone())
                    .or_insert_with(|| BackoffState::new(&self.backoff_config))
                    .record_empty(&self.backoff_config);
            }
        }
    }

    /// Merge one outcome into the registry and the job's backoff state.
    ///
    /// Checked at apply time, not dispatch time: a result for a job that
    /// was cancelled or delivered while the fetch was in flight is
    /// discarded.
    async fn apply_outcome(&self, job_id: &JobId, outcome: PollOutcome) {
        if self.registry.get(job_id).await.is_none() {
            tracing::debug!(job_id = %job_id, "Discarding result for unregistered job");
            return;
        }

        let empty = outcome.is_empty();
        let failed = outcome.status == JobStatus::Failed;
        self.registry
            .update(job_id, |job| job.apply_outcome(&outcome))
            .await;

        if failed {
            return;
        }
        let mut backoff = self.backoff.lock().await;
        let state = backoff
            .entry(job_id.clone())
            .or_insert_with(|| BackoffState::new(&self.backoff_config));
        if empty {
            state.record_empty(&self.backoff_config);
        } else {
            state.record_activity(&self.backoff_config);
        }
    }

    /// Record a failed poll for one job; give up once retries are
    /// exhausted. Other jobs are unaffected.
    async fn note_job_error(&self, job_id: &JobId, error: RemoteApiError) {
        if self.registry.get(job_id).await.is_none() {
            tracing::debug!(job_id = %job_id, "Discarding error for unregistered job");
            return;
        }

        if error.class() == ErrorClass::Malformed {
            // A single unparseable body must not crash or fail the job;
            // treat it as an empty poll.
            tracing::warn!(job_id = %job_id, error = %error, "Malformed response, treated as empty poll");
            self.backoff
                .lock()
                .await
                .entry(job_id.clone())
                .or_insert_with(|| BackoffState::new(&self.backoff_config))
                .record_empty(&self.backoff_config);
            return;
        }

        let message = error.to_string();
        tracing::warn!(
            job_id = %job_id,
            class = ?error.class(),
            error = %message,
            "Poll failed",
        );
        self.registry
            .update(job_id, |job| {
                job.retry_count += 1;
                job.last_error = Some(message.clone());
            })
            .await;

        let exhausted = {
            let mut backoff = self.backoff.lock().await;
            let state = backoff
                .entry(job_id.clone())
                .or_insert_with(|| BackoffState::new(&self.backoff_config));
            state.record_error(&self.backoff_config);
            state.should_give_up(&self.backoff_config)
        };

        if exhausted {
            tracing::error!(job_id = %job_id, "Job exhausted retries, giving up");
            self.registry
                .update(job_id, |job| job.status = JobStatus::Failed)
                .await;
        }
    }

    /// Hand every newly completed, undelivered job to the delivery
    /// coordinator.
    async fn deliver_completed(&self) {
        for job in self.registry.list_active().await {
            if job.status != JobStatus::Completed || job.delivered {
                continue;
            }
            let outcome = PollOutcome {
                content: job.accumulated_content.clone(),
                remote_request_id: job.remote_request_id.clone(),
                ..PollOutcome::completed(String::new(), job.tokens)
            };
            match self.delivery.deliver(&job, &outcome).await {
                Ok(()) => {
                    self.jobs_delivered.fetch_add(1, Ordering::Relaxed);
                    self.drop_job_state(&job.id).await;
                }
                Err(DeliveryError::Store { .. }) => {
                    // Undelivered; retried next cycle with the same job id.
                }
                Err(e @ (DeliveryError::Gone(_) | DeliveryError::AlreadyDelivered(_))) => {
                    tracing::debug!(job_id = %job.id, reason = %e, "Delivery skipped");
                }
            }
        }
    }

    /// Report and remove permanently failed jobs.
    async fn finish_failed(&self) {
        for job in self.registry.list_all().await {
            if job.status != JobStatus::Failed {
                continue;
            }
            let error = job
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown error".into());
            self.registry.remove(&job.id).await;
            self.drop_job_state(&job.id).await;
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
            let _ = self.event_tx.send(CoordinatorEvent::JobFailed {
                job_id: job.id.clone(),
                error: error.clone(),
            });
            tracing::warn!(job_id = %job.id, error = %error, "Job failed permanently");
        }
    }

    /// Drop backoff and stream bookkeeping that no longer has a registry
    /// entry behind it.
    async fn prune_orphans(&self) {
        let live: HashSet<JobId> = self
            .registry
            .list_all()
            .await
            .into_iter()
            .map(|j| j.id)
            .collect();

        self.backoff.lock().await.retain(|id, _| live.contains(id));

        let mut streams = self.streams.lock().await;
        let stale: Vec<JobId> = streams
            .iter()
            .filter(|(id, worker)| !live.contains(*id) || worker.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(worker) = streams.remove(&id) {
                worker.cancel.cancel();
                worker.handle.abort();
            }
        }
    }

    /// Remove per-job auxiliary state (backoff counters, stream worker).
    async fn drop_job_state(&self, job_id: &str) {
        self.backoff.lock().await.remove(job_id);
        if let Some(worker) = self.streams.lock().await.remove(job_id) {
            worker.cancel.cancel();
            worker.handle.abort();
        }
    }

    /// The aggregate delay for the next cycle: the minimum of all per-job
    /// desired delays (plus jitter), or the error-backed-off coordinator
    /// delay when whole-cycle polling is failing.
    async fn next_delay(&self) -> Duration {
        let failures = self.cycle_failures.load(Ordering::Relaxed);
        if failures > 0 {
            let delay = backoff::scheduled_delay(&self.backoff_config, failures, 0);
            return backoff::with_jitter(delay);
        }

        let active = self.registry.list_active().await;
        let backoff_map = self.backoff.lock().await;
        let min = active
            .iter()
            .filter_map(|job| backoff_map.get(&job.id))
            .map(|state| state.desired_delay())
            .min();
        backoff::with_jitter(min.unwrap_or(self.config.base_interval))
    }

    /// Apply the backgrounded multiplier, if any.
    fn effective_delay(&self, delay: Duration) -> Duration {
        if self.backgrounded.load(Ordering::Relaxed) {
            delay.mul_f64(self.config.background_factor)
        } else {
            delay
        }
    }

    // ---- push-mode stream workers ----

    /// Make sure a stream worker is attached to the job, respawning after
    /// a dropped connection (a reconnect is a fresh processor).
    async fn ensure_stream(&self, job_id: &JobId) {
        let child = { self.lifecycle.lock().await.cancel.child_token() };

        let mut streams = self.streams.lock().await;
        if let Some(worker) = streams.get(job_id) {
            if !worker.handle.is_finished() {
                return;
            }
            streams.remove(job_id);
        }

        let this = self.arc();
        let id = job_id.clone();
        let worker_cancel = child.clone();
        let handle = tokio::spawn(async move {
            this.run_stream(id, worker_cancel).await;
        });
        streams.insert(
            job_id.clone(),
            StreamWorker {
                handle,
                cancel: child,
            },
        );
    }

    /// One stream connection for one job: open, consume outcomes until
    /// terminal or the connection ends.
    async fn run_stream(self: Arc<Self>, job_id: JobId, cancel: CancellationToken) {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.remote.open_stream(&job_id) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    self.note_job_error(&job_id, e).await;
                    self.wake.notify_one();
                    return;
                }
            }
        };

        let mut processor = StreamProcessor::new(job_id.clone(), stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = processor.next_outcome() => match outcome {
                    Some(outcome) => {
                        let terminal = outcome.status.is_terminal();
                        self.apply_outcome(&job_id, outcome).await;
                        if terminal {
                            // Poke the loop so delivery runs promptly.
                            self.wake.notify_one();
                            return;
                        }
                    }
                    None => {
                        tracing::debug!(job_id = %job_id, "Stream ended, reconnect next cycle");
                        return;
                    }
                }
            }
        }
    }
}
