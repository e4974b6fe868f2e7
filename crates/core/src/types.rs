//! Job model shared across the harvest crates.
//!
//! A [`Job`] is one unit of asynchronous work tracked by the coordinator.
//! A [`PollOutcome`] is the transient, normalized result of one round trip
//! against the remote API (pull or push); it is consumed immediately by
//! the polling loop and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque caller-assigned job identifier.
pub type JobId = String;

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// Whether a job produces a single result or a batch of sub-items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Single,
    Bulk,
}

impl JobKind {
    /// String representation for logging and serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Single => "single",
            JobKind::Bulk => "bulk",
        }
    }
}

// ---------------------------------------------------------------------------
// PollMode
// ---------------------------------------------------------------------------

/// How the coordinator observes a job: periodic pull requests or a
/// long-lived push (SSE) connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    Pull,
    Stream,
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
///
/// `Pending -> Processing -> {Completed, Failed, Cancelled}`. Terminal
/// states are never regressed; the registry enforces this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// String representation for logging and serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this status ends the job's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Ordering rank used to reject regressions (stale responses may
    /// arrive out of order). Terminal states share the top rank.
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// TokensInfo
// ---------------------------------------------------------------------------

/// Token-usage metadata attached to a completed result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokensInfo {
    /// Tokens consumed by this job.
    pub used: u64,
    /// Remaining account balance, when the remote reports it.
    #[serde(default)]
    pub balance: Option<f64>,
}

// ---------------------------------------------------------------------------
// PollOutcome
// ---------------------------------------------------------------------------

/// Normalized result of one poll round or one stream event.
///
/// Produced by the result fetcher and the stream processor, applied to the
/// registry by the polling loop, then discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub status: JobStatus,
    /// Progress percentage (0-100), when the remote reported one.
    pub progress: Option<u8>,
    /// Cumulative partial or final content. Replaces prior content
    /// wholesale; never appended.
    pub content: Option<String>,
    pub tokens: Option<TokensInfo>,
    /// Identifier assigned by the remote API, when known.
    pub remote_request_id: Option<String>,
    /// Cumulative settled sub-item counters (bulk jobs), when the
    /// observation carried them.
    pub completed_count: Option<u32>,
    pub failed_count: Option<u32>,
    pub total_count: Option<u32>,
    pub error: Option<String>,
}

impl PollOutcome {
    /// An in-flight observation with optional progress.
    pub fn processing(progress: Option<u8>) -> Self {
        Self {
            status: JobStatus::Processing,
            progress,
            content: None,
            tokens: None,
            remote_request_id: None,
            completed_count: None,
            failed_count: None,
            total_count: None,
            error: None,
        }
    }

    /// A terminal success carrying the final content.
    pub fn completed(content: String, tokens: Option<TokensInfo>) -> Self {
        Self {
            status: JobStatus::Completed,
            progress: Some(100),
            content: Some(content),
            tokens,
            ..Self::processing(None)
        }
    }

    /// A terminal failure with a display message.
    pub fn failed(message: String) -> Self {
        Self {
            status: JobStatus::Failed,
            progress: None,
            error: Some(message),
            ..Self::processing(None)
        }
    }

    /// Attach the remote-assigned request id.
    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_request_id = Some(remote_id.into());
        self
    }

    /// An empty poll carries no new information: non-terminal status and
    /// no progress, content, or counter movement. Empty polls feed the
    /// backoff policy.
    pub fn is_empty(&self) -> bool {
        !self.status.is_terminal()
            && self.progress.is_none()
            && self.content.is_none()
            && self.tokens.is_none()
            && self.completed_count.is_none()
            && self.failed_count.is_none()
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One tracked unit of asynchronous work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    /// Identifier assigned by the remote API; may differ from `id`.
    pub remote_request_id: Option<String>,
    pub kind: JobKind,
    pub mode: PollMode,
    pub submitted_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Consecutive error count; reset on any successful observation.
    pub retry_count: u32,
    /// Progress percentage, monotonically non-decreasing while processing.
    pub progress: u8,
    /// Latest cumulative partial result. Replaced wholesale on update.
    pub accumulated_content: Option<String>,
    /// Usage metadata from the completed result, kept for delivery.
    pub tokens: Option<TokensInfo>,
    /// Completed sub-items (bulk jobs).
    pub completed_count: u32,
    /// Failed sub-items (bulk jobs).
    pub failed_count: u32,
    /// Total sub-items, when known (bulk jobs).
    pub total_count: Option<u32>,
    /// Set exactly once, after the result has been durably persisted.
    pub delivered: bool,
    pub last_error: Option<String>,
}

impl Job {
    /// Create a freshly registered job in `Pending` state.
    pub fn new(id: impl Into<JobId>, kind: JobKind, mode: PollMode) -> Self {
        Self {
            id: id.into(),
            remote_request_id: None,
            kind,
            mode,
            submitted_at: Utc::now(),
            last_polled_at: None,
            status: JobStatus::Pending,
            retry_count: 0,
            progress: 0,
            accumulated_content: None,
            tokens: None,
            completed_count: 0,
            failed_count: 0,
            total_count: None,
            delivered: false,
            last_error: None,
        }
    }

    /// Fold a poll outcome into this job.
    ///
    /// Guards against reordered observations: a terminal status is never
    /// overwritten, a delivered job never re-enters processing, and
    /// progress never decreases. Content is replaced, not appended.
    pub fn apply_outcome(&mut self, outcome: &PollOutcome) {
        self.last_polled_at = Some(Utc::now());

        if self.delivered {
            return;
        }

        if outcome.status.rank() >= self.status.rank() && !self.status.is_terminal() {
            self.status = outcome.status;
        }

        if let Some(p) = outcome.progress {
            let p = p.min(100);
            if p > self.progress {
                self.progress = p;
            }
        }
        if self.status == JobStatus::Completed {
            self.progress = 100;
        }

        if let Some(content) = &outcome.content {
            self.accumulated_content = Some(content.clone());
        }
        if let Some(tokens) = outcome.tokens {
            self.tokens = Some(tokens);
        }
        if let Some(remote_id) = &outcome.remote_request_id {
            self.remote_request_id = Some(remote_id.clone());
        }
        if let Some(completed) = outcome.completed_count {
            self.completed_count = completed.max(self.completed_count);
        }
        if let Some(failed) = outcome.failed_count {
            self.failed_count = failed.max(self.failed_count);
        }
        if let Some(total) = outcome.total_count {
            self.total_count = Some(total);
        }
        if let Some(error) = &outcome.error {
            self.last_error = Some(error.clone());
        }
        if !outcome.is_empty() && outcome.error.is_none() {
            self.retry_count = 0;
        }
    }

    /// Whether the coordinator still needs to act on this job: it has not
    /// been delivered and has not ended in failure or cancellation.
    pub fn needs_polling(&self) -> bool {
        !self.delivered && !matches!(self.status, JobStatus::Failed | JobStatus::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
