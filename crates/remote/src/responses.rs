//! Wire-level response types for the pull-mode remote API.
//!
//! Each response shape is decoded once, at this boundary, into a tagged
//! type that downstream code matches exhaustively.

use serde::Deserialize;

use harvest_core::types::{JobId, JobStatus, PollOutcome, TokensInfo};

// ---------------------------------------------------------------------------
// Status check
// ---------------------------------------------------------------------------

/// Response of the cheap per-job status check.
///
/// Tag-dispatched on the `"status"` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteStatus {
    /// Queued, not yet picked up by the remote.
    Pending,
    /// In progress, optionally with a percentage.
    Processing {
        #[serde(default)]
        progress: Option<u8>,
    },
    /// Finished; the full payload must be fetched separately.
    Completed,
    /// Failed remotely with an optional message.
    Failed {
        #[serde(default)]
        error: Option<String>,
    },
}

impl RemoteStatus {
    /// Normalize into a [`PollOutcome`].
    ///
    /// `Completed` intentionally carries no content here; the fetcher
    /// issues the separate results call for that.
    pub fn into_outcome(self) -> PollOutcome {
        match self {
            RemoteStatus::Pending => PollOutcome {
                status: JobStatus::Pending,
                ..PollOutcome::processing(None)
            },
            RemoteStatus::Processing { progress } => PollOutcome::processing(progress),
            RemoteStatus::Completed => PollOutcome {
                status: JobStatus::Completed,
                ..PollOutcome::processing(None)
            },
            RemoteStatus::Failed { error } => {
                PollOutcome::failed(error.unwrap_or_else(|| "remote reported failure".into()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Results fetch
// ---------------------------------------------------------------------------

/// Full payload of a completed job.
#[derive(Debug, Clone, Deserialize)]
pub struct JobResults {
    pub content: String,
    #[serde(default)]
    pub tokens: Option<TokensInfo>,
    #[serde(default)]
    pub remote_request_id: Option<String>,
}

impl JobResults {
    /// Normalize into a terminal [`PollOutcome`].
    pub fn into_outcome(self) -> PollOutcome {
        let mut outcome = PollOutcome::completed(self.content, self.tokens);
        outcome.remote_request_id = self.remote_request_id;
        outcome
    }
}

// ---------------------------------------------------------------------------
// Bulk poll
// ---------------------------------------------------------------------------

/// One completed-but-undelivered result from a bulk poll.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkResult {
    pub job_id: JobId,
    pub content: String,
    #[serde(default)]
    pub tokens: Option<TokensInfo>,
    #[serde(default)]
    pub remote_request_id: Option<String>,
}

impl BulkResult {
    /// Normalize into a terminal [`PollOutcome`] (job id is carried
    /// separately by the caller).
    pub fn into_outcome(self) -> PollOutcome {
        let mut outcome = PollOutcome::completed(self.content, self.tokens);
        outcome.remote_request_id = self.remote_request_id;
        outcome
    }
}

/// Response of the bulk poll: all completed-but-undelivered results for
/// the caller's scope in one round trip.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkPoll {
    pub has_results: bool,
    #[serde(default)]
    pub results: Vec<BulkResult>,
    /// Remaining account balance, when the remote reports it.
    #[serde(default)]
    pub balance: Option<f64>,
}

// ---------------------------------------------------------------------------
// Idle probe
// ---------------------------------------------------------------------------

/// Response of the cheap "any active jobs?" probe used in idle mode.
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveProbe {
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
