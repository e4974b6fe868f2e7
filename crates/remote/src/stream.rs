//! Push-mode (SSE) stream processing for a single job.
//!
//! Reads raw bytes from an open event-stream connection, reassembles SSE
//! frames, parses each payload into a typed [`StreamEvent`], and folds
//! events into a [`StreamState`] that yields normalized
//! [`PollOutcome`]s. The processor owns no reconnect logic: when the
//! underlying connection drops, the sequence simply ends and the polling
//! loop opens a new processor for the same job.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Deserialize;

use harvest_core::types::{JobId, PollOutcome, TokensInfo};

use crate::error::RemoteApiError;

// ---------------------------------------------------------------------------
// StreamEvent
// ---------------------------------------------------------------------------

/// All recognized event kinds on a job's push stream.
///
/// Deserialized via the internally-tagged `"type"` field. Unrecognized
/// kinds decode to [`StreamEvent::Unknown`] and are skipped, so new
/// server-side event types never break an older client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Informational status; may carry progress and the sub-item total.
    Status {
        #[serde(default)]
        progress: Option<u8>,
        #[serde(default)]
        total: Option<u32>,
    },

    /// A sub-unit of a bulk job started processing. No effect on the
    /// overall job status.
    ItemStart {
        #[serde(default)]
        index: Option<u32>,
    },

    /// Cumulative partial content. The remote sends the running total,
    /// not a delta, so this replaces prior content wholesale.
    ContentChunk { accumulated_content: String },

    /// A sub-unit finished successfully.
    ItemComplete {
        #[serde(default)]
        total: Option<u32>,
    },

    /// A sub-unit failed; the job itself continues.
    ItemError {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        total: Option<u32>,
    },

    /// Authoritative progress override; wins over the item-derived value.
    Progress { progress: u8 },

    /// Terminal success with the final content and usage metadata.
    Complete {
        content: String,
        #[serde(default)]
        tokens: Option<TokensInfo>,
        #[serde(default)]
        remote_request_id: Option<String>,
    },

    /// Terminal failure.
    Error { message: String },

    /// Any unrecognized event kind; ignored.
    #[serde(other)]
    Unknown,
}

/// Parse one SSE data payload into a typed event.
pub fn parse_event(payload: &str) -> Result<StreamEvent, serde_json::Error> {
    serde_json::from_str(payload)
}

// ---------------------------------------------------------------------------
// StreamState
// ---------------------------------------------------------------------------

/// Accumulated view of one job's stream: partial content, progress, and
/// per-item completion counters.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    /// Item-derived or status-reported progress.
    progress: u8,
    /// Authoritative override from `progress` events.
    override_progress: Option<u8>,
    accumulated_content: Option<String>,
    completed_count: u32,
    failed_count: u32,
    total_count: Option<u32>,
}

impl StreamState {
    /// Fold one event into the state, producing a [`PollOutcome`] when the
    /// event carries information the polling loop must apply.
    pub fn apply(&mut self, event: StreamEvent) -> Option<PollOutcome> {
        match event {
            StreamEvent::Status { progress, total } => {
                if let Some(t) = total {
                    self.total_count = Some(t);
                }
                let progress = progress?;
                self.raise_progress(progress);
                Some(PollOutcome::processing(self.effective_progress()))
            }
            StreamEvent::ItemStart { .. } => None,
            StreamEvent::ContentChunk { accumulated_content } => {
                self.accumulated_content = Some(accumulated_content.clone());
                let mut outcome = PollOutcome::processing(self.effective_progress());
                outcome.content = Some(accumulated_content);
                Some(outcome)
            }
            StreamEvent::ItemComplete { total } => {
                self.completed_count += 1;
                self.note_item(total);
                Some(self.item_outcome())
            }
            StreamEvent::ItemError { message, total } => {
                self.failed_count += 1;
                self.note_item(total);
                if let Some(message) = &message {
                    tracing::debug!(message = %message, "Stream item failed");
                }
                Some(self.item_outcome())
            }
            StreamEvent::Progress { progress } => {
                self.override_progress = Some(progress.min(100));
                Some(PollOutcome::processing(self.override_progress))
            }
            StreamEvent::Complete {
                content,
                tokens,
                remote_request_id,
            } => {
                self.accumulated_content = Some(content.clone());
                let mut outcome = PollOutcome::completed(content, tokens);
                outcome.remote_request_id = remote_request_id;
                Some(outcome)
            }
            StreamEvent::Error { message } => Some(PollOutcome::failed(message)),
            StreamEvent::Unknown => None,
        }
    }

    /// Latest cumulative content observed on the stream.
    pub fn accumulated_content(&self) -> Option<&str> {
        self.accumulated_content.as_deref()
    }

    /// Outcome for a settled sub-item, carrying the cumulative counters.
    fn item_outcome(&self) -> PollOutcome {
        let mut outcome = PollOutcome::processing(self.effective_progress());
        outcome.completed_count = Some(self.completed_count);
        outcome.failed_count = Some(self.failed_count);
        outcome.total_count = self.total_count;
        outcome
    }

    fn note_item(&mut self, total: Option<u32>) {
        if let Some(t) = total {
            self.total_count = Some(t);
        }
        if let Some(total) = self.total_count.filter(|t| *t > 0) {
            let settled = self.completed_count + self.failed_count;
            let computed = ((settled * 100) / total).min(100) as u8;
            self.raise_progress(computed);
        }
    }

    fn raise_progress(&mut self, progress: u8) {
        let progress = progress.min(100);
        if progress > self.progress {
            self.progress = progress;
        }
    }

    /// The override always wins over the computed value.
    fn effective_progress(&self) -> Option<u8> {
        self.override_progress
            .or((self.progress > 0).then_some(self.progress))
    }
}

// ---------------------------------------------------------------------------
// StreamProcessor
// ---------------------------------------------------------------------------

/// SSE processor for exactly one job's event stream.
///
/// Lazy: frames are decoded as [`next_outcome`](Self::next_outcome) is
/// polled. The sequence ends (`None`) when the connection closes or
/// errors; the processor never retries the connection itself.
pub struct StreamProcessor<S> {
    job_id: JobId,
    stream: S,
    buffer: BytesMut,
    /// `data:` lines of the frame currently being assembled.
    data_lines: Vec<String>,
    /// Completed frame payloads not yet parsed.
    pending: VecDeque<String>,
    state: StreamState,
    done: bool,
}

impl<S> StreamProcessor<S>
where
    S: Stream<Item = Result<Bytes, RemoteApiError>> + Unpin + Send,
{
    /// Wrap an open byte stream for the given job.
    pub fn new(job_id: JobId, stream: S) -> Self {
        Self {
            job_id,
            stream,
            buffer: BytesMut::new(),
            data_lines: Vec::new(),
            pending: VecDeque::new(),
            state: StreamState::default(),
            done: false,
        }
    }

    /// The job this processor is attached to.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Next normalized outcome, or `None` once the connection has ended.
    ///
    /// Malformed frames and unrecognized event kinds are logged and
    /// skipped; they never end the sequence.
    pub async fn next_outcome(&mut self) -> Option<PollOutcome> {
        loop {
            while let Some(payload) = self.pending.pop_front() {
                match parse_event(&payload) {
                    Ok(StreamEvent::Unknown) => {
                        tracing::debug!(job_id = %self.job_id, "Ignoring unrecognized stream event");
                    }
                    Ok(event) => {
                        if let Some(outcome) = self.state.apply(event) {
                            return Some(outcome);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            job_id = %self.job_id,
                            error = %e,
                            raw_payload = %payload,
                            "Skipping malformed stream frame",
                        );
                    }
                }
            }

            if self.done {
                return None;
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.extend_from_slice(&chunk);
                    self.drain_lines();
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        error = %e,
                        "Event stream connection error",
                    );
                    self.done = true;
                    self.finish_frame();
                }
                None => {
                    tracing::debug!(job_id = %self.job_id, "Event stream ended");
                    self.done = true;
                    self.finish_frame();
                }
            }
        }
    }

    // ---- SSE framing ----

    /// Extract complete lines from the byte buffer.
    ///
    /// Splitting on `\n` is safe mid-chunk: multi-byte UTF-8 sequences
    /// never contain the newline byte.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.accept_line(&line);
        }
    }

    fn accept_line(&mut self, line: &str) {
        if line.is_empty() {
            self.finish_frame();
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if line.starts_with(':') {
            // Comment / keep-alive line.
        } else {
            // `event:` / `id:` / `retry:` fields are ignored; the payload
            // is self-describing JSON.
        }
    }

    /// Close out the frame being assembled, if any.
    fn finish_frame(&mut self) {
        if !self.data_lines.is_empty() {
            self.pending.push_back(self.data_lines.join("\n"));
            self.data_lines.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use harvest_core::types::JobStatus;

    fn sse(frames: &[&str]) -> String {
        frames
            .iter()
            .map(|payload| format!("data: {payload}\n\n"))
            .collect()
    }

    fn processor_for(
        raw: String,
        chunk_size: usize,
    ) -> StreamProcessor<impl Stream<Item = Result<Bytes, RemoteApiError>> + Unpin + Send> {
        let chunks: Vec<Result<Bytes, RemoteApiError>> = raw
            .into_bytes()
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        StreamProcessor::new("j1".to_string(), futures::stream::iter(chunks))
    }

    async fn collect_outcomes(
        processor: &mut StreamProcessor<
            impl Stream<Item = Result<Bytes, RemoteApiError>> + Unpin + Send,
        >,
    ) -> Vec<PollOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = processor.next_outcome().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    // -- event parsing --

    #[test]
    fn parse_content_chunk_event() {
        let event =
            parse_event(r#"{"type":"content_chunk","accumulated_content":"AB"}"#).unwrap();
        assert_matches!(event, StreamEvent::ContentChunk { accumulated_content } => {
            assert_eq!(accumulated_content, "AB");
        });
    }

    #[test]
    fn parse_complete_event() {
        let event = parse_event(
            r#"{"type":"complete","content":"ABC","tokens":{"used":12},"remote_request_id":"r-1"}"#,
        )
        .unwrap();
        assert_matches!(event, StreamEvent::Complete { content, tokens, remote_request_id } => {
            assert_eq!(content, "ABC");
            assert_eq!(tokens.unwrap().used, 12);
            assert_eq!(remote_request_id.as_deref(), Some("r-1"));
        });
    }

    #[test]
    fn parse_unknown_event_kind() {
        let event = parse_event(r#"{"type":"heartbeat_v2","data":{}}"#).unwrap();
        assert_matches!(event, StreamEvent::Unknown);
    }

    #[test]
    fn parse_invalid_json_is_error() {
        assert!(parse_event("not json at all").is_err());
    }

    // -- StreamState --

    #[test]
    fn item_counters_drive_progress() {
        let mut state = StreamState::default();
        state.apply(StreamEvent::Status { progress: None, total: Some(4) });

        state.apply(StreamEvent::ItemComplete { total: None });
        let outcome = state.apply(StreamEvent::ItemComplete { total: None }).unwrap();
        assert_eq!(outcome.progress, Some(50));

        let outcome = state
            .apply(StreamEvent::ItemError { message: Some("bad item".into()), total: None })
            .unwrap();
        assert_eq!(outcome.progress, Some(75));
        assert_eq!(outcome.completed_count, Some(2));
        assert_eq!(outcome.failed_count, Some(1));
        assert_eq!(outcome.total_count, Some(4));
    }

    #[test]
    fn progress_override_wins_over_computed() {
        let mut state = StreamState::default();
        state.apply(StreamEvent::Status { progress: None, total: Some(10) });
        state.apply(StreamEvent::Progress { progress: 90 });

        // One settled item out of ten would compute to 10%, but the
        // authoritative override stands.
        let outcome = state.apply(StreamEvent::ItemComplete { total: None }).unwrap();
        assert_eq!(outcome.progress, Some(90));
    }

    #[test]
    fn items_without_total_do_not_move_progress() {
        let mut state = StreamState::default();
        let outcome = state.apply(StreamEvent::ItemComplete { total: None }).unwrap();
        assert_eq!(outcome.progress, None);
        // Still counts as activity, not an empty poll.
        assert_eq!(outcome.completed_count, Some(1));
        assert!(!outcome.is_empty());
    }

    #[test]
    fn item_start_produces_no_outcome() {
        let mut state = StreamState::default();
        assert!(state.apply(StreamEvent::ItemStart { index: Some(0) }).is_none());
    }

    // -- StreamProcessor --

    #[tokio::test]
    async fn content_chunks_replace_then_complete() {
        let raw = sse(&[
            r#"{"type":"content_chunk","accumulated_content":"A"}"#,
            r#"{"type":"content_chunk","accumulated_content":"AB"}"#,
            r#"{"type":"complete","content":"ABC","tokens":{"used":120}}"#,
        ]);
        let mut processor = processor_for(raw, 16);
        let outcomes = collect_outcomes(&mut processor).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].content.as_deref(), Some("A"));
        assert_eq!(outcomes[1].content.as_deref(), Some("AB"));
        assert_eq!(outcomes[2].status, JobStatus::Completed);
        assert_eq!(outcomes[2].content.as_deref(), Some("ABC"));
        assert_eq!(outcomes[2].tokens.unwrap().used, 120);
    }

    #[tokio::test]
    async fn replayed_chunk_does_not_duplicate_content() {
        let raw = sse(&[
            r#"{"type":"content_chunk","accumulated_content":"AB"}"#,
            r#"{"type":"content_chunk","accumulated_content":"AB"}"#,
        ]);
        let mut processor = processor_for(raw, 1024);
        let outcomes = collect_outcomes(&mut processor).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].content.as_deref(), Some("AB"));
        assert_eq!(processor.state.accumulated_content(), Some("AB"));
    }

    #[tokio::test]
    async fn frames_survive_arbitrary_chunk_boundaries() {
        let raw = sse(&[
            r#"{"type":"content_chunk","accumulated_content":"hello world"}"#,
            r#"{"type":"complete","content":"hello world!"}"#,
        ]);
        // Deliver the stream one byte at a time.
        let mut processor = processor_for(raw, 1);
        let outcomes = collect_outcomes(&mut processor).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].content.as_deref(), Some("hello world!"));
    }

    #[tokio::test]
    async fn multi_line_data_frames_are_joined() {
        // JSON payload split across two data: lines of one frame.
        let raw = "data: {\"type\":\"content_chunk\",\ndata: \"accumulated_content\":\"AB\"}\n\n"
            .to_string();
        let mut processor = processor_for(raw, 1024);
        let outcomes = collect_outcomes(&mut processor).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].content.as_deref(), Some("AB"));
    }

    #[tokio::test]
    async fn comments_and_unknown_events_are_skipped() {
        let raw = format!(
            ": keep-alive\n\n{}",
            sse(&[
                r#"{"type":"shiny_new_event","payload":1}"#,
                r#"{"type":"complete","content":"done"}"#,
            ]),
        );
        let mut processor = processor_for(raw, 1024);
        let outcomes = collect_outcomes(&mut processor).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let raw = format!(
            "data: this is not json\n\n{}",
            sse(&[r#"{"type":"complete","content":"done"}"#]),
        );
        let mut processor = processor_for(raw, 1024);
        let outcomes = collect_outcomes(&mut processor).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn crlf_line_endings_accepted() {
        let raw = "data: {\"type\":\"complete\",\"content\":\"done\"}\r\n\r\n".to_string();
        let mut processor = processor_for(raw, 1024);
        let outcomes = collect_outcomes(&mut processor).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].content.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn error_event_is_terminal_failure() {
        let raw = sse(&[r#"{"type":"error","message":"generation failed"}"#]);
        let mut processor = processor_for(raw, 1024);
        let outcomes = collect_outcomes(&mut processor).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, JobStatus::Failed);
        assert_eq!(outcomes[0].error.as_deref(), Some("generation failed"));
    }

    #[tokio::test]
    async fn connection_error_ends_the_sequence() {
        let req_err = reqwest::Client::new().get("://bad").build().unwrap_err();
        let chunks: Vec<Result<Bytes, RemoteApiError>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"type\":\"content_chunk\",\"accumulated_content\":\"A\"}\n\n",
            )),
            Err(RemoteApiError::Transport(req_err)),
        ];
        let mut processor =
            StreamProcessor::new("j1".to_string(), futures::stream::iter(chunks));

        assert!(processor.next_outcome().await.is_some());
        assert!(processor.next_outcome().await.is_none());
        // The sequence stays ended.
        assert!(processor.next_outcome().await.is_none());
    }

    #[tokio::test]
    async fn status_progress_is_monotone() {
        let raw = sse(&[
            r#"{"type":"status","progress":30}"#,
            r#"{"type":"status","progress":20}"#,
        ]);
        let mut processor = processor_for(raw, 1024);
        let outcomes = collect_outcomes(&mut processor).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].progress, Some(30));
        assert_eq!(outcomes[1].progress, Some(30));
    }
}
