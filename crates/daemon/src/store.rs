//! Minimal local collaborators for the standalone daemon.
//!
//! [`JsonLinesStore`] appends one JSON object per delivered result to a
//! file, keyed by job id so a replayed save is harmless (readers take the
//! last entry per id). [`TracingApplier`] logs completions and balance
//! updates instead of applying them anywhere.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use harvest_coordinator::delivery::{
    CollaboratorError, ContentApplier, PersistentStore, StoredResult,
};
use harvest_core::types::JobId;

/// Append-only JSON-lines result store.
pub struct JsonLinesStore {
    path: PathBuf,
}

impl JsonLinesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl PersistentStore for JsonLinesStore {
    async fn save(&self, job_id: &JobId, result: &StoredResult) -> Result<(), CollaboratorError> {
        let line = serde_json::to_string(&serde_json::json!({
            "job_id": job_id,
            "content": result.content,
            "tokens": result.tokens,
            "remote_request_id": result.remote_request_id,
            "completed_at": result.completed_at,
        }))?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        tracing::debug!(job_id = %job_id, path = %self.path.display(), "Result persisted");
        Ok(())
    }
}

/// Content applier that only logs; stands in for a real downstream
/// consumer when running the daemon standalone.
pub struct TracingApplier;

#[async_trait]
impl ContentApplier for TracingApplier {
    async fn on_job_completed(&self, job_id: &JobId, content: &str) {
        tracing::info!(job_id = %job_id, bytes = content.len(), "Job content ready");
    }

    async fn on_balance_updated(&self, balance: f64) {
        tracing::info!(balance, "Balance updated");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::types::TokensInfo;

    fn stored(content: &str) -> StoredResult {
        StoredResult {
            content: content.into(),
            tokens: Some(TokensInfo {
                used: 9,
                balance: None,
            }),
            remote_request_id: Some("r-1".into()),
            completed_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_appends_parseable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let store = JsonLinesStore::new(&path);

        store.save(&"a".to_string(), &stored("one")).await.unwrap();
        store.save(&"b".to_string(), &stored("two")).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["job_id"], "a");
        assert_eq!(lines[0]["content"], "one");
        assert_eq!(lines[0]["tokens"]["used"], 9);
        assert_eq!(lines[1]["job_id"], "b");
    }

    #[tokio::test]
    async fn replayed_save_appends_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let store = JsonLinesStore::new(&path);

        store.save(&"a".to_string(), &stored("one")).await.unwrap();
        store.save(&"a".to_string(), &stored("one")).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let ids: Vec<String> = raw
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["job_id"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        // Both entries share the key; last-entry-wins on read.
        assert_eq!(ids, vec!["a", "a"]);
    }
}
