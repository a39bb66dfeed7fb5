//! Results handoff.
//!
//! Shapes the final state for submission and packages what the server
//! returned into a [`ResultPayload`] for display and analytics consumers.
//! No scoring happens here.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::model::{AnswerEntry, Attempt, AttemptStatus, Progress, SubmitRequest, SubmitResponse};
use crate::store::AnswerStore;
use crate::traits::ResultConsumer;

/// The finished session, as handed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub attempt_id: String,
    pub test_id: String,
    pub user_id: String,
    pub status: AttemptStatus,
    pub submitted_at: DateTime<Utc>,
    pub answers: Vec<AnswerEntry>,
    pub flags: BTreeMap<String, bool>,
    pub time_spent: BTreeMap<String, u64>,
    pub total_time_seconds: u64,
    pub progress: Progress,
    /// Server grading result, forwarded untouched.
    pub server: SubmitResponse,
}

impl ResultPayload {
    /// Save the payload as JSON to a file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize result")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("failed to write result to {}", path.display()))?;
        Ok(())
    }

    /// Load a payload from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read result from {}", path.display()))?;
        serde_json::from_str(&content).context("failed to parse result JSON")
    }
}

/// The submission body for the store's current state.
pub fn build_submission(store: &AnswerStore) -> SubmitRequest {
    SubmitRequest {
        final_answers: store.answers(),
        time_spent: store.time_spent(),
        flags: store.flags(),
    }
}

/// Package the submitted state and the server's response.
pub fn finalize(
    attempt: &Attempt,
    submitted: SubmitRequest,
    progress: Progress,
    server: SubmitResponse,
    submitted_at: DateTime<Utc>,
) -> ResultPayload {
    let total_time_seconds = submitted.time_spent.values().sum();
    ResultPayload {
        attempt_id: attempt.id.clone(),
        test_id: attempt.test_id.clone(),
        user_id: attempt.user_id.clone(),
        status: attempt.status,
        submitted_at,
        answers: submitted.final_answers,
        flags: submitted.flags,
        time_spent: submitted.time_spent,
        total_time_seconds,
        progress,
        server,
    }
}

/// Hand `payload` to every consumer in its own task.
///
/// Consumer failures are logged; nothing waits on them.
pub fn deliver(payload: Arc<ResultPayload>, consumers: &[Arc<dyn ResultConsumer>]) -> Vec<JoinHandle<()>> {
    consumers
        .iter()
        .map(|consumer| {
            let consumer = Arc::clone(consumer);
            let payload = Arc::clone(&payload);
            tokio::spawn(async move {
                if let Err(e) = consumer.consume(payload).await {
                    tracing::warn!("result consumer '{}' failed: {e:#}", consumer.name());
                }
            })
        })
        .collect()
}
