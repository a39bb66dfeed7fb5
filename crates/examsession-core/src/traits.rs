//! Async trait definitions for the engine's external collaborators.
//!
//! The HTTP attempt client in `examsession-api` and the in-memory doubles in
//! [`crate::mock`] implement these.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::{ApiError, RealtimeError};
use crate::handoff::ResultPayload;
use crate::model::{AttemptRecord, Checkpoint, NewAttempt, Question, SubmitRequest, SubmitResponse};
use crate::realtime::{InboundMessage, OutboundEvent};

// ---------------------------------------------------------------------------
// Attempt API
// ---------------------------------------------------------------------------

/// Remote record of attempts: creation, resume, checkpoints and submission.
#[async_trait]
pub trait AttemptApi: Send + Sync {
    /// Create an attempt, or return the open one if the user already started this test.
    async fn create_attempt(
        &self,
        test_id: &str,
        user_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<NewAttempt, ApiError>;

    /// Fetch the full state of an attempt for resume or reconciliation.
    async fn get_attempt(&self, attempt_id: &str) -> Result<AttemptRecord, ApiError>;

    /// Fetch the questions of a test whose definition does not embed them.
    async fn fetch_questions(&self, test_id: &str) -> Result<Vec<Question>, ApiError>;

    /// Persist a full-state checkpoint. Later checkpoints overwrite earlier ones.
    async fn save_checkpoint(&self, attempt_id: &str, checkpoint: &Checkpoint)
        -> Result<(), ApiError>;

    /// Submit the final answers. The server grades and returns the result.
    async fn submit_attempt(
        &self,
        attempt_id: &str,
        request: &SubmitRequest,
    ) -> Result<SubmitResponse, ApiError>;

    /// Release server-side resources of an abandoned attempt. Best-effort.
    async fn cleanup(&self, attempt_id: &str) -> Result<(), ApiError>;
}

// ---------------------------------------------------------------------------
// Realtime channel
// ---------------------------------------------------------------------------

/// Outgoing half of an open realtime connection.
#[async_trait]
pub trait RealtimeSink: Send {
    async fn send(&mut self, event: &OutboundEvent) -> Result<(), RealtimeError>;
}

/// An open realtime connection, split into its two directions.
///
/// The inbound stream ending means the connection dropped.
pub struct RealtimeLink {
    pub sink: Box<dyn RealtimeSink>,
    pub inbound: BoxStream<'static, Result<InboundMessage, RealtimeError>>,
}

/// Message transport scoped by session id (a WebSocket in production).
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, session_id: &str) -> Result<RealtimeLink, RealtimeError>;
}

// ---------------------------------------------------------------------------
// Result consumers
// ---------------------------------------------------------------------------

/// Downstream receiver of a finished session's results (performance analysis,
/// analytics views). The session never waits on or depends on its outcome.
#[async_trait]
pub trait ResultConsumer: Send + Sync {
    fn name(&self) -> &str;

    async fn consume(&self, payload: Arc<ResultPayload>) -> anyhow::Result<()>;
}
