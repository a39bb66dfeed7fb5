//! Error taxonomy for the session engine.
//!
//! `ApiError` and `RealtimeError` describe collaborator failures;
//! `SessionError` is what the controller hands back to the UI layer.
//! Only initialization and submission failures are blocking, everything else
//! is absorbed locally to protect in-progress work.

use thiserror::Error;

use crate::controller::Phase;
use crate::model::AttemptStatus;

/// Errors returned by an attempt API backend.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The request could not reach the server.
    #[error("network error: {0}")]
    Network(String),

    /// The request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// The attempt or test does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server refused the write because the attempt is no longer open.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The API returned an error response.
    #[error("API error (HTTP {status}): {message}")]
    Http { status: u16, message: String },

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Returns `true` if retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout(_) => true,
            ApiError::Http { status, .. } => *status >= 500 || *status == 429,
            ApiError::NotFound(_) | ApiError::Conflict(_) | ApiError::Decode(_) => false,
        }
    }
}

/// Errors from the realtime channel. Never surfaced to the user.
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("channel closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

/// Errors returned by the session controller.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The attempt could not be created or resumed.
    #[error("session could not start: {0}")]
    Initialization(#[source] ApiError),

    /// The test definition has no questions to present.
    #[error("test {0} has no questions")]
    NoQuestions(String),

    /// The test definition cannot be run as given, e.g. two questions share an id.
    #[error("invalid test {test_id}: {reason}")]
    InvalidTest { test_id: String, reason: String },

    /// The final submission failed; local state is intact and submit may be retried.
    #[error("submission failed: {0}")]
    Submission(#[source] ApiError),

    /// The attempt is submitted or expired; answers are frozen.
    #[error("attempt is {status}, no further changes are accepted")]
    Terminal { status: AttemptStatus },

    /// The controller is not in a phase that accepts this operation.
    #[error("session is {phase}, operation not permitted")]
    NotActive { phase: Phase },

    /// Time is up; only submission is still possible.
    #[error("session time has expired")]
    Expired,

    #[error("unknown question: {0}")]
    UnknownQuestion(String),

    #[error("invalid answer for {question_id}: {reason}")]
    InvalidAnswer { question_id: String, reason: String },
}

impl SessionError {
    /// Whether the UI must show this error as a blocking state.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            SessionError::Initialization(_)
                | SessionError::NoQuestions(_)
                | SessionError::InvalidTest { .. }
                | SessionError::Submission(_)
        )
    }
}
