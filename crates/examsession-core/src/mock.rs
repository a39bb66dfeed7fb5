//! In-memory collaborators for testing and offline demos.
//!
//! [`MockAttemptApi`] keeps attempts in memory and behaves like the server
//! would for the calls the engine makes. Failures and latency can be injected
//! per call kind. [`MockTransport`] is a realtime channel the test can drive,
//! and [`RecordingConsumer`] remembers every result it was handed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::{ApiError, RealtimeError};
use crate::handoff::ResultPayload;
use crate::lock;
use crate::model::{
    Attempt, AttemptRecord, AttemptStatus, Checkpoint, NewAttempt, Question, SubmitRequest,
    SubmitResponse, TestDefinition,
};
use crate::realtime::{InboundMessage, OutboundEvent};
use crate::traits::{AttemptApi, RealtimeLink, RealtimeSink, RealtimeTransport, ResultConsumer};

/// Duration given to attempts of tests the mock was not told about.
const DEFAULT_DURATION_SECONDS: u64 = 3600;

#[derive(Default)]
struct Faults {
    create: bool,
    get: bool,
    checkpoint: bool,
    submit: bool,
    checkpoint_delay: Option<Duration>,
    submit_delay: Option<Duration>,
}

/// An attempt API backed by memory.
#[derive(Default)]
pub struct MockAttemptApi {
    questions: Mutex<HashMap<String, Vec<Question>>>,
    durations: Mutex<HashMap<String, u64>>,
    attempts: Mutex<HashMap<String, AttemptRecord>>,
    checkpoints: Mutex<Vec<(String, Checkpoint)>>,
    submissions: Mutex<Vec<(String, SubmitRequest)>>,
    faults: Mutex<Faults>,
    next_id: AtomicU32,
    submit_count: AtomicUsize,
    cleanup_count: AtomicUsize,
}

impl MockAttemptApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a test's duration and questions.
    pub fn with_test(self, test: &TestDefinition) -> Self {
        lock(&self.durations).insert(test.id.clone(), test.duration_seconds);
        if !test.questions.is_empty() {
            lock(&self.questions).insert(test.id.clone(), test.questions.clone());
        }
        self
    }

    /// Serve `questions` for `test_id` from `fetch_questions`.
    pub fn with_questions(self, test_id: &str, questions: Vec<Question>) -> Self {
        lock(&self.questions).insert(test_id.to_string(), questions);
        self
    }

    /// Seed an existing attempt, e.g. one to resume.
    pub fn with_attempt(self, record: AttemptRecord) -> Self {
        lock(&self.attempts).insert(record.attempt.id.clone(), record);
        self
    }

    pub fn set_create_failure(&self, fail: bool) {
        lock(&self.faults).create = fail;
    }

    pub fn set_get_failure(&self, fail: bool) {
        lock(&self.faults).get = fail;
    }

    pub fn set_checkpoint_failure(&self, fail: bool) {
        lock(&self.faults).checkpoint = fail;
    }

    pub fn set_submit_failure(&self, fail: bool) {
        lock(&self.faults).submit = fail;
    }

    pub fn set_checkpoint_delay(&self, delay: Option<Duration>) {
        lock(&self.faults).checkpoint_delay = delay;
    }

    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        lock(&self.faults).submit_delay = delay;
    }

    /// Change an attempt on the "server side", as an administrator would.
    pub fn update_attempt(&self, attempt_id: &str, update: impl FnOnce(&mut Attempt)) {
        if let Some(record) = lock(&self.attempts).get_mut(attempt_id) {
            update(&mut record.attempt);
        }
    }

    /// The stored record of an attempt.
    pub fn attempt(&self, attempt_id: &str) -> Option<AttemptRecord> {
        lock(&self.attempts).get(attempt_id).cloned()
    }

    /// Number of successful checkpoint writes.
    pub fn checkpoint_count(&self) -> usize {
        lock(&self.checkpoints).len()
    }

    pub fn checkpoints(&self) -> Vec<(String, Checkpoint)> {
        lock(&self.checkpoints).clone()
    }

    pub fn last_checkpoint(&self) -> Option<(String, Checkpoint)> {
        lock(&self.checkpoints).last().cloned()
    }

    /// Number of submit calls received, failed ones included.
    pub fn submit_count(&self) -> usize {
        self.submit_count.load(Ordering::SeqCst)
    }

    pub fn last_submission(&self) -> Option<(String, SubmitRequest)> {
        lock(&self.submissions).last().cloned()
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanup_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttemptApi for MockAttemptApi {
    async fn create_attempt(
        &self,
        test_id: &str,
        user_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<NewAttempt, ApiError> {
        if lock(&self.faults).create {
            return Err(ApiError::Network("connection refused".into()));
        }
        let mut attempts = lock(&self.attempts);
        // The server hands back the open attempt instead of starting a second one.
        if let Some(open) = attempts.values().find(|r| {
            r.attempt.test_id == test_id
                && r.attempt.user_id == user_id
                && r.attempt.status == AttemptStatus::InProgress
        }) {
            return Ok(NewAttempt {
                id: open.attempt.id.clone(),
                started_at: open.attempt.started_at,
            });
        }

        let id = format!("attempt-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let duration_seconds = lock(&self.durations)
            .get(test_id)
            .copied()
            .unwrap_or(DEFAULT_DURATION_SECONDS);
        attempts.insert(
            id.clone(),
            AttemptRecord {
                attempt: Attempt {
                    id: id.clone(),
                    test_id: test_id.to_string(),
                    user_id: user_id.to_string(),
                    started_at: start_time,
                    duration_seconds,
                    status: AttemptStatus::InProgress,
                },
                answers: Vec::new(),
                flags: Default::default(),
                time_spent: Default::default(),
                current_index: 0,
            },
        );
        Ok(NewAttempt {
            id,
            started_at: start_time,
        })
    }

    async fn get_attempt(&self, attempt_id: &str) -> Result<AttemptRecord, ApiError> {
        if lock(&self.faults).get {
            return Err(ApiError::Network("connection reset".into()));
        }
        lock(&self.attempts)
            .get(attempt_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("attempt {attempt_id}")))
    }

    async fn fetch_questions(&self, test_id: &str) -> Result<Vec<Question>, ApiError> {
        lock(&self.questions)
            .get(test_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("test {test_id}")))
    }

    async fn save_checkpoint(
        &self,
        attempt_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), ApiError> {
        let (fail, delay) = {
            let faults = lock(&self.faults);
            (faults.checkpoint, faults.checkpoint_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ApiError::Http {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        {
            let mut attempts = lock(&self.attempts);
            if let Some(record) = attempts.get_mut(attempt_id) {
                if record.attempt.status.is_terminal() {
                    return Err(ApiError::Conflict(format!(
                        "attempt {attempt_id} is {}",
                        record.attempt.status
                    )));
                }
                record.answers = checkpoint.answers.clone();
                record.flags = checkpoint.flags.clone();
                record.time_spent = checkpoint.time_spent.clone();
                record.current_index = checkpoint.current_index;
            }
        }
        lock(&self.checkpoints).push((attempt_id.to_string(), checkpoint.clone()));
        Ok(())
    }

    async fn submit_attempt(
        &self,
        attempt_id: &str,
        request: &SubmitRequest,
    ) -> Result<SubmitResponse, ApiError> {
        self.submit_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.submissions).push((attempt_id.to_string(), request.clone()));
        let (fail, delay) = {
            let faults = lock(&self.faults);
            (faults.submit, faults.submit_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ApiError::Http {
                status: 502,
                message: "bad gateway".into(),
            });
        }

        let mut attempts = lock(&self.attempts);
        let record = attempts
            .get_mut(attempt_id)
            .ok_or_else(|| ApiError::NotFound(format!("attempt {attempt_id}")))?;
        if record.attempt.status.is_terminal() {
            return Err(ApiError::Conflict(format!("attempt {attempt_id} already closed")));
        }
        record.attempt.status = AttemptStatus::Submitted;
        record.answers = request.final_answers.clone();
        record.flags = request.flags.clone();
        record.time_spent = request.time_spent.clone();

        let total = lock(&self.questions)
            .get(&record.attempt.test_id)
            .map(|q| q.len())
            .unwrap_or(request.final_answers.len());
        let score = request.final_answers.len() as f64;
        let max_score = total.max(1) as f64;
        Ok(SubmitResponse {
            attempt_id: attempt_id.to_string(),
            score: Some(score),
            max_score: Some(max_score),
            percentage: Some(score / max_score * 100.0),
            passed: Some(score / max_score >= 0.5),
            details: serde_json::json!({ "graded_by": "mock" }),
        })
    }

    async fn cleanup(&self, _attempt_id: &str) -> Result<(), ApiError> {
        self.cleanup_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Realtime
// ---------------------------------------------------------------------------

type InboundSender = mpsc::UnboundedSender<Result<InboundMessage, RealtimeError>>;

/// A realtime transport driven from the test.
#[derive(Default)]
pub struct MockTransport {
    failing: AtomicBool,
    connects: AtomicUsize,
    sent: Arc<Mutex<Vec<OutboundEvent>>>,
    inbound: Mutex<Option<InboundSender>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose every connect attempt fails.
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.set_failing(true);
        transport
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Deliver `message` on the current connection, if any.
    pub fn push_inbound(&self, message: InboundMessage) {
        if let Some(tx) = lock(&self.inbound).as_ref() {
            let _ = tx.send(Ok(message));
        }
    }

    /// Drop the current connection from the server side.
    pub fn drop_link(&self) {
        lock(&self.inbound).take();
    }

    /// Every event the engine pushed, across connections.
    pub fn sent(&self) -> Vec<OutboundEvent> {
        lock(&self.sent).clone()
    }
}

struct MockSink {
    sent: Arc<Mutex<Vec<OutboundEvent>>>,
}

#[async_trait]
impl RealtimeSink for MockSink {
    async fn send(&mut self, event: &OutboundEvent) -> Result<(), RealtimeError> {
        lock(&self.sent).push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl RealtimeTransport for MockTransport {
    async fn connect(&self, session_id: &str) -> Result<RealtimeLink, RealtimeError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RealtimeError::ConnectFailed(format!(
                "no channel for session {session_id}"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inbound) = Some(tx);
        let inbound = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .boxed();
        Ok(RealtimeLink {
            sink: Box::new(MockSink {
                sent: Arc::clone(&self.sent),
            }),
            inbound,
        })
    }
}

// ---------------------------------------------------------------------------
// Result consumers
// ---------------------------------------------------------------------------

/// A result consumer that records every payload it receives.
pub struct RecordingConsumer {
    name: String,
    fail: bool,
    received: Mutex<Vec<Arc<ResultPayload>>>,
}

impl RecordingConsumer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: false,
            received: Mutex::new(Vec::new()),
        }
    }

    /// Records the payload, then reports a failure.
    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn received(&self) -> Vec<Arc<ResultPayload>> {
        lock(&self.received).clone()
    }
}

#[async_trait]
impl ResultConsumer for RecordingConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self, payload: Arc<ResultPayload>) -> anyhow::Result<()> {
        lock(&self.received).push(payload);
        if self.fail {
            anyhow::bail!("{} is unavailable", self.name);
        }
        Ok(())
    }
}
