//! Session controller.
//!
//! Creates or resumes the attempt, starts the clock, the autosave scheduler
//! and the realtime adapter, and routes every interaction through the
//! answer store. Owns the lifecycle state machine:
//!
//! ```text
//! initializing -> active -> submitting -> completed
//!                   ^           |
//!                   +-----------+  (remote submit failed)
//! ```
//!
//! `active` carries a `confirming` sub-flag for the submit dialog. The timer
//! path skips confirmation. Submission is deduplicated by phase, so a manual
//! submit racing the timer reaches the server once.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::autosave::{AutosaveScheduler, SaveReport};
use crate::clock::{remaining_seconds, SessionTimer, TimeSource};
use crate::error::{ApiError, SessionError};
use crate::handoff::{self, ResultPayload};
use crate::keyboard::{self, Key, KeyContext};
use crate::lock;
use crate::model::{
    AnswerValue, Attempt, AttemptRecord, AttemptStatus, Checkpoint, Progress, Question,
    TestDefinition,
};
use crate::realtime::{ConnectionState, OutboundEvent, RealtimeAdapter, ReconnectPolicy};
use crate::store::AnswerStore;
use crate::traits::{AttemptApi, RealtimeTransport, ResultConsumer};

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet interval before a requested checkpoint is written.
    pub autosave_debounce: Duration,
    /// How often the clock recomputes remaining time.
    pub tick_interval: Duration,
    /// Realtime reconnect behaviour.
    pub reconnect: ReconnectPolicy,
    /// Attempt refresh interval once the realtime channel is unavailable.
    pub poll_interval: Duration,
    /// Upper bound on the best-effort cleanup call at teardown.
    pub cleanup_timeout: Duration,
    /// Buffered session events per subscriber.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_debounce: Duration::from_secs(2),
            tick_interval: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
            poll_interval: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(5),
            event_capacity: 256,
        }
    }
}

/// Collaborators a session talks to.
pub struct SessionDeps {
    pub api: Arc<dyn AttemptApi>,
    pub time: Arc<dyn TimeSource>,
    /// `None` runs without a realtime channel; the session polls instead.
    pub realtime: Option<Arc<dyn RealtimeTransport>>,
    pub consumers: Vec<Arc<dyn ResultConsumer>>,
}

impl SessionDeps {
    pub fn new(api: Arc<dyn AttemptApi>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            api,
            time,
            realtime: None,
            consumers: Vec::new(),
        }
    }

    pub fn with_realtime(mut self, transport: Arc<dyn RealtimeTransport>) -> Self {
        self.realtime = Some(transport);
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn ResultConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }
}

/// How to obtain the attempt.
#[derive(Debug, Clone)]
pub enum StartMode {
    New { user_id: String },
    Resume { attempt_id: String },
}

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    Active,
    Submitting,
    Completed,
    /// Torn down or closed by the server before a local submission completed.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Initializing => write!(f, "initializing"),
            Phase::Active => write!(f, "active"),
            Phase::Submitting => write!(f, "submitting"),
            Phase::Completed => write!(f, "completed"),
            Phase::Closed => write!(f, "closed"),
        }
    }
}

/// Entry points shared by pointer and keyboard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Next,
    Previous,
    JumpTo(usize),
    ToggleFlag,
    RequestSubmit,
    ConfirmSubmit,
    CancelSubmit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmitTrigger {
    User,
    Timeout,
}

/// Counts shown in the submit confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitSummary {
    pub answered: usize,
    pub unanswered: usize,
    pub flagged: usize,
    pub total: usize,
}

impl From<Progress> for SubmitSummary {
    fn from(p: Progress) -> Self {
        Self {
            answered: p.answered,
            unanswered: p.unanswered(),
            flagged: p.flagged,
            total: p.total,
        }
    }
}

/// Result of a submit request.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Unanswered questions remain; waiting for explicit confirmation.
    NeedsConfirmation(SubmitSummary),
    Completed(Arc<ResultPayload>),
    /// Another submission is already running; no second remote call was made.
    AlreadyInFlight,
    AlreadyCompleted,
    /// Confirmation arrived without an open confirmation dialog.
    NotRequested,
}

/// Result of a dispatched [`SessionAction`].
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    Navigated { index: usize, moved: bool },
    Flagged { question_id: String, flagged: bool },
    Submit(SubmitOutcome),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Connected,
    Disconnected,
}

/// Notifications for the UI layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Tick { remaining: u64 },
    Expired,
    SaveStatus(SaveReport),
    Connectivity(ConnectionState),
    /// A proctor or collaborator message, unmodified.
    Proctor(crate::realtime::InboundMessage),
    SubmitFailed { message: String },
    Completed(Arc<ResultPayload>),
    RemoteRefresh { status: AttemptStatus },
    ClosedRemotely { status: AttemptStatus },
}

/// Derived view of the session for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub attempt_id: String,
    pub phase: Phase,
    pub confirming: bool,
    pub current_index: usize,
    pub total_questions: usize,
    pub question: Question,
    pub answer: Option<AnswerValue>,
    pub flagged: bool,
    pub remaining_seconds: u64,
    pub progress: Progress,
    pub connectivity: Connectivity,
    pub save: SaveReport,
}

struct Core {
    attempt: Attempt,
    store: AnswerStore,
    phase: Phase,
    confirming: bool,
    current_index: usize,
    result: Option<Arc<ResultPayload>>,
}

impl Core {
    fn remaining(&self, now: DateTime<Utc>) -> u64 {
        remaining_seconds(self.attempt.started_at, self.attempt.duration_seconds, now)
    }

    fn checkpoint(&self, now: DateTime<Utc>) -> Checkpoint {
        self.store.checkpoint(self.remaining(now), self.current_index)
    }

    fn ensure_mutable(&self, now: DateTime<Utc>) -> Result<(), SessionError> {
        if let Some(status) = self.store.frozen_status() {
            return Err(SessionError::Terminal { status });
        }
        if self.phase != Phase::Active {
            return Err(SessionError::NotActive { phase: self.phase });
        }
        if self.remaining(now) == 0 {
            return Err(SessionError::Expired);
        }
        Ok(())
    }

    fn outbound(&self, question_id: &str, now: DateTime<Utc>) -> OutboundEvent {
        OutboundEvent {
            question_id: question_id.to_string(),
            answer_snapshot: self.store.answer(question_id).map(|e| e.value.clone()),
            timestamp: now,
            time_spent: self.store.time_spent_on(question_id),
        }
    }
}

struct Inner {
    config: SessionConfig,
    api: Arc<dyn AttemptApi>,
    time: Arc<dyn TimeSource>,
    consumers: Vec<Arc<dyn ResultConsumer>>,
    core: Mutex<Core>,
    autosave: AutosaveScheduler,
    timer: Mutex<SessionTimer>,
    realtime: Mutex<Option<RealtimeAdapter>>,
    events: broadcast::Sender<SessionEvent>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in lock(&self.background).drain(..) {
            task.abort();
        }
    }
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Create or resume the attempt and start the session.
    ///
    /// Fails with a blocking error if the attempt cannot be obtained.
    pub async fn start(
        config: SessionConfig,
        deps: SessionDeps,
        test: &TestDefinition,
        mode: StartMode,
    ) -> Result<Self, SessionError> {
        let SessionDeps {
            api,
            time,
            realtime,
            consumers,
        } = deps;

        let questions = if test.questions.is_empty() {
            api.fetch_questions(&test.id).await.map_err(init_failed)?
        } else {
            test.questions.clone()
        };
        if questions.is_empty() {
            tracing::error!(test = %test.id, "test has no questions");
            return Err(SessionError::NoQuestions(test.id.clone()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = questions.iter().find(|q| !seen.insert(q.id.as_str())) {
            tracing::error!(test = %test.id, question = %dup.id, "duplicate question id");
            return Err(SessionError::InvalidTest {
                test_id: test.id.clone(),
                reason: format!("duplicate question id {}", dup.id),
            });
        }

        let (attempt, mut store, current_index) = match mode {
            StartMode::New { user_id } => {
                let requested = time.now();
                let created = api
                    .create_attempt(&test.id, &user_id, requested)
                    .await
                    .map_err(init_failed)?;
                if created.started_at < requested {
                    // The server handed back an attempt that was already open.
                    let record = api.get_attempt(&created.id).await.map_err(init_failed)?;
                    resume_from(questions, record)?
                } else {
                    tracing::info!(attempt = %created.id, test = %test.id, "attempt created");
                    let attempt = Attempt {
                        id: created.id,
                        test_id: test.id.clone(),
                        user_id,
                        started_at: created.started_at,
                        duration_seconds: test.duration_seconds,
                        status: AttemptStatus::InProgress,
                    };
                    (attempt, AnswerStore::new(questions), 0)
                }
            }
            StartMode::Resume { attempt_id } => {
                let record = api.get_attempt(&attempt_id).await.map_err(init_failed)?;
                resume_from(questions, record)?
            }
        };

        let first = store.questions()[current_index].id.clone();
        store.focus(&first, time.now())?;

        let autosave = AutosaveScheduler::spawn(
            Arc::clone(&api),
            attempt.id.clone(),
            Arc::clone(&time),
            config.autosave_debounce,
        );
        let timer = SessionTimer::new(Arc::clone(&time), config.tick_interval);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let controller = Self {
            inner: Arc::new(Inner {
                config,
                api,
                time,
                consumers,
                core: Mutex::new(Core {
                    attempt,
                    store,
                    phase: Phase::Initializing,
                    confirming: false,
                    current_index,
                    result: None,
                }),
                autosave,
                timer: Mutex::new(timer),
                realtime: Mutex::new(None),
                events,
                background: Mutex::new(Vec::new()),
            }),
        };

        lock(&controller.inner.core).phase = Phase::Active;
        controller.forward_save_status();
        controller.start_timer();
        match realtime {
            Some(transport) => controller.connect_realtime(transport),
            None => {
                let weak = Arc::downgrade(&controller.inner);
                let every = controller.inner.config.poll_interval;
                controller.track(tokio::spawn(poll_remote(weak, every)));
            }
        }
        Ok(controller)
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn attempt(&self) -> Attempt {
        lock(&self.inner.core).attempt.clone()
    }

    pub fn phase(&self) -> Phase {
        lock(&self.inner.core).phase
    }

    pub fn progress(&self) -> Progress {
        lock(&self.inner.core).store.progress()
    }

    pub fn current_index(&self) -> usize {
        lock(&self.inner.core).current_index
    }

    pub fn questions(&self) -> Vec<Question> {
        lock(&self.inner.core).store.questions().to_vec()
    }

    /// Remaining seconds recomputed from the attempt anchor.
    pub fn remaining_seconds(&self) -> u64 {
        let now = self.inner.time.now();
        lock(&self.inner.core).remaining(now)
    }

    pub fn time_spent(&self) -> std::collections::BTreeMap<String, u64> {
        lock(&self.inner.core).store.time_spent()
    }

    pub fn save_report(&self) -> SaveReport {
        self.inner.autosave.report()
    }

    pub fn connectivity(&self) -> Connectivity {
        match lock(&self.inner.realtime).as_ref() {
            Some(adapter) if adapter.is_connected() => Connectivity::Connected,
            _ => Connectivity::Disconnected,
        }
    }

    /// The finished result, once the session completed.
    pub fn result(&self) -> Option<Arc<ResultPayload>> {
        lock(&self.inner.core).result.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let now = self.inner.time.now();
        let connectivity = self.connectivity();
        let save = self.inner.autosave.report();
        let core = lock(&self.inner.core);
        let question = core.store.questions()[core.current_index].clone();
        SessionSnapshot {
            attempt_id: core.attempt.id.clone(),
            phase: core.phase,
            confirming: core.confirming,
            current_index: core.current_index,
            total_questions: core.store.questions().len(),
            answer: core.store.answer(&question.id).map(|e| e.value.clone()),
            flagged: core.store.is_flagged(&question.id),
            question,
            remaining_seconds: core.remaining(now),
            progress: core.store.progress(),
            connectivity,
            save,
        }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Record an answer for `question_id`.
    pub fn set_answer(&self, question_id: &str, value: AnswerValue) -> Result<(), SessionError> {
        let now = self.inner.time.now();
        let (checkpoint, event) = {
            let mut core = lock(&self.inner.core);
            core.ensure_mutable(now)?;
            let kind = core
                .store
                .question(question_id)
                .map(|q| q.kind)
                .ok_or_else(|| SessionError::UnknownQuestion(question_id.to_string()))?;
            core.store.set_answer(question_id, value, kind, now)?;
            (core.checkpoint(now), core.outbound(question_id, now))
        };
        self.inner.autosave.request_save(checkpoint);
        self.push_realtime(event);
        Ok(())
    }

    /// Flip the review flag of `question_id`. Returns the new state.
    pub fn toggle_flag(&self, question_id: &str) -> Result<bool, SessionError> {
        let now = self.inner.time.now();
        let (flagged, checkpoint, event) = {
            let mut core = lock(&self.inner.core);
            core.ensure_mutable(now)?;
            let flagged = core.store.toggle_flag(question_id, now)?;
            (flagged, core.checkpoint(now), core.outbound(question_id, now))
        };
        self.inner.autosave.request_save(checkpoint);
        self.push_realtime(event);
        Ok(flagged)
    }

    /// Flip the review flag of the current question.
    pub fn toggle_current_flag(&self) -> Result<(String, bool), SessionError> {
        let question_id = {
            let core = lock(&self.inner.core);
            core.store.questions()[core.current_index].id.clone()
        };
        let flagged = self.toggle_flag(&question_id)?;
        Ok((question_id, flagged))
    }

    pub fn next(&self) -> Result<bool, SessionError> {
        self.navigate(|current| current.checked_add(1))
    }

    pub fn previous(&self) -> Result<bool, SessionError> {
        self.navigate(|current| current.checked_sub(1))
    }

    /// Jump to `index`. Out-of-range indexes are ignored.
    pub fn go_to(&self, index: usize) -> Result<bool, SessionError> {
        self.navigate(|_| Some(index))
    }

    fn navigate(&self, target: impl FnOnce(usize) -> Option<usize>) -> Result<bool, SessionError> {
        let now = self.inner.time.now();
        let checkpoint = {
            let mut core = lock(&self.inner.core);
            core.ensure_mutable(now)?;
            let total = core.store.questions().len();
            let Some(index) = target(core.current_index).filter(|i| *i < total) else {
                return Ok(false);
            };
            if index == core.current_index {
                return Ok(false);
            }
            let id = core.store.questions()[index].id.clone();
            core.store.focus(&id, now)?;
            core.current_index = index;
            core.checkpoint(now)
        };
        self.inner.autosave.save_now(checkpoint);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// User asks to submit. Opens the confirmation if questions are unanswered,
    /// submits immediately otherwise.
    pub async fn request_submit(&self) -> Result<SubmitOutcome, SessionError> {
        let now = self.inner.time.now();
        let confirmation = {
            let mut core = lock(&self.inner.core);
            match core.phase {
                Phase::Submitting => return Ok(SubmitOutcome::AlreadyInFlight),
                Phase::Completed => return Ok(SubmitOutcome::AlreadyCompleted),
                Phase::Initializing | Phase::Closed => {
                    return Err(SessionError::NotActive { phase: core.phase })
                }
                Phase::Active => {}
            }
            let progress = core.store.progress();
            if core.remaining(now) == 0 || progress.unanswered() == 0 {
                None
            } else {
                core.confirming = true;
                Some((SubmitSummary::from(progress), core.checkpoint(now)))
            }
        };
        match confirmation {
            Some((summary, checkpoint)) => {
                self.inner.autosave.save_now(checkpoint);
                Ok(SubmitOutcome::NeedsConfirmation(summary))
            }
            None => self.submit(self.trigger_for_now()).await,
        }
    }

    /// Confirm the open submit dialog.
    pub async fn confirm_submit(&self) -> Result<SubmitOutcome, SessionError> {
        {
            let core = lock(&self.inner.core);
            if core.phase == Phase::Active && !core.confirming {
                return Ok(SubmitOutcome::NotRequested);
            }
        }
        self.submit(self.trigger_for_now()).await
    }

    /// Close the submit dialog. Returns whether it was open.
    pub fn cancel_submit(&self) -> bool {
        std::mem::take(&mut lock(&self.inner.core).confirming)
    }

    /// Time is up: submit without confirmation.
    pub async fn expire(&self) -> Result<SubmitOutcome, SessionError> {
        if self.phase() == Phase::Active {
            tracing::info!(attempt = %self.attempt().id, "time is up, submitting");
            self.inner.emit(SessionEvent::Expired);
        }
        self.submit(SubmitTrigger::Timeout).await
    }

    fn trigger_for_now(&self) -> SubmitTrigger {
        if self.remaining_seconds() == 0 {
            SubmitTrigger::Timeout
        } else {
            SubmitTrigger::User
        }
    }

    async fn submit(&self, trigger: SubmitTrigger) -> Result<SubmitOutcome, SessionError> {
        let now = self.inner.time.now();
        let (attempt_id, checkpoint, submission) = {
            let mut core = lock(&self.inner.core);
            match core.phase {
                Phase::Submitting => return Ok(SubmitOutcome::AlreadyInFlight),
                Phase::Completed => return Ok(SubmitOutcome::AlreadyCompleted),
                Phase::Initializing | Phase::Closed => {
                    return Err(SessionError::NotActive { phase: core.phase })
                }
                Phase::Active => {}
            }
            core.phase = Phase::Submitting;
            core.confirming = false;
            let capped = now.min(core.attempt.deadline());
            core.store.settle(capped);
            (
                core.attempt.id.clone(),
                core.checkpoint(now),
                handoff::build_submission(&core.store),
            )
        };

        // Any in-flight checkpoint lands before the submission, none after it.
        if let Err(e) = self.inner.autosave.flush_final(checkpoint).await {
            tracing::warn!(attempt = %attempt_id, "final checkpoint failed, submitting in-memory state: {e}");
        }

        match self.inner.api.submit_attempt(&attempt_id, &submission).await {
            Ok(response) => {
                let status = match trigger {
                    SubmitTrigger::User => AttemptStatus::Submitted,
                    SubmitTrigger::Timeout => AttemptStatus::Expired,
                };
                let submitted_at = self.inner.time.now();
                let payload = {
                    let mut core = lock(&self.inner.core);
                    core.store.freeze(status);
                    core.attempt.status = status;
                    core.phase = Phase::Completed;
                    let payload = Arc::new(handoff::finalize(
                        &core.attempt,
                        submission,
                        core.store.progress(),
                        response,
                        submitted_at,
                    ));
                    core.result = Some(Arc::clone(&payload));
                    payload
                };
                self.shutdown_components();
                tracing::info!(attempt = %attempt_id, %status, "attempt submitted");
                self.inner.emit(SessionEvent::Completed(Arc::clone(&payload)));
                handoff::deliver(Arc::clone(&payload), &self.inner.consumers);
                Ok(SubmitOutcome::Completed(payload))
            }
            Err(e) => {
                tracing::error!(attempt = %attempt_id, "submission failed: {e}");
                let checkpoint = {
                    let mut core = lock(&self.inner.core);
                    core.phase = Phase::Active;
                    core.checkpoint(self.inner.time.now())
                };
                self.inner.autosave.resume();
                if let Err(save) = self.inner.autosave.flush(checkpoint).await {
                    tracing::warn!(attempt = %attempt_id, "checkpoint after failed submission also failed: {save}");
                }
                self.inner.emit(SessionEvent::SubmitFailed {
                    message: e.to_string(),
                });
                Err(SessionError::Submission(e))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Input
    // -----------------------------------------------------------------------

    /// Run an action. Pointer handlers and keyboard shortcuts both land here.
    pub async fn dispatch(&self, action: SessionAction) -> Result<ActionOutcome, SessionError> {
        let navigated = |moved: bool| ActionOutcome::Navigated {
            index: self.current_index(),
            moved,
        };
        match action {
            SessionAction::Next => self.next().map(navigated),
            SessionAction::Previous => self.previous().map(navigated),
            SessionAction::JumpTo(index) => self.go_to(index).map(navigated),
            SessionAction::ToggleFlag => self
                .toggle_current_flag()
                .map(|(question_id, flagged)| ActionOutcome::Flagged {
                    question_id,
                    flagged,
                }),
            SessionAction::RequestSubmit => self.request_submit().await.map(ActionOutcome::Submit),
            SessionAction::ConfirmSubmit => self.confirm_submit().await.map(ActionOutcome::Submit),
            SessionAction::CancelSubmit => {
                self.cancel_submit();
                Ok(ActionOutcome::Cancelled)
            }
        }
    }

    /// Handle a global key press. Ignored unless the session is active.
    pub async fn handle_key(
        &self,
        key: Key,
        text_input_focused: bool,
    ) -> Result<Option<ActionOutcome>, SessionError> {
        let confirming = {
            let core = lock(&self.inner.core);
            if core.phase != Phase::Active {
                return Ok(None);
            }
            core.confirming
        };
        let ctx = KeyContext {
            text_input_focused,
            confirming,
        };
        match keyboard::action_for(key, ctx) {
            Some(action) => self.dispatch(action).await.map(Some),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Reconciliation and teardown
    // -----------------------------------------------------------------------

    /// Re-read the attempt record from the server.
    ///
    /// Picks up a changed time anchor (e.g. an extension) and closes the
    /// session if the server already finished the attempt.
    pub async fn refresh(&self) -> Result<AttemptStatus, ApiError> {
        let attempt_id = self.attempt().id;
        let record = self.inner.api.get_attempt(&attempt_id).await?;
        let status = record.attempt.status;

        let (closed, reanchored) = {
            let mut core = lock(&self.inner.core);
            if core.phase != Phase::Active {
                return Ok(status);
            }
            if status.is_terminal() {
                core.store.freeze(status);
                core.attempt.status = status;
                core.phase = Phase::Closed;
                core.confirming = false;
                (true, false)
            } else if record.attempt.started_at != core.attempt.started_at
                || record.attempt.duration_seconds != core.attempt.duration_seconds
            {
                core.attempt.started_at = record.attempt.started_at;
                core.attempt.duration_seconds = record.attempt.duration_seconds;
                (false, true)
            } else {
                (false, false)
            }
        };

        if closed {
            tracing::warn!(attempt = %attempt_id, %status, "attempt closed by the server");
            self.shutdown_components();
            self.inner.emit(SessionEvent::ClosedRemotely { status });
            return Ok(status);
        }
        if reanchored {
            tracing::info!(attempt = %attempt_id, "attempt time anchor changed on the server");
            self.start_timer();
        }
        self.inner.emit(SessionEvent::RemoteRefresh { status });
        Ok(status)
    }

    /// Leave the session (navigation away, window close).
    ///
    /// Flushes a final checkpoint if the session is still open, asks the
    /// server to clean up, and cancels every timer, retry and listener.
    pub async fn teardown(&self) {
        let now = self.inner.time.now();
        let pending = {
            let mut core = lock(&self.inner.core);
            match core.phase {
                Phase::Active | Phase::Initializing => {
                    let capped = now.min(core.attempt.deadline());
                    core.store.release_focus(capped);
                    core.phase = Phase::Closed;
                    core.confirming = false;
                    Some((core.attempt.id.clone(), core.checkpoint(now)))
                }
                _ => None,
            }
        };
        lock(&self.inner.timer).stop();
        if let Some(adapter) = lock(&self.inner.realtime).take() {
            adapter.close();
        }

        if let Some((attempt_id, checkpoint)) = pending {
            if let Err(e) = self.inner.autosave.flush(checkpoint).await {
                tracing::warn!(attempt = %attempt_id, "checkpoint on teardown failed: {e}");
            }
            match tokio::time::timeout(
                self.inner.config.cleanup_timeout,
                self.inner.api.cleanup(&attempt_id),
            )
            .await
            {
                Ok(Ok(())) => tracing::debug!(attempt = %attempt_id, "attempt cleaned up"),
                Ok(Err(e)) => tracing::warn!(attempt = %attempt_id, "cleanup failed: {e}"),
                Err(_) => tracing::warn!(attempt = %attempt_id, "cleanup timed out"),
            }
        }
        self.shutdown_components();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn push_realtime(&self, event: OutboundEvent) {
        if let Some(adapter) = lock(&self.inner.realtime).as_ref() {
            adapter.send(event);
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        lock(&self.inner.background).push(task);
    }

    fn start_timer(&self) {
        let (started_at, duration) = {
            let core = lock(&self.inner.core);
            (core.attempt.started_at, core.attempt.duration_seconds)
        };
        let on_tick = {
            let weak = Arc::downgrade(&self.inner);
            move |remaining| {
                if let Some(inner) = weak.upgrade() {
                    inner.emit(SessionEvent::Tick { remaining });
                }
            }
        };
        let on_expire = {
            let weak = Arc::downgrade(&self.inner);
            move || {
                tokio::spawn(async move {
                    if let Some(inner) = weak.upgrade() {
                        let controller = SessionController { inner };
                        if let Err(e) = controller.expire().await {
                            tracing::warn!("automatic submission did not complete: {e}");
                        }
                    }
                });
            }
        };
        lock(&self.inner.timer).start(started_at, duration, on_tick, on_expire);
    }

    fn forward_save_status(&self) {
        let mut reports = self.inner.autosave.subscribe();
        let weak = Arc::downgrade(&self.inner);
        self.track(tokio::spawn(async move {
            while reports.changed().await.is_ok() {
                let report = reports.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else { return };
                inner.emit(SessionEvent::SaveStatus(report));
            }
        }));
    }

    fn connect_realtime(&self, transport: Arc<dyn RealtimeTransport>) {
        let attempt_id = self.attempt().id;
        let on_message = {
            let weak = Arc::downgrade(&self.inner);
            move |message: crate::realtime::InboundMessage| {
                if !message.is_surfaced() {
                    tracing::debug!(kind = %message.kind, "ignoring realtime message");
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.emit(SessionEvent::Proctor(message));
                }
            }
        };
        let adapter = RealtimeAdapter::connect(
            transport,
            attempt_id,
            self.inner.config.reconnect.clone(),
            on_message,
        );
        let mut states = adapter.subscribe();
        *lock(&self.inner.realtime) = Some(adapter);

        let weak = Arc::downgrade(&self.inner);
        let every = self.inner.config.poll_interval;
        self.track(tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                match weak.upgrade() {
                    Some(inner) => inner.emit(SessionEvent::Connectivity(state.clone())),
                    None => return,
                }
                if state == ConnectionState::Failed {
                    poll_remote(weak, every).await;
                    return;
                }
            }
        }));
    }

    /// Stop everything that could still tick, retry or write.
    fn shutdown_components(&self) {
        lock(&self.inner.timer).stop();
        if let Some(adapter) = lock(&self.inner.realtime).as_ref() {
            adapter.close();
        }
        self.inner.autosave.dispose();
        for task in lock(&self.inner.background).drain(..) {
            task.abort();
        }
    }
}

/// Rebuild attempt, store and position from a server record.
fn resume_from(
    questions: Vec<Question>,
    record: AttemptRecord,
) -> Result<(Attempt, AnswerStore, usize), SessionError> {
    let status = record.attempt.status;
    if status.is_terminal() {
        tracing::error!(attempt = %record.attempt.id, %status, "cannot resume a finished attempt");
        return Err(SessionError::Terminal { status });
    }
    let index = record.current_index.min(questions.len().saturating_sub(1));
    let store = AnswerStore::restore(questions, &record);
    tracing::info!(attempt = %record.attempt.id, answered = store.progress().answered, "attempt resumed");
    Ok((record.attempt, store, index))
}

fn init_failed(e: ApiError) -> SessionError {
    tracing::error!("session initialization failed: {e}");
    SessionError::Initialization(e)
}

/// Periodic attempt refresh used in place of the realtime channel.
async fn poll_remote(weak: Weak<Inner>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { return };
        let controller = SessionController { inner };
        if controller.phase() != Phase::Active {
            return;
        }
        if let Err(e) = controller.refresh().await {
            tracing::warn!("attempt refresh failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use crate::mock::MockAttemptApi;
    use crate::model::QuestionKind;

    fn t0() -> DateTime<Utc> {
        "2026-03-01T09:00:00Z".parse().unwrap()
    }

    fn test_definition() -> TestDefinition {
        let q = |id: &str, kind: QuestionKind, options: &[&str]| Question {
            id: id.into(),
            kind,
            prompt: format!("prompt {id}"),
            options: options.iter().map(|o| o.to_string()).collect(),
        };
        TestDefinition {
            id: "t-1".into(),
            title: "Sample".into(),
            description: String::new(),
            duration_seconds: 600,
            questions: vec![
                q("q1", QuestionKind::SingleChoice, &["a", "b"]),
                q("q2", QuestionKind::Boolean, &[]),
                q("q3", QuestionKind::ShortText, &[]),
            ],
        }
    }

    fn api() -> Arc<MockAttemptApi> {
        Arc::new(MockAttemptApi::new().with_test(&test_definition()))
    }

    async fn started(api: Arc<MockAttemptApi>, clock: Arc<ManualTimeSource>) -> SessionController {
        SessionController::start(
            SessionConfig::default(),
            SessionDeps::new(api, clock),
            &test_definition(),
            StartMode::New {
                user_id: "u-1".into(),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_is_bounds_checked() {
        let api = api();
        let clock = Arc::new(ManualTimeSource::new(t0()));
        let session = started(api, clock).await;

        assert!(!session.previous().unwrap());
        assert!(session.next().unwrap());
        assert!(session.next().unwrap());
        assert!(!session.next().unwrap());
        assert_eq!(session.current_index(), 2);
        assert!(!session.go_to(17).unwrap());
        assert!(session.go_to(0).unwrap());
        assert_eq!(session.current_index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_flushes_a_checkpoint_immediately() {
        let api = api();
        let clock = Arc::new(ManualTimeSource::new(t0()));
        let session = started(api.clone(), clock).await;

        session.set_answer("q1", AnswerValue::Text("a".into())).unwrap();
        session.next().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(api.checkpoint_count(), 1);
        let (_, cp) = api.last_checkpoint().unwrap();
        assert_eq!(cp.current_index, 1);
        assert_eq!(cp.answers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keyboard_and_pointer_share_one_path() {
        let api = api();
        let clock = Arc::new(ManualTimeSource::new(t0()));
        let session = started(api, clock).await;

        session.handle_key(Key::Char('3'), false).await.unwrap();
        assert_eq!(session.current_index(), 2);
        session.handle_key(Key::ArrowLeft, false).await.unwrap();
        assert_eq!(session.current_index(), 1);
        let outcome = session.handle_key(Key::Char('f'), false).await.unwrap();
        assert!(matches!(
            outcome,
            Some(ActionOutcome::Flagged { ref question_id, flagged: true }) if question_id == "q2"
        ));
        // Typing in a text field never navigates.
        assert!(session.handle_key(Key::Char('n'), true).await.unwrap().is_none());
        assert_eq!(session.current_index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_closes_the_confirmation() {
        let api = api();
        let clock = Arc::new(ManualTimeSource::new(t0()));
        let session = started(api.clone(), clock).await;

        let outcome = session.request_submit().await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::NeedsConfirmation(s) if s.unanswered == 3));
        assert!(session.snapshot().confirming);
        assert!(session.cancel_submit());
        assert!(!session.snapshot().confirming);
        assert!(matches!(
            session.confirm_submit().await.unwrap(),
            SubmitOutcome::NotRequested
        ));
        assert_eq!(api.submit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_after_expiry_are_refused() {
        let api = api();
        api.set_submit_failure(true);
        let clock = Arc::new(ManualTimeSource::new(t0()));
        let session = started(api.clone(), clock.clone()).await;

        clock.advance(Duration::from_secs(601));
        tokio::time::sleep(Duration::from_secs(2)).await;

        // The automatic submission failed, so the session is active again,
        // but time is up.
        assert_eq!(session.phase(), Phase::Active);
        assert!(matches!(
            session.set_answer("q2", AnswerValue::Flag(true)),
            Err(SessionError::Expired)
        ));
        assert!(matches!(session.next(), Err(SessionError::Expired)));

        api.set_submit_failure(false);
        let outcome = session.request_submit().await.unwrap();
        let SubmitOutcome::Completed(payload) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(payload.status, AttemptStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn initialization_failure_is_blocking() {
        let api = api();
        api.set_create_failure(true);
        let clock = Arc::new(ManualTimeSource::new(t0()));
        let err = SessionController::start(
            SessionConfig::default(),
            SessionDeps::new(api, clock),
            &test_definition(),
            StartMode::New {
                user_id: "u-1".into(),
            },
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, SessionError::Initialization(_)));
        assert!(err.is_blocking());
    }
}
