//! Session scenarios run end to end against the in-memory attempt API.
//!
//! Wall-clock time comes from a `ManualTimeSource`; timers run on tokio's
//! paused clock, so every scenario is deterministic.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use examsession_core::autosave::SaveStatus;
use examsession_core::clock::ManualTimeSource;
use examsession_core::controller::{Connectivity, Phase, SessionEvent, SubmitOutcome};
use examsession_core::mock::{MockAttemptApi, MockTransport, RecordingConsumer};
use examsession_core::model::{
    AnswerEntry, AnswerValue, Attempt, AttemptRecord, AttemptStatus, Question, QuestionKind,
    TestDefinition,
};
use examsession_core::realtime::{ConnectionState, ReconnectPolicy};
use examsession_core::{SessionConfig, SessionController, SessionDeps, SessionError, StartMode};
use tokio::sync::broadcast;

fn t0() -> DateTime<Utc> {
    "2026-03-01T09:00:00Z".parse().unwrap()
}

fn question(id: &str, kind: QuestionKind, options: &[&str]) -> Question {
    Question {
        id: id.into(),
        kind,
        prompt: format!("prompt for {id}"),
        options: options.iter().map(|o| o.to_string()).collect(),
    }
}

/// 30 minutes, five questions of mixed types.
fn five_question_test() -> TestDefinition {
    TestDefinition {
        id: "algebra-1".into(),
        title: "Algebra I".into(),
        description: String::new(),
        duration_seconds: 1800,
        questions: vec![
            question("q1", QuestionKind::SingleChoice, &["2", "3", "4"]),
            question("q2", QuestionKind::MultiSelect, &["x", "y", "z"]),
            question("q3", QuestionKind::Boolean, &[]),
            question("q4", QuestionKind::ShortText, &[]),
            question("q5", QuestionKind::LongText, &[]),
        ],
    }
}

struct Harness {
    api: Arc<MockAttemptApi>,
    clock: Arc<ManualTimeSource>,
    test: TestDefinition,
}

impl Harness {
    fn new() -> Self {
        let test = five_question_test();
        Self {
            api: Arc::new(MockAttemptApi::new().with_test(&test)),
            clock: Arc::new(ManualTimeSource::new(t0())),
            test,
        }
    }

    fn deps(&self) -> SessionDeps {
        SessionDeps::new(self.api.clone(), self.clock.clone())
    }

    async fn start(&self) -> SessionController {
        self.start_with(SessionConfig::default(), self.deps()).await
    }

    async fn start_with(&self, config: SessionConfig, deps: SessionDeps) -> SessionController {
        SessionController::start(
            config,
            deps,
            &self.test,
            StartMode::New {
                user_id: "student-1".into(),
            },
        )
        .await
        .unwrap()
    }

    async fn resume(&self, attempt_id: &str) -> Result<SessionController, SessionError> {
        SessionController::start(
            SessionConfig::default(),
            self.deps(),
            &self.test,
            StartMode::Resume {
                attempt_id: attempt_id.into(),
            },
        )
        .await
    }
}

fn text(s: &str) -> AnswerValue {
    AnswerValue::Text(s.into())
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// --- Confirmation and submission ---

#[tokio::test(start_paused = true)]
async fn confirmation_reports_unanswered_and_flagged() {
    let h = Harness::new();
    let session = h.start().await;

    session.set_answer("q1", text("4")).unwrap();
    session.set_answer("q3", AnswerValue::Flag(false)).unwrap();
    session.set_answer("q4", text("x = 2")).unwrap();
    session.toggle_flag("q5").unwrap();

    let outcome = session.request_submit().await.unwrap();
    let SubmitOutcome::NeedsConfirmation(summary) = outcome else {
        panic!("expected a confirmation, got {outcome:?}");
    };
    assert_eq!(summary.answered, 3);
    assert_eq!(summary.unanswered, 2);
    assert_eq!(summary.flagged, 1);
    assert_eq!(h.api.submit_count(), 0);

    let outcome = session.confirm_submit().await.unwrap();
    let SubmitOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(result.status, AttemptStatus::Submitted);
    assert_eq!(result.answers.len(), 3);
    assert_eq!(session.phase(), Phase::Completed);
    assert_eq!(h.api.submit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn fully_answered_test_submits_without_confirmation() {
    let h = Harness::new();
    let session = h.start().await;
    session.set_answer("q1", text("4")).unwrap();
    session
        .set_answer("q2", AnswerValue::Choices(vec!["x".into(), "z".into()]))
        .unwrap();
    session.set_answer("q3", AnswerValue::Flag(true)).unwrap();
    session.set_answer("q4", text("two")).unwrap();
    session.set_answer("q5", text("because")).unwrap();

    let outcome = session.request_submit().await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Completed(_)));
}

#[tokio::test(start_paused = true)]
async fn double_submit_reaches_the_server_once() {
    let h = Harness::new();
    h.api.set_submit_delay(Some(Duration::from_millis(500)));
    let session = h.start().await;
    session.request_submit().await.unwrap();

    let (first, second) = tokio::join!(session.confirm_submit(), session.confirm_submit());
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(h.api.submit_count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, SubmitOutcome::Completed(_)))
            .count(),
        1
    );
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, SubmitOutcome::AlreadyInFlight)));

    // Later requests see the finished session.
    assert!(matches!(
        session.request_submit().await.unwrap(),
        SubmitOutcome::AlreadyCompleted
    ));
    assert_eq!(h.api.submit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn timer_and_manual_submit_race_yields_one_submission() {
    let h = Harness::new();
    h.api.set_submit_delay(Some(Duration::from_millis(300)));
    let session = h.start().await;
    let mut events = session.subscribe();
    session.set_answer("q1", text("3")).unwrap();

    h.clock.advance(Duration::from_secs(1801));
    let manual = session.request_submit().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(matches!(
        manual,
        SubmitOutcome::Completed(_) | SubmitOutcome::AlreadyInFlight
    ));
    assert_eq!(h.api.submit_count(), 1);
    assert_eq!(session.phase(), Phase::Completed);
    assert_eq!(session.result().unwrap().status, AttemptStatus::Expired);

    let completed = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Completed(_)))
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_submits_without_confirmation() {
    let h = Harness::new();
    let session = h.start().await;
    let mut events = session.subscribe();
    session.set_answer("q1", text("2")).unwrap();

    h.clock.advance(Duration::from_secs(1800));
    tokio::time::sleep(Duration::from_secs(2)).await;

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Expired)));
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Tick { remaining: 0 })));
    assert_eq!(h.api.submit_count(), 1);
    let (_, submission) = h.api.last_submission().unwrap();
    assert_eq!(submission.final_answers.len(), 1);
    assert!(matches!(
        session.set_answer("q2", text("x")),
        Err(SessionError::Terminal {
            status: AttemptStatus::Expired
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_submission_keeps_answers_and_can_be_retried() {
    let h = Harness::new();
    h.api.set_submit_failure(true);
    let session = h.start().await;
    let mut events = session.subscribe();
    session.set_answer("q1", text("4")).unwrap();
    session.request_submit().await.unwrap();

    let err = session.confirm_submit().await.unwrap_err();
    assert!(matches!(err, SessionError::Submission(_)));
    assert!(err.is_blocking());
    assert_eq!(session.phase(), Phase::Active);
    assert_eq!(session.progress().answered, 1);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::SubmitFailed { .. })));

    // Still editable after the failure.
    session.set_answer("q4", text("late")).unwrap();

    h.api.set_submit_failure(false);
    session.request_submit().await.unwrap();
    let outcome = session.confirm_submit().await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Completed(_)));
    let (_, submission) = h.api.last_submission().unwrap();
    assert_eq!(submission.final_answers.len(), 2);
    assert_eq!(h.api.submit_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn results_reach_every_consumer() {
    let h = Harness::new();
    let analytics = Arc::new(RecordingConsumer::new("analytics"));
    let broken = Arc::new(RecordingConsumer::failing("insights"));
    let deps = h
        .deps()
        .with_consumer(analytics.clone())
        .with_consumer(broken.clone());
    let session = h.start_with(SessionConfig::default(), deps).await;
    session.set_answer("q3", AnswerValue::Flag(true)).unwrap();
    session.request_submit().await.unwrap();
    session.confirm_submit().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(analytics.received().len(), 1);
    assert_eq!(broken.received().len(), 1);
    let payload = &analytics.received()[0];
    assert_eq!(payload.user_id, "student-1");
    assert_eq!(payload.server.attempt_id, payload.attempt_id);
    assert_eq!(payload.progress.answered, 1);
}

// --- Clock ---

#[tokio::test(start_paused = true)]
async fn backgrounded_session_catches_up_on_the_next_tick() {
    let h = Harness::new();
    let session = h.start().await;
    let mut events = session.subscribe();

    // The device sleeps for 400 seconds; no tick runs meanwhile.
    h.clock.advance(Duration::from_secs(400));
    assert_eq!(session.remaining_seconds(), 1400);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let last_tick = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Tick { remaining } => Some(remaining),
            _ => None,
        })
        .last();
    assert_eq!(last_tick, Some(1400));
    assert_eq!(session.phase(), Phase::Active);
}

// --- Autosave ---

#[tokio::test(start_paused = true)]
async fn rapid_edits_coalesce_into_one_checkpoint() {
    let h = Harness::new();
    let session = h.start().await;

    for draft in ["x", "x =", "x = 2"] {
        session.set_answer("q4", text(draft)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(h.api.checkpoint_count(), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.api.checkpoint_count(), 1);
    let (_, checkpoint) = h.api.last_checkpoint().unwrap();
    assert_eq!(checkpoint.answers[0].value, text("x = 2"));
    assert!(matches!(session.save_report().status, SaveStatus::Saved { .. }));
}

#[tokio::test(start_paused = true)]
async fn failed_checkpoint_recovers_on_the_next_change() {
    let h = Harness::new();
    h.api.set_checkpoint_failure(true);
    let session = h.start().await;

    session.set_answer("q1", text("4")).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    let report = session.save_report();
    assert_eq!(report.status, SaveStatus::Unsaved);
    assert_eq!(report.writes_failed, 1);
    // The failure never reaches the user as an error.
    assert_eq!(session.phase(), Phase::Active);

    h.api.set_checkpoint_failure(false);
    session.set_answer("q4", text("four")).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let (_, checkpoint) = h.api.last_checkpoint().unwrap();
    assert_eq!(checkpoint.answers.len(), 2);
    assert!(matches!(session.save_report().status, SaveStatus::Saved { .. }));
}

#[tokio::test(start_paused = true)]
async fn checkpoints_land_in_request_order() {
    let h = Harness::new();
    h.api.set_checkpoint_delay(Some(Duration::from_millis(400)));
    let session = h.start().await;

    session.set_answer("q1", text("2")).unwrap();
    session.next().unwrap();
    session.set_answer("q2", text("y")).unwrap();
    session.next().unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let indexes: Vec<_> = h
        .api
        .checkpoints()
        .into_iter()
        .map(|(_, cp)| cp.current_index)
        .collect();
    assert!(!indexes.is_empty());
    assert!(indexes.windows(2).all(|w| w[0] <= w[1]));
    let (_, last) = h.api.last_checkpoint().unwrap();
    assert_eq!(last.current_index, 2);
    assert_eq!(last.answers.len(), 2);
}

// --- Answers ---

#[tokio::test(start_paused = true)]
async fn answered_count_tracks_non_empty_answers() {
    let h = Harness::new();
    let session = h.start().await;
    let steps: [(&str, AnswerValue); 8] = [
        ("q1", text("2")),
        ("q4", text("abc")),
        ("q1", text("3")),
        ("q4", text("")),
        ("q2", text("x")),
        ("q2", text("x")),
        ("q3", AnswerValue::Flag(false)),
        ("q5", text("essay")),
    ];
    let expected = [1, 2, 2, 1, 2, 1, 2, 3];

    for ((id, value), want) in steps.into_iter().zip(expected) {
        session.set_answer(id, value).unwrap();
        let progress = session.progress();
        assert_eq!(progress.answered, want, "after answering {id}");
        assert_eq!(progress.total, 5);
        let snapshot_answered = session.snapshot().progress.answered;
        assert_eq!(snapshot_answered, want);
    }
}

#[tokio::test(start_paused = true)]
async fn invalid_answers_are_rejected() {
    let h = Harness::new();
    let session = h.start().await;

    assert!(matches!(
        session.set_answer("q1", text("7")),
        Err(SessionError::InvalidAnswer { .. })
    ));
    assert!(matches!(
        session.set_answer("q3", text("yes")),
        Err(SessionError::InvalidAnswer { .. })
    ));
    assert!(matches!(
        session.set_answer("nope", text("x")),
        Err(SessionError::UnknownQuestion(_))
    ));
    assert_eq!(session.progress().answered, 0);
}

// --- Resume ---

#[tokio::test(start_paused = true)]
async fn resume_restores_state_and_keeps_the_clock() {
    let h = Harness::new();
    let first = h.start().await;
    let attempt_id = first.attempt().id;

    first.set_answer("q1", text("4")).unwrap();
    first.next().unwrap();
    first.toggle_flag("q2").unwrap();
    h.clock.advance(Duration::from_secs(100));
    first.teardown().await;
    assert_eq!(first.phase(), Phase::Closed);
    assert_eq!(h.api.cleanup_count(), 1);

    for _ in 0..2 {
        let resumed = h.resume(&attempt_id).await.unwrap();
        let snapshot = resumed.snapshot();
        assert_eq!(snapshot.attempt_id, attempt_id);
        assert_eq!(snapshot.current_index, 1);
        assert_eq!(snapshot.progress.answered, 1);
        assert!(snapshot.flagged);
        assert_eq!(snapshot.remaining_seconds, 1700);
        assert_eq!(resumed.time_spent().get("q2"), Some(&100));
        resumed.teardown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn starting_again_reuses_the_open_attempt() {
    let h = Harness::new();
    let first = h.start().await;
    first.set_answer("q1", text("4")).unwrap();
    first.toggle_flag("q3").unwrap();
    first.next().unwrap();
    first.teardown().await;

    h.clock.advance(Duration::from_secs(60));
    let second = h.start().await;
    let attempt_id = second.attempt().id;
    assert_eq!(attempt_id, first.attempt().id);
    assert_eq!(second.remaining_seconds(), 1740);

    let snapshot = second.snapshot();
    assert_eq!(snapshot.current_index, 1);
    assert_eq!(snapshot.progress.answered, 1);
    assert_eq!(snapshot.progress.flagged, 1);

    // The next checkpoint carries the earlier work instead of replacing it.
    second.next().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let record = h.api.attempt(&attempt_id).unwrap();
    assert_eq!(record.answers.len(), 1);
    assert_eq!(record.answers[0].value, text("4"));
    assert_eq!(record.flags.get("q3"), Some(&true));
    assert_eq!(record.current_index, 2);
}

#[tokio::test(start_paused = true)]
async fn reused_attempt_keeps_the_server_duration() {
    let h = Harness::new();
    let first = h.start().await;
    let attempt_id = first.attempt().id;
    first.teardown().await;
    h.api.update_attempt(&attempt_id, |a| a.duration_seconds = 2400);

    h.clock.advance(Duration::from_secs(100));
    let second = h.start().await;
    assert_eq!(second.attempt().duration_seconds, 2400);
    assert_eq!(second.remaining_seconds(), 2300);
}

#[tokio::test(start_paused = true)]
async fn resuming_past_the_deadline_submits_as_expired() {
    let test = five_question_test();
    let started_at = t0() - chrono::Duration::seconds(1800 + 10);
    let record = AttemptRecord {
        attempt: Attempt {
            id: "attempt-late".into(),
            test_id: test.id.clone(),
            user_id: "student-1".into(),
            started_at,
            duration_seconds: 1800,
            status: AttemptStatus::InProgress,
        },
        answers: vec![AnswerEntry {
            question_id: "q1".into(),
            value: text("3"),
            last_modified_at: started_at + chrono::Duration::seconds(30),
        }],
        flags: Default::default(),
        time_spent: Default::default(),
        current_index: 0,
    };
    let h = Harness {
        api: Arc::new(MockAttemptApi::new().with_test(&test).with_attempt(record)),
        clock: Arc::new(ManualTimeSource::new(t0())),
        test,
    };

    let session = h.resume("attempt-late").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.api.submit_count(), 1);
    assert_eq!(session.phase(), Phase::Completed);
    let result = session.result().unwrap();
    assert_eq!(result.status, AttemptStatus::Expired);
    assert_eq!(result.answers.len(), 1);
    assert!(matches!(
        session.request_submit().await.unwrap(),
        SubmitOutcome::AlreadyCompleted
    ));
    assert_eq!(h.api.submit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_question_ids_block_the_start() {
    let mut test = five_question_test();
    test.questions[4].id = "q1".into();
    let api = Arc::new(MockAttemptApi::new().with_test(&test));
    let err = SessionController::start(
        SessionConfig::default(),
        SessionDeps::new(api.clone(), Arc::new(ManualTimeSource::new(t0()))),
        &test,
        StartMode::New {
            user_id: "student-1".into(),
        },
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, SessionError::InvalidTest { ref reason, .. } if reason.contains("q1")));
    assert!(err.is_blocking());
    assert!(api.attempt("attempt-1").is_none());
}

#[tokio::test(start_paused = true)]
async fn finished_attempt_cannot_be_resumed() {
    let h = Harness::new();
    let session = h.start().await;
    let attempt_id = session.attempt().id;
    session.set_answer("q3", AnswerValue::Flag(true)).unwrap();
    session.request_submit().await.unwrap();
    session.confirm_submit().await.unwrap();

    let err = h.resume(&attempt_id).await.err().unwrap();
    assert!(matches!(
        err,
        SessionError::Terminal {
            status: AttemptStatus::Submitted
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn questions_are_fetched_when_not_embedded() {
    let full = five_question_test();
    let api = Arc::new(MockAttemptApi::new().with_test(&full));
    let bare = TestDefinition {
        questions: vec![],
        ..full
    };
    let session = SessionController::start(
        SessionConfig::default(),
        SessionDeps::new(api, Arc::new(ManualTimeSource::new(t0()))),
        &bare,
        StartMode::New {
            user_id: "student-1".into(),
        },
    )
    .await
    .unwrap();
    assert_eq!(session.questions().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn missing_questions_block_the_start() {
    let empty = TestDefinition {
        id: "empty".into(),
        title: "Empty".into(),
        description: String::new(),
        duration_seconds: 60,
        questions: vec![],
    };
    let api = Arc::new(MockAttemptApi::new().with_questions("empty", vec![]));
    let err = SessionController::start(
        SessionConfig::default(),
        SessionDeps::new(api, Arc::new(ManualTimeSource::new(t0()))),
        &empty,
        StartMode::New {
            user_id: "student-1".into(),
        },
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, SessionError::NoQuestions(_)));
}

// --- Realtime and reconciliation ---

fn fast_reconnect() -> SessionConfig {
    SessionConfig {
        reconnect: ReconnectPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(200),
            buffer: 8,
        },
        ..SessionConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn realtime_outage_does_not_affect_saving() {
    let h = Harness::new();
    let transport = Arc::new(MockTransport::failing());
    let session = h
        .start_with(fast_reconnect(), h.deps().with_realtime(transport.clone()))
        .await;
    let mut events = session.subscribe();

    session.set_answer("q1", text("4")).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(h.api.checkpoint_count(), 1);
    assert_eq!(transport.connect_count(), 3);
    assert_eq!(session.connectivity(), Connectivity::Disconnected);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Connectivity(ConnectionState::Failed))));
    assert!(transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connected_session_pushes_answer_events_and_surfaces_proctor_messages() {
    let h = Harness::new();
    let transport = Arc::new(MockTransport::new());
    let session = h
        .start_with(fast_reconnect(), h.deps().with_realtime(transport.clone()))
        .await;
    let mut events = session.subscribe();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.connectivity(), Connectivity::Connected);

    session.set_answer("q1", text("4")).unwrap();
    session.toggle_flag("q1").unwrap();
    transport.push_inbound(examsession_core::realtime::InboundMessage {
        kind: "proctor".into(),
        sender: Some("proctor-2".into()),
        payload: serde_json::json!({"text": "10 minutes left"}),
    });
    transport.push_inbound(examsession_core::realtime::InboundMessage {
        kind: "heartbeat".into(),
        sender: None,
        payload: serde_json::Value::Null,
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].question_id, "q1");
    assert_eq!(sent[0].answer_snapshot, Some(text("4")));
    let proctor: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Proctor(m) => Some(m),
            _ => None,
        })
        .collect();
    assert_eq!(proctor.len(), 1);
    assert_eq!(proctor[0].sender.as_deref(), Some("proctor-2"));
}

#[tokio::test(start_paused = true)]
async fn polling_picks_up_a_time_extension() {
    let h = Harness::new();
    let session = h.start().await;
    let attempt_id = session.attempt().id;
    h.clock.advance(Duration::from_secs(100));

    h.api
        .update_attempt(&attempt_id, |a| a.duration_seconds += 600);
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(session.remaining_seconds(), 2300);
    assert_eq!(session.phase(), Phase::Active);
}

#[tokio::test(start_paused = true)]
async fn remote_closure_freezes_the_session() {
    let h = Harness::new();
    let session = h.start().await;
    let mut events = session.subscribe();
    let attempt_id = session.attempt().id;

    h.api
        .update_attempt(&attempt_id, |a| a.status = AttemptStatus::Expired);
    let status = session.refresh().await.unwrap();

    assert_eq!(status, AttemptStatus::Expired);
    assert_eq!(session.phase(), Phase::Closed);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        SessionEvent::ClosedRemotely {
            status: AttemptStatus::Expired
        }
    )));
    assert!(matches!(
        session.set_answer("q1", text("2")),
        Err(SessionError::Terminal { .. })
    ));
    assert_eq!(h.api.submit_count(), 0);
}

// --- Teardown ---

#[tokio::test(start_paused = true)]
async fn teardown_flushes_and_stops_everything() {
    let h = Harness::new();
    let session = h.start().await;
    session.set_answer("q5", text("draft")).unwrap();
    session.teardown().await;

    assert_eq!(h.api.checkpoint_count(), 1);
    assert_eq!(h.api.cleanup_count(), 1);

    let mut events = session.subscribe();
    h.clock.advance(Duration::from_secs(1800));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(drain(&mut events).is_empty());
    assert_eq!(h.api.submit_count(), 0);
    assert_eq!(h.api.checkpoint_count(), 1);
}
