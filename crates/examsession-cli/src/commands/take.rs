//! The `examsession take` command.
//!
//! Reads one command per line from stdin. Single-key lines go through the
//! same shortcut map a graphical client uses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use examsession_api::load_config_from;
use examsession_core::autosave::SaveStatus;
use examsession_core::clock::SystemTimeSource;
use examsession_core::controller::{ActionOutcome, Phase, SessionEvent, SubmitOutcome};
use examsession_core::keyboard::Key;
use examsession_core::mock::MockAttemptApi;
use examsession_core::model::{AnswerValue, Question, QuestionKind, TestDefinition};
use examsession_core::parser;
use examsession_core::traits::AttemptApi;
use examsession_core::{SessionController, SessionDeps, SessionError, StartMode};

use super::summary;

pub struct TakeArgs {
    pub test: String,
    pub resume: Option<String>,
    pub user: Option<String>,
    pub offline: bool,
    pub output: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

enum Flow {
    Continue,
    Quit,
}

pub async fn execute(args: TakeArgs) -> Result<()> {
    let config = load_config_from(args.config.as_deref())?;
    let test = resolve_test(&args.test, &config.tests_dir)?;
    for w in parser::validate_test_definition(&test) {
        tracing::warn!("{}: {}", w.question_id.as_deref().unwrap_or(&test.id), w.message);
    }

    let api: Arc<dyn AttemptApi> = if args.offline {
        Arc::new(MockAttemptApi::new().with_test(&test))
    } else {
        Arc::new(config.create_api()?)
    };
    let mode = match args.resume {
        Some(attempt_id) => StartMode::Resume { attempt_id },
        None => StartMode::New {
            user_id: args
                .user
                .or_else(|| config.user_id.clone())
                .unwrap_or_else(|| format!("guest-{}", Uuid::new_v4())),
        },
    };

    let session = SessionController::start(
        config.to_session_config(),
        SessionDeps::new(api, Arc::new(SystemTimeSource)),
        &test,
        mode,
    )
    .await
    .context("could not start the session")?;

    println!("{} ({} questions)", test.title, session.questions().len());
    println!("Type ? for help.");
    print_question(&session);

    let printer = tokio::spawn(print_events(session.subscribe()));
    let mut events = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match handle_line(&session, line.trim()).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(e) if e.is_blocking() => println!("Error: {e}"),
                    Err(e) => println!("{e}"),
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Completed(_) | SessionEvent::ClosedRemotely { .. })
                | Err(RecvError::Closed) => break,
                _ => {}
            },
        }
        if matches!(session.phase(), Phase::Completed | Phase::Closed) {
            break;
        }
    }

    match session.result() {
        Some(payload) => {
            println!("\n{}", summary::render(&payload));
            let dir = args.output.unwrap_or(config.results_dir);
            let path = dir.join(format!("{}.json", payload.attempt_id));
            payload.save_json(&path)?;
            println!("Result saved to {}", path.display());
        }
        None => {
            session.teardown().await;
            let attempt = session.attempt();
            if attempt.status.is_terminal() {
                println!("Attempt {} was closed on the server ({}).", attempt.id, attempt.status);
            } else {
                println!(
                    "Progress saved. Resume with: examsession take --test {} --resume {}",
                    args.test, attempt.id
                );
            }
        }
    }
    printer.abort();
    Ok(())
}

/// A test definition file, or a test id looked up in `tests_dir`.
fn resolve_test(reference: &str, tests_dir: &Path) -> Result<TestDefinition> {
    let path = Path::new(reference);
    if path.is_file() {
        return parser::parse_test_definition(path);
    }
    let tests = parser::load_test_directory(tests_dir)
        .with_context(|| format!("test '{reference}' is not a file and the tests directory could not be read"))?;
    tests
        .into_iter()
        .find(|t| t.id == reference)
        .with_context(|| format!("test '{reference}' not found in {}", tests_dir.display()))
}

async fn handle_line(session: &SessionController, line: &str) -> Result<Flow, SessionError> {
    match line {
        "" => {
            print_question(session);
            return Ok(Flow::Continue);
        }
        "?" | "help" => {
            print_help();
            return Ok(Flow::Continue);
        }
        "quit" | "exit" => return Ok(Flow::Quit),
        "clear" => {
            let question = session.snapshot().question;
            let empty = match question.kind {
                QuestionKind::MultiSelect => AnswerValue::Choices(Vec::new()),
                _ => AnswerValue::Text(String::new()),
            };
            session.set_answer(&question.id, empty)?;
            println!("Cleared.");
            return Ok(Flow::Continue);
        }
        _ => {}
    }

    if let Some(raw) = line.strip_prefix("a ") {
        let question = session.snapshot().question;
        let value = parse_answer(&question, raw.trim())?;
        session.set_answer(&question.id, value)?;
        match session.snapshot().answer {
            Some(answer) => println!("Answer: {answer}"),
            None => println!("Answer cleared."),
        }
        return Ok(Flow::Continue);
    }

    let key = match line {
        "y" => Key::Enter,
        "c" | "esc" => Key::Escape,
        "<" => Key::ArrowLeft,
        ">" => Key::ArrowRight,
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Key::Char(c),
                _ => {
                    println!("Unknown command '{other}'. Type ? for help.");
                    return Ok(Flow::Continue);
                }
            }
        }
    };

    match session.handle_key(key, false).await? {
        Some(outcome) => report(session, outcome),
        None => println!("Nothing to do for '{line}'."),
    }
    Ok(Flow::Continue)
}

/// Interpret typed text for `question`. Choice questions accept option
/// numbers as well as option text.
fn parse_answer(question: &Question, raw: &str) -> Result<AnswerValue, SessionError> {
    let option = |s: &str| -> String {
        s.parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| question.options.get(i))
            .cloned()
            .unwrap_or_else(|| s.to_string())
    };
    Ok(match question.kind {
        QuestionKind::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" => AnswerValue::Flag(true),
            "false" | "f" | "no" | "n" => AnswerValue::Flag(false),
            _ => {
                return Err(SessionError::InvalidAnswer {
                    question_id: question.id.clone(),
                    reason: format!("'{raw}' is not true or false"),
                })
            }
        },
        QuestionKind::SingleChoice => AnswerValue::Text(option(raw)),
        QuestionKind::MultiSelect if raw.contains(',') => AnswerValue::Choices(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(option)
                .collect(),
        ),
        QuestionKind::MultiSelect => AnswerValue::Text(option(raw)),
        QuestionKind::ShortText | QuestionKind::LongText => AnswerValue::Text(raw.to_string()),
    })
}

fn report(session: &SessionController, outcome: ActionOutcome) {
    match outcome {
        ActionOutcome::Navigated { moved: true, .. } => print_question(session),
        ActionOutcome::Navigated { moved: false, .. } => println!("No question there."),
        ActionOutcome::Flagged {
            question_id,
            flagged,
        } => println!(
            "{} {question_id}",
            if flagged { "Flagged" } else { "Unflagged" }
        ),
        ActionOutcome::Submit(SubmitOutcome::NeedsConfirmation(s)) => println!(
            "{} answered, {} unanswered, {} flagged. Submit anyway? [y]es / [c]ancel",
            s.answered, s.unanswered, s.flagged
        ),
        ActionOutcome::Submit(SubmitOutcome::Completed(_)) => println!("Submitted."),
        ActionOutcome::Submit(SubmitOutcome::AlreadyInFlight) => {
            println!("Submission already in progress.")
        }
        ActionOutcome::Submit(SubmitOutcome::AlreadyCompleted) => println!("Already submitted."),
        ActionOutcome::Submit(SubmitOutcome::NotRequested) => println!("Press s to submit first."),
        ActionOutcome::Cancelled => println!("Submission cancelled."),
    }
}

fn print_question(session: &SessionController) {
    let s = session.snapshot();
    println!(
        "\n[{}/{}] {}{}  ({} left, {}/{} answered)",
        s.current_index + 1,
        s.total_questions,
        s.question.prompt,
        if s.flagged { "  [flagged]" } else { "" },
        clock(s.remaining_seconds),
        s.progress.answered,
        s.progress.total,
    );
    for (i, option) in s.question.options.iter().enumerate() {
        println!("  {}) {option}", i + 1);
    }
    if let Some(answer) = s.answer {
        println!("  Current answer: {answer}");
    }
}

fn print_help() {
    println!("  a <value>   answer the current question (option numbers work too;");
    println!("              comma-separate several options)");
    println!("  clear       clear the current answer");
    println!("  n / p       next / previous question (also > and <)");
    println!("  1-9         jump to a question");
    println!("  f           flag the current question for review");
    println!("  s           submit (y to confirm, c to cancel)");
    println!("  quit        leave; progress is saved and can be resumed");
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        };
        match event {
            SessionEvent::Tick { remaining } if remaining > 0 && (remaining % 300 == 0 || remaining <= 10) => {
                eprintln!("[{} left]", clock(remaining))
            }
            SessionEvent::Expired => eprintln!("[time is up, submitting]"),
            SessionEvent::SaveStatus(report) => match report.status {
                SaveStatus::Saved { .. } => eprintln!("[saved]"),
                SaveStatus::Unsaved => eprintln!("[not saved; will retry with the next change]"),
                _ => {}
            },
            SessionEvent::Connectivity(state) => eprintln!("[realtime {state}]"),
            SessionEvent::Proctor(message) => eprintln!(
                "[{} {}] {}",
                message.kind,
                message.sender.as_deref().unwrap_or("unknown"),
                message.payload
            ),
            SessionEvent::SubmitFailed { message } => {
                eprintln!("[submission failed: {message}; press s to retry]")
            }
            SessionEvent::ClosedRemotely { status } => eprintln!("[attempt {status} on the server]"),
            _ => {}
        }
    }
}

fn clock(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}
