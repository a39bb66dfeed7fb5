//! Core data model types for examsession.
//!
//! Attempts, questions and answers as they travel between the engine and the
//! attempt API. Wire shapes are plain serde structs; identifiers are the
//! server's opaque strings.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an attempt as recorded by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Submitted,
    Expired,
}

impl AttemptStatus {
    /// Submitted and expired attempts accept no further writes.
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptStatus::InProgress)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptStatus::InProgress => write!(f, "in_progress"),
            AttemptStatus::Submitted => write!(f, "submitted"),
            AttemptStatus::Expired => write!(f, "expired"),
        }
    }
}

/// One user's instance of taking a test.
///
/// `started_at` is issued by the server and is the only time anchor the
/// engine trusts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: String,
    pub test_id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub status: AttemptStatus,
}

impl Attempt {
    /// The instant at which the attempt runs out of time.
    ///
    /// Saturates at the latest representable instant for absurd durations.
    pub fn deadline(&self) -> DateTime<Utc> {
        i64::try_from(self.duration_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|d| self.started_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Response of the create-attempt call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAttempt {
    pub id: String,
    pub started_at: DateTime<Utc>,
}

/// Full attempt state as returned by get/resume-attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    #[serde(flatten)]
    pub attempt: Attempt,
    #[serde(default)]
    pub answers: Vec<AnswerEntry>,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    /// Seconds spent per question.
    #[serde(default)]
    pub time_spent: BTreeMap<String, u64>,
    #[serde(default)]
    pub current_index: usize,
}

/// Supported question types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionKind {
    SingleChoice,
    MultiSelect,
    Boolean,
    ShortText,
    LongText,
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuestionKind::SingleChoice => write!(f, "single-choice"),
            QuestionKind::MultiSelect => write!(f, "multi-select"),
            QuestionKind::Boolean => write!(f, "boolean"),
            QuestionKind::ShortText => write!(f, "short-text"),
            QuestionKind::LongText => write!(f, "long-text"),
        }
    }
}

impl FromStr for QuestionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "single-choice" | "single" | "mcq" => Ok(QuestionKind::SingleChoice),
            "multi-select" | "multiple" | "multi" => Ok(QuestionKind::MultiSelect),
            "boolean" | "bool" | "true-false" => Ok(QuestionKind::Boolean),
            "short-text" | "short" => Ok(QuestionKind::ShortText),
            "long-text" | "long" | "essay" => Ok(QuestionKind::LongText),
            other => Err(format!("unknown question type: {other}")),
        }
    }
}

/// A question as supplied by the test definition. Read-only within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// The value of an answer. Its shape depends on the question type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Flag(bool),
    Text(String),
    Choices(Vec<String>),
}

impl AnswerValue {
    /// Whether this value counts as "no answer".
    pub fn is_empty(&self) -> bool {
        match self {
            AnswerValue::Flag(_) => false,
            AnswerValue::Text(s) => s.is_empty(),
            AnswerValue::Choices(c) => c.is_empty(),
        }
    }
}

impl fmt::Display for AnswerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerValue::Flag(b) => write!(f, "{b}"),
            AnswerValue::Text(s) => write!(f, "{s}"),
            AnswerValue::Choices(c) => write!(f, "{}", c.join(", ")),
        }
    }
}

/// The stored answer for one question. Absence means unanswered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerEntry {
    pub question_id: String,
    pub value: AnswerValue,
    pub last_modified_at: DateTime<Utc>,
}

/// Progress counters for the confirm dialog and progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub answered: usize,
    pub total: usize,
    pub flagged: usize,
}

impl Progress {
    pub fn unanswered(&self) -> usize {
        self.total.saturating_sub(self.answered)
    }
}

/// Body of a checkpoint write. Carries the full current state, never a delta,
/// so later checkpoints may supersede earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub answers: Vec<AnswerEntry>,
    pub flags: BTreeMap<String, bool>,
    pub time_spent: BTreeMap<String, u64>,
    pub remaining_time: u64,
    pub current_index: usize,
}

/// Body of the final submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub final_answers: Vec<AnswerEntry>,
    pub time_spent: BTreeMap<String, u64>,
    pub flags: BTreeMap<String, bool>,
}

/// What the server returns after grading. Scoring happens server-side; the
/// engine forwards these fields untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub attempt_id: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub max_score: Option<f64>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// A test as the session sees it: metadata plus, optionally, embedded questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDefinition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub duration_seconds: u64,
    /// Empty means the questions are fetched from the attempt API by test id.
    #[serde(default)]
    pub questions: Vec<Question>,
}
