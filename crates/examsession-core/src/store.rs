//! Answer store: the single mutable source of truth of a session.
//!
//! Holds answers, review flags and per-question time spent. Every other
//! component reads snapshots of it; only the store mutates them.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::error::SessionError;
use crate::model::{
    AnswerEntry, AnswerValue, AttemptRecord, AttemptStatus, Checkpoint, Progress, Question,
    QuestionKind,
};

/// The question currently receiving time, and since when.
#[derive(Debug, Clone)]
struct Focus {
    question_id: String,
    since: DateTime<Utc>,
}

/// In-memory answers, flags and time spent for one attempt.
#[derive(Debug, Clone)]
pub struct AnswerStore {
    questions: Vec<Question>,
    positions: HashMap<String, usize>,
    answers: BTreeMap<String, AnswerEntry>,
    flags: BTreeMap<String, bool>,
    /// Milliseconds, so short visits are not rounded away.
    time_spent_ms: BTreeMap<String, i64>,
    focus: Option<Focus>,
    frozen: Option<AttemptStatus>,
}

impl AnswerStore {
    pub fn new(questions: Vec<Question>) -> Self {
        let positions = questions
            .iter()
            .enumerate()
            .map(|(i, q)| (q.id.clone(), i))
            .collect();
        Self {
            questions,
            positions,
            answers: BTreeMap::new(),
            flags: BTreeMap::new(),
            time_spent_ms: BTreeMap::new(),
            focus: None,
            frozen: None,
        }
    }

    /// Rebuild the store from a resumed attempt record.
    ///
    /// Entries for questions that are not part of this test are dropped.
    pub fn restore(questions: Vec<Question>, record: &AttemptRecord) -> Self {
        let mut store = Self::new(questions);
        for entry in &record.answers {
            if store.positions.contains_key(&entry.question_id) && !entry.value.is_empty() {
                store.answers.insert(entry.question_id.clone(), entry.clone());
            }
        }
        for (id, flagged) in &record.flags {
            if store.positions.contains_key(id) {
                store.flags.insert(id.clone(), *flagged);
            }
        }
        for (id, secs) in &record.time_spent {
            if store.positions.contains_key(id) {
                store.time_spent_ms.insert(id.clone(), (*secs as i64) * 1000);
            }
        }
        store
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.positions.get(question_id).map(|&i| &self.questions[i])
    }

    pub fn answer(&self, question_id: &str) -> Option<&AnswerEntry> {
        self.answers.get(question_id)
    }

    pub fn is_flagged(&self, question_id: &str) -> bool {
        self.flags.get(question_id).copied().unwrap_or(false)
    }

    pub fn frozen_status(&self) -> Option<AttemptStatus> {
        self.frozen
    }

    /// Record an answer.
    ///
    /// For multi-select questions a single option toggles its membership; a
    /// list replaces the selection. An empty value removes the entry. Time
    /// since the last mutation is credited to the question that was in focus,
    /// not necessarily the one being answered.
    pub fn set_answer(
        &mut self,
        question_id: &str,
        value: AnswerValue,
        kind: QuestionKind,
        now: DateTime<Utc>,
    ) -> Result<Option<&AnswerEntry>, SessionError> {
        self.ensure_open()?;
        let question = self
            .question(question_id)
            .ok_or_else(|| SessionError::UnknownQuestion(question_id.to_string()))?;
        if question.kind != kind {
            return Err(invalid(
                question_id,
                format!("question is {}, not {kind}", question.kind),
            ));
        }

        let current = self.answers.get(question_id).map(|e| &e.value);
        let next = normalize(question, current, value)?;

        self.settle(now);
        if next.is_empty() {
            self.answers.remove(question_id);
            return Ok(None);
        }
        self.answers.insert(
            question_id.to_string(),
            AnswerEntry {
                question_id: question_id.to_string(),
                value: next,
                last_modified_at: now,
            },
        );
        Ok(self.answers.get(question_id))
    }

    /// Flip the review flag of a question. Returns the new state.
    pub fn toggle_flag(&mut self, question_id: &str, now: DateTime<Utc>) -> Result<bool, SessionError> {
        self.ensure_open()?;
        if !self.positions.contains_key(question_id) {
            return Err(SessionError::UnknownQuestion(question_id.to_string()));
        }
        self.settle(now);
        let flag = self.flags.entry(question_id.to_string()).or_insert(false);
        *flag = !*flag;
        Ok(*flag)
    }

    /// Move time attribution to another question.
    pub fn focus(&mut self, question_id: &str, now: DateTime<Utc>) -> Result<(), SessionError> {
        if !self.positions.contains_key(question_id) {
            return Err(SessionError::UnknownQuestion(question_id.to_string()));
        }
        self.settle(now);
        self.focus = Some(Focus {
            question_id: question_id.to_string(),
            since: now,
        });
        Ok(())
    }

    /// Credit elapsed time to the focused question and restart its interval at `now`.
    pub fn settle(&mut self, now: DateTime<Utc>) {
        if let Some(focus) = &mut self.focus {
            let elapsed = (now - focus.since).num_milliseconds();
            if elapsed > 0 {
                *self
                    .time_spent_ms
                    .entry(focus.question_id.clone())
                    .or_insert(0) += elapsed;
                focus.since = now;
            }
        }
    }

    /// Settle and stop attributing time to any question.
    pub fn release_focus(&mut self, now: DateTime<Utc>) {
        self.settle(now);
        self.focus = None;
    }

    /// Make the store read-only. Subsequent mutations fail with `Terminal`.
    pub fn freeze(&mut self, status: AttemptStatus) {
        self.frozen = Some(status);
        self.focus = None;
    }

    pub fn progress(&self) -> Progress {
        Progress {
            answered: self.answers.len(),
            total: self.questions.len(),
            flagged: self.flags.values().filter(|f| **f).count(),
        }
    }

    /// Answers in question order.
    pub fn answers(&self) -> Vec<AnswerEntry> {
        self.questions
            .iter()
            .filter_map(|q| self.answers.get(&q.id).cloned())
            .collect()
    }

    pub fn flags(&self) -> BTreeMap<String, bool> {
        self.flags.clone()
    }

    /// Whole seconds spent on one question.
    pub fn time_spent_on(&self, question_id: &str) -> u64 {
        self.time_spent_ms
            .get(question_id)
            .map(|ms| (*ms / 1000) as u64)
            .unwrap_or(0)
    }

    /// Whole seconds spent per question.
    pub fn time_spent(&self) -> BTreeMap<String, u64> {
        self.time_spent_ms
            .iter()
            .map(|(id, ms)| (id.clone(), (*ms / 1000) as u64))
            .collect()
    }

    pub fn checkpoint(&self, remaining_time: u64, current_index: usize) -> Checkpoint {
        Checkpoint {
            answers: self.answers(),
            flags: self.flags(),
            time_spent: self.time_spent(),
            remaining_time,
            current_index,
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match self.frozen {
            Some(status) => Err(SessionError::Terminal { status }),
            None => Ok(()),
        }
    }
}

fn invalid(question_id: &str, reason: impl Into<String>) -> SessionError {
    SessionError::InvalidAnswer {
        question_id: question_id.to_string(),
        reason: reason.into(),
    }
}

fn check_option(question: &Question, choice: &str) -> Result<(), SessionError> {
    if question.options.is_empty() || question.options.iter().any(|o| o == choice) {
        Ok(())
    } else {
        Err(invalid(&question.id, format!("'{choice}' is not an option")))
    }
}

/// Validate `value` against the question and compute the value to store.
fn normalize(
    question: &Question,
    current: Option<&AnswerValue>,
    value: AnswerValue,
) -> Result<AnswerValue, SessionError> {
    match (question.kind, value) {
        (QuestionKind::Boolean, v @ AnswerValue::Flag(_)) => Ok(v),
        (QuestionKind::ShortText | QuestionKind::LongText, v @ AnswerValue::Text(_)) => Ok(v),
        (QuestionKind::SingleChoice, AnswerValue::Text(choice)) => {
            if !choice.is_empty() {
                check_option(question, &choice)?;
            }
            Ok(AnswerValue::Text(choice))
        }
        (QuestionKind::MultiSelect, AnswerValue::Text(choice)) => {
            check_option(question, &choice)?;
            let mut selected = match current {
                Some(AnswerValue::Choices(c)) => c.clone(),
                _ => Vec::new(),
            };
            if let Some(pos) = selected.iter().position(|c| *c == choice) {
                selected.remove(pos);
            } else {
                selected.push(choice);
            }
            Ok(AnswerValue::Choices(selected))
        }
        (QuestionKind::MultiSelect, AnswerValue::Choices(choices)) => {
            let mut selected: Vec<String> = Vec::with_capacity(choices.len());
            for choice in choices {
                check_option(question, &choice)?;
                if !selected.contains(&choice) {
                    selected.push(choice);
                }
            }
            Ok(AnswerValue::Choices(selected))
        }
        (kind, _) => Err(invalid(
            &question.id,
            format!("value shape does not fit a {kind} question"),
        )),
    }
}
