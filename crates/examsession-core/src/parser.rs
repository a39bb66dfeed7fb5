//! TOML test definition parser.
//!
//! Loads test definitions from TOML files and directories, and validates them.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{Question, QuestionKind, TestDefinition};

/// Intermediate TOML structure for parsing test definition files.
#[derive(Debug, Deserialize)]
struct TomlTestFile {
    test: TomlTestHeader,
    #[serde(default)]
    questions: Vec<TomlQuestion>,
}

#[derive(Debug, Deserialize)]
struct TomlTestHeader {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_duration")]
    duration_seconds: u64,
}

fn default_duration() -> u64 {
    1800
}

#[derive(Debug, Deserialize)]
struct TomlQuestion {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    prompt: String,
    #[serde(default)]
    options: Vec<String>,
}

/// Parse a single TOML file into a `TestDefinition`.
pub fn parse_test_definition(path: &Path) -> Result<TestDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read test definition: {}", path.display()))?;

    parse_test_definition_str(&content, path)
}

/// Parse a TOML string into a `TestDefinition`.
pub fn parse_test_definition_str(content: &str, source_path: &Path) -> Result<TestDefinition> {
    let parsed: TomlTestFile = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    let questions = parsed
        .questions
        .into_iter()
        .map(|q| {
            let kind: QuestionKind = q
                .kind
                .parse()
                .map_err(|e: String| anyhow::anyhow!("question {}: {}", q.id, e))?;
            Ok(Question {
                id: q.id,
                kind,
                prompt: q.prompt,
                options: q.options,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TestDefinition {
        id: parsed.test.id,
        title: parsed.test.title,
        description: parsed.test.description,
        duration_seconds: parsed.test.duration_seconds,
        questions,
    })
}

/// Recursively load all `.toml` test definitions from a directory.
///
/// Files that fail to parse are skipped with a warning.
pub fn load_test_directory(dir: &Path) -> Result<Vec<TestDefinition>> {
    let mut tests = Vec::new();

    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();

        if path.is_dir() {
            tests.extend(load_test_directory(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            match parse_test_definition(&path) {
                Ok(test) => tests.push(test),
                Err(e) => tracing::warn!("skipping {}: {:#}", path.display(), e),
            }
        }
    }

    tests.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(tests)
}

/// A warning from test definition validation.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    /// The question ID (if applicable).
    pub question_id: Option<String>,
    pub message: String,
}

/// Validate a test definition for common authoring mistakes.
pub fn validate_test_definition(test: &TestDefinition) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let warn = |id: Option<&str>, message: String| ValidationWarning {
        question_id: id.map(str::to_string),
        message,
    };

    if test.duration_seconds == 0 {
        warnings.push(warn(None, "duration_seconds is 0; the session would expire immediately".into()));
    }
    if test.questions.is_empty() {
        warnings.push(warn(None, "no questions; they must be served by the attempt API".into()));
    }

    let mut seen_ids = std::collections::HashSet::new();
    for q in &test.questions {
        if !seen_ids.insert(&q.id) {
            warnings.push(warn(Some(&q.id), format!("duplicate question ID: {}", q.id)));
        }
        if q.prompt.trim().is_empty() {
            warnings.push(warn(Some(&q.id), "prompt is empty".into()));
        }

        match q.kind {
            QuestionKind::SingleChoice | QuestionKind::MultiSelect => {
                if q.options.is_empty() {
                    warnings.push(warn(Some(&q.id), format!("{} question has no options", q.kind)));
                }
                let mut seen_options = std::collections::HashSet::new();
                for option in &q.options {
                    if !seen_options.insert(option) {
                        warnings.push(warn(Some(&q.id), format!("duplicate option: {option}")));
                    }
                }
            }
            _ if !q.options.is_empty() => {
                warnings.push(warn(
                    Some(&q.id),
                    format!("options are ignored for {} questions", q.kind),
                ));
            }
            _ => {}
        }
    }

    warnings
}
