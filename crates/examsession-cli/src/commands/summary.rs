//! The `examsession summary` command.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::{Cell, Table};

use examsession_core::handoff::ResultPayload;

pub fn execute(result_path: PathBuf) -> Result<()> {
    let payload = ResultPayload::load_json(&result_path)?;
    println!("{}", render(&payload));
    Ok(())
}

/// Render a result as an overview table followed by a per-question table.
pub fn render(payload: &ResultPayload) -> String {
    let server = &payload.server;
    let mut overview = Table::new();
    overview.set_header(vec!["Attempt", "Status", "Answered", "Flagged", "Time", "Score", "Passed"]);
    overview.add_row(vec![
        Cell::new(&payload.attempt_id),
        Cell::new(payload.status),
        Cell::new(format!("{}/{}", payload.progress.answered, payload.progress.total)),
        Cell::new(payload.progress.flagged),
        Cell::new(format_duration(payload.total_time_seconds)),
        Cell::new(match (server.score, server.max_score, server.percentage) {
            (Some(s), Some(m), Some(p)) => format!("{s}/{m} ({p:.1}%)"),
            (Some(s), Some(m), None) => format!("{s}/{m}"),
            (Some(s), None, _) => format!("{s}"),
            _ => "-".to_string(),
        }),
        Cell::new(match server.passed {
            Some(true) => "yes",
            Some(false) => "no",
            None => "-",
        }),
    ]);

    let mut questions = Table::new();
    questions.set_header(vec!["Question", "Answer", "Flagged", "Time"]);
    let mut ids: Vec<&String> = payload
        .time_spent
        .keys()
        .chain(payload.answers.iter().map(|a| &a.question_id))
        .chain(payload.flags.keys())
        .collect();
    ids.sort();
    ids.dedup();
    for id in ids {
        let answer = payload
            .answers
            .iter()
            .find(|a| &a.question_id == id)
            .map(|a| a.value.to_string())
            .unwrap_or_else(|| "-".to_string());
        let flagged = payload.flags.get(id).copied().unwrap_or(false);
        questions.add_row(vec![
            Cell::new(id),
            Cell::new(answer),
            Cell::new(if flagged { "*" } else { "" }),
            Cell::new(format_duration(payload.time_spent.get(id).copied().unwrap_or(0))),
        ]);
    }

    format!(
        "Test {} by {} ({})\n{overview}\n{questions}",
        payload.test_id,
        payload.user_id,
        payload.submitted_at.format("%Y-%m-%d %H:%M UTC")
    )
}

fn format_duration(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}
