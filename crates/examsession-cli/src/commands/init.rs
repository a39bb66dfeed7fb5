//! The `examsession init` command.

use anyhow::Result;

pub fn execute() -> Result<()> {
    if std::path::Path::new("examsession.toml").exists() {
        println!("examsession.toml already exists, skipping.");
    } else {
        std::fs::write("examsession.toml", SAMPLE_CONFIG)?;
        println!("Created examsession.toml");
    }

    std::fs::create_dir_all("test-definitions")?;
    let example_path = std::path::Path::new("test-definitions/example.toml");
    if example_path.exists() {
        println!("test-definitions/example.toml already exists, skipping.");
    } else {
        std::fs::write(example_path, EXAMPLE_TEST)?;
        println!("Created test-definitions/example.toml");
    }

    println!("\nNext steps:");
    println!("  1. Edit examsession.toml with your attempt API URL and token");
    println!("  2. Run: examsession validate --test test-definitions/example.toml");
    println!("  3. Run: examsession take --test example --offline");

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# examsession configuration

user_id = "${USER}"
tests_dir = "./test-definitions"
results_dir = "./examsession-results"

[api]
base_url = "http://localhost:8080/api"
token = "${EXAMSESSION_API_TOKEN}"
timeout_secs = 15

[session]
autosave_debounce_ms = 2000
tick_interval_ms = 1000
realtime_max_retries = 5
poll_interval_secs = 30
cleanup_timeout_secs = 5
"#;

const EXAMPLE_TEST: &str = r#"[test]
id = "example"
title = "Example Test"
description = "A short test to try the session flow"
duration_seconds = 600

[[questions]]
id = "capital"
type = "single-choice"
prompt = "What is the capital of France?"
options = ["Berlin", "Paris", "Madrid"]

[[questions]]
id = "primes"
type = "multi-select"
prompt = "Which of these numbers are prime?"
options = ["2", "4", "7", "9"]

[[questions]]
id = "earth-flat"
type = "boolean"
prompt = "The Earth is flat."

[[questions]]
id = "explain"
type = "short-text"
prompt = "In one sentence, what does a compiler do?"
"#;
