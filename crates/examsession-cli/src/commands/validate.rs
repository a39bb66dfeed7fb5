//! The `examsession validate` command.

use std::path::PathBuf;

use anyhow::Result;

use examsession_core::parser;

pub fn execute(test_path: PathBuf) -> Result<()> {
    let tests = if test_path.is_dir() {
        parser::load_test_directory(&test_path)?
    } else {
        vec![parser::parse_test_definition(&test_path)?]
    };

    let mut total_warnings = 0;

    for test in &tests {
        println!(
            "Test: {} ({} questions, {} min)",
            test.title,
            test.questions.len(),
            test.duration_seconds / 60
        );

        let warnings = parser::validate_test_definition(test);
        for w in &warnings {
            let prefix = w
                .question_id
                .as_ref()
                .map(|id| format!("  [{id}]"))
                .unwrap_or_else(|| "  ".to_string());
            println!("{prefix} WARNING: {}", w.message);
        }
        total_warnings += warnings.len();
    }

    if total_warnings == 0 {
        println!("All test definitions valid.");
    } else {
        println!("\n{total_warnings} warning(s) found.");
    }

    Ok(())
}
