//! Prompt construction for fix requests and commit messages.
//!
//! All prompts sent through the rotation manager are built here, so
//! the repair loop stays free of template text. Output-size control is
//! also here: test output is truncated from the middle (keeping the
//! header and the final failure block) before it is embedded in a
//! prompt.

use crate::testexec::TestRunResult;

/// Fixed marker prefixed to every generated commit subject.
pub const COMMIT_MESSAGE_MARKER: &str = "mend: ";

/// Maximum commit subject length, marker excluded.
pub const MAX_SUBJECT_CHARS: usize = 72;

/// Build the generic workspace-fix prompt for a failing run.
#[must_use]
pub fn build_fix_prompt(summary: &str, result: &TestRunResult, max_chars: usize) -> String {
    let scope = result
        .test_file
        .as_deref()
        .map_or_else(String::new, |f| format!("\nFailing test file: {f}"));

    format!(
        "The test suite in this workspace is failing and you must fix it.\n\
         \n\
         Test command: {command}\n\
         Exit code: {code}{scope}\n\
         \n\
         Error summary:\n\
         {summary}\n\
         \n\
         Test output:\n\
         {output}\n\
         \n\
         Fix the underlying problem by editing the workspace files directly. \
         Make the smallest change that makes the tests pass. Do not modify the \
         tests themselves unless they are clearly wrong.",
        command = result.command,
        code = result.return_code,
        output = truncate_middle(&combined_output(result), max_chars),
    )
}

/// Build the stability-specific fix prompt for an order-dependent
/// failure: the test fails inside the full suite but passes alone.
#[must_use]
pub fn build_stability_prompt(result: &TestRunResult, max_chars: usize) -> String {
    let file = result.test_file.as_deref().unwrap_or("(unknown)");
    let full_output = result
        .full_suite_result
        .as_deref()
        .map_or_else(String::new, combined_output);
    let half = (max_chars / 2).max(1);

    format!(
        "The test file {file} fails when the full test suite runs but passes \
         when run in isolation. This is a test-stability issue: some other \
         test is leaking state (globals, environment, files, database rows) \
         into it.\n\
         \n\
         Full-suite output (failing):\n\
         {full}\n\
         \n\
         Isolated output (passing):\n\
         {isolated}\n\
         \n\
         Find the cross-test interference and fix it at the source: reset \
         shared state, isolate fixtures, or make the affected tests \
         order-independent. Do not simply skip or reorder tests.",
        full = truncate_middle(&full_output, half),
        isolated = truncate_middle(&combined_output(result), half),
    )
}

/// Build the prompt requesting a one-line commit subject.
#[must_use]
pub fn build_commit_message_prompt(fix_summary: &str) -> String {
    format!(
        "An automated fix was just applied to this repository for the \
         following test failure:\n\
         \n\
         {fix_summary}\n\
         \n\
         Write a git commit subject line for the fix. Respond with the \
         subject line only: a single line, at most {MAX_SUBJECT_CHARS} \
         characters, imperative mood, no trailing period."
    )
}

/// Pull a usable subject line out of a backend response.
///
/// Prefers the first non-empty line inside a fenced code block, falls
/// back to the first non-empty line of the whole response. The line is
/// stripped of stray backticks and quotes and capped at
/// [`MAX_SUBJECT_CHARS`].
#[must_use]
pub fn extract_subject_line(response: &str) -> Option<String> {
    let candidate = fenced_block_content(response)
        .and_then(|block| block.lines().find(|l| !l.trim().is_empty()).map(str::to_string))
        .or_else(|| {
            response
                .lines()
                .find(|l| !l.trim().is_empty() && !l.trim_start().starts_with("```"))
                .map(str::to_string)
        })?;

    let cleaned = candidate.trim().trim_matches(['`', '"', '\'']).trim();
    if cleaned.is_empty() {
        return None;
    }

    Some(cleaned.chars().take(MAX_SUBJECT_CHARS).collect())
}

/// Deterministic commit message used when subject generation fails.
#[must_use]
pub fn fallback_commit_message(fix_summary: &str) -> String {
    let summary = one_line(fix_summary, MAX_SUBJECT_CHARS.saturating_sub(20));
    if summary.is_empty() {
        format!("{COMMIT_MESSAGE_MARKER}apply automated test fix")
    } else {
        format!("{COMMIT_MESSAGE_MARKER}automated fix for {summary}")
    }
}

/// First line of `text`, capped at `max_chars` characters.
#[must_use]
pub fn one_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    line.chars().take(max_chars).collect()
}

/// Truncate from the middle, keeping the head (context and early
/// errors) and the tail (the final failure block). Cuts only on char
/// boundaries.
#[must_use]
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let keep_start = max_chars * 2 / 3;
    let keep_end = max_chars - keep_start;

    let start: String = text.chars().take(keep_start).collect();
    let end: String = text
        .chars()
        .skip(total - keep_end)
        .collect();

    format!(
        "{start}\n... [truncated {} chars] ...\n{end}",
        total - max_chars
    )
}

fn combined_output(result: &TestRunResult) -> String {
    if result.errors.trim().is_empty() {
        result.output.clone()
    } else if result.output.trim().is_empty() {
        result.errors.clone()
    } else {
        format!("{}\n{}", result.output, result.errors)
    }
}

fn fenced_block_content(response: &str) -> Option<&str> {
    let open = response.find("```")?;
    let after_open = &response[open + 3..];
    // Skip an optional language tag on the opening fence line.
    let content_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let content = &after_open[content_start..];
    let close = content.find("```")?;
    Some(&content[..close])
}
