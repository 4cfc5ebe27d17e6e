//! Test execution boundary.
//!
//! This module owns everything about running the project's test suite:
//! the [`TestRunResult`] produced by each run, the [`TestRunner`] trait
//! the repair loop consumes, the subprocess-backed
//! [`ScriptTestRunner`], and the [`ErrorSummarizer`] that turns raw
//! test output into a short actionable summary.
//!
//! `ScriptTestRunner` also performs the stability probe: when a
//! full-suite run fails and the output names a specific test file, the
//! file is re-run in isolation. A failure that does not reproduce in
//! isolation is a *stability issue* (cross-test interference), flagged
//! on the result so the repair loop can build a different fix prompt.

use std::path::PathBuf;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use crate::error::{MendError, Result};

/// Outcome of one test execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunResult {
    /// Whether the run passed.
    pub success: bool,
    /// Captured stdout.
    pub output: String,
    /// Captured stderr.
    pub errors: String,
    /// Process exit code.
    pub return_code: i32,
    /// The command line that was executed.
    pub command: String,
    /// Test file this run was scoped to, or the file identified as
    /// failing in a full-suite run.
    pub test_file: Option<String>,
    /// The failure appeared in the full suite but not in isolation.
    pub stability_issue: bool,
    /// Original failing full-suite result, kept for comparison when
    /// `stability_issue` is set.
    pub full_suite_result: Option<Box<TestRunResult>>,
}

impl TestRunResult {
    /// A passing result, for tests and defaults.
    #[must_use]
    pub fn passing(output: &str) -> Self {
        Self {
            success: true,
            output: output.to_string(),
            errors: String::new(),
            return_code: 0,
            command: String::new(),
            test_file: None,
            stability_issue: false,
            full_suite_result: None,
        }
    }

    /// A failing result, for tests and defaults.
    #[must_use]
    pub fn failing(output: &str, errors: &str) -> Self {
        Self {
            success: false,
            output: output.to_string(),
            errors: errors.to_string(),
            return_code: 1,
            command: String::new(),
            test_file: None,
            stability_issue: false,
            full_suite_result: None,
        }
    }

    /// Set the scoped/failing test file.
    #[must_use]
    pub fn with_test_file(mut self, file: &str) -> Self {
        self.test_file = Some(file.to_string());
        self
    }

    /// Mark this result as a stability issue, attaching the original
    /// full-suite failure.
    #[must_use]
    pub fn with_stability_issue(mut self, full_suite: TestRunResult) -> Self {
        self.stability_issue = true;
        self.full_suite_result = Some(Box::new(full_suite));
        self
    }
}

/// Abstraction for test execution.
///
/// `scoped_to` narrows the run to a single test file; `None` runs the
/// full suite.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Execute the tests, optionally scoped to one file.
    ///
    /// # Errors
    ///
    /// Returns an error only when the test process cannot be executed
    /// at all; a failing suite is a successful run with
    /// `success == false`.
    async fn run(&self, scoped_to: Option<&str>) -> Result<TestRunResult>;
}

/// Subprocess-backed test runner.
///
/// Runs the configured command, appending the scoped file as the final
/// argument when present, and performs the stability probe on failing
/// full-suite runs.
pub struct ScriptTestRunner {
    project_dir: PathBuf,
    command: Vec<String>,
    /// Probe failing full-suite runs by re-running the failing file in
    /// isolation.
    stability_probe: bool,
}

impl ScriptTestRunner {
    /// Create a runner for the given project directory and command.
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            command,
            stability_probe: true,
        }
    }

    /// Enable or disable the stability probe.
    #[must_use]
    pub fn with_stability_probe(mut self, enabled: bool) -> Self {
        self.stability_probe = enabled;
        self
    }

    async fn execute(&self, scoped_to: Option<&str>) -> Result<TestRunResult> {
        if self.command.is_empty() {
            return Err(MendError::test_execution("no test command configured"));
        }

        let mut args = self.command[1..].to_vec();
        if let Some(file) = scoped_to {
            args.push(file.to_string());
        }

        let command_line = std::iter::once(self.command[0].as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        debug!("running tests: {command_line}");

        let output = AsyncCommand::new(&self.command[0])
            .args(&args)
            .current_dir(&self.project_dir)
            .output()
            .await
            .map_err(|e| {
                MendError::test_execution(format!("failed to run '{command_line}': {e}"))
            })?;

        Ok(TestRunResult {
            success: output.status.success(),
            output: String::from_utf8_lossy(&output.stdout).to_string(),
            errors: String::from_utf8_lossy(&output.stderr).to_string(),
            return_code: output.status.code().unwrap_or(-1),
            command: command_line,
            test_file: scoped_to.map(ToString::to_string),
            stability_issue: false,
            full_suite_result: None,
        })
    }
}

#[async_trait]
impl TestRunner for ScriptTestRunner {
    async fn run(&self, scoped_to: Option<&str>) -> Result<TestRunResult> {
        let result = self.execute(scoped_to).await?;

        // Scoped runs and passing suites need no probe.
        if scoped_to.is_some() || result.success || !self.stability_probe {
            return Ok(result);
        }

        let Some(file) = extract_failing_file(&result.output, &result.errors) else {
            return Ok(result);
        };

        debug!("probing failing file '{file}' in isolation");
        let isolated = self.execute(Some(&file)).await?;

        if isolated.success {
            info!("'{file}' fails in the suite but passes in isolation (stability issue)");
            let mut probe = isolated;
            probe.success = false;
            probe.return_code = result.return_code;
            Ok(probe
                .with_test_file(&file)
                .with_stability_issue(result))
        } else {
            // Failure reproduces in isolation: hand back the focused
            // result so the loop can iterate on this file alone.
            Ok(isolated.with_test_file(&file))
        }
    }
}

/// Pull the first failing test file path out of test output.
///
/// Patterns are ordered most specific first and cover the pytest, jest,
/// and go styles of naming the failing file.
#[must_use]
pub fn extract_failing_file(output: &str, errors: &str) -> Option<String> {
    let patterns = [
        r"(?m)^FAILED\s+([^\s:]+)",
        r"(?m)^([^\s:]+)::\S+\s+FAILED",
        r"(?m)^ERROR\s+([^\s:]+)",
        r"(?m)^FAIL\s+(\S+)",
    ];

    let combined = format!("{output}\n{errors}");
    for pattern in patterns {
        let re = Regex::new(pattern).expect("static pattern");
        if let Some(caps) = re.captures(&combined) {
            let candidate = caps[1].to_string();
            // Require something path-shaped, not a bare test name.
            if candidate.contains('/') || candidate.contains('.') {
                return Some(candidate);
            }
        }
    }
    None
}

// =============================================================================
// Error summarization
// =============================================================================

/// Turns a test result into a short, single-purpose error summary.
///
/// An empty summary signals "no actionable error": the repair loop will
/// skip the fix request entirely rather than spend an LLM call on
/// unparseable failures.
pub trait ErrorSummarizer: Send + Sync {
    /// Summarize the failure in `result`, or return an empty string.
    fn summarize(&self, result: &TestRunResult) -> String;
}

/// Maximum matched lines included in a summary.
const MAX_SUMMARY_LINES: usize = 8;

/// Maximum summary length in characters.
const MAX_SUMMARY_CHARS: usize = 400;

/// Regex-driven summarizer for common test-tool output.
///
/// Patterns are checked line by line, most specific first, mirroring
/// the ordered classification tables used elsewhere in the crate.
pub struct RegexSummarizer {
    patterns: Vec<Regex>,
}

impl Default for RegexSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RegexSummarizer {
    /// Create a summarizer with the built-in pattern set.
    #[must_use]
    pub fn new() -> Self {
        let patterns = [
            r"^FAILED\s",
            r"^ERROR\s",
            r"^FAIL\s",
            r"^E\s+",
            r"(?i)assert(ion)?\s*(error|failed)",
            r"panicked at",
            r"error\[E\d+\]",
            r"(?i)^\s*error:",
            r"Traceback \(most recent call last\)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect();

        Self { patterns }
    }

    fn is_error_line(&self, line: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(line))
    }
}

impl ErrorSummarizer for RegexSummarizer {
    fn summarize(&self, result: &TestRunResult) -> String {
        if result.success {
            return String::new();
        }

        let mut lines: Vec<&str> = Vec::new();
        for line in result.errors.lines().chain(result.output.lines()) {
            let trimmed = line.trim();
            if trimmed.is_empty() || lines.contains(&trimmed) {
                continue;
            }
            if self.is_error_line(trimmed) {
                lines.push(trimmed);
                if lines.len() >= MAX_SUMMARY_LINES {
                    break;
                }
            }
        }

        let summary = lines.join("; ");
        if summary.chars().count() <= MAX_SUMMARY_CHARS {
            return summary;
        }
        let truncated: String = summary.chars().take(MAX_SUMMARY_CHARS).collect();
        format!("{truncated}...")
    }
}
