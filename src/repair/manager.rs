//! The iterative test-repair loop.
//!
//! Drives test-execution, fix-request, re-test, and commit-or-retry
//! until the suite passes or the attempt budget is exhausted.
//!
//! # State machine
//!
//! ```text
//! RUN ──> EVALUATE ──> FIX ──> VERIFY ──> DECIDE ──> COMMIT
//!  ▲          │                              │          │
//!  └──────────┴──────────────────────────────┴──────────┘
//! ```
//!
//! - **RUN** executes tests, scoped to the focused file when one is
//!   set, consuming a cached post-fix result when available.
//! - **EVALUATE** terminates on a full-suite pass, clears the focus
//!   (forcing a full-suite re-validation) on a scoped pass, and picks
//!   the stability or generic fix path on failure.
//! - **FIX** requests a fix through the rotation manager's test-fix
//!   entry point, skipping the call entirely when the error summary is
//!   empty.
//! - **VERIFY** re-runs tests and scores the fix with
//!   [`change_fraction`] over both raw output and extracted summaries.
//! - **DECIDE** commits passes and meaningful progress; sub-threshold
//!   changes are treated as noise and never staged.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::backend::rotation::RotationManager;
use crate::change::change_fraction;
use crate::config::MendConfig;
use crate::error::{MendError, Result};
use crate::git::GitOperations;
use crate::prompt::{
    build_commit_message_prompt, build_fix_prompt, build_stability_prompt, extract_subject_line,
    fallback_commit_message, one_line, COMMIT_MESSAGE_MARKER,
};
use crate::repair::state::{FixAttempt, RepairOutcome, RepairState};
use crate::testexec::{ErrorSummarizer, TestRunResult, TestRunner};

/// Minimum combined change fraction for a still-failing fix to count
/// as meaningful progress. Applied identically to the raw-output ratio
/// and the summary ratio (the maximum of the two is compared).
pub const SIGNIFICANCE_THRESHOLD: f64 = 0.10;

/// Filename of the durable fatal-error record under the state dir.
pub const FATAL_MARKER_FILENAME: &str = "last_fatal_error.json";

/// Maximum characters kept of a fix-attempt summary line.
const ATTEMPT_SUMMARY_CHARS: usize = 120;

/// What the loop should do after a stage/commit/push round.
enum FinalizeOutcome {
    Continue,
    AbortLoop,
}

/// Runtime options for one repair session.
#[derive(Debug, Clone)]
pub struct RepairLoopConfig {
    /// Attempt budget; non-finite means unbounded.
    pub max_fix_attempts: f64,
    /// Maximum characters of test output embedded in one prompt.
    pub max_prompt_chars: usize,
    /// Request no fixes and commit nothing.
    pub dry_run: bool,
    /// Directory for durable failure markers.
    pub state_dir: PathBuf,
}

impl RepairLoopConfig {
    /// Derive loop options from the project configuration.
    #[must_use]
    pub fn from_config(config: &MendConfig, project_dir: &std::path::Path, dry_run: bool) -> Self {
        Self {
            max_fix_attempts: config.max_fix_attempts,
            max_prompt_chars: config.max_prompt_chars,
            dry_run,
            state_dir: config.state_dir_path(project_dir),
        }
    }
}

/// The repair loop itself.
///
/// All collaborators are injected: the rotation manager (owned, since
/// the loop is its only caller), and trait objects for test execution,
/// VCS, and error summarization.
pub struct RepairLoop {
    rotation: RotationManager,
    runner: Arc<dyn TestRunner>,
    git: Arc<dyn GitOperations>,
    summarizer: Arc<dyn ErrorSummarizer>,
    config: RepairLoopConfig,
    state: RepairState,
}

impl RepairLoop {
    /// Create a loop over the injected collaborators.
    #[must_use]
    pub fn new(
        rotation: RotationManager,
        runner: Arc<dyn TestRunner>,
        git: Arc<dyn GitOperations>,
        summarizer: Arc<dyn ErrorSummarizer>,
        config: RepairLoopConfig,
    ) -> Self {
        Self {
            rotation,
            runner,
            git,
            summarizer,
            config,
            state: RepairState::new(),
        }
    }

    /// Start the session focused on a single test file.
    #[must_use]
    pub fn with_focus(mut self, test_file: Option<String>) -> Self {
        self.state.current_test_file = test_file;
        self
    }

    /// Mutable access to the rotation manager, for pre-run wiring such
    /// as staleness resets.
    pub fn rotation_mut(&mut self) -> &mut RotationManager {
        &mut self.rotation
    }

    /// Run the repair loop to completion.
    ///
    /// Always produces a structured [`RepairOutcome`] on orderly exit,
    /// success or not, so callers can report partial progress.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures that must escalate beyond
    /// the loop: currently a push failure after a successful commit
    /// ([`MendError::PushFailed`]), which the binary treats as fatal to
    /// the whole process.
    pub async fn run(&mut self) -> Result<RepairOutcome> {
        info!(session = %self.state.session_id, "starting repair loop");
        if self.config.dry_run {
            self.state.record("dry-run mode: no fixes will be requested or committed");
        }

        loop {
            if self.budget_exhausted() {
                self.state.record(format!(
                    "attempt budget exhausted after {} attempts",
                    self.state.attempts
                ));
                break;
            }

            // RUN: consume the cached post-fix result when present.
            let result = match self.state.cached_test_result.take() {
                Some(cached) => {
                    debug!("consuming cached test result");
                    cached
                }
                None => match self.runner.run(self.state.current_test_file.as_deref()).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!("test execution failed: {e}");
                        self.state.record(format!("test execution failed: {e}"));
                        break;
                    }
                },
            };

            // EVALUATE
            if result.success {
                if self.state.current_test_file.take().is_some() {
                    // A scoped pass is not a verdict on the suite.
                    self.state
                        .record("focused test file passes; re-validating full suite");
                    continue;
                }
                self.state.success = true;
                self.state.record("test suite passing");
                break;
            }

            if result.stability_issue {
                self.state.record(format!(
                    "stability issue: {} fails in the suite but passes alone",
                    result.test_file.as_deref().unwrap_or("(unknown)")
                ));
            } else if let Some(file) = result.test_file.clone() {
                if self.state.current_test_file.as_deref() != Some(file.as_str()) {
                    self.state.record(format!("focusing on failing file {file}"));
                }
                self.state.current_test_file = Some(file);
            }

            // FIX
            self.state.attempts += 1;
            let pre_summary = self.summarizer.summarize(&result);
            if pre_summary.is_empty() {
                self.state
                    .record("no actionable errors in test output; skipping fix request");
                continue;
            }

            let prompt = if result.stability_issue {
                build_stability_prompt(&result, self.config.max_prompt_chars)
            } else {
                build_fix_prompt(&pre_summary, &result, self.config.max_prompt_chars)
            };

            let attempt = match self.request_fix(&prompt, &pre_summary).await {
                Ok(a) => a,
                Err(e) => {
                    error!("fix request failed: {e}");
                    self.state.record(format!("fix request failed: {e}"));
                    break;
                }
            };
            self.state.record(format!(
                "attempt {}: {} [{} / {}]",
                self.state.attempts, attempt.summary, attempt.backend, attempt.model
            ));

            if self.config.dry_run {
                self.state.record("[dry-run] skipping verification and commit");
                continue;
            }

            // VERIFY
            let post = match self.runner.run(self.state.current_test_file.as_deref()).await {
                Ok(r) => r,
                Err(e) => {
                    error!("post-fix test execution failed: {e}");
                    self.state
                        .record(format!("post-fix test execution failed: {e}"));
                    break;
                }
            };
            let post_summary = self.summarizer.summarize(&post);
            let significance = change_fraction(Some(&full_text(&result)), Some(&full_text(&post)))
                .max(change_fraction(Some(&pre_summary), Some(&post_summary)));
            debug!("fix significance: {significance:.3}");

            // DECIDE
            if post.success {
                self.state.record(format!(
                    "tests pass after fix (significance {significance:.2})"
                ));
                match self.finalize_fix(&attempt, true).await? {
                    FinalizeOutcome::Continue => {
                        self.state.cached_test_result = Some(post);
                        continue;
                    }
                    FinalizeOutcome::AbortLoop => break,
                }
            }

            if significance < SIGNIFICANCE_THRESHOLD {
                self.state.record(format!(
                    "change not significant ({significance:.2} < {SIGNIFICANCE_THRESHOLD}); \
                     nothing staged"
                ));
                self.state.cached_test_result = Some(post);
                continue;
            }

            self.state.record(format!(
                "meaningful change (significance {significance:.2}); committing progress"
            ));
            match self.finalize_fix(&attempt, false).await? {
                FinalizeOutcome::Continue => self.state.cached_test_result = Some(post),
                FinalizeOutcome::AbortLoop => break,
            }
        }

        let outcome = self.state.outcome();
        if outcome.success {
            info!(
                attempts = outcome.attempts,
                "repair loop finished successfully"
            );
        } else {
            warn!(
                attempts = outcome.attempts,
                "repair loop finished without success"
            );
        }
        Ok(outcome)
    }

    /// Close every instantiated backend client.
    pub async fn shutdown(&mut self) {
        self.rotation.close_all().await;
    }

    fn budget_exhausted(&self) -> bool {
        // Non-finite budgets never exhaust; the finiteness check keeps
        // `inf` configurations from ever comparing.
        self.config.max_fix_attempts.is_finite()
            && f64::from(self.state.attempts) >= self.config.max_fix_attempts
    }

    async fn request_fix(&mut self, prompt: &str, summary: &str) -> Result<FixAttempt> {
        let summary_line = one_line(summary, ATTEMPT_SUMMARY_CHARS);

        if self.config.dry_run {
            return Ok(FixAttempt {
                summary: format!("[dry-run] would request fix for: {summary_line}"),
                raw_response: None,
                backend: self.rotation.active_backend().to_string(),
                model: self.rotation.active_model_name(),
            });
        }

        let response = self.rotation.run_test_fix_prompt(prompt).await?;
        Ok(FixAttempt {
            summary: summary_line,
            raw_response: Some(response),
            backend: self.rotation.active_backend().to_string(),
            model: self.rotation.active_model_name(),
        })
    }

    /// Stage, commit, and optionally push the applied fix.
    ///
    /// Staging and commit failures end the loop without success (the
    /// structured outcome is still produced); only the push failure
    /// after a successful commit escalates as an error, since that is
    /// the one condition the binary must treat as process-fatal.
    async fn finalize_fix(&mut self, attempt: &FixAttempt, push: bool) -> Result<FinalizeOutcome> {
        let staged = match self.git.stage_all().await {
            Ok(r) => r,
            Err(e) => return Ok(self.abort_vcs("stage", &e.to_string())),
        };
        if !staged.success {
            return Ok(self.abort_vcs("stage", staged.stderr.trim()));
        }

        let message = self.commit_message(attempt).await;
        let committed = match self.git.commit(&message).await {
            Ok(r) => r,
            Err(e) => return Ok(self.abort_vcs("commit", &e.to_string())),
        };
        if !committed.success {
            let detail = if committed.stderr.trim().is_empty() {
                committed.stdout.trim().to_string()
            } else {
                committed.stderr.trim().to_string()
            };
            self.record_fatal_marker("commit", &detail);
            return Ok(self.abort_vcs("commit", &detail));
        }
        self.state.record(format!("committed: {message}"));

        if push {
            let pushed = match self.git.push().await {
                Ok(r) => r,
                Err(e) => return Ok(self.abort_vcs("push", &e.to_string())),
            };
            if !pushed.success {
                let detail = pushed.stderr.trim().to_string();
                error!("push failed after successful commit: {detail}");
                self.record_fatal_marker("push", &detail);
                self.state.record(format!("push failed: {detail}"));
                return Err(MendError::push_failed(detail));
            }
            self.state.record("pushed fix to remote");
        }

        Ok(FinalizeOutcome::Continue)
    }

    fn abort_vcs(&mut self, operation: &str, detail: &str) -> FinalizeOutcome {
        error!("{operation} failed: {detail}");
        self.state.record(format!("{operation} failed: {detail}"));
        FinalizeOutcome::AbortLoop
    }

    /// Produce the commit message: an LLM-generated subject line with a
    /// deterministic fallback.
    async fn commit_message(&mut self, attempt: &FixAttempt) -> String {
        let prompt = build_commit_message_prompt(&attempt.summary);
        match self.rotation.invoke(&prompt).await {
            Ok(response) => match extract_subject_line(&response) {
                Some(subject) => format!("{COMMIT_MESSAGE_MARKER}{subject}"),
                None => fallback_commit_message(&attempt.summary),
            },
            Err(e) => {
                warn!("commit message generation failed, using fallback: {e}");
                fallback_commit_message(&attempt.summary)
            }
        }
    }

    /// Durably record an unrecoverable VCS failure before the process
    /// winds down. Best effort: losing the marker must not mask the
    /// original failure.
    fn record_fatal_marker(&self, kind: &str, detail: &str) {
        let marker = serde_json::json!({
            "session_id": self.state.session_id,
            "kind": kind,
            "detail": detail,
            "timestamp": Utc::now().timestamp(),
        });

        let path = self.config.state_dir.join(FATAL_MARKER_FILENAME);
        let written = std::fs::create_dir_all(&self.config.state_dir)
            .and_then(|()| std::fs::write(&path, marker.to_string()));
        if let Err(e) = written {
            warn!("failed to record fatal marker at {}: {e}", path.display());
        }
    }
}

fn full_text(result: &TestRunResult) -> String {
    format!("{}\n{}", result.output, result.errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::rotation::ClientFactory;
    use crate::backend::{BackendSpec, MockBackendClient};
    use crate::testing::{MockGitOperations, MockTestRunner, StaticSummarizer};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn rotation_with(client: Arc<MockBackendClient>) -> RotationManager {
        RotationManager::new(
            "mock",
            client as Arc<dyn crate::backend::BackendClient>,
            vec![BackendSpec::named("mock").with_retry_policy(0, 0.0)],
            HashMap::<String, ClientFactory>::new(),
        )
    }

    fn loop_config(temp: &TempDir, dry_run: bool) -> RepairLoopConfig {
        RepairLoopConfig {
            max_fix_attempts: 5.0,
            max_prompt_chars: 4000,
            dry_run,
            state_dir: temp.path().join(".mend"),
        }
    }

    fn build_loop(
        temp: &TempDir,
        runner: MockTestRunner,
        git: MockGitOperations,
        dry_run: bool,
    ) -> (RepairLoop, Arc<MockTestRunner>, Arc<MockGitOperations>) {
        let runner = Arc::new(runner);
        let git = Arc::new(git);
        let client = Arc::new(MockBackendClient::new().with_response("patched the file"));
        let repair = RepairLoop::new(
            rotation_with(client),
            runner.clone(),
            git.clone(),
            Arc::new(StaticSummarizer::new("assertion failed in test_x")),
            loop_config(temp, dry_run),
        );
        (repair, runner, git)
    }

    #[tokio::test]
    async fn test_passing_suite_terminates_immediately() {
        let temp = TempDir::new().unwrap();
        let runner = MockTestRunner::new().with_results(vec![TestRunResult::passing("all ok")]);
        let (mut repair, runner, git) = build_loop(&temp, runner, MockGitOperations::new(), false);

        let outcome = repair.run().await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(runner.call_count(), 1);
        assert_eq!(git.commit_calls(), 0);
    }

    #[tokio::test]
    async fn test_budget_zero_makes_no_attempts() {
        let temp = TempDir::new().unwrap();
        let runner = MockTestRunner::new().with_results(vec![TestRunResult::failing("bad", "")]);
        let (mut repair, runner, _git) = build_loop(&temp, runner, MockGitOperations::new(), false);
        repair.config.max_fix_attempts = 0.0;

        let outcome = repair.run().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(runner.call_count(), 0);
        assert!(outcome
            .messages
            .iter()
            .any(|m| m.contains("budget exhausted")));
    }

    #[tokio::test]
    async fn test_dry_run_requests_nothing_and_commits_nothing() {
        let temp = TempDir::new().unwrap();
        let failing = TestRunResult::failing("FAILED: assert", "");
        let runner = MockTestRunner::new()
            .with_results(vec![failing.clone(), failing.clone(), failing.clone()])
            .with_default(failing);
        let (mut repair, runner, git) = build_loop(&temp, runner, MockGitOperations::new(), true);
        repair.config.max_fix_attempts = 3.0;

        let outcome = repair.run().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(git.stage_calls(), 0);
        assert_eq!(git.commit_calls(), 0);
        // Dry run never verifies, so one run per iteration.
        assert_eq!(runner.call_count(), 3);
        assert!(outcome.messages.iter().any(|m| m.contains("[dry-run]")));
    }

    #[tokio::test]
    async fn test_empty_summary_skips_fix_request() {
        let temp = TempDir::new().unwrap();
        let failing = TestRunResult::failing("garbled nonsense", "");
        let runner = MockTestRunner::new().with_default(failing);
        let runner = Arc::new(runner);
        let git = Arc::new(MockGitOperations::new());
        let client = Arc::new(MockBackendClient::new().with_response("unused"));
        let client_probe = client.clone();
        let mut repair = RepairLoop::new(
            rotation_with(client),
            runner.clone(),
            git.clone(),
            // Empty summary: nothing actionable.
            Arc::new(StaticSummarizer::new("")),
            loop_config(&temp, false),
        );
        repair.config.max_fix_attempts = 2.0;

        let outcome = repair.run().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(client_probe.call_count(), 0);
        assert!(outcome
            .messages
            .iter()
            .any(|m| m.contains("no actionable errors")));
    }

    #[tokio::test]
    async fn test_staging_failure_is_fatal_to_loop() {
        let temp = TempDir::new().unwrap();
        let pre = TestRunResult::failing("FAILED alpha output", "");
        let post = TestRunResult::passing("all good now");
        let runner = MockTestRunner::new().with_results(vec![pre, post]);
        let git = MockGitOperations::new().with_stage_failure("index locked");
        let (mut repair, _runner, git) = build_loop(&temp, runner, git, false);

        let outcome = repair.run().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(git.stage_calls(), 1);
        assert_eq!(git.commit_calls(), 0);
        assert!(outcome.messages.iter().any(|m| m.contains("stage failed")));
    }

    #[tokio::test]
    async fn test_commit_failure_records_fatal_marker() {
        let temp = TempDir::new().unwrap();
        let pre = TestRunResult::failing("FAILED alpha output", "");
        let post = TestRunResult::passing("all good now");
        let runner = MockTestRunner::new().with_results(vec![pre, post]);
        let git = MockGitOperations::new().with_commit_failure("hook rejected");
        let (mut repair, _runner, _git) = build_loop(&temp, runner, git, false);

        let outcome = repair.run().await.unwrap();
        assert!(!outcome.success);

        let marker = temp.path().join(".mend").join(FATAL_MARKER_FILENAME);
        let content = std::fs::read_to_string(marker).unwrap();
        assert!(content.contains("\"kind\":\"commit\""));
        assert!(content.contains("hook rejected"));
    }

    #[tokio::test]
    async fn test_push_failure_escalates_and_records_marker() {
        let temp = TempDir::new().unwrap();
        let pre = TestRunResult::failing("FAILED alpha output", "");
        let post = TestRunResult::passing("all good now");
        let runner = MockTestRunner::new().with_results(vec![pre, post]);
        let git = MockGitOperations::new().with_push_failure("remote rejected");
        let (mut repair, _runner, git) = build_loop(&temp, runner, git, false);

        let err = repair.run().await.unwrap_err();
        assert!(err.is_process_fatal());
        assert_eq!(git.commit_calls(), 1);

        let marker = temp.path().join(".mend").join(FATAL_MARKER_FILENAME);
        let content = std::fs::read_to_string(marker).unwrap();
        assert!(content.contains("\"kind\":\"push\""));
    }

    #[tokio::test]
    async fn test_commit_message_uses_generated_subject() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(
            MockTestRunner::new().with_results(vec![
                TestRunResult::failing("FAILED alpha output", ""),
                TestRunResult::passing("fixed"),
                TestRunResult::passing("fixed"),
            ]),
        );
        let git = Arc::new(MockGitOperations::new());
        let client = Arc::new(MockBackendClient::new().with_response("fix expiry check in auth"));
        let mut repair = RepairLoop::new(
            rotation_with(client),
            runner.clone(),
            git.clone(),
            Arc::new(StaticSummarizer::new("assertion failed")),
            loop_config(&temp, false),
        );

        let outcome = repair.run().await.unwrap();
        assert!(outcome.success);
        let messages = git.commit_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], "mend: fix expiry check in auth");
    }

    #[tokio::test]
    async fn test_commit_message_falls_back_on_empty_response() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(
            MockTestRunner::new().with_results(vec![
                TestRunResult::failing("FAILED alpha output", ""),
                TestRunResult::passing("fixed"),
                TestRunResult::passing("fixed"),
            ]),
        );
        let git = Arc::new(MockGitOperations::new());
        let client = Arc::new(MockBackendClient::new().with_response(""));
        let mut repair = RepairLoop::new(
            rotation_with(client),
            runner.clone(),
            git.clone(),
            Arc::new(StaticSummarizer::new("assertion failed")),
            loop_config(&temp, false),
        );

        let outcome = repair.run().await.unwrap();
        assert!(outcome.success);
        let messages = git.commit_messages();
        assert!(messages[0].starts_with(COMMIT_MESSAGE_MARKER));
        assert!(messages[0].contains("assertion failed"));
    }

    #[tokio::test]
    async fn test_backend_failure_ends_loop_with_summary() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(
            MockTestRunner::new().with_default(TestRunResult::failing("FAILED alpha", "")),
        );
        let git = Arc::new(MockGitOperations::new());
        let client = Arc::new(MockBackendClient::new().always_fail("model refused"));
        let mut repair = RepairLoop::new(
            rotation_with(client),
            runner.clone(),
            git.clone(),
            Arc::new(StaticSummarizer::new("assertion failed")),
            loop_config(&temp, false),
        );

        let outcome = repair.run().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome
            .messages
            .iter()
            .any(|m| m.contains("fix request failed")));
    }
}
