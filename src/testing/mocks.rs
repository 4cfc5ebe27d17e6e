//! Mock implementations of collaborator traits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::git::{GitCommandResult, GitOperations};
use crate::testexec::{ErrorSummarizer, TestRunResult, TestRunner};

/// Mock test runner with a scripted sequence of results.
///
/// Results queued with [`with_results`](Self::with_results) are
/// consumed in order; once the queue is empty the configured default
/// (or a plain passing result) is returned. Every call is logged with
/// its scoping argument.
///
/// # Example
///
/// ```rust,ignore
/// let runner = MockTestRunner::new()
///     .with_results(vec![TestRunResult::failing("boom", "")])
///     .with_default(TestRunResult::passing("ok"));
/// ```
pub struct MockTestRunner {
    results: Mutex<VecDeque<TestRunResult>>,
    default: TestRunResult,
    calls: Mutex<Vec<Option<String>>>,
}

impl Default for MockTestRunner {
    fn default() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            default: TestRunResult::passing(""),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockTestRunner {
    /// Create a runner that passes by default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue results to return, in order.
    #[must_use]
    pub fn with_results(self, results: Vec<TestRunResult>) -> Self {
        self.results.lock().unwrap().extend(results);
        self
    }

    /// Result returned once the queue is exhausted.
    #[must_use]
    pub fn with_default(mut self, result: TestRunResult) -> Self {
        self.default = result;
        self
    }

    /// Number of run calls received.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Scoping arguments of every call, in order.
    pub fn calls(&self) -> Vec<Option<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TestRunner for MockTestRunner {
    async fn run(&self, scoped_to: Option<&str>) -> Result<TestRunResult> {
        self.calls
            .lock()
            .unwrap()
            .push(scoped_to.map(ToString::to_string));

        let next = self.results.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.default.clone()))
    }
}

/// Mock git operations with per-operation failure toggles and call
/// counters.
///
/// # Example
///
/// ```rust,ignore
/// let git = MockGitOperations::new().with_push_failure("remote rejected");
/// assert!(!git.push().await.unwrap().success);
/// ```
pub struct MockGitOperations {
    stage_error: Option<String>,
    commit_error: Option<String>,
    push_error: Option<String>,
    stage_calls: AtomicU32,
    commit_calls: AtomicU32,
    push_calls: AtomicU32,
    commit_messages: Mutex<Vec<String>>,
}

impl Default for MockGitOperations {
    fn default() -> Self {
        Self {
            stage_error: None,
            commit_error: None,
            push_error: None,
            stage_calls: AtomicU32::new(0),
            commit_calls: AtomicU32::new(0),
            push_calls: AtomicU32::new(0),
            commit_messages: Mutex::new(Vec::new()),
        }
    }
}

impl MockGitOperations {
    /// Create a mock where every operation succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make staging fail with the given stderr.
    #[must_use]
    pub fn with_stage_failure(mut self, stderr: &str) -> Self {
        self.stage_error = Some(stderr.to_string());
        self
    }

    /// Make commits fail with the given stderr.
    #[must_use]
    pub fn with_commit_failure(mut self, stderr: &str) -> Self {
        self.commit_error = Some(stderr.to_string());
        self
    }

    /// Make pushes fail with the given stderr.
    #[must_use]
    pub fn with_push_failure(mut self, stderr: &str) -> Self {
        self.push_error = Some(stderr.to_string());
        self
    }

    /// Number of stage_all calls.
    pub fn stage_calls(&self) -> u32 {
        self.stage_calls.load(Ordering::SeqCst)
    }

    /// Number of commit calls.
    pub fn commit_calls(&self) -> u32 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Number of push calls.
    pub fn push_calls(&self) -> u32 {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Commit messages received, in order.
    pub fn commit_messages(&self) -> Vec<String> {
        self.commit_messages.lock().unwrap().clone()
    }

    fn result_for(error: &Option<String>) -> GitCommandResult {
        match error {
            Some(stderr) => GitCommandResult::failed(stderr),
            None => GitCommandResult::ok(),
        }
    }
}

#[async_trait]
impl GitOperations for MockGitOperations {
    async fn stage_all(&self) -> Result<GitCommandResult> {
        self.stage_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::result_for(&self.stage_error))
    }

    async fn commit(&self, message: &str) -> Result<GitCommandResult> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        self.commit_messages.lock().unwrap().push(message.to_string());
        Ok(Self::result_for(&self.commit_error))
    }

    async fn push(&self) -> Result<GitCommandResult> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::result_for(&self.push_error))
    }
}

/// Summarizer returning a fixed string for failures and an empty
/// string for passing results. An empty fixed string makes every
/// failure look unactionable.
pub struct StaticSummarizer {
    text: String,
}

impl StaticSummarizer {
    /// Create a summarizer that always reports `text` for failures.
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

impl ErrorSummarizer for StaticSummarizer {
    fn summarize(&self, result: &TestRunResult) -> String {
        if result.success {
            String::new()
        } else {
            self.text.clone()
        }
    }
}
