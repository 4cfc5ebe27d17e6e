//! Backend client abstraction for multi-backend support.
//!
//! This module defines the capability contract every LLM backend
//! adapter must satisfy, the per-backend configuration unit, and two
//! implementations: a subprocess-based CLI adapter and a controllable
//! mock for tests.
//!
//! # Architecture
//!
//! The [`BackendClient`] trait is the seam between the rotation manager
//! and concrete providers. It is:
//!
//! - **Object-safe**: used as `Arc<dyn BackendClient>` so backends can
//!   be selected at runtime
//! - **Thread-safe**: `Send + Sync` bounds
//! - **Capability-explicit**: optional operations
//!   (`switch_to_default_model`, `close`) are trait methods with
//!   default no-op bodies, so callers never introspect
//!
//! # Example
//!
//! ```rust,ignore
//! use mend::backend::{BackendClient, CliBackendClient};
//!
//! let client: Arc<dyn BackendClient> = Arc::new(CliBackendClient::from_spec(&spec, ".")?);
//! let text = client.invoke("fix the failing test").await?;
//! ```

pub mod rotation;
pub mod state;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::error::InvokeError;

/// Capability contract for LLM backend clients.
///
/// Implementations wrap a specific provider (a CLI tool, an HTTP API)
/// behind a uniform invocation interface. The rotation manager owns at
/// most one live client per backend name and drives every call through
/// this trait.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Send a prompt and return the backend's response text.
    ///
    /// # Errors
    ///
    /// - [`InvokeError::UsageLimit`] when the provider reports a
    ///   rate/quota condition
    /// - [`InvokeError::Timeout`] when the invocation exceeds an
    ///   externally enforced deadline
    /// - [`InvokeError::Other`] for every other failure mode
    async fn invoke(&self, prompt: &str) -> Result<String, InvokeError>;

    /// Reset the backend to its default model.
    ///
    /// Called by the rotation manager after landing on this backend
    /// following a rotation. The default implementation is a no-op for
    /// backends without model switching.
    async fn switch_to_default_model(&self) -> Result<(), InvokeError> {
        Ok(())
    }

    /// Release any resources held by this client.
    ///
    /// Called once per instantiated client when the rotation manager is
    /// torn down. The default implementation is a no-op.
    async fn close(&self) {}

    /// Human-readable identifier of the model this client targets.
    fn model_name(&self) -> &str;
}

fn default_retry_wait() -> f64 {
    60.0
}

/// A named, independently configured backend.
///
/// Backends are defined once at startup (usually in `mend.toml`) and
/// immutable for the process lifetime. The rotation policy fields
/// control how the rotation manager reacts to usage-limit errors; the
/// adapter fields describe how [`CliBackendClient`] invokes the
/// provider.
///
/// # Example mend.toml entry
///
/// ```toml
/// [[backends]]
/// name = "claude"
/// command = ["claude", "-p", "--output-format", "text"]
/// model = "opus"
/// usage_limit_retry_count = 2
/// usage_limit_retry_wait_seconds = 120.0
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Unique backend identity.
    pub name: String,

    /// Retries against this backend after a usage-limit error before
    /// rotating to the next one.
    #[serde(default)]
    pub usage_limit_retry_count: u32,

    /// Seconds to wait between usage-limit retries.
    #[serde(default = "default_retry_wait")]
    pub usage_limit_retry_wait_seconds: f64,

    /// Rotate to the next backend after every successful invocation.
    #[serde(default)]
    pub always_switch_after_execution: bool,

    /// Argv for the CLI adapter; the prompt is piped on stdin.
    #[serde(default)]
    pub command: Vec<String>,

    /// Model variant appended to the command as `--model <model>`.
    #[serde(default)]
    pub model: Option<String>,

    /// Case-insensitive regexes that classify a failed invocation as a
    /// usage-limit condition. Empty means the built-in defaults.
    #[serde(default)]
    pub usage_limit_patterns: Vec<String>,

    /// Hard deadline for one invocation, in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

impl BackendSpec {
    /// Create a spec with default rotation policy for the given name.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            usage_limit_retry_count: 0,
            usage_limit_retry_wait_seconds: default_retry_wait(),
            always_switch_after_execution: false,
            command: Vec::new(),
            model: None,
            usage_limit_patterns: Vec::new(),
            timeout_seconds: None,
        }
    }

    /// Set the usage-limit retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, count: u32, wait_seconds: f64) -> Self {
        self.usage_limit_retry_count = count;
        self.usage_limit_retry_wait_seconds = wait_seconds;
        self
    }

    /// Set the always-switch flag.
    #[must_use]
    pub fn with_always_switch(mut self, always_switch: bool) -> Self {
        self.always_switch_after_execution = always_switch;
        self
    }
}

/// Built-in classification patterns for provider quota conditions.
const DEFAULT_USAGE_LIMIT_PATTERNS: &[&str] = &[
    r"(?i)usage limit",
    r"(?i)rate limit",
    r"(?i)quota",
    r"(?i)too many requests",
    r"(?i)overloaded",
    r"\b429\b",
];

/// Subprocess-based backend adapter.
///
/// Spawns the configured CLI, pipes the prompt on stdin, and captures
/// stdout as the response. Failed invocations whose output matches one
/// of the usage-limit patterns are classified as
/// [`InvokeError::UsageLimit`]; an exceeded deadline becomes
/// [`InvokeError::Timeout`]; everything else is [`InvokeError::Other`].
pub struct CliBackendClient {
    /// Working directory for the subprocess.
    project_dir: PathBuf,
    /// Full argv; `argv[0]` is the program.
    command: Vec<String>,
    /// Model variant, appended as `--model <model>` when set.
    model: Option<String>,
    /// Display name reported by `model_name`.
    display_name: String,
    /// Compiled usage-limit classification patterns.
    usage_limit_patterns: RegexSet,
    /// Per-invocation deadline.
    timeout: Option<Duration>,
}

impl CliBackendClient {
    /// Build a client from a backend spec.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec has no command or a usage-limit
    /// pattern fails to compile.
    pub fn from_spec(spec: &BackendSpec, project_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        if spec.command.is_empty() {
            return Err(anyhow!("backend '{}' has no command configured", spec.name));
        }

        let patterns: Vec<String> = if spec.usage_limit_patterns.is_empty() {
            DEFAULT_USAGE_LIMIT_PATTERNS
                .iter()
                .map(|p| (*p).to_string())
                .collect()
        } else {
            spec.usage_limit_patterns.clone()
        };
        let usage_limit_patterns = RegexSet::new(&patterns)?;

        let display_name = spec
            .model
            .clone()
            .unwrap_or_else(|| spec.command[0].clone());

        Ok(Self {
            project_dir: project_dir.into(),
            command: spec.command.clone(),
            model: spec.model.clone(),
            display_name,
            usage_limit_patterns,
            timeout: spec.timeout_seconds.map(Duration::from_secs_f64),
        })
    }

    fn classify_failure(&self, exit_code: i32, stdout: &str, stderr: &str) -> InvokeError {
        let combined = format!("{stdout}\n{stderr}");
        if self.usage_limit_patterns.is_match(&combined) {
            let detail = stderr
                .lines()
                .chain(stdout.lines())
                .find(|l| !l.trim().is_empty())
                .unwrap_or("provider reported a usage limit");
            return InvokeError::usage_limit(detail.trim());
        }

        let detail = if stderr.trim().is_empty() {
            stdout.trim()
        } else {
            stderr.trim()
        };
        InvokeError::Other(anyhow!(
            "backend process exited with code {exit_code}: {detail}"
        ))
    }

    async fn run_process(&self, prompt: &str) -> Result<std::process::Output, InvokeError> {
        let mut args = self.command[1..].to_vec();
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        debug!(
            "invoking backend command {} ({} chars prompt)",
            self.command[0],
            prompt.len()
        );

        let mut child = AsyncCommand::new(&self.command[0])
            .args(&args)
            .current_dir(&self.project_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| InvokeError::Other(anyhow!("failed to spawn {}: {e}", self.command[0])))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| InvokeError::Other(anyhow!("failed to write prompt: {e}")))?;
            stdin
                .flush()
                .await
                .map_err(|e| InvokeError::Other(anyhow!("failed to flush prompt: {e}")))?;
            drop(stdin);
        }

        let waited = child.wait_with_output();
        let output = match self.timeout {
            Some(deadline) => tokio::time::timeout(deadline, waited).await.map_err(|_| {
                InvokeError::timeout(format!(
                    "{} exceeded {}s deadline",
                    self.command[0],
                    deadline.as_secs_f64()
                ))
            })?,
            None => waited.await,
        }
        .map_err(|e| InvokeError::Other(anyhow!("backend process failed: {e}")))?;

        Ok(output)
    }
}

#[async_trait]
impl BackendClient for CliBackendClient {
    async fn invoke(&self, prompt: &str) -> Result<String, InvokeError> {
        let output = self.run_process(prompt).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            Ok(stdout)
        } else {
            Err(self.classify_failure(output.status.code().unwrap_or(-1), &stdout, &stderr))
        }
    }

    fn model_name(&self) -> &str {
        &self.display_name
    }
}

// =============================================================================
// Mock client
// =============================================================================

/// One scripted reply for [`MockBackendClient`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Successful response text.
    Reply(String),
    /// A usage-limit failure.
    UsageLimit(String),
    /// A timeout failure.
    Timeout(String),
    /// Any other failure.
    Fail(String),
}

/// Mock backend client for testing.
///
/// Replies are either scripted (consumed in order) or a fixed fallback
/// response. Thread-safe; counts invocations, model switches, and
/// closes so tests can assert on rotation behavior.
///
/// # Example
///
/// ```rust,ignore
/// let client = MockBackendClient::new()
///     .with_response("done")
///     .with_model_name("mock-model");
///
/// assert_eq!(client.invoke("hi").await.unwrap(), "done");
/// assert_eq!(client.call_count(), 1);
/// ```
pub struct MockBackendClient {
    /// Scripted replies, consumed front-to-back before `response`.
    script: Mutex<VecDeque<ScriptedReply>>,
    /// Fallback response once the script is exhausted.
    response: String,
    /// Permanent failure mode, if set.
    permanent_error: Option<ScriptedReply>,
    /// Model name to report.
    model: String,
    /// Prompts received, in order.
    prompts: Mutex<Vec<String>>,
    /// Count of invoke calls.
    call_count: AtomicU32,
    /// Count of switch_to_default_model calls.
    switch_count: AtomicU32,
    /// Count of close calls.
    close_count: AtomicU32,
}

impl Default for MockBackendClient {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            response: String::new(),
            permanent_error: None,
            model: "mock-backend".to_string(),
            prompts: Mutex::new(Vec::new()),
            call_count: AtomicU32::new(0),
            switch_count: AtomicU32::new(0),
            close_count: AtomicU32::new(0),
        }
    }
}

impl MockBackendClient {
    /// Create a new mock with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback response.
    #[must_use]
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Set the model name.
    #[must_use]
    pub fn with_model_name(mut self, name: &str) -> Self {
        self.model = name.to_string();
        self
    }

    /// Queue scripted replies, consumed before the fallback response.
    #[must_use]
    pub fn with_script(self, replies: Vec<ScriptedReply>) -> Self {
        self.script.lock().unwrap().extend(replies);
        self
    }

    /// Fail the first `count` calls with a usage-limit error, then fall
    /// back to the configured response.
    #[must_use]
    pub fn with_usage_limit_failures(self, count: u32, message: &str) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            for _ in 0..count {
                script.push_back(ScriptedReply::UsageLimit(message.to_string()));
            }
        }
        self
    }

    /// Fail every call with a usage-limit error.
    #[must_use]
    pub fn always_usage_limit(mut self, message: &str) -> Self {
        self.permanent_error = Some(ScriptedReply::UsageLimit(message.to_string()));
        self
    }

    /// Fail every call with a timeout error.
    #[must_use]
    pub fn always_timeout(mut self, message: &str) -> Self {
        self.permanent_error = Some(ScriptedReply::Timeout(message.to_string()));
        self
    }

    /// Fail every call with a generic error.
    #[must_use]
    pub fn always_fail(mut self, message: &str) -> Self {
        self.permanent_error = Some(ScriptedReply::Fail(message.to_string()));
        self
    }

    /// Number of invoke calls received.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Number of switch_to_default_model calls received.
    pub fn switch_count(&self) -> u32 {
        self.switch_count.load(Ordering::SeqCst)
    }

    /// Number of close calls received.
    pub fn close_count(&self) -> u32 {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn reply_to_result(reply: ScriptedReply) -> Result<String, InvokeError> {
        match reply {
            ScriptedReply::Reply(text) => Ok(text),
            ScriptedReply::UsageLimit(msg) => Err(InvokeError::usage_limit(msg)),
            ScriptedReply::Timeout(msg) => Err(InvokeError::timeout(msg)),
            ScriptedReply::Fail(msg) => Err(InvokeError::Other(anyhow!("{msg}"))),
        }
    }
}

#[async_trait]
impl BackendClient for MockBackendClient {
    async fn invoke(&self, prompt: &str) -> Result<String, InvokeError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());

        if let Some(reply) = self.script.lock().unwrap().pop_front() {
            return Self::reply_to_result(reply);
        }

        if let Some(error) = &self.permanent_error {
            return Self::reply_to_result(error.clone());
        }

        Ok(self.response.clone())
    }

    async fn switch_to_default_model(&self) -> Result<(), InvokeError> {
        self.switch_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
