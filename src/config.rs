//! Configuration loading and validation.
//!
//! Project configuration lives in `mend.toml` at the repository root.
//! Every field has a default so a minimal file (or none at all, for
//! dry runs) still produces a working configuration; `validate()`
//! reports field-specific problems before the loop starts.
//!
//! # Example mend.toml
//!
//! ```toml
//! test_command = ["pytest", "-q"]
//! max_fix_attempts = 6.0
//! default_backend = "claude"
//!
//! [[backends]]
//! name = "claude"
//! command = ["claude", "-p", "--output-format", "text"]
//! model = "opus"
//! usage_limit_retry_count = 2
//!
//! [[backends]]
//! name = "gemini"
//! command = ["gemini", "--yolo"]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::BackendSpec;
use crate::error::{MendError, Result};

/// Default configuration filename.
pub const CONFIG_FILENAME: &str = "mend.toml";

/// Directory for mend's own state, relative to the project root.
pub const STATE_DIR: &str = ".mend";

fn default_test_command() -> Vec<String> {
    vec!["pytest".to_string(), "-q".to_string()]
}

fn default_max_fix_attempts() -> f64 {
    6.0
}

fn default_max_prompt_chars() -> usize {
    12_000
}

fn default_state_file() -> PathBuf {
    PathBuf::from(STATE_DIR).join(crate::backend::state::ROTATION_STATE_FILENAME)
}

fn default_stale_seconds() -> f64 {
    6.0 * 3600.0
}

fn default_backend_name() -> String {
    "claude".to_string()
}

fn default_commit_retries() -> u32 {
    2
}

/// Project configuration for the repair loop and backend rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MendConfig {
    /// Command that runs the test suite; a scoped file is appended as
    /// the final argument.
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,

    /// Attempt budget for the repair loop. Non-finite (`inf`) means
    /// unbounded.
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: f64,

    /// Maximum characters of test output embedded in one prompt.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,

    /// Rotation state file, relative to the project root unless
    /// absolute.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Age after which a persisted backend selection is considered
    /// stale and reset to the default.
    #[serde(default = "default_stale_seconds")]
    pub backend_stale_after_seconds: f64,

    /// Name of the default backend; first in rotation order.
    #[serde(default = "default_backend_name")]
    pub default_backend: String,

    /// Backends in rotation order.
    #[serde(default)]
    pub backends: Vec<BackendSpec>,

    /// Remote to push to; `None` uses the branch upstream.
    #[serde(default)]
    pub push_remote: Option<String>,

    /// Branch to push; `None` uses the current branch.
    #[serde(default)]
    pub push_branch: Option<String>,

    /// Commit retries for hook-mutated trees.
    #[serde(default = "default_commit_retries")]
    pub commit_retries: u32,
}

impl Default for MendConfig {
    fn default() -> Self {
        Self {
            test_command: default_test_command(),
            max_fix_attempts: default_max_fix_attempts(),
            max_prompt_chars: default_max_prompt_chars(),
            state_file: default_state_file(),
            backend_stale_after_seconds: default_stale_seconds(),
            default_backend: default_backend_name(),
            backends: Vec::new(),
            push_remote: None,
            push_branch: None,
            commit_retries: default_commit_retries(),
        }
    }
}

impl MendConfig {
    /// Load configuration from `mend.toml` in the given project
    /// directory, or defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read,
    /// parsed, or validated.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILENAME);
        if !path.exists() {
            debug!("no {CONFIG_FILENAME} found, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            MendError::config_with_path(format!("failed to read config: {e}"), path.clone())
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            MendError::config_with_path(format!("failed to parse config: {e}"), path)
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate field values and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`MendError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.test_command.is_empty() {
            return Err(MendError::invalid_config(
                "test_command",
                "must not be empty",
            ));
        }

        // NaN is rejected here; positive infinity passes and means an
        // unbounded attempt budget.
        if self.max_fix_attempts.is_nan() || self.max_fix_attempts < 0.0 {
            return Err(MendError::invalid_config(
                "max_fix_attempts",
                "must be non-negative (use inf for unbounded)",
            ));
        }

        if self.max_prompt_chars == 0 {
            return Err(MendError::invalid_config(
                "max_prompt_chars",
                "must be positive",
            ));
        }

        if self.backend_stale_after_seconds < 0.0 {
            return Err(MendError::invalid_config(
                "backend_stale_after_seconds",
                "must be non-negative",
            ));
        }

        if self.default_backend.is_empty() {
            return Err(MendError::invalid_config(
                "default_backend",
                "must not be empty",
            ));
        }

        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(MendError::invalid_config("backends.name", "must not be empty"));
            }
            if backend.usage_limit_retry_wait_seconds < 0.0 {
                return Err(MendError::invalid_config(
                    format!("backends.{}.usage_limit_retry_wait_seconds", backend.name),
                    "must be non-negative",
                ));
            }
        }

        let mut names: Vec<&str> = self.backends.iter().map(|b| b.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.backends.len() {
            return Err(MendError::invalid_config(
                "backends",
                "backend names must be unique",
            ));
        }

        Ok(())
    }

    /// Attempt budget is unbounded when configured non-finite.
    #[must_use]
    pub fn attempts_unbounded(&self) -> bool {
        !self.max_fix_attempts.is_finite()
    }

    /// Resolve the rotation state file against the project root.
    #[must_use]
    pub fn state_file_path(&self, project_dir: &Path) -> PathBuf {
        if self.state_file.is_absolute() {
            self.state_file.clone()
        } else {
            project_dir.join(&self.state_file)
        }
    }

    /// Resolve the state directory (for failure markers) against the
    /// project root.
    #[must_use]
    pub fn state_dir_path(&self, project_dir: &Path) -> PathBuf {
        self.state_file_path(project_dir)
            .parent()
            .map_or_else(|| project_dir.join(STATE_DIR), Path::to_path_buf)
    }

    /// Spec of the configured default backend, if listed.
    #[must_use]
    pub fn default_backend_spec(&self) -> Option<&BackendSpec> {
        self.backends.iter().find(|b| b.name == self.default_backend)
    }
}
