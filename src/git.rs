//! Git operations for the repair loop.
//!
//! The repair loop only needs three operations: stage everything,
//! commit, push. They are abstracted behind [`GitOperations`] so loop
//! logic can be tested without real repositories; [`GitCli`] is the
//! production implementation, shelling out to the `git` binary the
//! same way the rest of the crate shells out to external tools.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

use crate::error::{MendError, Result};

/// Captured outcome of one git subprocess.
#[derive(Debug, Clone)]
pub struct GitCommandResult {
    /// Whether git exited zero.
    pub success: bool,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl GitCommandResult {
    /// A successful result, for tests and defaults.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given stderr.
    #[must_use]
    pub fn failed(stderr: &str) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Abstraction for the VCS operations the repair loop performs.
#[async_trait]
pub trait GitOperations: Send + Sync {
    /// Stage all changes in the working tree.
    ///
    /// # Errors
    ///
    /// Returns an error only when git cannot be executed at all.
    async fn stage_all(&self) -> Result<GitCommandResult>;

    /// Commit staged changes with the given message.
    ///
    /// Implementations may retry internally, e.g. when a pre-commit
    /// hook reformats files.
    ///
    /// # Errors
    ///
    /// Returns an error only when git cannot be executed at all.
    async fn commit(&self, message: &str) -> Result<GitCommandResult>;

    /// Push the current branch.
    ///
    /// # Errors
    ///
    /// Returns an error only when git cannot be executed at all.
    async fn push(&self) -> Result<GitCommandResult>;
}

/// Default number of commit attempts before giving up.
const DEFAULT_COMMIT_RETRIES: u32 = 2;

/// `git` subprocess implementation of [`GitOperations`].
pub struct GitCli {
    project_dir: PathBuf,
    /// Remote to push to; `None` uses the branch's upstream.
    remote: Option<String>,
    /// Branch to push; `None` uses the current branch.
    branch: Option<String>,
    /// Additional commit attempts after the first failure.
    commit_retries: u32,
}

impl GitCli {
    /// Create a git adapter rooted at the given project directory.
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            remote: None,
            branch: None,
            commit_retries: DEFAULT_COMMIT_RETRIES,
        }
    }

    /// Push to an explicit remote and branch instead of the upstream.
    #[must_use]
    pub fn with_push_target(mut self, remote: &str, branch: &str) -> Self {
        self.remote = Some(remote.to_string());
        self.branch = Some(branch.to_string());
        self
    }

    /// Set the number of commit retries.
    #[must_use]
    pub fn with_commit_retries(mut self, retries: u32) -> Self {
        self.commit_retries = retries;
        self
    }

    async fn run_git(&self, args: &[&str]) -> Result<GitCommandResult> {
        debug!("git {}", args.join(" "));
        let output = AsyncCommand::new("git")
            .args(args)
            .current_dir(&self.project_dir)
            .output()
            .await
            .map_err(|e| MendError::git(args.first().copied().unwrap_or("git"), e.to_string()))?;

        Ok(GitCommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// A hook that reformatted files leaves the commit failing with a
    /// dirty tree; re-staging and retrying picks the new content up.
    fn is_retryable_commit_failure(result: &GitCommandResult) -> bool {
        let combined = format!("{}\n{}", result.stdout, result.stderr).to_lowercase();
        combined.contains("files were modified")
            || combined.contains("hook")
            || combined.contains("changes not staged")
    }
}

#[async_trait]
impl GitOperations for GitCli {
    async fn stage_all(&self) -> Result<GitCommandResult> {
        self.run_git(&["add", "-A"]).await
    }

    async fn commit(&self, message: &str) -> Result<GitCommandResult> {
        let mut last = self.run_git(&["commit", "-m", message]).await?;
        let mut attempts_left = self.commit_retries;

        while !last.success && attempts_left > 0 && Self::is_retryable_commit_failure(&last) {
            warn!(
                "commit failed, re-staging and retrying ({attempts_left} attempts left): {}",
                last.stderr.trim()
            );
            attempts_left -= 1;
            let staged = self.stage_all().await?;
            if !staged.success {
                return Ok(staged);
            }
            last = self.run_git(&["commit", "-m", message]).await?;
        }

        Ok(last)
    }

    async fn push(&self) -> Result<GitCommandResult> {
        match (&self.remote, &self.branch) {
            (Some(remote), Some(branch)) => self.run_git(&["push", remote, branch]).await,
            _ => self.run_git(&["push"]).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_repo(temp: &TempDir) -> GitCli {
        let git = GitCli::new(temp.path());
        git.run_git(&["init", "-q"]).await.unwrap();
        git.run_git(&["config", "user.email", "mend@example.com"])
            .await
            .unwrap();
        git.run_git(&["config", "user.name", "mend"]).await.unwrap();
        git
    }

    #[test]
    fn test_git_command_result_constructors() {
        assert!(GitCommandResult::ok().success);
        let failed = GitCommandResult::failed("remote rejected");
        assert!(!failed.success);
        assert_eq!(failed.stderr, "remote rejected");
    }

    #[test]
    fn test_retryable_commit_failure_detection() {
        let hook = GitCommandResult::failed("pre-commit hook modified files");
        assert!(GitCli::is_retryable_commit_failure(&hook));

        let dirty = GitCommandResult::failed("changes not staged for commit");
        assert!(GitCli::is_retryable_commit_failure(&dirty));

        let other = GitCommandResult::failed("fatal: not a git repository");
        assert!(!GitCli::is_retryable_commit_failure(&other));
    }

    #[tokio::test]
    async fn test_stage_and_commit_in_fresh_repo() {
        let temp = TempDir::new().unwrap();
        let git = init_repo(&temp).await;

        std::fs::write(temp.path().join("fix.txt"), "patched").unwrap();
        let staged = git.stage_all().await.unwrap();
        assert!(staged.success, "stage failed: {}", staged.stderr);

        let committed = git.commit("mend: test commit").await.unwrap();
        assert!(committed.success, "commit failed: {}", committed.stderr);
    }

    #[tokio::test]
    async fn test_commit_with_nothing_staged_fails_cleanly() {
        let temp = TempDir::new().unwrap();
        let git = init_repo(&temp).await;

        // First commit so the tree is clean (not an unborn branch edge).
        std::fs::write(temp.path().join("a.txt"), "a").unwrap();
        git.stage_all().await.unwrap();
        git.commit("mend: initial").await.unwrap();

        let result = git.commit("mend: empty").await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_push_without_remote_fails_cleanly() {
        let temp = TempDir::new().unwrap();
        let git = init_repo(&temp).await;

        std::fs::write(temp.path().join("a.txt"), "a").unwrap();
        git.stage_all().await.unwrap();
        git.commit("mend: initial").await.unwrap();

        let pushed = git.push().await.unwrap();
        assert!(!pushed.success);
        assert!(!pushed.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_git_outside_repository_reports_failure() {
        let temp = TempDir::new().unwrap();
        let git = GitCli::new(temp.path());
        let result = git.stage_all().await.unwrap();
        assert!(!result.success);
        assert!(result.stderr.to_lowercase().contains("not a git repository"));
    }
}
