//! Mend - Autonomous Test-Repair Agent
//!
//! A Rust-based agent that repairs a failing test suite by repeatedly
//! invoking one of several interchangeable LLM backends until the
//! tests pass, committing and pushing each piece of real progress.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backend`] - Backend client contract, rotation manager, and
//!   durable rotation state
//! - [`change`] - Change-significance estimation between text blobs
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`git`] - VCS operations (stage, commit, push)
//! - [`prompt`] - Fix and commit-message prompt construction
//! - [`repair`] - The iterative test-repair loop
//! - [`testexec`] - Test execution and error summarization
//! - [`testing`] - Testing infrastructure (mock collaborators)
//!
//! # Example
//!
//! ```rust,ignore
//! use mend::backend::rotation::RotationManager;
//! use mend::repair::{RepairLoop, RepairLoopConfig};
//!
//! let rotation = RotationManager::new("claude", default_client, backends, factories);
//! let mut repair = RepairLoop::new(rotation, runner, git, summarizer, config);
//! let outcome = repair.run().await?;
//! println!("success={} after {} attempts", outcome.success, outcome.attempts);
//! ```

pub mod backend;
pub mod change;
pub mod config;
pub mod error;
pub mod git;
pub mod prompt;
pub mod repair;
pub mod testexec;
pub mod testing;

// Re-export commonly used types
pub use error::{InvokeError, MendError, Result};

// Re-export backend types
pub use backend::rotation::{ClientFactory, RotationManager};
pub use backend::state::{RotationState, RotationStateStore};
pub use backend::{BackendClient, BackendSpec, CliBackendClient, MockBackendClient};

// Re-export core loop types
pub use change::change_fraction;
pub use config::MendConfig;
pub use repair::{FixAttempt, RepairLoop, RepairLoopConfig, RepairOutcome, SIGNIFICANCE_THRESHOLD};
pub use testexec::{
    ErrorSummarizer, RegexSummarizer, ScriptTestRunner, TestRunResult, TestRunner,
};

// Re-export VCS types
pub use git::{GitCli, GitCommandResult, GitOperations};
