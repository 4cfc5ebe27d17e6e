//! Testing infrastructure: mock collaborators.
//!
//! These mocks provide controllable test doubles for the repair loop's
//! external dependencies, enabling deterministic unit and integration
//! tests without real test suites, git repositories, or LLM backends.
//! (The backend mock lives next to its trait in [`crate::backend`].)

pub mod mocks;

pub use mocks::{MockGitOperations, MockTestRunner, StaticSummarizer};
