//! Iterative test-repair loop.
//!
//! The [`RepairLoop`](manager::RepairLoop) drives test-execution,
//! fix-request, re-test, and commit-or-retry cycles until the suite
//! passes or the attempt budget runs out; [`state`] holds the session
//! state types it mutates along the way.

pub mod manager;
pub mod state;

pub use manager::{RepairLoop, RepairLoopConfig, SIGNIFICANCE_THRESHOLD};
pub use state::{FixAttempt, RepairOutcome, RepairState};
