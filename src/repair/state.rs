//! Repair loop state types.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::testexec::TestRunResult;

/// One fix request's outcome, as recorded in the loop history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAttempt {
    /// Single-line description of what was attempted.
    pub summary: String,
    /// Verbatim backend output, or `None` when the call was skipped
    /// (dry run or no actionable error).
    pub raw_response: Option<String>,
    /// Backend that served (or would have served) the request.
    pub backend: String,
    /// Model the backend reported.
    pub model: String,
}

/// Mutable state of one repair session.
///
/// Created at loop start, mutated every iteration, discarded at loop
/// exit; callers receive a [`RepairOutcome`] summary instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairState {
    /// Fix attempts made so far.
    pub attempts: u32,
    /// Whether the suite ended up passing.
    pub success: bool,
    /// Ordered human-readable progress messages.
    pub messages: Vec<String>,
    /// Post-fix result carried into the next iteration instead of
    /// re-running tests.
    pub cached_test_result: Option<TestRunResult>,
    /// Test file the loop is currently focused on.
    pub current_test_file: Option<String>,
    /// Unique session identifier.
    pub session_id: String,
    /// When the session started (unix seconds).
    pub started_at: i64,
}

impl RepairState {
    /// Create fresh state for a new session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempts: 0,
            success: false,
            messages: Vec::new(),
            cached_test_result: None,
            current_test_file: None,
            session_id: Uuid::new_v4().to_string(),
            started_at: Utc::now().timestamp(),
        }
    }

    /// Record a progress message.
    pub fn record(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Summarize this state for the caller.
    #[must_use]
    pub fn outcome(&self) -> RepairOutcome {
        RepairOutcome {
            success: self.success,
            attempts: self.attempts,
            messages: self.messages.clone(),
        }
    }
}

impl Default for RepairState {
    fn default() -> Self {
        Self::new()
    }
}

/// Structured summary returned to the caller, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairOutcome {
    /// Whether the suite ended up passing (and the fix was pushed).
    pub success: bool,
    /// Number of fix attempts made.
    pub attempts: u32,
    /// Ordered progress messages for reporting partial progress.
    pub messages: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_empty() {
        let state = RepairState::new();
        assert_eq!(state.attempts, 0);
        assert!(!state.success);
        assert!(state.messages.is_empty());
        assert!(state.cached_test_result.is_none());
        assert!(state.current_test_file.is_none());
        assert!(!state.session_id.is_empty());
    }

    #[test]
    fn test_sessions_have_distinct_ids() {
        assert_ne!(RepairState::new().session_id, RepairState::new().session_id);
    }

    #[test]
    fn test_record_preserves_order() {
        let mut state = RepairState::new();
        state.record("first");
        state.record("second".to_string());
        assert_eq!(state.messages, vec!["first", "second"]);
    }

    #[test]
    fn test_outcome_snapshot() {
        let mut state = RepairState::new();
        state.attempts = 3;
        state.success = true;
        state.record("done");

        let outcome = state.outcome();
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.messages, vec!["done"]);
    }

    #[test]
    fn test_state_serializes() {
        let mut state = RepairState::new();
        state.cached_test_result = Some(TestRunResult::failing("out", "err"));
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("session_id"));
        assert!(json.contains("cached_test_result"));
    }
}
