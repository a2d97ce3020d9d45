//! Replanner (spec §4.7): classifies a failed tool invocation and decides
//! how the Executor should recover from it.

use std::collections::HashMap;

use crate::types::ToolResultError;

/// Coarse failure category a tool result error is sorted into before a
/// recovery action is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// Likely transient: a network call inside the handler failed.
    Network,
    /// The invocation was denied by policy or a human.
    Permission,
    /// The input itself was invalid; retrying won't help.
    Validation,
    /// The handler ran out of time.
    Timeout,
    /// The requested tool doesn't exist.
    NotFound,
    /// Doesn't fit any of the above.
    Unknown,
}

/// What the Executor should do next after a step fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry the same step with the same tool.
    Retry,
    /// Retry the step, but substitute a different tool id.
    Alternative(String),
    /// Route the step through human approval before retrying.
    Approval,
    /// Give up; the owning task transitions to FAILED.
    Abort,
}

/// Classifies failures and picks recovery actions, bounding the number of
/// retries any single logical step may accumulate (spec §4.7: default 3).
#[derive(Debug, Clone)]
pub struct Replanner {
    max_retries: u32,
    substitutions: HashMap<String, String>,
}

impl Default for Replanner {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Replanner {
    /// Build a replanner with a bounded retry budget and the default
    /// tool-substitution table (spec §4.7 ALTERNATIVE action).
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            substitutions: HashMap::from([
                ("fs.read".to_string(), "fs.read_fallback".to_string()),
                ("system.run".to_string(), "system.run_sandboxed".to_string()),
            ]),
        }
    }

    /// Register (or overwrite) a substitute tool id used for the ALTERNATIVE
    /// recovery action.
    pub fn set_substitution(&mut self, tool_id: impl Into<String>, alternative: impl Into<String>) {
        self.substitutions.insert(tool_id.into(), alternative.into());
    }

    /// Sort a tool result error into a [`FailureCategory`].
    pub fn categorize(&self, error: &ToolResultError) -> FailureCategory {
        let message = error.message.to_lowercase();
        match error.code.as_str() {
            "TOOL_NOT_FOUND" => FailureCategory::NotFound,
            "INVALID_INPUT" => FailureCategory::Validation,
            "APPROVAL_DENIED" => FailureCategory::Permission,
            _ if message.contains("timed out") || message.contains("timeout") => FailureCategory::Timeout,
            _ if message.contains("network") || message.contains("connection") || message.contains("dns") => {
                FailureCategory::Network
            }
            _ => FailureCategory::Unknown,
        }
    }

    /// Decide the recovery action for a step that has failed `retry_count`
    /// times so far (not counting this failure).
    pub fn recover(&self, tool_id: &str, error: &ToolResultError, retry_count: u32) -> RecoveryAction {
        if retry_count >= self.max_retries {
            return RecoveryAction::Abort;
        }

        match self.categorize(error) {
            FailureCategory::Network | FailureCategory::Timeout => RecoveryAction::Retry,
            FailureCategory::Permission => RecoveryAction::Approval,
            FailureCategory::Validation => RecoveryAction::Abort,
            FailureCategory::NotFound | FailureCategory::Unknown => self
                .substitutions
                .get(tool_id)
                .map(|alt| RecoveryAction::Alternative(alt.clone()))
                .unwrap_or(RecoveryAction::Retry),
        }
    }
}
