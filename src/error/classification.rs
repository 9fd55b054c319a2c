//! Classification of component errors into retry categories.

use serde::{Deserialize, Serialize};

use crate::agent::AgentError;
use crate::git::GitError;
use crate::governor::GovernorError;
use crate::locks::LockError;

/// How the coordinator should react to an error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Retrying may succeed (lock contention, slot exhaustion, flaky IO).
    Transient(String),
    /// Retrying will not help; the goal fails.
    Fatal(String),
    /// A time budget was exceeded.
    Timeout(String),
}

/// Errors that can be sorted into an [`ErrorCategory`].
pub trait Classify {
    fn classify(&self) -> ErrorCategory;

    fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorCategory::Transient(_))
    }
}

/// Convert an error category into a stable label for events and metrics.
pub fn error_category_label(category: &ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Transient(_) => "transient",
        ErrorCategory::Fatal(_) => "fatal",
        ErrorCategory::Timeout(_) => "timeout",
    }
}

impl Classify for LockError {
    fn classify(&self) -> ErrorCategory {
        match self {
            LockError::Timeout { .. } => ErrorCategory::Transient(self.to_string()),
        }
    }
}

impl Classify for GovernorError {
    fn classify(&self) -> ErrorCategory {
        match self {
            GovernorError::Exhausted { .. } => ErrorCategory::Transient(self.to_string()),
            GovernorError::Cancelled { .. } | GovernorError::Closed { .. } => {
                ErrorCategory::Fatal(self.to_string())
            }
        }
    }
}

impl Classify for GitError {
    fn classify(&self) -> ErrorCategory {
        match self {
            GitError::Timeout { .. } => ErrorCategory::Timeout(self.to_string()),
            GitError::Spawn { .. } | GitError::Failed { .. } => {
                ErrorCategory::Fatal(self.to_string())
            }
        }
    }
}

impl Classify for AgentError {
    fn classify(&self) -> ErrorCategory {
        match self {
            AgentError::Io(_) => ErrorCategory::Transient(self.to_string()),
            AgentError::Git(err) => err.classify(),
            AgentError::Failed(_)
            | AgentError::Cancelled(_)
            | AgentError::LockRetriesExhausted { .. }
            | AgentError::PathEscapesWorkspace(_)
            | AgentError::ProcessFailed { .. } => ErrorCategory::Fatal(self.to_string()),
        }
    }
}
