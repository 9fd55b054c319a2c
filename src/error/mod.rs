//! Error types shared across the conductor.
//!
//! Component errors (`LockError`, `GovernorError`, `GitError`, `AgentError`)
//! live next to the component that raises them. This module holds the
//! structural errors that abort a run before any work starts and the
//! top-level `ConductorError` returned by the coordinator and the CLI.

pub mod classification;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::git::GitError;

pub use classification::{error_category_label, Classify, ErrorCategory};

/// Problems with the goal set itself. Fatal: nothing is spawned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    /// The `requires` relation contains a cycle.
    #[error("dependency cycle between goals: {}", cycle.join(" -> "))]
    Cycle {
        /// Goal ids participating in the cycle.
        cycle: Vec<String>,
    },

    /// A goal requires an id that is not part of the goal set.
    #[error("goal '{goal}' requires unknown goal '{missing}'")]
    UnresolvedDependency { goal: String, missing: String },

    /// Two goals share the same id.
    #[error("duplicate goal id '{0}'")]
    DuplicateGoal(String),

    /// A goal has an empty or whitespace-only id.
    #[error("goal at position {0} has an empty id")]
    EmptyGoalId(usize),

    /// A declared path is not a valid glob pattern.
    #[error("goal '{goal}' declares invalid path pattern '{pattern}': {message}")]
    InvalidPattern {
        goal: String,
        pattern: String,
        message: String,
    },
}

/// Top-level error for coordinator setup and CLI commands.
///
/// Worker failures and merge conflicts are never reported through this type;
/// they are outcomes recorded in the run result.
#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("invalid goal set: {0}")]
    Structural(#[from] StructuralError),

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("failed to load goals from {}: {message}", path.display())]
    GoalFile { path: PathBuf, message: String },

    #[error("{} is not inside a git repository", .0.display())]
    NotARepository(PathBuf),

    #[error("Working directory not clean. Commit or stash changes first ({} changed: {})", files.len(), files.join(", "))]
    DirtyWorkingTree { files: Vec<String> },

    #[error("expected integration branch '{expected}' to be checked out, found '{actual}'")]
    WrongBranch { expected: String, actual: String },

    #[error("HEAD is detached; check out the integration branch first")]
    DetachedHead,

    #[error("unknown worker '{0}'")]
    UnknownWorker(String),

    #[error("no agent command configured (set [agent].command in .ralph/conductor.toml)")]
    NoAgentConfigured,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for coordinator and CLI operations.
pub type ConductorResult<T> = Result<T, ConductorError>;
