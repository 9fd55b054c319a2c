//! Parallel goal coordination for coding agents.
//!
//! The conductor takes a set of goals with approximate file footprints,
//! schedules them into conflict-free waves, runs each goal in an isolated git
//! worktree through an external agent loop, and merges the results back into
//! a single integration branch.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod git;
pub mod goal;
pub mod governor;
pub mod layout;
pub mod locks;
pub mod metrics;
pub mod parallel;
pub mod status;
pub mod timeout;
pub mod ui;

pub use agent::{AgentError, AgentLoop, CommandAgent, FileEdit, WorkspaceContext};
pub use config::ConductorConfig;
pub use error::{ConductorError, ConductorResult, StructuralError};
pub use goal::Goal;
pub use parallel::dependency::{DependencyGraph, Schedule, Wave};
pub use parallel::reconcile::MergeOutcome;
pub use parallel::scheduler::{Coordinator, CoordinatorConfig, CoordinatorResult, GoalStatus};
pub use parallel::worker::{WorkerResult, WorkerStatus};
