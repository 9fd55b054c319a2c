//! Folding committed worker branches back into the integration branch.
//!
//! The coordinator's merge step is the only writer of the integration
//! branch. Each committed result is merged on its own; a conflict is captured
//! with its diff, the merge is aborted, and the next result is tried.

use serde::{Deserialize, Serialize};

use crate::git::{GitError, GitRepo, MergeAttempt, MergeStrategy};
use crate::goal::Goal;

use super::worker::{WorkerOutcome, WorkerStatus};

/// Result of reconciling one worker outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Merged. `commit` is `None` when the goal changed nothing.
    Clean { commit: Option<String> },
    /// The merge conflicted and was aborted. The branch is kept so a human
    /// can resolve it.
    Conflicted {
        files: Vec<String>,
        diff: String,
        branch: String,
    },
    /// The worker did not commit; nothing was merged.
    Discarded { reason: String },
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, MergeOutcome::Clean { .. })
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            MergeOutcome::Clean { .. } => "clean",
            MergeOutcome::Conflicted { .. } => "conflicted",
            MergeOutcome::Discarded { .. } => "discarded",
        }
    }
}

/// Merges worker branches into the branch checked out at the repository root.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    repo: GitRepo,
    strategy: MergeStrategy,
    cleanup_branches: bool,
}

impl ReconciliationEngine {
    pub fn new(repo: GitRepo, strategy: MergeStrategy) -> Self {
        Self {
            repo,
            strategy,
            cleanup_branches: true,
        }
    }

    pub fn with_cleanup_branches(mut self, cleanup: bool) -> Self {
        self.cleanup_branches = cleanup;
        self
    }

    pub async fn reconcile(
        &self,
        goal: &Goal,
        outcome: &WorkerOutcome,
    ) -> Result<MergeOutcome, GitError> {
        let branch = outcome.result.workspace_ref.as_str();

        if outcome.status != WorkerStatus::Committed {
            let reason = outcome
                .result
                .failure_reason
                .clone()
                .unwrap_or_else(|| outcome.status.as_label().to_string());
            return Ok(MergeOutcome::Discarded { reason });
        }

        if outcome.result.commit.is_none() {
            self.cleanup(branch).await;
            return Ok(MergeOutcome::Clean { commit: None });
        }

        let message = format!("Merge goal {}: {}", goal.id, goal.title);
        match self
            .repo
            .merge_branch(branch, message.trim(), self.strategy)
            .await?
        {
            MergeAttempt::Merged { commit } => {
                tracing::info!(goal_id = %goal.id, branch, commit = %commit, "Goal merged");
                self.cleanup(branch).await;
                Ok(MergeOutcome::Clean {
                    commit: Some(commit),
                })
            }
            MergeAttempt::Conflicted { files, diff } => {
                tracing::warn!(goal_id = %goal.id, branch, files = ?files, "Goal merge conflicted");
                Ok(MergeOutcome::Conflicted {
                    files,
                    diff,
                    branch: branch.to_string(),
                })
            }
        }
    }

    async fn cleanup(&self, branch: &str) {
        if !self.cleanup_branches {
            return;
        }
        let _guard = self.repo.lock().await;
        if matches!(self.repo.branch_exists(branch).await, Ok(true)) {
            if let Err(err) = self.repo.delete_branch(branch).await {
                tracing::warn!(branch, error = %err, "Failed to delete merged branch");
            }
        }
    }
}
