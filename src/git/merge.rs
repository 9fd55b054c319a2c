//! Merging worker branches into the integration branch.

use serde::{Deserialize, Serialize};

use super::{GitError, GitRepo};

/// How a worker branch is folded into the integration branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Always create a merge commit.
    #[default]
    NoFastForward,
    /// Fast-forward when possible, otherwise a merge commit.
    FastForward,
}

impl MergeStrategy {
    fn flag(&self) -> &'static str {
        match self {
            MergeStrategy::NoFastForward => "--no-ff",
            MergeStrategy::FastForward => "--ff",
        }
    }
}

/// Result of one merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    Merged {
        commit: String,
    },
    /// The merge stopped on conflicts and was aborted; the integration
    /// branch is unchanged.
    Conflicted {
        files: Vec<String>,
        diff: String,
    },
}

impl GitRepo {
    /// Merge `branch` into the branch checked out at the repository root.
    ///
    /// On conflict the conflicting paths and the conflict diff are captured
    /// and the merge is aborted before returning.
    pub async fn merge_branch(
        &self,
        branch: &str,
        message: &str,
        strategy: MergeStrategy,
    ) -> Result<MergeAttempt, GitError> {
        let _guard = self.lock().await;
        let root = self.root().to_path_buf();

        let output = self
            .run_unchecked(
                &root,
                &["merge", strategy.flag(), "--no-edit", "-m", message, branch],
            )
            .await?;
        if output.success() {
            let commit = self.rev_parse(&root, "HEAD").await?;
            tracing::debug!(branch, commit = %commit, "Merged worker branch");
            return Ok(MergeAttempt::Merged { commit });
        }

        let conflicted = self
            .run(&root, &["diff", "--name-only", "--diff-filter=U"])
            .await
            .map(|output| {
                output
                    .stdout
                    .lines()
                    .map(str::to_string)
                    .filter(|line| !line.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let diff = self
            .run(&root, &["diff"])
            .await
            .map(|output| output.stdout)
            .unwrap_or_default();

        self.restore_after_failed_merge(branch).await?;

        if conflicted.is_empty() {
            return Err(GitError::Failed {
                args: format!("merge {} {}", strategy.flag(), branch),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        tracing::info!(branch, files = conflicted.len(), "Merge conflict; integration branch restored");
        Ok(MergeAttempt::Conflicted {
            files: conflicted,
            diff,
        })
    }

    /// Put the main checkout back on its last commit after a merge stopped.
    /// Caller holds the repository lock.
    async fn restore_after_failed_merge(&self, branch: &str) -> Result<(), GitError> {
        let root = self.root().to_path_buf();
        let aborted = self.run_unchecked(&root, &["merge", "--abort"]).await;
        if matches!(aborted, Ok(ref out) if out.success()) {
            return Ok(());
        }
        tracing::warn!(branch, "git merge --abort failed; resetting integration branch");
        if let Err(err) = self.run(&root, &["reset", "--hard", "HEAD"]).await {
            tracing::error!(
                branch,
                error = %err,
                "Could not restore the integration branch after a failed merge"
            );
            return Err(err);
        }
        Ok(())
    }
}
