//! Worker snapshots: one git worktree and branch per goal.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{GitError, GitRepo};

/// A private checkout for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Worktree directory.
    pub path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
    /// Integration-branch commit the snapshot started from.
    pub base_commit: String,
}

/// Files and line counts changed between two commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files: Vec<String>,
    pub lines_added: u64,
    pub lines_removed: u64,
}

/// Hex digits of the id digest appended to rewritten slugs.
const SLUG_DIGEST_LEN: usize = 8;

/// Make a goal id safe for branch names and directory names.
///
/// Ids that are already safe are used as they are. Any id that had to be
/// rewritten gets a short digest of the raw id appended, so two ids that
/// rewrite to the same text (`a/b`, `a b`) still get distinct slugs.
pub fn slug(id: &str) -> String {
    let mapped: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut base = mapped.replace("..", "-");
    if base.ends_with(".lock") {
        base.truncate(base.len() - ".lock".len());
    }
    let base = base.trim_matches(|c| c == '.' || c == '-');
    if !base.is_empty() && base == id {
        return base.to_string();
    }

    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    let digest = &digest[..SLUG_DIGEST_LEN];
    if base.is_empty() {
        format!("goal-{}", digest)
    } else {
        format!("{}-{}", base, digest)
    }
}

impl GitRepo {
    /// Create a worktree at `path` on a new `branch` starting at `base_commit`.
    ///
    /// Leftovers from an earlier crashed run (same path or branch) are
    /// removed first.
    pub async fn create_snapshot(
        &self,
        path: &Path,
        branch: &str,
        base_commit: &str,
    ) -> Result<Snapshot, GitError> {
        let _guard = self.lock().await;
        self.clear_snapshot_locked(path, Some(branch)).await;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GitError::Spawn {
                args: "worktree add".to_string(),
                source,
            })?;
        }
        let path_arg = path.to_string_lossy().into_owned();
        self.run(
            self.root(),
            &["worktree", "add", "-q", "-b", branch, &path_arg, base_commit],
        )
        .await?;

        tracing::debug!(branch, path = %path.display(), base = base_commit, "Created worker snapshot");
        Ok(Snapshot {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            base_commit: base_commit.to_string(),
        })
    }

    /// Stage everything in the snapshot and commit it.
    ///
    /// Returns `None` when there was nothing to commit.
    pub async fn commit_all(
        &self,
        snapshot: &Snapshot,
        message: &str,
    ) -> Result<Option<String>, GitError> {
        let _guard = self.lock().await;
        self.run(&snapshot.path, &["add", "-A"]).await?;
        let staged = self
            .run_unchecked(&snapshot.path, &["diff", "--cached", "--quiet"])
            .await?;
        if staged.success() {
            return Ok(None);
        }
        self.run(&snapshot.path, &["commit", "-q", "--no-verify", "-m", message])
            .await?;
        let commit = self.rev_parse(&snapshot.path, "HEAD").await?;
        Ok(Some(commit))
    }

    /// Numstat diff between two revisions, evaluated in `dir`.
    pub async fn diff_stats(&self, dir: &Path, from: &str, to: &str) -> Result<DiffStats, GitError> {
        let range = format!("{}..{}", from, to);
        let output = self
            .run(dir, &["diff", "--numstat", "--no-renames", &range])
            .await?;
        Ok(parse_numstat(&output.stdout))
    }

    /// Remove the worktree and, if `delete_branch`, its branch.
    ///
    /// Never fails: a half-removed snapshot is logged and pruned.
    pub async fn remove_snapshot(&self, snapshot: &Snapshot, delete_branch: bool) {
        let _guard = self.lock().await;
        let branch = delete_branch.then_some(snapshot.branch.as_str());
        self.clear_snapshot_locked(&snapshot.path, branch).await;
    }

    async fn clear_snapshot_locked(&self, path: &Path, branch: Option<&str>) {
        let path_arg = path.to_string_lossy().into_owned();
        if path.exists() {
            let removed = self
                .run_unchecked(self.root(), &["worktree", "remove", "--force", &path_arg])
                .await;
            if !matches!(removed, Ok(ref output) if output.success()) {
                if let Err(err) = std::fs::remove_dir_all(path) {
                    tracing::warn!(path = %path.display(), error = %err, "Failed to remove worktree directory");
                }
            }
        }
        let _ = self.run_unchecked(self.root(), &["worktree", "prune"]).await;

        if let Some(branch) = branch {
            if matches!(self.branch_exists(branch).await, Ok(true)) {
                if let Err(err) = self.delete_branch(branch).await {
                    tracing::warn!(branch, error = %err, "Failed to delete worker branch");
                }
            }
        }
    }
}

/// Parse `git diff --numstat`. Binary files count as touched with no lines.
pub fn parse_numstat(stdout: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in stdout.lines() {
        let mut fields = line.splitn(3, '\t');
        let (Some(added), Some(removed), Some(path)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        stats.lines_added += added.parse::<u64>().unwrap_or(0);
        stats.lines_removed += removed.parse::<u64>().unwrap_or(0);
        stats.files.push(path.to_string());
    }
    stats.files.sort();
    stats
}
