//! Async git command runner.
//!
//! Everything goes through the `git` CLI. Commands that mutate the shared
//! repository (worktree bookkeeping, branch deletion, merges into the
//! integration branch) take the repository mutex so that only one runs at a
//! time.

pub mod merge;
pub mod worktree;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, MutexGuard};

pub use merge::{MergeAttempt, MergeStrategy};
pub use worktree::{DiffStats, Snapshot};

/// Errors from running git.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("failed to run git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {args} failed (exit {code:?}): {stderr}")]
    Failed {
        args: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("git {args} timed out after {timeout:?}")]
    Timeout { args: String, timeout: Duration },
}

/// Captured output of a git command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle on one repository. Cheap to clone; clones share the mutex.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
    timeout: Duration,
    identity: Option<(String, String)>,
    mutex: Arc<Mutex<()>>,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
            identity: None,
            mutex: Arc::new(Mutex::new(())),
        }
    }

    /// Commit as this author instead of the repository's configured identity.
    pub fn with_identity(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.identity = Some((name.into(), email.into()));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serialize mutations of the shared repository.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().await
    }

    /// Run git in `dir`, failing on a non-zero exit.
    pub async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let output = self.run_unchecked(dir, args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(GitError::Failed {
                args: args.join(" "),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Run git in `dir` and return its output whatever the exit status.
    pub async fn run_unchecked(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let mut command = Command::new("git");
        if let Some((name, email)) = self.identity.as_ref() {
            command
                .arg("-c")
                .arg(format!("user.name={}", name))
                .arg("-c")
                .arg(format!("user.email={}", email));
        }
        command
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::trace!(dir = %dir.display(), args = %args.join(" "), "Running git");
        let child = command.spawn().map_err(|source| GitError::Spawn {
            args: args.join(" "),
            source,
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(GitError::Spawn {
                    args: args.join(" "),
                    source,
                })
            }
            Err(_) => {
                return Err(GitError::Timeout {
                    args: args.join(" "),
                    timeout: self.timeout,
                })
            }
        };

        Ok(GitOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    pub async fn is_repository(&self) -> bool {
        self.run(&self.root, &["rev-parse", "--is-inside-work-tree"])
            .await
            .map(|output| output.stdout.trim() == "true")
            .unwrap_or(false)
    }

    /// Name of the checked-out branch, or `None` when HEAD is detached.
    pub async fn current_branch(&self) -> Result<Option<String>, GitError> {
        let output = self
            .run_unchecked(&self.root, &["symbolic-ref", "--quiet", "--short", "HEAD"])
            .await?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Resolve a revision to a commit id.
    pub async fn rev_parse(&self, dir: &Path, rev: &str) -> Result<String, GitError> {
        let output = self
            .run(dir, &["rev-parse", "--verify", &format!("{}^{{commit}}", rev)])
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Paths with uncommitted changes in `dir`, including untracked files.
    pub async fn dirty_files(&self, dir: &Path) -> Result<Vec<String>, GitError> {
        let output = self
            .run(dir, &["status", "--porcelain", "--untracked-files=all"])
            .await?;
        Ok(parse_porcelain(&output.stdout)
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let output = self
            .run_unchecked(
                &self.root,
                &["show-ref", "--verify", "--quiet", &format!("refs/heads/{}", branch)],
            )
            .await?;
        Ok(output.success())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        self.run(&self.root, &["branch", "-D", branch]).await?;
        Ok(())
    }
}

/// Parse `git status --porcelain` into (status code, path) pairs.
pub fn parse_porcelain(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let code = line[..2].to_string();
            let mut path = line[3..].to_string();
            if let Some((_, renamed_to)) = path.split_once(" -> ") {
                path = renamed_to.to_string();
            }
            (code, path.trim_matches('"').to_string())
        })
        .collect()
}
