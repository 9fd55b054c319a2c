//! Agent loop backed by an external command.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::AgentSettings;
use crate::goal::{literal_base, Goal};

use super::{AgentError, AgentLoop, FileEdit, WorkspaceContext};

/// Longest stderr tail kept for error reports.
const STDERR_TAIL_BYTES: usize = 4096;

/// Runs a command inside the workspace for each goal.
///
/// The goal reaches the command through `RALPH_GOAL_ID`, `RALPH_GOAL_TITLE`,
/// `RALPH_GOAL_DESCRIPTION` and `RALPH_WORKSPACE`, and as a prompt on stdin.
/// Every line the command prints to stdout counts as a heartbeat. Edits are
/// whatever the command left uncommitted in the workspace.
///
/// A paused worker stops before the command starts and after it exits; the
/// running process itself is not suspended.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    lock_declared_paths: bool,
}

impl CommandAgent {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            lock_declared_paths: true,
        }
    }

    /// Build from the `[agent]` section, if a command is configured.
    pub fn from_settings(settings: &AgentSettings) -> Option<Self> {
        let program = settings.command.as_ref()?.trim();
        if program.is_empty() {
            return None;
        }
        Some(Self {
            program: program.to_string(),
            args: settings.args.clone(),
            env: settings.env.clone(),
            lock_declared_paths: settings.lock_declared_paths.unwrap_or(true),
        })
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_declared_path_locks(mut self, enabled: bool) -> Self {
        self.lock_declared_paths = enabled;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl AgentLoop for CommandAgent {
    async fn execute_goal(
        &self,
        goal: &Goal,
        ctx: &WorkspaceContext,
    ) -> Result<Vec<FileEdit>, AgentError> {
        ctx.checkpoint().await?;

        let footprint: Vec<String> = if self.lock_declared_paths {
            goal.declared_paths.iter().map(|path| literal_base(path)).collect()
        } else {
            Vec::new()
        };
        let _locks = ctx.lock(&footprint).await?;
        let _slot = ctx.inference_slot().await?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(ctx.workspace())
            .envs(&self.env)
            .env("RALPH_GOAL_ID", &goal.id)
            .env("RALPH_GOAL_TITLE", &goal.title)
            .env("RALPH_GOAL_DESCRIPTION", &goal.description)
            .env("RALPH_WORKSPACE", ctx.workspace())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(pid) = child.id() {
            ctx.track_process(pid);
        }
        tracing::info!(
            worker_id = %ctx.worker_id(),
            goal_id = %goal.id,
            program = %self.program,
            pid = child.id(),
            "Started agent command"
        );

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = goal.prompt();
            tokio::spawn(async move {
                // A command that ignores stdin closes the pipe early.
                let _ = stdin.write_all(prompt.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let _ = stderr.read_to_end(&mut buffer).await;
                tail(&String::from_utf8_lossy(&buffer), STDERR_TAIL_BYTES)
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    reason = ctx.cancelled() => {
                        tracing::info!(worker_id = %ctx.worker_id(), reason = reason.as_label(), "Killing agent command");
                        let _ = child.kill().await;
                        return Err(AgentError::Cancelled(reason));
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            ctx.heartbeat().pulse();
                            tracing::trace!(worker_id = %ctx.worker_id(), line = %line, "agent");
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::debug!(worker_id = %ctx.worker_id(), error = %err, "Agent stdout closed");
                            break;
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            reason = ctx.cancelled() => {
                let _ = child.kill().await;
                return Err(AgentError::Cancelled(reason));
            }
            status = child.wait() => status?,
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(AgentError::ProcessFailed {
                code: status.code(),
                stderr,
            });
        }

        ctx.checkpoint().await?;
        ctx.pending_edits().await
    }
}

fn tail(text: &str, max_bytes: usize) -> String {
    let text = text.trim();
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
