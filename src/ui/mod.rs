//! Terminal rendering for the `conductor` binary.
//!
//! Everything renders to a `String` so the binary decides where it goes and
//! tests can assert on plain text with colors turned off.

use std::fmt::Write as _;

use owo_colors::OwoColorize;

use crate::events::CoordinatorEvent;
use crate::goal::Goal;
use crate::parallel::dependency::Schedule;
use crate::parallel::reconcile::MergeOutcome;
use crate::parallel::scheduler::{CoordinatorResult, GoalStatus};
use crate::status::StatusSnapshot;

/// How many diff lines a conflict shows before truncating.
const DIFF_PREVIEW_LINES: usize = 20;

/// Renders schedules, live events, status snapshots and run results.
#[derive(Debug, Clone)]
pub struct RunDisplay {
    use_colors: bool,
    quiet: bool,
}

impl Default for RunDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl RunDisplay {
    pub fn new() -> Self {
        Self {
            use_colors: true,
            quiet: false,
        }
    }

    pub fn with_colors(mut self, use_colors: bool) -> Self {
        self.use_colors = use_colors;
        self
    }

    /// Suppress live event lines; summaries still render.
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// The wave plan, as shown by `run --dry-run`.
    pub fn render_schedule(&self, goals: &[Goal], schedule: &Schedule) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}",
            self.style_header(&format!(
                "Schedule: {} goals in {} waves",
                schedule.goal_count(),
                schedule.len()
            ))
        );
        for wave in &schedule.waves {
            let _ = writeln!(out, "  {}", self.style_header(&format!("Wave {}", wave.index)));
            for goal_id in &wave.goals {
                let goal = goals.iter().find(|goal| &goal.id == goal_id);
                let title = goal.map(|goal| goal.title.as_str()).unwrap_or("");
                let _ = write!(out, "    {} {}", goal_id, title);
                if let Some(goal) = goal.filter(|goal| !goal.requires.is_empty()) {
                    let _ = write!(
                        out,
                        " {}",
                        self.style_dim(&format!("(requires {})", goal.requires.join(", ")))
                    );
                }
                out.push('\n');
            }
        }
        if !schedule.conflicts().is_empty() {
            let _ = writeln!(out, "  {}", self.style_dim("Predicted conflicts:"));
            for conflict in schedule.conflicts() {
                let _ = writeln!(
                    out,
                    "    {} <-> {} {}",
                    conflict.first,
                    conflict.second,
                    self.style_dim(&format!("({} / {})", conflict.paths.0, conflict.paths.1))
                );
            }
        }
        out
    }

    /// One progress line for a live event, or `None` when quiet or the event
    /// is not worth a line.
    pub fn render_event(&self, event: &CoordinatorEvent) -> Option<String> {
        if self.quiet {
            return None;
        }
        let line = match event {
            CoordinatorEvent::WaveStarted { wave, goals } => self.style_header(&format!(
                "▶ Wave {} ({} goals: {})",
                wave,
                goals.len(),
                goals.join(", ")
            )),
            CoordinatorEvent::WorkerSpawned {
                worker_id,
                goal_id,
                branch,
                ..
            } => format!(
                "  {} {} {}",
                self.style_dim("spawn"),
                goal_id,
                self.style_dim(&format!("[{} on {}]", worker_id, branch))
            ),
            CoordinatorEvent::SpawnDeferred { goal_id, reason } => format!(
                "  {} {} {}",
                self.style_warn("defer"),
                goal_id,
                self.style_dim(reason)
            ),
            CoordinatorEvent::WorkerPaused { worker_id, goal_id } => format!(
                "  {} {} {}",
                self.style_warn("pause"),
                goal_id,
                self.style_dim(worker_id)
            ),
            CoordinatorEvent::WorkerResumed { worker_id, goal_id } => format!(
                "  {} {} {}",
                self.style_dim("resume"),
                goal_id,
                self.style_dim(worker_id)
            ),
            CoordinatorEvent::WorkerCompleted {
                goal_id,
                status,
                failure_reason,
                duration_ms,
                ..
            } => {
                let label = status.as_label();
                let styled = if failure_reason.is_some() {
                    self.style_error(label)
                } else {
                    self.style_success(label)
                };
                let mut line = format!(
                    "  {} {} {}",
                    styled,
                    goal_id,
                    self.style_dim(&format_duration(*duration_ms))
                );
                if let Some(reason) = failure_reason {
                    let _ = write!(line, " {}", reason);
                }
                line
            }
            CoordinatorEvent::GoalMerged { goal_id, commit } => format!(
                "  {} {} {}",
                self.style_success("merged"),
                goal_id,
                self.style_dim(&commit.as_deref().map(short_sha).unwrap_or("no changes"))
            ),
            CoordinatorEvent::MergeConflicted { goal_id, files } => format!(
                "  {} {} {}",
                self.style_error("conflict"),
                goal_id,
                files.join(", ")
            ),
            CoordinatorEvent::GoalBlocked {
                goal_id,
                blocked_by,
            } => format!(
                "  {} {} {}",
                self.style_warn("blocked"),
                goal_id,
                self.style_dim(&format!("by {}", blocked_by))
            ),
            CoordinatorEvent::RunStarted { .. }
            | CoordinatorEvent::WaveCompleted { .. }
            | CoordinatorEvent::RunCompleted { .. } => return None,
        };
        Some(line)
    }

    /// `conductor status` output.
    pub fn render_status(&self, snapshot: &StatusSnapshot) -> String {
        let mut out = String::new();
        let wave = snapshot
            .current_wave
            .map(|wave| format!("wave {} of {}", wave + 1, snapshot.total_waves))
            .unwrap_or_else(|| format!("{} waves", snapshot.total_waves));
        let _ = writeln!(
            out,
            "{} {} ({:?}, {})",
            self.style_header("Run"),
            snapshot.run_id,
            snapshot.phase,
            wave
        );
        let _ = writeln!(
            out,
            "{}",
            self.style_dim(&format!(
                "updated {}  workers {}/{}  inference {}/{}  locks {}",
                snapshot.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
                snapshot.resources.workers_in_use,
                snapshot.resources.workers_total,
                snapshot.resources.inference_in_use,
                snapshot.resources.inference_total,
                snapshot.locks.len()
            ))
        );

        let _ = writeln!(out, "{}", self.style_header("Goals"));
        for goal in &snapshot.goals {
            let _ = write!(
                out,
                "  {:<12} {} {}",
                goal.goal_id,
                self.style_status(goal.status),
                goal.title
            );
            if let Some(worker_id) = goal.worker_id.as_deref() {
                let _ = write!(out, " {}", self.style_dim(&format!("[{}]", worker_id)));
            }
            if let Some(reason) = goal.failure_reason.as_deref() {
                let _ = write!(out, " {}", self.style_dim(reason));
            }
            out.push('\n');
        }

        let live: Vec<_> = snapshot
            .workers
            .iter()
            .filter(|worker| !worker.status.is_terminal())
            .collect();
        if !live.is_empty() {
            let _ = writeln!(out, "{}", self.style_header("Workers"));
            for worker in live {
                let state = if worker.paused { "paused" } else { worker.status.as_label() };
                let _ = writeln!(
                    out,
                    "  {:<10} {:<8} {} {}",
                    worker.worker_id,
                    state,
                    worker.goal_id,
                    self.style_dim(&format!(
                        "heartbeat {}",
                        worker.last_heartbeat.format("%H:%M:%S")
                    ))
                );
            }
        }

        if !snapshot.locks.is_empty() {
            let _ = writeln!(out, "{}", self.style_header("Locks"));
            for lock in &snapshot.locks {
                let _ = writeln!(out, "  {} {}", lock.path, self.style_dim(&lock.holder));
            }
        }
        out
    }

    /// End-of-run summary.
    pub fn render_result(&self, result: &CoordinatorResult) -> String {
        let mut out = String::new();
        let merged = result.count(GoalStatus::Merged);
        let headline = format!(
            "{} of {} goals merged in {}",
            merged,
            result.goals.len(),
            format_duration(result.timing.total_ms)
        );
        let _ = writeln!(out);
        if result.all_clean() {
            let _ = writeln!(out, "{}", self.style_success(&format!("✓ {}", headline)));
        } else {
            let _ = writeln!(out, "{}", self.style_error(&format!("✗ {}", headline)));
        }

        for goal in &result.goals {
            let _ = write!(
                out,
                "  {:<12} {} {}",
                goal.goal_id,
                self.style_status(goal.status),
                self.style_dim(&format!("wave {}", goal.wave))
            );
            match (&goal.merge, goal.failure_reason.as_deref()) {
                (Some(MergeOutcome::Clean { commit: Some(commit) }), _) => {
                    let _ = write!(out, " {}", self.style_dim(short_sha(commit)));
                }
                (_, Some(reason)) => {
                    let _ = write!(out, " {}", reason);
                }
                _ => {}
            }
            if let Some(worker) = goal.result.as_ref() {
                if !worker.undeclared_paths.is_empty() {
                    let _ = write!(
                        out,
                        " {}",
                        self.style_warn(&format!(
                            "(undeclared: {})",
                            worker.undeclared_paths.join(", ")
                        ))
                    );
                }
            }
            out.push('\n');
        }

        for conflict in &result.conflicts {
            let _ = writeln!(
                out,
                "\n{} {} (branch {} kept)",
                self.style_error("Conflict in"),
                conflict.goal_id,
                conflict.branch
            );
            let _ = writeln!(out, "  files: {}", conflict.files.join(", "));
            let lines: Vec<&str> = conflict.diff.lines().collect();
            for line in lines.iter().take(DIFF_PREVIEW_LINES) {
                let _ = writeln!(out, "  {}", self.style_dim(line));
            }
            if lines.len() > DIFF_PREVIEW_LINES {
                let _ = writeln!(
                    out,
                    "  {}",
                    self.style_dim(&format!("... {} more lines", lines.len() - DIFF_PREVIEW_LINES))
                );
            }
        }
        out
    }

    fn style_status(&self, status: GoalStatus) -> String {
        let label = format!("{:<10}", status.as_label());
        match status {
            GoalStatus::Merged => self.style_success(&label),
            GoalStatus::Running | GoalStatus::Pending => self.style_header(&label),
            GoalStatus::Blocked | GoalStatus::Cancelled => self.style_warn(&label),
            GoalStatus::Conflicted | GoalStatus::Failed | GoalStatus::TimedOut => {
                self.style_error(&label)
            }
        }
    }

    // Style helpers
    fn style_header(&self, text: &str) -> String {
        if self.use_colors {
            text.truecolor(34, 211, 238).bold().to_string()
        } else {
            text.to_string()
        }
    }

    fn style_dim(&self, text: &str) -> String {
        if self.use_colors {
            text.truecolor(107, 114, 128).to_string()
        } else {
            text.to_string()
        }
    }

    fn style_success(&self, text: &str) -> String {
        if self.use_colors {
            text.truecolor(34, 197, 94).to_string()
        } else {
            text.to_string()
        }
    }

    fn style_warn(&self, text: &str) -> String {
        if self.use_colors {
            text.truecolor(234, 179, 8).to_string()
        } else {
            text.to_string()
        }
    }

    fn style_error(&self, text: &str) -> String {
        if self.use_colors {
            text.truecolor(239, 68, 68).to_string()
        } else {
            text.to_string()
        }
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

/// `1.2s`, `3m04s`.
pub fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::dependency::DependencyGraph;
    use crate::parallel::scheduler::{ConflictReport, GoalReport, RunTiming};
    use crate::parallel::worker::WorkerStatus;

    fn plain() -> RunDisplay {
        RunDisplay::new().with_colors(false)
    }

    fn report(goal_id: &str, status: GoalStatus, reason: Option<&str>) -> GoalReport {
        GoalReport {
            goal_id: goal_id.to_string(),
            title: format!("Goal {}", goal_id),
            wave: 0,
            status,
            worker_id: None,
            failure_reason: reason.map(str::to_string),
            merge: None,
            duration_ms: 0,
            result: None,
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(1_250), "1.2s");
        assert_eq!(format_duration(184_000), "3m04s");
    }

    #[test]
    fn test_render_schedule_lists_waves() {
        let goals = vec![
            Goal::new("G1", "Parser").with_paths(["src/parser.rs"]),
            Goal::new("G2", "Lexer").with_paths(["src/lexer.rs"]),
            Goal::new("G3", "Wire up").requiring(["G1", "G2"]),
        ];
        let schedule = DependencyGraph::build(&goals).expect("schedule");

        let out = plain().render_schedule(&goals, &schedule);
        assert!(out.contains("3 goals in 2 waves"));
        assert!(out.contains("Wave 0"));
        assert!(out.contains("G3 Wire up (requires G1, G2)"));
    }

    #[test]
    fn test_render_result_shows_conflict_diff() {
        let result = CoordinatorResult {
            run_id: "run-1".to_string(),
            goals: vec![
                report("G1", GoalStatus::Merged, None),
                report("G2", GoalStatus::Conflicted, Some("merge conflict in a.txt")),
            ],
            conflicts: vec![ConflictReport {
                goal_id: "G2".to_string(),
                branch: "ralph/goal/G2".to_string(),
                files: vec!["a.txt".to_string()],
                diff: "<<<<<<< HEAD\nfirst\n=======\nsecond\n>>>>>>> ralph/goal/G2".to_string(),
            }],
            blocked: Vec::new(),
            timing: RunTiming::default(),
        };

        let out = plain().render_result(&result);
        assert!(out.contains("✗ 1 of 2 goals merged"));
        assert!(out.contains("merge conflict in a.txt"));
        assert!(out.contains("branch ralph/goal/G2 kept"));
        assert!(out.contains("second"));
    }

    #[test]
    fn test_render_event_quiet_and_failures() {
        let event = CoordinatorEvent::WorkerCompleted {
            worker_id: "worker-1".to_string(),
            goal_id: "G1".to_string(),
            status: WorkerStatus::TimedOut,
            failure_reason: Some("timeout".to_string()),
            error_type: Some("timeout".to_string()),
            duration_ms: 2_000,
        };
        let line = plain().render_event(&event).expect("line");
        assert_eq!(line, "  timed_out G1 2.0s timeout");
        assert!(plain().with_quiet(true).render_event(&event).is_none());
        assert!(plain()
            .render_event(&CoordinatorEvent::RunStarted { goals: 1, waves: 1 })
            .is_none());
    }
}
