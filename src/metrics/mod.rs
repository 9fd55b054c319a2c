//! Run timing and outcome metrics.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metrics for one goal within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalMetrics {
    pub goal_id: String,
    pub wave: usize,
    /// Times the spawn was deferred because no worker slot was free.
    pub deferrals: u32,
    pub duration_ms: u64,
    /// Terminal goal status label.
    pub status: String,
    pub success: bool,
    pub files_touched: usize,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub error: Option<String>,
    /// Error category label (`transient`, `fatal`, `timeout`).
    pub error_type: Option<String>,
}

impl GoalMetrics {
    fn new(goal_id: impl Into<String>, wave: usize) -> Self {
        Self {
            goal_id: goal_id.into(),
            wave,
            deferrals: 0,
            duration_ms: 0,
            status: "pending".to_string(),
            success: false,
            files_touched: 0,
            lines_added: 0,
            lines_removed: 0,
            error: None,
            error_type: None,
        }
    }
}

/// Timing for one wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveMetrics {
    pub wave: usize,
    pub goals: usize,
    pub duration_ms: u64,
}

/// Aggregated metrics for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub run_duration_ms: u64,
    pub expected_goals: u32,
    pub goals_attempted: u32,
    pub goals_merged: u32,
    pub failures: u32,
    pub conflicts: u32,
    pub blocked: u32,
    pub deferrals: u32,
    pub waves: Vec<WaveMetrics>,
    /// Goals sorted by id.
    pub goals: Vec<GoalMetrics>,
}

impl RunMetrics {
    /// Share of attempted goals that merged, in percent.
    pub fn merge_rate(&self) -> f64 {
        if self.goals_attempted == 0 {
            return 0.0;
        }
        self.goals_merged as f64 / self.goals_attempted as f64 * 100.0
    }

    /// Most frequent error category among failed goals.
    pub fn most_common_error(&self) -> Option<&str> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for goal in &self.goals {
            if let Some(error_type) = goal.error_type.as_deref() {
                *counts.entry(error_type).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(label, _)| label)
    }
}

#[derive(Debug)]
struct RunMetricsState {
    run_id: String,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    expected_goals: usize,
    goals: HashMap<String, GoalMetrics>,
    waves: Vec<WaveMetrics>,
    conflicts: u32,
    blocked: u32,
}

/// Thread-safe run metrics collector.
#[derive(Debug, Clone)]
pub struct RunMetricsCollector {
    inner: Arc<Mutex<RunMetricsState>>,
}

impl RunMetricsCollector {
    pub fn new(run_id: impl Into<String>, expected_goals: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunMetricsState {
                run_id: run_id.into(),
                started_at: Utc::now(),
                started_instant: Instant::now(),
                expected_goals,
                goals: HashMap::new(),
                waves: Vec::new(),
                conflicts: 0,
                blocked: 0,
            })),
        }
    }

    /// Record that a goal was spawned in `wave`.
    pub fn start_goal(&self, goal_id: &str, wave: usize) {
        if let Ok(mut state) = self.inner.lock() {
            state
                .goals
                .entry(goal_id.to_string())
                .or_insert_with(|| GoalMetrics::new(goal_id, wave))
                .wave = wave;
        }
    }

    pub fn record_deferral(&self, goal_id: &str, wave: usize) {
        if let Ok(mut state) = self.inner.lock() {
            state
                .goals
                .entry(goal_id.to_string())
                .or_insert_with(|| GoalMetrics::new(goal_id, wave))
                .deferrals += 1;
        }
    }

    /// Record the terminal state of a goal.
    pub fn complete_goal(&self, goal: GoalMetrics) {
        if let Ok(mut state) = self.inner.lock() {
            let deferrals = state
                .goals
                .get(&goal.goal_id)
                .map(|existing| existing.deferrals)
                .unwrap_or(0);
            state
                .goals
                .insert(goal.goal_id.clone(), GoalMetrics { deferrals, ..goal });
        }
    }

    pub fn record_wave(&self, wave: usize, goals: usize, duration: Duration) {
        if let Ok(mut state) = self.inner.lock() {
            state.waves.push(WaveMetrics {
                wave,
                goals,
                duration_ms: duration.as_millis() as u64,
            });
        }
    }

    pub fn record_conflict(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.conflicts += 1;
        }
    }

    pub fn record_blocked(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.blocked += 1;
        }
    }

    /// Build a run metrics snapshot.
    pub fn finish(&self) -> RunMetrics {
        let completed_at = Utc::now();
        let Ok(state) = self.inner.lock() else {
            return RunMetrics {
                run_id: "run-unknown".to_string(),
                started_at: completed_at,
                completed_at,
                run_duration_ms: 0,
                expected_goals: 0,
                goals_attempted: 0,
                goals_merged: 0,
                failures: 0,
                conflicts: 0,
                blocked: 0,
                deferrals: 0,
                waves: Vec::new(),
                goals: Vec::new(),
            };
        };

        let mut goals: Vec<GoalMetrics> = state.goals.values().cloned().collect();
        goals.sort_by(|a, b| a.goal_id.cmp(&b.goal_id));
        let attempted = goals.iter().filter(|goal| goal.status != "pending").count() as u32;
        let merged = goals.iter().filter(|goal| goal.status == "merged").count() as u32;
        let failures = goals
            .iter()
            .filter(|goal| matches!(goal.status.as_str(), "failed" | "timed_out" | "cancelled"))
            .count() as u32;

        RunMetrics {
            run_id: state.run_id.clone(),
            started_at: state.started_at,
            completed_at,
            run_duration_ms: state.started_instant.elapsed().as_millis() as u64,
            expected_goals: state.expected_goals as u32,
            goals_attempted: attempted,
            goals_merged: merged,
            failures,
            conflicts: state.conflicts,
            blocked: state.blocked,
            deferrals: goals.iter().map(|goal| goal.deferrals).sum(),
            waves: state.waves.clone(),
            goals,
        }
    }
}

/// Store run metrics snapshots on disk, one JSON file per run.
#[derive(Debug, Clone)]
pub struct RunMetricsStore {
    metrics_dir: PathBuf,
}

impl RunMetricsStore {
    pub fn new(metrics_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let metrics_dir = metrics_dir.into();
        std::fs::create_dir_all(&metrics_dir)?;
        Ok(Self { metrics_dir })
    }

    /// Save run metrics to disk.
    pub fn save(&self, metrics: &RunMetrics) -> io::Result<PathBuf> {
        let path = self.metrics_dir.join(format!("{}.json", metrics.run_id));
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(metrics).map_err(io::Error::other)?;
        let mut file = std::fs::File::create(&temp_path)?;
        use std::io::Write;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&temp_path, &path)?;
        Ok(path)
    }

    pub fn load(&self, run_id: &str) -> io::Result<Option<RunMetrics>> {
        let path = self.metrics_dir.join(format!("{}.json", run_id));
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let metrics = serde_json::from_str(&contents).map_err(io::Error::other)?;
                Ok(Some(metrics))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// One-paragraph summary for the terminal.
pub fn format_metrics(metrics: &RunMetrics) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "Run {}: {}/{} goals merged ({:.0}%) in {:.1}s\n",
        metrics.run_id,
        metrics.goals_merged,
        metrics.expected_goals,
        metrics.merge_rate(),
        metrics.run_duration_ms as f64 / 1000.0
    ));
    output.push_str(&format!(
        "  failures: {}  conflicts: {}  blocked: {}  deferrals: {}\n",
        metrics.failures, metrics.conflicts, metrics.blocked, metrics.deferrals
    ));
    for wave in &metrics.waves {
        output.push_str(&format!(
            "  wave {}: {} goal(s), {:.1}s\n",
            wave.wave,
            wave.goals,
            wave.duration_ms as f64 / 1000.0
        ));
    }
    if let Some(error) = metrics.most_common_error() {
        output.push_str(&format!("  most common error: {}\n", error));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn finished(goal_id: &str, status: &str, error_type: Option<&str>) -> GoalMetrics {
        GoalMetrics {
            status: status.to_string(),
            success: status == "merged",
            error_type: error_type.map(str::to_string),
            duration_ms: 10,
            ..GoalMetrics::new(goal_id, 0)
        }
    }

    #[test]
    fn test_collector_counts_outcomes() {
        let collector = RunMetricsCollector::new("run-1", 4);
        collector.start_goal("G1", 0);
        collector.record_deferral("G2", 0);
        collector.record_deferral("G2", 0);
        collector.start_goal("G2", 0);
        collector.complete_goal(finished("G1", "merged", None));
        collector.complete_goal(finished("G2", "failed", Some("fatal")));
        collector.complete_goal(finished("G3", "timed_out", Some("timeout")));
        collector.record_blocked();
        collector.record_wave(0, 3, Duration::from_millis(1500));

        let metrics = collector.finish();
        assert_eq!(metrics.expected_goals, 4);
        assert_eq!(metrics.goals_attempted, 3);
        assert_eq!(metrics.goals_merged, 1);
        assert_eq!(metrics.failures, 2);
        assert_eq!(metrics.blocked, 1);
        assert_eq!(metrics.deferrals, 2);
        assert_eq!(metrics.goals[1].goal_id, "G2");
        assert_eq!(metrics.goals[1].deferrals, 2);
        assert_eq!(metrics.waves[0].duration_ms, 1500);
    }

    #[test]
    fn test_most_common_error() {
        let collector = RunMetricsCollector::new("run-1", 3);
        collector.complete_goal(finished("G1", "failed", Some("fatal")));
        collector.complete_goal(finished("G2", "timed_out", Some("timeout")));
        collector.complete_goal(finished("G3", "timed_out", Some("timeout")));
        assert_eq!(collector.finish().most_common_error(), Some("timeout"));
    }

    #[test]
    fn test_merge_rate_with_no_goals() {
        let metrics = RunMetricsCollector::new("run-1", 0).finish();
        assert_eq!(metrics.merge_rate(), 0.0);
    }

    #[test]
    fn test_store_save_and_load() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = RunMetricsStore::new(temp_dir.path().join("metrics")).expect("store");
        let collector = RunMetricsCollector::new("run-42", 1);
        collector.complete_goal(finished("G1", "merged", None));
        let metrics = collector.finish();

        let path = store.save(&metrics).expect("save");
        assert!(path.ends_with("run-42.json"));
        let loaded = store.load("run-42").expect("load").expect("exists");
        assert_eq!(loaded, metrics);
        assert!(store.load("run-missing").expect("load").is_none());
    }

    #[test]
    fn test_format_metrics() {
        let collector = RunMetricsCollector::new("run-7", 2);
        collector.complete_goal(finished("G1", "merged", None));
        collector.record_wave(0, 1, Duration::from_millis(200));
        let text = format_metrics(&collector.finish());
        assert!(text.contains("Run run-7: 1/2 goals merged"));
        assert!(text.contains("wave 0: 1 goal(s)"));
    }
}
