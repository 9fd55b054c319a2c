//! Durable JSONL journal of coordinator events.
//!
//! One directory per run under `.ralph/conductor/runs/<run-id>/` holding
//! `events.jsonl` (one [`JournalRecord`] per line) and `run.json` (a
//! [`RunManifest`] rewritten atomically after every append).

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::CoordinatorEvent;

/// Environment variable overriding the retention period (days).
pub const RETENTION_ENV_VAR: &str = "RALPH_CONDUCTOR_RETENTION_DAYS";

/// Default retention period in days.
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

/// Current journal schema version.
pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

const MANIFEST_FILE_NAME: &str = "run.json";
const EVENTS_FILE_NAME: &str = "events.jsonl";

/// Errors that can occur while journaling.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid run ID")]
    InvalidRunId,
}

pub type JournalResult<T> = Result<T, JournalError>;

/// One journaled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub schema_version: u32,
    pub run_id: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CoordinatorEvent,
}

impl JournalRecord {
    pub fn new(run_id: impl Into<String>, event: CoordinatorEvent) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            run_id: run_id.into(),
            recorded_at: Utc::now(),
            event,
        }
    }
}

/// Metadata kept next to a run's events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub record_count: u64,
}

impl RunManifest {
    pub fn new(run_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            run_id: run_id.into(),
            created_at: timestamp,
            updated_at: timestamp,
            record_count: 0,
        }
    }

    fn record(&mut self, timestamp: DateTime<Utc>) {
        self.updated_at = timestamp;
        self.record_count = self.record_count.saturating_add(1);
    }
}

/// Retention in days, taking [`RETENTION_ENV_VAR`] over `configured`.
pub fn retention_days_from_env(configured: u64) -> u64 {
    env::var(RETENTION_ENV_VAR)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(configured)
}

/// Filesystem journal rooted at a `runs/` directory.
#[derive(Debug, Clone)]
pub struct EventJournal {
    runs_dir: PathBuf,
    retention_days: u64,
}

impl EventJournal {
    pub fn new(runs_dir: impl Into<PathBuf>, retention_days: u64) -> JournalResult<Self> {
        let runs_dir = runs_dir.into();
        fs::create_dir_all(&runs_dir)?;
        Ok(Self {
            runs_dir,
            retention_days,
        })
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    /// Append one record and bump the run manifest.
    pub fn append(&self, record: &JournalRecord) -> JournalResult<()> {
        if record.run_id.trim().is_empty() {
            return Err(JournalError::InvalidRunId);
        }

        let run_dir = self.run_dir(&record.run_id);
        fs::create_dir_all(&run_dir)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(EVENTS_FILE_NAME))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        file.sync_all()?;

        let mut manifest = self
            .read_manifest(&run_dir)?
            .unwrap_or_else(|| RunManifest::new(record.run_id.clone(), record.recorded_at));
        manifest.record(record.recorded_at);
        self.write_manifest(&run_dir, &manifest)
    }

    /// All records of a run in append order. Unparseable lines are skipped.
    pub fn read_run(&self, run_id: &str) -> JournalResult<Vec<JournalRecord>> {
        let path = self.run_dir(run_id).join(EVENTS_FILE_NAME);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::warn!(run_id, error = %err, "Skipping unreadable journal line");
                    None
                }
            })
            .collect())
    }

    pub fn manifest(&self, run_id: &str) -> JournalResult<Option<RunManifest>> {
        self.read_manifest(&self.run_dir(run_id))
    }

    pub fn delete_run(&self, run_id: &str) -> JournalResult<()> {
        if run_id.trim().is_empty() {
            return Err(JournalError::InvalidRunId);
        }
        match fs::remove_dir_all(self.run_dir(run_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete runs created before the retention window. Returns how many
    /// were removed.
    pub fn enforce_retention(&self) -> JournalResult<usize> {
        if self.retention_days == 0 || !self.runs_dir.exists() {
            return Ok(0);
        }

        let cutoff = Utc::now() - Duration::days(self.retention_days as i64);
        let mut deleted = 0;
        for entry in fs::read_dir(&self.runs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let run_dir = entry.path();
            let Some(manifest) = self.read_manifest(&run_dir)? else {
                continue;
            };
            if manifest.created_at < cutoff {
                fs::remove_dir_all(&run_dir)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn read_manifest(&self, run_dir: &Path) -> JournalResult<Option<RunManifest>> {
        match fs::read_to_string(run_dir.join(MANIFEST_FILE_NAME)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_manifest(&self, run_dir: &Path, manifest: &RunManifest) -> JournalResult<()> {
        let json = serde_json::to_string_pretty(manifest)?;
        let temp_path = run_dir.join(format!("{}.tmp", MANIFEST_FILE_NAME));
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, run_dir.join(MANIFEST_FILE_NAME))?;
        Ok(())
    }
}
