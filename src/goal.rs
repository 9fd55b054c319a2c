//! Goals: the units of work handed to workers.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConductorError, ConductorResult};

/// Characters that make a declared path a glob pattern.
const GLOB_META: &[char] = &['*', '?', '[', ']', '{', '}'];

/// A unit of work with an approximate file footprint.
///
/// `declared_paths` is an estimate used for scheduling; the worker reports
/// what was actually touched. `metadata` is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// Unique identifier within a goal set.
    pub id: String,
    /// Short human-readable title.
    #[serde(default)]
    pub title: String,
    /// Instructions for the agent loop.
    #[serde(default)]
    pub description: String,
    /// Paths or glob patterns the goal is expected to modify.
    #[serde(default, alias = "paths")]
    pub declared_paths: Vec<String>,
    /// Ids of goals whose changes must be merged before this one starts.
    #[serde(default, alias = "depends_on")]
    pub requires: Vec<String>,
    /// Scheduling priority; higher values run first within a layer.
    #[serde(default)]
    pub priority: f64,
    /// Opaque caller data.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Goal {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            declared_paths: Vec::new(),
            requires: Vec::new(),
            priority: 0.0,
            metadata: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn requiring<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Prompt text handed to external agents.
    pub fn prompt(&self) -> String {
        let mut prompt = format!("# Goal {}: {}\n", self.id, self.title);
        if !self.description.is_empty() {
            prompt.push('\n');
            prompt.push_str(&self.description);
            prompt.push('\n');
        }
        if !self.declared_paths.is_empty() {
            prompt.push_str("\nExpected files:\n");
            for path in &self.declared_paths {
                prompt.push_str("- ");
                prompt.push_str(path);
                prompt.push('\n');
            }
        }
        prompt
    }

    /// Whether `path` falls inside this goal's declared footprint.
    pub fn declares(&self, path: &str) -> bool {
        self.declared_paths
            .iter()
            .any(|declared| footprint_covers(declared, path))
    }
}

/// Returns true if the declared path contains glob metacharacters.
pub fn is_glob(path: &str) -> bool {
    path.contains(GLOB_META)
}

/// Whether a relative path leaves the project root: absolute paths, drive
/// prefixes, and `..` components that climb above the start.
pub fn escapes_root(path: &str) -> bool {
    let path = path.trim();
    if path.starts_with(['/', '\\']) || path.as_bytes().get(1) == Some(&b':') {
        return true;
    }
    let mut depth: usize = 0;
    for component in path.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => match depth.checked_sub(1) {
                Some(up) => depth = up,
                None => return true,
            },
            _ => depth += 1,
        }
    }
    false
}

/// Normalize a relative path: forward slashes, no `.` or empty components,
/// `..` resolved lexically. The project root normalizes to `"."`.
///
/// Callers reject paths for which [`escapes_root`] holds before normalizing.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.trim().split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// The components of a declared path before the first glob metacharacter.
///
/// `src/auth/*.rs` has base `src/auth`; `**/*.md` has base `.` (the whole
/// project).
pub fn literal_base(path: &str) -> String {
    let normalized = normalize_path(path);
    if !is_glob(&normalized) {
        return normalized;
    }
    let literal: Vec<&str> = normalized
        .split('/')
        .take_while(|component| !is_glob(component))
        .collect();
    if literal.is_empty() {
        ".".to_string()
    } else {
        literal.join("/")
    }
}

/// Component-wise prefix test: `src` contains `src/a.rs`, but not `srcx`.
pub fn path_contains(ancestor: &str, path: &str) -> bool {
    if ancestor == "." || ancestor == path {
        return true;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Whether a concrete path falls under a declared path or pattern.
fn footprint_covers(declared: &str, path: &str) -> bool {
    let path = normalize_path(path);
    if is_glob(declared) {
        glob::Pattern::new(&normalize_path(declared))
            .map(|pattern| pattern.matches(&path))
            .unwrap_or(false)
    } else {
        path_contains(&normalize_path(declared), &path)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GoalsDocument {
    Wrapped { goals: Vec<Goal> },
    List(Vec<Goal>),
}

impl From<GoalsDocument> for Vec<Goal> {
    fn from(document: GoalsDocument) -> Self {
        match document {
            GoalsDocument::Wrapped { goals } => goals,
            GoalsDocument::List(goals) => goals,
        }
    }
}

/// Parse a goals document in JSON.
///
/// Accepts either a bare array of goals or `{ "goals": [...] }`.
pub fn parse_goals_json(content: &str) -> Result<Vec<Goal>, serde_json::Error> {
    serde_json::from_str::<GoalsDocument>(content).map(Into::into)
}

/// Parse a goals document in TOML (`[[goals]]` tables).
pub fn parse_goals_toml(content: &str) -> Result<Vec<Goal>, toml::de::Error> {
    toml::from_str::<GoalsDocument>(content).map(Into::into)
}

/// Load goals from a `.json` or `.toml` file.
pub fn load_goals(path: &Path) -> ConductorResult<Vec<Goal>> {
    let content = fs::read_to_string(path).map_err(|err| ConductorError::GoalFile {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    let parsed = if is_toml {
        parse_goals_toml(&content).map_err(|err| err.to_string())
    } else {
        parse_goals_json(&content).map_err(|err| err.to_string())
    };

    parsed.map_err(|message| ConductorError::GoalFile {
        path: path.to_path_buf(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_bare_json_array() {
        let goals = parse_goals_json(
            r#"[{"id": "G1", "title": "First", "declared_paths": ["a.txt"]}]"#,
        )
        .expect("parse");
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].id, "G1");
        assert_eq!(goals[0].declared_paths, vec!["a.txt"]);
        assert!(goals[0].requires.is_empty());
    }

    #[test]
    fn test_parse_wrapped_json_with_aliases() {
        let goals = parse_goals_json(
            r#"{"goals": [
                {"id": "G1", "paths": ["a.txt"]},
                {"id": "G2", "paths": ["b.txt"], "depends_on": ["G1"], "priority": 0.9,
                 "metadata": {"ticket": "ENG-7", "nested": {"k": [1, 2]}}}
            ]}"#,
        )
        .expect("parse");
        assert_eq!(goals[1].requires, vec!["G1"]);
        assert_eq!(goals[1].priority, 0.9);
        assert_eq!(goals[1].metadata["ticket"], json!("ENG-7"));
        assert_eq!(goals[1].metadata["nested"], json!({"k": [1, 2]}));
    }

    #[test]
    fn test_parse_toml_goals() {
        let goals = parse_goals_toml(
            r#"
[[goals]]
id = "auth"
title = "Add login"
declared_paths = ["src/auth/*.rs"]

[[goals]]
id = "docs"
requires = ["auth"]
priority = 2.0
"#,
        )
        .expect("parse");
        assert_eq!(goals.len(), 2);
        assert_eq!(goals[0].declared_paths, vec!["src/auth/*.rs"]);
        assert_eq!(goals[1].requires, vec!["auth"]);
    }

    #[test]
    fn test_load_goals_reports_path_on_error() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("goals.json");
        fs::write(&path, "not json").expect("write");

        let err = load_goals(&path).expect_err("should fail");
        assert!(matches!(err, ConductorError::GoalFile { .. }));
        assert!(err.to_string().contains("goals.json"));
    }

    #[test]
    fn test_load_goals_by_extension() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("goals.toml");
        fs::write(&path, "[[goals]]\nid = \"G1\"\n").expect("write");

        let goals = load_goals(&path).expect("load");
        assert_eq!(goals[0].id, "G1");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src//lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("src/a/../b.rs"), "src/b.rs");
        assert_eq!(normalize_path("src\\main.rs"), "src/main.rs");
        assert_eq!(normalize_path(""), ".");
        assert_eq!(normalize_path("./"), ".");
    }

    #[test]
    fn test_escapes_root() {
        assert!(escapes_root("../x"));
        assert!(escapes_root("src/../../x"));
        assert!(escapes_root("/etc/passwd"));
        assert!(escapes_root("C:\\temp"));
        assert!(!escapes_root("src/../x"));
        assert!(!escapes_root("./src/**/*.rs"));
        assert!(!escapes_root("a..b/c"));
    }

    #[test]
    fn test_literal_base() {
        assert_eq!(literal_base("src/auth/*.rs"), "src/auth");
        assert_eq!(literal_base("src/**/mod.rs"), "src");
        assert_eq!(literal_base("**/*.md"), ".");
        assert_eq!(literal_base("README.md"), "README.md");
    }

    #[test]
    fn test_path_contains_is_component_wise() {
        assert!(path_contains("src", "src/a.rs"));
        assert!(path_contains("src/a.rs", "src/a.rs"));
        assert!(path_contains(".", "anything"));
        assert!(!path_contains("src", "srcx/a.rs"));
        assert!(!path_contains("src/a.rs", "src"));
    }

    #[test]
    fn test_declares_matches_globs_and_directories() {
        let goal = Goal::new("G1", "t").with_paths(["src/auth/*.rs", "docs"]);
        assert!(goal.declares("src/auth/login.rs"));
        assert!(goal.declares("docs/guide/intro.md"));
        assert!(!goal.declares("src/main.rs"));
    }

    #[test]
    fn test_prompt_includes_paths() {
        let goal = Goal::new("G1", "Add login")
            .with_description("Implement the login form")
            .with_paths(["src/login.rs"]);
        let prompt = goal.prompt();
        assert!(prompt.contains("Goal G1: Add login"));
        assert!(prompt.contains("Implement the login form"));
        assert!(prompt.contains("- src/login.rs"));
    }
}
