//! Coordinator runs with scripted agents.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use ralph_conductor::events::CoordinatorEvent;
use ralph_conductor::timeout::TimeoutConfig;
use ralph_conductor::{ConductorError, Coordinator, Goal, GoalStatus, MergeOutcome};
use tempfile::TempDir;

use crate::support::{fast_config, git, goal_branches, init_repo, wait_until, ScriptedAgent, Step};

fn setup() -> TempDir {
    let temp_dir = TempDir::new().expect("temp dir");
    init_repo(temp_dir.path());
    temp_dir
}

// ============================================================================
// Scheduling and merging
// ============================================================================

#[tokio::test]
async fn test_waves_follow_requires_and_overlap() {
    let temp_dir = setup();
    let agent = ScriptedAgent::new()
        .script("G1", vec![Step::Write("a.txt", "g1\n")])
        .script("G2", vec![Step::Write("b.txt", "g2\n")])
        .script("G3", vec![Step::Write("a.txt", "g3\n")]);
    let coordinator = Coordinator::new(temp_dir.path(), fast_config(), Arc::new(agent));
    let goals = vec![
        Goal::new("G1", "first a").with_paths(["a.txt"]),
        Goal::new("G2", "b").with_paths(["b.txt"]),
        Goal::new("G3", "second a").with_paths(["a.txt"]).requiring(["G1"]),
    ];

    let result = coordinator.execute(goals).await.expect("run");

    assert!(result.all_clean(), "not clean: {:?}", result.goals);
    assert_eq!(result.goal("G1").expect("G1").wave, 0);
    assert_eq!(result.goal("G2").expect("G2").wave, 0);
    assert_eq!(result.goal("G3").expect("G3").wave, 1);
    assert_eq!(result.timing.waves.len(), 2);

    let root = temp_dir.path();
    assert_eq!(fs::read_to_string(root.join("a.txt")).expect("a"), "g3\n");
    assert_eq!(fs::read_to_string(root.join("b.txt")).expect("b"), "g2\n");
    assert!(git(root, &["log", "--format=%s"]).contains("Merge goal G1: first a"));
    assert!(goal_branches(root).is_empty());
    assert_eq!(coordinator.lock_manager().live_lock_count(), 0);
    assert_eq!(
        fs::read_dir(root.join(".ralph/worktrees")).expect("worktrees").count(),
        0
    );
    assert!(git(root, &["status", "--porcelain"]).is_empty());

    let journal = root
        .join(".ralph/conductor/runs")
        .join(&result.run_id)
        .join("events.jsonl");
    let lines = fs::read_to_string(journal).expect("journal");
    assert!(lines.lines().next().expect("first line").contains("run_started"));
    assert!(lines.contains("run_completed"));
}

#[tokio::test]
async fn test_identical_paths_run_in_separate_waves() {
    let temp_dir = setup();
    let agent = ScriptedAgent::new()
        .script("A", vec![Step::Write("shared.txt", "a\n")])
        .script("B", vec![Step::Write("shared.txt", "b\n")]);
    let coordinator = Coordinator::new(temp_dir.path(), fast_config(), Arc::new(agent));
    let goals = vec![
        Goal::new("A", "first").with_paths(["shared.txt"]),
        Goal::new("B", "second").with_paths(["shared.txt"]),
    ];

    let result = coordinator.execute(goals).await.expect("run");

    assert!(result.all_clean());
    assert_ne!(
        result.goal("A").expect("A").wave,
        result.goal("B").expect("B").wave
    );
}

#[tokio::test]
async fn test_similar_goal_ids_get_separate_workspaces() {
    let temp_dir = setup();
    let agent = ScriptedAgent::new()
        .script("a/b", vec![Step::Write("x.txt", "slash\n"), Step::Work(4)])
        .script("a b", vec![Step::Write("y.txt", "space\n"), Step::Work(4)]);
    let coordinator = Coordinator::new(temp_dir.path(), fast_config(), Arc::new(agent));
    let goals = vec![
        Goal::new("a/b", "slash").with_paths(["x.txt"]),
        Goal::new("a b", "space").with_paths(["y.txt"]),
    ];

    let result = coordinator.execute(goals).await.expect("run");

    assert!(result.all_clean(), "not clean: {:?}", result.goals);
    let slash = result.goal("a/b").expect("a/b");
    let space = result.goal("a b").expect("a b");
    assert_eq!(slash.wave, space.wave);
    assert_eq!(
        slash.result.as_ref().expect("a/b result").files_touched,
        vec!["x.txt"]
    );
    assert_eq!(
        space.result.as_ref().expect("a b result").files_touched,
        vec!["y.txt"]
    );
    assert_ne!(
        slash.result.as_ref().expect("a/b result").workspace_ref,
        space.result.as_ref().expect("a b result").workspace_ref
    );

    let root = temp_dir.path();
    assert_eq!(fs::read_to_string(root.join("x.txt")).expect("x"), "slash\n");
    assert_eq!(fs::read_to_string(root.join("y.txt")).expect("y"), "space\n");
    assert!(goal_branches(root).is_empty());
}

#[tokio::test]
async fn test_conflict_is_reported_while_siblings_merge() {
    let temp_dir = setup();
    let agent = ScriptedAgent::new()
        .script("G1", vec![Step::Write("README.md", "one\n")])
        .script("G2", vec![Step::Write("README.md", "two\n")]);
    let coordinator = Coordinator::new(temp_dir.path(), fast_config(), Arc::new(agent));
    let goals = vec![
        Goal::new("G1", "rewrite readme"),
        Goal::new("G2", "rewrite readme again"),
        Goal::new("G3", "independent").with_paths(["G3.txt"]),
        Goal::new("G4", "after G2").requiring(["G2"]),
    ];

    let result = coordinator.execute(goals).await.expect("run");

    let root = temp_dir.path();
    assert_eq!(result.goal("G1").expect("G1").status, GoalStatus::Merged);
    assert_eq!(result.goal("G3").expect("G3").status, GoalStatus::Merged);
    let g2 = result.goal("G2").expect("G2");
    assert_eq!(g2.status, GoalStatus::Conflicted);
    assert!(matches!(g2.merge, Some(MergeOutcome::Conflicted { .. })));

    assert_eq!(result.conflicts.len(), 1);
    let conflict = &result.conflicts[0];
    assert_eq!(conflict.goal_id, "G2");
    assert_eq!(conflict.files, vec!["README.md"]);
    assert!(conflict.diff.contains("two"));
    assert_eq!(goal_branches(root), vec![conflict.branch.clone()]);

    assert_eq!(result.goal("G4").expect("G4").status, GoalStatus::Blocked);
    assert_eq!(fs::read_to_string(root.join("README.md")).expect("readme"), "one\n");
    assert!(git(root, &["status", "--porcelain"]).is_empty());

    let undeclared = &result
        .goal("G1")
        .and_then(|goal| goal.result.as_ref())
        .expect("G1 result")
        .undeclared_paths;
    assert_eq!(undeclared, &vec!["README.md".to_string()]);
    assert!(!result.all_clean());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_failed_goal_blocks_transitive_dependents() {
    let temp_dir = setup();
    let agent = ScriptedAgent::new().script("G1", vec![Step::Fail("boom")]);
    let coordinator = Coordinator::new(temp_dir.path(), fast_config(), Arc::new(agent));
    let goals = vec![
        Goal::new("G1", "fails"),
        Goal::new("G2", "needs G1").requiring(["G1"]),
        Goal::new("G3", "needs G2").requiring(["G2"]),
        Goal::new("G4", "independent"),
    ];

    let result = coordinator.execute(goals).await.expect("run");

    let g1 = result.goal("G1").expect("G1");
    assert_eq!(g1.status, GoalStatus::Failed);
    assert_eq!(g1.failure_reason.as_deref(), Some("agent failed: boom"));
    assert_eq!(result.goal("G4").expect("G4").status, GoalStatus::Merged);

    for id in ["G2", "G3"] {
        let goal = result.goal(id).expect("goal");
        assert_eq!(goal.status, GoalStatus::Blocked);
        assert!(goal.worker_id.is_none(), "{} was spawned", id);
        assert!(result
            .blocked
            .iter()
            .any(|blocked| blocked.goal_id == id && blocked.blocked_by == "G1"));
    }
    assert!(goal_branches(temp_dir.path()).is_empty());
}

#[tokio::test]
async fn test_locks_released_after_failure() {
    let temp_dir = setup();
    let agent = ScriptedAgent::new().script(
        "G1",
        vec![Step::LeakLock("a.txt"), Step::LeakLock("src/b.rs"), Step::Fail("after locking")],
    );
    let coordinator = Coordinator::new(temp_dir.path(), fast_config(), Arc::new(agent));

    let result = coordinator
        .execute(vec![Goal::new("G1", "leaks").with_paths(["a.txt", "src/b.rs"])])
        .await
        .expect("run");

    assert_eq!(result.goal("G1").expect("G1").status, GoalStatus::Failed);
    assert_eq!(coordinator.lock_manager().live_lock_count(), 0);
    assert_eq!(
        fs::read_dir(temp_dir.path().join(".ralph/locks"))
            .expect("breadcrumbs")
            .count(),
        0
    );
}

#[tokio::test]
async fn test_stalled_worker_times_out() {
    let temp_dir = setup();
    let timeouts = TimeoutConfig::default()
        .with_heartbeat_interval(Duration::from_millis(300))
        .with_missed_heartbeats_threshold(2)
        .with_startup_grace_period(Duration::from_millis(300));
    let agent = ScriptedAgent::new().script("G1", vec![Step::Hang]);
    let coordinator = Coordinator::new(
        temp_dir.path(),
        fast_config().with_timeouts(timeouts),
        Arc::new(agent),
    );

    let result = coordinator
        .execute(vec![
            Goal::new("G1", "hangs").with_paths(["hang.txt"]),
            Goal::new("G2", "fine").with_paths(["G2.txt"]),
        ])
        .await
        .expect("run");

    let g1 = result.goal("G1").expect("G1");
    assert_eq!(g1.status, GoalStatus::TimedOut);
    assert_eq!(g1.failure_reason.as_deref(), Some("timeout"));
    assert_eq!(result.goal("G2").expect("G2").status, GoalStatus::Merged);
    assert!(goal_branches(temp_dir.path()).is_empty());
    assert!(!temp_dir.path().join(".ralph/worktrees/G1").exists());
    assert_eq!(coordinator.lock_manager().live_lock_count(), 0);
}

#[tokio::test]
async fn test_goal_timeout_ends_timed_out() {
    let temp_dir = setup();
    let timeouts = TimeoutConfig::default().with_goal_timeout(Duration::from_millis(300));
    let agent = ScriptedAgent::new().script("G1", vec![Step::Work(1_000)]);
    let coordinator = Coordinator::new(
        temp_dir.path(),
        fast_config().with_timeouts(timeouts),
        Arc::new(agent),
    );

    let result = coordinator
        .execute(vec![Goal::new("G1", "slow")])
        .await
        .expect("run");

    let g1 = result.goal("G1").expect("G1");
    assert_eq!(g1.status, GoalStatus::TimedOut);
    assert_eq!(g1.failure_reason.as_deref(), Some("timeout"));
}

// ============================================================================
// Control
// ============================================================================

#[tokio::test]
async fn test_pause_keeps_locks_and_resume_continues() {
    let temp_dir = setup();
    let agent = ScriptedAgent::new().script(
        "G1",
        vec![
            Step::HoldLock("p.txt"),
            Step::Work(20),
            Step::Write("p.txt", "done\n"),
        ],
    );
    let coordinator = Arc::new(Coordinator::new(
        temp_dir.path(),
        fast_config(),
        Arc::new(agent),
    ));
    let mut events = coordinator.subscribe();
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .execute(vec![Goal::new("G1", "pausable").with_paths(["p.txt"])])
                .await
        })
    };

    let worker_id = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(CoordinatorEvent::WorkerSpawned { worker_id, .. }) = events.recv().await {
                return worker_id;
            }
        }
    })
    .await
    .expect("worker spawned");
    let holds_lock = wait_until(Duration::from_secs(5), || {
        coordinator.lock_manager().holder_of("p.txt").as_deref() == Some(worker_id.as_str())
    })
    .await;
    assert!(holds_lock);

    coordinator.pause(&worker_id).expect("pause");
    assert!(temp_dir
        .path()
        .join(format!(".ralph/conductor/control/pause-{}.flag", worker_id))
        .exists());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let snapshot = coordinator.snapshot();
    let handle = snapshot.worker(&worker_id).expect("handle");
    assert!(handle.paused);
    assert!(!handle.status.is_terminal());
    assert_eq!(snapshot.goal("G1").expect("G1").status, GoalStatus::Running);
    assert_eq!(
        coordinator.lock_manager().holder_of("p.txt").as_deref(),
        Some(worker_id.as_str())
    );

    coordinator.resume(&worker_id).expect("resume");
    let result = runner.await.expect("join").expect("run");

    assert_eq!(result.goal("G1").expect("G1").status, GoalStatus::Merged);
    assert_eq!(
        fs::read_to_string(temp_dir.path().join("p.txt")).expect("p"),
        "done\n"
    );
    assert_eq!(coordinator.lock_manager().live_lock_count(), 0);
}

#[tokio::test]
async fn test_pause_unknown_worker_is_rejected() {
    let temp_dir = setup();
    let coordinator = Coordinator::new(temp_dir.path(), fast_config(), Arc::new(ScriptedAgent::new()));

    assert!(matches!(
        coordinator.pause("worker-99"),
        Err(ConductorError::UnknownWorker(_))
    ));
}

#[tokio::test]
async fn test_shutdown_cancels_running_and_unstarted_goals() {
    let temp_dir = setup();
    let agent = ScriptedAgent::new().script("G1", vec![Step::Work(400)]);
    let coordinator = Arc::new(Coordinator::new(
        temp_dir.path(),
        fast_config().with_max_workers(1),
        Arc::new(agent),
    ));
    let mut events = coordinator.subscribe();
    let shutdown = coordinator.shutdown_handle();
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .execute(vec![
                    Goal::new("G1", "long").with_priority(2.0),
                    Goal::new("G2", "queued"),
                ])
                .await
        })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(CoordinatorEvent::WorkerSpawned { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("worker spawned");
    shutdown.trigger();

    let result = runner.await.expect("join").expect("run");
    for id in ["G1", "G2"] {
        let goal = result.goal(id).expect("goal");
        assert_eq!(goal.status, GoalStatus::Cancelled, "{}", id);
        assert_eq!(goal.failure_reason.as_deref(), Some("shutdown"));
    }
    assert!(goal_branches(temp_dir.path()).is_empty());
}

// ============================================================================
// Preconditions
// ============================================================================

#[tokio::test]
async fn test_cycle_is_rejected_before_any_work() {
    let temp_dir = setup();
    let coordinator = Coordinator::new(temp_dir.path(), fast_config(), Arc::new(ScriptedAgent::new()));
    let goals = vec![
        Goal::new("A", "a").requiring(["B"]),
        Goal::new("B", "b").requiring(["A"]),
    ];

    let err = coordinator.execute(goals).await.expect_err("cycle");
    assert!(matches!(err, ConductorError::Structural(_)));
    assert!(goal_branches(temp_dir.path()).is_empty());
    assert!(!temp_dir.path().join(".ralph/conductor/status.json").exists());
}

#[tokio::test]
async fn test_wrong_branch_is_rejected() {
    let temp_dir = setup();
    let mut config = fast_config();
    config.base_branch = Some("release".to_string());
    let coordinator = Coordinator::new(temp_dir.path(), config, Arc::new(ScriptedAgent::new()));

    let err = coordinator
        .execute(vec![Goal::new("G1", "one")])
        .await
        .expect_err("wrong branch");
    assert!(matches!(
        err,
        ConductorError::WrongBranch { ref expected, ref actual } if expected == "release" && actual == "main"
    ));
}
