//! End-to-end sqlite scenarios: the adapter executes real SQL through the
//! `sqlite3` CLI and the deterministic evaluator scores the run against the
//! built-in import_aggregate contract.
//!
//! Skipped gracefully when no `sqlite3` binary is on PATH.

use std::path::Path;

use serde_json::json;

use cortex_domains::SqliteAdapter;
use cortex_harness::domain::DomainAdapter;
use cortex_harness::evaluator::evaluate_session;
use cortex_memory::Event;

fn sqlite3_available() -> bool {
    std::process::Command::new("sqlite3")
        .arg("--version")
        .output()
        .is_ok()
}

async fn executed_event(
    adapter: &SqliteAdapter,
    workspace: &cortex_harness::domain::DomainWorkspace,
    step: u64,
    sql: &str,
) -> Event {
    let result = adapter
        .execute("run_sqlite", &json!({"sql": sql}), workspace)
        .await;
    let mut event = Event::new(step, "run_sqlite", json!({"sql": sql}));
    event.ok = !result.is_error();
    event.error = result.error.clone();
    event.output = serde_json::Value::String(result.output);
    event
}

async fn prepared_workspace(
    adapter: &SqliteAdapter,
    root: &Path,
) -> cortex_harness::domain::DomainWorkspace {
    let task_dir = root.join("tasks").join("import_aggregate");
    std::fs::create_dir_all(&task_dir).unwrap();
    let work_dir = root.join("work");
    adapter.prepare_workspace(&task_dir, &work_dir).await.unwrap()
}

#[tokio::test]
async fn import_aggregate_happy_path_passes_with_full_score() {
    if !sqlite3_available() {
        eprintln!("sqlite3 not available; skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let adapter = SqliteAdapter::default();
    let workspace = prepared_workspace(&adapter, dir.path()).await;

    let mut events = Vec::new();
    events.push(
        executed_event(
            &adapter,
            &workspace,
            1,
            "CREATE TABLE sales(category TEXT, amount INTEGER);",
        )
        .await,
    );
    events.push(
        executed_event(
            &adapter,
            &workspace,
            2,
            "INSERT INTO sales VALUES ('drums',5),('bass',4),('lead',3),('drums',8),('bass',5),('lead',5);",
        )
        .await,
    );
    events.push(
        executed_event(
            &adapter,
            &workspace,
            3,
            "SELECT category, SUM(amount) AS total FROM sales GROUP BY category ORDER BY category;",
        )
        .await,
    );
    assert!(events.iter().all(|event| event.ok), "setup SQL must succeed");
    assert_eq!(events[2].output, "bass,9\ndrums,13\nlead,8");

    let evaluation = evaluate_session(
        "sqlite import aggregate grouped totals",
        "import_aggregate",
        &events,
        "run_sqlite",
        &workspace.work_dir.join("task.db"),
        &dir.path().join("tasks"),
    )
    .await;
    assert!(evaluation.applicable);
    assert!(evaluation.passed, "reasons: {:?}", evaluation.reasons);
    assert!((evaluation.score - 1.0).abs() < f64::EPSILON);
    assert!(evaluation.reasons.is_empty());
}

#[tokio::test]
async fn forbidden_and_missing_patterns_accumulate_reasons() {
    if !sqlite3_available() {
        eprintln!("sqlite3 not available; skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let adapter = SqliteAdapter::default();
    let workspace = prepared_workspace(&adapter, dir.path()).await;

    // A run that reads a missing table, attempts the forbidden drop, and
    // never creates the required schema.
    let mut events = Vec::new();
    events.push(executed_event(&adapter, &workspace, 1, "SELECT * FROM sales;").await);
    events.push(executed_event(&adapter, &workspace, 2, "DROP TABLE sales;").await);
    events.push(executed_event(&adapter, &workspace, 3, "SELECT * FROM missing_table;").await);
    assert!(events.iter().all(|event| !event.ok));

    let evaluation = evaluate_session(
        "sqlite import aggregate grouped totals",
        "import_aggregate",
        &events,
        "run_sqlite",
        &workspace.work_dir.join("task.db"),
        &dir.path().join("tasks"),
    )
    .await;
    assert!(evaluation.applicable);
    assert!(!evaluation.passed);
    for expected in [
        "missing_required_pattern",
        "matched_forbidden_pattern",
        "required_query_mismatch",
        "too_many_errors",
    ] {
        assert!(
            evaluation.reasons.contains(&expected.to_string()),
            "missing reason {expected}: {:?}",
            evaluation.reasons
        );
    }
    assert!(evaluation.score < 1.0);
}

#[tokio::test]
async fn fixture_csvs_load_into_read_only_tables() {
    if !sqlite3_available() {
        eprintln!("sqlite3 not available; skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let task_dir = dir.path().join("tasks").join("import_aggregate");
    std::fs::create_dir_all(&task_dir).unwrap();
    std::fs::write(
        task_dir.join("fixture.csv"),
        "category,amount\ndrums,5\nbass,4\nlead,3\n",
    )
    .unwrap();
    let adapter = SqliteAdapter::default();
    let workspace = adapter
        .prepare_workspace(&task_dir, &dir.path().join("work"))
        .await
        .unwrap();
    assert!(workspace.fixture_paths.contains_key("fixture.csv"));

    let select = adapter
        .execute(
            "run_sqlite",
            &json!({"sql": "SELECT COUNT(*) FROM fixture_seed;"}),
            &workspace,
        )
        .await;
    assert!(!select.is_error(), "error: {:?}", select.error);
    assert_eq!(select.output, "3");

    let mutate = adapter
        .execute(
            "run_sqlite",
            &json!({"sql": "DELETE FROM fixture_seed;"}),
            &workspace,
        )
        .await;
    assert!(mutate.is_error());
    assert!(mutate.error.unwrap().contains("Read-only"));

    let dump = adapter.capture_final_state(&workspace).await;
    assert!(dump.contains("fixture_seed"));
}
