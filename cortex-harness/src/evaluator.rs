//! Deterministic evaluator: scores a run against a task contract.
//!
//! A contract declares required/forbidden patterns over the concatenated
//! executor inputs, exact-match probe queries against the workspace, and an
//! error budget. The evaluator never crashes a run: malformed regexes and
//! query failures become reasons, not panics.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use cortex_memory::Event;

/// Reason code: a required pattern never matched.
pub const REASON_MISSING_REQUIRED: &str = "missing_required_pattern";
/// Reason code: a forbidden pattern matched.
pub const REASON_MATCHED_FORBIDDEN: &str = "matched_forbidden_pattern";
/// Reason code: a required query returned unexpected rows.
pub const REASON_QUERY_MISMATCH: &str = "required_query_mismatch";
/// Reason code: failed executor events exceeded the budget.
pub const REASON_TOO_MANY_ERRORS: &str = "too_many_errors";
/// Reason code: the contract itself is malformed.
pub const REASON_CONTRACT_ERROR: &str = "contract_error";

/// Task selector: all `all` terms must appear, and at least one `any` term
/// when `any` is non-empty. Terms are matched lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskMatch {
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub any: Vec<String>,
}

impl TaskMatch {
    #[must_use]
    pub fn matches(&self, task: &str) -> bool {
        let lowered = task.to_lowercase();
        let all_ok = self
            .all
            .iter()
            .filter(|term| !term.trim().is_empty())
            .all(|term| lowered.contains(&term.to_lowercase()));
        if !all_ok {
            return false;
        }
        let any_terms: Vec<&String> = self
            .any
            .iter()
            .filter(|term| !term.trim().is_empty())
            .collect();
        any_terms.is_empty() || any_terms.iter().any(|term| lowered.contains(&term.to_lowercase()))
    }
}

/// A probe query with its exact expected row set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequiredQuery {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sql: String,
    #[serde(default)]
    pub expected_rows: Vec<Vec<String>>,
}

/// Scoring signals of a contract.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContractSignals {
    #[serde(default)]
    pub required_sql_patterns: Vec<String>,
    #[serde(default)]
    pub forbidden_sql_patterns: Vec<String>,
    #[serde(default)]
    pub required_queries: Vec<RequiredQuery>,
    #[serde(default)]
    pub max_error_count: u64,
}

/// Declarative scoring rules attached to a task id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskContract {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub task_match: TaskMatch,
    #[serde(default)]
    pub setup: Value,
    #[serde(default)]
    pub signals: ContractSignals,
    #[serde(default)]
    pub pass_rule: String,
    #[serde(default)]
    pub reason_codes: Vec<String>,
}

/// Built-in contract for the canonical `import_aggregate` task, used when a
/// task ships no `CONTRACT.json`.
#[must_use]
pub fn default_contract() -> TaskContract {
    TaskContract {
        id: "cli-sqlite-import-aggregate-v1".into(),
        task_match: TaskMatch {
            all: vec!["sqlite".into()],
            any: vec!["import".into(), "aggregate".into(), "group".into()],
        },
        setup: json!({"bootstrap_sql_path": "bootstrap.sql", "fixture_paths": ["fixture.csv"]}),
        signals: ContractSignals {
            required_sql_patterns: vec![
                r"(?is)create\s+table\s+sales".into(),
                r"(?is)insert\s+into\s+sales".into(),
                r"(?is)group\s+by\s+category".into(),
                r"(?is)order\s+by\s+category".into(),
            ],
            forbidden_sql_patterns: vec![r"(?is)drop\s+table\s+sales".into()],
            required_queries: vec![RequiredQuery {
                id: "aggregate_rows".into(),
                sql: "SELECT category, SUM(amount) AS total FROM sales GROUP BY category ORDER BY category;"
                    .into(),
                expected_rows: vec![
                    vec!["bass".into(), "9".into()],
                    vec!["drums".into(), "13".into()],
                    vec!["lead".into(), "8".into()],
                ],
            }],
            max_error_count: 1,
        },
        pass_rule: "all_required && no_forbidden && required_queries_match && errors_within_budget"
            .into(),
        reason_codes: vec![
            REASON_MISSING_REQUIRED.into(),
            REASON_MATCHED_FORBIDDEN.into(),
            REASON_QUERY_MISMATCH.into(),
            REASON_TOO_MANY_ERRORS.into(),
        ],
    }
}

/// Load the contract for a task id, falling back to the default contract on
/// missing or malformed files.
#[must_use]
pub fn load_contract(tasks_root: &Path, task_id: &str) -> (TaskContract, PathBuf) {
    let path = tasks_root.join(task_id).join("CONTRACT.json");
    if !path.exists() {
        return (default_contract(), path);
    }
    match std::fs::read_to_string(&path)
        .ok()
        .and_then(|text| serde_json::from_str::<TaskContract>(&text).ok())
    {
        Some(contract) => (contract, path),
        None => {
            warn!(path = %path.display(), "malformed contract; using default");
            (default_contract(), path)
        }
    }
}

/// Evaluation verdict for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub applicable: bool,
    pub passed: bool,
    pub score: f64,
    pub reasons: Vec<String>,
    pub evidence: Value,
    pub contract_path: String,
}

impl Evaluation {
    #[must_use]
    pub fn not_applicable(contract_path: &Path) -> Self {
        Evaluation {
            applicable: false,
            passed: false,
            score: 0.0,
            reasons: Vec::new(),
            evidence: json!({"note": "task did not match contract task_match"}),
            contract_path: contract_path.display().to_string(),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn collect_executor_events(events: &[Event], executor_tool: &str) -> (Vec<String>, u64) {
    let mut inputs = Vec::new();
    let mut error_count = 0;
    for event in events {
        if event.tool != executor_tool {
            continue;
        }
        if let Some(object) = event.tool_input.as_object() {
            // The executor payload key varies by domain (sql, commands,
            // command, …); every string value counts toward the blob.
            for value in object.values() {
                if let Some(text) = value.as_str() {
                    inputs.push(text.to_string());
                }
            }
        }
        if !event.ok {
            error_count += 1;
        }
    }
    (inputs, error_count)
}

/// Run one probe query through `sqlite3` with CSV output.
async fn query_rows(db_path: &Path, sql: &str) -> std::result::Result<Vec<Vec<String>>, String> {
    let output = tokio::process::Command::new("sqlite3")
        .arg("-batch")
        .arg("-noheader")
        .arg("-csv")
        .arg(db_path)
        .arg(sql)
        .output()
        .await
        .map_err(|error| format!("sqlite3 spawn failed: {error}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("sqlite3 failed: {}", stderr.trim()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split(',').map(|col| col.trim_matches('"').to_string()).collect())
        .collect())
}

/// Evaluate a session's events against the contract for `task_id`.
#[instrument(skip_all, fields(task_id))]
pub async fn evaluate_session(
    task_text: &str,
    task_id: &str,
    events: &[Event],
    executor_tool: &str,
    workspace_db: &Path,
    tasks_root: &Path,
) -> Evaluation {
    let (contract, contract_path) = load_contract(tasks_root, task_id);
    if !contract.task_match.matches(task_text) {
        return Evaluation::not_applicable(&contract_path);
    }

    let signals = &contract.signals;
    let (inputs, error_count) = collect_executor_events(events, executor_tool);
    let merged = inputs.join("\n\n");

    let mut reasons: Vec<String> = Vec::new();
    let mut matched_required: Vec<String> = Vec::new();
    let mut missing_required: Vec<String> = Vec::new();
    for pattern in &signals.required_sql_patterns {
        match Regex::new(pattern) {
            Ok(regex) => {
                if regex.is_match(&merged) {
                    matched_required.push(pattern.clone());
                } else {
                    missing_required.push(pattern.clone());
                }
            }
            Err(_) => {
                // A broken contract is a finding about the contract, not the
                // run; record it and keep going.
                reasons.push(REASON_CONTRACT_ERROR.to_string());
                missing_required.push(format!("invalid regex: {pattern}"));
            }
        }
    }

    let mut matched_forbidden: Vec<String> = Vec::new();
    for pattern in &signals.forbidden_sql_patterns {
        match Regex::new(pattern) {
            Ok(regex) => {
                if regex.is_match(&merged) {
                    matched_forbidden.push(pattern.clone());
                }
            }
            Err(_) => reasons.push(REASON_CONTRACT_ERROR.to_string()),
        }
    }

    let mut query_results: Vec<Value> = Vec::new();
    let mut query_failures = 0u64;
    for query in &signals.required_queries {
        let sql = query.sql.trim();
        let (actual, error) = match query_rows(workspace_db, sql).await {
            Ok(rows) => (Some(rows), None),
            Err(error) => (None, Some(error)),
        };
        let matched = error.is_none() && actual.as_deref() == Some(query.expected_rows.as_slice());
        if !matched {
            query_failures += 1;
        }
        query_results.push(json!({
            "id": if query.id.is_empty() { "required_query" } else { query.id.as_str() },
            "sql": sql,
            "matched": matched,
            "error": error,
            "expected_rows": query.expected_rows,
            "actual_rows": actual,
        }));
    }

    let checks_total = signals.required_sql_patterns.len()
        + signals.forbidden_sql_patterns.len()
        + query_results.len()
        + 1;
    let errors_within_budget = error_count <= signals.max_error_count;
    let checks_passed = matched_required.len()
        + (signals.forbidden_sql_patterns.len() - matched_forbidden.len())
        + (query_results.len() - query_failures as usize)
        + usize::from(errors_within_budget);

    if !missing_required.is_empty() {
        reasons.push(REASON_MISSING_REQUIRED.to_string());
    }
    if !matched_forbidden.is_empty() {
        reasons.push(REASON_MATCHED_FORBIDDEN.to_string());
    }
    if query_failures > 0 {
        reasons.push(REASON_QUERY_MISMATCH.to_string());
    }
    if !errors_within_budget {
        reasons.push(REASON_TOO_MANY_ERRORS.to_string());
    }
    reasons.sort();
    reasons.dedup();

    let passed = reasons.is_empty();
    let score = if passed {
        1.0
    } else if checks_total == 0 {
        0.0
    } else {
        ((checks_passed as f64 / checks_total as f64).max(0.0) * 1000.0).round() / 1000.0
    };

    debug!(passed, score, ?reasons, "deterministic evaluation complete");
    Evaluation {
        applicable: true,
        passed,
        score,
        reasons,
        evidence: json!({
            "sql_event_count": inputs.len(),
            "error_count": error_count,
            "max_error_count": signals.max_error_count,
            "required_patterns": {"matched": matched_required, "missing": missing_required},
            "forbidden_patterns": {"matched": matched_forbidden},
            "required_queries": query_results,
        }),
        contract_path: contract_path.display().to_string(),
    }
}
