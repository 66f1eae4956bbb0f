//! SQLite domain adapter.
//!
//! Executes SQL through the `sqlite3` CLI in batch/CSV mode against a
//! task-local database. A safety pass runs first: shell escapes are banned,
//! dot-commands are restricted to an allowlisted `.read`, and `fixture_*`
//! tables are read-only.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use cortex_harness::domain::{DomainAdapter, DomainWorkspace, StandardAliases, ToolResult};
use cortex_harness::error::{Error, Result};
use cortex_harness::provider::ToolSpec;
use cortex_memory::DomainDoc;

const RUN_SQLITE_TOOL_NAME: &str = "run_sqlite";
const SQLITE_TIMEOUT: Duration = Duration::from_secs(5);

static DOT_COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?m)^\s*(\.[a-zA-Z]+)\b(.*)$").unwrap()
});
static SHELL_ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?m)^\s*![^\n]*$").unwrap()
});
static FIXTURE_MUTATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r#"(?is)\b(insert\s+into|update|delete\s+from|drop\s+table|alter\s+table|truncate\s+table)\s+["`]?(fixture_seed|fixture_[a-z0-9_]+)["`]?\b"#,
    )
    .unwrap()
});
static SQL_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"(?i)\b(SELECT|INSERT|UPDATE|DELETE|CREATE|DROP|ALTER|BEGIN|COMMIT|ROLLBACK|ON CONFLICT|GROUP BY|ORDER BY|WHERE|JOIN|PRIMARY KEY|FOREIGN KEY|INTEGER|TEXT|REAL|BLOB|NULL|NOT NULL|UNIQUE|INDEX|TRANSACTION|SUM|COUNT|AVG|MAX|MIN|HAVING|DISTINCT|UNION|EXCEPT|INTERSECT|VALUES|INTO|FROM|TABLE|VIEW|TRIGGER|fixture_seed|ledger|rejects|checkpoint_log|sales|error_log|inventory)\b",
    )
    .unwrap()
});

const FORBIDDEN_DOT_COMMANDS: [&str; 2] = [".shell", ".system"];

/// Validate SQL before it reaches the sqlite3 subprocess. Returns the
/// rejection text, or `None` when the SQL is safe to dispatch.
#[must_use]
pub fn validate_sql_safety(
    sql: &str,
    workdir: &Path,
    allowed_read_paths: &BTreeSet<PathBuf>,
) -> Option<String> {
    let text = sql.trim();
    if text.is_empty() {
        return Some("SQL is empty.".to_string());
    }
    if SHELL_ESCAPE_RE.is_match(text) {
        return Some("Shell escapes are forbidden in run_sqlite.".to_string());
    }

    for capture in DOT_COMMAND_RE.captures_iter(text) {
        let command = capture[1].trim().to_lowercase();
        let rest = capture[2].trim();
        if FORBIDDEN_DOT_COMMANDS.contains(&command.as_str()) {
            return Some(format!("Forbidden sqlite dot-command: {command}"));
        }
        if command == ".read" {
            if rest.is_empty() {
                return Some(".read requires a path argument.".to_string());
            }
            let raw = rest.trim_matches('"').trim_matches('\'');
            let candidate = if Path::new(raw).is_absolute() {
                PathBuf::from(raw)
            } else {
                workdir.join(raw)
            };
            let resolved = candidate.canonicalize().unwrap_or(candidate);
            if !allowed_read_paths.contains(&resolved) {
                return Some(format!(".read path is not allowlisted: {raw:?}"));
            }
            continue;
        }
        return Some(format!("Unsupported sqlite dot-command: {command}"));
    }

    if FIXTURE_MUTATION_RE.is_match(text) {
        return Some(
            "Mutating fixture_* tables is forbidden. Read-only access to fixture tables only."
                .to_string(),
        );
    }
    None
}

/// Pipe SQL into `sqlite3 -batch -noheader -csv` with a timeout.
async fn run_sqlite(db_path: &Path, sql: &str) -> ToolResult {
    use tokio::io::AsyncWriteExt;

    let Some(workdir) = db_path.parent() else {
        return ToolResult::err("task database has no parent directory");
    };
    let spawned = tokio::process::Command::new("sqlite3")
        .arg("-batch")
        .arg("-noheader")
        .arg("-csv")
        .arg(db_path)
        .current_dir(workdir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return ToolResult::err("sqlite3 binary not found in PATH.");
        }
        Err(error) => return ToolResult::err(format!("sqlite3 execution failed: {error}")),
    };
    if let Some(stdin) = child.stdin.as_mut() {
        if let Err(error) = stdin.write_all(sql.as_bytes()).await {
            return ToolResult::err(format!("sqlite3 stdin write failed: {error}"));
        }
    }
    drop(child.stdin.take());

    let waited = tokio::time::timeout(SQLITE_TIMEOUT, child.wait_with_output()).await;
    let output = match waited {
        Ok(Ok(output)) => output,
        Ok(Err(error)) => return ToolResult::err(format!("sqlite3 execution failed: {error}")),
        Err(_) => {
            return ToolResult::err(format!(
                "sqlite3 timed out after {:.1}s",
                SQLITE_TIMEOUT.as_secs_f64()
            ));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if output.status.success() {
        ToolResult::ok(stdout)
    } else if stderr.is_empty() {
        ToolResult::err(format!(
            "sqlite3 exited with code {}",
            output.status.code().unwrap_or(-1)
        ))
    } else {
        ToolResult::err(stderr)
    }
}

fn sanitize_identifier(text: &str) -> String {
    let mut normalized: String = text
        .trim()
        .to_lowercase()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' { ch } else { '_' })
        .collect();
    while normalized.contains("__") {
        normalized = normalized.replace("__", "_");
    }
    let normalized = normalized.trim_matches('_').to_string();
    if normalized.is_empty() {
        return "fixture_data".to_string();
    }
    if normalized.chars().next().is_some_and(|ch| ch.is_ascii_digit()) {
        format!("f_{normalized}")
    } else {
        normalized
    }
}

fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

/// Load one CSV fixture into a `fixture_*` table.
async fn load_csv_into_table(db_path: &Path, csv_path: &Path, table_name: &str) -> Result<()> {
    let Ok(content) = std::fs::read_to_string(csv_path) else {
        return Ok(());
    };
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(());
    };
    let columns: Vec<String> = parse_csv_line(header)
        .iter()
        .map(|column| sanitize_identifier(column))
        .collect();
    if columns.is_empty() {
        return Ok(());
    }

    let quoted: Vec<String> = columns.iter().map(|column| format!("\"{column}\"")).collect();
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS \"{table_name}\" ({});\nDELETE FROM \"{table_name}\";\n",
        quoted
            .iter()
            .map(|column| format!("{column} TEXT"))
            .collect::<Vec<_>>()
            .join(", "),
    );
    for line in lines {
        let row = parse_csv_line(line);
        let values: Vec<String> = (0..columns.len())
            .map(|idx| {
                let cell = row.get(idx).map(|value| value.trim()).unwrap_or_default();
                format!("'{}'", cell.replace('\'', "''"))
            })
            .collect();
        sql.push_str(&format!(
            "INSERT INTO \"{table_name}\" ({}) VALUES ({});\n",
            quoted.join(", "),
            values.join(", "),
        ));
    }
    let result = run_sqlite(db_path, &sql).await;
    if let Some(error) = result.error {
        return Err(Error::Workspace(format!(
            "failed loading fixture {} into {table_name}: {error}",
            csv_path.display()
        )));
    }
    Ok(())
}

/// Adapter for SQLite CLI tasks.
#[derive(Debug, Clone)]
pub struct SqliteAdapter {
    aliases: StandardAliases,
    docs_root: Option<PathBuf>,
}

impl Default for SqliteAdapter {
    fn default() -> Self {
        SqliteAdapter::new(None)
    }
}

impl SqliteAdapter {
    #[must_use]
    pub fn new(docs_root: Option<PathBuf>) -> Self {
        SqliteAdapter {
            aliases: StandardAliases::for_executor(
                RUN_SQLITE_TOOL_NAME,
                "Execute SQL against task-local sqlite database. No shell escapes. Dot-commands are restricted.",
            ),
            docs_root,
        }
    }

    fn db_path(workspace: &DomainWorkspace) -> PathBuf {
        workspace.work_dir.join("task.db")
    }
}

#[async_trait]
impl DomainAdapter for SqliteAdapter {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn executor_tool_name(&self) -> &str {
        RUN_SQLITE_TOOL_NAME
    }

    fn tool_defs(&self, fixture_refs: &[String], opaque: bool) -> Vec<ToolSpec> {
        self.aliases.tool_defs(
            json!({
                "type": "object",
                "properties": {
                    "sql": {"type": "string", "description": "SQL (or safe .read) to execute via sqlite3."}
                },
                "required": ["sql"],
                "additionalProperties": false,
            }),
            fixture_refs,
            opaque,
        )
    }

    fn build_alias_map(&self, opaque: bool) -> BTreeMap<String, String> {
        self.aliases.alias_map(opaque)
    }

    async fn prepare_workspace(&self, task_dir: &Path, work_dir: &Path) -> Result<DomainWorkspace> {
        std::fs::create_dir_all(work_dir)?;
        let db_path = work_dir.join("task.db");
        if db_path.exists() {
            std::fs::remove_file(&db_path)?;
        }

        let mut fixture_paths: BTreeMap<String, PathBuf> = BTreeMap::new();
        let bootstrap = task_dir.join("bootstrap.sql");
        if bootstrap.exists() {
            fixture_paths.insert("bootstrap.sql".into(), bootstrap.clone());
            // Bootstrap creates deterministic schema state for each run.
            let sql = std::fs::read_to_string(&bootstrap)?;
            let result = run_sqlite(&db_path, &sql).await;
            if let Some(error) = result.error {
                return Err(Error::Workspace(format!("failed to execute bootstrap SQL: {error}")));
            }
        }
        let task_md = task_dir.join("task.md");
        if task_md.exists() {
            fixture_paths.insert("task.md".into(), task_md);
        }

        // Every CSV fixture lands in a deterministic table name so the model
        // can run repeatable SQL workflows without external file I/O.
        let mut csv_paths: Vec<PathBuf> = std::fs::read_dir(task_dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|extension| extension == "csv"))
            .collect();
        csv_paths.sort();
        for csv_path in csv_paths {
            let name = csv_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stem = csv_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let table_name = if stem == "fixture" {
                "fixture_seed".to_string()
            } else {
                format!("fixture_{}", sanitize_identifier(&stem))
            };
            load_csv_into_table(&db_path, &csv_path, &table_name).await?;
            fixture_paths.insert(name, csv_path);
        }

        debug!(fixtures = fixture_paths.len(), "sqlite workspace prepared");
        Ok(DomainWorkspace {
            task_id: task_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            task_dir: task_dir.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            fixture_paths,
        })
    }

    async fn execute(
        &self,
        tool_name: &str,
        tool_input: &Value,
        workspace: &DomainWorkspace,
    ) -> ToolResult {
        if tool_name != RUN_SQLITE_TOOL_NAME {
            return ToolResult::err(format!("unknown tool {tool_name:?} for sqlite domain"));
        }
        let Some(sql) = tool_input.get("sql").and_then(Value::as_str) else {
            return ToolResult::err("run_sqlite requires string sql");
        };
        let allowed: BTreeSet<PathBuf> = workspace
            .fixture_paths
            .values()
            .map(|path| path.canonicalize().unwrap_or_else(|_| path.clone()))
            .collect();
        if let Some(error) = validate_sql_safety(sql, &workspace.work_dir, &allowed) {
            return ToolResult::err(error);
        }
        let result = run_sqlite(&Self::db_path(workspace), sql).await;
        if result.is_error() {
            return result;
        }
        if result.output.is_empty() {
            ToolResult::ok("(ok)")
        } else {
            result
        }
    }

    async fn capture_final_state(&self, workspace: &DomainWorkspace) -> String {
        let db_path = Self::db_path(workspace);
        if !db_path.exists() {
            return "(no database file)".to_string();
        }
        let result = run_sqlite(&db_path, ".dump").await;
        match result.error {
            Some(error) => format!("(dump failed: {error})"),
            None => {
                let lines: Vec<&str> = result.output.lines().collect();
                if lines.len() > 50 {
                    lines[lines.len() - 50..].join("\n")
                } else {
                    result.output
                }
            }
        }
    }

    fn system_prompt_fragment(&self) -> String {
        concat!(
            "You are controlling a deterministic sqlite3 CLI environment.\n",
            "Rules:\n",
            "- Use run_sqlite for SQL execution.\n",
            "- You must read at least one routed skill with read_skill before run_sqlite.\n",
            "- Use read_skill whenever routed skill summaries are insufficient for exact execution.\n",
            "- Use show_fixture to inspect fixture/bootstrap files.\n",
            "- Keep SQL concise, deterministic, and verifiable.\n",
            "- Do not use unsupported sqlite shell actions.\n",
        )
        .to_string()
    }

    fn quality_keywords(&self) -> &Regex {
        &SQL_KEYWORDS
    }

    fn docs_manifest(&self) -> Vec<DomainDoc> {
        docs_from_root(self.docs_root.as_deref(), "sqlite")
    }
}

/// Shared helper: every `*.md` under a domain docs root becomes one doc.
pub(crate) fn docs_from_root(docs_root: Option<&Path>, domain: &str) -> Vec<DomainDoc> {
    let Some(root) = docs_root else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(root) else {
        warn!(root = %root.display(), "domain docs root unreadable");
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|extension| extension == "md"))
        .collect();
    paths.sort();
    paths
        .into_iter()
        .map(|path| {
            let stem = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            DomainDoc {
                doc_id: format!("{domain}/{stem}"),
                title: stem,
                path,
                tags: vec![domain.to_string()],
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escapes_and_forbidden_dot_commands_are_rejected() {
        let allowed = BTreeSet::new();
        let workdir = PathBuf::from("/tmp");
        assert!(
            validate_sql_safety("!ls", &workdir, &allowed)
                .unwrap()
                .contains("Shell escapes")
        );
        assert!(
            validate_sql_safety(".shell rm -rf /", &workdir, &allowed)
                .unwrap()
                .contains("Forbidden sqlite dot-command")
        );
        assert!(
            validate_sql_safety(".tables", &workdir, &allowed)
                .unwrap()
                .contains("Unsupported sqlite dot-command")
        );
        assert!(validate_sql_safety("  ", &workdir, &allowed).is_some());
    }

    #[test]
    fn fixture_tables_are_read_only() {
        let allowed = BTreeSet::new();
        let workdir = PathBuf::from("/tmp");
        let error =
            validate_sql_safety("DELETE FROM fixture_seed;", &workdir, &allowed).unwrap();
        assert!(error.contains("Read-only"));
        assert!(validate_sql_safety("SELECT * FROM fixture_seed;", &workdir, &allowed).is_none());
    }

    #[test]
    fn read_path_allowlisting() {
        let dir = tempfile::tempdir().unwrap();
        let allowed_file = dir.path().join("bootstrap.sql");
        std::fs::write(&allowed_file, "SELECT 1;").unwrap();
        let allowed: BTreeSet<PathBuf> =
            [allowed_file.canonicalize().unwrap()].into_iter().collect();

        assert!(validate_sql_safety(".read bootstrap.sql", dir.path(), &allowed).is_none());
        let denied = validate_sql_safety(".read other.sql", dir.path(), &allowed).unwrap();
        assert!(denied.contains("not allowlisted"));
    }

    #[test]
    fn identifier_sanitization_matches_fixture_naming() {
        assert_eq!(sanitize_identifier("Region Name"), "region_name");
        assert_eq!(sanitize_identifier("2024 sales"), "f_2024_sales");
        assert_eq!(sanitize_identifier("***"), "fixture_data");
    }

    #[test]
    fn csv_lines_parse_quotes_and_commas() {
        assert_eq!(parse_csv_line("a,b,c"), vec!["a", "b", "c"]);
        assert_eq!(parse_csv_line("\"x,y\",z"), vec!["x,y", "z"]);
        assert_eq!(parse_csv_line("\"he said \"\"hi\"\"\",1"), vec!["he said \"hi\"", "1"]);
    }
}
