//! Domain adapter protocol for pluggable tool domains.
//!
//! Every concrete tool (SQLite, gridtool, fluxtool, shell, a REST client)
//! plugs in behind [`DomainAdapter`]; the agent loop never sees a domain's
//! semantics, only its executor tool, two standard meta-tools, and the
//! descriptive error text its failures produce — that text is the raw
//! material for fingerprints and tags.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use crate::error::Result;
use crate::provider::ToolSpec;
use cortex_memory::DomainDoc;

/// Canonical name of the skill-reader meta-tool.
pub const READ_SKILL_TOOL_NAME: &str = "read_skill";
/// Canonical name of the fixture-reader meta-tool.
pub const SHOW_FIXTURE_TOOL_NAME: &str = "show_fixture";
/// Canonical name of the mid-session evaluator meta-tool.
pub const VERIFY_CONTRACT_TOOL_NAME: &str = "verify_contract";

/// Unified tool result used across all domains: output XOR error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolResult {
    pub output: String,
    pub error: Option<String>,
}

impl ToolResult {
    #[must_use]
    pub fn ok(output: impl Into<String>) -> Self {
        ToolResult {
            output: output.into(),
            error: None,
        }
    }

    #[must_use]
    pub fn err(error: impl Into<String>) -> Self {
        ToolResult {
            output: String::new(),
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Domain-agnostic workspace for a single task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainWorkspace {
    pub task_id: String,
    pub task_dir: PathBuf,
    pub work_dir: PathBuf,
    /// Stable `path_ref → file` map served by the fixture-reader.
    pub fixture_paths: BTreeMap<String, PathBuf>,
}

impl DomainWorkspace {
    #[must_use]
    pub fn fixture_refs(&self) -> Vec<String> {
        self.fixture_paths.keys().cloned().collect()
    }
}

/// How an adapter rewrites its error prose. Degrading error quality is the
/// experimental lever that forces the memory subsystem to earn its keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorStyle {
    /// Full, specific messages.
    #[default]
    Helpful,
    /// Hints stripped entirely.
    Cryptic,
    /// Nudges toward the fix without giving full syntax.
    SemiHelpful,
    /// Deterministic per-command mix of cryptic and semi-helpful.
    Mixed,
}

/// One tool's opaque/canonical naming pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolAlias {
    pub opaque_name: &'static str,
    pub canonical_name: &'static str,
    pub opaque_description: &'static str,
    pub canonical_description: &'static str,
}

impl ToolAlias {
    #[must_use]
    pub fn api_name(&self, opaque: bool) -> &'static str {
        if opaque { self.opaque_name } else { self.canonical_name }
    }

    #[must_use]
    pub fn description(&self, opaque: bool) -> &'static str {
        if opaque {
            self.opaque_description
        } else {
            self.canonical_description
        }
    }
}

/// Standard alias set: one executor plus the two meta-tools.
///
/// When `opaque` is on, the agent sees only `dispatch`/`probe`/`catalog` and
/// has to consult skill docs to learn what each tool does. Event logging
/// always uses canonical names so the evaluator works unchanged.
#[derive(Debug, Clone)]
pub struct StandardAliases {
    pub executor: ToolAlias,
    pub read_skill: ToolAlias,
    pub show_fixture: ToolAlias,
}

impl StandardAliases {
    #[must_use]
    pub fn for_executor(
        executor_name: &'static str,
        executor_description: &'static str,
    ) -> Self {
        StandardAliases {
            executor: ToolAlias {
                opaque_name: "dispatch",
                canonical_name: executor_name,
                opaque_description:
                    "Execute a command against the workspace. Consult skill docs for parameter semantics.",
                canonical_description: executor_description,
            },
            read_skill: ToolAlias {
                opaque_name: "probe",
                canonical_name: READ_SKILL_TOOL_NAME,
                opaque_description: "Look up a reference document by ref key.",
                canonical_description: "Read full contents of a skill document by stable skill_ref.",
            },
            show_fixture: ToolAlias {
                opaque_name: "catalog",
                canonical_name: SHOW_FIXTURE_TOOL_NAME,
                opaque_description: "Retrieve a named data artifact.",
                canonical_description: "Read task fixture/bootstrap file by stable path_ref.",
            },
        }
    }

    /// `{api_name: canonical_name}` for translating tool-use blocks back to
    /// canonical names before logging.
    #[must_use]
    pub fn alias_map(&self, opaque: bool) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for alias in [&self.executor, &self.read_skill, &self.show_fixture] {
            map.insert(
                alias.api_name(opaque).to_string(),
                alias.canonical_name.to_string(),
            );
        }
        map
    }

    /// Build the standard three tool specs around an executor schema.
    #[must_use]
    pub fn tool_defs(
        &self,
        executor_schema: Value,
        fixture_refs: &[String],
        opaque: bool,
    ) -> Vec<ToolSpec> {
        let refs_text = if fixture_refs.is_empty() {
            "(none)".to_string()
        } else {
            fixture_refs.join(", ")
        };
        vec![
            ToolSpec {
                name: self.executor.api_name(opaque).to_string(),
                description: self.executor.description(opaque).to_string(),
                input_schema: executor_schema,
            },
            ToolSpec {
                name: self.read_skill.api_name(opaque).to_string(),
                description: self.read_skill.description(opaque).to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"skill_ref": {"type": "string"}},
                    "required": ["skill_ref"],
                    "additionalProperties": false,
                }),
            },
            ToolSpec {
                name: self.show_fixture.api_name(opaque).to_string(),
                description: format!(
                    "{} Available refs: {refs_text}.",
                    self.show_fixture.description(opaque)
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {"path_ref": {"type": "string"}},
                    "required": ["path_ref"],
                    "additionalProperties": false,
                }),
            },
        ]
    }
}

/// Mid-session evaluator tool; defined centrally since every domain gets it.
#[must_use]
pub fn verify_contract_tool_spec() -> ToolSpec {
    ToolSpec {
        name: VERIFY_CONTRACT_TOOL_NAME.to_string(),
        description:
            "Run the deterministic evaluator for current task state and return pass/score/reasons."
                .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "note": {"type": "string", "description": "Optional note about what changed before this verification."}
            },
            "required": [],
            "additionalProperties": false,
        }),
    }
}

/// Read a fixture file by its stable `path_ref`.
pub fn show_fixture_text(workspace: &DomainWorkspace, path_ref: &str) -> ToolResult {
    let key = path_ref.trim();
    let Some(target) = workspace.fixture_paths.get(key) else {
        let allowed = workspace.fixture_refs();
        return ToolResult::err(format!("Unknown path_ref: {path_ref:?}. Allowed: {allowed:?}"));
    };
    if !target.exists() {
        return ToolResult::err(format!("Missing fixture file: {}", target.display()));
    }
    match std::fs::read_to_string(target) {
        Ok(text) => ToolResult::ok(text),
        Err(error) => ToolResult::err(format!(
            "Failed reading fixture file {}: {error}",
            target.display()
        )),
    }
}

/// The protocol every domain adapter satisfies.
#[async_trait]
pub trait DomainAdapter: Send + Sync {
    /// Short domain identifier, e.g. `sqlite`, `gridtool`.
    fn name(&self) -> &str;

    /// Canonical executor tool name, e.g. `run_sqlite`.
    fn executor_tool_name(&self) -> &str;

    /// API tool definitions: the executor plus the two standard meta-tools.
    fn tool_defs(&self, fixture_refs: &[String], opaque: bool) -> Vec<ToolSpec>;

    /// `{api_name: canonical_name}` for all tools of this domain.
    fn build_alias_map(&self, opaque: bool) -> BTreeMap<String, String>;

    /// Set up a fresh per-run workspace (create DB, copy fixtures, …).
    async fn prepare_workspace(&self, task_dir: &Path, work_dir: &Path) -> Result<DomainWorkspace>;

    /// Execute the domain's executor tool. Failures must surface descriptive
    /// error text; that text feeds fingerprints and tags.
    async fn execute(&self, tool_name: &str, tool_input: &Value, workspace: &DomainWorkspace)
    -> ToolResult;

    /// Compact dump of the final observable state for the LLM judge.
    async fn capture_final_state(&self, workspace: &DomainWorkspace) -> String;

    /// Domain-specific rules injected into the agent's system prompt.
    fn system_prompt_fragment(&self) -> String;

    /// Tokens that count toward lesson-quality scoring.
    fn quality_keywords(&self) -> &Regex;

    /// Local documents exposed to the strict-mode knowledge provider.
    fn docs_manifest(&self) -> Vec<DomainDoc>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_aliases_obscure_every_tool() {
        let aliases = StandardAliases::for_executor("run_gridtool", "Execute gridtool commands.");
        let map = aliases.alias_map(true);
        assert_eq!(map.get("dispatch").map(String::as_str), Some("run_gridtool"));
        assert_eq!(map.get("probe").map(String::as_str), Some("read_skill"));
        assert_eq!(map.get("catalog").map(String::as_str), Some("show_fixture"));

        let transparent = aliases.alias_map(false);
        assert_eq!(
            transparent.get("run_gridtool").map(String::as_str),
            Some("run_gridtool")
        );
    }

    #[test]
    fn tool_defs_list_fixture_refs_in_description() {
        let aliases = StandardAliases::for_executor("run_sqlite", "Execute SQL.");
        let defs = aliases.tool_defs(
            json!({"type": "object", "properties": {}, "required": []}),
            &["fixture.csv".to_string(), "bootstrap.sql".to_string()],
            false,
        );
        assert_eq!(defs.len(), 3);
        assert!(defs[2].description.contains("fixture.csv"));
        let names: Vec<&str> = defs.iter().map(|def| def.name.as_str()).collect();
        assert_eq!(names, vec!["run_sqlite", "read_skill", "show_fixture"]);
    }

    #[test]
    fn show_fixture_rejects_unknown_refs() {
        let workspace = DomainWorkspace {
            task_id: "t".into(),
            task_dir: PathBuf::from("/nonexistent"),
            work_dir: PathBuf::from("/nonexistent"),
            fixture_paths: BTreeMap::new(),
        };
        let result = show_fixture_text(&workspace, "missing.csv");
        assert!(result.is_error());
        assert!(result.error.unwrap().contains("Unknown path_ref"));
    }
}
