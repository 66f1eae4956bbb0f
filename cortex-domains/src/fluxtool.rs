//! fluxtool: holdout DSL with a remapped command/operator vocabulary.
//!
//! fluxtool intentionally renames gridtool syntax to validate transfer
//! honestly: a lesson learned on gridtool must not leak into fluxtool runs
//! through shared surface text. Commands compile down to gridtool, execute
//! on the same engine, and every error/output term maps back to fluxtool
//! vocabulary before the model sees it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use cortex_harness::domain::{
    DomainAdapter, DomainWorkspace, ErrorStyle, StandardAliases, ToolResult,
};
use cortex_harness::error::Result;
use cortex_harness::provider::ToolSpec;
use cortex_memory::DomainDoc;

use crate::gridtool::run_gridtool_script;
use crate::sqlite::docs_from_root;

const RUN_FLUXTOOL_TOOL_NAME: &str = "run_fluxtool";

/// fluxtool → gridtool command vocabulary.
const COMMAND_TO_GRID: &[(&str, &str)] = &[
    ("IMPORT", "LOAD"),
    ("FILTER", "KEEP"),
    ("EXCLUDE", "TOSS"),
    ("GROUP", "TALLY"),
    ("SORT", "RANK"),
    ("COLUMNS", "PICK"),
    ("COMPUTE", "DERIVE"),
    ("ATTACH", "MERGE"),
    ("DISPLAY", "SHOW"),
];

/// fluxtool → gridtool operator vocabulary.
const OP_TO_GRID: &[(&str, &str)] = &[
    ("is", "eq"),
    ("isnt", "neq"),
    ("above", "gt"),
    ("below", "lt"),
    ("atleast", "gte"),
    ("atmost", "lte"),
];

static FLUX_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"(?i)\b(IMPORT|FILTER|EXCLUDE|GROUP|SORT|COLUMNS|COMPUTE|ATTACH|DISPLAY|is|isnt|above|below|atleast|atmost|sum|count|avg|min|max|asc|desc)\b",
    )
    .unwrap()
});

fn grid_command(flux: &str) -> Option<&'static str> {
    COMMAND_TO_GRID
        .iter()
        .find(|(from, _)| *from == flux)
        .map(|(_, to)| *to)
}

fn grid_op(flux: &str) -> Option<&'static str> {
    OP_TO_GRID
        .iter()
        .find(|(from, _)| *from == flux)
        .map(|(_, to)| *to)
}

fn flux_commands_text() -> String {
    let mut names: Vec<&str> = COMMAND_TO_GRID.iter().map(|(from, _)| *from).collect();
    names.sort_unstable();
    names.join(", ")
}

fn valid_flux_ops_text() -> String {
    let mut names: Vec<&str> = OP_TO_GRID.iter().map(|(from, _)| *from).collect();
    names.sort_unstable();
    names.join(", ")
}

fn translate_filter(command: &str, args: &str, lineno: usize) -> std::result::Result<String, String> {
    let mut iter = args.split_whitespace();
    let (Some(column), Some(op_raw)) = (iter.next(), iter.next()) else {
        return Err(format!(
            "ERROR at line {lineno}: {command} syntax: {command} column op value"
        ));
    };
    let rest: Vec<&str> = iter.collect();
    if rest.is_empty() {
        return Err(format!(
            "ERROR at line {lineno}: {command} syntax: {command} column op value"
        ));
    }
    let Some(op) = grid_op(&op_raw.to_lowercase()) else {
        return Err(format!(
            "ERROR at line {lineno}: {command} unknown operator '{op_raw}'. Valid: {}",
            valid_flux_ops_text()
        ));
    };
    let grid = grid_command(command).unwrap_or(command);
    Ok(format!("{grid} {column} {op} {}", rest.join(" ")))
}

/// Compile one fluxtool line into its gridtool equivalent.
fn translate_line(line: &str, lineno: usize) -> std::result::Result<String, String> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default().to_uppercase();
    let args = parts.next().unwrap_or_default().trim();

    match command.as_str() {
        "FILTER" | "EXCLUDE" => translate_filter(&command, args, lineno),
        _ => match grid_command(&command) {
            Some(grid) => Ok(if args.is_empty() {
                grid.to_string()
            } else {
                format!("{grid} {args}")
            }),
            None => Err(format!(
                "ERROR at line {lineno}: Unknown command '{command}'. Valid commands: {}",
                flux_commands_text()
            )),
        },
    }
}

/// Map gridtool vocabulary in engine text back to fluxtool terms.
fn map_text_to_flux(text: &str) -> String {
    static WORD_MAPS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
        #[allow(clippy::unwrap_used)]
        {
            let mut maps: Vec<(Regex, &'static str)> = Vec::new();
            for (flux, grid) in COMMAND_TO_GRID {
                maps.push((Regex::new(&format!(r"\b{grid}\b")).unwrap(), *flux));
            }
            for (flux, grid) in OP_TO_GRID {
                maps.push((Regex::new(&format!(r"\b{grid}\b")).unwrap(), *flux));
            }
            maps.push((Regex::new(r"\bgridtool\b").unwrap(), "fluxtool"));
            maps
        }
    });
    let mut out = text.to_string();
    for (pattern, replacement) in WORD_MAPS.iter() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out
}

/// Run a fluxtool script by compiling to gridtool and mapping results back.
pub fn run_fluxtool_script(
    workdir: &Path,
    input: &str,
    style: ErrorStyle,
) -> std::result::Result<String, String> {
    let mut grid_lines: Vec<String> = Vec::new();
    for (lineno0, raw_line) in input.lines().enumerate() {
        let lineno = lineno0 + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            grid_lines.push(String::new());
            continue;
        }
        grid_lines.push(translate_line(line, lineno)?);
    }
    match run_gridtool_script(workdir, &grid_lines.join("\n"), style) {
        Ok(output) => Ok(map_text_to_flux(&output)),
        Err(error) => Err(map_text_to_flux(&error)),
    }
}

/// Adapter for the fluxtool holdout DSL.
#[derive(Debug, Clone)]
pub struct FluxtoolAdapter {
    aliases: StandardAliases,
    style: ErrorStyle,
    docs_root: Option<PathBuf>,
}

impl FluxtoolAdapter {
    #[must_use]
    pub fn new(style: ErrorStyle, docs_root: Option<PathBuf>) -> Self {
        FluxtoolAdapter {
            aliases: StandardAliases::for_executor(
                RUN_FLUXTOOL_TOOL_NAME,
                "Execute fluxtool commands against CSV data. Pass commands as a string.",
            ),
            style,
            docs_root,
        }
    }
}

#[async_trait]
impl DomainAdapter for FluxtoolAdapter {
    fn name(&self) -> &str {
        "fluxtool"
    }

    fn executor_tool_name(&self) -> &str {
        RUN_FLUXTOOL_TOOL_NAME
    }

    fn tool_defs(&self, fixture_refs: &[String], opaque: bool) -> Vec<ToolSpec> {
        self.aliases.tool_defs(
            json!({
                "type": "object",
                "properties": {
                    "commands": {"type": "string", "description": "fluxtool commands to execute (one per line)."}
                },
                "required": ["commands"],
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
        // Identical layout to gridtool: CSVs are copied into the working
        // directory, originals back show_fixture.
        std::fs::create_dir_all(work_dir)?;
        let mut fixture_paths: BTreeMap<String, PathBuf> = BTreeMap::new();
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
            std::fs::copy(&csv_path, work_dir.join(&name))?;
            fixture_paths.insert(name, csv_path);
        }
        let task_md = task_dir.join("task.md");
        if task_md.exists() {
            fixture_paths.insert("task.md".into(), task_md);
        }
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
        if tool_name != RUN_FLUXTOOL_TOOL_NAME {
            return ToolResult::err(format!("unknown tool {tool_name:?} for fluxtool domain"));
        }
        let Some(commands) = tool_input.get("commands").and_then(Value::as_str) else {
            return ToolResult::err("run_fluxtool requires string commands");
        };
        match run_fluxtool_script(&workspace.work_dir, commands, self.style) {
            Ok(output) => {
                if output.is_empty() {
                    ToolResult::ok("(ok)")
                } else {
                    ToolResult::ok(output)
                }
            }
            Err(error) => ToolResult::err(error),
        }
    }

    async fn capture_final_state(&self, _workspace: &DomainWorkspace) -> String {
        "See event log for fluxtool DISPLAY outputs.".to_string()
    }

    fn system_prompt_fragment(&self) -> String {
        concat!(
            "You are controlling a fluxtool CLI environment.\n",
            "fluxtool is a data processing tool with its own syntax.\n",
            "You MUST read the skill doc before using it - the syntax is NOT SQL.\n",
            "Rules:\n",
            "- Use run_fluxtool to execute fluxtool commands.\n",
            "- You must read at least one routed skill with read_skill before run_fluxtool.\n",
            "- Use read_skill whenever routed skill summaries are insufficient for exact execution.\n",
            "- Use show_fixture to inspect fixture files.\n",
            "- fluxtool commands: IMPORT, FILTER, EXCLUDE, GROUP, SORT, COLUMNS, COMPUTE, ATTACH, DISPLAY.\n",
            "- Do NOT use SQL syntax - fluxtool is completely different.\n",
        )
        .to_string()
    }

    fn quality_keywords(&self) -> &Regex {
        &FLUX_KEYWORDS
    }

    fn docs_manifest(&self) -> Vec<DomainDoc> {
        docs_from_root(self.docs_root.as_deref(), "fluxtool")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workdir_with_fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("fixture.csv"),
            "region,amount\nnorth,5\nsouth,4\nnorth,8\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn flux_pipeline_compiles_to_grid_semantics() {
        let dir = workdir_with_fixture();
        let script = "IMPORT \"fixture.csv\"\nFILTER amount atleast 5\nGROUP region -> total=sum(amount)\nDISPLAY\n";
        let output = run_fluxtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap();
        assert_eq!(output, "region,total\nnorth,13.0");
    }

    #[test]
    fn unknown_flux_operator_lists_flux_vocabulary() {
        let dir = workdir_with_fixture();
        let script = "IMPORT \"fixture.csv\"\nFILTER amount gte 5\n";
        let error = run_fluxtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap_err();
        assert!(error.contains("FILTER unknown operator 'gte'"));
        assert!(error.contains("above, atleast, atmost, below, is, isnt"));
    }

    #[test]
    fn grid_vocabulary_never_leaks_through_errors() {
        let dir = workdir_with_fixture();
        let script = "IMPORT \"fixture.csv\"\nGROUP region total=sum(amount)\n";
        let error = run_fluxtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap_err();
        assert!(error.contains("GROUP"));
        assert!(!error.contains("TALLY"));
        assert!(!error.contains("gridtool"));
    }

    #[test]
    fn unknown_command_reports_flux_command_set() {
        let dir = workdir_with_fixture();
        let error =
            run_fluxtool_script(dir.path(), "TALLY region -> t=sum(amount)\n", ErrorStyle::Helpful)
                .unwrap_err();
        assert!(error.contains("Unknown command 'TALLY'"));
        assert!(error.contains("IMPORT"));
    }

    #[test]
    fn line_numbers_survive_translation() {
        let dir = workdir_with_fixture();
        let script = "# setup\nIMPORT \"fixture.csv\"\nSORT amount sideways\n";
        let error = run_fluxtool_script(dir.path(), script, ErrorStyle::Helpful).unwrap_err();
        assert!(error.contains("ERROR at line 3"), "got: {error}");
    }
}
