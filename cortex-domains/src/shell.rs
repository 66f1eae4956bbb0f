//! Shell domain adapter: generic command execution in a task workspace.
//!
//! The least constrained domain: `run_bash` executes arbitrary shell in a
//! per-run working directory under a long timeout. Fixtures are copied in;
//! the final state is a recursive listing with small-file previews.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use cortex_harness::domain::{DomainAdapter, DomainWorkspace, StandardAliases, ToolResult};
use cortex_harness::error::Result;
use cortex_harness::provider::ToolSpec;
use cortex_memory::DomainDoc;

use crate::sqlite::docs_from_root;

const RUN_BASH_TOOL_NAME: &str = "run_bash";
const SHELL_TIMEOUT: Duration = Duration::from_secs(45);
const MAX_OUTPUT_CHARS: usize = 1800;
const PREVIEW_FILE_BYTES: u64 = 2048;

static SHELL_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"(?i)\b(bash|python|python3|pip|module|traceback|stderr|exit code|xlsx|excel|worksheet|workbook|csv|json|chmod|ls|cat|cp|mv|mkdir|rm|sed|awk|grep|rg|curl|zip|unzip)\b",
    )
    .unwrap()
});

fn clip(text: &str, max_chars: usize) -> String {
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() <= max_chars {
        return compact;
    }
    let clipped: String = compact.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{clipped}...")
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        if source.is_dir() {
            copy_dir_recursive(&source, &target)?;
        } else {
            std::fs::copy(&source, &target)?;
        }
    }
    Ok(())
}

/// Adapter for shell-command tasks.
#[derive(Debug, Clone)]
pub struct ShellAdapter {
    aliases: StandardAliases,
    docs_root: Option<PathBuf>,
}

impl Default for ShellAdapter {
    fn default() -> Self {
        ShellAdapter::new(None)
    }
}

impl ShellAdapter {
    #[must_use]
    pub fn new(docs_root: Option<PathBuf>) -> Self {
        ShellAdapter {
            aliases: StandardAliases::for_executor(
                RUN_BASH_TOOL_NAME,
                "Execute shell command(s) in a task-local working directory.",
            ),
            docs_root,
        }
    }
}

#[async_trait]
impl DomainAdapter for ShellAdapter {
    fn name(&self) -> &str {
        "shell"
    }

    fn executor_tool_name(&self) -> &str {
        RUN_BASH_TOOL_NAME
    }

    fn tool_defs(&self, fixture_refs: &[String], opaque: bool) -> Vec<ToolSpec> {
        self.aliases.tool_defs(
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command(s) to execute in the task workspace."}
                },
                "required": ["command"],
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
        let mut fixture_paths: BTreeMap<String, PathBuf> = BTreeMap::new();
        for entry in std::fs::read_dir(task_dir)? {
            let entry = entry?;
            let source = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if source.is_dir() {
                copy_dir_recursive(&source, &work_dir.join(&name))?;
                continue;
            }
            std::fs::copy(&source, work_dir.join(&name))?;
            fixture_paths.insert(name, source);
        }
        debug!(fixtures = fixture_paths.len(), "shell workspace prepared");
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
        if tool_name != RUN_BASH_TOOL_NAME {
            return ToolResult::err(format!("unknown tool {tool_name:?} for shell domain"));
        }
        let Some(command) = tool_input.get("command").and_then(Value::as_str) else {
            return ToolResult::err("run_bash requires string command");
        };

        let spawned = tokio::process::Command::new("bash")
            .arg("-lc")
            .arg(command)
            .current_dir(&workspace.work_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(error) => return ToolResult::err(format!("bash spawn failed: {error}")),
        };
        let waited = tokio::time::timeout(SHELL_TIMEOUT, child.wait_with_output()).await;
        let output = match waited {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => return ToolResult::err(format!("bash execution failed: {error}")),
            Err(_) => {
                return ToolResult::err(format!(
                    "bash timed out after {:.0}s",
                    SHELL_TIMEOUT.as_secs_f64()
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            let body = if stdout.trim().is_empty() { "(ok)" } else { stdout.trim() };
            ToolResult::ok(clip(body, MAX_OUTPUT_CHARS))
        } else {
            let code = output.status.code().unwrap_or(-1);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            ToolResult::err(format!(
                "{} Exit code {code}",
                clip(&detail, MAX_OUTPUT_CHARS)
            ))
        }
    }

    async fn capture_final_state(&self, workspace: &DomainWorkspace) -> String {
        let mut lines: Vec<String> = Vec::new();
        let mut stack = vec![workspace.work_dir.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(std::result::Result::ok)
                .map(|entry| entry.path())
                .collect();
            paths.sort();
            for path in paths {
                let relative = path
                    .strip_prefix(&workspace.work_dir)
                    .unwrap_or(&path)
                    .display()
                    .to_string();
                if path.is_dir() {
                    lines.push(format!("{relative}/"));
                    stack.push(path);
                    continue;
                }
                let size = std::fs::metadata(&path).map(|metadata| metadata.len()).unwrap_or(0);
                if size <= PREVIEW_FILE_BYTES {
                    if let Ok(text) = std::fs::read_to_string(&path) {
                        lines.push(format!("{relative} ({size} bytes): {}", clip(&text, 240)));
                        continue;
                    }
                }
                lines.push(format!("{relative} ({size} bytes)"));
            }
        }
        if lines.is_empty() {
            "(empty workspace)".to_string()
        } else {
            lines.join("\n")
        }
    }

    fn system_prompt_fragment(&self) -> String {
        concat!(
            "You are controlling a shell workspace environment.\n",
            "Rules:\n",
            "- Use run_bash to execute shell commands in the task workspace.\n",
            "- You must read at least one routed skill with read_skill before run_bash.\n",
            "- Use show_fixture to inspect fixture files.\n",
            "- Work only inside the workspace directory.\n",
            "- Prefer small, verifiable commands over long pipelines.\n",
        )
        .to_string()
    }

    fn quality_keywords(&self) -> &Regex {
        &SHELL_KEYWORDS
    }

    fn docs_manifest(&self) -> Vec<DomainDoc> {
        docs_from_root(self.docs_root.as_deref(), "shell")
    }
}
