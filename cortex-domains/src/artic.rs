//! Artic domain adapter: GET-only client for the public Art Institute of
//! Chicago API.
//!
//! The HTTP surface is deliberately narrow: relative paths against one base
//! URL, GET only, bounded response rendering. Responses are compact sorted
//! JSON with deterministic clipping so event logs stay comparable across
//! runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::debug;

use cortex_harness::domain::{DomainAdapter, DomainWorkspace, StandardAliases, ToolResult};
use cortex_harness::error::Result;
use cortex_harness::provider::ToolSpec;
use cortex_memory::DomainDoc;

use crate::sqlite::docs_from_root;

const RUN_ARTIC_TOOL_NAME: &str = "run_artic";
/// Public API root.
pub const ARTIC_BASE_URL: &str = "https://api.artic.edu/api/v1";
const ARTIC_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RESULT_CHARS: usize = 3600;

static ARTIC_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)\b(artic|artworks|search|pagination|query|fields|title|id)\b").unwrap()
});

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Render a response payload, clipping oversized results deterministically.
fn compact_json_with_clip(payload: &Value, max_chars: usize) -> String {
    let text = compact_json(payload);
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut budget = max_chars.saturating_sub(240).max(64);
    while budget >= 32 {
        let excerpt: String = text.chars().take(budget).collect();
        let clipped = json!({
            "ok": payload.get("ok").cloned().unwrap_or(Value::Bool(true)),
            "request": payload.get("request").cloned().unwrap_or(Value::Null),
            "status": payload.get("status").cloned().unwrap_or(Value::from(0)),
            "truncated": true,
            "result_excerpt": format!("{excerpt}..."),
        });
        let rendered = compact_json(&clipped);
        if rendered.chars().count() <= max_chars {
            return rendered;
        }
        budget -= 64;
    }
    compact_json(&json!({
        "ok": payload.get("ok").cloned().unwrap_or(Value::Bool(true)),
        "status": payload.get("status").cloned().unwrap_or(Value::from(0)),
        "truncated": true,
    }))
}

fn encode_query(query: &Map<String, Value>) -> String {
    fn encode(text: &str) -> String {
        let mut out = String::new();
        for byte in text.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(byte as char);
                }
                b' ' => out.push('+'),
                other => out.push_str(&format!("%{other:02X}")),
            }
        }
        out
    }
    query
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            format!("{}={}", encode(key), encode(&rendered))
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Adapter for the artic REST domain.
#[derive(Debug, Clone)]
pub struct ArticAdapter {
    aliases: StandardAliases,
    client: reqwest::Client,
    base_url: String,
    docs_root: Option<PathBuf>,
}

impl Default for ArticAdapter {
    fn default() -> Self {
        ArticAdapter::new(None)
    }
}

impl ArticAdapter {
    #[must_use]
    pub fn new(docs_root: Option<PathBuf>) -> Self {
        ArticAdapter {
            aliases: StandardAliases::for_executor(
                RUN_ARTIC_TOOL_NAME,
                "Execute a GET request to the Art Institute of Chicago API. Input: method(GET), path(relative), query(object).",
            ),
            client: reqwest::Client::new(),
            base_url: ARTIC_BASE_URL.to_string(),
            docs_root,
        }
    }

    /// Point the adapter at a different endpoint (tests use a local server).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl DomainAdapter for ArticAdapter {
    fn name(&self) -> &str {
        "artic"
    }

    fn executor_tool_name(&self) -> &str {
        RUN_ARTIC_TOOL_NAME
    }

    fn tool_defs(&self, fixture_refs: &[String], opaque: bool) -> Vec<ToolSpec> {
        self.aliases.tool_defs(
            json!({
                "type": "object",
                "properties": {
                    "method": {"type": "string", "description": "HTTP method; only GET is supported."},
                    "path": {"type": "string", "description": "Relative API path, e.g. /artworks/search."},
                    "query": {"type": "object", "description": "Query parameters."}
                },
                "required": ["path"],
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
        _workspace: &DomainWorkspace,
    ) -> ToolResult {
        if tool_name != RUN_ARTIC_TOOL_NAME {
            return ToolResult::err(format!("unknown tool {tool_name:?} for artic domain"));
        }
        let method = tool_input
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .trim()
            .to_uppercase();
        if method != "GET" {
            return ToolResult::err(format!("run_artic only supports GET, got {method:?}"));
        }
        let Some(path) = tool_input.get("path").and_then(Value::as_str) else {
            return ToolResult::err("run_artic requires string path");
        };
        let cleaned = path.trim();
        if cleaned.starts_with("http://") || cleaned.starts_with("https://") {
            return ToolResult::err(format!(
                "run_artic path must be relative to {ARTIC_BASE_URL}, got absolute URL {cleaned:?}"
            ));
        }
        let query = tool_input
            .get("query")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut url = format!("{}/{}", self.base_url.trim_end_matches('/'), cleaned.trim_start_matches('/'));
        if !query.is_empty() {
            url.push('?');
            url.push_str(&encode_query(&query));
        }
        debug!(%url, "artic request");

        let request_echo = json!({"method": "GET", "path": cleaned, "query": query});
        let sent = self.client.get(&url).timeout(ARTIC_TIMEOUT).send().await;
        let response = match sent {
            Ok(response) => response,
            Err(error) if error.is_timeout() => {
                return ToolResult::err(format!(
                    "run_artic timed out after {:.0}s for {cleaned:?}",
                    ARTIC_TIMEOUT.as_secs_f64()
                ));
            }
            Err(error) => return ToolResult::err(format!("run_artic request failed: {error}")),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let detail: String = body.chars().take(220).collect();
            return ToolResult::err(format!(
                "HTTP {} {} for {cleaned:?}: {detail}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("error"),
            ));
        }

        let result: Value = serde_json::from_str(&body).unwrap_or(Value::String(body));
        let payload = json!({
            "ok": true,
            "request": request_echo,
            "status": status.as_u16(),
            "result": result,
        });
        ToolResult::ok(compact_json_with_clip(&payload, MAX_RESULT_CHARS))
    }

    async fn capture_final_state(&self, _workspace: &DomainWorkspace) -> String {
        "See event log for run_artic responses.".to_string()
    }

    fn system_prompt_fragment(&self) -> String {
        format!(
            concat!(
                "You are controlling a read-only HTTP API environment.\n",
                "Rules:\n",
                "- Use run_artic to execute GET requests against {}.\n",
                "- You must read at least one routed skill with read_skill before run_artic.\n",
                "- Paths are relative (e.g. /artworks/search); absolute URLs are rejected.\n",
                "- Use query parameters for search, pagination, and field selection.\n",
                "- Keep requests small; responses are clipped deterministically.\n",
            ),
            ARTIC_BASE_URL
        )
    }

    fn quality_keywords(&self) -> &Regex {
        &ARTIC_KEYWORDS
    }

    fn docs_manifest(&self) -> Vec<DomainDoc> {
        docs_from_root(self.docs_root.as_deref(), "artic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(dir: &tempfile::TempDir) -> DomainWorkspace {
        DomainWorkspace {
            task_id: "t".into(),
            task_dir: dir.path().to_path_buf(),
            work_dir: dir.path().join("work"),
            fixture_paths: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn non_get_methods_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ArticAdapter::default();
        let result = adapter
            .execute(
                RUN_ARTIC_TOOL_NAME,
                &json!({"method": "POST", "path": "/artworks"}),
                &workspace(&dir),
            )
            .await;
        assert!(result.is_error());
        assert!(result.error.unwrap().contains("only supports GET"));
    }

    #[tokio::test]
    async fn absolute_urls_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ArticAdapter::default();
        let result = adapter
            .execute(
                RUN_ARTIC_TOOL_NAME,
                &json!({"path": "https://evil.example.com/x"}),
                &workspace(&dir),
            )
            .await;
        assert!(result.is_error());
        assert!(result.error.unwrap().contains("must be relative"));
    }

    #[test]
    fn query_encoding_is_stable() {
        let mut query = Map::new();
        query.insert("q".into(), json!("starry night"));
        query.insert("limit".into(), json!(2));
        assert_eq!(encode_query(&query), "limit=2&q=starry+night");
    }

    #[test]
    fn oversized_payloads_clip_deterministically() {
        let payload = json!({
            "ok": true,
            "request": {"method": "GET", "path": "/artworks"},
            "status": 200,
            "result": {"data": "x".repeat(10_000)},
        });
        let rendered = compact_json_with_clip(&payload, MAX_RESULT_CHARS);
        assert!(rendered.chars().count() <= MAX_RESULT_CHARS);
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["truncated"], true);
        assert_eq!(parsed["status"], 200);
    }
}
