//! Agent-loop integration tests: validation retries, hint injection,
//! session resets, demo mode, and transfer-lane behavior, all driven by a
//! scripted provider and a scripted adapter.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use cortex_harness::agent::{AgentRunConfig, HINT_MARKER, HarnessPaths, run_agent};
use cortex_harness::domain::{DomainAdapter, DomainWorkspace, StandardAliases, ToolResult};
use cortex_harness::error::Result;
use cortex_harness::provider::{ChatMessage, ContentBlock, LlmResponse, ScriptedProvider, ToolSpec};
use cortex_memory::{
    LessonRecord, LessonSeed, LessonStatus, LessonStore, TransferOptions, fingerprint_of,
    read_events,
};

/// Scripted adapter: plays back canned tool results and records every
/// executed input.
struct ScriptedAdapter {
    domain: String,
    executor: &'static str,
    aliases: StandardAliases,
    results: Mutex<std::collections::VecDeque<ToolResult>>,
    executed: Mutex<Vec<Value>>,
}

impl ScriptedAdapter {
    fn new(domain: &str, executor: &'static str, results: Vec<ToolResult>) -> Self {
        ScriptedAdapter {
            domain: domain.to_string(),
            executor,
            aliases: StandardAliases::for_executor(executor, "Scripted executor."),
            results: Mutex::new(results.into()),
            executed: Mutex::new(Vec::new()),
        }
    }

    fn executed(&self) -> Vec<Value> {
        self.executed.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

static ANY_KEYWORD: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"\w+").unwrap());

#[async_trait]
impl DomainAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.domain
    }

    fn executor_tool_name(&self) -> &str {
        self.executor
    }

    fn tool_defs(&self, fixture_refs: &[String], opaque: bool) -> Vec<ToolSpec> {
        self.aliases.tool_defs(
            json!({
                "type": "object",
                "properties": {"sql": {"type": "string"}},
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
        Ok(DomainWorkspace {
            task_id: task_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            task_dir: task_dir.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            fixture_paths: BTreeMap::new(),
        })
    }

    async fn execute(&self, _tool_name: &str, tool_input: &Value, _workspace: &DomainWorkspace) -> ToolResult {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(tool_input.clone());
        }
        self.results
            .lock()
            .ok()
            .and_then(|mut results| results.pop_front())
            .unwrap_or_else(|| ToolResult::ok("ok"))
    }

    async fn capture_final_state(&self, _workspace: &DomainWorkspace) -> String {
        String::new()
    }

    fn system_prompt_fragment(&self) -> String {
        "Scripted test adapter.\n".to_string()
    }

    fn quality_keywords(&self) -> &Regex {
        &ANY_KEYWORD
    }

    fn docs_manifest(&self) -> Vec<cortex_memory::DomainDoc> {
        Vec::new()
    }
}

fn track_with_task(task_id: &str) -> (tempfile::TempDir, HarnessPaths) {
    let dir = tempfile::tempdir().unwrap();
    let paths = HarnessPaths::new(dir.path());
    let task_dir = paths.tasks_root.join(task_id);
    std::fs::create_dir_all(&task_dir).unwrap();
    std::fs::write(task_dir.join("task.md"), format!("{task_id} task")).unwrap();
    (dir, paths)
}

fn tool_use(id: &str, name: &str, input: Value) -> LlmResponse {
    ScriptedProvider::tool_use(id, name, input)
}

fn base_config(task_id: &str, session_id: u64) -> AgentRunConfig {
    let mut config = AgentRunConfig::new(task_id, session_id);
    config.posttask_learn = false;
    config.require_skill_read = false;
    config.auto_escalate_critic = false;
    config
}

fn collect_user_texts(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .filter(|message| message.role == "user")
        .flat_map(|message| message.content.iter())
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn collect_tool_result_texts(messages: &[ChatMessage]) -> Vec<String> {
    let mut texts = Vec::new();
    for message in messages {
        for block in &message.content {
            if let ContentBlock::ToolResult { content, .. } = block {
                for inner in content {
                    if let ContentBlock::Text { text } = inner {
                        texts.push(text.clone());
                    }
                }
            }
        }
    }
    texts
}

#[tokio::test]
async fn validation_retries_share_the_step_without_advancing() {
    let (_dir, paths) = track_with_task("retry_task");
    let provider = ScriptedProvider::new(vec![
        tool_use("tool-1", "run_sqlite", json!({"bad": "payload"})),
        tool_use("tool-2", "run_sqlite", json!({"bad": "payload"})),
        tool_use("tool-3", "run_sqlite", json!({"sql": "SELECT 1;"})),
    ]);
    let adapter = ScriptedAdapter::new("sqlite", "run_sqlite", vec![ToolResult::ok("ok")]);
    let mut config = base_config("retry_task", 601);
    config.max_steps = 1;

    let result = run_agent(&provider, &adapter, &paths, &config).await.unwrap();
    let events = read_events(&paths.sessions_root.join("session-601").join("events.jsonl"));
    let steps: Vec<u64> = events.iter().map(|event| event.step).collect();
    assert_eq!(steps, vec![1, 1, 1]);
    assert_eq!(result.metrics["steps"], 1);
    assert_eq!(result.metrics["tool_validation_errors"], 2);
    assert_eq!(result.metrics["tool_validation_retry_attempts"], 2);
    assert_eq!(result.metrics["tool_validation_retry_capped_events"], 0);
    assert_eq!(adapter.executed(), vec![json!({"sql": "SELECT 1;"})]);
}

#[tokio::test]
async fn validation_retry_cap_records_metric_and_queues_reflection() {
    let (_dir, paths) = track_with_task("retry_task");
    let provider = ScriptedProvider::new(vec![
        tool_use("tool-1", "run_sqlite", json!({"bad": "payload"})),
        tool_use("tool-2", "run_sqlite", json!({"bad": "payload"})),
        tool_use("tool-3", "run_sqlite", json!({"bad": "payload"})),
        tool_use("tool-4", "run_sqlite", json!({"sql": "SELECT 1;"})),
    ]);
    let adapter = ScriptedAdapter::new("sqlite", "run_sqlite", vec![ToolResult::ok("ok")]);
    let mut config = base_config("retry_task", 602);
    config.max_steps = 2;

    let result = run_agent(&provider, &adapter, &paths, &config).await.unwrap();
    let events = read_events(&paths.sessions_root.join("session-602").join("events.jsonl"));
    let steps: Vec<u64> = events.iter().map(|event| event.step).collect();
    assert_eq!(steps, vec![1, 1, 1, 2]);
    assert_eq!(result.metrics["steps"], 2);
    assert_eq!(result.metrics["tool_validation_errors"], 3);
    assert_eq!(result.metrics["tool_validation_retry_attempts"], 2);
    assert_eq!(result.metrics["tool_validation_retry_capped_events"], 1);
    assert!(result.metrics["v2_reflection_prompts"].as_u64().unwrap() >= 1);
    let reasons = result.metrics["v2_reflection_reasons"].as_array().unwrap();
    assert!(
        reasons
            .iter()
            .any(|row| row["reason"] == "validation_retry_cap")
    );
    assert!(
        collect_user_texts(&result.messages)
            .iter()
            .any(|text| text.contains("Trigger: validation_retry_cap."))
    );
    assert_eq!(adapter.executed(), vec![json!({"sql": "SELECT 1;"})]);
}

#[tokio::test]
async fn reused_session_id_resets_artifacts() {
    let (_dir, paths) = track_with_task("first_task");
    let task_dir = paths.tasks_root.join("second_task");
    std::fs::create_dir_all(&task_dir).unwrap();
    std::fs::write(task_dir.join("task.md"), "second").unwrap();

    let provider = ScriptedProvider::new(vec![tool_use(
        "tool-1",
        "run_sqlite",
        json!({"sql": "SELECT 'first';"}),
    )]);
    let adapter = ScriptedAdapter::new("sqlite", "run_sqlite", vec![ToolResult::ok("one")]);
    let mut config = base_config("first_task", 8);
    config.max_steps = 1;
    run_agent(&provider, &adapter, &paths, &config).await.unwrap();

    let provider = ScriptedProvider::new(vec![tool_use(
        "tool-1",
        "run_sqlite",
        json!({"sql": "SELECT 'second';"}),
    )]);
    let adapter = ScriptedAdapter::new("sqlite", "run_sqlite", vec![ToolResult::ok("two")]);
    let mut config = base_config("second_task", 8);
    config.max_steps = 1;
    run_agent(&provider, &adapter, &paths, &config).await.unwrap();

    let events = read_events(&paths.sessions_root.join("session-008").join("events.jsonl"));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tool_input["sql"], "SELECT 'second';");
}

#[tokio::test]
async fn executor_failure_injects_matching_lesson_hint() {
    let (_dir, paths) = track_with_task("hint_task");
    let error_text = "ERROR at line 1: TALLY syntax: TALLY group_col -> alias=func(agg_col)";
    let failing_input = json!({"sql": "TALLY region => total=sum(amount)"});

    // Seed one lesson keyed to the exact fingerprint the loop will compute.
    let fingerprint = fingerprint_of(
        &json!(error_text),
        &json!({"domain": "sqlite", "task_id": "hint_task"}),
        &failing_input,
    );
    let store = LessonStore::new(&paths.lessons_v2_path);
    store
        .upsert(vec![LessonRecord::from_candidate(LessonSeed {
            session_id: 3,
            task_id: "hint_task".into(),
            task: "hint task".into(),
            domain: "sqlite".into(),
            rule_text: "TALLY uses arrow syntax: TALLY key -> total=sum(amount).".into(),
            trigger_fingerprints: vec![fingerprint],
            tags: Vec::new(),
        })])
        .unwrap();

    let provider = ScriptedProvider::new(vec![tool_use("tool-1", "run_sqlite", failing_input)]);
    let adapter = ScriptedAdapter::new("sqlite", "run_sqlite", vec![ToolResult::err(error_text)]);
    let mut config = base_config("hint_task", 21);
    config.max_steps = 1;

    let result = run_agent(&provider, &adapter, &paths, &config).await.unwrap();

    let hinted: Vec<String> = collect_tool_result_texts(&result.messages)
        .into_iter()
        .filter(|text| text.contains(HINT_MARKER))
        .collect();
    assert_eq!(hinted.len(), 1);
    let bullets = hinted[0]
        .split(HINT_MARKER)
        .nth(1)
        .unwrap()
        .lines()
        .filter(|line| line.starts_with("- "))
        .count();
    assert_eq!(bullets, 1);
    assert!(hinted[0].contains("TALLY uses arrow syntax"));

    let events = read_events(&paths.sessions_root.join("session-021").join("events.jsonl"));
    assert_eq!(events.len(), 1);
    assert!(events[0].error.as_deref().unwrap().contains(HINT_MARKER));
    let annotation = events[0].memory_v2.as_ref().unwrap();
    assert_eq!(annotation.injected_lessons.len(), 1);
    assert_eq!(annotation.retrieval_scores[0].lane, "strict");
    assert_eq!(result.metrics["v2_error_events"], 1);
    assert_eq!(result.metrics["v2_lesson_activations"], 1);
}

#[tokio::test]
async fn cross_domain_hints_require_the_transfer_lane() {
    // A gridtool lesson must not leak into a fluxtool session by default.
    let (_dir, paths) = track_with_task("transfer_task");
    let store = LessonStore::new(&paths.lessons_v2_path);
    store
        .upsert(vec![LessonRecord::from_candidate(LessonSeed {
            session_id: 2,
            task_id: "aggregate_report".into(),
            task: "gridtool aggregate".into(),
            domain: "gridtool".into(),
            rule_text: "TALLY uses arrow syntax for grouped totals sum".into(),
            trigger_fingerprints: Vec::new(),
            tags: vec!["syntax_structure".into()],
        })])
        .unwrap();
    // Promote reliability so scoring clears zero without a fingerprint hit.
    let boosted: Vec<LessonRecord> = store
        .load()
        .into_iter()
        .map(|record| LessonRecord {
            status: LessonStatus::Promoted,
            reliability: 0.9,
            ..record
        })
        .collect();
    store.write(&boosted).unwrap();

    let error_text = "GROUP syntax error: expected arrow operator for grouped totals sum";

    // Transfer disabled: zero hints.
    let provider = ScriptedProvider::new(vec![tool_use(
        "tool-1",
        "run_fluxtool",
        json!({"sql": "GROUP region total=sum(amount)"}),
    )]);
    let adapter = ScriptedAdapter::new("fluxtool", "run_fluxtool", vec![ToolResult::err(error_text)]);
    let mut config = base_config("transfer_task", 31);
    config.domain = "fluxtool".into();
    config.max_steps = 1;
    let result = run_agent(&provider, &adapter, &paths, &config).await.unwrap();
    assert!(
        collect_tool_result_texts(&result.messages)
            .iter()
            .all(|text| !text.contains(HINT_MARKER))
    );
    assert_eq!(result.metrics["v2_transfer_lane_activations"], 0);

    // Transfer enabled: at most one hint, annotated with the transfer lane.
    let provider = ScriptedProvider::new(vec![tool_use(
        "tool-1",
        "run_fluxtool",
        json!({"sql": "GROUP region total=sum(amount)"}),
    )]);
    let adapter = ScriptedAdapter::new("fluxtool", "run_fluxtool", vec![ToolResult::err(error_text)]);
    let mut config = base_config("transfer_task", 32);
    config.domain = "fluxtool".into();
    config.max_steps = 1;
    config.transfer = TransferOptions {
        enabled: true,
        max_results: 1,
        score_weight: 0.35,
    };
    let result = run_agent(&provider, &adapter, &paths, &config).await.unwrap();
    let hinted: Vec<String> = collect_tool_result_texts(&result.messages)
        .into_iter()
        .filter(|text| text.contains(HINT_MARKER))
        .collect();
    assert_eq!(hinted.len(), 1);

    let events = read_events(&paths.sessions_root.join("session-032").join("events.jsonl"));
    let annotation = events[0].memory_v2.as_ref().unwrap();
    assert_eq!(annotation.retrieval_scores.len(), 1);
    assert_eq!(annotation.retrieval_scores[0].lane, "transfer");
    assert_eq!(result.metrics["v2_transfer_lane_activations"], 1);
}

#[tokio::test]
async fn demo_mode_suppresses_legacy_patch_hooks() {
    let (_dir, paths) = track_with_task("demo_task");
    // A real skill makes the manifest non-empty, which is what arms the
    // legacy patch pipeline.
    let skill_dir = paths.skills_root.join("sqlite").join("demo");
    std::fs::create_dir_all(&skill_dir).unwrap();
    std::fs::write(
        skill_dir.join("SKILL.md"),
        "---\nname: Demo\ndescription: Demo skill\nversion: 1\n---\n# Demo\n",
    )
    .unwrap();

    let run = |session_id: u64, demo: bool| {
        let paths = paths.clone();
        async move {
            let provider = ScriptedProvider::new(Vec::new());
            let adapter = ScriptedAdapter::new("sqlite", "run_sqlite", Vec::new());
            let mut config = base_config("demo_task", session_id);
            config.max_steps = 1;
            config.posttask_learn = true;
            config.memory_v2_demo_mode = demo;
            run_agent(&provider, &adapter, &paths, &config).await.unwrap()
        }
    };

    let demo_result = run(101, true).await;
    let demo_events = read_events(&paths.sessions_root.join("session-101").join("events.jsonl"));
    let demo_tools: Vec<&str> = demo_events.iter().map(|event| event.tool.as_str()).collect();
    assert!(!demo_tools.contains(&"posttask_hook"));
    assert!(!demo_tools.contains(&"promotion_gate"));
    assert_eq!(demo_result.metrics["posttask_patch_attempted"], false);
    assert_eq!(
        demo_result.metrics["posttask_skill_patching_skip_reason"],
        "memory_v2_demo_mode"
    );

    let normal_result = run(102, false).await;
    let normal_events = read_events(&paths.sessions_root.join("session-102").join("events.jsonl"));
    let normal_tools: Vec<&str> = normal_events.iter().map(|event| event.tool.as_str()).collect();
    assert!(normal_tools.contains(&"posttask_hook"));
    assert!(normal_tools.contains(&"promotion_gate"));
    assert_eq!(normal_result.metrics["posttask_patch_attempted"], true);
}

#[tokio::test]
async fn skill_gate_blocks_executor_until_a_skill_is_read() {
    let (_dir, paths) = track_with_task("gated_task");
    let skill_dir = paths.skills_root.join("sqlite").join("gated");
    std::fs::create_dir_all(&skill_dir).unwrap();
    std::fs::write(
        skill_dir.join("SKILL.md"),
        "---\nname: Gated task skill\ndescription: gated task rules\n---\nUse SELECT.\n",
    )
    .unwrap();

    let provider = ScriptedProvider::new(vec![
        tool_use("tool-1", "run_sqlite", json!({"sql": "SELECT 1;"})),
        tool_use("tool-2", "read_skill", json!({"skill_ref": "sqlite/gated"})),
        tool_use("tool-3", "run_sqlite", json!({"sql": "SELECT 1;"})),
    ]);
    let adapter = ScriptedAdapter::new("sqlite", "run_sqlite", vec![ToolResult::ok("1")]);
    let mut config = base_config("gated_task", 55);
    config.max_steps = 3;
    config.require_skill_read = true;

    let result = run_agent(&provider, &adapter, &paths, &config).await.unwrap();
    assert_eq!(result.metrics["skill_gate_blocks"], 1);
    assert_eq!(result.metrics["skill_reads"], 1);
    // Only the post-gate executor call reached the adapter.
    assert_eq!(adapter.executed().len(), 1);
    let texts = collect_tool_result_texts(&result.messages);
    assert!(texts.iter().any(|text| text.contains("Skill gate")));
}

#[tokio::test]
async fn opaque_aliases_translate_back_to_canonical_event_names() {
    let (_dir, paths) = track_with_task("opaque_task");
    let provider = ScriptedProvider::new(vec![tool_use(
        "tool-1",
        "dispatch",
        json!({"sql": "SELECT 1;"}),
    )]);
    let adapter = ScriptedAdapter::new("sqlite", "run_sqlite", vec![ToolResult::ok("1")]);
    let mut config = base_config("opaque_task", 77);
    config.max_steps = 1;
    config.opaque_tools = true;

    run_agent(&provider, &adapter, &paths, &config).await.unwrap();
    let events = read_events(&paths.sessions_root.join("session-077").join("events.jsonl"));
    assert_eq!(events[0].tool, "run_sqlite");
}
