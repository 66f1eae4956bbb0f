//! The agent control loop.
//!
//! One session: compose the system prompt, interleave LLM turns with
//! validated tool calls, capture structured error events on every executor
//! failure, inject retrieved lesson hints into error tool results, then run
//! the posttask pipeline (deterministic eval, LLM judge, critic, lesson
//! outcomes, legacy skill patches, escalation) and flush metrics.
//!
//! Errors are data inside the loop: tool failures flow back to the model as
//! error tool results so it can self-correct. Only a provider failure
//! unwinds, and it flushes partial metrics first.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::critic::{CriticContext, generate_lessons, load_relevant_lessons, prune_lessons, store_lessons};
use crate::domain::{
    DomainAdapter, READ_SKILL_TOOL_NAME, SHOW_FIXTURE_TOOL_NAME, ToolResult,
    VERIFY_CONTRACT_TOOL_NAME, show_fixture_text, verify_contract_tool_spec,
};
use crate::error::{Error, Result};
use crate::escalation::{
    EscalationConfig, escalate_if_needed, load_escalation_state, resolve_critic_model,
    save_escalation_state,
};
use crate::evaluator::{Evaluation, evaluate_session, load_contract};
use crate::improve::{
    auto_promote_queued_candidates, build_reason_based_updates, collect_recent_reason_counts,
    collect_recent_scores, parse_reflection_response, propose_skill_updates,
    queue_skill_update_candidates, skill_digest,
};
use crate::judge::{JudgeResult, default_judge_model, llm_judge};
use crate::provider::{
    ChatMessage, ContentBlock, LlmProvider, LlmRequest, ToolSpec, Usage,
};
use crate::skills::{
    SkillManifestEntry, build_skill_manifest, manifest_summaries_text, resolve_skill_content,
    route_manifest_entries,
};
use crate::validation::{build_tool_schema_map, validate_tool_input};
use cortex_memory::{
    ErrorChannel, ErrorEvent, Event, HintScore, InjectedLesson, KnowledgeProvider, Lane,
    LessonOutcome, LessonRecord, LessonSeed, LessonStore, LocalDocsKnowledgeProvider,
    MemoryAnnotation, OnErrorQuery, PreRunQuery, PromotionConfig, TransferOptions, apply_outcomes,
    ensure_session, retrieve_on_error, retrieve_pre_run, write_event, write_jsonl_line,
    write_metrics,
};

/// Marker prepended to injected hint bullets in error tool results.
pub const HINT_MARKER: &str = "--- HINT from prior sessions ---";
const MAX_HINTS_PER_ERROR: usize = 4;
const MAX_TOOL_OUTPUT_CHARS: usize = 4000;
const MAX_SKILL_BODY_CHARS: usize = 6000;
const DEFAULT_VALIDATION_RETRY_CAP: u32 = 2;
const CRITIC_EVENT_TAIL: usize = 20;
const BASELINE_SESSIONS: usize = 8;

/// How lessons are sourced and what context the critic sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LearningMode {
    /// Critic sees only the transcript.
    #[default]
    Legacy,
    /// Critic additionally receives local-doc knowledge chunks; the
    /// executor never sees them.
    Strict,
}

/// How much of the harness is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchitectureMode {
    /// Everything: verify_contract tool, forced continues, legacy patches.
    #[default]
    Full,
    /// Executor plus V2 memory only; no mid-session verification tool, no
    /// forced continues, no legacy skill patching.
    Simplified,
}

/// Destination of proposed skill patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PosttaskMode {
    /// Queue candidates behind the trend gate.
    #[default]
    Candidate,
    /// Apply digests-validated patches immediately.
    Direct,
}

/// Final verdict after combining the deterministic and judge verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalVerdict {
    Pass,
    Fail,
    Uncertain,
}

impl FinalVerdict {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FinalVerdict::Pass => "pass",
            FinalVerdict::Fail => "fail",
            FinalVerdict::Uncertain => "uncertain",
        }
    }

    /// Deterministic verdict OR judge verdict, `uncertain` on disagreement
    /// when the contract applied.
    #[must_use]
    pub fn resolve(evaluation: &Evaluation, judge: &JudgeResult) -> Self {
        if !evaluation.applicable {
            return if judge.passed { FinalVerdict::Pass } else { FinalVerdict::Fail };
        }
        match (evaluation.passed, judge.passed) {
            (true, true) => FinalVerdict::Pass,
            (false, false) => FinalVerdict::Fail,
            _ => FinalVerdict::Uncertain,
        }
    }
}

/// Filesystem layout of one track (tasks, skills, learning state, sessions).
///
/// Injected rather than global so tests run against a temp directory.
#[derive(Debug, Clone)]
pub struct HarnessPaths {
    pub track_root: PathBuf,
    pub tasks_root: PathBuf,
    pub skills_root: PathBuf,
    pub manifest_path: PathBuf,
    pub learning_root: PathBuf,
    pub sessions_root: PathBuf,
    pub lessons_path: PathBuf,
    pub lessons_v2_path: PathBuf,
    pub queue_path: PathBuf,
    pub promoted_path: PathBuf,
    pub escalation_state_path: PathBuf,
}

impl HarnessPaths {
    #[must_use]
    pub fn new(track_root: impl Into<PathBuf>) -> Self {
        let track_root = track_root.into();
        let skills_root = track_root.join("skills");
        let learning_root = track_root.join("learning");
        HarnessPaths {
            tasks_root: track_root.join("tasks"),
            manifest_path: skills_root.join("skills_manifest.json"),
            sessions_root: track_root.join("sessions"),
            lessons_path: learning_root.join("lessons.jsonl"),
            lessons_v2_path: learning_root.join("lessons_v2.jsonl"),
            queue_path: learning_root.join("pending_skill_patches.json"),
            promoted_path: learning_root.join("promoted_skill_patches.json"),
            escalation_state_path: learning_root.join("critic_escalation_state.json"),
            skills_root,
            learning_root,
            track_root,
        }
    }
}

/// Per-run configuration.
#[derive(Debug, Clone)]
pub struct AgentRunConfig {
    pub task_id: String,
    pub task: Option<String>,
    pub session_id: u64,
    pub max_steps: u64,
    pub domain: String,
    pub learning_mode: LearningMode,
    pub architecture_mode: ArchitectureMode,
    /// Disables skill loading and the skill gate entirely.
    pub bootstrap: bool,
    /// Replace tool names/descriptions with obscured aliases.
    pub opaque_tools: bool,
    pub posttask_mode: PosttaskMode,
    pub posttask_learn: bool,
    /// Suppress legacy skill patching while keeping the full V2 path.
    pub memory_v2_demo_mode: bool,
    pub transfer: TransferOptions,
    pub require_skill_read: bool,
    pub executor_model: String,
    pub critic_model: String,
    pub judge_model: Option<String>,
    pub auto_escalate_critic: bool,
    pub escalation: EscalationConfig,
    pub promotion_min_runs: usize,
    pub promotion_min_delta: f64,
    pub validation_retry_cap: u32,
}

impl AgentRunConfig {
    #[must_use]
    pub fn new(task_id: impl Into<String>, session_id: u64) -> Self {
        AgentRunConfig {
            task_id: task_id.into(),
            task: None,
            session_id,
            max_steps: 12,
            domain: "sqlite".into(),
            learning_mode: LearningMode::default(),
            architecture_mode: ArchitectureMode::default(),
            bootstrap: false,
            opaque_tools: false,
            posttask_mode: PosttaskMode::default(),
            posttask_learn: true,
            memory_v2_demo_mode: false,
            transfer: TransferOptions::default(),
            require_skill_read: true,
            executor_model: crate::config::DEFAULT_MODEL.into(),
            critic_model: crate::config::DEFAULT_MODEL.into(),
            judge_model: None,
            auto_escalate_critic: true,
            escalation: EscalationConfig::default(),
            promotion_min_runs: 3,
            promotion_min_delta: 0.2,
            validation_retry_cap: DEFAULT_VALIDATION_RETRY_CAP,
        }
    }
}

/// Outcome of one orchestrated session.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub messages: Vec<ChatMessage>,
    pub metrics: Value,
    pub verdict: FinalVerdict,
}

fn default_task_text(task_id: &str) -> String {
    match task_id {
        "import_aggregate" => concat!(
            "SQLite task: import_aggregate.\n",
            "Goal:\n",
            "1) Build table `sales(category TEXT, amount INTEGER)`.\n",
            "2) Import the CSV rows from `fixture.csv` into `sales`.\n",
            "3) Return grouped totals ordered by category:\n",
            "   SELECT category, SUM(amount) AS total FROM sales GROUP BY category ORDER BY category;\n",
            "Constraints:\n",
            "- Use only the provided tools.\n",
            "- Keep SQL deterministic and concise.\n",
        )
        .to_string(),
        "incremental_reconcile" => concat!(
            "SQLite task: incremental_reconcile.\n",
            "Goal:\n",
            "1) Ingest rows from the fixture into `ledger`.\n",
            "2) Deduplicate by `event_id` and store duplicate rows in `rejects`.\n",
            "3) Write checkpoint metadata in `checkpoint_log`.\n",
            "4) Return deterministic aggregate totals by category.\n",
            "Constraints:\n",
            "- Use only the provided tools.\n",
            "- Read relevant skills before execution.\n",
            "- Keep SQL deterministic and transaction-safe.\n",
        )
        .to_string(),
        other => format!("Task id: {other}. Use the executor tool to complete the task."),
    }
}

fn clip_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{clipped}...")
}

fn wall_clock_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

fn build_system_prompt(
    adapter: &dyn DomainAdapter,
    cfg: &AgentRunConfig,
    skills_text: &str,
    lessons_text: &str,
    prerun_block: &str,
    required_skill_refs: &BTreeSet<String>,
    forbidden_patterns: &[String],
) -> String {
    let mut prompt = adapter.system_prompt_fragment();
    if cfg.architecture_mode == ArchitectureMode::Full {
        prompt.push_str("- Use verify_contract after major changes and before stopping.\n");
    }
    prompt.push_str(&format!("- Active task_id: {}\n\n", cfg.task_id));
    prompt.push_str(&format!("Skills metadata:\n{skills_text}\n\n"));
    prompt.push_str(&format!("Prior lessons:\n{lessons_text}\n"));
    if !prerun_block.is_empty() {
        prompt.push_str(&format!("\nMemory hints from prior sessions:\n{prerun_block}\n"));
    }
    if !required_skill_refs.is_empty() {
        let refs: Vec<&String> = required_skill_refs.iter().collect();
        prompt.push_str(&format!(
            "\nSkill gate requirement:\n- Before the first {} call, read at least one of: {refs:?}\n",
            adapter.executor_tool_name(),
        ));
    }
    if !forbidden_patterns.is_empty() {
        prompt.push_str("\nContract forbidden patterns:\n");
        for pattern in forbidden_patterns {
            prompt.push_str(&format!("- {pattern}\n"));
        }
    }
    prompt
}

struct LoopState {
    step: u64,
    steps_metric: u64,
    tool_actions: u64,
    tool_errors: u64,
    skill_gate_blocks: u64,
    contract_verifications: u64,
    forced_continue_count: u64,
    skill_reads: u64,
    tool_validation_errors: u64,
    tool_validation_retry_attempts: u64,
    tool_validation_retry_capped_events: u64,
    consecutive_validation_failures: u32,
    reflection_reasons: Vec<Value>,
    v2_error_events: u64,
    v2_lesson_activations: u64,
    v2_transfer_lane_activations: u64,
    hint_retrievals: u64,
    hint_hits: u64,
    read_skill_refs: BTreeSet<String>,
    injected_lesson_ids: BTreeSet<String>,
    conflict_loser_ids: BTreeSet<String>,
    recent_fingerprints: Vec<String>,
    recent_error_texts: Vec<String>,
    usage_rollup: Usage,
    usage_log: Vec<Value>,
    events: Vec<Event>,
}

impl LoopState {
    fn new() -> Self {
        LoopState {
            step: 1,
            steps_metric: 0,
            tool_actions: 0,
            tool_errors: 0,
            skill_gate_blocks: 0,
            contract_verifications: 0,
            forced_continue_count: 0,
            skill_reads: 0,
            tool_validation_errors: 0,
            tool_validation_retry_attempts: 0,
            tool_validation_retry_capped_events: 0,
            consecutive_validation_failures: 0,
            reflection_reasons: Vec::new(),
            v2_error_events: 0,
            v2_lesson_activations: 0,
            v2_transfer_lane_activations: 0,
            hint_retrievals: 0,
            hint_hits: 0,
            read_skill_refs: BTreeSet::new(),
            injected_lesson_ids: BTreeSet::new(),
            conflict_loser_ids: BTreeSet::new(),
            recent_fingerprints: Vec::new(),
            recent_error_texts: Vec::new(),
            usage_rollup: Usage::default(),
            usage_log: Vec::new(),
            events: Vec::new(),
        }
    }
}

/// Everything the executor-failure path produces for one failed call.
struct FailureCapture {
    error_with_hints: String,
    annotation: Option<MemoryAnnotation>,
}

#[allow(clippy::too_many_arguments)]
fn capture_executor_failure(
    state: &mut LoopState,
    store: &LessonStore,
    memory_events_path: &Path,
    adapter_name: &str,
    task_id: &str,
    error_text: &str,
    tool_input: &Value,
    transfer: TransferOptions,
) -> FailureCapture {
    let event = ErrorEvent::new(
        ErrorChannel::HardFailure,
        error_text,
        json!({"domain": adapter_name, "task_id": task_id}),
        tool_input.clone(),
    );
    if let Err(error) = write_jsonl_line(memory_events_path, &event.to_json()) {
        warn!(%error, "failed to append memory event");
    }
    state.v2_error_events += 1;
    state.recent_fingerprints.push(event.fingerprint.clone());
    state.recent_error_texts.push(error_text.to_string());

    let (matches, losers) = retrieve_on_error(
        store,
        &OnErrorQuery {
            error_text: error_text.to_string(),
            fingerprint: event.fingerprint.clone(),
            domain: adapter_name.to_string(),
            task_id: String::new(),
            query_tags: event.tags.clone(),
            max_results: 3,
            include_domainless: false,
            transfer,
        },
    );
    state.hint_retrievals += 1;
    state.conflict_loser_ids.extend(losers);

    if matches.is_empty() {
        return FailureCapture {
            error_with_hints: error_text.to_string(),
            annotation: None,
        };
    }
    state.hint_hits += 1;

    let selected = &matches[..matches.len().min(MAX_HINTS_PER_ERROR)];
    let mut injected = Vec::new();
    let mut scores = Vec::new();
    let mut hint_text = format!("{error_text}\n\n{HINT_MARKER}");
    for row in selected {
        hint_text.push_str(&format!("\n- {}", row.lesson.rule_text));
        injected.push(InjectedLesson {
            lesson_id: row.lesson.lesson_id.clone(),
            rule_text: row.lesson.rule_text.clone(),
        });
        scores.push(HintScore::from_parts(row.lane, &row.score));
        state.injected_lesson_ids.insert(row.lesson.lesson_id.clone());
        state.v2_lesson_activations += 1;
        if row.lane == Lane::Transfer {
            state.v2_transfer_lane_activations += 1;
        }
    }
    debug!(hints = selected.len(), "injected lesson hints into error result");
    FailureCapture {
        error_with_hints: hint_text,
        annotation: Some(MemoryAnnotation {
            injected_lessons: injected,
            retrieval_scores: scores,
        }),
    }
}

/// Mean error/step/score baseline from recent sessions of the same task.
fn session_baseline(sessions_root: &Path, task_id: &str, current_session: u64) -> Option<(f64, f64, f64)> {
    let rows = collect_recent_scores(sessions_root, task_id, BASELINE_SESSIONS);
    let mut errors = Vec::new();
    let mut steps = Vec::new();
    let mut scores = Vec::new();
    let Ok(entries) = std::fs::read_dir(sessions_root) else {
        return None;
    };
    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path().join("metrics.json");
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(metrics) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if metrics.get("task_id").and_then(Value::as_str) != Some(task_id) {
            continue;
        }
        if metrics.get("session_id").and_then(Value::as_u64) == Some(current_session) {
            continue;
        }
        errors.push(metrics.get("tool_errors").and_then(Value::as_f64).unwrap_or(0.0));
        steps.push(metrics.get("steps").and_then(Value::as_f64).unwrap_or(0.0));
        scores.push(metrics.get("eval_score").and_then(Value::as_f64).unwrap_or(0.0));
    }
    if errors.is_empty() || rows.is_empty() {
        return None;
    }
    let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
    Some((mean(&errors), mean(&steps), mean(&scores)))
}

fn clamp_signed(value: f64) -> f64 {
    value.clamp(-1.0, 1.0)
}

/// Run one full session.
#[instrument(skip_all, fields(task_id = %cfg.task_id, session_id = cfg.session_id, domain = %cfg.domain))]
pub async fn run_agent(
    provider: &dyn LlmProvider,
    adapter: &dyn DomainAdapter,
    paths: &HarnessPaths,
    cfg: &AgentRunConfig,
) -> Result<AgentRunResult> {
    let time_start = wall_clock_seconds();
    let task_text = cfg
        .task
        .clone()
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| default_task_text(&cfg.task_id));

    let task_dir = paths.tasks_root.join(&cfg.task_id);
    if !task_dir.exists() {
        return Err(Error::Workspace(format!(
            "unknown task id {:?} (missing {})",
            cfg.task_id,
            task_dir.display()
        )));
    }

    let session = ensure_session(cfg.session_id, &paths.sessions_root, true)?;
    let workspace = adapter.prepare_workspace(&task_dir, &session.work_dir).await?;

    // V2 store: legacy rows migrate on every startup (idempotent).
    let store = LessonStore::new(&paths.lessons_v2_path);
    if let Err(error) = store.migrate_legacy(&paths.lessons_path) {
        warn!(%error, "legacy lesson migration failed");
    }

    // Skill routing. Bootstrap mode forces pure exploration: no skills, no
    // gate.
    let manifest_entries: Vec<SkillManifestEntry> = if cfg.bootstrap {
        Vec::new()
    } else {
        build_skill_manifest(&paths.skills_root, &paths.manifest_path)?
    };
    let routed_entries = route_manifest_entries(&task_text, &manifest_entries, 2);
    let routed_refs: Vec<String> = routed_entries
        .iter()
        .map(|entry| entry.skill_ref.clone())
        .collect();
    let required_skill_refs: BTreeSet<String> =
        if cfg.require_skill_read && !cfg.bootstrap && !routed_refs.is_empty() {
            routed_refs.iter().take(1).cloned().collect()
        } else {
            BTreeSet::new()
        };
    let skills_text = manifest_summaries_text(&routed_entries);

    // Legacy lesson text plus the V2 pre-run block.
    let (lessons_text, lessons_loaded) =
        load_relevant_lessons(&paths.lessons_path, &cfg.task_id, &task_text, 8, 5);
    let (prerun_matches, _) = retrieve_pre_run(
        &store,
        &PreRunQuery {
            task_id: cfg.task_id.clone(),
            domain: cfg.domain.clone(),
            task_text: task_text.clone(),
            recent_fingerprints: Vec::new(),
            query_tags: Vec::new(),
            max_results: 8,
        },
    );
    let prerun_lesson_ids: Vec<String> = prerun_matches
        .iter()
        .map(|row| row.lesson.lesson_id.clone())
        .collect();
    let prerun_block = prerun_matches
        .iter()
        .map(|row| format!("- {}", row.lesson.rule_text))
        .collect::<Vec<_>>()
        .join("\n");

    let (contract, _) = load_contract(&paths.tasks_root, &cfg.task_id);
    let forbidden_patterns = contract.signals.forbidden_sql_patterns.clone();

    let system_prompt = build_system_prompt(
        adapter,
        cfg,
        &skills_text,
        &lessons_text,
        &prerun_block,
        &required_skill_refs,
        &forbidden_patterns,
    );

    let fixture_refs = workspace.fixture_refs();
    let mut tools: Vec<ToolSpec> = adapter.tool_defs(&fixture_refs, cfg.opaque_tools);
    if cfg.architecture_mode == ArchitectureMode::Full {
        tools.push(verify_contract_tool_spec());
    }
    let schema_map = build_tool_schema_map(&tools);
    let alias_map = adapter.build_alias_map(cfg.opaque_tools);

    // Escalation: consume an override run if one is active.
    let mut escalation_state = load_escalation_state(&paths.escalation_state_path, &cfg.critic_model);
    let critic_model_for_run =
        resolve_critic_model(&cfg.critic_model, cfg.auto_escalate_critic, &mut escalation_state);

    let mut messages: Vec<ChatMessage> = vec![ChatMessage::user_text(task_text.clone())];
    let mut state = LoopState::new();
    let executor_tool = adapter.executor_tool_name().to_string();

    while state.step <= cfg.max_steps {
        state.steps_metric = state.steps_metric.max(state.step);
        let request = LlmRequest {
            model: cfg.executor_model.clone(),
            max_tokens: 1800,
            system: system_prompt.clone(),
            messages: messages.clone(),
            tools: tools.clone(),
        };
        let response = match provider.complete(&request).await {
            Ok(response) => response,
            Err(error) => {
                // Provider failures abort the session after a partial flush.
                let mut metrics = base_metrics(cfg, &state, &task_text, &critic_model_for_run);
                insert(&mut metrics, "orchestrator_error", json!(error.to_string()));
                let _ = write_metrics(&session.metrics_path, &Value::Object(metrics));
                return Err(error);
            }
        };
        state.usage_rollup.absorb(response.usage);
        state
            .usage_log
            .push(serde_json::to_value(response.usage).unwrap_or(Value::Null));

        let tool_uses: Vec<(String, String, Value)> = response
            .tool_uses()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();
        messages.push(ChatMessage::assistant_blocks(response.content.clone()));

        if tool_uses.is_empty() {
            let evaluation = evaluate_session(
                &task_text,
                &cfg.task_id,
                &state.events,
                &executor_tool,
                &workspace.work_dir.join("task.db"),
                &paths.tasks_root,
            )
            .await;
            if evaluation.passed
                || state.step >= cfg.max_steps
                || cfg.architecture_mode == ArchitectureMode::Simplified
            {
                debug!(step = state.step, passed = evaluation.passed, "model stopped");
                break;
            }
            state.forced_continue_count += 1;
            messages.push(ChatMessage::user_text(format!(
                "Contract is not passed yet. Continue with tools. Current reasons: {:?}. Use verify_contract after corrections.",
                evaluation.reasons,
            )));
            state.step += 1;
            continue;
        }

        let mut tool_results: Vec<ContentBlock> = Vec::new();
        let mut round_valid_call = false;
        let mut round_capped = false;

        for (tool_use_id, api_name, tool_input) in tool_uses {
            let canonical = alias_map
                .get(&api_name)
                .cloned()
                .unwrap_or_else(|| api_name.clone());
            state.tool_actions += 1;

            // Validation happens before any adapter dispatch; failures share
            // the step number with the eventual successful attempt.
            if let Some(validation_error) =
                validate_tool_input(&canonical, &tool_input, schema_map.get(&api_name))
            {
                state.tool_validation_errors += 1;
                state.consecutive_validation_failures += 1;
                if state.consecutive_validation_failures <= cfg.validation_retry_cap {
                    state.tool_validation_retry_attempts += 1;
                } else {
                    state.tool_validation_retry_capped_events += 1;
                    state.consecutive_validation_failures = 0;
                    state
                        .reflection_reasons
                        .push(json!({"reason": "validation_retry_cap", "step": state.step}));
                    round_capped = true;
                }
                state.tool_errors += 1;
                let mut event = Event::new(state.step, &canonical, tool_input.clone());
                event.ok = false;
                event.error = Some(validation_error.clone());
                write_event(&session.events_path, &event)?;
                state.events.push(event);
                tool_results.push(ContentBlock::tool_result(&tool_use_id, true, validation_error));
                continue;
            }
            state.consecutive_validation_failures = 0;
            round_valid_call = true;

            let mut annotation: Option<MemoryAnnotation> = None;
            let result: ToolResult = if canonical == READ_SKILL_TOOL_NAME {
                state.skill_reads += 1;
                let skill_ref = tool_input
                    .get("skill_ref")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match resolve_skill_content(&manifest_entries, skill_ref) {
                    Ok(content) => {
                        state.read_skill_refs.insert(skill_ref.to_string());
                        ToolResult::ok(clip_text(
                            &format!("skill_ref: {skill_ref}\n\n{content}"),
                            MAX_SKILL_BODY_CHARS,
                        ))
                    }
                    Err(error) => ToolResult::err(error),
                }
            } else if canonical == SHOW_FIXTURE_TOOL_NAME {
                let path_ref = tool_input
                    .get("path_ref")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let raw = show_fixture_text(&workspace, path_ref);
                if raw.is_error() {
                    raw
                } else {
                    ToolResult::ok(clip_text(
                        &format!("path_ref: {path_ref}\n\n{}", raw.output),
                        MAX_SKILL_BODY_CHARS,
                    ))
                }
            } else if canonical == VERIFY_CONTRACT_TOOL_NAME {
                state.contract_verifications += 1;
                let evaluation = evaluate_session(
                    &task_text,
                    &cfg.task_id,
                    &state.events,
                    &executor_tool,
                    &workspace.work_dir.join("task.db"),
                    &paths.tasks_root,
                )
                .await;
                ToolResult::ok(serde_json::to_string(&evaluation.to_value()).unwrap_or_default())
            } else if canonical == executor_tool {
                if !required_skill_refs.is_empty()
                    && state.read_skill_refs.is_disjoint(&required_skill_refs)
                {
                    state.skill_gate_blocks += 1;
                    let refs: Vec<&String> = required_skill_refs.iter().collect();
                    ToolResult::err(format!(
                        "Skill gate: call read_skill for at least one routed skill before {executor_tool}. Required refs: {refs:?}",
                    ))
                } else {
                    let exec = adapter.execute(&canonical, &tool_input, &workspace).await;
                    if let Some(error_text) = &exec.error {
                        let capture = capture_executor_failure(
                            &mut state,
                            &store,
                            &session.memory_events_path,
                            adapter.name(),
                            &cfg.task_id,
                            error_text,
                            &tool_input,
                            cfg.transfer,
                        );
                        annotation = capture.annotation;
                        ToolResult::err(capture.error_with_hints)
                    } else {
                        let payload = if exec.output.is_empty() { "(ok)" } else { exec.output.as_str() };
                        ToolResult::ok(clip_text(payload, MAX_TOOL_OUTPUT_CHARS))
                    }
                }
            } else {
                ToolResult::err(format!("Unknown tool requested: {canonical:?}"))
            };

            if result.is_error() {
                state.tool_errors += 1;
            }
            let mut event = Event::new(state.step, &canonical, tool_input.clone());
            event.ok = !result.is_error();
            event.error = result.error.clone();
            event.output = Value::String(result.output.clone());
            event.memory_v2 = annotation;
            write_event(&session.events_path, &event)?;
            state.events.push(event);

            let body = result.error.clone().unwrap_or_else(|| result.output.clone());
            tool_results.push(ContentBlock::tool_result(&tool_use_id, result.is_error(), body));
        }

        messages.push(ChatMessage::user_blocks(tool_results));
        if round_capped {
            messages.push(ChatMessage::user_text(
                "Trigger: validation_retry_cap. Reflect before retrying.",
            ));
            state.step += 1;
        } else if round_valid_call {
            state.step += 1;
        }
    }

    // Posttask pipeline.
    let final_state = adapter.capture_final_state(&workspace).await;
    let evaluation = evaluate_session(
        &task_text,
        &cfg.task_id,
        &state.events,
        &executor_tool,
        &workspace.work_dir.join("task.db"),
        &paths.tasks_root,
    )
    .await;
    let judge_model = cfg
        .judge_model
        .clone()
        .unwrap_or_else(|| default_judge_model(&cfg.executor_model));
    let judge = llm_judge(
        provider,
        &judge_model,
        &task_text,
        &state.events,
        &final_state,
        adapter.name(),
    )
    .await;
    let verdict = FinalVerdict::resolve(&evaluation, &judge);
    info!(verdict = verdict.as_str(), eval_score = evaluation.score, "session evaluated");

    let mut lessons_generated = 0u64;
    let mut v2_upsert = json!({"inserted": 0, "merged": 0, "conflict_links": 0, "total": 0});
    let mut critic_no_updates = false;
    let mut posttask_patch_attempted = false;
    let mut posttask_candidates_queued = 0u64;
    let mut posttask_patch_applied = 0u64;
    let mut posttask_skip_reason: Option<&str> = None;
    let mut auto_promotion = json!({"applied": 0, "reason": "not_attempted"});

    let fully_passed = evaluation.applicable && evaluation.passed && evaluation.score >= 1.0;
    if cfg.posttask_learn && !fully_passed {
        // Strict mode hands the critic local-doc context the executor never
        // saw.
        let knowledge_context = if cfg.learning_mode == LearningMode::Strict {
            let provider_docs = adapter.docs_manifest();
            let query = format!("{task_text}\n{}", state.recent_error_texts.join("\n"));
            let retriever = LocalDocsKnowledgeProvider::default();
            retriever
                .retrieve(&query, &provider_docs, 4)
                .into_iter()
                .map(|chunk| chunk.text)
                .collect::<Vec<_>>()
                .join("\n\n")
        } else {
            String::new()
        };

        let events_tail: Vec<Value> = state
            .events
            .iter()
            .rev()
            .take(CRITIC_EVENT_TAIL)
            .rev()
            .map(|event| {
                json!({
                    "step": event.step,
                    "tool": event.tool,
                    "tool_input": event.tool_input,
                    "ok": event.ok,
                    "error": event.error,
                })
            })
            .collect();
        let skill_refs_used: Vec<String> = state.read_skill_refs.iter().cloned().collect();
        let critic_context = CriticContext {
            session_id: cfg.session_id,
            task_id: &cfg.task_id,
            task: &task_text,
            evaluation: &evaluation,
            events_tail: &events_tail,
            skill_refs_used: &skill_refs_used,
            knowledge_context: &knowledge_context,
        };
        let generation = generate_lessons(
            provider,
            &critic_model_for_run,
            &critic_context,
            adapter.quality_keywords(),
            crate::critic::DEFAULT_MIN_QUALITY,
        )
        .await;
        lessons_generated = store_lessons(&paths.lessons_path, &generation.filtered_lessons)
            .unwrap_or(0);
        let _ = prune_lessons(&paths.lessons_path, adapter.quality_keywords(), 20);

        // Every kept lesson becomes a V2 candidate keyed to this run's
        // failure fingerprints.
        let candidate_records: Vec<LessonRecord> = generation
            .filtered_lessons
            .iter()
            .map(|lesson| {
                LessonRecord::from_candidate(LessonSeed {
                    session_id: cfg.session_id,
                    task_id: cfg.task_id.clone(),
                    task: task_text.clone(),
                    domain: cfg.domain.clone(),
                    rule_text: lesson.lesson.clone(),
                    trigger_fingerprints: state.recent_fingerprints.clone(),
                    tags: Vec::new(),
                })
            })
            .collect();
        if !candidate_records.is_empty() {
            match store.upsert(candidate_records) {
                Ok(summary) => v2_upsert = serde_json::to_value(summary).unwrap_or(v2_upsert),
                Err(error) => warn!(%error, "lesson upsert failed"),
            }
        }

        // Legacy skill-patch pipeline; demo mode suppresses it entirely.
        if cfg.memory_v2_demo_mode {
            posttask_skip_reason = Some("memory_v2_demo_mode");
        } else if cfg.architecture_mode == ArchitectureMode::Simplified {
            posttask_skip_reason = Some("architecture_simplified");
        } else if !manifest_entries.is_empty() {
            posttask_patch_attempted = true;
            let mut skill_digests: BTreeMap<String, String> = BTreeMap::new();
            let mut skill_snapshots: Vec<String> = Vec::new();
            for skill_ref in routed_refs.iter().take(3) {
                if let Ok(content) = resolve_skill_content(&manifest_entries, skill_ref) {
                    let digest = skill_digest(&content);
                    skill_snapshots
                        .push(format!("skill_ref: {skill_ref}\nskill_digest: {digest}\n{content}"));
                    skill_digests.insert(skill_ref.clone(), digest);
                }
            }
            let error_steps: Vec<u64> = state
                .events
                .iter()
                .filter(|event| !event.ok)
                .map(|event| event.step)
                .collect();
            let (mut proposed, mut confidence) = build_reason_based_updates(
                &evaluation,
                &state.read_skill_refs,
                &routed_refs,
                &skill_digests,
                &error_steps,
            );
            if proposed.is_empty() {
                let (updates, critic_confidence, raw) = propose_skill_updates(
                    provider,
                    &critic_model_for_run,
                    &task_text,
                    &evaluation,
                    &events_tail,
                    &skill_snapshots,
                )
                .await;
                if updates.is_empty() {
                    let (parsed, parsed_confidence) = parse_reflection_response(&raw);
                    proposed = parsed;
                    confidence = parsed_confidence;
                } else {
                    proposed = updates;
                    confidence = critic_confidence;
                }
            }
            critic_no_updates = proposed.is_empty();

            let required_digests: BTreeMap<String, String> = proposed
                .iter()
                .map(|update| (update.skill_ref.clone(), update.skill_digest.clone()))
                .collect();
            let allowed_refs: BTreeSet<String> = if state.read_skill_refs.is_empty() {
                routed_refs.iter().cloned().collect()
            } else {
                state.read_skill_refs.clone()
            };

            let reason_counts =
                collect_recent_reason_counts(&paths.sessions_root, &cfg.task_id, 12);
            let reason_recurrence = evaluation
                .reasons
                .iter()
                .map(|reason| reason_counts.get(reason).copied().unwrap_or(0))
                .max()
                .unwrap_or(0);
            let allow_queue = !evaluation.passed && reason_recurrence >= 2;

            let patch_result = match cfg.posttask_mode {
                PosttaskMode::Direct => {
                    let result = crate::improve::apply_skill_updates(
                        &manifest_entries,
                        &proposed,
                        confidence,
                        &paths.skills_root,
                        &paths.manifest_path,
                        &required_digests,
                        &allowed_refs,
                    );
                    posttask_patch_applied =
                        result.get("applied").and_then(Value::as_u64).unwrap_or(0);
                    result
                }
                PosttaskMode::Candidate if allow_queue => {
                    let result = queue_skill_update_candidates(
                        &paths.queue_path,
                        &proposed,
                        confidence,
                        cfg.session_id,
                        &cfg.task_id,
                        &required_digests,
                        &allowed_refs,
                        &evaluation,
                    );
                    posttask_candidates_queued =
                        result.get("queued").and_then(Value::as_u64).unwrap_or(0);
                    result
                }
                PosttaskMode::Candidate => {
                    json!({
                        "attempted": false,
                        "queued": 0,
                        "skipped_reason": "reason_recurrence_below_threshold_or_eval_passed",
                    })
                }
            };

            let mut hook_event = Event::new(
                state.steps_metric + 1,
                "posttask_hook",
                json!({"mode": posttask_mode_str(cfg.posttask_mode), "critic_model": critic_model_for_run}),
            );
            hook_event.output = json!({
                "confidence": confidence,
                "update_count": proposed.len(),
                "reason_recurrence": reason_recurrence,
                "result": patch_result,
            })
            .to_string()
            .into();
            write_event(&session.events_path, &hook_event)?;

            auto_promotion = auto_promote_queued_candidates(
                &manifest_entries,
                &paths.queue_path,
                &paths.promoted_path,
                &paths.sessions_root,
                &cfg.task_id,
                &paths.skills_root,
                &paths.manifest_path,
                cfg.promotion_min_runs,
                cfg.promotion_min_delta,
            );
            let mut gate_event = Event::new(
                state.steps_metric + 2,
                "promotion_gate",
                json!({
                    "task_id": cfg.task_id,
                    "min_runs": cfg.promotion_min_runs,
                    "min_delta": cfg.promotion_min_delta,
                }),
            );
            gate_event.output = auto_promotion.to_string().into();
            write_event(&session.events_path, &gate_event)?;
        }
    }

    // Lesson outcomes: injected lessons score against the running baseline;
    // retrieval conflict losers take a contradiction loss.
    let mut outcomes: Vec<LessonOutcome> = Vec::new();
    if let Some((baseline_errors, baseline_steps, baseline_score)) =
        session_baseline(&paths.sessions_root, &cfg.task_id, cfg.session_id)
    {
        let error_reduction =
            clamp_signed((baseline_errors - state.tool_errors as f64) / baseline_errors.max(1.0));
        let step_gain =
            clamp_signed((baseline_steps - state.steps_metric as f64) / baseline_steps.max(1.0));
        let referee_gain = clamp_signed(evaluation.score - baseline_score);
        for lesson_id in &state.injected_lesson_ids {
            let mut outcome = LessonOutcome::new(lesson_id.clone(), error_reduction, step_gain);
            outcome.referee_score_gain = Some(referee_gain);
            outcome.major_regression = error_reduction <= -0.5;
            outcomes.push(outcome);
        }
    }
    for loser_id in &state.conflict_loser_ids {
        let mut outcome = LessonOutcome::new(loser_id.clone(), 0.0, 0.0);
        outcome.contradiction_lost = true;
        outcomes.push(outcome);
    }
    let outcome_summary = match apply_outcomes(&store, &outcomes, &PromotionConfig::default()) {
        Ok(summary) => summary,
        Err(error) => {
            warn!(%error, "outcome application failed");
            cortex_memory::OutcomeSummary::default()
        }
    };

    // Escalation bookkeeping for the next run.
    escalate_if_needed(
        &mut escalation_state,
        &cfg.critic_model,
        cfg.auto_escalate_critic,
        evaluation.score,
        evaluation.passed,
        critic_no_updates,
        &cfg.escalation,
    );
    if let Err(error) = save_escalation_state(&paths.escalation_state_path, &escalation_state) {
        warn!(%error, "failed to persist escalation state");
    }

    let mut metrics = base_metrics(cfg, &state, &task_text, &critic_model_for_run);
    insert(&mut metrics, "eval_passed", json!(evaluation.passed));
    insert(&mut metrics, "eval_score", json!(evaluation.score));
    insert(&mut metrics, "eval_reasons", json!(evaluation.reasons));
    insert(&mut metrics, "eval_applicable", json!(evaluation.applicable));
    insert(&mut metrics, "judge_model", json!(judge_model));
    insert(&mut metrics, "judge_passed", json!(judge.passed));
    insert(&mut metrics, "judge_score", json!(judge.score));
    insert(&mut metrics, "judge_reasons", json!(judge.reasons));
    insert(&mut metrics, "final_verdict", json!(verdict.as_str()));
    insert(&mut metrics, "lessons_loaded", json!(lessons_loaded));
    insert(&mut metrics, "lessons_generated", json!(lessons_generated));
    insert(&mut metrics, "v2_lessons_loaded", json!(prerun_lesson_ids.len()));
    insert(&mut metrics, "v2_prerun_lesson_ids", json!(prerun_lesson_ids));
    insert(&mut metrics, "v2_upsert", v2_upsert);
    insert(&mut metrics, "v2_promoted", json!(outcome_summary.promoted));
    insert(&mut metrics, "v2_suppressed", json!(outcome_summary.suppressed));
    insert(
        &mut metrics,
        "v2_retrieval_help_ratio",
        if state.hint_retrievals == 0 {
            Value::Null
        } else {
            json!(state.hint_hits as f64 / state.hint_retrievals as f64)
        },
    );
    insert(
        &mut metrics,
        "posttask_patch_attempted",
        json!(posttask_patch_attempted),
    );
    insert(
        &mut metrics,
        "posttask_candidates_queued",
        json!(posttask_candidates_queued),
    );
    insert(&mut metrics, "posttask_patch_applied", json!(posttask_patch_applied));
    insert(
        &mut metrics,
        "posttask_skill_patching_skip_reason",
        posttask_skip_reason.map_or(Value::Null, |reason| json!(reason)),
    );
    insert(
        &mut metrics,
        "auto_promotion_applied",
        auto_promotion.get("applied").cloned().unwrap_or(json!(0)),
    );
    insert(
        &mut metrics,
        "auto_promotion_reason",
        auto_promotion.get("reason").cloned().unwrap_or(Value::Null),
    );
    insert(&mut metrics, "escalation_state", escalation_state.snapshot());
    insert(
        &mut metrics,
        "low_score_streak",
        json!(escalation_state.low_score_streak),
    );
    insert(
        &mut metrics,
        "critic_no_updates_streak",
        json!(escalation_state.critic_no_updates_streak),
    );
    insert(&mut metrics, "fail_streak", json!(escalation_state.fail_streak));
    insert(
        &mut metrics,
        "elapsed_s",
        json!(((wall_clock_seconds() - time_start) * 1000.0).round() / 1000.0),
    );
    let metrics = Value::Object(metrics);
    write_metrics(&session.metrics_path, &metrics)?;

    Ok(AgentRunResult {
        messages,
        metrics,
        verdict,
    })
}

fn posttask_mode_str(mode: PosttaskMode) -> &'static str {
    match mode {
        PosttaskMode::Candidate => "candidate",
        PosttaskMode::Direct => "direct",
    }
}

fn insert(map: &mut Map<String, Value>, key: &str, value: Value) {
    map.insert(key.to_string(), value);
}

fn base_metrics(
    cfg: &AgentRunConfig,
    state: &LoopState,
    task_text: &str,
    critic_model: &str,
) -> Map<String, Value> {
    let mut metrics = Map::new();
    insert(&mut metrics, "session_id", json!(cfg.session_id));
    insert(&mut metrics, "task_id", json!(cfg.task_id));
    insert(&mut metrics, "task", json!(task_text));
    insert(&mut metrics, "domain", json!(cfg.domain));
    insert(&mut metrics, "steps", json!(state.steps_metric));
    insert(&mut metrics, "tool_actions", json!(state.tool_actions));
    insert(&mut metrics, "tool_errors", json!(state.tool_errors));
    insert(&mut metrics, "skill_gate_blocks", json!(state.skill_gate_blocks));
    insert(
        &mut metrics,
        "contract_verifications",
        json!(state.contract_verifications),
    );
    insert(
        &mut metrics,
        "forced_continue_count",
        json!(state.forced_continue_count),
    );
    insert(&mut metrics, "skill_reads", json!(state.skill_reads));
    insert(
        &mut metrics,
        "tool_validation_errors",
        json!(state.tool_validation_errors),
    );
    insert(
        &mut metrics,
        "tool_validation_retry_attempts",
        json!(state.tool_validation_retry_attempts),
    );
    insert(
        &mut metrics,
        "tool_validation_retry_capped_events",
        json!(state.tool_validation_retry_capped_events),
    );
    insert(
        &mut metrics,
        "v2_reflection_prompts",
        json!(state.reflection_reasons.len()),
    );
    insert(
        &mut metrics,
        "v2_reflection_reasons",
        json!(state.reflection_reasons),
    );
    insert(&mut metrics, "v2_error_events", json!(state.v2_error_events));
    insert(
        &mut metrics,
        "v2_lesson_activations",
        json!(state.v2_lesson_activations),
    );
    insert(
        &mut metrics,
        "v2_transfer_lane_activations",
        json!(state.v2_transfer_lane_activations),
    );
    insert(&mut metrics, "executor_model", json!(cfg.executor_model));
    insert(&mut metrics, "critic_model", json!(critic_model));
    insert(
        &mut metrics,
        "usage_total",
        serde_json::to_value(state.usage_rollup).unwrap_or(Value::Null),
    );
    insert(&mut metrics, "usage", json!(state.usage_log));
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_resolution_matrix() {
        let evaluation = |applicable: bool, passed: bool| Evaluation {
            applicable,
            passed,
            score: if passed { 1.0 } else { 0.0 },
            reasons: Vec::new(),
            evidence: Value::Null,
            contract_path: String::new(),
        };
        let judge = |passed: bool| JudgeResult {
            passed,
            score: if passed { 1.0 } else { 0.0 },
            reasons: Vec::new(),
            raw_response: String::new(),
        };
        assert_eq!(
            FinalVerdict::resolve(&evaluation(true, true), &judge(true)),
            FinalVerdict::Pass
        );
        assert_eq!(
            FinalVerdict::resolve(&evaluation(true, false), &judge(false)),
            FinalVerdict::Fail
        );
        assert_eq!(
            FinalVerdict::resolve(&evaluation(true, true), &judge(false)),
            FinalVerdict::Uncertain
        );
        assert_eq!(
            FinalVerdict::resolve(&evaluation(false, false), &judge(true)),
            FinalVerdict::Pass
        );
    }

    #[test]
    fn paths_derive_standard_layout() {
        let paths = HarnessPaths::new("/tmp/track");
        assert!(paths.lessons_v2_path.ends_with("learning/lessons_v2.jsonl"));
        assert!(paths.manifest_path.ends_with("skills/skills_manifest.json"));
        assert!(paths.sessions_root.ends_with("sessions"));
    }

    #[test]
    fn default_task_text_covers_known_tasks() {
        assert!(default_task_text("import_aggregate").contains("GROUP BY category"));
        assert!(default_task_text("incremental_reconcile").contains("checkpoint_log"));
        assert!(default_task_text("mystery").contains("mystery"));
    }
}
