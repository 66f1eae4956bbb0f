//! Legacy skill-file patch pipeline.
//!
//! Preserved from the original self-improvement track: the critic may
//! propose *skill file patches* (replace weak rules, append learned
//! bullets). Patches are never applied eagerly — candidates queue up and a
//! trend gate promotes at most one only after scores for the task improve
//! monotonically across recent sessions. Digest checks pin every patch to
//! the exact skill content the critic saw, and a `.bak` is written before
//! any replacement.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::evaluator::{
    Evaluation, REASON_MATCHED_FORBIDDEN, REASON_MISSING_REQUIRED, REASON_QUERY_MISMATCH,
    REASON_TOO_MANY_ERRORS,
};
use crate::provider::{ChatMessage, LlmProvider, LlmRequest, extract_json_object};
use crate::skills::{SkillManifestEntry, build_skill_manifest};
use cortex_memory::text::jaccard;

const MAX_SKILLS_PER_PATCH: usize = 2;
const MIN_PATCH_CONFIDENCE: f64 = 0.7;
const MAX_APPEND_BULLETS: usize = 5;
const MAX_REPLACE_RULES: usize = 5;
const MAX_BULLET_CHARS: usize = 220;
const MAX_ROOT_CAUSE_CHARS: usize = 400;
const MAX_EVIDENCE_STEPS: usize = 8;

/// One find/replace rewrite inside a skill body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceRule {
    pub find: String,
    pub replace: String,
}

/// A proposed patch against one skill document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillUpdate {
    pub skill_ref: String,
    /// SHA-256 of the skill content the proposal was based on.
    pub skill_digest: String,
    pub root_cause: String,
    pub evidence_steps: Vec<u64>,
    pub replace_rules: Vec<ReplaceRule>,
    pub append_bullets: Vec<String>,
}

/// SHA-256 digest of skill content (full hex).
#[must_use]
pub fn skill_digest(content: &str) -> String {
    Sha256::digest(content.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn parse_update_item(item: &Value) -> Option<SkillUpdate> {
    let object = item.as_object()?;
    let skill_ref = object.get("skill_ref").and_then(Value::as_str)?;
    let digest = object.get("skill_digest").and_then(Value::as_str)?;
    let root_cause = object.get("root_cause").and_then(Value::as_str)?;
    let steps: Vec<u64> = object
        .get("evidence_steps")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(Value::as_i64)
        .filter(|step| *step > 0)
        .map(|step| step as u64)
        .take(MAX_EVIDENCE_STEPS)
        .collect();
    if steps.is_empty() {
        return None;
    }

    let mut replace_rules = Vec::new();
    if let Some(rules) = object.get("replace_rules").and_then(Value::as_array) {
        for rule in rules.iter().take(MAX_REPLACE_RULES) {
            let Some(find) = rule.get("find").and_then(Value::as_str) else {
                continue;
            };
            let Some(replace) = rule.get("replace").and_then(Value::as_str) else {
                continue;
            };
            let find = collapse_ws(find);
            let replace = collapse_ws(replace);
            if !find.is_empty() && !replace.is_empty() {
                replace_rules.push(ReplaceRule { find, replace });
            }
        }
    }
    let mut append_bullets = Vec::new();
    if let Some(bullets) = object.get("append_bullets").and_then(Value::as_array) {
        for bullet in bullets.iter().take(MAX_APPEND_BULLETS) {
            let Some(text) = bullet.as_str() else { continue };
            let normalized = collapse_ws(text);
            if !normalized.is_empty() {
                append_bullets.push(normalized.chars().take(MAX_BULLET_CHARS).collect());
            }
        }
    }
    if replace_rules.is_empty() && append_bullets.is_empty() {
        return None;
    }

    Some(SkillUpdate {
        skill_ref: skill_ref.trim().to_string(),
        skill_digest: digest.trim().to_lowercase(),
        root_cause: collapse_ws(root_cause).chars().take(MAX_ROOT_CAUSE_CHARS).collect(),
        evidence_steps: steps,
        replace_rules,
        append_bullets,
    })
}

/// Parse a critic reflection response into updates plus confidence.
#[must_use]
pub fn parse_reflection_response(raw: &str) -> (Vec<SkillUpdate>, f64) {
    let Some(object) = extract_json_object(raw) else {
        return (Vec::new(), 0.0);
    };
    let confidence = object.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
    let updates = object
        .get("skill_updates")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_update_item).collect())
        .unwrap_or_default();
    (updates, confidence)
}

/// Ask the critic model for skill patches grounded in the run transcript.
#[instrument(skip_all, fields(model))]
pub async fn propose_skill_updates(
    provider: &dyn LlmProvider,
    model: &str,
    task: &str,
    evaluation: &Evaluation,
    events_tail: &[Value],
    skill_snapshots: &[String],
) -> (Vec<SkillUpdate>, f64, String) {
    let system = concat!(
        "You are a skill-maintenance critic for a tool-using agent.\n",
        "Return STRICT JSON only:\n",
        "{\"confidence\": 0.0-1.0, \"skill_updates\": [{\"skill_ref\": \"...\", ",
        "\"skill_digest\": \"...\", \"root_cause\": \"...\", \"evidence_steps\": [1], ",
        "\"replace_rules\": [{\"find\": \"...\", \"replace\": \"...\"}], ",
        "\"append_bullets\": [\"...\"]}]}\n",
        "Rules:\n",
        "- Only patch skills whose snapshot (with skill_digest) is provided.\n",
        "- Every update MUST cite evidence_steps from the event tail.\n",
        "- Prefer one precise replace_rule over broad appends.\n",
        "- Return {\"confidence\": 0.0, \"skill_updates\": []} when no durable fix exists.\n",
    );
    let user = format!(
        "TASK:\n{task}\n\nEVAL:\n{}\n\nEVENTS_TAIL:\n{}\n\nSKILL_SNAPSHOTS:\n{}",
        serde_json::to_string(&evaluation.to_value()).unwrap_or_default(),
        serde_json::to_string(events_tail).unwrap_or_default(),
        skill_snapshots.join("\n\n---\n\n"),
    );
    let request = LlmRequest {
        model: model.to_string(),
        max_tokens: 900,
        system: system.to_string(),
        messages: vec![ChatMessage::user_text(user)],
        tools: Vec::new(),
    };
    let Ok(response) = provider.complete(&request).await else {
        return (Vec::new(), 0.0, String::new());
    };
    let raw = response.text();
    let (updates, confidence) = parse_reflection_response(&raw);
    (updates, confidence, raw)
}

/// Deterministic fallback: synthesize updates straight from evaluator
/// reasons when the routed skills were actually read.
#[must_use]
pub fn build_reason_based_updates(
    evaluation: &Evaluation,
    read_skill_refs: &BTreeSet<String>,
    routed_refs: &[String],
    skill_digests: &BTreeMap<String, String>,
    error_steps: &[u64],
) -> (Vec<SkillUpdate>, f64) {
    if evaluation.reasons.is_empty() {
        return (Vec::new(), 0.0);
    }
    let target_ref = read_skill_refs
        .iter()
        .find(|skill_ref| skill_digests.contains_key(*skill_ref))
        .or_else(|| {
            routed_refs
                .iter()
                .find(|skill_ref| skill_digests.contains_key(*skill_ref))
        })
        .cloned();
    let Some(target_ref) = target_ref else {
        return (Vec::new(), 0.0);
    };
    let Some(digest) = skill_digests.get(&target_ref).filter(|digest| !digest.is_empty()) else {
        return (Vec::new(), 0.0);
    };

    let mut evidence: Vec<u64> = error_steps.to_vec();
    evidence.sort_unstable();
    evidence.dedup();
    evidence.truncate(MAX_EVIDENCE_STEPS);
    if evidence.is_empty() {
        evidence.push(1);
    }

    let mut bullets: Vec<String> = Vec::new();
    for reason in &evaluation.reasons {
        let bullet = match reason.as_str() {
            REASON_QUERY_MISMATCH => {
                "Before finishing, run verify_contract and reconcile every mismatched required query with minimal edits."
            }
            REASON_MATCHED_FORBIDDEN => {
                "Never use forbidden operations from the contract; prefer safe rollbacks and allowed rewrites."
            }
            REASON_MISSING_REQUIRED => {
                "Ensure required command phases are explicit (setup, mandatory writes, and the required checkpoint)."
            }
            REASON_TOO_MANY_ERRORS => {
                "After the first error, inspect schema/state and issue one corrective command before further mutations."
            }
            _ => continue,
        };
        bullets.push(bullet.to_string());
    }
    bullets.truncate(3);
    if bullets.is_empty() {
        return (Vec::new(), 0.0);
    }

    let update = SkillUpdate {
        skill_ref: target_ref,
        skill_digest: digest.clone(),
        root_cause: "Deterministic evaluator reasons indicate repeated contract-level execution failures."
            .to_string(),
        evidence_steps: evidence,
        replace_rules: Vec::new(),
        append_bullets: bullets,
    };
    (vec![update], 0.86)
}

/// Result counters shared by apply/queue/promote paths.
fn front_matter_span(text: &str) -> Option<(usize, BTreeMap<String, String>)> {
    let mut offset = 0usize;
    let mut lines = text.split_inclusive('\n');
    let first = lines.next()?;
    if first.trim() != "---" {
        return None;
    }
    offset += first.len();
    let mut meta = BTreeMap::new();
    for line in lines {
        offset += line.len();
        let trimmed = line.trim();
        if trimmed == "---" {
            return Some((offset, meta));
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            meta.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    None
}

fn render_front_matter(meta: &BTreeMap<String, String>) -> String {
    let mut out = String::from("---\n");
    for (key, value) in meta {
        out.push_str(&format!("{key}: {value}\n"));
    }
    out.push_str("---\n");
    out
}

/// Apply patches to skill files, honoring digest and allowlist gates.
///
/// A `.bak` of the original content is written once per file before any
/// replacement; the manifest is rebuilt if anything changed.
pub fn apply_skill_updates(
    entries: &[SkillManifestEntry],
    updates: &[SkillUpdate],
    confidence: f64,
    skills_root: &Path,
    manifest_path: &Path,
    required_skill_digests: &BTreeMap<String, String>,
    allowed_skill_refs: &BTreeSet<String>,
) -> Value {
    let mut applied = 0u64;
    let mut updated_refs: Vec<String> = Vec::new();
    let mut skipped_reason: Option<String> = None;

    if updates.is_empty() {
        skipped_reason = Some("no_updates".into());
    } else if confidence < MIN_PATCH_CONFIDENCE {
        skipped_reason = Some(format!("low_confidence<{MIN_PATCH_CONFIDENCE}"));
    } else {
        let by_ref: BTreeMap<&str, &SkillManifestEntry> = entries
            .iter()
            .map(|entry| (entry.skill_ref.as_str(), entry))
            .collect();
        let stamp = Utc::now().format("%Y-%m-%d").to_string();

        for update in updates.iter().take(MAX_SKILLS_PER_PATCH) {
            let Some(entry) = by_ref.get(update.skill_ref.as_str()) else {
                continue;
            };
            if !allowed_skill_refs.contains(&update.skill_ref) {
                continue;
            }
            let expected = required_skill_digests
                .get(&update.skill_ref)
                .map(|digest| digest.to_lowercase())
                .unwrap_or_default();
            if expected.is_empty() || expected != update.skill_digest.to_lowercase() {
                continue;
            }

            let path = Path::new(&entry.path);
            let Ok(original) = std::fs::read_to_string(path) else {
                continue;
            };
            // The digest must still describe what is on disk.
            if skill_digest(&original) != expected {
                debug!(skill_ref = %update.skill_ref, "stale digest; skipping patch");
                continue;
            }

            let existing_lines: Vec<String> = original
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            let mut text = original.clone();
            let mut changed = false;

            // Replace weak guidance before appending new lines.
            for rule in &update.replace_rules {
                if text.contains(&rule.find) && !text.contains(&rule.replace) {
                    text = text.replacen(&rule.find, &rule.replace, 1);
                    changed = true;
                }
            }

            let section = "## Learned Updates";
            if !text.contains(section) {
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&format!("\n{section}\n"));
            }
            for bullet in &update.append_bullets {
                if existing_lines.iter().any(|line| jaccard(bullet, line) >= 0.55) {
                    continue;
                }
                let evidence = update
                    .evidence_steps
                    .iter()
                    .take(4)
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                let line = format!("- [{stamp}] {bullet} (evidence steps: {evidence})");
                if text.contains(&line) {
                    continue;
                }
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&line);
                text.push('\n');
                changed = true;
            }

            if changed && text != original {
                if let Some((span_end, mut meta)) = front_matter_span(&text) {
                    let version = meta
                        .get("version")
                        .and_then(|raw| raw.trim().parse::<u32>().ok())
                        .unwrap_or(1);
                    meta.insert("version".into(), (version.max(1) + 1).to_string());
                    text = format!("{}{}", render_front_matter(&meta), &text[span_end..]);
                }
                let backup = path.with_extension("md.bak");
                if !backup.exists() {
                    let _ = std::fs::write(&backup, &original);
                }
                if std::fs::write(path, &text).is_ok() {
                    applied += 1;
                    updated_refs.push(update.skill_ref.clone());
                }
            }
        }
        if applied == 0 {
            skipped_reason = Some("no_applicable_changes".into());
        }
    }

    if applied > 0 {
        let _ = build_skill_manifest(skills_root, manifest_path);
        info!(applied, ?updated_refs, "skill patches applied");
    }
    json!({
        "attempted": !updates.is_empty(),
        "applied": applied,
        "updated_skill_refs": updated_refs,
        "confidence": confidence,
        "skipped_reason": skipped_reason,
    })
}

fn read_json_array(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|value| value.as_array().cloned())
        .unwrap_or_default()
}

fn write_json_array(path: &Path, rows: &[Value]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Array(rows.to_vec()))?)
}

/// Queue patch candidates instead of applying them.
#[allow(clippy::too_many_arguments)]
pub fn queue_skill_update_candidates(
    queue_path: &Path,
    updates: &[SkillUpdate],
    confidence: f64,
    session_id: u64,
    task_id: &str,
    required_skill_digests: &BTreeMap<String, String>,
    allowed_skill_refs: &BTreeSet<String>,
    evaluation: &Evaluation,
) -> Value {
    if updates.is_empty() {
        return json!({"attempted": false, "queued": 0, "skipped_reason": "no_updates"});
    }
    if confidence < MIN_PATCH_CONFIDENCE {
        return json!({
            "attempted": true,
            "queued": 0,
            "skipped_reason": format!("low_confidence<{MIN_PATCH_CONFIDENCE}"),
        });
    }

    let mut payload_updates: Vec<Value> = Vec::new();
    for update in updates.iter().take(MAX_SKILLS_PER_PATCH) {
        if !allowed_skill_refs.contains(&update.skill_ref) {
            continue;
        }
        let expected = required_skill_digests
            .get(&update.skill_ref)
            .map(|digest| digest.to_lowercase())
            .unwrap_or_default();
        if expected.is_empty() || expected != update.skill_digest.to_lowercase() {
            continue;
        }
        if update.root_cause.is_empty() || update.evidence_steps.is_empty() {
            continue;
        }
        payload_updates.push(serde_json::to_value(update).unwrap_or(Value::Null));
    }
    if payload_updates.is_empty() {
        return json!({"attempted": true, "queued": 0, "skipped_reason": "no_updates_after_gates"});
    }

    let mut queue = read_json_array(queue_path);
    let now = Utc::now();
    let queued = payload_updates.len() as u64;
    let queued_refs: Vec<Value> = payload_updates
        .iter()
        .filter_map(|update| update.get("skill_ref").cloned())
        .collect();
    queue.push(json!({
        "id": format!("{}-{session_id}", now.timestamp()),
        "created_at": utc_now_iso(),
        "session_id": session_id,
        "task_id": task_id,
        "confidence": confidence,
        "evaluation": evaluation.to_value(),
        "updates": payload_updates,
    }));
    if write_json_array(queue_path, &queue).is_err() {
        return json!({"attempted": true, "queued": 0, "skipped_reason": "queue_write_failed"});
    }
    json!({
        "attempted": true,
        "queued": queued,
        "queued_skill_refs": queued_refs,
        "queue_path": queue_path.display().to_string(),
        "skipped_reason": Value::Null,
    })
}

/// Per-session score row consumed by the trend gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub session_id: u64,
    pub score: f64,
    pub passed: bool,
}

/// Collect recent eval scores for a task from session metrics files.
#[must_use]
pub fn collect_recent_scores(sessions_root: &Path, task_id: &str, max_sessions: usize) -> Vec<ScoreRow> {
    let Ok(entries) = std::fs::read_dir(sessions_root) else {
        return Vec::new();
    };
    let mut session_dirs: Vec<(u64, std::path::PathBuf)> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            let id = name.strip_prefix("session-")?.parse::<u64>().ok()?;
            Some((id, path))
        })
        .collect();
    session_dirs.sort();

    let mut rows = Vec::new();
    for (_, dir) in session_dirs {
        let Ok(text) = std::fs::read_to_string(dir.join("metrics.json")) else {
            continue;
        };
        let Ok(metrics) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if metrics.get("task_id").and_then(Value::as_str) != Some(task_id) {
            continue;
        }
        rows.push(ScoreRow {
            session_id: metrics
                .get("session_id")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            score: metrics.get("eval_score").and_then(Value::as_f64).unwrap_or(0.0),
            passed: metrics.get("eval_passed").and_then(Value::as_bool).unwrap_or(false),
        });
    }
    if rows.len() > max_sessions {
        rows.split_off(rows.len() - max_sessions)
    } else {
        rows
    }
}

/// Count evaluator reasons across recent sessions of a task.
#[must_use]
pub fn collect_recent_reason_counts(
    sessions_root: &Path,
    task_id: &str,
    max_sessions: usize,
) -> BTreeMap<String, u64> {
    let Ok(entries) = std::fs::read_dir(sessions_root) else {
        return BTreeMap::new();
    };
    let mut session_dirs: Vec<(u64, std::path::PathBuf)> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            let id = name.strip_prefix("session-")?.parse::<u64>().ok()?;
            Some((id, path))
        })
        .collect();
    session_dirs.sort();
    let tail = if session_dirs.len() > max_sessions {
        session_dirs.split_off(session_dirs.len() - max_sessions)
    } else {
        session_dirs
    };

    let mut counts = BTreeMap::new();
    for (_, dir) in tail {
        let Ok(text) = std::fs::read_to_string(dir.join("metrics.json")) else {
            continue;
        };
        let Ok(metrics) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if metrics.get("task_id").and_then(Value::as_str) != Some(task_id) {
            continue;
        }
        if let Some(reasons) = metrics.get("eval_reasons").and_then(Value::as_array) {
            for reason in reasons.iter().filter_map(Value::as_str) {
                *counts.entry(reason.to_string()).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// True when the last `min_runs` scores are monotonically non-decreasing
/// with total improvement of at least `min_delta`.
#[must_use]
pub fn scores_improving(rows: &[ScoreRow], min_runs: usize, min_delta: f64) -> bool {
    if rows.len() < min_runs {
        return false;
    }
    let recent = &rows[rows.len() - min_runs..];
    let monotone = recent.windows(2).all(|pair| pair[0].score <= pair[1].score);
    monotone && (recent[recent.len() - 1].score - recent[0].score) >= min_delta
}

/// Promote at most one queued candidate, gated on the score trend.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(task_id))]
pub fn auto_promote_queued_candidates(
    entries: &[SkillManifestEntry],
    queue_path: &Path,
    promoted_path: &Path,
    sessions_root: &Path,
    task_id: &str,
    skills_root: &Path,
    manifest_path: &Path,
    min_runs: usize,
    min_delta: f64,
) -> Value {
    const MAX_GATE_SESSIONS: usize = 8;

    let queue = read_json_array(queue_path);
    if queue.is_empty() {
        let reason = if queue_path.exists() { "empty_queue" } else { "no_queue" };
        return json!({"attempted": true, "applied": 0, "reason": reason});
    }

    let score_rows = collect_recent_scores(sessions_root, task_id, MAX_GATE_SESSIONS);
    if score_rows.len() < min_runs {
        return json!({
            "attempted": true,
            "applied": 0,
            "reason": "insufficient_runs_for_promotion",
            "gate_scores": score_rows,
        });
    }
    if !scores_improving(&score_rows, min_runs, min_delta) {
        return json!({
            "attempted": true,
            "applied": 0,
            "reason": "score_not_improving",
            "gate_scores": score_rows,
        });
    }

    let mut candidates: Vec<&Value> = queue
        .iter()
        .filter(|item| item.get("task_id").and_then(Value::as_str) == Some(task_id))
        .collect();
    if candidates.is_empty() {
        return json!({"attempted": true, "applied": 0, "reason": "no_task_candidates"});
    }
    candidates.sort_by(|a, b| {
        let confidence = |item: &Value| item.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
        let session = |item: &Value| item.get("session_id").and_then(Value::as_u64).unwrap_or(0);
        confidence(b)
            .partial_cmp(&confidence(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| session(b).cmp(&session(a)))
    });
    let candidate = candidates[0].clone();

    let updates: Vec<SkillUpdate> = candidate
        .get("updates")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_update_item).collect())
        .unwrap_or_default();
    if updates.is_empty() {
        return json!({"attempted": true, "applied": 0, "reason": "candidate_has_no_updates"});
    }

    let required_digests: BTreeMap<String, String> = updates
        .iter()
        .map(|update| (update.skill_ref.clone(), update.skill_digest.clone()))
        .collect();
    let allowed_refs: BTreeSet<String> = updates.iter().map(|update| update.skill_ref.clone()).collect();
    let apply_result = apply_skill_updates(
        entries,
        &updates,
        candidate.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
        skills_root,
        manifest_path,
        &required_digests,
        &allowed_refs,
    );
    let applied = apply_result.get("applied").and_then(Value::as_u64).unwrap_or(0);
    if applied == 0 {
        return json!({
            "attempted": true,
            "applied": 0,
            "reason": apply_result.get("skipped_reason").cloned().unwrap_or(Value::Null),
            "gate_scores": score_rows,
        });
    }

    let candidate_id = candidate
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let remaining: Vec<Value> = queue
        .iter()
        .filter(|item| item.get("id").and_then(Value::as_str) != Some(candidate_id.as_str()))
        .cloned()
        .collect();
    let _ = write_json_array(queue_path, &remaining);

    let mut promoted_rows = read_json_array(promoted_path);
    promoted_rows.push(json!({
        "id": candidate_id,
        "promoted_at": utc_now_iso(),
        "candidate": candidate,
        "gate_scores": score_rows,
    }));
    let _ = write_json_array(promoted_path, &promoted_rows);

    json!({
        "attempted": true,
        "applied": applied,
        "promoted_id": candidate_id,
        "reason": Value::Null,
        "gate_scores": score_rows,
    })
}
