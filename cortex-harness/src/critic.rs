//! Lesson critic: post-run lesson generation with a quality filter.
//!
//! The critic runs only when the deterministic evaluator did not fully
//! pass. It issues one tightly constrained LLM call, then filters the
//! output: generic advice is rejected outright, and survivors are scored on
//! domain-keyword density, step references, and concrete error tokens.

use std::path::Path;
use std::sync::LazyLock;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::evaluator::Evaluation;
use crate::provider::{ChatMessage, LlmProvider, LlmRequest, extract_json_array};
use cortex_memory::text::jaccard;

/// Lesson categories the critic may emit.
pub const ALLOWED_CATEGORIES: [&str; 4] = ["mistake", "insight", "shortcut", "domain_detail"];
/// Lessons below this quality score are dropped.
pub const DEFAULT_MIN_QUALITY: f64 = 0.15;
const MAX_LESSON_CHARS: usize = 280;
const MAX_LESSONS_PER_RUN: usize = 4;
const MAX_EVIDENCE_STEPS: usize = 8;

/// One legacy-format lesson row (`lessons.jsonl`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub session_id: u64,
    pub task_id: String,
    pub task: String,
    pub category: String,
    pub lesson: String,
    pub evidence_steps: Vec<u64>,
    pub eval_passed: bool,
    pub eval_score: f64,
    pub skill_refs_used: Vec<String>,
    pub timestamp: String,
}

/// Raw and quality-filtered critic output for one run.
#[derive(Debug, Clone, Default)]
pub struct LessonGenerationResult {
    pub raw_lessons: Vec<Lesson>,
    pub filtered_lessons: Vec<Lesson>,
}

static GENERIC_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"(?i)\b(always read the skill|be careful|remember to|don'?t forget|make sure to read|always check|read the documentation|pay attention to|take care when|be mindful)\b",
    )
    .unwrap()
});
static STEP_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)\b(?:step\s*\d+|at step|steps?\s*[\d,]+)\b").unwrap()
});
static ERROR_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)(?:error|exception|failed|missing|duplicate|mismatch|constraint|violation)")
        .unwrap()
});

fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Score a lesson's quality against a domain keyword table.
///
/// Generic advice scores zero; specificity (domain tokens, step numbers,
/// error vocabulary, evidence) accumulates up to 1.0.
#[must_use]
pub fn lesson_quality_score(lesson: &Lesson, domain_keywords: &Regex) -> f64 {
    if GENERIC_PATTERNS.is_match(&lesson.lesson) {
        return 0.0;
    }
    let mut score = 0.0;
    let keyword_hits = domain_keywords.find_iter(&lesson.lesson).count() as f64;
    score += (keyword_hits * 0.15).min(0.45);
    if STEP_REFERENCE.is_match(&lesson.lesson) {
        score += 0.2;
    }
    if ERROR_REFERENCE.is_match(&lesson.lesson) {
        score += 0.2;
    }
    if !lesson.evidence_steps.is_empty() {
        score += 0.15;
    }
    score.min(1.0)
}

/// Keep lessons at or above the quality threshold.
#[must_use]
pub fn filter_lessons(lessons: Vec<Lesson>, domain_keywords: &Regex, min_quality: f64) -> Vec<Lesson> {
    lessons
        .into_iter()
        .filter(|lesson| lesson_quality_score(lesson, domain_keywords) >= min_quality)
        .collect()
}

/// Load legacy lesson rows, skipping malformed lines.
#[must_use]
pub fn load_lessons(path: &Path) -> Vec<Lesson> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let text = line.trim();
            if text.is_empty() {
                return None;
            }
            let row: Value = serde_json::from_str(text).ok()?;
            parse_lesson_row(&row)
        })
        .collect()
}

fn parse_lesson_row(row: &Value) -> Option<Lesson> {
    let object = row.as_object()?;
    let lesson_text = object
        .get("lesson")
        .and_then(Value::as_str)
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))?;
    if lesson_text.is_empty() {
        return None;
    }
    let category = {
        let raw = object
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("insight")
            .trim()
            .to_lowercase();
        if ALLOWED_CATEGORIES.contains(&raw.as_str()) {
            raw
        } else {
            "insight".to_string()
        }
    };
    let evidence_steps: Vec<u64> = object
        .get("evidence_steps")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_i64)
                .filter(|step| *step > 0)
                .map(|step| step as u64)
                .take(MAX_EVIDENCE_STEPS)
                .collect()
        })
        .unwrap_or_default();
    let skill_refs_used: Vec<String> = object
        .get("skill_refs_used")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|skill_ref| !skill_ref.is_empty())
                .map(str::to_string)
                .take(8)
                .collect()
        })
        .unwrap_or_default();
    Some(Lesson {
        session_id: object
            .get("session_id")
            .and_then(Value::as_i64)
            .map(|id| id.max(0) as u64)
            .unwrap_or(0),
        task_id: object
            .get("task_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        task: object
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        category,
        lesson: lesson_text.chars().take(MAX_LESSON_CHARS).collect(),
        evidence_steps,
        eval_passed: object.get("eval_passed").and_then(Value::as_bool).unwrap_or(false),
        eval_score: object.get("eval_score").and_then(Value::as_f64).unwrap_or(0.0),
        skill_refs_used,
        timestamp: {
            let raw = object
                .get("timestamp")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if raw.is_empty() { utc_now_iso() } else { raw.to_string() }
        },
    })
}

/// Append lessons, deduping near-identical text for the same task.
pub fn store_lessons(path: &Path, lessons: &[Lesson]) -> std::io::Result<u64> {
    const DEDUP_THRESHOLD: f64 = 0.65;
    if lessons.is_empty() {
        return Ok(0);
    }
    let mut existing = load_lessons(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut stored = 0;
    let mut body = String::new();
    for lesson in lessons {
        let duplicate = existing
            .iter()
            .filter(|row| row.task_id == lesson.task_id)
            .any(|row| jaccard(&lesson.lesson, &row.lesson) >= DEDUP_THRESHOLD);
        if duplicate {
            continue;
        }
        body.push_str(&serde_json::to_string(lesson).unwrap_or_default());
        body.push('\n');
        existing.push(lesson.clone());
        stored += 1;
    }
    if stored > 0 {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(body.as_bytes())?;
    }
    Ok(stored)
}

/// Render the legacy lesson block injected into the system prompt.
///
/// Returns the text and how many lessons were selected.
#[must_use]
pub fn load_relevant_lessons(
    path: &Path,
    task_id: &str,
    task: &str,
    max_lessons: usize,
    max_sessions: usize,
) -> (String, u64) {
    let all = load_lessons(path);
    if all.is_empty() {
        return ("No prior lessons loaded.".to_string(), 0);
    }

    let mut scored: Vec<(f64, &Lesson)> = all
        .iter()
        .filter_map(|lesson| {
            let mut score = jaccard(task, &lesson.task) + 0.6 * jaccard(task, &lesson.lesson);
            if lesson.task_id == task_id {
                score += 0.3;
            }
            (score > 0.0).then_some((score, lesson))
        })
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.timestamp.cmp(&a.1.timestamp))
    });

    let mut selected: Vec<&Lesson> = Vec::new();
    let mut seen_sessions: std::collections::BTreeSet<u64> = std::collections::BTreeSet::new();
    for (_, lesson) in scored {
        if lesson.session_id > 0
            && seen_sessions.len() >= max_sessions
            && !seen_sessions.contains(&lesson.session_id)
        {
            continue;
        }
        selected.push(lesson);
        if lesson.session_id > 0 {
            seen_sessions.insert(lesson.session_id);
        }
        if selected.len() >= max_lessons {
            break;
        }
    }
    if selected.is_empty() {
        return ("No prior lessons loaded.".to_string(), 0);
    }

    let mut lines = vec!["Lessons from previous sessions (apply only when relevant):".to_string()];
    for lesson in &selected {
        let steps = if lesson.evidence_steps.is_empty() {
            "-".to_string()
        } else {
            lesson
                .evidence_steps
                .iter()
                .take(4)
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        lines.push(format!(
            "- [{}] {} (task_id={}, session={}, score={:.2}, steps={})",
            lesson.category, lesson.lesson, lesson.task_id, lesson.session_id, lesson.eval_score, steps
        ));
    }
    (lines.join("\n"), selected.len() as u64)
}

/// Keep only the best `max_per_task` lessons per task; returns rows removed.
pub fn prune_lessons(
    path: &Path,
    domain_keywords: &Regex,
    max_per_task: usize,
) -> std::io::Result<u64> {
    let all = load_lessons(path);
    if all.is_empty() {
        return Ok(0);
    }
    let mut by_task: std::collections::BTreeMap<String, Vec<Lesson>> = std::collections::BTreeMap::new();
    for lesson in all {
        by_task.entry(lesson.task_id.clone()).or_default().push(lesson);
    }

    let mut pruned = false;
    let mut kept: Vec<Lesson> = Vec::new();
    let mut removed = 0u64;
    for (_, mut task_lessons) in by_task {
        if task_lessons.len() <= max_per_task {
            kept.append(&mut task_lessons);
            continue;
        }
        task_lessons.sort_by(|a, b| {
            lesson_quality_score(b, domain_keywords)
                .partial_cmp(&lesson_quality_score(a, domain_keywords))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        removed += (task_lessons.len() - max_per_task) as u64;
        task_lessons.truncate(max_per_task);
        kept.append(&mut task_lessons);
        pruned = true;
    }
    if !pruned {
        return Ok(0);
    }
    let mut body = String::new();
    for lesson in &kept {
        body.push_str(&serde_json::to_string(lesson).unwrap_or_default());
        body.push('\n');
    }
    std::fs::write(path, body)?;
    Ok(removed)
}

/// Context handed to [`generate_lessons`].
#[derive(Debug, Clone)]
pub struct CriticContext<'a> {
    pub session_id: u64,
    pub task_id: &'a str,
    pub task: &'a str,
    pub evaluation: &'a Evaluation,
    pub events_tail: &'a [Value],
    pub skill_refs_used: &'a [String],
    /// Strict-mode knowledge chunks; empty in legacy mode.
    pub knowledge_context: &'a str,
}

fn critic_system_prompt() -> String {
    concat!(
        "You are a post-run learning critic for a tool-using agent.\n",
        "Return STRICT JSON array only. Each item must match:\n",
        "{\"category\":\"mistake|insight|shortcut|domain_detail\",\"lesson\":\"...\",\"evidence_steps\":[1,2]}\n",
        "Rules:\n",
        "- Each lesson MUST reference at least one of: exact command fragment, error message, step number, or column/table name.\n",
        "- REJECT generic advice like 'always read the skill', 'be careful', 'remember to check'.\n",
        "- Good: 'INSERT INTO ledger missed ON CONFLICT for event_id causing duplicate at step 4'\n",
        "- Bad: 'Always read the skill document before executing commands'\n",
        "- Base lessons only on provided events and deterministic eval.\n",
        "- 1 to 4 lessons total.\n",
    )
    .to_string()
}

/// Generate candidate lessons for a run that did not fully pass.
#[instrument(skip_all, fields(task_id = context.task_id))]
pub async fn generate_lessons(
    provider: &dyn LlmProvider,
    model: &str,
    context: &CriticContext<'_>,
    domain_keywords: &Regex,
    min_quality: f64,
) -> LessonGenerationResult {
    if context.evaluation.passed && context.evaluation.score >= 1.0 {
        return LessonGenerationResult::default();
    }

    let mut user = format!(
        "TASK_ID:\n{}\n\nTASK:\n{}\n\nEVAL:\n{}\n\nEVENTS_TAIL:\n{}\n\nSKILLS_USED:\n{}",
        context.task_id,
        context.task,
        serde_json::to_string(&context.evaluation.to_value()).unwrap_or_default(),
        serde_json::to_string(context.events_tail).unwrap_or_default(),
        serde_json::to_string(context.skill_refs_used).unwrap_or_default(),
    );
    if !context.knowledge_context.is_empty() {
        user.push_str("\n\nDOMAIN_REFERENCE:\n");
        user.push_str(context.knowledge_context);
    }

    let request = LlmRequest {
        model: model.to_string(),
        max_tokens: 500,
        system: critic_system_prompt(),
        messages: vec![ChatMessage::user_text(user)],
        tools: Vec::new(),
    };
    let Ok(response) = provider.complete(&request).await else {
        return LessonGenerationResult::default();
    };

    let now = utc_now_iso();
    let mut raw_lessons: Vec<Lesson> = Vec::new();
    for item in extract_json_array(&response.text()).into_iter().take(MAX_LESSONS_PER_RUN) {
        let Some(parsed) = parse_lesson_row(&json!({
            "session_id": context.session_id,
            "task_id": context.task_id,
            "task": context.task,
            "category": item.get("category").cloned().unwrap_or(Value::Null),
            "lesson": item.get("lesson").cloned().unwrap_or(Value::Null),
            "evidence_steps": item.get("evidence_steps").cloned().unwrap_or(Value::Null),
            "eval_passed": context.evaluation.passed,
            "eval_score": context.evaluation.score,
            "skill_refs_used": context.skill_refs_used,
            "timestamp": now,
        })) else {
            continue;
        };
        raw_lessons.push(parsed);
    }

    let filtered = filter_lessons(raw_lessons.clone(), domain_keywords, min_quality);
    debug!(raw = raw_lessons.len(), kept = filtered.len(), "critic lessons filtered");
    LessonGenerationResult {
        raw_lessons,
        filtered_lessons: filtered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;

    fn sql_keywords() -> Regex {
        Regex::new(r"(?i)\b(SELECT|INSERT|CREATE|GROUP BY|ORDER BY|ledger|sales)\b").unwrap()
    }

    fn lesson(text: &str, steps: &[u64]) -> Lesson {
        Lesson {
            session_id: 1,
            task_id: "import_aggregate".into(),
            task: "sqlite import aggregate".into(),
            category: "mistake".into(),
            lesson: text.into(),
            evidence_steps: steps.to_vec(),
            eval_passed: false,
            eval_score: 0.5,
            skill_refs_used: Vec::new(),
            timestamp: utc_now_iso(),
        }
    }

    #[test]
    fn generic_advice_scores_zero() {
        let generic = lesson("Always be careful with SQL and remember to check", &[1]);
        assert!((lesson_quality_score(&generic, &sql_keywords()) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn specific_lessons_accumulate_score() {
        let specific = lesson(
            "INSERT INTO ledger missed ON CONFLICT causing duplicate error at step 4",
            &[4],
        );
        let score = lesson_quality_score(&specific, &sql_keywords());
        // keyword hits (INSERT, ledger) + step ref + error token + evidence
        assert!(score >= 0.15 + 0.2 + 0.2 + 0.15 - 1e-9);
    }

    #[test]
    fn store_lessons_dedups_similar_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lessons.jsonl");
        let first = lesson("INSERT INTO ledger missed ON CONFLICT at step 4", &[4]);
        let near_duplicate = lesson("INSERT INTO ledger missed ON CONFLICT at step 5", &[5]);
        assert_eq!(store_lessons(&path, &[first]).unwrap(), 1);
        assert_eq!(store_lessons(&path, &[near_duplicate]).unwrap(), 0);
        assert_eq!(load_lessons(&path).len(), 1);
    }

    #[test]
    fn relevant_lessons_prefer_matching_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lessons.jsonl");
        let mut other = lesson("CREATE TABLE sales must come before INSERT at step 1", &[1]);
        other.task_id = "other_task".into();
        other.task = "unrelated work".into();
        let matching = lesson("GROUP BY category required for totals, error at step 3", &[3]);
        store_lessons(&path, &[other, matching]).unwrap();

        let (text, count) =
            load_relevant_lessons(&path, "import_aggregate", "sqlite import aggregate", 1, 5);
        assert_eq!(count, 1);
        assert!(text.contains("GROUP BY category"));
    }

    #[test]
    fn prune_keeps_best_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lessons.jsonl");
        let mut rows = Vec::new();
        for idx in 0..25u64 {
            // Distinct table/column names keep the rows below the dedup
            // similarity threshold.
            rows.push(lesson(
                &format!("INSERT INTO table{idx} failed constraint error at step {idx} near column col{idx}"),
                &[idx + 1],
            ));
        }
        for row in &rows {
            store_lessons(&path, std::slice::from_ref(row)).unwrap();
        }
        assert_eq!(load_lessons(&path).len(), 25);
        prune_lessons(&path, &sql_keywords(), 20).unwrap();
        assert_eq!(load_lessons(&path).len(), 20);
    }

    #[tokio::test]
    async fn critic_skips_fully_passed_runs() {
        let provider = ScriptedProvider::new(Vec::new());
        let evaluation = Evaluation {
            applicable: true,
            passed: true,
            score: 1.0,
            reasons: Vec::new(),
            evidence: Value::Null,
            contract_path: String::new(),
        };
        let context = CriticContext {
            session_id: 1,
            task_id: "t",
            task: "t",
            evaluation: &evaluation,
            events_tail: &[],
            skill_refs_used: &[],
            knowledge_context: "",
        };
        let result = generate_lessons(&provider, "m", &context, &sql_keywords(), 0.15).await;
        assert!(result.raw_lessons.is_empty());
    }

    #[tokio::test]
    async fn critic_parses_and_filters_lessons() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text(
            r#"[
                {"category": "mistake", "lesson": "INSERT INTO ledger missed ON CONFLICT causing duplicate error at step 4", "evidence_steps": [4]},
                {"category": "insight", "lesson": "Always be careful", "evidence_steps": []}
            ]"#,
        )]);
        let evaluation = Evaluation {
            applicable: true,
            passed: false,
            score: 0.5,
            reasons: vec!["too_many_errors".into()],
            evidence: Value::Null,
            contract_path: String::new(),
        };
        let context = CriticContext {
            session_id: 9,
            task_id: "import_aggregate",
            task: "sqlite import aggregate",
            evaluation: &evaluation,
            events_tail: &[],
            skill_refs_used: &[],
            knowledge_context: "",
        };
        let result = generate_lessons(&provider, "m", &context, &sql_keywords(), 0.15).await;
        assert_eq!(result.raw_lessons.len(), 2);
        assert_eq!(result.filtered_lessons.len(), 1);
        assert_eq!(result.filtered_lessons[0].session_id, 9);
        assert!(result.filtered_lessons[0].lesson.contains("ON CONFLICT"));
    }
}
