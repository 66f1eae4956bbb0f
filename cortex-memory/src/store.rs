//! Lesson store V2: JSONL persistence with a stable identity model.
//!
//! A lesson is keyed by `(normalized_rule, trigger_fingerprints)` — rewriting
//! the rule text changes identity, re-ordering fingerprints does not. The
//! store rewrites the whole file on every mutation via a temp file and an
//! atomic rename, so readers only ever see a complete set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{Error, Result};
use crate::text::{clamp, normalize_text};

/// Schema marker written on every V2 row.
pub const V2_SCHEMA: &str = "lesson_store_v2";
/// Schema version written on every V2 row.
pub const V2_VERSION: u64 = 1;
/// Rule text is whitespace-collapsed and capped at this many characters.
pub const MAX_RULE_TEXT_CHARS: usize = 420;

/// Lifecycle states of a lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    /// Fresh lesson awaiting evidence.
    Candidate,
    /// Lesson with a positive utility trend.
    Promoted,
    /// Lesson that lost a contradiction or trended harmful; never retrieved.
    Suppressed,
    /// Explicitly retired; never retrieved.
    Archived,
}

impl LessonStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LessonStatus::Candidate => "candidate",
            LessonStatus::Promoted => "promoted",
            LessonStatus::Suppressed => "suppressed",
            LessonStatus::Archived => "archived",
        }
    }

    /// Only candidate and promoted lessons are eligible for retrieval.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, LessonStatus::Candidate | LessonStatus::Promoted)
    }
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LessonStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "candidate" => Ok(LessonStatus::Candidate),
            "promoted" => Ok(LessonStatus::Promoted),
            "suppressed" => Ok(LessonStatus::Suppressed),
            "archived" => Ok(LessonStatus::Archived),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

/// Normalize lesson text for dedup/identity checks.
#[must_use]
pub fn normalize_rule_text(rule_text: &str) -> String {
    normalize_text(rule_text)
}

/// Generate a stable ID from semantic identity, not run-local metadata.
fn stable_lesson_id(normalized_rule: &str, trigger_fingerprints: &[String]) -> String {
    let unique: BTreeSet<&str> = trigger_fingerprints.iter().map(String::as_str).collect();
    let key = format!(
        "{normalized_rule}|{}",
        unique.into_iter().collect::<Vec<_>>().join(",")
    );
    let digest = Sha256::digest(key.as_bytes());
    let hex = digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("lsn_{}", &hex[..20])
}

/// Fallback tag derivation from rule text, used when the caller supplies no
/// tags. The table is substring-based on purpose: rule text is short prose.
fn extract_tags_from_text(text: &str) -> Vec<String> {
    const TABLE: &[(&str, &[&str])] = &[
        ("syntax_structure", &["syntax", "parse", "expected", "unknown command", "invalid"]),
        ("unknown_symbol", &["missing", "not found", "unknown", "undefined"]),
        ("path_quote", &["quote", "quoted", "\"", "'"]),
        ("operator_mismatch", &["operator", "eq", "neq", "gt", "lt", "gte", "lte"]),
        ("arity_mismatch", &["arity", "arguments", "expects", "wrong number"]),
        ("column_reference", &["column", "field", "alias"]),
        ("function_case", &["lowercase", "uppercase", "case-sensitive"]),
        ("sort_direction", &["asc", "desc", "sort", "rank"]),
        ("no_progress", &["no progress", "stuck", "stall"]),
        ("constraint_failed", &["constraint", "invariant", "violation"]),
        ("unsafe_action", &["unsafe", "forbidden", "blocked"]),
        ("goal_distance_increase", &["distance increase", "farther", "regression"]),
    ];
    let lower = text.to_lowercase();
    let mut tags: BTreeSet<&str> = BTreeSet::new();
    for (tag, needles) in TABLE {
        if needles.iter().any(|needle| lower.contains(needle)) {
            tags.insert(tag);
        }
    }
    if tags.is_empty() {
        tags.insert("generic");
    }
    tags.into_iter().map(str::to_string).collect()
}

fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cap_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn sorted_unique_strings(values: &[String]) -> Vec<String> {
    let set: BTreeSet<String> = values
        .iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect();
    set.into_iter().collect()
}

fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Inputs for minting a fresh candidate lesson.
#[derive(Debug, Clone, Default)]
pub struct LessonSeed {
    pub session_id: u64,
    pub task_id: String,
    pub task: String,
    pub domain: String,
    pub rule_text: String,
    pub trigger_fingerprints: Vec<String>,
    /// Optional; derived from rule text when empty.
    pub tags: Vec<String>,
}

/// The canonical memory unit. Immutable value: every change constructs a new
/// record, and the store's whole-file rewrite makes that free.
#[derive(Debug, Clone, PartialEq)]
pub struct LessonRecord {
    pub lesson_id: String,
    pub status: LessonStatus,
    pub rule_text: String,
    pub normalized_rule: String,
    pub trigger_fingerprints: Vec<String>,
    pub tags: Vec<String>,
    pub task_id: String,
    pub task: String,
    pub domain: String,
    pub source_session_ids: Vec<u64>,
    pub reliability: f64,
    pub retrieval_count: u64,
    pub helpful_count: u64,
    pub harmful_count: u64,
    pub utility_history: Vec<f64>,
    pub major_regressions: u64,
    pub contradiction_losses: u64,
    pub conflict_lesson_ids: Vec<String>,
    pub archived_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl LessonRecord {
    /// Mint a fresh `candidate` record with computed identity.
    #[must_use]
    pub fn from_candidate(seed: LessonSeed) -> Self {
        let normalized = normalize_rule_text(&seed.rule_text);
        let fingerprints = sorted_unique_strings(&seed.trigger_fingerprints);
        let mut tags = sorted_unique_strings(&seed.tags);
        if tags.is_empty() {
            tags = extract_tags_from_text(&seed.rule_text);
        }
        let lesson_id = stable_lesson_id(&normalized, &fingerprints);
        let now = utc_now_iso();
        LessonRecord {
            lesson_id,
            status: LessonStatus::Candidate,
            rule_text: cap_chars(&collapse_ws(&seed.rule_text), MAX_RULE_TEXT_CHARS),
            normalized_rule: normalized,
            trigger_fingerprints: fingerprints,
            tags,
            task_id: seed.task_id.trim().to_string(),
            task: seed.task.trim().to_string(),
            domain: seed.domain.trim().to_string(),
            source_session_ids: if seed.session_id > 0 {
                vec![seed.session_id]
            } else {
                Vec::new()
            },
            reliability: 0.5,
            retrieval_count: 0,
            helpful_count: 0,
            harmful_count: 0,
            utility_history: Vec::new(),
            major_regressions: 0,
            contradiction_losses: 0,
            conflict_lesson_ids: Vec::new(),
            archived_reason: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Identity key: `(normalized_rule, trigger_fingerprints)`.
    #[must_use]
    pub fn identity(&self) -> (String, Vec<String>) {
        (self.normalized_rule.clone(), self.trigger_fingerprints.clone())
    }

    /// Parse either a V2 row or a legacy `lessons.jsonl` row.
    #[must_use]
    pub fn from_row(row: &Value) -> Option<Self> {
        let object = row.as_object()?;

        if object.get("memory_schema").and_then(Value::as_str) == Some(V2_SCHEMA) {
            return Some(Self::from_v2_row(object));
        }
        Self::from_legacy_row(object)
    }

    fn from_v2_row(row: &Map<String, Value>) -> Self {
        let status = str_field(row, "status")
            .parse::<LessonStatus>()
            .unwrap_or(LessonStatus::Candidate);
        let rule_text = {
            let raw = str_field(row, "rule_text");
            let raw = if raw.is_empty() { str_field(row, "lesson") } else { raw };
            cap_chars(&collapse_ws(&raw), MAX_RULE_TEXT_CHARS)
        };
        let normalized_rule = {
            let raw = str_field(row, "normalized_rule");
            if raw.is_empty() {
                normalize_rule_text(&rule_text)
            } else {
                normalize_rule_text(&raw)
            }
        };
        let fingerprints = string_array(row, "trigger_fingerprints");
        let tags = {
            let parsed = string_array(row, "tags");
            if parsed.is_empty() {
                extract_tags_from_text(&rule_text)
            } else {
                parsed
            }
        };
        let lesson_id = {
            let raw = str_field(row, "lesson_id");
            if raw.is_empty() {
                stable_lesson_id(&normalized_rule, &fingerprints)
            } else {
                raw
            }
        };
        LessonRecord {
            lesson_id,
            status,
            rule_text,
            normalized_rule,
            trigger_fingerprints: fingerprints,
            tags,
            task_id: str_field(row, "task_id"),
            task: str_field(row, "task"),
            domain: str_field(row, "domain"),
            source_session_ids: session_id_array(row, "source_session_ids"),
            reliability: clamp(float_field(row, "reliability", 0.5), 0.0, 1.0),
            retrieval_count: count_field(row, "retrieval_count"),
            helpful_count: count_field(row, "helpful_count"),
            harmful_count: count_field(row, "harmful_count"),
            utility_history: float_array(row, "utility_history"),
            major_regressions: count_field(row, "major_regressions"),
            contradiction_losses: count_field(row, "contradiction_losses"),
            conflict_lesson_ids: string_array(row, "conflict_lesson_ids"),
            archived_reason: {
                let raw = str_field(row, "archived_reason");
                if raw.is_empty() { None } else { Some(raw) }
            },
            created_at: nonempty_or_now(str_field(row, "created_at")),
            updated_at: nonempty_or_now(str_field(row, "updated_at")),
        }
    }

    /// Legacy rows carry `lesson` + `eval_score`; adapt them into promoted
    /// records with a heuristic reliability.
    fn from_legacy_row(row: &Map<String, Value>) -> Option<Self> {
        let lesson_text = collapse_ws(&str_field(row, "lesson"));
        if lesson_text.is_empty() {
            return None;
        }
        let session_id = count_field(row, "session_id");
        let eval_score = float_field(row, "eval_score", 0.0);
        let reliability = clamp(0.55f64.mul_add(eval_score, 0.35), 0.05, 0.95);
        let fingerprints = string_array(row, "trigger_fingerprints");
        let normalized_rule = normalize_rule_text(&lesson_text);
        let lesson_id = stable_lesson_id(&normalized_rule, &fingerprints);
        let timestamp = nonempty_or_now(str_field(row, "timestamp"));
        Some(LessonRecord {
            lesson_id,
            status: LessonStatus::Promoted,
            rule_text: cap_chars(&lesson_text, MAX_RULE_TEXT_CHARS),
            normalized_rule,
            trigger_fingerprints: fingerprints,
            tags: extract_tags_from_text(&lesson_text),
            task_id: str_field(row, "task_id"),
            task: str_field(row, "task"),
            domain: str_field(row, "domain"),
            source_session_ids: if session_id > 0 { vec![session_id] } else { Vec::new() },
            reliability,
            retrieval_count: 0,
            helpful_count: 0,
            harmful_count: 0,
            utility_history: Vec::new(),
            major_regressions: 0,
            contradiction_losses: 0,
            conflict_lesson_ids: Vec::new(),
            archived_reason: None,
            created_at: timestamp.clone(),
            updated_at: timestamp,
        })
    }

    /// Serialize as a V2 row with legacy compatibility fields.
    ///
    /// Keeping legacy fields allows existing readers of `lessons.jsonl` to
    /// continue operating during rollout without a hard migration cutover.
    #[must_use]
    pub fn to_row(&self) -> Value {
        let mut row = Map::new();
        // Legacy-compatible fields.
        row.insert(
            "session_id".into(),
            Value::from(self.source_session_ids.last().copied().unwrap_or(0)),
        );
        row.insert("task_id".into(), Value::String(self.task_id.clone()));
        row.insert("task".into(), Value::String(self.task.clone()));
        row.insert("category".into(), Value::String("insight".into()));
        row.insert("lesson".into(), Value::String(self.rule_text.clone()));
        row.insert("evidence_steps".into(), Value::Array(Vec::new()));
        row.insert(
            "eval_passed".into(),
            Value::Bool(self.status == LessonStatus::Promoted),
        );
        row.insert("eval_score".into(), Value::from(round_to(self.reliability, 4)));
        row.insert("skill_refs_used".into(), Value::Array(Vec::new()));
        row.insert("timestamp".into(), Value::String(self.updated_at.clone()));
        // V2 fields.
        row.insert("memory_schema".into(), Value::String(V2_SCHEMA.into()));
        row.insert("memory_schema_version".into(), Value::from(V2_VERSION));
        row.insert("lesson_id".into(), Value::String(self.lesson_id.clone()));
        row.insert("status".into(), Value::String(self.status.to_string()));
        row.insert("rule_text".into(), Value::String(self.rule_text.clone()));
        row.insert(
            "normalized_rule".into(),
            Value::String(self.normalized_rule.clone()),
        );
        row.insert(
            "trigger_fingerprints".into(),
            string_values(&self.trigger_fingerprints),
        );
        row.insert("tags".into(), string_values(&self.tags));
        row.insert("domain".into(), Value::String(self.domain.clone()));
        row.insert(
            "source_session_ids".into(),
            Value::Array(self.source_session_ids.iter().map(|id| Value::from(*id)).collect()),
        );
        row.insert("reliability".into(), Value::from(round_to(self.reliability, 4)));
        row.insert("retrieval_count".into(), Value::from(self.retrieval_count));
        row.insert("helpful_count".into(), Value::from(self.helpful_count));
        row.insert("harmful_count".into(), Value::from(self.harmful_count));
        row.insert(
            "utility_history".into(),
            Value::Array(
                self.utility_history
                    .iter()
                    .map(|value| Value::from(round_to(*value, 6)))
                    .collect(),
            ),
        );
        row.insert("major_regressions".into(), Value::from(self.major_regressions));
        row.insert(
            "contradiction_losses".into(),
            Value::from(self.contradiction_losses),
        );
        row.insert(
            "conflict_lesson_ids".into(),
            string_values(&self.conflict_lesson_ids),
        );
        row.insert(
            "archived_reason".into(),
            self.archived_reason
                .clone()
                .map_or(Value::Null, Value::String),
        );
        row.insert("created_at".into(), Value::String(self.created_at.clone()));
        row.insert("updated_at".into(), Value::String(self.updated_at.clone()));
        Value::Object(row)
    }
}

impl serde::Serialize for LessonRecord {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_row().serialize(serializer)
    }
}

fn str_field(row: &Map<String, Value>, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_str)
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

fn float_field(row: &Map<String, Value>, key: &str, default: f64) -> f64 {
    row.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn count_field(row: &Map<String, Value>, key: &str) -> u64 {
    row.get(key)
        .and_then(Value::as_i64)
        .map(|value| value.max(0) as u64)
        .unwrap_or(0)
}

fn string_array(row: &Map<String, Value>, key: &str) -> Vec<String> {
    let raw: Vec<String> = row
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    sorted_unique_strings(&raw)
}

fn session_id_array(row: &Map<String, Value>, key: &str) -> Vec<u64> {
    let set: BTreeSet<u64> = row
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_i64)
                .filter(|id| *id > 0)
                .map(|id| id as u64)
                .collect()
        })
        .unwrap_or_default();
    set.into_iter().collect()
}

fn float_array(row: &Map<String, Value>, key: &str) -> Vec<f64> {
    row.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

fn string_values(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

fn nonempty_or_now(value: String) -> String {
    if value.is_empty() { utc_now_iso() } else { value }
}

/// Opposing token pairs used for the contradiction heuristic. Checked in
/// both directions against normalized rule text.
const CONFLICT_TOGGLES: &[(&str, &str)] = &[
    ("must", "must not"),
    ("requires", "does not require"),
    ("use", "do not use"),
    ("lowercase", "uppercase"),
    ("quoted", "unquoted"),
];

/// Heuristic contradiction check for lessons sharing the same trigger.
#[must_use]
pub fn is_conflict_text(a: &str, b: &str) -> bool {
    let a_norm = normalize_rule_text(a);
    let b_norm = normalize_rule_text(b);
    for (positive, negative) in CONFLICT_TOGGLES {
        if (a_norm.contains(positive) && b_norm.contains(negative))
            || (b_norm.contains(positive) && a_norm.contains(negative))
        {
            return true;
        }
    }
    false
}

/// Merge duplicate lessons while preserving stronger reliability evidence.
fn merge_records(existing: &LessonRecord, incoming: &LessonRecord) -> LessonRecord {
    let union = |a: &[String], b: &[String]| -> Vec<String> {
        let set: BTreeSet<String> = a.iter().chain(b.iter()).cloned().collect();
        set.into_iter().collect()
    };
    let session_ids: Vec<u64> = {
        let set: BTreeSet<u64> = existing
            .source_session_ids
            .iter()
            .chain(incoming.source_session_ids.iter())
            .copied()
            .collect();
        set.into_iter().collect()
    };
    let status = if existing.status == LessonStatus::Archived {
        LessonStatus::Archived
    } else if incoming.status == LessonStatus::Promoted
        && matches!(existing.status, LessonStatus::Candidate | LessonStatus::Suppressed)
    {
        LessonStatus::Promoted
    } else {
        existing.status
    };
    let longer_text = if existing.rule_text.chars().count() >= incoming.rule_text.chars().count() {
        existing.rule_text.clone()
    } else {
        incoming.rule_text.clone()
    };
    let longer_history = if existing.utility_history.len() >= incoming.utility_history.len() {
        existing.utility_history.clone()
    } else {
        incoming.utility_history.clone()
    };
    let first_nonempty = |a: &str, b: &str| -> String {
        if a.is_empty() { b.to_string() } else { a.to_string() }
    };
    LessonRecord {
        lesson_id: existing.lesson_id.clone(),
        status,
        rule_text: longer_text,
        normalized_rule: existing.normalized_rule.clone(),
        trigger_fingerprints: union(&existing.trigger_fingerprints, &incoming.trigger_fingerprints),
        tags: union(&existing.tags, &incoming.tags),
        task_id: first_nonempty(&existing.task_id, &incoming.task_id),
        task: first_nonempty(&existing.task, &incoming.task),
        domain: first_nonempty(&existing.domain, &incoming.domain),
        source_session_ids: session_ids,
        reliability: clamp(existing.reliability.max(incoming.reliability), 0.0, 1.0),
        retrieval_count: existing.retrieval_count.max(incoming.retrieval_count),
        helpful_count: existing.helpful_count.max(incoming.helpful_count),
        harmful_count: existing.harmful_count.max(incoming.harmful_count),
        utility_history: longer_history,
        major_regressions: existing.major_regressions.max(incoming.major_regressions),
        contradiction_losses: existing
            .contradiction_losses
            .max(incoming.contradiction_losses),
        conflict_lesson_ids: union(&existing.conflict_lesson_ids, &incoming.conflict_lesson_ids),
        archived_reason: existing
            .archived_reason
            .clone()
            .or_else(|| incoming.archived_reason.clone()),
        created_at: existing.created_at.clone(),
        updated_at: utc_now_iso(),
    }
}

/// Cross-link records that share a trigger fingerprint and contradict each
/// other textually. Idempotent: re-linking an existing pair adds nothing.
fn link_conflicts(records: &mut [LessonRecord]) -> u64 {
    let mut links = 0;
    for i in 0..records.len() {
        for j in (i + 1)..records.len() {
            let share_trigger = records[i]
                .trigger_fingerprints
                .iter()
                .any(|fp| records[j].trigger_fingerprints.contains(fp));
            if !share_trigger {
                continue;
            }
            if !is_conflict_text(&records[i].rule_text, &records[j].rule_text) {
                continue;
            }
            let left_id = records[i].lesson_id.clone();
            let right_id = records[j].lesson_id.clone();
            if !records[i].conflict_lesson_ids.contains(&right_id) {
                records[i].conflict_lesson_ids.push(right_id);
                records[i].conflict_lesson_ids.sort();
            }
            if !records[j].conflict_lesson_ids.contains(&left_id) {
                records[j].conflict_lesson_ids.push(left_id);
                records[j].conflict_lesson_ids.sort();
            }
            links += 1;
        }
    }
    links
}

/// Result counters from an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct UpsertSummary {
    pub inserted: u64,
    pub merged: u64,
    pub conflict_links: u64,
    pub total: u64,
}

/// JSONL-backed lesson store.
///
/// Tests inject a temp path; production callers hold one instance per
/// learning root. Mutations rewrite the whole file atomically.
#[derive(Debug, Clone)]
pub struct LessonStore {
    path: PathBuf,
}

impl LessonStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LessonStore { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every well-formed record; malformed lines are skipped silently
    /// so one corrupt row never poisons the rest of the file.
    #[must_use]
    pub fn load(&self) -> Vec<LessonRecord> {
        load_records_from(&self.path)
    }

    /// Rewrite the full set through a temp file + atomic rename.
    pub fn write(&self, records: &[LessonRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(&record.to_row())?);
            body.push('\n');
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Insert/merge records with dedup + conflict-link refresh.
    pub fn upsert(&self, new_records: Vec<LessonRecord>) -> Result<UpsertSummary> {
        let existing = self.load();
        let mut by_identity: BTreeMap<(String, Vec<String>), LessonRecord> = existing
            .into_iter()
            .map(|record| (record.identity(), record))
            .collect();
        let mut inserted = 0;
        let mut merged = 0;
        for incoming in new_records {
            let key = incoming.identity();
            match by_identity.get(&key) {
                None => {
                    by_identity.insert(key, incoming);
                    inserted += 1;
                }
                Some(current) => {
                    let combined = merge_records(current, &incoming);
                    by_identity.insert(key, combined);
                    merged += 1;
                }
            }
        }
        let mut refreshed: Vec<LessonRecord> = by_identity.into_values().collect();
        let conflict_links = link_conflicts(&mut refreshed);
        self.write(&refreshed)?;
        Ok(UpsertSummary {
            inserted,
            merged,
            conflict_links,
            total: refreshed.len() as u64,
        })
    }

    /// Mark matching records archived with a reason. Never deletes.
    pub fn archive(&self, lesson_ids: &[String], reason: &str) -> Result<u64> {
        let ids: BTreeSet<&str> = lesson_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let now = utc_now_iso();
        let reason = {
            let trimmed = reason.trim();
            if trimmed.is_empty() { "archived" } else { trimmed }
        };
        let mut changed = 0;
        let records: Vec<LessonRecord> = self
            .load()
            .into_iter()
            .map(|record| {
                if !ids.contains(record.lesson_id.as_str()) {
                    return record;
                }
                changed += 1;
                LessonRecord {
                    status: LessonStatus::Archived,
                    archived_reason: Some(reason.to_string()),
                    updated_at: now.clone(),
                    ..record
                }
            })
            .collect();
        if changed > 0 {
            self.write(&records)?;
        }
        Ok(changed)
    }

    /// Idempotent migration from a legacy `lessons.jsonl` into this store.
    ///
    /// Safe to run on every session startup: dedup keeps migration cheap and
    /// avoids one-off migration scripts during experiments.
    pub fn migrate_legacy(&self, legacy_path: &Path) -> Result<UpsertSummary> {
        let legacy = load_records_from(legacy_path);
        if legacy.is_empty() {
            return Ok(UpsertSummary {
                total: self.load().len() as u64,
                ..UpsertSummary::default()
            });
        }
        self.upsert(legacy)
    }
}

fn load_records_from(path: &Path) -> Vec<LessonRecord> {
    if !path.exists() {
        return Vec::new();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) => {
            warn!(path = %path.display(), %error, "failed to read lesson store");
            return Vec::new();
        }
    };
    let mut records = Vec::new();
    for line in content.lines() {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let Ok(row) = serde_json::from_str::<Value>(text) else {
            continue;
        };
        if let Some(record) = LessonRecord::from_row(&row) {
            records.push(record);
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(session_id: u64, rule: &str, fingerprints: &[&str]) -> LessonSeed {
        LessonSeed {
            session_id,
            task_id: "aggregate_report".into(),
            task: "gridtool aggregate task".into(),
            domain: "gridtool".into(),
            rule_text: rule.into(),
            trigger_fingerprints: fingerprints.iter().map(|fp| (*fp).to_string()).collect(),
            tags: Vec::new(),
        }
    }

    fn temp_store() -> (tempfile::TempDir, LessonStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LessonStore::new(dir.path().join("lessons_v2.jsonl"));
        (dir, store)
    }

    #[test]
    fn identity_is_stable_under_fingerprint_order() {
        let a = LessonRecord::from_candidate(seed(1, "TALLY uses arrow syntax", &["ef_b", "ef_a"]));
        let b = LessonRecord::from_candidate(seed(2, "TALLY uses arrow syntax", &["ef_a", "ef_b"]));
        assert_eq!(a.lesson_id, b.lesson_id);
        let c = LessonRecord::from_candidate(seed(1, "TALLY uses the arrow syntax", &["ef_a", "ef_b"]));
        assert_ne!(a.lesson_id, c.lesson_id);
    }

    #[test]
    fn upsert_dedups_by_identity_and_unions_sessions() {
        let (_dir, store) = temp_store();
        store
            .upsert(vec![LessonRecord::from_candidate(seed(3, "Quote LOAD paths", &["ef_x"]))])
            .unwrap();
        let summary = store
            .upsert(vec![LessonRecord::from_candidate(seed(7, "Quote LOAD paths", &["ef_x"]))])
            .unwrap();
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.merged, 1);
        assert_eq!(summary.total, 1);
        let records = store.load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_session_ids, vec![3, 7]);
    }

    #[test]
    fn merge_promotes_candidate_when_incoming_is_promoted() {
        let existing = LessonRecord::from_candidate(seed(1, "Quote LOAD paths", &["ef_x"]));
        let incoming = LessonRecord {
            status: LessonStatus::Promoted,
            ..LessonRecord::from_candidate(seed(2, "Quote LOAD paths", &["ef_x"]))
        };
        let merged = merge_records(&existing, &incoming);
        assert_eq!(merged.status, LessonStatus::Promoted);
    }

    #[test]
    fn archived_absorbs_incoming_status() {
        let existing = LessonRecord {
            status: LessonStatus::Archived,
            ..LessonRecord::from_candidate(seed(1, "Quote LOAD paths", &["ef_x"]))
        };
        let incoming = LessonRecord {
            status: LessonStatus::Promoted,
            ..LessonRecord::from_candidate(seed(2, "Quote LOAD paths", &["ef_x"]))
        };
        assert_eq!(merge_records(&existing, &incoming).status, LessonStatus::Archived);
    }

    #[test]
    fn conflicting_rules_sharing_a_trigger_get_linked() {
        let (_dir, store) = temp_store();
        let summary = store
            .upsert(vec![
                LessonRecord::from_candidate(seed(1, "LOAD requires quoted path", &["ef_load"])),
                LessonRecord::from_candidate(seed(2, "LOAD does not require quoted path", &["ef_load"])),
            ])
            .unwrap();
        assert!(summary.conflict_links >= 1);
        let records = store.load();
        assert_eq!(records.len(), 2);
        for record in &records {
            let other = records
                .iter()
                .find(|candidate| candidate.lesson_id != record.lesson_id)
                .unwrap();
            assert!(record.conflict_lesson_ids.contains(&other.lesson_id));
        }
    }

    #[test]
    fn load_skips_malformed_lines() {
        let (_dir, store) = temp_store();
        let record = LessonRecord::from_candidate(seed(1, "Quote LOAD paths", &["ef_x"]));
        let mut body = serde_json::to_string(&record.to_row()).unwrap();
        body.push_str("\nnot json at all\n{\"half\": true\n");
        std::fs::write(store.path(), body).unwrap();
        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn legacy_rows_migrate_as_promoted_with_heuristic_reliability() {
        let dir = tempfile::tempdir().unwrap();
        let legacy_path = dir.path().join("lessons.jsonl");
        std::fs::write(
            &legacy_path,
            r#"{"session_id": 4, "task_id": "t", "task": "t", "lesson": "INSERT needs ON CONFLICT for event_id", "eval_score": 0.8}"#,
        )
        .unwrap();
        let store = LessonStore::new(dir.path().join("lessons_v2.jsonl"));
        let summary = store.migrate_legacy(&legacy_path).unwrap();
        assert_eq!(summary.inserted, 1);
        let records = store.load();
        assert_eq!(records[0].status, LessonStatus::Promoted);
        assert!((records[0].reliability - 0.79).abs() < 1e-9);
        // Second migration is a no-op merge, not a duplicate.
        let summary = store.migrate_legacy(&legacy_path).unwrap();
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.total, 1);
    }

    #[test]
    fn rule_text_is_collapsed_and_capped() {
        let long = "rule  with   spaces ".repeat(60);
        let record = LessonRecord::from_candidate(seed(1, &long, &[]));
        assert!(record.rule_text.chars().count() <= MAX_RULE_TEXT_CHARS);
        assert!(!record.rule_text.contains("  "));
    }

    #[test]
    fn archive_marks_records_without_deleting() {
        let (_dir, store) = temp_store();
        store
            .upsert(vec![LessonRecord::from_candidate(seed(1, "Quote LOAD paths", &["ef_x"]))])
            .unwrap();
        let id = store.load()[0].lesson_id.clone();
        let changed = store.archive(&[id], "superseded").unwrap();
        assert_eq!(changed, 1);
        let records = store.load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, LessonStatus::Archived);
        assert_eq!(records[0].archived_reason.as_deref(), Some("superseded"));
    }
}
