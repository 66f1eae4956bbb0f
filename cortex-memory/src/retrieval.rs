//! Two-lane lesson retrieval: ranked scoring with selection guards.
//!
//! The strict lane scopes to the caller's domain/task and is always primary.
//! The transfer lane is an opt-in cross-domain pool used only to backfill
//! remaining slots, with every score down-weighted — strict winners are
//! never displaced.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::store::{LessonRecord, LessonStore};
use crate::text::{clamp, jaccard};

/// Default backfill quota for the transfer lane.
pub const DEFAULT_TRANSFER_MAX_RESULTS: usize = 1;
/// Default score multiplier applied to every transfer-lane row.
pub const DEFAULT_TRANSFER_SCORE_WEIGHT: f64 = 0.35;

/// Which lane produced a retrieval match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Strict,
    Transfer,
}

/// Score breakdown for one lesson against one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalScore {
    pub lesson_id: String,
    pub score: f64,
    pub fingerprint_match: f64,
    pub tag_overlap: f64,
    pub text_similarity: f64,
    pub reliability: f64,
    pub recency: f64,
}

/// One ranked retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalMatch {
    pub lesson: LessonRecord,
    pub score: RetrievalScore,
    pub lane: Lane,
}

/// Selection guard quotas.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalConfig {
    pub max_results: usize,
    pub max_per_source_session: usize,
    pub max_per_tag_bucket: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        RetrievalConfig {
            max_results: 8,
            max_per_source_session: 2,
            max_per_tag_bucket: 3,
        }
    }
}

impl RetrievalConfig {
    #[must_use]
    pub fn with_max_results(max_results: usize) -> Self {
        RetrievalConfig {
            max_results,
            ..RetrievalConfig::default()
        }
    }
}

/// Transfer-lane options for on-error retrieval.
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    pub enabled: bool,
    pub max_results: usize,
    pub score_weight: f64,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            enabled: false,
            max_results: DEFAULT_TRANSFER_MAX_RESULTS,
            score_weight: DEFAULT_TRANSFER_SCORE_WEIGHT,
        }
    }
}

fn fingerprint_match(query_fingerprint: &str, lesson: &LessonRecord) -> f64 {
    if query_fingerprint.is_empty() {
        return 0.0;
    }
    if lesson
        .trigger_fingerprints
        .iter()
        .any(|fp| fp == query_fingerprint)
    {
        return 1.0;
    }
    // Prefix-level similarity still helps when hash truncation differs.
    let prefix: String = query_fingerprint.chars().take(10).collect();
    if !prefix.is_empty()
        && lesson
            .trigger_fingerprints
            .iter()
            .any(|fp| fp.starts_with(&prefix))
    {
        return 0.7;
    }
    0.0
}

fn tag_overlap(query_tags: &BTreeSet<String>, lesson_tags: &[String]) -> f64 {
    if query_tags.is_empty() || lesson_tags.is_empty() {
        return 0.0;
    }
    let lesson_set: BTreeSet<&str> = lesson_tags.iter().map(String::as_str).collect();
    let intersection = query_tags
        .iter()
        .filter(|tag| lesson_set.contains(tag.as_str()))
        .count();
    let union = query_tags.len() + lesson_set.len() - intersection;
    intersection as f64 / union as f64
}

fn recency_score(iso_ts: &str) -> f64 {
    let normalized = iso_ts.replace('Z', "+00:00");
    let Ok(ts) = DateTime::parse_from_rfc3339(&normalized) else {
        return 0.0;
    };
    let age_secs = (Utc::now() - ts.with_timezone(&Utc)).num_seconds().max(0) as f64;
    let age_days = age_secs / 86_400.0;
    // 14-day half-life keeps fresh lessons relevant without discarding
    // history.
    clamp(1.0 / (1.0 + age_days / 14.0), 0.0, 1.0)
}

fn build_score(
    lesson: &LessonRecord,
    query_fingerprint: &str,
    query_tags: &BTreeSet<String>,
    query_text: &str,
) -> RetrievalScore {
    let fingerprint = fingerprint_match(query_fingerprint, lesson);
    let tags = tag_overlap(query_tags, &lesson.tags);
    let similarity = jaccard(query_text, &lesson.rule_text);
    let reliability = clamp(lesson.reliability, 0.0, 1.0);
    let recency = recency_score(&lesson.updated_at);
    let total = 0.40 * fingerprint
        + 0.25 * tags
        + 0.20 * similarity
        + 0.10 * reliability
        + 0.05 * recency;
    RetrievalScore {
        lesson_id: lesson.lesson_id.clone(),
        score: total,
        fingerprint_match: fingerprint,
        tag_overlap: tags,
        text_similarity: similarity,
        reliability,
        recency,
    }
}

/// True when the challenger loses conflict resolution.
///
/// Winner selection is deterministic: higher reliability first, then fresher
/// evidence, then the computed retrieval score.
fn conflict_loser(kept: &RetrievalMatch, challenger: &RetrievalMatch) -> bool {
    if challenger.lesson.reliability != kept.lesson.reliability {
        return challenger.lesson.reliability < kept.lesson.reliability;
    }
    if challenger.lesson.updated_at != kept.lesson.updated_at {
        return challenger.lesson.updated_at < kept.lesson.updated_at;
    }
    challenger.score.score <= kept.score.score
}

fn in_conflict(a: &LessonRecord, b: &LessonRecord) -> bool {
    a.conflict_lesson_ids.contains(&b.lesson_id) || b.conflict_lesson_ids.contains(&a.lesson_id)
}

fn guard_source_session(lesson: &LessonRecord) -> u64 {
    lesson.source_session_ids.last().copied().unwrap_or(0)
}

fn guard_tag_bucket(lesson: &LessonRecord) -> String {
    lesson
        .tags
        .first()
        .cloned()
        .unwrap_or_else(|| "generic".to_string())
}

/// Single deterministic selection pass over ranked rows.
fn select_with_guards(
    ranked: Vec<RetrievalMatch>,
    config: &RetrievalConfig,
) -> (Vec<RetrievalMatch>, Vec<String>) {
    let mut selected: Vec<RetrievalMatch> = Vec::new();
    let mut conflict_losers: Vec<String> = Vec::new();
    let mut per_session: BTreeMap<u64, usize> = BTreeMap::new();
    let mut per_tag_bucket: BTreeMap<String, usize> = BTreeMap::new();

    for row in ranked {
        let session = guard_source_session(&row.lesson);
        if session > 0 && per_session.get(&session).copied().unwrap_or(0) >= config.max_per_source_session
        {
            continue;
        }
        let bucket = guard_tag_bucket(&row.lesson);
        if per_tag_bucket.get(&bucket).copied().unwrap_or(0) >= config.max_per_tag_bucket {
            continue;
        }

        let conflict_idx = selected
            .iter()
            .position(|chosen| in_conflict(&row.lesson, &chosen.lesson));
        if let Some(idx) = conflict_idx {
            if conflict_loser(&selected[idx], &row) {
                conflict_losers.push(row.lesson.lesson_id.clone());
            } else {
                conflict_losers.push(selected[idx].lesson.lesson_id.clone());
                selected[idx] = row;
            }
            continue;
        }

        selected.push(row);
        if session > 0 {
            *per_session.entry(session).or_insert(0) += 1;
        }
        *per_tag_bucket.entry(bucket).or_insert(0) += 1;

        if selected.len() >= config.max_results {
            break;
        }
    }
    (selected, conflict_losers)
}

/// Append ranked candidates while honoring existing guard state.
///
/// The transfer lane uses this path so strict winners remain pinned:
/// conflict checks only reject challengers, they never replace
/// already-selected rows.
fn append_with_guards(
    selected: Vec<RetrievalMatch>,
    ranked: Vec<RetrievalMatch>,
    config: &RetrievalConfig,
    max_additional: usize,
) -> (Vec<RetrievalMatch>, Vec<String>) {
    if max_additional == 0 {
        return (selected, Vec::new());
    }
    let mut merged = selected;
    let mut conflict_losers: Vec<String> = Vec::new();
    let mut seen: BTreeSet<String> = merged
        .iter()
        .map(|row| row.lesson.lesson_id.clone())
        .collect();
    let mut per_session: BTreeMap<u64, usize> = BTreeMap::new();
    let mut per_tag_bucket: BTreeMap<String, usize> = BTreeMap::new();
    for row in &merged {
        let session = guard_source_session(&row.lesson);
        if session > 0 {
            *per_session.entry(session).or_insert(0) += 1;
        }
        *per_tag_bucket.entry(guard_tag_bucket(&row.lesson)).or_insert(0) += 1;
    }

    let mut added = 0;
    for row in ranked {
        if merged.len() >= config.max_results || added >= max_additional {
            break;
        }
        if seen.contains(&row.lesson.lesson_id) {
            continue;
        }
        let session = guard_source_session(&row.lesson);
        if session > 0 && per_session.get(&session).copied().unwrap_or(0) >= config.max_per_source_session
        {
            continue;
        }
        let bucket = guard_tag_bucket(&row.lesson);
        if per_tag_bucket.get(&bucket).copied().unwrap_or(0) >= config.max_per_tag_bucket {
            continue;
        }
        if merged.iter().any(|chosen| in_conflict(&row.lesson, &chosen.lesson)) {
            conflict_losers.push(row.lesson.lesson_id.clone());
            continue;
        }
        seen.insert(row.lesson.lesson_id.clone());
        if session > 0 {
            *per_session.entry(session).or_insert(0) += 1;
        }
        *per_tag_bucket.entry(bucket).or_insert(0) += 1;
        merged.push(row);
        added += 1;
    }
    (merged, conflict_losers)
}

/// Compute ranked retrieval rows before selection guards are applied.
fn rank_lessons(
    records: &[LessonRecord],
    query_text: &str,
    query_fingerprint: &str,
    query_tags: &[String],
    lane: Lane,
    score_multiplier: f64,
) -> Vec<RetrievalMatch> {
    let query_tag_set: BTreeSet<String> = query_tags
        .iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect();
    let weight = score_multiplier.max(0.0);
    let mut ranked: Vec<RetrievalMatch> = Vec::new();

    for lesson in records {
        if !lesson.status.is_active() {
            continue;
        }
        let mut score = build_score(lesson, query_fingerprint, &query_tag_set, query_text);
        let weighted_total = score.score * weight;
        if weighted_total <= 0.0 {
            continue;
        }
        score.score = weighted_total;
        ranked.push(RetrievalMatch {
            lesson: lesson.clone(),
            score,
            lane,
        });
    }

    ranked.sort_by(|a, b| {
        b.score
            .score
            .partial_cmp(&a.score.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.lesson
                    .reliability
                    .partial_cmp(&a.lesson.reliability)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.lesson.updated_at.cmp(&a.lesson.updated_at))
    });
    ranked
}

/// Rank + select over an explicit record set.
#[must_use]
pub fn retrieve_lessons(
    records: &[LessonRecord],
    query_text: &str,
    query_fingerprint: &str,
    query_tags: &[String],
    config: &RetrievalConfig,
) -> (Vec<RetrievalMatch>, Vec<String>) {
    let ranked = rank_lessons(
        records,
        query_text,
        query_fingerprint,
        query_tags,
        Lane::Strict,
        1.0,
    );
    select_with_guards(ranked, config)
}

/// Pre-run retrieval query.
#[derive(Debug, Clone, Default)]
pub struct PreRunQuery {
    pub task_id: String,
    pub domain: String,
    pub task_text: String,
    pub recent_fingerprints: Vec<String>,
    pub query_tags: Vec<String>,
    pub max_results: usize,
}

/// Pre-run retrieval using intent context and recent fingerprints.
///
/// Scopes to records whose task id matches (records without a task id pass)
/// or whose domain matches. No transfer lane.
#[must_use]
pub fn retrieve_pre_run(
    store: &LessonStore,
    query: &PreRunQuery,
) -> (Vec<RetrievalMatch>, Vec<String>) {
    let records = store.load();
    let scoped: Vec<LessonRecord> = records
        .into_iter()
        .filter(|row| {
            (row.task_id.is_empty() || row.task_id == query.task_id)
                || (!row.domain.is_empty() && row.domain == query.domain)
        })
        .collect();
    let primary_fingerprint = query
        .recent_fingerprints
        .first()
        .map(String::as_str)
        .unwrap_or("");
    let max_results = if query.max_results == 0 { 8 } else { query.max_results };
    retrieve_lessons(
        &scoped,
        &query.task_text,
        primary_fingerprint,
        &query.query_tags,
        &RetrievalConfig::with_max_results(max_results),
    )
}

/// On-error retrieval query.
#[derive(Debug, Clone, Default)]
pub struct OnErrorQuery {
    pub error_text: String,
    pub fingerprint: String,
    pub domain: String,
    /// Optional narrowing; keeps broad domain memory available while
    /// preferring exact task matches when the task id is known.
    pub task_id: String,
    pub query_tags: Vec<String>,
    pub max_results: usize,
    pub include_domainless: bool,
    pub transfer: TransferOptions,
}

/// On-error retrieval prioritizing exact fingerprint matches.
///
/// Domain filtering is strict by default to prevent cross-tool syntax bleed
/// (e.g. gridtool hints injected during fluxtool runs). Domainless lessons
/// are excluded unless explicitly allowed.
#[must_use]
pub fn retrieve_on_error(
    store: &LessonStore,
    query: &OnErrorQuery,
) -> (Vec<RetrievalMatch>, Vec<String>) {
    let records = store.load();
    let normalized_domain = query.domain.trim().to_lowercase();
    let normalized_task = query.task_id.trim();
    let mut strict_scoped: Vec<LessonRecord> = Vec::new();
    let mut transfer_scoped: Vec<LessonRecord> = Vec::new();

    for row in records {
        let row_domain = row.domain.trim().to_lowercase();
        let mut domain_ok = row_domain == normalized_domain;
        if query.include_domainless && row_domain.is_empty() {
            domain_ok = true;
        }

        if domain_ok {
            if !normalized_task.is_empty() && !row.task_id.is_empty() && row.task_id != normalized_task
            {
                continue;
            }
            strict_scoped.push(row);
            continue;
        }
        if !query.transfer.enabled {
            continue;
        }
        // The transfer lane only considers explicit cross-domain lessons.
        if row_domain.is_empty() || row_domain == normalized_domain {
            continue;
        }
        transfer_scoped.push(row);
    }

    let max_results = if query.max_results == 0 { 3 } else { query.max_results };
    let config = RetrievalConfig::with_max_results(max_results);
    let strict_ranked = rank_lessons(
        &strict_scoped,
        &query.error_text,
        &query.fingerprint,
        &query.query_tags,
        Lane::Strict,
        1.0,
    );
    let (strict_matches, mut losers) = select_with_guards(strict_ranked, &config);

    let remaining = max_results.saturating_sub(strict_matches.len());
    let transfer_quota = query.transfer.max_results.min(remaining);
    if !query.transfer.enabled || transfer_quota == 0 || transfer_scoped.is_empty() {
        return (strict_matches, losers);
    }

    debug!(
        strict = strict_matches.len(),
        transfer_pool = transfer_scoped.len(),
        transfer_quota,
        "backfilling from transfer lane"
    );
    let transfer_ranked = rank_lessons(
        &transfer_scoped,
        &query.error_text,
        &query.fingerprint,
        &query.query_tags,
        Lane::Transfer,
        query.transfer.score_weight,
    );
    let (merged, transfer_losers) =
        append_with_guards(strict_matches, transfer_ranked, &config, transfer_quota);
    losers.extend(transfer_losers);
    (merged, losers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LessonSeed, LessonStatus};

    fn record(rule: &str, domain: &str, session: u64, fingerprints: &[&str]) -> LessonRecord {
        LessonRecord::from_candidate(LessonSeed {
            session_id: session,
            task_id: "aggregate_report".into(),
            task: "aggregate".into(),
            domain: domain.into(),
            rule_text: rule.into(),
            trigger_fingerprints: fingerprints.iter().map(|fp| (*fp).to_string()).collect(),
            tags: Vec::new(),
        })
    }

    fn store_with(records: Vec<LessonRecord>) -> (tempfile::TempDir, LessonStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LessonStore::new(dir.path().join("lessons_v2.jsonl"));
        store.write(&records).unwrap();
        (dir, store)
    }

    #[test]
    fn exact_fingerprint_beats_high_reliability() {
        let matching = record("TALLY uses arrow syntax", "gridtool", 1, &["ef_exact"]);
        let matching = LessonRecord { reliability: 0.4, ..matching };
        let reliable = record("RANK needs asc or desc direction word", "gridtool", 2, &["ef_other"]);
        let reliable = LessonRecord {
            status: LessonStatus::Promoted,
            reliability: 0.9,
            ..reliable
        };
        let (_dir, store) = store_with(vec![reliable, matching]);

        let (matches, _) = retrieve_on_error(
            &store,
            &OnErrorQuery {
                error_text: "TALLY syntax error".into(),
                fingerprint: "ef_exact".into(),
                domain: "gridtool".into(),
                max_results: 2,
                ..OnErrorQuery::default()
            },
        );
        assert!(!matches.is_empty());
        assert!((matches[0].score.fingerprint_match - 1.0).abs() < f64::EPSILON);
        assert_eq!(matches[0].lesson.trigger_fingerprints, vec!["ef_exact".to_string()]);
    }

    #[test]
    fn suppressed_records_are_never_returned() {
        let suppressed = LessonRecord {
            status: LessonStatus::Suppressed,
            ..record("LOAD does not require quoted path", "gridtool", 1, &["ef_load"])
        };
        let (_dir, store) = store_with(vec![suppressed]);
        let (matches, _) = retrieve_on_error(
            &store,
            &OnErrorQuery {
                error_text: "LOAD path must be quoted".into(),
                fingerprint: "ef_load".into(),
                domain: "gridtool".into(),
                ..OnErrorQuery::default()
            },
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn source_session_quota_caps_selection() {
        let mut records = Vec::new();
        for idx in 0..5 {
            records.push(record(
                &format!("KEEP operator rule number {idx} uses eq"),
                "gridtool",
                9,
                &[],
            ));
        }
        let (_dir, store) = store_with(records);
        let (matches, _) = retrieve_pre_run(
            &store,
            &PreRunQuery {
                task_id: "aggregate_report".into(),
                domain: "gridtool".into(),
                task_text: "KEEP operator rule uses eq".into(),
                max_results: 5,
                ..PreRunQuery::default()
            },
        );
        assert!(matches.len() <= 2, "expected session quota of 2, got {}", matches.len());
    }

    #[test]
    fn transfer_lane_never_displaces_strict_winners() {
        let strict = record("FILTER expects word operators like is", "fluxtool", 1, &["ef_op"]);
        let foreign = record("KEEP expects word operators like eq", "gridtool", 2, &["ef_op"]);
        let foreign = LessonRecord { reliability: 0.95, ..foreign };
        let (_dir, store) = store_with(vec![strict.clone(), foreign]);

        let query = OnErrorQuery {
            error_text: "unknown operator".into(),
            fingerprint: "ef_op".into(),
            domain: "fluxtool".into(),
            max_results: 2,
            transfer: TransferOptions {
                enabled: true,
                max_results: 1,
                score_weight: 0.35,
            },
            ..OnErrorQuery::default()
        };
        let (matches, _) = retrieve_on_error(&store, &query);
        assert_eq!(matches[0].lesson.lesson_id, strict.lesson_id);
        assert_eq!(matches[0].lane, Lane::Strict);
        if matches.len() > 1 {
            assert_eq!(matches[1].lane, Lane::Transfer);
        }
    }

    #[test]
    fn transfer_lane_off_by_default_excludes_cross_domain() {
        let foreign = record("TALLY uses arrow syntax", "gridtool", 1, &["ef_syntax"]);
        let (_dir, store) = store_with(vec![foreign]);
        let (matches, _) = retrieve_on_error(
            &store,
            &OnErrorQuery {
                error_text: "GROUP syntax error".into(),
                fingerprint: "ef_syntax".into(),
                domain: "fluxtool".into(),
                ..OnErrorQuery::default()
            },
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn transfer_scores_are_down_weighted() {
        let foreign = record("TALLY uses arrow syntax for totals", "gridtool", 1, &["ef_syntax"]);
        let (_dir, store) = store_with(vec![foreign]);
        let query = OnErrorQuery {
            error_text: "TALLY uses arrow syntax for totals".into(),
            fingerprint: "ef_syntax".into(),
            domain: "fluxtool".into(),
            max_results: 2,
            transfer: TransferOptions {
                enabled: true,
                max_results: 1,
                score_weight: 0.35,
            },
            ..OnErrorQuery::default()
        };
        let (matches, _) = retrieve_on_error(&store, &query);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].lane, Lane::Transfer);
        // Raw total would exceed 0.40 on an exact fingerprint match alone.
        assert!(matches[0].score.score < 0.40);
    }

    #[test]
    fn conflict_resolution_prefers_reliability() {
        let high = LessonRecord {
            reliability: 0.9,
            ..record("LOAD requires quoted path", "gridtool", 1, &["ef_load"])
        };
        let low = LessonRecord {
            reliability: 0.2,
            ..record("LOAD does not require quoted path", "gridtool", 2, &["ef_load"])
        };
        let (_dir, store) = store_with(vec![high.clone(), low.clone()]);
        // Link conflicts through the store so both sides reference each other.
        store.upsert(Vec::new()).unwrap();

        let (matches, losers) = retrieve_on_error(
            &store,
            &OnErrorQuery {
                error_text: "LOAD path must be quoted".into(),
                fingerprint: "ef_load".into(),
                domain: "gridtool".into(),
                max_results: 3,
                ..OnErrorQuery::default()
            },
        );
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].lesson.lesson_id, high.lesson_id);
        assert!(losers.contains(&low.lesson_id));
    }
}
