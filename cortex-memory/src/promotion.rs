//! Promotion controller: folds run outcomes into lesson records.
//!
//! Each retrieval→run pair yields a [`LessonOutcome`]; applying it updates
//! the lesson's utility history, smooths its reliability, and drives the
//! status machine (`candidate → promoted | suppressed`). Suppression guards
//! run first so harmful lessons stop amplifying immediately.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::store::{LessonRecord, LessonStatus, LessonStore};
use crate::text::clamp;

/// Outcome signals for one lesson over one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonOutcome {
    pub lesson_id: String,
    /// Signed error-count delta versus the running baseline, in [-1, 1].
    pub error_reduction: f64,
    /// Signed step-efficiency delta versus the running baseline.
    pub step_efficiency_gain: f64,
    /// Optional referee (judge) score delta.
    pub referee_score_gain: Option<f64>,
    pub major_regression: bool,
    pub contradiction_lost: bool,
}

impl LessonOutcome {
    #[must_use]
    pub fn new(lesson_id: impl Into<String>, error_reduction: f64, step_efficiency_gain: f64) -> Self {
        LessonOutcome {
            lesson_id: lesson_id.into(),
            error_reduction,
            step_efficiency_gain,
            referee_score_gain: None,
            major_regression: false,
            contradiction_lost: false,
        }
    }
}

/// Tunable thresholds for the status machine.
///
/// The promotion threshold is empirical; operators can tighten or relax it
/// without touching the controller.
#[derive(Debug, Clone, Copy)]
pub struct PromotionConfig {
    /// Mean utility over the recent window required to promote a candidate.
    pub promote_mean_utility: f64,
    /// Minimum history length before promotion is considered.
    pub promote_min_history: usize,
    /// Minimum retrievals before a non-positive trend suppresses.
    pub suppress_min_retrievals: u64,
    /// Utility history is bounded to this many entries.
    pub history_cap: usize,
    /// Mean utility is taken over at most this many recent entries.
    pub mean_window: usize,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        PromotionConfig {
            promote_mean_utility: 0.20,
            promote_min_history: 3,
            suppress_min_retrievals: 3,
            history_cap: 30,
            mean_window: 10,
        }
    }
}

/// Counters reported by [`apply_outcomes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct OutcomeSummary {
    pub updated: u64,
    pub promoted: u64,
    pub suppressed: u64,
}

/// Compute utility for one outcome.
///
/// Without a referee signal the weighting is `0.65·error + 0.35·steps`;
/// with one it is `0.50·error + 0.30·steps + 0.20·referee`.
#[must_use]
pub fn compute_utility(
    error_reduction: f64,
    step_efficiency_gain: f64,
    referee_score_gain: Option<f64>,
) -> f64 {
    match referee_score_gain {
        None => 0.65 * error_reduction + 0.35 * step_efficiency_gain,
        Some(referee) => 0.50 * error_reduction + 0.30 * step_efficiency_gain + 0.20 * referee,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn update_record(record: &LessonRecord, outcome: &LessonOutcome, config: &PromotionConfig) -> LessonRecord {
    let utility = compute_utility(
        outcome.error_reduction,
        outcome.step_efficiency_gain,
        outcome.referee_score_gain,
    );
    let mut history = record.utility_history.clone();
    if history.len() + 1 > config.history_cap {
        history = history.split_off(history.len() + 1 - config.history_cap);
    }
    history.push(utility);

    let helpful_count = record.helpful_count + u64::from(utility > 0.0);
    let harmful_count = record.harmful_count + u64::from(utility <= 0.0);
    let major_regressions = record.major_regressions + u64::from(outcome.major_regression);
    let contradiction_losses = record.contradiction_losses + u64::from(outcome.contradiction_lost);
    let retrieval_count = record.retrieval_count + 1;

    // Reliability tracks smoothed utility impact and stays in [0,1].
    let utility_mapped = clamp((utility + 1.0) / 2.0, 0.0, 1.0);
    let reliability = clamp(0.7 * record.reliability + 0.3 * utility_mapped, 0.0, 1.0);

    let window = config.mean_window.min(history.len());
    let mean_utility = mean(&history[history.len() - window..]);

    // Suppression guards run first: contradiction losses or a harmful trend
    // must immediately stop future retrieval amplification.
    let status = if contradiction_losses > 0 {
        LessonStatus::Suppressed
    } else if retrieval_count >= config.suppress_min_retrievals && mean_utility <= 0.0 {
        LessonStatus::Suppressed
    } else if record.status == LessonStatus::Candidate
        && history.len() >= config.promote_min_history
        && mean_utility >= config.promote_mean_utility
        && major_regressions == 0
    {
        LessonStatus::Promoted
    } else {
        record.status
    };

    debug!(
        lesson_id = %record.lesson_id,
        utility,
        mean_utility,
        reliability,
        status = %status,
        "applied lesson outcome"
    );

    LessonRecord {
        status,
        reliability,
        retrieval_count,
        helpful_count,
        harmful_count,
        utility_history: history,
        major_regressions,
        contradiction_losses,
        ..record.clone()
    }
}

/// Fold every outcome into its lesson and write the updated set back.
///
/// Unknown lesson ids are skipped; an empty outcome list is a no-op.
#[instrument(skip_all, fields(outcomes = outcomes.len()))]
pub fn apply_outcomes(
    store: &LessonStore,
    outcomes: &[LessonOutcome],
    config: &PromotionConfig,
) -> Result<OutcomeSummary> {
    if outcomes.is_empty() {
        return Ok(OutcomeSummary::default());
    }
    let records = store.load();
    if records.is_empty() {
        return Ok(OutcomeSummary::default());
    }

    let mut by_id: std::collections::BTreeMap<String, LessonRecord> = records
        .into_iter()
        .map(|record| (record.lesson_id.clone(), record))
        .collect();
    let mut summary = OutcomeSummary::default();

    for outcome in outcomes {
        let Some(current) = by_id.get(&outcome.lesson_id) else {
            continue;
        };
        let before = current.status;
        let after = update_record(current, outcome, config);
        let after_status = after.status;
        by_id.insert(outcome.lesson_id.clone(), after);
        summary.updated += 1;
        if before != LessonStatus::Promoted && after_status == LessonStatus::Promoted {
            summary.promoted += 1;
        }
        if before != LessonStatus::Suppressed && after_status == LessonStatus::Suppressed {
            summary.suppressed += 1;
        }
    }

    let updated: Vec<LessonRecord> = by_id.into_values().collect();
    store.write(&updated)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LessonSeed;

    fn store_with(records: Vec<LessonRecord>) -> (tempfile::TempDir, LessonStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LessonStore::new(dir.path().join("lessons_v2.jsonl"));
        store.write(&records).unwrap();
        (dir, store)
    }

    fn candidate(rule: &str) -> LessonRecord {
        LessonRecord::from_candidate(LessonSeed {
            session_id: 1,
            task_id: "t".into(),
            task: "t".into(),
            domain: "gridtool".into(),
            rule_text: rule.into(),
            trigger_fingerprints: vec!["ef_x".into()],
            tags: Vec::new(),
        })
    }

    #[test]
    fn utility_weights_match_the_plan() {
        assert!((compute_utility(0.5, 0.2, None) - 0.395).abs() < 1e-9);
        assert!((compute_utility(0.5, 0.2, Some(0.4)) - 0.39).abs() < 1e-9);
    }

    #[test]
    fn three_positive_outcomes_promote_a_candidate() {
        let record = candidate("TALLY uses arrow syntax");
        let id = record.lesson_id.clone();
        let (_dir, store) = store_with(vec![record]);
        let config = PromotionConfig::default();
        let outcomes = [
            LessonOutcome::new(&id, 0.4, 0.2),
            LessonOutcome::new(&id, 0.5, 0.3),
            LessonOutcome::new(&id, 0.6, 0.3),
        ];
        let mut last = OutcomeSummary::default();
        for outcome in &outcomes {
            last = apply_outcomes(&store, std::slice::from_ref(outcome), &config).unwrap();
        }
        assert_eq!(last.promoted, 1);
        let records = store.load();
        assert_eq!(records[0].status, LessonStatus::Promoted);
        assert_eq!(records[0].retrieval_count, 3);
        assert_eq!(records[0].helpful_count, 3);
    }

    #[test]
    fn contradiction_loss_suppresses_even_promoted() {
        let record = LessonRecord {
            status: LessonStatus::Promoted,
            ..candidate("LOAD does not require quoted path")
        };
        let id = record.lesson_id.clone();
        let (_dir, store) = store_with(vec![record]);
        let outcome = LessonOutcome {
            contradiction_lost: true,
            ..LessonOutcome::new(&id, 0.2, 0.1)
        };
        let summary = apply_outcomes(&store, &[outcome], &PromotionConfig::default()).unwrap();
        assert_eq!(summary.suppressed, 1);
        assert_eq!(store.load()[0].status, LessonStatus::Suppressed);
    }

    #[test]
    fn non_positive_trend_suppresses_after_enough_retrievals() {
        let record = candidate("RANK direction must be asc");
        let id = record.lesson_id.clone();
        let (_dir, store) = store_with(vec![record]);
        let config = PromotionConfig::default();
        for _ in 0..3 {
            apply_outcomes(&store, &[LessonOutcome::new(&id, -0.2, -0.1)], &config).unwrap();
        }
        let records = store.load();
        assert_eq!(records[0].status, LessonStatus::Suppressed);
        assert_eq!(records[0].harmful_count, 3);
    }

    #[test]
    fn reliability_smooths_toward_mapped_utility() {
        let record = candidate("KEEP uses word operators");
        let id = record.lesson_id.clone();
        let (_dir, store) = store_with(vec![record]);
        apply_outcomes(&store, &[LessonOutcome::new(&id, 1.0, 1.0)], &PromotionConfig::default())
            .unwrap();
        // 0.7*0.5 + 0.3*1.0 = 0.65
        assert!((store.load()[0].reliability - 0.65).abs() < 1e-6);
    }

    #[test]
    fn history_is_bounded() {
        let record = candidate("PICK keeps listed columns only");
        let id = record.lesson_id.clone();
        let (_dir, store) = store_with(vec![record]);
        let config = PromotionConfig::default();
        for _ in 0..40 {
            apply_outcomes(&store, &[LessonOutcome::new(&id, 0.5, 0.5)], &config).unwrap();
        }
        assert_eq!(store.load()[0].utility_history.len(), 30);
    }

    #[test]
    fn unknown_lesson_ids_are_skipped() {
        let (_dir, store) = store_with(vec![candidate("SHOW prints csv")]);
        let summary = apply_outcomes(
            &store,
            &[LessonOutcome::new("lsn_missing", 0.5, 0.5)],
            &PromotionConfig::default(),
        )
        .unwrap();
        assert_eq!(summary.updated, 0);
    }
}
