//! Escalation controller: critic model tier under repeated low quality.
//!
//! Tracks three streak counters per benchmark series. When any streak hits
//! the trigger threshold the critic tier bumps one level
//! (`haiku → sonnet → opus`) for a bounded number of runs, then relaxes back
//! to the base tier. State lives in a small JSON file injected by path so
//! tests use a temp file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{OPUS_MODEL, SONNET_MODEL};
use crate::error::Result;

/// Model tiers, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Haiku,
    Sonnet,
    Opus,
}

impl Tier {
    #[must_use]
    pub fn from_model(model: &str) -> Self {
        let lowered = model.to_lowercase();
        if lowered.contains("opus") {
            Tier::Opus
        } else if lowered.contains("sonnet") {
            Tier::Sonnet
        } else {
            Tier::Haiku
        }
    }

    #[must_use]
    pub fn bumped(self) -> Self {
        match self {
            Tier::Haiku => Tier::Sonnet,
            Tier::Sonnet | Tier::Opus => Tier::Opus,
        }
    }

    /// Model id for this tier; non-standard base models stay the haiku-tier
    /// model.
    #[must_use]
    pub fn model<'a>(self, base_model: &'a str) -> &'a str {
        match self {
            Tier::Haiku => base_model,
            Tier::Sonnet => SONNET_MODEL,
            Tier::Opus => OPUS_MODEL,
        }
    }
}

/// Persisted controller state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationState {
    pub tier: Tier,
    #[serde(default)]
    pub override_runs_remaining: u32,
    #[serde(default)]
    pub low_score_streak: u32,
    #[serde(default)]
    pub critic_no_updates_streak: u32,
    #[serde(default)]
    pub fail_streak: u32,
    #[serde(default)]
    pub last_trigger: Option<String>,
}

impl EscalationState {
    #[must_use]
    pub fn new(base_model: &str) -> Self {
        EscalationState {
            tier: Tier::from_model(base_model),
            override_runs_remaining: 0,
            low_score_streak: 0,
            critic_no_updates_streak: 0,
            fail_streak: 0,
            last_trigger: None,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Tunables for the controller.
#[derive(Debug, Clone, Copy)]
pub struct EscalationConfig {
    pub score_threshold: f64,
    pub consecutive_runs: u32,
    pub override_runs: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        EscalationConfig {
            score_threshold: 0.75,
            consecutive_runs: 2,
            override_runs: 3,
        }
    }
}

/// Load state, falling back to a fresh default on any problem.
#[must_use]
pub fn load_escalation_state(path: &Path, base_model: &str) -> EscalationState {
    let default = EscalationState::new(base_model);
    let Ok(text) = std::fs::read_to_string(path) else {
        return default;
    };
    match serde_json::from_str::<EscalationState>(&text) {
        Ok(state) => state,
        Err(error) => {
            warn!(path = %path.display(), %error, "malformed escalation state; resetting");
            default
        }
    }
}

/// Persist state as pretty JSON.
pub fn save_escalation_state(path: &Path, state: &EscalationState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(state)?)?;
    Ok(())
}

/// Choose the critic model for this run, consuming one override run if an
/// escalation is active.
#[must_use]
pub fn resolve_critic_model(
    base_model: &str,
    auto_escalate: bool,
    state: &mut EscalationState,
) -> String {
    if !auto_escalate || state.override_runs_remaining == 0 {
        state.tier = Tier::from_model(base_model);
        state.override_runs_remaining = 0;
        return base_model.to_string();
    }
    state.override_runs_remaining -= 1;
    debug!(tier = ?state.tier, remaining = state.override_runs_remaining, "escalation override active");
    state.tier.model(base_model).to_string()
}

/// Fold one run's quality signals into the streaks, possibly bumping tier.
pub fn escalate_if_needed(
    state: &mut EscalationState,
    base_model: &str,
    auto_escalate: bool,
    eval_score: f64,
    eval_passed: bool,
    critic_no_updates: bool,
    config: &EscalationConfig,
) {
    if eval_score < config.score_threshold {
        state.low_score_streak += 1;
    } else {
        state.low_score_streak = 0;
    }
    if eval_passed {
        state.fail_streak = 0;
    } else {
        state.fail_streak += 1;
    }
    if !eval_passed && critic_no_updates {
        state.critic_no_updates_streak += 1;
    } else {
        state.critic_no_updates_streak = 0;
    }

    if !auto_escalate {
        return;
    }

    let low_trigger = state.low_score_streak >= config.consecutive_runs;
    let no_update_trigger = state.critic_no_updates_streak >= config.consecutive_runs;
    let fail_trigger = state.fail_streak >= config.consecutive_runs;
    if !(low_trigger || no_update_trigger || fail_trigger) {
        return;
    }

    let current = if state.override_runs_remaining > 0 {
        state.tier
    } else {
        Tier::from_model(base_model)
    };
    state.tier = current.bumped();
    state.override_runs_remaining = config.override_runs;
    state.low_score_streak = 0;
    state.critic_no_updates_streak = 0;
    state.last_trigger = Some(
        if fail_trigger {
            "failed_runs"
        } else if low_trigger {
            "low_score"
        } else {
            "critic_no_updates"
        }
        .to_string(),
    );
    info!(tier = ?state.tier, trigger = ?state.last_trigger, "critic tier escalated");
}
