//! LLM judge: out-of-loop pass/fail verdict.
//!
//! Used when the contract is absent or only partially authoritative. The
//! judge sees the task, a compacted event tail, and the adapter's
//! final-state dump, and must answer in strict JSON. Parse or call failures
//! degrade to a failing verdict with a `judge_*` reason — they never unwind
//! the session.

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::config::{OPUS_MODEL, SONNET_MODEL};
use crate::provider::{ChatMessage, LlmProvider, LlmRequest, extract_json_object};
use cortex_memory::Event;

const MAX_JUDGE_EVENTS: usize = 30;
const MAX_REASONS: usize = 6;
const MAX_REASON_CHARS: usize = 280;

/// Verdict from the judge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgeResult {
    pub passed: bool,
    pub score: f64,
    pub reasons: Vec<String>,
    #[serde(skip)]
    pub raw_response: String,
}

impl JudgeResult {
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        JudgeResult {
            passed: false,
            score: 0.0,
            reasons: vec![reason.into()],
            raw_response: String::new(),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Judge model one tier above the executor.
#[must_use]
pub fn default_judge_model(executor_model: &str) -> String {
    let lowered = executor_model.to_lowercase();
    if lowered.contains("opus") || lowered.contains("sonnet") {
        OPUS_MODEL.to_string()
    } else {
        SONNET_MODEL.to_string()
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars).collect();
    format!("{clipped}...")
}

/// Strip large outputs so the judge context stays manageable.
fn compact_events(events: &[Event]) -> Vec<Value> {
    let tail = if events.len() > MAX_JUDGE_EVENTS {
        &events[events.len() - MAX_JUDGE_EVENTS..]
    } else {
        events
    };
    tail.iter()
        .map(|event| {
            let mut row = serde_json::Map::new();
            row.insert("step".into(), Value::from(event.step));
            row.insert("tool".into(), Value::String(event.tool.clone()));
            row.insert("ok".into(), Value::Bool(event.ok));
            if let Some(object) = event.tool_input.as_object() {
                let compact: serde_json::Map<String, Value> = object
                    .iter()
                    .map(|(key, value)| {
                        let compacted = match value.as_str() {
                            Some(text) => Value::String(clip(text, 300)),
                            None => value.clone(),
                        };
                        (key.clone(), compacted)
                    })
                    .collect();
                row.insert("tool_input".into(), Value::Object(compact));
            }
            if let Some(error) = &event.error {
                row.insert("error".into(), Value::String(clip(error, 500)));
            }
            match &event.output {
                Value::String(text) if !text.is_empty() => {
                    row.insert("output".into(), Value::String(clip(text, 500)));
                }
                Value::Null | Value::String(_) => {}
                other => {
                    row.insert("output".into(), Value::String(clip(&other.to_string(), 500)));
                }
            }
            Value::Object(row)
        })
        .collect()
}

fn judge_system_prompt(domain_name: &str) -> String {
    format!(
        concat!(
            "You are a strict task evaluator for a self-improving AI agent system.\n",
            "Domain: {}\n\n",
            "Your job: judge whether the agent completed the assigned task correctly.\n\n",
            "Return STRICT JSON only:\n",
            "{{\"passed\": true|false, \"score\": 0.0-1.0, \"reasons\": [\"specific reason 1\", ...]}}\n\n",
            "Scoring guide:\n",
            "- 1.0: Task fully completed, correct output\n",
            "- 0.75: Task mostly complete, minor issues\n",
            "- 0.5: Partial completion, significant issues\n",
            "- 0.25: Attempted but largely wrong\n",
            "- 0.0: Did not complete or completely wrong\n\n",
            "Rules:\n",
            "- Each reason MUST reference concrete evidence: error messages, wrong output, missing steps, or specific tool call results.\n",
            "- Do NOT give generic reasons like 'good job' or 'needs improvement'.\n",
            "- Judge based on the TASK REQUIREMENTS, not on style or approach.\n",
            "- If the final state shows correct results, the task passes regardless of how many errors occurred along the way.\n",
        ),
        domain_name
    )
}

/// Evaluate task completion with the judge model.
#[instrument(skip_all, fields(model, domain_name))]
pub async fn llm_judge(
    provider: &dyn LlmProvider,
    model: &str,
    task_text: &str,
    events: &[Event],
    final_state: &str,
    domain_name: &str,
) -> JudgeResult {
    let compact = compact_events(events);
    let user = format!(
        "TASK:\n{task_text}\n\nEVENT LOG (last {} events):\n{}\n\nFINAL STATE:\n{final_state}\n",
        compact.len(),
        serde_json::to_string_pretty(&Value::Array(compact)).unwrap_or_default(),
    );

    let request = LlmRequest {
        model: model.to_string(),
        max_tokens: 600,
        system: judge_system_prompt(domain_name),
        messages: vec![ChatMessage::user_text(user)],
        tools: Vec::new(),
    };
    let response = match provider.complete(&request).await {
        Ok(response) => response,
        Err(error) => return JudgeResult::failed(format!("judge_call_failed: {error}")),
    };
    let raw = response.text();

    let Some(object) = extract_json_object(&raw) else {
        return JudgeResult {
            raw_response: clip(&raw, 500),
            ..JudgeResult::failed("judge_response_unparseable")
        };
    };

    let passed = object.get("passed").and_then(Value::as_bool).unwrap_or(false);
    let score = object
        .get("score")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let reasons: Vec<String> = object
        .get("reasons")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|reason| !reason.is_empty())
                .map(|reason| clip(reason, MAX_REASON_CHARS))
                .take(MAX_REASONS)
                .collect()
        })
        .unwrap_or_default();

    debug!(passed, score, "judge verdict parsed");
    JudgeResult {
        passed,
        score,
        reasons,
        raw_response: clip(&raw, 500),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use serde_json::json;

    #[test]
    fn judge_model_is_one_tier_above_executor() {
        assert_eq!(default_judge_model("claude-haiku-4-5"), SONNET_MODEL);
        assert_eq!(default_judge_model("claude-sonnet-4-5"), OPUS_MODEL);
        assert_eq!(default_judge_model("claude-opus-4-6"), OPUS_MODEL);
    }

    #[tokio::test]
    async fn parses_strict_json_verdicts() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text(
            "{\"passed\": true, \"score\": 0.9, \"reasons\": [\"totals match expected rows\"]}",
        )]);
        let verdict = llm_judge(&provider, "judge-model", "task", &[], "state", "sqlite").await;
        assert!(verdict.passed);
        assert!((verdict.score - 0.9).abs() < f64::EPSILON);
        assert_eq!(verdict.reasons.len(), 1);
    }

    #[tokio::test]
    async fn unparseable_response_fails_closed() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text("no json here")]);
        let verdict = llm_judge(&provider, "judge-model", "task", &[], "state", "sqlite").await;
        assert!(!verdict.passed);
        assert_eq!(verdict.reasons, vec!["judge_response_unparseable".to_string()]);
    }

    #[test]
    fn compact_events_clips_and_tails() {
        let mut events = Vec::new();
        for step in 1..=40u64 {
            let mut event = Event::new(step, "run_sqlite", json!({"sql": "x".repeat(400)}));
            event.output = Value::String("y".repeat(700));
            events.push(event);
        }
        let compact = compact_events(&events);
        assert_eq!(compact.len(), 30);
        assert_eq!(compact[0]["step"], 11);
        let sql = compact[0]["tool_input"]["sql"].as_str().unwrap();
        assert!(sql.len() <= 310);
        assert!(compact[0]["output"].as_str().unwrap().len() <= 510);
    }
}
