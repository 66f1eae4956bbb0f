//! Per-session artifacts: directories, event log, metrics sink.
//!
//! One directory per session id with a deterministic layout: `events.jsonl`
//! (append-only), `metrics.json` (overwritten at end),
//! `memory_events.jsonl` (append-only structured error events), and a
//! `work/` directory for the adapter's workspace. Reusing a session id
//! resets the directory before writing.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::retrieval::{Lane, RetrievalScore};

/// Resolved paths for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub session_dir: PathBuf,
    pub events_path: PathBuf,
    pub metrics_path: PathBuf,
    pub memory_events_path: PathBuf,
    pub work_dir: PathBuf,
}

/// Per-step memory annotation recorded on failed events with hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MemoryAnnotation {
    pub injected_lessons: Vec<InjectedLesson>,
    pub retrieval_scores: Vec<HintScore>,
}

/// Compact reference to a lesson whose text was injected into a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectedLesson {
    pub lesson_id: String,
    pub rule_text: String,
}

/// Score breakdown for one injected hint, lane-annotated for audits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HintScore {
    pub lesson_id: String,
    pub lane: String,
    pub score: Value,
}

impl HintScore {
    #[must_use]
    pub fn from_parts(lane: Lane, score: &RetrievalScore) -> Self {
        HintScore {
            lesson_id: score.lesson_id.clone(),
            lane: match lane {
                Lane::Strict => "strict".to_string(),
                Lane::Transfer => "transfer".to_string(),
            },
            score: serde_json::to_value(score).unwrap_or(Value::Null),
        }
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Wall-clock seconds; defaulted by [`write_event`] when zero.
    #[serde(default)]
    pub ts: f64,
    pub step: u64,
    pub tool: String,
    #[serde(default)]
    pub tool_input: Value,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_v2: Option<MemoryAnnotation>,
}

impl Event {
    #[must_use]
    pub fn new(step: u64, tool: impl Into<String>, tool_input: Value) -> Self {
        Event {
            ts: 0.0,
            step,
            tool: tool.into(),
            tool_input,
            ok: true,
            error: None,
            output: Value::String(String::new()),
            memory_v2: None,
        }
    }
}

fn wall_clock_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

/// Construct (and optionally reset) a session directory.
///
/// Session ids are expected to be reusable during rapid iteration; clearing
/// all previous artifacts avoids cross-run contamination.
pub fn ensure_session(session_id: u64, sessions_root: &Path, reset: bool) -> Result<SessionPaths> {
    let session_dir = sessions_root.join(format!("session-{session_id:03}"));
    std::fs::create_dir_all(&session_dir)?;

    if reset {
        for entry in std::fs::read_dir(&session_dir)? {
            let entry = entry?;
            let path = entry.path();
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(error) = removed {
                warn!(path = %path.display(), %error, "failed to reset session artifact");
            }
        }
    }

    let work_dir = session_dir.join("work");
    std::fs::create_dir_all(&work_dir)?;

    Ok(SessionPaths {
        events_path: session_dir.join("events.jsonl"),
        metrics_path: session_dir.join("metrics.json"),
        memory_events_path: session_dir.join("memory_events.jsonl"),
        work_dir,
        session_dir,
    })
}

/// Append one event line, defaulting `ts` to wall-clock seconds.
pub fn write_event(events_path: &Path, event: &Event) -> Result<()> {
    let mut row = event.clone();
    if row.ts == 0.0 {
        row.ts = wall_clock_seconds();
    }
    if let Some(parent) = events_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(events_path)?;
    let mut line = serde_json::to_string(&row)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Append one raw JSON line (used for structured memory events).
pub fn write_jsonl_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Read events back, skipping malformed lines.
#[must_use]
pub fn read_events(events_path: &Path) -> Vec<Event> {
    let Ok(content) = std::fs::read_to_string(events_path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let text = line.trim();
            if text.is_empty() {
                return None;
            }
            serde_json::from_str::<Event>(text).ok()
        })
        .collect()
}

/// Overwrite metrics as pretty-printed JSON with sorted keys.
pub fn write_metrics(metrics_path: &Path, metrics: &Value) -> Result<()> {
    if let Some(parent) = metrics_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Round-trip through a sorted map so key order is deterministic.
    let sorted = sort_value(metrics);
    std::fs::write(metrics_path, serde_json::to_string_pretty(&sorted)?)?;
    Ok(())
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            for (key, nested) in map {
                sorted.insert(key.clone(), sort_value(nested));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ensure_session_resets_existing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ensure_session(8, dir.path(), true).unwrap();
        std::fs::write(&paths.events_path, "old contents\n").unwrap();
        std::fs::write(paths.work_dir.join("task.db"), "stale").unwrap();

        let paths = ensure_session(8, dir.path(), true).unwrap();
        assert!(!paths.events_path.exists());
        assert!(paths.work_dir.exists());
        assert!(std::fs::read_dir(&paths.work_dir).unwrap().next().is_none());
        assert_eq!(paths.session_dir.file_name().unwrap(), "session-008");
    }

    #[test]
    fn write_event_defaults_ts_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.jsonl");
        let mut event = Event::new(1, "run_sqlite", json!({"sql": "SELECT 1;"}));
        event.ok = false;
        event.error = Some("boom".into());
        write_event(&events_path, &event).unwrap();
        write_event(&events_path, &Event::new(2, "run_sqlite", json!({"sql": "SELECT 2;"}))).unwrap();

        let rows = read_events(&events_path);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].ts > 0.0);
        assert_eq!(rows[0].step, 1);
        assert_eq!(rows[0].error.as_deref(), Some("boom"));
        assert_eq!(rows[1].step, 2);
    }

    #[test]
    fn read_events_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.jsonl");
        std::fs::write(
            &events_path,
            "{\"ts\":1.0,\"step\":1,\"tool\":\"run_bash\",\"tool_input\":{},\"ok\":true,\"error\":null,\"output\":\"\"}\ngarbage\n",
        )
        .unwrap();
        assert_eq!(read_events(&events_path).len(), 1);
    }

    #[test]
    fn memory_annotation_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.jsonl");
        let mut event = Event::new(3, "run_gridtool", json!({"commands": "TALLY"}));
        event.ok = false;
        event.memory_v2 = Some(MemoryAnnotation {
            injected_lessons: vec![InjectedLesson {
                lesson_id: "lsn_abc".into(),
                rule_text: "TALLY uses arrow syntax".into(),
            }],
            retrieval_scores: Vec::new(),
        });
        write_event(&events_path, &event).unwrap();
        let rows = read_events(&events_path);
        let annotation = rows[0].memory_v2.as_ref().unwrap();
        assert_eq!(annotation.injected_lessons[0].lesson_id, "lsn_abc");
    }

    #[test]
    fn metrics_are_pretty_and_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let metrics_path = dir.path().join("metrics.json");
        write_metrics(&metrics_path, &json!({"b": 1, "a": 2})).unwrap();
        write_metrics(&metrics_path, &json!({"only": true})).unwrap();
        let text = std::fs::read_to_string(&metrics_path).unwrap();
        assert!(text.contains('\n'));
        assert!(!text.contains("\"a\""));
    }
}
