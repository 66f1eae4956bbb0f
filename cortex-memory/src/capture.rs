//! Error capture: normalization, fingerprints, and tag extraction.
//!
//! Every tool failure, invariant regression, or efficiency signal is folded
//! into an [`ErrorEvent`] whose fingerprint identifies the semantic
//! equivalence class of the failure. Two failures that differ only by
//! run-local noise (ids, paths, counters, quoted literals) must share a
//! fingerprint; materially different failures must not.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Closed set of channels an error event can arrive on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorChannel {
    /// A tool call failed outright.
    HardFailure,
    /// A task invariant or constraint regressed.
    ConstraintFailure,
    /// A positive progress signal worth remembering.
    ProgressSignal,
    /// An efficiency metric worsened (steps, latency, budget).
    EfficiencySignal,
}

impl ErrorChannel {
    /// All channels, in declaration order.
    pub const ALL: [ErrorChannel; 4] = [
        ErrorChannel::HardFailure,
        ErrorChannel::ConstraintFailure,
        ErrorChannel::ProgressSignal,
        ErrorChannel::EfficiencySignal,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorChannel::HardFailure => "hard_failure",
            ErrorChannel::ConstraintFailure => "constraint_failure",
            ErrorChannel::ProgressSignal => "progress_signal",
            ErrorChannel::EfficiencySignal => "efficiency_signal",
        }
    }
}

impl fmt::Display for ErrorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "hard_failure" => Ok(ErrorChannel::HardFailure),
            "constraint_failure" => Ok(ErrorChannel::ConstraintFailure),
            "progress_signal" => Ok(ErrorChannel::ProgressSignal),
            "efficiency_signal" => Ok(ErrorChannel::EfficiencySignal),
            other => Err(Error::UnknownChannel(other.to_string())),
        }
    }
}

// These placeholders intentionally collapse volatile values (ids, counters,
// paths) into stable markers so equivalent failures map to one fingerprint.
static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}\b",
    )
    .unwrap()
});
static HEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)\b0x[0-9a-f]+\b").unwrap()
});
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap()
});
static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)(?:[a-zA-Z]:\\\S+|(?:~|/)\S+)").unwrap()
});
static QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r#"'[^'\n]*'|"[^"\n]*""#).unwrap()
});
static NON_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"[^a-z0-9_<>\s]+").unwrap()
});
static WS_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\s+").unwrap()
});

const FINGERPRINT_STOPWORDS: [&str; 14] = [
    "a", "an", "and", "at", "by", "for", "from", "in", "into", "of", "on", "the", "to", "with",
];

/// Ordered `(tag, pattern)` table applied to the merged lowercased context.
///
/// The table is data: tests enumerate it, and adding a tag means adding a
/// row here, not branching in code.
static TAG_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    let table = vec![
        (
            "surface_cli",
            r"(?i)\b(?:cli|usage:|exit code|stderr|stdout|--?[a-z0-9][a-z0-9_-]*)\b",
        ),
        (
            "surface_http",
            r"(?i)\b(?:http\s*\d{3}|status\s*\d{3}|https?://|api|request)\b",
        ),
        (
            "surface_python",
            r"(?i)\b(?:traceback|exception|stack trace|python)\b",
        ),
        (
            "constraint",
            r"(?i)\b(?:constraint|violation|duplicate key|not null|foreign key|unique)\b",
        ),
        (
            "syntax_error",
            r"(?i)(?:\bsyntax error\b|\bparse error\b|\binvalid syntax\b|\bunexpected token\b|\busage:\b|\bunknown command\b)",
        ),
        (
            "timeout",
            r"(?i)\b(?:timeout|timed out|deadline exceeded|lock wait timeout)\b",
        ),
        (
            "permission",
            r"(?i)\b(?:permission denied|access denied|operation not permitted)\b",
        ),
        (
            "not_found",
            r"(?i)\b(?:not found|no such file|does not exist|missing)\b",
        ),
        (
            "auth",
            r"(?i)\b(?:unauthorized|forbidden|authentication|invalid token|expired token)\b",
        ),
        (
            "rate_limited",
            r"(?i)\b(?:rate limit|too many requests|quota exceeded|http 429|status 429)\b",
        ),
        (
            "network",
            r"(?i)\b(?:connection reset|connection refused|host unreachable|dns|socket)\b",
        ),
        (
            "resource",
            r"(?i)\b(?:out of memory|oom|resource exhausted|disk full|no space left)\b",
        ),
        (
            "retryable",
            r"(?i)\b(?:retry|try again|temporarily unavailable|deadlock)\b",
        ),
        (
            "progress",
            r"(?i)\b(?:passed|satisfied|completed|improved|resolved|success)\b",
        ),
        (
            "efficiency",
            r"(?i)\b(?:latency|slow|faster|optimized|token budget|step budget|cost)\b",
        ),
    ];
    table
        .into_iter()
        .map(|(tag, pattern)| (tag, Regex::new(pattern).unwrap()))
        .collect()
});

static NONZERO_EXIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\bexit code\s*[1-9][0-9]*\b").unwrap()
});
static SERVER_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\bhttp\s*5\d\d\b|\bstatus\s*5\d\d\b").unwrap()
});
static CLIENT_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\bhttp\s*4\d\d\b|\bstatus\s*4\d\d\b").unwrap()
});

/// Expose the primary tag table so tests can enumerate it.
#[must_use]
pub fn tag_table() -> &'static [(&'static str, Regex)] {
    TAG_PATTERNS.as_slice()
}

/// Convert any JSON structure to deterministic text suitable for
/// normalization. Objects serialize with sorted keys.
#[must_use]
pub fn coerce_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn strip_variable_literals(text: &str) -> String {
    let lowered = text.to_lowercase();
    let lowered = UUID_RE.replace_all(&lowered, "<uuid>");
    let lowered = HEX_RE.replace_all(&lowered, "<hex>");
    let lowered = QUOTED_RE.replace_all(&lowered, "<str>");
    let lowered = PATH_RE.replace_all(&lowered, "<path>");
    NUMBER_RE.replace_all(&lowered, "<num>").into_owned()
}

/// Normalize a component into stable tokens.
///
/// Collision-resistant enough for operational triage while still grouping
/// semantically equivalent failures that only differ by run-local data.
#[must_use]
pub fn normalize_component(value: &Value) -> String {
    let text = strip_variable_literals(&coerce_text(value));
    let text = NON_TOKEN_RE.replace_all(&text, " ");
    let text = WS_RE.replace_all(&text, " ");
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }

    // Deduplicate only adjacent repeated tokens to avoid turning a
    // signal-rich sequence into a bag-of-words while still suppressing
    // noisy repetition.
    let mut collapsed: Vec<&str> = Vec::new();
    for token in text.split(' ') {
        if token.is_empty() || FINGERPRINT_STOPWORDS.contains(&token) {
            continue;
        }
        if collapsed.last() != Some(&token) {
            collapsed.push(token);
        }
    }
    collapsed.join(" ")
}

/// Build a deterministic fingerprint from normalized error/state/action.
#[must_use]
pub fn fingerprint_of(error: &Value, state: &Value, action: &Value) -> String {
    // Prefix each section name so future schema expansion cannot accidentally
    // collide with old fingerprints that relied on positional concatenation.
    let blob = format!(
        "error={}|state={}|action={}",
        normalize_component(error),
        normalize_component(state),
        normalize_component(action),
    );
    let digest = Sha256::digest(blob.as_bytes());
    let hex = digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("ef_{}", &hex[..20])
}

/// Extract generic tags from mixed contexts.
///
/// Tags are intentionally broad: they support CLI traces today and stay
/// reusable for non-CLI transports (HTTP/API/services) without a second
/// schema.
#[must_use]
pub fn tags_of(error: &Value, state: &Value, action: &Value, extra: &Value) -> Vec<String> {
    let haystack = format!(
        "{} {} {} {}",
        coerce_text(error),
        coerce_text(state),
        coerce_text(action),
        coerce_text(extra),
    )
    .trim()
    .to_lowercase();

    let mut tags: BTreeSet<&'static str> = BTreeSet::new();
    for (tag, pattern) in TAG_PATTERNS.iter() {
        if pattern.is_match(&haystack) {
            tags.insert(tag);
        }
    }
    if haystack.contains("unknown command") || haystack.contains("command not found") {
        tags.insert("command_not_found");
    }
    if NONZERO_EXIT_RE.is_match(&haystack) {
        tags.insert("nonzero_exit");
    }
    if SERVER_ERROR_RE.is_match(&haystack) {
        tags.insert("server_error");
    }
    if CLIENT_ERROR_RE.is_match(&haystack) {
        tags.insert("client_error");
    }

    if tags.is_empty() {
        return vec!["uncategorized".to_string()];
    }
    tags.into_iter().map(str::to_string).collect()
}

/// One structured failure observation, ready for `memory_events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub channel: ErrorChannel,
    pub error: String,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub action: Value,
    pub tags: Vec<String>,
    pub fingerprint: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ErrorEvent {
    /// Construct an event, deriving tags and the fingerprint from the
    /// error/state/action context.
    #[must_use]
    pub fn new(
        channel: ErrorChannel,
        error: impl Into<String>,
        state: Value,
        action: Value,
    ) -> Self {
        let error = error.into();
        let error_value = Value::String(error.clone());
        let tags = tags_of(&error_value, &state, &action, &Value::Null);
        let fingerprint = fingerprint_of(&error_value, &state, &action);
        ErrorEvent {
            channel,
            error,
            state,
            action,
            tags,
            fingerprint,
            metadata: Map::new(),
        }
    }

    /// Override derived tags with a caller-provided set (sorted, deduped,
    /// lowercased). An empty set falls back to extraction.
    #[must_use]
    pub fn with_tags(mut self, tags: &[String]) -> Self {
        let normalized: BTreeSet<String> = tags
            .iter()
            .map(|tag| tag.trim().to_lowercase())
            .filter(|tag| !tag.is_empty())
            .collect();
        if !normalized.is_empty() {
            self.tags = normalized.into_iter().collect();
        }
        self
    }

    /// Override the derived fingerprint (used when the caller already
    /// computed one for the same context).
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        let fingerprint = fingerprint.into();
        if !fingerprint.trim().is_empty() {
            self.fingerprint = fingerprint.trim().to_string();
        }
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Row form with deterministically sorted keys.
    #[must_use]
    pub fn to_row(&self) -> Value {
        let mut row = Map::new();
        row.insert("channel".into(), Value::String(self.channel.to_string()));
        row.insert("error".into(), Value::String(self.error.clone()));
        row.insert("state".into(), self.state.clone());
        row.insert("action".into(), self.action.clone());
        row.insert(
            "tags".into(),
            Value::Array(self.tags.iter().cloned().map(Value::String).collect()),
        );
        row.insert("fingerprint".into(), Value::String(self.fingerprint.clone()));
        row.insert("metadata".into(), Value::Object(self.metadata.clone()));
        Value::Object(row)
    }

    /// Serialize as one stable JSON line (sorted keys).
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_row()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp(error: &str, state: &str, action: &str) -> String {
        fingerprint_of(&json!(error), &json!(state), &json!(action))
    }

    #[test]
    fn fingerprint_ignores_volatile_noise() {
        let a = fp(
            "UNIQUE constraint failed: ledger.event_id='evt-1001' at /tmp/run-123/task.db line 77",
            "",
            "INSERT INTO ledger",
        );
        let b = fp(
            "UNIQUE constraint failed: ledger.event_id='evt-9009' at /tmp/run-999/task.db line 2",
            "",
            "INSERT INTO ledger",
        );
        assert_eq!(a, b);
        assert!(a.starts_with("ef_"));
        assert_eq!(a.len(), 23);
    }

    #[test]
    fn fingerprint_distinguishes_semantic_classes() {
        let constraint = fp("UNIQUE constraint failed: ledger.event_id", "", "");
        let timeout = fp("Request timed out after 30 seconds contacting host", "", "");
        assert_ne!(constraint, timeout);
    }

    #[test]
    fn fingerprint_collapses_uuid_hex_and_numbers() {
        let a = fp(
            "job 550e8400-e29b-41d4-a716-446655440000 crashed at 0xdeadbeef step 14",
            "",
            "",
        );
        let b = fp(
            "job 123e4567-e89b-12d3-a456-426614174000 crashed at 0xcafe step 9",
            "",
            "",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn normalize_component_drops_stopwords_and_adjacent_dupes() {
        let normalized = normalize_component(&json!("the error error at the table"));
        assert_eq!(normalized, "error table");
    }

    #[test]
    fn tags_cover_cli_syntax_failures() {
        let tags = tags_of(
            &json!("gridtool: unknown command 'talley'. Usage: gridtool commands on stdin. Exit code 127"),
            &json!(""),
            &json!("run_gridtool --input fixture.csv"),
            &json!(""),
        );
        for expected in ["surface_cli", "syntax_error", "command_not_found", "nonzero_exit"] {
            assert!(tags.contains(&expected.to_string()), "missing {expected}: {tags:?}");
        }
    }

    #[test]
    fn tags_cover_http_rate_limiting() {
        let tags = tags_of(
            &json!("HTTP 429 Too Many Requests from api endpoint. Retry after 20 seconds"),
            &json!("connection reset while waiting; timed out"),
            &json!(""),
            &json!(""),
        );
        for expected in ["surface_http", "rate_limited", "timeout", "network", "retryable"] {
            assert!(tags.contains(&expected.to_string()), "missing {expected}: {tags:?}");
        }
        assert!(tags.contains(&"client_error".to_string()));
    }

    #[test]
    fn tags_fall_back_to_uncategorized() {
        let tags = tags_of(&json!("zzz"), &json!(""), &json!(""), &json!(""));
        assert_eq!(tags, vec!["uncategorized".to_string()]);
    }

    #[test]
    fn tag_table_is_enumerable_and_ordered() {
        let names: Vec<&str> = tag_table().iter().map(|(tag, _)| *tag).collect();
        assert_eq!(names.first(), Some(&"surface_cli"));
        assert!(names.contains(&"rate_limited"));
        assert_eq!(names.len(), 15);
    }

    #[test]
    fn event_serializes_with_sorted_keys() {
        let event = ErrorEvent::new(
            ErrorChannel::HardFailure,
            "boom",
            json!({"db": "task.db"}),
            json!("INSERT"),
        );
        let line = event.to_json();
        let action_pos = line.find("\"action\"").unwrap();
        let channel_pos = line.find("\"channel\"").unwrap();
        let tags_pos = line.find("\"tags\"").unwrap();
        assert!(action_pos < channel_pos && channel_pos < tags_pos);
        assert!(line.contains("\"fingerprint\":\"ef_"));
    }

    #[test]
    fn caller_tags_are_normalized() {
        let event = ErrorEvent::new(ErrorChannel::ProgressSignal, "ok", json!(""), json!(""))
            .with_tags(&["  Zeta ".into(), "alpha".into(), "alpha".into()]);
        assert_eq!(event.tags, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn channel_parse_rejects_unknown() {
        assert!("hard_failure".parse::<ErrorChannel>().is_ok());
        assert!("soft_failure".parse::<ErrorChannel>().is_err());
    }
}
