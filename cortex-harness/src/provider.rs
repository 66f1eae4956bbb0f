//! LLM provider contract and the Anthropic messages client.
//!
//! The harness depends only on this surface: a request with messages, tools,
//! and a system prompt; a response with content blocks and token-usage
//! counters. Anything provider-specific (retry policy, beta headers) stays
//! behind [`LlmProvider`], so tests substitute a scripted fake.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default messages endpoint.
pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROMPT_CACHING_BETA: &str = "prompt-caching-2024-07-31";
const MAX_ATTEMPTS: u32 = 3;

/// Declarative tool definition handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One content block inside a chat message.
///
/// Tool results are standardized on the list-of-text-blocks shape; the
/// provider layer owns any translation a wire format requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        is_error: bool,
        content: Vec<ContentBlock>,
    },
}

impl ContentBlock {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    #[must_use]
    pub fn tool_result(tool_use_id: impl Into<String>, is_error: bool, body: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            is_error,
            content: vec![ContentBlock::text(body)],
        }
    }
}

/// A chat message with a role and content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".into(),
            content: vec![ContentBlock::text(text)],
        }
    }

    #[must_use]
    pub fn user_blocks(content: Vec<ContentBlock>) -> Self {
        ChatMessage {
            role: "user".into(),
            content,
        }
    }

    #[must_use]
    pub fn assistant_blocks(content: Vec<ContentBlock>) -> Self {
        ChatMessage {
            role: "assistant".into(),
            content,
        }
    }
}

/// Integer token counters from one call. Unknown counters default to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn absorb(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}

/// One completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

/// One completion response.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

impl LlmResponse {
    /// Concatenate every text block.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    /// Iterate over tool-use blocks as `(id, name, input)`.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }
}

/// The request/response seam the whole harness depends on.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;
}

/// Anthropic messages client with bounded retry and optional prompt caching.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    enable_prompt_caching: bool,
}

impl AnthropicProvider {
    #[must_use]
    pub fn new(api_key: impl Into<String>, enable_prompt_caching: bool) -> Self {
        AnthropicProvider {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            api_url: ANTHROPIC_API_URL.to_string(),
            enable_prompt_caching,
        }
    }

    /// Point the client at a different endpoint (tests use a local server).
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn request_body(request: &LlmRequest) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), Value::String(request.model.clone()));
        body.insert("max_tokens".into(), Value::from(request.max_tokens));
        if !request.system.is_empty() {
            body.insert("system".into(), Value::String(request.system.clone()));
        }
        body.insert(
            "messages".into(),
            serde_json::to_value(&request.messages).unwrap_or(Value::Array(Vec::new())),
        );
        if !request.tools.is_empty() {
            body.insert(
                "tools".into(),
                serde_json::to_value(&request.tools).unwrap_or(Value::Array(Vec::new())),
            );
        }
        Value::Object(body)
    }

    fn parse_response(payload: &Value) -> Result<LlmResponse> {
        let content_raw = payload
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Provider("response missing content array".into()))?;
        let mut content = Vec::new();
        for block in content_raw {
            // Unknown block kinds are skipped rather than failing the call.
            match serde_json::from_value::<ContentBlock>(block.clone()) {
                Ok(parsed) => content.push(parsed),
                Err(error) => debug!(%error, "skipping unrecognized content block"),
            }
        }
        let usage = payload
            .get("usage")
            .cloned()
            .map(serde_json::from_value::<Usage>)
            .transpose()
            .unwrap_or_default()
            .unwrap_or_default();
        Ok(LlmResponse { content, usage })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = Self::request_body(request);
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            let mut http = self
                .client
                .post(&self.api_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body);
            if self.enable_prompt_caching {
                http = http.header("anthropic-beta", PROMPT_CACHING_BETA);
            }

            match http.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let payload: Value = response
                            .json()
                            .await
                            .map_err(|error| Error::Provider(format!("invalid response body: {error}")))?;
                        return Self::parse_response(&payload);
                    }
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    let body_text = response.text().await.unwrap_or_default();
                    last_error = format!("http {status}: {}", truncate(&body_text, 300));
                    if !retryable {
                        return Err(Error::Provider(last_error));
                    }
                }
                Err(error) => {
                    last_error = format!("transport error: {error}");
                }
            }

            if attempt < MAX_ATTEMPTS {
                let backoff = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                warn!(attempt, %last_error, "LLM call failed, backing off");
                tokio::time::sleep(backoff).await;
            }
        }
        Err(Error::Provider(format!(
            "exhausted {MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{clipped}...")
}

/// Extract the first JSON object embedded in free text.
#[must_use]
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let parsed: Value = serde_json::from_str(&text[start..=end]).ok()?;
    parsed.is_object().then_some(parsed)
}

/// Extract the first JSON array embedded in free text.
#[must_use]
pub fn extract_json_array(raw: &str) -> Vec<Value> {
    let text = raw.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let Some(start) = text.find('[') else {
        return Vec::new();
    };
    let Some(end) = text.rfind(']') else {
        return Vec::new();
    };
    if end <= start {
        return Vec::new();
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .and_then(|value| value.as_array().cloned())
        .unwrap_or_default()
}

/// A scripted provider for tests: returns canned responses in order, then
/// plain "done" text forever.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    responses: std::sync::Mutex<std::collections::VecDeque<LlmResponse>>,
}

impl ScriptedProvider {
    #[must_use]
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        ScriptedProvider {
            responses: std::sync::Mutex::new(responses.into()),
        }
    }

    /// Convenience: a response with a single tool-use block.
    #[must_use]
    pub fn tool_use(id: &str, name: &str, input: Value) -> LlmResponse {
        LlmResponse {
            content: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            usage: Usage::default(),
        }
    }

    /// Convenience: a plain text response.
    #[must_use]
    pub fn text(text: &str) -> LlmResponse {
        LlmResponse {
            content: vec![ContentBlock::text(text)],
            usage: Usage::default(),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse> {
        let mut responses = self
            .responses
            .lock()
            .map_err(|_| Error::Provider("scripted provider poisoned".into()))?;
        Ok(responses
            .pop_front()
            .unwrap_or_else(|| ScriptedProvider::text("done")))
    }
}
