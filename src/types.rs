use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// LLM Backend provider for the ambient adapters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Backend {
    #[default]
    OpenAI,
    Anthropic,
}

/// Token usage for a single call or an accumulated total.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        }
    }

    /// Accumulate usage from another instance.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A (role, text) pair in the chat-turn history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// The caller-supplied context payload: plain text, an ordered sequence of
/// arbitrary values, or a keyed collection of arbitrary values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextPayload {
    Text(String),
    Sequence(Vec<serde_json::Value>),
    Keyed(HashMap<String, serde_json::Value>),
}

impl From<String> for ContextPayload {
    fn from(s: String) -> Self {
        ContextPayload::Text(s)
    }
}

impl From<&str> for ContextPayload {
    fn from(s: &str) -> Self {
        ContextPayload::Text(s.to_string())
    }
}

impl ContextPayload {
    /// Tag naming the payload's shape, inserted verbatim into the system prompt.
    pub fn shape_tag(&self) -> &'static str {
        match self {
            ContextPayload::Text(_) => "text",
            ContextPayload::Sequence(_) => "sequence",
            ContextPayload::Keyed(_) => "keyed",
        }
    }

    /// Total character length across the whole payload.
    pub fn total_len(&self) -> usize {
        match self {
            ContextPayload::Text(s) => s.chars().count(),
            ContextPayload::Sequence(items) => items.iter().map(value_char_len).sum(),
            ContextPayload::Keyed(map) => map.values().map(value_char_len).sum(),
        }
    }

    /// Per-chunk character lengths: one entry for text, one per sequence
    /// element, one per keyed value (insertion order is not guaranteed for
    /// `Keyed`, matching its unordered backing map).
    pub fn chunk_lens(&self) -> Vec<usize> {
        match self {
            ContextPayload::Text(s) => vec![s.chars().count()],
            ContextPayload::Sequence(items) => items.iter().map(value_char_len).collect(),
            ContextPayload::Keyed(map) => map.values().map(value_char_len).collect(),
        }
    }

    /// Serialize the payload the way the local sandbox backend writes it to
    /// its context side-file: text payloads stay text, structured payloads
    /// become JSON.
    pub fn to_repl_literal(&self) -> String {
        match self {
            ContextPayload::Text(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

fn value_char_len(v: &serde_json::Value) -> usize {
    match v {
        serde_json::Value::String(s) => s.chars().count(),
        other => serde_json::to_string(other).map(|s| s.chars().count()).unwrap_or(0),
    }
}

/// Read-only metadata derived from a [`ContextPayload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub shape: String,
    pub total_len: usize,
    pub chunk_lens: Vec<usize>,
}

impl From<&ContextPayload> for QueryMetadata {
    fn from(payload: &ContextPayload) -> Self {
        Self {
            shape: payload.shape_tag().to_string(),
            total_len: payload.total_len(),
            chunk_lens: payload.chunk_lens(),
        }
    }
}

/// A REPL-state value: structured data stored as its text serialization
/// where possible, and as a printable string fallback otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ReplValue {
    Json(serde_json::Value),
    Text(String),
}

impl ReplValue {
    /// True for values the result-formatting rule keeps in the rendered
    /// locals listing: strings, numbers, booleans, and structured
    /// collections (arrays/objects). A bare printable-string fallback that
    /// isn't valid JSON fails this check.
    pub fn is_listable(&self) -> bool {
        matches!(self, ReplValue::Json(v) if !v.is_null())
    }

    /// The short type name reported by `SHOW_VARS()`.
    pub fn type_name(&self) -> &'static str {
        match self {
            ReplValue::Json(serde_json::Value::Null) => "NoneType",
            ReplValue::Json(serde_json::Value::Bool(_)) => "bool",
            ReplValue::Json(serde_json::Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    "int"
                } else {
                    "float"
                }
            }
            ReplValue::Json(serde_json::Value::String(_)) => "str",
            ReplValue::Json(serde_json::Value::Array(_)) => "list",
            ReplValue::Json(serde_json::Value::Object(_)) => "dict",
            ReplValue::Text(_) => "object",
        }
    }

    /// The text form returned by `FINAL_VAR`: strings unwrap, everything
    /// else renders as its serialized/printable form.
    pub fn as_text(&self) -> String {
        match self {
            ReplValue::Json(serde_json::Value::String(s)) => s.clone(),
            ReplValue::Json(v) => v.to_string(),
            ReplValue::Text(s) => s.clone(),
        }
    }
}

/// A single sub-LM call made from inside the sandbox during one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubLmCall {
    pub model: String,
    pub prompt: String,
    pub response: String,
    pub usage: Usage,
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
}

/// Result of a single `execute_code` invocation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplResult {
    pub stdout: String,
    pub stderr: String,
    /// Post-execution snapshot of non-reserved identifiers.
    pub locals: HashMap<String, ReplValue>,
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
    pub rlm_calls: Vec<SubLmCall>,
}

/// The source code string paired with its [`ReplResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBlock {
    pub code: String,
    pub result: ReplResult,
}

/// One LM response plus its executed code blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub history: Vec<Message>,
    pub response: String,
    pub code_blocks: Vec<CodeBlock>,
    /// Non-empty exactly when this turn terminated the loop.
    pub final_answer: Option<String>,
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
}

/// Per-model (call count, total input tokens, total output tokens), monotone
/// per router instance.
pub type UsageSummary = HashMap<String, (u64, u64, u64)>;

/// Emitted once per completion before iteration records begin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub root_model: String,
    pub max_depth: u32,
    pub max_iterations: u32,
    pub sandbox_backend: String,
    pub sandbox_config: HashMap<String, serde_json::Value>,
    pub sub_models: Option<Vec<String>>,
}

/// Return value of `Driver::completion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub root_model: String,
    pub prompt: ContextPayload,
    pub response: String,
    pub usage_summary: UsageSummary,
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
}

/// Configuration for a single LM call/adapter selection, mirroring the
/// teacher's `RlmConfig` builder.
#[derive(Debug, Clone)]
pub struct RlmConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub backend: Backend,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.0,
            max_tokens: None,
            backend: Backend::default(),
            base_url: None,
            api_key: None,
        }
    }
}

impl RlmConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_is_one_chunk() {
        let p = ContextPayload::Text("hello".into());
        assert_eq!(p.shape_tag(), "text");
        assert_eq!(p.total_len(), 5);
        assert_eq!(p.chunk_lens(), vec![5]);
    }

    #[test]
    fn sequence_payload_lengths_per_element() {
        let p = ContextPayload::Sequence(vec![
            serde_json::json!("ab"),
            serde_json::json!("cde"),
        ]);
        assert_eq!(p.shape_tag(), "sequence");
        assert_eq!(p.chunk_lens(), vec![2, 3]);
        assert_eq!(p.total_len(), 5);
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage::new(10, 20));
        total.add(&Usage::new(5, 5));
        assert_eq!(total, Usage::new(15, 25));
    }
}
