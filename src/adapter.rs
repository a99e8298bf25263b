//! LM adapter trait plus the concrete adapters: an OpenAI-compatible
//! client and an Anthropic-compatible client, both `async` end to end, and
//! a fixed-response test double used throughout the test suite.

use anthropic_sdk::{Anthropic, ContentBlock, MessageCreateBuilder};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client as OpenAIClient,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{Result, RlmError};
use crate::types::{Backend, Message, Role, RlmConfig, Usage};

/// Text plus any usage the provider reported for one LM call.
#[derive(Debug, Clone, Default)]
pub struct LmResponse {
    pub text: String,
    pub usage: Option<Usage>,
}

/// The uniform interface the router and driver call against, regardless of
/// provider. `model_name` is what the router registers the sub-model under
/// and what usage is tracked against.
#[async_trait]
pub trait LmAdapter: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, messages: &[Message]) -> Result<LmResponse>;
}

/// OpenAI-compatible adapter.
pub struct OpenAiAdapter {
    client: OpenAIClient<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl OpenAiAdapter {
    pub fn new(model: impl Into<String>, api_key: Option<&str>, base_url: Option<&str>) -> Result<Self> {
        let mut cfg = OpenAIConfig::new();
        let key = api_key
            .map(str::to_string)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or(RlmError::MissingApiKey)?;
        cfg = cfg.with_api_key(key);
        if let Some(base) = base_url {
            cfg = cfg.with_api_base(base);
        }
        Ok(Self {
            client: OpenAIClient::with_config(cfg),
            model: model.into(),
            temperature: 0.0,
            max_tokens: None,
        })
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }
}

#[async_trait]
impl LmAdapter for OpenAiAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[Message]) -> Result<LmResponse> {
        let request_messages: Vec<ChatCompletionRequestMessage> = messages
            .iter()
            .map(|m| match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
            })
            .collect();

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(request_messages)
            .temperature(self.temperature);
        if let Some(max_tokens) = self.max_tokens {
            builder.max_tokens(max_tokens);
        }
        let request = builder.build().map_err(RlmError::OpenAi)?;

        let response = self.client.chat().create(request).await.map_err(RlmError::OpenAi)?;

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        let usage = response
            .usage
            .map(|u| Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64));

        Ok(LmResponse { text, usage })
    }
}

/// Anthropic-compatible adapter.
pub struct AnthropicAdapter {
    client: Anthropic,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl AnthropicAdapter {
    pub fn new(model: impl Into<String>, api_key: Option<&str>) -> Result<Self> {
        let client = if let Some(key) = api_key {
            Anthropic::new(key).map_err(|e| RlmError::Configuration(e.to_string()))?
        } else {
            Anthropic::from_env().map_err(|e| RlmError::Configuration(e.to_string()))?
        };
        Ok(Self {
            client,
            model: model.into(),
            temperature: 0.0,
            max_tokens: 4096,
        })
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }
}

#[async_trait]
impl LmAdapter for AnthropicAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[Message]) -> Result<LmResponse> {
        let system_content = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());

        let mut builder = MessageCreateBuilder::new(&self.model, self.max_tokens);
        if let Some(system) = system_content {
            builder = builder.system(system);
        }
        if self.temperature > 0.0 {
            builder = builder.temperature(self.temperature);
        }
        for msg in messages.iter().filter(|m| m.role != Role::System) {
            builder = match msg.role {
                Role::User => builder.user(msg.content.clone()),
                Role::Assistant => builder.assistant(msg.content.clone()),
                Role::System => builder,
            };
        }

        let response = self
            .client
            .messages()
            .create(builder.build())
            .await
            .map_err(|e| RlmError::LmTransport(e.to_string()))?;

        let text = response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let usage = Some(Usage::new(
            response.usage.input_tokens as u64,
            response.usage.output_tokens as u64,
        ));

        Ok(LmResponse { text, usage })
    }
}

/// Construct the adapter matching `backend`, resolving API keys from the
/// explicit argument or the provider's environment variable.
pub fn build_adapter(
    backend: &Backend,
    model: &str,
    api_key: Option<&str>,
    base_url: Option<&str>,
) -> Result<Box<dyn LmAdapter>> {
    match backend {
        Backend::OpenAI => Ok(Box::new(OpenAiAdapter::new(model, api_key, base_url)?)),
        Backend::Anthropic => Ok(Box::new(AnthropicAdapter::new(model, api_key)?)),
    }
}

impl RlmConfig {
    /// Build the adapter this config describes. `temperature`/`max_tokens`
    /// are per-call knobs the concrete adapters don't yet expose through
    /// this path; callers needing them construct the adapter directly and
    /// call `with_temperature`/`with_max_tokens` themselves.
    pub fn build_adapter(&self) -> Result<Box<dyn LmAdapter>> {
        build_adapter(
            &self.backend,
            &self.model,
            self.api_key.as_deref(),
            self.base_url.as_deref(),
        )
    }
}

/// A test double returning a fixed queue of canned responses in order,
/// regardless of the messages it's called with: no network, no mocking
/// framework, just a hand-rolled trait implementation.
pub struct FixedAdapter {
    model: String,
    responses: Mutex<VecDeque<LmResponse>>,
}

impl FixedAdapter {
    pub fn new(model: impl Into<String>, responses: Vec<&str>) -> Self {
        Self {
            model: model.into(),
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|text| LmResponse {
                        text: text.to_string(),
                        usage: Some(Usage::new(10, 10)),
                    })
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl LmAdapter for FixedAdapter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, _messages: &[Message]) -> Result<LmResponse> {
        let mut queue = self.responses.lock().unwrap();
        Ok(queue.pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Stubs the OpenAI chat-completions endpoint and checks the adapter
    /// extracts text and usage from a well-formed response without ever
    /// reaching a real provider.
    #[tokio::test]
    async fn openai_adapter_parses_stubbed_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-test",
                "object": "chat.completion",
                "created": 0,
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "hello from the stub"},
                    "finish_reason": "stop",
                }],
                "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10},
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::new("gpt-4o", Some("sk-test"), Some(&server.uri())).unwrap();
        let response = adapter
            .generate(&[Message::user("hi")])
            .await
            .unwrap();

        assert_eq!(response.text, "hello from the stub");
        assert_eq!(response.usage, Some(Usage::new(7, 3)));
    }

    #[tokio::test]
    async fn fixed_adapter_replays_responses_in_order() {
        let adapter = FixedAdapter::new("test-model", vec!["first", "second"]);
        let first = adapter.generate(&[]).await.unwrap();
        let second = adapter.generate(&[]).await.unwrap();
        assert_eq!(first.text, "first");
        assert_eq!(second.text, "second");
    }

    #[tokio::test]
    async fn fixed_adapter_returns_default_once_exhausted() {
        let adapter = FixedAdapter::new("test-model", vec!["only"]);
        let _ = adapter.generate(&[]).await.unwrap();
        let exhausted = adapter.generate(&[]).await.unwrap();
        assert_eq!(exhausted.text, "");
    }
}
