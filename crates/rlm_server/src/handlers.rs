//! HTTP handlers for the RLM server: an OpenAI-compatible `/v1/chat/completions`
//! front door that drives one [`rlm::Driver::completion`] per request.

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;

use crate::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, CompletionUsage,
};
use rlm::{Backend, ContextPayload, Driver, DriverConfig, LmAdapter, RlmConfig};

/// Shared server state: everything needed to build a fresh [`Driver`] per request.
pub struct AppState {
    pub model: String,
    pub backend: Backend,
    pub backend_url: String,
    pub backend_key: Option<String>,
    pub sandbox_backend: String,
    pub max_iterations: u32,
}

fn build_adapter(state: &AppState) -> rlm::Result<Arc<dyn LmAdapter>> {
    let mut config = RlmConfig::new(state.model.clone()).with_backend(state.backend.clone());
    if let Some(key) = &state.backend_key {
        config = config.with_api_key(key.clone());
    }
    if state.backend == Backend::OpenAI {
        config = config.with_base_url(state.backend_url.clone());
    }
    Ok(Arc::from(config.build_adapter()?))
}

/// The incoming chat transcript becomes the context payload (every turn but
/// the last) plus a root question (the last user turn's content) — the
/// split the driver's `completion(payload, root_question)` expects.
fn split_request(messages: &[crate::types::ChatMessage]) -> (ContextPayload, Option<String>) {
    let mut root_question = None;
    let mut context_lines = Vec::new();
    for (i, m) in messages.iter().enumerate() {
        if i == messages.len() - 1 && m.role == "user" {
            root_question = Some(m.content.clone());
        } else {
            context_lines.push(format!("{}: {}", m.role, m.content));
        }
    }
    (ContextPayload::Text(context_lines.join("\n")), root_question)
}

fn aggregate_usage(summary: &rlm::UsageSummary) -> CompletionUsage {
    let (mut input, mut output) = (0u64, 0u64);
    for (_, inp, out) in summary.values() {
        input += inp;
        output += out;
    }
    CompletionUsage {
        prompt_tokens: input,
        completion_tokens: output,
        total_tokens: input + output,
    }
}

async fn run_driver(
    state: &AppState,
    req: &ChatCompletionRequest,
) -> rlm::Result<rlm::CompletionRecord> {
    let adapter = build_adapter(state)?;
    let config = DriverConfig::new(adapter, state.sandbox_backend.clone())
        .with_max_iterations(state.max_iterations);
    let mut driver = Driver::new(config)?;
    let (payload, root_question) = split_request(&req.messages);
    driver.completion(payload, root_question.as_deref()).await
}

/// Handler for POST /v1/chat/completions
pub async fn create_chat_completion(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    let stream = req.stream.unwrap_or(false);

    if stream {
        handle_streaming_completion(state, req).await
    } else {
        handle_completion(state, req).await
    }
}

fn error_body(e: impl std::fmt::Display) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "error": {
            "message": format!("RLM error: {}", e),
            "type": "server_error"
        }
    }))
}

/// Handle non-streaming completion
async fn handle_completion(state: Arc<AppState>, req: ChatCompletionRequest) -> Response {
    let request_id = format!("chatcmpl-{}", Uuid::new_v4());

    match run_driver(&state, &req).await {
        Ok(completion) => {
            let usage = aggregate_usage(&completion.usage_summary);
            let response = ChatCompletionResponse::new(
                request_id,
                state.model.clone(),
                completion.response,
                usage,
            );
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, error_body(e)).into_response(),
    }
}

/// Handle streaming completion: the driver itself produces one answer, not
/// incremental tokens, so the SSE stream replays it word-by-word after the
/// full completion finishes.
async fn handle_streaming_completion(state: Arc<AppState>, req: ChatCompletionRequest) -> Response {
    let request_id = format!("chatcmpl-{}", Uuid::new_v4());
    let model = state.model.clone();

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(100);

    tokio::spawn(async move {
        let role_chunk = ChatCompletionChunk::with_role(request_id.clone(), model.clone());
        let _ = tx
            .send(Ok(Event::default().data(serde_json::to_string(&role_chunk).unwrap())))
            .await;

        match run_driver(&state, &req).await {
            Ok(completion) => {
                for word in completion.response.split_inclusive(' ') {
                    let content_chunk =
                        ChatCompletionChunk::with_content(request_id.clone(), model.clone(), word.to_string());
                    if tx
                        .send(Ok(Event::default().data(serde_json::to_string(&content_chunk).unwrap())))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }

                let finish_chunk = ChatCompletionChunk::finished(request_id.clone(), model.clone());
                let _ = tx
                    .send(Ok(Event::default().data(serde_json::to_string(&finish_chunk).unwrap())))
                    .await;
                let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
            }
            Err(e) => {
                let error_chunk = ChatCompletionChunk::with_content(
                    request_id.clone(),
                    model.clone(),
                    format!("Error: {}", e),
                );
                let _ = tx
                    .send(Ok(Event::default().data(serde_json::to_string(&error_chunk).unwrap())))
                    .await;
                let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
            }
        }
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx);

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Handler for GET /v1/models
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "object": "list",
        "data": [
            {
                "id": "rlm",
                "object": "model",
                "created": 1700000000,
                "owned_by": "rlm"
            },
            {
                "id": state.model,
                "object": "model",
                "created": 1700000000,
                "owned_by": "rlm"
            }
        ]
    }))
}
