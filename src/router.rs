//! LM router: a loopback HTTP server owned by the driver for the duration
//! of one completion, exposing the sandbox's two hook paths and tracking
//! per-model usage. Axum wiring generalized from an outward-facing
//! OpenAI-compatible API into the inward-facing loopback hook protocol.

use axum::extract::{FromRequest, Request, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Json;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use crate::adapter::{LmAdapter, LmResponse};
use crate::error::Result;
use crate::types::{Message, Role, SubLmCall, Usage};

/// Monotone per-model (calls, input tokens, output tokens).
#[derive(Debug, Clone, Default)]
struct UsageTracker {
    by_model: HashMap<String, (u64, u64, u64)>,
    last: Option<(u64, u64, u64)>,
}

impl UsageTracker {
    fn record(&mut self, model: &str, usage: &Usage) {
        let entry = self.by_model.entry(model.to_string()).or_insert((0, 0, 0));
        entry.0 += 1;
        entry.1 += usage.input_tokens;
        entry.2 += usage.output_tokens;
        self.last = Some((1, usage.input_tokens, usage.output_tokens));
    }

    fn snapshot(&self) -> crate::types::UsageSummary {
        self.by_model.clone()
    }
}

struct RouterState {
    root_model: Arc<dyn LmAdapter>,
    sub_model: Option<Arc<dyn LmAdapter>>,
    depth: u32,
    usage: Mutex<UsageTracker>,
}

impl RouterState {
    /// Select the adapter: explicit registered name first, then the
    /// sub-model at depth == 1, then the default (root) model.
    fn select(&self, model: Option<&str>) -> Arc<dyn LmAdapter> {
        if let Some(name) = model {
            if name == self.root_model.model_name() {
                return self.root_model.clone();
            }
            if let Some(sub) = &self.sub_model {
                if name == sub.model_name() {
                    return sub.clone();
                }
            }
        }
        if self.depth == 1 {
            if let Some(sub) = &self.sub_model {
                return sub.clone();
            }
        }
        self.root_model.clone()
    }
}

/// A loopback HTTP server owned by one [`crate::driver::Driver`] completion.
pub struct Router {
    addr: SocketAddr,
    state: Arc<RouterState>,
    handle: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    prompt: serde_json::Value,
    model: Option<String>,
    #[allow(dead_code)]
    depth: Option<u32>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    response: String,
    rlm_call: Option<SubLmCall>,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    prompts: Vec<serde_json::Value>,
    model: Option<String>,
    #[allow(dead_code)]
    depth: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchResponse {
    responses: Vec<String>,
    rlm_calls: Vec<SubLmCall>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// `Json` wrapper that reports malformed or mistyped request bodies the way
/// this router reports every other failure: HTTP 500 with `{"error": ...}`,
/// not axum's default 400/422 extractor-rejection body.
struct HookJson<T>(T);

#[async_trait::async_trait]
impl<S, T> FromRequest<S> for HookJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorBody>);

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(HookJson(value)),
            Err(rejection) => Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody { error: rejection.to_string() }),
            )),
        }
    }
}

/// `prompt` becomes one user message when a string, is passed through when
/// already a list of messages, and is JSON-stringified into one user
/// message otherwise.
fn prompt_to_messages(prompt: &serde_json::Value) -> Vec<Message> {
    match prompt {
        serde_json::Value::String(s) => vec![Message::user(s.clone())],
        serde_json::Value::Array(items) => {
            if let Ok(messages) = serde_json::from_value::<Vec<Message>>(prompt.clone()) {
                return messages;
            }
            items
                .iter()
                .map(|v| Message::user(v.to_string()))
                .collect()
        }
        other => vec![Message::user(other.to_string())],
    }
}

async fn handle_query(
    State(state): State<Arc<RouterState>>,
    HookJson(req): HookJson<QueryRequest>,
) -> impl IntoResponse {
    let adapter = state.select(req.model.as_deref());
    let messages = prompt_to_messages(&req.prompt);
    let start = Instant::now();

    match adapter.generate(&messages).await {
        Ok(resp) => {
            let usage = resp.usage.clone().unwrap_or_default();
            state.usage.lock().await.record(adapter.model_name(), &usage);
            let rlm_call = SubLmCall {
                model: adapter.model_name().to_string(),
                prompt: req.prompt.to_string(),
                response: resp.text.clone(),
                usage,
                execution_time: start.elapsed(),
            };
            (
                StatusCode::OK,
                Json(QueryResponse {
                    response: resp.text,
                    rlm_call: Some(rlm_call),
                }),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody { error: e.to_string() }),
        )
            .into_response(),
    }
}

async fn handle_query_batched(
    State(state): State<Arc<RouterState>>,
    HookJson(req): HookJson<BatchRequest>,
) -> impl IntoResponse {
    let adapter = state.select(req.model.as_deref());
    let start = Instant::now();
    let count = req.prompts.len().max(1);

    let calls = req.prompts.iter().map(|prompt| {
        let adapter = adapter.clone();
        let messages = prompt_to_messages(prompt);
        let prompt = prompt.clone();
        async move {
            let result = adapter.generate(&messages).await;
            (prompt, result)
        }
    });

    let results = join_all(calls).await;
    let elapsed_each = start.elapsed() / count as u32;

    let mut responses = Vec::with_capacity(results.len());
    let mut rlm_calls = Vec::with_capacity(results.len());
    for (prompt, result) in results {
        match result {
            Ok(resp) => {
                let usage = resp.usage.clone().unwrap_or_default();
                state.usage.lock().await.record(adapter.model_name(), &usage);
                responses.push(resp.text.clone());
                rlm_calls.push(SubLmCall {
                    model: adapter.model_name().to_string(),
                    prompt: prompt.to_string(),
                    response: resp.text,
                    usage,
                    execution_time: elapsed_each,
                });
            }
            Err(e) => {
                responses.push(format!("Error: {e}"));
            }
        }
    }

    (
        StatusCode::OK,
        Json(BatchResponse { responses, rlm_calls }),
    )
        .into_response()
}

async fn handle_unknown(uri: axum::http::Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("Unknown endpoint: {}", uri.path()),
        }),
    )
}

impl Router {
    /// Bind on `127.0.0.1` at an OS-assigned port and start serving.
    /// Returns the bound address, handed to the sandbox as the router
    /// address.
    pub async fn start(
        root_model: Arc<dyn LmAdapter>,
        sub_model: Option<Arc<dyn LmAdapter>>,
        depth: u32,
    ) -> std::io::Result<Self> {
        let state = Arc::new(RouterState {
            root_model,
            sub_model,
            depth,
            usage: Mutex::new(UsageTracker::default()),
        });

        let app = axum::Router::new()
            .route("/llm_query", post(handle_query))
            .route("/llm_query_batched", post(handle_query_batched))
            .fallback(handle_unknown)
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self { addr, state, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The driver's own turn-loop completion path: in-process, no HTTP
    /// round trip, but usage is still folded into this router's tracker
    /// exactly as a `/llm_query` hook call would be — the root model stays
    /// the root model regardless of transport.
    pub async fn generate_direct(&self, messages: &[Message]) -> Result<LmResponse> {
        let response = self.state.root_model.generate(messages).await?;
        if let Some(usage) = &response.usage {
            self.state
                .usage
                .lock()
                .await
                .record(self.state.root_model.model_name(), usage);
        }
        Ok(response)
    }

    /// Per-model `(calls, input_tokens, output_tokens)`, monotone for the
    /// lifetime of this router instance.
    pub async fn usage_summary(&self) -> crate::types::UsageSummary {
        self.state.usage.lock().await.snapshot()
    }

    /// The most recently tracked single usage triple, regardless of model.
    pub async fn last_usage(&self) -> Option<(u64, u64, u64)> {
        self.state.usage.lock().await.last
    }

    /// Closes the listener. Idempotent: aborting an already-finished task
    /// is a no-op.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::FixedAdapter;

    #[test]
    fn prompt_string_becomes_one_user_message() {
        let messages = prompt_to_messages(&serde_json::json!("hello"));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello");
    }

    #[test]
    fn prompt_object_is_json_stringified() {
        let messages = prompt_to_messages(&serde_json::json!({"a": 1}));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("\"a\""));
    }

    #[test]
    fn usage_tracker_accumulates_per_model() {
        let mut tracker = UsageTracker::default();
        tracker.record("gpt-4o", &Usage::new(10, 5));
        tracker.record("gpt-4o", &Usage::new(3, 2));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.get("gpt-4o"), Some(&(2, 13, 7)));
    }

    #[tokio::test]
    async fn router_selects_submodel_at_depth_one() {
        let root: Arc<dyn LmAdapter> = Arc::new(FixedAdapter::new("root", vec!["r"]));
        let sub: Arc<dyn LmAdapter> = Arc::new(FixedAdapter::new("sub", vec!["s"]));
        let router = Router::start(root, Some(sub), 1).await.unwrap();
        let adapter = router.state.select(None);
        assert_eq!(adapter.model_name(), "sub");
        router.stop();
    }

    #[tokio::test]
    async fn router_selects_root_when_not_depth_one() {
        let root: Arc<dyn LmAdapter> = Arc::new(FixedAdapter::new("root", vec!["r"]));
        let sub: Arc<dyn LmAdapter> = Arc::new(FixedAdapter::new("sub", vec!["s"]));
        let router = Router::start(root, Some(sub), 0).await.unwrap();
        let adapter = router.state.select(None);
        assert_eq!(adapter.model_name(), "root");
        router.stop();
    }

    /// An adapter that upper-cases its input and sleeps longer for earlier
    /// letters in the alphabet, so the slowest call is deliberately the one
    /// dispatched first — exercises that `/llm_query_batched` preserves
    /// input order even when completion order is reversed (S3 / property 6).
    struct ReorderingUppercaseAdapter {
        name: String,
    }

    #[async_trait::async_trait]
    impl LmAdapter for ReorderingUppercaseAdapter {
        fn model_name(&self) -> &str {
            &self.name
        }

        async fn generate(&self, messages: &[Message]) -> crate::error::Result<LmResponse> {
            let text = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            let delay_ms = text.bytes().next().map(|b| (b'z' - b).min(20) as u64 * 2).unwrap_or(0);
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            Ok(LmResponse {
                text: text.to_uppercase(),
                usage: Some(Usage::new(1, 1)),
            })
        }
    }

    #[tokio::test]
    async fn batched_dispatch_preserves_input_order_under_reversed_latency() {
        let adapter: Arc<dyn LmAdapter> = Arc::new(ReorderingUppercaseAdapter { name: "up".to_string() });
        let router = Router::start(adapter, None, 0).await.unwrap();

        let client = reqwest::Client::new();
        let url = format!("http://{}/llm_query_batched", router.addr());
        let body = serde_json::json!({"prompts": ["a", "b", "c"], "model": null, "depth": 0});
        let resp = client.post(&url).json(&body).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        let parsed: BatchResponse = resp.json().await.unwrap();
        assert_eq!(parsed.responses, vec!["A", "B", "C"]);
        assert_eq!(parsed.rlm_calls.len(), 3);

        let snapshot = router.usage_summary().await;
        assert_eq!(snapshot.get("up"), Some(&(3, 3, 3)));

        router.stop();
    }
}
