//! RLM Server - OpenAI-compatible API for RLM

mod handlers;
mod types;

use axum::{routing::{get, post}, Router};
use clap::Parser;
use rlm::Backend;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use handlers::{create_chat_completion, list_models, AppState};

/// RLM Server - OpenAI-compatible API for Recursive Language Models
#[derive(Parser, Debug)]
#[command(name = "rlm-server")]
#[command(about = "Run RLM as an OpenAI-compatible API server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Root model to use for completions
    #[arg(short, long, default_value = "gpt-4o")]
    model: String,

    /// Provider backend: "openai" or "anthropic"
    #[arg(long, default_value = "openai")]
    backend: String,

    /// Backend LLM URL (e.g., http://localhost:11434/v1 for Ollama)
    #[arg(short = 'u', long, default_value = "https://api.openai.com/v1")]
    backend_url: String,

    /// Backend API key (falls back to OPENAI_API_KEY/ANTHROPIC_API_KEY)
    #[arg(short = 'k', long)]
    backend_key: Option<String>,

    /// Sandbox backend driving the REPL: "local" or "container"
    #[arg(long, default_value = "local")]
    sandbox_backend: String,

    /// Max iterations per completion before the epilogue turn
    #[arg(long, default_value_t = 30)]
    max_iterations: u32,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let backend = match args.backend.as_str() {
        "anthropic" => Backend::Anthropic,
        _ => Backend::OpenAI,
    };

    // Resolve API key from args or the provider's environment variable
    let backend_key = args.backend_key.or_else(|| match backend {
        Backend::OpenAI => std::env::var("OPENAI_API_KEY").ok(),
        Backend::Anthropic => std::env::var("ANTHROPIC_API_KEY").ok(),
    });

    let state = Arc::new(AppState {
        model: args.model.clone(),
        backend,
        backend_url: args.backend_url.clone(),
        backend_key,
        sandbox_backend: args.sandbox_backend.clone(),
        max_iterations: args.max_iterations,
    });

    // CORS configuration for browser clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/v1/chat/completions", post(create_chat_completion))
        .route("/v1/models", get(list_models))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!("RLM Server starting on {}", addr);
    tracing::info!("Model: {}", args.model);
    tracing::info!("Backend URL: {}", args.backend_url);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
