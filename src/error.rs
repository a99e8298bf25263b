use thiserror::Error;

/// RLM error types
#[derive(Error, Debug)]
pub enum RlmError {
    #[error("OpenAI API error: {0}")]
    OpenAi(#[from] async_openai::error::OpenAIError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Python execution error: {0}")]
    Python(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Container backend error: {0}")]
    Container(#[from] bollard::errors::Error),

    #[error("Max iterations reached ({0})")]
    MaxIterationsReached(u32),

    #[error("No API key found. Set OPENAI_API_KEY or ANTHROPIC_API_KEY.")]
    MissingApiKey,

    /// Fatal at construction: persistence requested on a backend without the
    /// persistence extension, or an unknown sandbox backend name.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The sandboxed program could not be spawned, or exceeded its wall-clock
    /// budget. Always captured into a `ReplResult`, never propagated.
    #[error("Sandbox spawn/timeout error: {0}")]
    SandboxSpawn(String),

    /// The router received malformed JSON or an adapter raised during dispatch.
    #[error("LM transport error: {0}")]
    LmTransport(String),
}

/// Result type alias for RLM operations
pub type Result<T> = std::result::Result<T, RlmError>;
