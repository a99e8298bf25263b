//! Iteration driver: the three-way coordination between the LM, the
//! sandbox session, and the loopback router. A turn loop
//! (`for iteration in 0..max_iterations`, history accumulation) that owns
//! a router and a swappable sandbox backend instead of calling an
//! in-process REPL directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::adapter::LmAdapter;
use crate::config::{self, SandboxConfig};
use crate::error::{Result, RlmError};
use crate::observer::Observer;
use crate::parsing;
use crate::prompts;
use crate::router::Router;
use crate::sandbox::{backend_supports_persistence, PersistentSandbox, Sandbox, SandboxBackend};
use crate::types::{
    CodeBlock, CompletionRecord, ContextPayload, IterationRecord, Message, MetadataRecord,
    QueryMetadata, UsageSummary,
};

const DEFAULT_MAX_DEPTH: u32 = 1;
const DEFAULT_MAX_ITERATIONS: u32 = 30;

/// Construction parameters for a [`Driver`].
pub struct DriverConfig {
    pub root_model: Arc<dyn LmAdapter>,
    pub sub_model: Option<Arc<dyn LmAdapter>>,
    pub sandbox_backend: String,
    pub sandbox_config: SandboxConfig,
    pub depth: u32,
    pub max_depth: u32,
    pub max_iterations: u32,
    pub system_prompt: Option<String>,
    pub observers: Vec<Arc<dyn Observer>>,
    pub persistent: bool,
}

impl DriverConfig {
    pub fn new(root_model: Arc<dyn LmAdapter>, sandbox_backend: impl Into<String>) -> Self {
        Self {
            root_model,
            sub_model: None,
            sandbox_backend: sandbox_backend.into(),
            sandbox_config: SandboxConfig::new(),
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            system_prompt: None,
            observers: Vec::new(),
            persistent: false,
        }
    }

    pub fn with_sub_model(mut self, sub_model: Arc<dyn LmAdapter>) -> Self {
        self.sub_model = Some(sub_model);
        self
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }
}

/// Owns (or, when persistent, reuses) one sandbox session across repeated
/// completions. Every `completion()` call starts a fresh router, wires it
/// to the sandbox, runs the iteration loop, and tears the router down —
/// the sandbox is destroyed too unless `persistent` was requested.
pub struct Driver {
    config: DriverConfig,
    persistent_sandbox: Option<SandboxBackend>,
}

impl Driver {
    /// Validates eagerly: persistence on a backend without the extension is
    /// a fatal configuration error, not deferred to first use.
    pub fn new(config: DriverConfig) -> Result<Self> {
        if config.persistent && !backend_supports_persistence(&config.sandbox_backend) {
            return Err(RlmError::Configuration(format!(
                "backend '{}' does not support persistence; supported backends are 'local', 'container'",
                config.sandbox_backend
            )));
        }
        Ok(Self {
            config,
            persistent_sandbox: None,
        })
    }

    fn metadata_record(&self) -> MetadataRecord {
        MetadataRecord {
            root_model: self.config.root_model.model_name().to_string(),
            max_depth: self.config.max_depth,
            max_iterations: self.config.max_iterations,
            sandbox_backend: self.config.sandbox_backend.clone(),
            sandbox_config: config::sanitize(&self.config.sandbox_config),
            sub_models: self
                .config
                .sub_model
                .as_ref()
                .map(|m| vec![m.model_name().to_string()]),
        }
    }

    fn emit_metadata(&self, record: &MetadataRecord) {
        for observer in &self.config.observers {
            observer.on_metadata(record);
        }
    }

    fn emit_iteration(&self, record: &IterationRecord) {
        for observer in &self.config.observers {
            observer.on_iteration(record);
        }
    }

    /// Run one completion against `payload`, optionally substituting
    /// `root_question` into the first iteration prompt.
    pub async fn completion(
        &mut self,
        payload: ContextPayload,
        root_question: Option<&str>,
    ) -> Result<CompletionRecord> {
        let start = Instant::now();
        self.emit_metadata(&self.metadata_record());

        if self.config.depth >= self.config.max_depth {
            return self.fallback_completion(payload, start).await;
        }

        let router = Router::start(
            self.config.root_model.clone(),
            self.config.sub_model.clone(),
            self.config.depth,
        )
        .await
        .map_err(RlmError::Io)?;

        let result = self.run_with_router(&router, payload, root_question, start).await;

        // `run_with_router` already destroyed the sandbox (non-persistent) or
        // stashed it in `self.persistent_sandbox` (persistent) on every exit
        // path, success or error; only the router remains to stop here.
        router.stop();

        result
    }

    async fn fallback_completion(
        &self,
        payload: ContextPayload,
        start: Instant,
    ) -> Result<CompletionRecord> {
        let text = match &payload {
            ContextPayload::Text(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        };
        let messages = vec![Message::user(text)];
        let response = self.config.root_model.generate(&messages).await?;

        let mut usage_summary: UsageSummary = HashMap::new();
        if let Some(usage) = &response.usage {
            usage_summary.insert(
                self.config.root_model.model_name().to_string(),
                (1, usage.input_tokens, usage.output_tokens),
            );
        }

        Ok(CompletionRecord {
            root_model: self.config.root_model.model_name().to_string(),
            prompt: payload,
            response: response.text,
            usage_summary,
            execution_time: start.elapsed(),
        })
    }

    /// Acquires the sandbox, runs the turn loop, and — on every exit path,
    /// success or error alike — either hands the sandbox back to
    /// `self.persistent_sandbox` (persistent driver) or tears it down
    /// (§4.F's finally clause: "destroy the sandbox unless persistent").
    async fn run_with_router(
        &mut self,
        router: &Router,
        payload: ContextPayload,
        root_question: Option<&str>,
        start: Instant,
    ) -> Result<CompletionRecord> {
        let mut sandbox = self.acquire_sandbox(router, &payload).await?;

        let result = self
            .run_turns(router, &mut sandbox, payload, root_question, start)
            .await;

        if self.config.persistent {
            self.persistent_sandbox = Some(sandbox);
        } else if let Err(e) = sandbox.cleanup().await {
            tracing::warn!(error = %e, "sandbox cleanup failed after completion");
        }

        result
    }

    /// The turn loop proper, isolated from sandbox lifecycle management so
    /// every return — including the `?`-propagated error paths — runs
    /// through `run_with_router`'s single cleanup-or-store tail.
    async fn run_turns(
        &mut self,
        router: &Router,
        sandbox: &mut SandboxBackend,
        payload: ContextPayload,
        root_question: Option<&str>,
        start: Instant,
    ) -> Result<CompletionRecord> {
        let system_prompt = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(prompts::build_system_prompt);
        let meta: QueryMetadata = (&payload).into();

        let mut history = vec![
            Message::system(system_prompt),
            Message::assistant(prompts::build_metadata_message(&meta)),
        ];

        let mut final_answer: Option<String> = None;

        for iteration in 0..self.config.max_iterations {
            let iter_start = Instant::now();

            let context_count = sandbox.context_count().max(1);
            let history_count = sandbox.history_count().max(1);
            let prompt_text = prompts::build_iteration_prompt(
                iteration,
                self.config.max_iterations,
                root_question,
                context_count,
                history_count,
            );
            history.push(Message::user(prompt_text));

            let response = router.generate_direct(&history).await?;

            let mut code_blocks = Vec::new();
            for code in parsing::extract_code_blocks(&response.text) {
                let result = sandbox.execute_code(&code).await?;
                code_blocks.push(CodeBlock { code, result });
            }

            let marker = parsing::detect_marker(&response.text);
            let answer = if let Some(marker) = &marker {
                parsing::resolve_marker(marker, Some(&mut *sandbox)).await
            } else {
                None
            };

            let record = IterationRecord {
                history: history.clone(),
                response: response.text.clone(),
                code_blocks,
                final_answer: answer.clone(),
                execution_time: iter_start.elapsed(),
            };
            self.emit_iteration(&record);

            if let Some(answer) = answer {
                final_answer = Some(answer);
                if self.config.persistent {
                    let _ = sandbox.add_history(&history, None).await;
                }
                break;
            }

            history.push(Message::assistant(response.text));
            for message in parsing::format_iteration_messages(&record) {
                if message.role == crate::types::Role::User {
                    history.push(message);
                }
            }
        }

        let response_text = if let Some(answer) = final_answer {
            answer
        } else {
            history.push(Message::user(prompts::build_exhaustion_prompt()));
            let epilogue = router.generate_direct(&history).await?;
            epilogue.text
        };

        let usage_summary = router.usage_summary().await;

        Ok(CompletionRecord {
            root_model: self.config.root_model.model_name().to_string(),
            prompt: payload,
            response: response_text,
            usage_summary,
            execution_time: start.elapsed(),
        })
    }

    async fn acquire_sandbox(
        &mut self,
        router: &Router,
        payload: &ContextPayload,
    ) -> Result<SandboxBackend> {
        if let Some(mut sandbox) = self.persistent_sandbox.take() {
            if let Err(e) = sandbox.update_handler_address(router.addr()).await {
                let _ = sandbox.cleanup().await;
                return Err(e);
            }
            if let Err(e) = sandbox.add_context(payload, None).await {
                let _ = sandbox.cleanup().await;
                return Err(e);
            }
            return Ok(sandbox);
        }

        let mut sandbox = SandboxBackend::create(
            &self.config.sandbox_backend,
            &self.config.sandbox_config,
            router.addr(),
            self.config.depth,
        )?;
        if let Err(e) = sandbox.setup().await {
            let _ = sandbox.cleanup().await;
            return Err(e);
        }
        if let Err(e) = sandbox.load_context(payload).await {
            let _ = sandbox.cleanup().await;
            return Err(e);
        }
        Ok(sandbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::FixedAdapter;

    fn config_with_responses(responses: Vec<&str>) -> DriverConfig {
        let adapter: Arc<dyn LmAdapter> = Arc::new(FixedAdapter::new("test-model", responses));
        DriverConfig::new(adapter, "local")
    }

    #[test]
    fn construction_rejects_persistence_on_unsupported_backend() {
        let adapter: Arc<dyn LmAdapter> = Arc::new(FixedAdapter::new("m", vec![]));
        let mut config = DriverConfig::new(adapter, "local");
        config.persistent = true;
        // Both declared backends currently support persistence; simulate an
        // unknown/unsupported one to exercise the validation path.
        config.sandbox_backend = "unsupported".to_string();
        let driver = Driver::new(config);
        assert!(driver.is_err());
    }

    #[test]
    fn fallback_triggers_when_depth_meets_max_depth() {
        let mut config = config_with_responses(vec!["ignored"]);
        config.depth = 1;
        config.max_depth = 1;
        let driver = Driver::new(config).unwrap();
        assert!(driver.config.depth >= driver.config.max_depth);
    }

    fn memory_config(
        responses: Vec<&str>,
        vars: serde_json::Value,
    ) -> DriverConfig {
        let adapter: Arc<dyn LmAdapter> = Arc::new(FixedAdapter::new("test-model", responses));
        let mut config = DriverConfig::new(adapter, crate::sandbox::MEMORY_BACKEND);
        config.sandbox_config.insert("vars".to_string(), vars);
        config
    }

    /// S1 — trivial FINAL terminates on the first turn with zero code blocks.
    #[tokio::test]
    async fn trivial_final_terminates_on_first_iteration() {
        let config = memory_config(vec!["FINAL(bye)"], serde_json::json!({}));
        let mut driver = Driver::new(config).unwrap();
        let completion = driver
            .completion(ContextPayload::Text("hello".to_string()), Some("Say bye"))
            .await
            .unwrap();
        assert_eq!(completion.response, "bye");
        assert_eq!(completion.usage_summary.get("test-model"), Some(&(1, 10, 10)));
    }

    /// S2 — one code block, then FINAL_VAR on an undefined name resolves to
    /// the sandbox's diagnostic stderr text.
    #[tokio::test]
    async fn final_var_on_missing_name_returns_diagnostic() {
        let mut config = memory_config(
            vec!["```repl\nprint(1+1)\n```", "FINAL_VAR(none)"],
            serde_json::json!({"answer": "42"}),
        );
        config
            .sandbox_config
            .insert("responses".to_string(), serde_json::json!(["2\n"]));
        let mut driver = Driver::new(config).unwrap();
        let completion = driver
            .completion(ContextPayload::Text("hello".to_string()), None)
            .await
            .unwrap();
        assert!(completion.response.contains("not defined"));
    }

    /// S6 — budget exhaustion: with max_iterations = 3 and no marker ever
    /// emitted, the driver makes exactly one more epilogue call and returns
    /// its text.
    #[tokio::test]
    async fn budget_exhaustion_returns_epilogue_text() {
        let adapter: Arc<dyn LmAdapter> = Arc::new(FixedAdapter::new(
            "test-model",
            vec!["no marker 1", "no marker 2", "no marker 3", "epilogue answer"],
        ));
        let mut config = DriverConfig::new(adapter, crate::sandbox::MEMORY_BACKEND);
        config.max_iterations = 3;
        let mut driver = Driver::new(config).unwrap();
        let completion = driver
            .completion(ContextPayload::Text("hello".to_string()), None)
            .await
            .unwrap();
        assert_eq!(completion.response, "epilogue answer");
    }

    /// Depth >= max_depth falls back to one direct LM call, bypassing the
    /// sandbox and router entirely.
    #[tokio::test]
    async fn fallback_completion_uses_direct_lm_call() {
        let adapter: Arc<dyn LmAdapter> = Arc::new(FixedAdapter::new("test-model", vec!["direct answer"]));
        let mut config = DriverConfig::new(adapter, crate::sandbox::MEMORY_BACKEND);
        config.depth = 1;
        config.max_depth = 1;
        let mut driver = Driver::new(config).unwrap();
        let completion = driver
            .completion(ContextPayload::Text("hello".to_string()), None)
            .await
            .unwrap();
        assert_eq!(completion.response, "direct answer");
    }
}
