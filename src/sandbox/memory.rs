//! In-memory sandbox test double: a deterministic stand-in for the local/
//! container backends, useful for driving [`crate::driver::Driver`] end to
//! end in tests without spawning a real child interpreter or container.
//! A queued-canned-response programmable double, no network, no mocking
//! framework.
//!
//! Configured through the same `sandbox_config` bag every backend reads:
//! `"responses"` (a JSON array of strings, each becoming one execution's
//! stdout, consumed in order) and `"vars"` (a JSON object pre-seeding the
//! REPL state so `FINAL_VAR` resolution has something to find).

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Result;
use crate::sandbox::{PersistentSandbox, Sandbox};
use crate::types::{ContextPayload, Message, ReplResult, ReplValue};

pub struct MemorySandbox {
    responses: VecDeque<String>,
    vars: HashMap<String, ReplValue>,
    context_count: usize,
    history_count: usize,
    history: Vec<Vec<Message>>,
}

impl MemorySandbox {
    pub fn new(config: &HashMap<String, serde_json::Value>, _depth: u32) -> Self {
        let responses = config
            .get("responses")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let vars = config
            .get("vars")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| (k.clone(), ReplValue::Json(v.clone())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            responses,
            vars,
            context_count: 0,
            history_count: 0,
            history: Vec::new(),
        }
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.vars.insert(name.into(), ReplValue::Json(value));
    }

    pub fn history(&self) -> &[Vec<Message>] {
        &self.history
    }

    /// Mirrors the local/container backends' `FINAL_VAR` hook semantics
    /// without a real interpreter: strip one pair of matching quotes, then
    /// look the name up in the seeded state.
    fn resolve_final_var(&self, arg: &str) -> ReplResult {
        let name = strip_quotes(arg.trim());
        match self.vars.get(&name) {
            Some(value) => ReplResult {
                stdout: value.as_text(),
                ..Default::default()
            },
            None => {
                let mut available: Vec<&str> = self
                    .vars
                    .keys()
                    .filter(|k| !k.starts_with('_'))
                    .map(String::as_str)
                    .collect();
                available.sort_unstable();
                ReplResult {
                    stderr: format!(
                        "Variable '{name}' is not defined. Available: {}",
                        available.join(", ")
                    ),
                    ..Default::default()
                }
            }
        }
    }
}

fn strip_quotes(s: &str) -> String {
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    async fn load_context(&mut self, _payload: &ContextPayload) -> Result<()> {
        self.context_count = self.context_count.max(1);
        Ok(())
    }

    async fn execute_code(&mut self, source: &str) -> Result<ReplResult> {
        if let Some(rest) = source.strip_prefix("FINAL_VAR(") {
            if let Some(arg) = rest.strip_suffix(')') {
                return Ok(self.resolve_final_var(arg));
            }
        }
        Ok(ReplResult {
            stdout: self.responses.pop_front().unwrap_or_default(),
            execution_time: Duration::ZERO,
            ..Default::default()
        })
    }

    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PersistentSandbox for MemorySandbox {
    async fn update_handler_address(&mut self, _addr: SocketAddr) -> Result<()> {
        Ok(())
    }

    async fn add_context(&mut self, _payload: &ContextPayload, index: Option<usize>) -> Result<usize> {
        let idx = index.unwrap_or(self.context_count);
        self.context_count = self.context_count.max(idx + 1);
        Ok(idx)
    }

    fn history_count(&self) -> usize {
        self.history_count
    }

    fn context_count(&self) -> usize {
        self.context_count
    }

    async fn add_history(&mut self, messages: &[Message], index: Option<usize>) -> Result<usize> {
        let idx = index.unwrap_or(self.history_count);
        self.history_count = self.history_count.max(idx + 1);
        self.history.push(messages.to_vec());
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn final_var_resolves_seeded_value() {
        let mut sandbox = MemorySandbox::new(&HashMap::new(), 0);
        sandbox.set_var("answer", serde_json::json!("42"));
        let result = sandbox.execute_code("FINAL_VAR(\"answer\")").await.unwrap();
        assert_eq!(result.stdout, "42");
    }

    #[tokio::test]
    async fn final_var_reports_missing_name() {
        let sandbox = MemorySandbox::new(&HashMap::new(), 0);
        let result = sandbox.execute_code("FINAL_VAR(missing)").await.unwrap();
        assert!(result.stderr.contains("not defined"));
    }

    #[tokio::test]
    async fn execute_code_replays_seeded_responses_in_order() {
        let mut config = HashMap::new();
        config.insert(
            "responses".to_string(),
            serde_json::json!(["first", "second"]),
        );
        let mut sandbox = MemorySandbox::new(&config, 0);
        let first = sandbox.execute_code("anything").await.unwrap();
        let second = sandbox.execute_code("anything").await.unwrap();
        assert_eq!(first.stdout, "first");
        assert_eq!(second.stdout, "second");
    }
}
