//! Sandbox abstraction: the uniform session contract every backend
//! implements, plus an optional persistence extension for backends that
//! support reuse across completions.

pub mod container;
pub mod local;
pub mod memory;
pub mod proxy;

use async_trait::async_trait;
use std::net::SocketAddr;

use crate::error::Result;
use crate::types::{ContextPayload, Message, ReplResult};

/// One-time setup, context loading, code execution, and teardown. `cleanup`
/// must be idempotent and safe to call after only partial `setup`.
#[async_trait]
pub trait Sandbox: Send {
    async fn setup(&mut self) -> Result<()>;

    /// Bind `payload` into the REPL under the identifier `context`.
    async fn load_context(&mut self, payload: &ContextPayload) -> Result<()>;

    /// Run `source` against the session's current state, returning the
    /// result and persisting any mutations for the next call.
    async fn execute_code(&mut self, source: &str) -> Result<ReplResult>;

    async fn cleanup(&mut self) -> Result<()>;
}

/// Capability a backend may declare to let one session span multiple
/// completions with an evolving stack of named contexts and histories.
#[async_trait]
pub trait PersistentSandbox: Sandbox {
    /// Rebind the loopback router endpoint used by the sandbox's hooks.
    async fn update_handler_address(&mut self, addr: SocketAddr) -> Result<()>;

    /// Append a new context as `context_N` (aliasing `context` at N=0).
    /// Returns the assigned index.
    async fn add_context(&mut self, payload: &ContextPayload, index: Option<usize>) -> Result<usize>;

    fn history_count(&self) -> usize;
    fn context_count(&self) -> usize;

    /// Snapshot a completed message history as `history_N`.
    async fn add_history(&mut self, messages: &[Message], index: Option<usize>) -> Result<usize>;
}

/// Name of each backend as surfaced in [`crate::types::MetadataRecord`] and
/// accepted by [`SandboxBackend::create`].
pub const LOCAL_BACKEND: &str = "local";
pub const CONTAINER_BACKEND: &str = "container";
/// Deterministic in-memory test double (see [`memory::MemorySandbox`]) —
/// not a production backend, but a first-class name so driver-level tests
/// can select it the same way a caller selects "local"/"container".
pub const MEMORY_BACKEND: &str = "memory";

/// The concrete backends, dispatched by a plain enum match rather than a
/// trait object — mirrors how `LmAdapter`'s own concrete implementations
/// get selected by backend name.
pub enum SandboxBackend {
    Local(local::LocalSandbox),
    Container(container::ContainerSandbox),
    Memory(memory::MemorySandbox),
}

impl SandboxBackend {
    /// Instantiate a backend by name. Unknown names are a configuration
    /// error, fatal at construction.
    pub fn create(
        name: &str,
        config: &std::collections::HashMap<String, serde_json::Value>,
        router_addr: SocketAddr,
        depth: u32,
    ) -> Result<Self> {
        match name {
            LOCAL_BACKEND => Ok(SandboxBackend::Local(local::LocalSandbox::new(
                config,
                router_addr,
                depth,
            )?)),
            CONTAINER_BACKEND => Ok(SandboxBackend::Container(
                container::ContainerSandbox::new(config, router_addr, depth)?,
            )),
            MEMORY_BACKEND => Ok(SandboxBackend::Memory(memory::MemorySandbox::new(config, depth))),
            other => Err(crate::error::RlmError::Configuration(format!(
                "unknown sandbox backend '{other}': supported backends are '{LOCAL_BACKEND}', '{CONTAINER_BACKEND}', '{MEMORY_BACKEND}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SandboxBackend::Local(_) => LOCAL_BACKEND,
            SandboxBackend::Container(_) => CONTAINER_BACKEND,
            SandboxBackend::Memory(_) => MEMORY_BACKEND,
        }
    }
}

#[async_trait]
impl Sandbox for SandboxBackend {
    async fn setup(&mut self) -> Result<()> {
        match self {
            SandboxBackend::Local(s) => s.setup().await,
            SandboxBackend::Container(s) => s.setup().await,
            SandboxBackend::Memory(s) => s.setup().await,
        }
    }

    async fn load_context(&mut self, payload: &ContextPayload) -> Result<()> {
        match self {
            SandboxBackend::Local(s) => s.load_context(payload).await,
            SandboxBackend::Container(s) => s.load_context(payload).await,
            SandboxBackend::Memory(s) => s.load_context(payload).await,
        }
    }

    async fn execute_code(&mut self, source: &str) -> Result<ReplResult> {
        match self {
            SandboxBackend::Local(s) => s.execute_code(source).await,
            SandboxBackend::Container(s) => s.execute_code(source).await,
            SandboxBackend::Memory(s) => s.execute_code(source).await,
        }
    }

    async fn cleanup(&mut self) -> Result<()> {
        match self {
            SandboxBackend::Local(s) => s.cleanup().await,
            SandboxBackend::Container(s) => s.cleanup().await,
            SandboxBackend::Memory(s) => s.cleanup().await,
        }
    }
}

#[async_trait]
impl PersistentSandbox for SandboxBackend {
    async fn update_handler_address(&mut self, addr: SocketAddr) -> Result<()> {
        match self {
            SandboxBackend::Local(s) => s.update_handler_address(addr).await,
            SandboxBackend::Container(s) => s.update_handler_address(addr).await,
            SandboxBackend::Memory(s) => s.update_handler_address(addr).await,
        }
    }

    async fn add_context(&mut self, payload: &ContextPayload, index: Option<usize>) -> Result<usize> {
        match self {
            SandboxBackend::Local(s) => s.add_context(payload, index).await,
            SandboxBackend::Container(s) => s.add_context(payload, index).await,
            SandboxBackend::Memory(s) => s.add_context(payload, index).await,
        }
    }

    fn history_count(&self) -> usize {
        match self {
            SandboxBackend::Local(s) => s.history_count(),
            SandboxBackend::Container(s) => s.history_count(),
            SandboxBackend::Memory(s) => s.history_count(),
        }
    }

    fn context_count(&self) -> usize {
        match self {
            SandboxBackend::Local(s) => s.context_count(),
            SandboxBackend::Container(s) => s.context_count(),
            SandboxBackend::Memory(s) => s.context_count(),
        }
    }

    async fn add_history(&mut self, messages: &[Message], index: Option<usize>) -> Result<usize> {
        match self {
            SandboxBackend::Local(s) => s.add_history(messages, index).await,
            SandboxBackend::Container(s) => s.add_history(messages, index).await,
            SandboxBackend::Memory(s) => s.add_history(messages, index).await,
        }
    }
}

/// All three backends currently declare the persistence extension; this
/// predicate exists so the driver's construction-time validation has a
/// single place to check instead of assuming every future backend
/// supports it.
pub fn backend_supports_persistence(name: &str) -> bool {
    matches!(name, LOCAL_BACKEND | CONTAINER_BACKEND | MEMORY_BACKEND)
}
