//! # RLM - Recursive Language Models
//!
//! An inference engine enabling LLMs to recursively decompose tasks via
//! REPL-based code execution, sandboxed sub-process isolation, and a
//! loopback HTTP router mediating sub-LLM calls from inside the sandbox.

pub mod adapter;
pub mod config;
pub mod driver;
pub mod error;
pub mod observer;
pub mod parsing;
pub mod prompts;
pub mod router;
pub mod sandbox;
pub mod types;

pub use adapter::{build_adapter, AnthropicAdapter, FixedAdapter, LmAdapter, LmResponse, OpenAiAdapter};
pub use driver::{Driver, DriverConfig};
pub use error::{Result, RlmError};
pub use observer::{LogObserver, Observer, VerboseObserver};
pub use sandbox::{PersistentSandbox, Sandbox, SandboxBackend};
pub use types::{
    Backend, CodeBlock, CompletionRecord, ContextPayload, IterationRecord, Message,
    MetadataRecord, QueryMetadata, ReplResult, ReplValue, RlmConfig, Role, SubLmCall, Usage,
    UsageSummary,
};
