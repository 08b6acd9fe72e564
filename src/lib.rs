// src/lib.rs

/// LLM client abstractions (Claude/OpenAI/Gemini/Grok) used by the AI reasoner.
///
/// Retained from the toolkit this crate is built from; the orchestrator composes
/// with [`llm::client_wrapper::ClientWrapper`] rather than hardwiring one provider.
pub mod llm;

/// The orchestration engine: agent registry, reasoners, retry/breaker, validator,
/// formatter, controller, policy evaluator, security gate, configuration, and
/// observability.
pub mod orchestrator;

#[cfg(feature = "http-server")]
pub mod server;

pub use llm::client_wrapper::{ClientWrapper, Message, Role};
pub use orchestrator::controller::Orchestrator;
pub use orchestrator::error::OrchestratorError;
