//! Autonomous task orchestration within a fixed context window.
//!
//! `relay-rs` runs a coding agent through a sequence of tasks while keeping
//! its context in budget. The core abstraction is the
//! [`OrchestratorEngine`](agent::engine::OrchestratorEngine): it prompts the
//! agent one turn at a time, validates each response, decides whether to
//! proceed, retry, ask for guidance or escalate, and records every step in
//! a layered memory.
//!
//! When the context fills up the engine does not stop. It optimizes the live
//! context first; if usage still reaches the red zone it writes a verified
//! checkpoint, drops everything it holds in memory and reloads from that
//! checkpoint with a fresh agent conversation (a *self-handoff*).
//!
//! # Getting started
//!
//! ```ignore
//! use relay_rs::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> relay_rs::error::Result<()> {
//!     let config = OrchestratorConfig::load("relay.json".as_ref())?;
//!     let client = Arc::new(OpenRouterClient::new(std::env::var("OPENROUTER_KEY").unwrap_or_default())?);
//!
//!     let collaborators = Collaborators {
//!         agent: Arc::new(OpenRouterAgent::new(client.clone(), &config.model)),
//!         validator: Arc::new(MyValidator),
//!         assessor: Arc::new(MyAssessor),
//!         tasks: Arc::new(InMemoryTaskStore::new().with_task(Task::new("t-1", "Add login", TaskType::Story))),
//!     };
//!     let summarizer = Arc::new(LlmSummarizer::new(client, &config.model));
//!
//!     let engine = OrchestratorEngine::open(config, collaborators, Arc::new(GitProbe::new(".")), summarizer)?
//!         .with_event_handler(LoggingHandler);
//!     let outcome = engine.run_task("t-1").await?;
//!     println!("{}", outcome.label());
//!     engine.finish_session()?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | [`OrchestratorEngine`](agent::engine::OrchestratorEngine), config, events, decisions, turn budgets, collaborator seams |
//! | [`context`] | Token estimation, window zones, working memory, optimization pipeline, adaptive profiles |
//! | [`memory`] | Session narrative, episodic documents, artifact store, versioning |
//! | [`checkpoint`] | Immutable checkpoints, verification, resume |
//! | [`api`] | OpenRouter client, retry with backoff, agent and summarizer adapters |
//!
//! # Memory tiers
//!
//! 1. **Working memory**: the last few operations, bounded by count and
//!    tokens. Always in the prompt.
//! 2. **Session memory**: an append-only operation log plus a compressed
//!    narrative for the current session.
//! 3. **Episodic memory**: project state, work plan and decision log. Outlives
//!    sessions.
//! 4. **Checkpoints**: everything needed to rebuild tiers 1 and 2 in a fresh
//!    window.

pub mod agent;
pub mod api;
pub mod checkpoint;
pub mod context;
pub mod error;
pub mod memory;
pub mod persist;
pub mod prelude;
