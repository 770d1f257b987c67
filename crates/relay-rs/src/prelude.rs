//! Convenience re-exports for common `relay-rs` types.
//!
//! ```ignore
//! use relay_rs::prelude::*;
//! ```
//!
//! Covers what a host program needs to build and run an engine: config,
//! collaborator traits, event handlers and the OpenRouter adapters.
//! Internal pipeline types (optimizer techniques, version store, checkpoint
//! drafts) are left out; import those from their modules.

// ── Engine ──────────────────────────────────────────────────────────
pub use crate::agent::{
    Action, AgentResponse, CodingAgent, Collaborators, CompositeEventHandler, DeliverableAssessor,
    Deliverables, EventHandler, EventObserver, EventResponse, FileChange, FnEventHandler,
    InMemoryTaskStore, LoggingHandler, NoopHandler, OrchestratorConfig, OrchestratorEngine,
    OrchestratorEvent, Task, TaskOutcome, TaskStatus, TaskStore, TaskType, Toggle,
    ValidationOutcome, Validator,
};
pub use crate::agent::collaborators::{CollabFuture, ConfidenceSignals};

// ── Context and memory ──────────────────────────────────────────────
pub use crate::context::{
    ExtractiveSummarizer, Operation, OperationKind, Summarizer, TokenEstimator, Zone,
};

// ── Checkpoints ─────────────────────────────────────────────────────
pub use crate::checkpoint::{Checkpoint, GitProbe, StaticProbe, WorkspaceProbe, WorkspaceStatus};

// ── API ─────────────────────────────────────────────────────────────
pub use crate::api::{LlmSummarizer, OpenRouterAgent, OpenRouterClient};

pub use crate::error::{RelayError, Result};
