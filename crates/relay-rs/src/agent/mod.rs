//! Orchestration: the [`OrchestratorEngine`] turn loop and what it drives.
//!
//! - [`engine::OrchestratorEngine`]: the task loop, operation pipeline and
//!   self-handoff. Start here.
//! - [`config::OrchestratorConfig`]: every knob, loadable from JSON.
//! - [`events`]: [`EventHandler`] and [`OrchestratorEvent`] for observing
//!   the loop and answering clarification requests.
//! - [`decision`]: proceed / retry / clarify / escalate, with ADR records.
//! - [`collaborators`]: the coding agent, validator, assessor and task store
//!   seams.
//! - [`turns`]: per-task turn budgets.
//! - [`prompt`]: budgeted turn prompts.

pub mod collaborators;
pub mod config;
pub mod decision;
pub mod engine;
pub mod events;
pub mod prompt;
pub mod turns;

pub use collaborators::{
    AgentResponse, CodingAgent, Collaborators, DeliverableAssessor, Deliverables, FileChange,
    InMemoryTaskStore, Task, TaskStatus, TaskStore, TaskType, ValidationOutcome, Validator,
};
pub use config::{OrchestratorConfig, Toggle};
pub use decision::{Action, Decision, DecisionEngine, DecisionRecord, DecisionThresholds};
pub use engine::{OrchestratorEngine, SessionPhase, TaskOutcome};
pub use events::{
    CompositeEventHandler, EventHandler, EventObserver, EventResponse, FnEventHandler,
    LoggingHandler, NoopHandler, OrchestratorEvent,
};
pub use prompt::{Keep, PromptBuilder};
pub use turns::{TurnBudget, TurnBudgetConfig};
