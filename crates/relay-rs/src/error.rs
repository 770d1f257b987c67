//! Error taxonomy for the orchestrator.
//!
//! Locally recoverable failures (`AgentTimeout`, `ContextOverflow`,
//! `CheckpointVerificationFailure`) are handled inside the engine. The
//! surfaced variants (`TurnsExhausted`, `Escalated`, `ResumeIntegrityFailure`,
//! `HandoffLimitExceeded`, `Cancelled`) carry enough context for a human to
//! pick the work back up: what was attempted and the last checkpoint that is
//! known to be good.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    /// The coding agent did not answer within the configured timeout.
    #[error("agent call timed out after {timeout_secs}s")]
    AgentTimeout { timeout_secs: u64 },

    /// The coding agent failed for a reason other than a timeout.
    #[error("agent error: {0}")]
    Agent(String),

    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// Usage would exceed the effective window. The caller optimizes and continues.
    #[error("context overflow: {requested} tokens requested, {available} available")]
    ContextOverflow { requested: usize, available: usize },

    #[error("checkpoint verification failed: {0}")]
    CheckpointVerificationFailure(String),

    #[error("resume from checkpoint {checkpoint_id} failed integrity check: {reason}")]
    ResumeIntegrityFailure {
        checkpoint_id: String,
        reason: String,
    },

    #[error(
        "task {task_id} exhausted {turns} turn(s) without assessable deliverables \
         (last checkpoint: {last_checkpoint:?})"
    )]
    TurnsExhausted {
        task_id: String,
        turns: u32,
        last_checkpoint: Option<String>,
    },

    #[error("task {task_id} escalated at turn {turn}: {reason} (last checkpoint: {last_checkpoint:?})")]
    Escalated {
        task_id: String,
        turn: u32,
        reason: String,
        last_checkpoint: Option<String>,
    },

    #[error("self-handoff limit of {limit} reached (last checkpoint: {last_checkpoint:?})")]
    HandoffLimitExceeded {
        limit: u32,
        last_checkpoint: Option<String>,
    },

    #[error("session cancelled (last checkpoint: {last_checkpoint:?})")]
    Cancelled { last_checkpoint: Option<String> },

    /// Attempted to overwrite an immutable record.
    #[error("{0} already exists and is immutable")]
    Immutable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Whether the engine may retry the failed step in place.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::AgentTimeout { .. } | RelayError::ContextOverflow { .. } => true,
            RelayError::Api(msg) | RelayError::Agent(msg) => crate::api::retry::is_transient(msg),
            _ => false,
        }
    }

    /// Last known good checkpoint carried by a surfaced failure.
    pub fn last_checkpoint(&self) -> Option<&str> {
        match self {
            RelayError::TurnsExhausted {
                last_checkpoint, ..
            }
            | RelayError::Escalated {
                last_checkpoint, ..
            }
            | RelayError::HandoffLimitExceeded {
                last_checkpoint, ..
            }
            | RelayError::Cancelled { last_checkpoint } => last_checkpoint.as_deref(),
            RelayError::ResumeIntegrityFailure { checkpoint_id, .. } => Some(checkpoint_id),
            _ => None,
        }
    }
}
