//! The unit of recorded work that flows through every memory tier.

use crate::context::tokens::TokenEstimator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of action an [`Operation`] records.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// A task step; starts a new phase in the context snapshot.
    TaskStep,
    AgentResponse,
    /// A command from an upstream producer (e.g. a natural-language request).
    Command,
    FileChange,
    Validation,
    Decision,
    Error,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::TaskStep => "task_step",
            OperationKind::AgentResponse => "agent_response",
            OperationKind::Command => "command",
            OperationKind::FileChange => "file_change",
            OperationKind::Validation => "validation",
            OperationKind::Decision => "decision",
            OperationKind::Error => "error",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded action. Immutable once constructed.
///
/// The full payload (agent output, file contents) lives in the artifact store
/// and is referenced by `full_payload_ref`; the operation itself only carries
/// a short summary and the token cost of the work it represents.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Operation {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: OperationKind,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_payload_ref: Option<String>,
    pub tokens: usize,
}

impl Operation {
    /// Create an operation whose token cost is estimated from its summary.
    pub fn new(kind: OperationKind, summary: impl Into<String>, estimator: &TokenEstimator) -> Self {
        let summary = summary.into();
        let tokens = estimator.estimate(&summary);
        Self {
            id: crate::persist::generate_id("op"),
            timestamp: Utc::now(),
            kind,
            summary,
            full_payload_ref: None,
            tokens,
        }
    }

    /// Reference an externalized payload.
    pub fn with_payload_ref(mut self, reference: impl Into<String>) -> Self {
        self.full_payload_ref = Some(reference.into());
        self
    }

    /// Override the token cost (e.g. the size of the full payload rather
    /// than the summary).
    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Single-line rendering used in prompts and logs.
    pub fn to_line(&self) -> String {
        match &self.full_payload_ref {
            Some(r) => format!(
                "[{}] {}: {} (ref {r})",
                self.timestamp.format("%H:%M:%S"),
                self.kind,
                self.summary
            ),
            None => format!(
                "[{}] {}: {}",
                self.timestamp.format("%H:%M:%S"),
                self.kind,
                self.summary
            ),
        }
    }
}
