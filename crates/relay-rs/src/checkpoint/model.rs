//! Serializable checkpoint records.
//!
//! A checkpoint is written once and never modified. It captures everything
//! needed to rebuild the in-memory state of a session after a self-handoff
//! or a crash: working memory, the live context snapshot, window usage,
//! pointers to the persisted memory documents and task progress.

use crate::context::operation::Operation;
use crate::context::snapshot::ContextSnapshot;
use crate::context::window::WindowSnapshot;
use crate::memory::episodic::DocumentRef;
use crate::memory::session::SessionRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a checkpoint was taken.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum CheckpointTrigger {
    /// Window utilization crossed a zone boundary.
    Threshold { usage_pct: f64 },
    /// The profile's checkpoint interval elapsed.
    Time { elapsed_secs: u64 },
    /// The profile's operation count was reached.
    OpCount { ops: u64 },
    Manual,
    /// Forced before a self-handoff.
    Handoff,
}

impl CheckpointTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            CheckpointTrigger::Threshold { .. } => "threshold",
            CheckpointTrigger::Time { .. } => "time",
            CheckpointTrigger::OpCount { .. } => "op_count",
            CheckpointTrigger::Manual => "manual",
            CheckpointTrigger::Handoff => "handoff",
        }
    }
}

impl std::fmt::Display for CheckpointTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointTrigger::Threshold { usage_pct } => {
                write!(f, "threshold ({:.0}%)", usage_pct * 100.0)
            }
            CheckpointTrigger::Time { elapsed_secs } => write!(f, "time ({elapsed_secs}s)"),
            CheckpointTrigger::OpCount { ops } => write!(f, "op_count ({ops})"),
            CheckpointTrigger::Manual => f.write_str("manual"),
            CheckpointTrigger::Handoff => f.write_str("handoff"),
        }
    }
}

/// Where the current task stands.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TaskProgress {
    pub task_id: Option<String>,
    pub turn: u32,
    pub max_turns: u32,
    /// Files reported changed so far.
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Feedback to carry into the next turn's prompt.
    #[serde(default)]
    pub feedback: Option<String>,
}

/// The rebuildable state frozen in a checkpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckpointState {
    pub working_memory: Vec<Operation>,
    pub context: ContextSnapshot,
    pub window: WindowSnapshot,
    pub session: SessionRef,
    pub episodic: Vec<DocumentRef>,
    /// Artifact ids referenced by the context.
    pub artifacts: Vec<String>,
    pub progress: TaskProgress,
    /// Task state blob the next checkpoint diffs against.
    #[serde(default)]
    pub state: serde_json::Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn new(name: impl Into<String>, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed,
            detail: detail.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VerificationResult {
    pub verified: bool,
    pub checks: Vec<CheckResult>,
    /// Evaluations deferred before this checkpoint committed.
    #[serde(default)]
    pub deferrals: u32,
    /// Committed without passing verification after too many deferrals.
    #[serde(default)]
    pub forced: bool,
}

impl VerificationResult {
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        Self {
            verified: checks.iter().all(|c| c.passed),
            checks,
            deferrals: 0,
            forced: false,
        }
    }

    /// Names and details of failed checks, comma separated.
    pub fn failures(&self) -> String {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub trigger: CheckpointTrigger,
    /// The checkpoint this one supersedes, if any.
    pub supersedes: Option<String>,
    /// Workspace branch at creation time.
    pub branch: Option<String>,
    pub context_snapshot: CheckpointState,
    /// Prompt text that tells the agent how to pick up after a reload.
    pub resume_instructions: String,
    pub verification_result: VerificationResult,
}

impl Checkpoint {
    /// Token cost of reloading this checkpoint into a fresh window.
    pub fn rehydration_tokens(&self, estimator: &crate::context::tokens::TokenEstimator) -> usize {
        let working: usize = self
            .context_snapshot
            .working_memory
            .iter()
            .map(|op| op.tokens)
            .sum();
        estimator.estimate(&self.resume_instructions) + working
    }

    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            task_id: self.task_id.clone(),
            created_at: self.created_at,
            trigger: self.trigger.label().to_string(),
            verified: self.verification_result.verified,
            operations: self.context_snapshot.session.operation_count,
        }
    }
}

/// One line of `checkpoints list`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckpointSummary {
    pub id: String,
    pub session_id: String,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub trigger: String,
    pub verified: bool,
    pub operations: u64,
}
