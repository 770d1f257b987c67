//! Checkpoints: immutable, verified snapshots of a session that a
//! self-handoff or a restarted process can reload.

pub mod manager;
pub mod model;
pub mod verifier;

pub use manager::{CheckpointConfig, CheckpointDraft, CheckpointManager, CheckpointOutcome};
pub use model::{
    CheckResult, Checkpoint, CheckpointState, CheckpointSummary, CheckpointTrigger, TaskProgress,
    VerificationResult,
};
pub use verifier::{
    CheckpointVerifier, GitProbe, StaticProbe, VerifierConfig, WorkspaceProbe, WorkspaceStatus,
};
