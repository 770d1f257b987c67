//! Checkpoint triggers, creation and resume.
//!
//! Directory layout:
//! ```text
//! checkpoints/
//!   cp-18c3f0a1b2c4d5e6-0000.json
//!   cp-18c3f0a9e7f81234-0001.json
//! ```
//!
//! Each file is written once through a temp-file rename and never touched
//! again. A checkpoint that fails pre-commit verification is deferred and
//! the trigger stays pending, so the next evaluation retries it. After
//! `max_deferrals` consecutive deferrals the checkpoint is committed
//! unverified.

use crate::checkpoint::model::{
    Checkpoint, CheckpointState, CheckpointSummary, CheckpointTrigger, VerificationResult,
};
use crate::checkpoint::verifier::{CheckpointVerifier, VerifierConfig, WorkspaceProbe};
use crate::context::adaptive::OptimizationProfile;
use crate::context::window::ZoneThresholds;
use crate::error::{RelayError, Result};
use crate::memory::artifacts::ArtifactStore;
use crate::persist::{generate_id, read_json, write_json_atomic};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Deferrals tolerated before committing unverified.
    pub max_deferrals: u32,
    pub verifier: VerifierConfig,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_deferrals: 5,
            verifier: VerifierConfig::default(),
        }
    }
}

/// Everything a checkpoint needs except what the manager fills in.
#[derive(Debug, Clone)]
pub struct CheckpointDraft {
    pub session_id: String,
    pub task_id: Option<String>,
    pub state: CheckpointState,
    pub resume_instructions: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOutcome {
    Committed(Box<Checkpoint>),
    /// Verification failed; the trigger remains pending.
    Deferred { deferrals: u32, reason: String },
}

impl CheckpointOutcome {
    pub fn committed(&self) -> Option<&Checkpoint> {
        match self {
            CheckpointOutcome::Committed(cp) => Some(cp),
            CheckpointOutcome::Deferred { .. } => None,
        }
    }

    pub fn into_result(self) -> Result<Checkpoint> {
        match self {
            CheckpointOutcome::Committed(cp) => Ok(*cp),
            CheckpointOutcome::Deferred { reason, .. } => {
                Err(RelayError::CheckpointVerificationFailure(reason))
            }
        }
    }
}

#[derive(Debug, Default)]
struct TriggerState {
    yellow_fired: bool,
    orange_fired: bool,
    pending: Option<CheckpointTrigger>,
    deferrals: u32,
    last_id: Option<String>,
}

pub struct CheckpointManager {
    dir: PathBuf,
    config: CheckpointConfig,
    verifier: CheckpointVerifier,
    probe: Arc<dyn WorkspaceProbe>,
    artifacts: ArtifactStore,
    thresholds: ZoneThresholds,
    profile: Mutex<OptimizationProfile>,
    state: Mutex<TriggerState>,
}

impl CheckpointManager {
    pub fn open(
        dir: impl Into<PathBuf>,
        config: CheckpointConfig,
        thresholds: ZoneThresholds,
        profile: OptimizationProfile,
        probe: Arc<dyn WorkspaceProbe>,
        artifacts: ArtifactStore,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            verifier: CheckpointVerifier::new(config.verifier.clone()),
            config,
            probe,
            artifacts,
            thresholds,
            profile: Mutex::new(profile),
            state: Mutex::new(TriggerState::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TriggerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn profile(&self) -> OptimizationProfile {
        self.profile.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_profile(&self, profile: OptimizationProfile) {
        *self.profile.lock().unwrap_or_else(|e| e.into_inner()) = profile;
    }

    /// Id of the newest checkpoint this manager committed or resumed.
    pub fn last_checkpoint_id(&self) -> Option<String> {
        self.lock().last_id.clone()
    }

    pub fn pending_trigger(&self) -> Option<CheckpointTrigger> {
        self.lock().pending.clone()
    }

    pub fn deferrals(&self) -> u32 {
        self.lock().deferrals
    }

    /// Evaluate triggers. A pending (deferred) trigger is returned first;
    /// the yellow and orange crossings fire once each per cycle; then the
    /// profile's time and operation thresholds. A returned trigger stays
    /// pending until a checkpoint commits.
    pub fn should_checkpoint(
        &self,
        usage_pct: f64,
        since_last: Duration,
        ops_since_last: u64,
    ) -> Option<CheckpointTrigger> {
        let profile = self.profile();
        let mut state = self.lock();
        if let Some(pending) = &state.pending {
            return Some(pending.clone());
        }

        let trigger = if usage_pct >= self.thresholds.orange && !state.orange_fired {
            state.orange_fired = true;
            state.yellow_fired = true;
            Some(CheckpointTrigger::Threshold { usage_pct })
        } else if usage_pct >= self.thresholds.yellow && !state.yellow_fired {
            state.yellow_fired = true;
            Some(CheckpointTrigger::Threshold { usage_pct })
        } else if since_last >= profile.checkpoint_interval {
            Some(CheckpointTrigger::Time {
                elapsed_secs: since_last.as_secs(),
            })
        } else if ops_since_last >= profile.checkpoint_op_threshold {
            Some(CheckpointTrigger::OpCount {
                ops: ops_since_last,
            })
        } else {
            None
        };

        if let Some(ref t) = trigger {
            debug!("Checkpoint trigger fired: {t}");
            state.pending = Some(t.clone());
        }
        trigger
    }

    /// Start a new threshold cycle. Called after a self-handoff.
    pub fn reset_cycle(&self) {
        let mut state = self.lock();
        state.yellow_fired = false;
        state.orange_fired = false;
    }

    /// Verify the workspace and commit, or defer.
    pub async fn create_checkpoint(
        &self,
        trigger: CheckpointTrigger,
        draft: CheckpointDraft,
        mid_task: bool,
    ) -> Result<CheckpointOutcome> {
        let status = self.probe.status().await?;
        let mut result = self.verifier.pre_check(&status, mid_task);

        if !result.verified {
            let deferrals = {
                let mut state = self.lock();
                state.deferrals += 1;
                state.pending = Some(trigger.clone());
                state.deferrals
            };
            if deferrals <= self.config.max_deferrals {
                let reason = result.failures();
                warn!(
                    "Checkpoint deferred ({deferrals}/{}): {reason}",
                    self.config.max_deferrals
                );
                return Ok(CheckpointOutcome::Deferred { deferrals, reason });
            }
            warn!(
                "Committing unverified checkpoint after {} deferrals: {}",
                deferrals - 1,
                result.failures()
            );
            result.forced = true;
        }

        result.deferrals = self.lock().deferrals;
        let checkpoint = self.build(trigger, draft, status.branch, result);
        self.commit(&checkpoint)?;
        Ok(CheckpointOutcome::Committed(Box::new(checkpoint)))
    }

    /// Commit regardless of verification. The result is still recorded.
    pub async fn force_checkpoint(
        &self,
        trigger: CheckpointTrigger,
        draft: CheckpointDraft,
    ) -> Result<Checkpoint> {
        let status = self.probe.status().await?;
        let mut result = self.verifier.pre_check(&status, false);
        result.forced = !result.verified;
        result.deferrals = self.lock().deferrals;
        let checkpoint = self.build(trigger, draft, status.branch, result);
        self.commit(&checkpoint)?;
        Ok(checkpoint)
    }

    fn build(
        &self,
        trigger: CheckpointTrigger,
        draft: CheckpointDraft,
        branch: Option<String>,
        verification_result: VerificationResult,
    ) -> Checkpoint {
        Checkpoint {
            id: generate_id("cp"),
            session_id: draft.session_id,
            task_id: draft.task_id,
            created_at: Utc::now(),
            trigger,
            supersedes: self.lock().last_id.clone(),
            branch,
            context_snapshot: draft.state,
            resume_instructions: draft.resume_instructions,
            verification_result,
        }
    }

    fn commit(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.save(checkpoint)?;
        let mut state = self.lock();
        state.pending = None;
        state.deferrals = 0;
        state.last_id = Some(checkpoint.id.clone());
        info!(
            "Checkpoint {} committed ({}, verified: {})",
            checkpoint.id, checkpoint.trigger, checkpoint.verification_result.verified
        );
        Ok(())
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist a checkpoint. Existing checkpoints are never overwritten.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.path_for(&checkpoint.id);
        if path.exists() {
            return Err(RelayError::Immutable(format!("checkpoint {}", checkpoint.id)));
        }
        write_json_atomic(&path, checkpoint)?;
        Ok(path)
    }

    pub fn load(&self, id: &str) -> Result<Checkpoint> {
        read_json(&self.path_for(id))
    }

    /// Summaries of every readable checkpoint, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointSummary>> {
        Ok(self.load_all()?.iter().map(Checkpoint::summary).collect())
    }

    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.load_all()?.pop())
    }

    fn load_all(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_json = path.extension().is_some_and(|e| e == "json");
            let hidden = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if !is_json || hidden {
                continue;
            }
            match read_json::<Checkpoint>(&path) {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => warn!("Skipping unreadable checkpoint {}: {e}", path.display()),
            }
        }
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(checkpoints)
    }

    /// Run the post-check without resuming.
    pub async fn verify(&self, id: &str) -> Result<VerificationResult> {
        let checkpoint = self.load(id)?;
        let status = self.probe.status().await?;
        Ok(self
            .verifier
            .post_check(&checkpoint, &self.artifacts, status.branch.as_deref()))
    }

    /// Load a checkpoint for resumption. Fails without side effects if it
    /// is missing, unreadable or fails the post-check.
    pub async fn resume_from_checkpoint(&self, id: &str) -> Result<Checkpoint> {
        let integrity = |reason: String| RelayError::ResumeIntegrityFailure {
            checkpoint_id: id.to_string(),
            reason,
        };
        let checkpoint = self.load(id).map_err(|e| integrity(e.to_string()))?;
        let status = self.probe.status().await?;
        let result = self
            .verifier
            .post_check(&checkpoint, &self.artifacts, status.branch.as_deref());
        if !result.verified {
            return Err(integrity(result.failures()));
        }
        let mut state = self.lock();
        state.last_id = Some(checkpoint.id.clone());
        state.pending = None;
        state.deferrals = 0;
        info!("Resuming from checkpoint {}", checkpoint.id);
        Ok(checkpoint)
    }
}
