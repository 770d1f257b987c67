//! Pre-commit and pre-resume checks for checkpoints.
//!
//! Before a checkpoint is committed, the workspace must be in a state worth
//! resuming from: clean tree, passing tests, enough coverage and no task
//! half-way through a turn. Before a checkpoint is resumed, everything it
//! references must still exist, the branch must match and it must not be
//! stale.

use crate::checkpoint::model::{CheckResult, Checkpoint, VerificationResult};
use crate::error::{RelayError, Result};
use crate::memory::artifacts::ArtifactStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::debug;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkspaceStatus {
    pub tree_clean: bool,
    pub tests_passing: bool,
    /// Line coverage in `[0, 1]`, if measured.
    pub coverage: Option<f64>,
    pub branch: Option<String>,
}

impl WorkspaceStatus {
    pub fn clean() -> Self {
        Self {
            tree_clean: true,
            tests_passing: true,
            coverage: None,
            branch: None,
        }
    }
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<WorkspaceStatus>> + Send + 'a>>;

/// Reports the state of the workspace the agent edits.
pub trait WorkspaceProbe: Send + Sync {
    fn status(&self) -> ProbeFuture<'_>;
}

/// Probe returning a settable fixed status.
#[derive(Debug)]
pub struct StaticProbe {
    status: Mutex<WorkspaceStatus>,
}

impl StaticProbe {
    pub fn new(status: WorkspaceStatus) -> Self {
        Self {
            status: Mutex::new(status),
        }
    }

    pub fn set(&self, status: WorkspaceStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

impl Default for StaticProbe {
    fn default() -> Self {
        Self::new(WorkspaceStatus::clean())
    }
}

impl WorkspaceProbe for StaticProbe {
    fn status(&self) -> ProbeFuture<'_> {
        let status = self.status.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Box::pin(async move { Ok(status) })
    }
}

/// Probe backed by `git` in a working directory. Tests are run only when a
/// test command is configured; otherwise they count as passing.
#[derive(Debug, Clone)]
pub struct GitProbe {
    workdir: PathBuf,
    test_command: Option<String>,
}

impl GitProbe {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            test_command: None,
        }
    }

    /// Shell command (`sh -c`) whose exit status decides `tests_passing`.
    pub fn with_test_command(mut self, command: impl Into<String>) -> Self {
        self.test_command = Some(command.into());
        self
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await?;
        if !output.status.success() {
            return Err(RelayError::Agent(format!(
                "git {} failed ({}): {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl WorkspaceProbe for GitProbe {
    fn status(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            let tree_clean = self.git(&["status", "--porcelain"]).await?.is_empty();
            let branch = self
                .git(&["rev-parse", "--abbrev-ref", "HEAD"])
                .await
                .ok()
                .filter(|b| !b.is_empty() && b != "HEAD");
            let tests_passing = match &self.test_command {
                Some(command) => {
                    let status = Command::new("sh")
                        .arg("-c")
                        .arg(command)
                        .current_dir(&self.workdir)
                        .output()
                        .await?
                        .status;
                    debug!("Test command `{command}` exited with {status}");
                    status.success()
                }
                None => true,
            };
            Ok(WorkspaceStatus {
                tree_clean,
                tests_passing,
                coverage: None,
                branch,
            })
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VerifierConfig {
    /// Required coverage when the probe reports one.
    pub min_coverage: f64,
    /// Checkpoints older than this are not resumed.
    pub max_age_hours: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            min_coverage: 0.0,
            max_age_hours: 168,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointVerifier {
    config: VerifierConfig,
}

impl CheckpointVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// Checks run before committing. `mid_task` is set while an agent turn
    /// is in flight.
    pub fn pre_check(&self, status: &WorkspaceStatus, mid_task: bool) -> VerificationResult {
        let mut checks = vec![
            CheckResult::new(
                "tree_clean",
                status.tree_clean,
                if status.tree_clean { "clean" } else { "uncommitted changes" },
            ),
            CheckResult::new(
                "tests_passing",
                status.tests_passing,
                if status.tests_passing { "passing" } else { "failing" },
            ),
            CheckResult::new(
                "not_mid_task",
                !mid_task,
                if mid_task { "turn in progress" } else { "between turns" },
            ),
        ];
        if let Some(coverage) = status.coverage {
            checks.push(CheckResult::new(
                "coverage",
                coverage >= self.config.min_coverage,
                format!(
                    "{:.1}% (min {:.1}%)",
                    coverage * 100.0,
                    self.config.min_coverage * 100.0
                ),
            ));
        }
        VerificationResult::from_checks(checks)
    }

    /// Checks run before resuming. `current_branch` is the workspace branch
    /// now.
    pub fn post_check(
        &self,
        checkpoint: &Checkpoint,
        artifacts: &ArtifactStore,
        current_branch: Option<&str>,
    ) -> VerificationResult {
        let state = &checkpoint.context_snapshot;
        let mut missing: Vec<String> = state
            .artifacts
            .iter()
            .filter(|id| !artifacts.exists(id))
            .cloned()
            .collect();
        missing.extend(
            state
                .episodic
                .iter()
                .filter(|d| d.version > 0 && !d.path.exists())
                .map(|d| d.path.display().to_string()),
        );
        if state.session.operation_count > 0 && !state.session.operations_path.exists() {
            missing.push(state.session.operations_path.display().to_string());
        }
        let files = CheckResult::new(
            "files_exist",
            missing.is_empty(),
            if missing.is_empty() {
                "all referenced files present".to_string()
            } else {
                format!("missing: {}", missing.join(", "))
            },
        );

        let branch_ok = match (&checkpoint.branch, current_branch) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        };
        let branch = CheckResult::new(
            "branch_matches",
            branch_ok,
            format!(
                "checkpoint {:?}, workspace {:?}",
                checkpoint.branch.as_deref(),
                current_branch
            ),
        );

        let age = Utc::now().signed_duration_since(checkpoint.created_at);
        let max_age = chrono::Duration::hours(self.config.max_age_hours as i64);
        let age_check = CheckResult::new(
            "age",
            age < max_age,
            format!("{}h old (max {}h)", age.num_hours(), self.config.max_age_hours),
        );

        VerificationResult::from_checks(vec![files, branch, age_check])
    }
}
