//! The orchestrator: turn loop, operation pipeline and self-handoff.
//!
//! [`OrchestratorEngine::run_task`] drives one task through agent turns:
//!
//! ```text
//! ┌──────────────┐  prompt   ┌───────────┐  response  ┌────────────┐
//! │ memory tiers │ ────────▶ │   agent   │ ─────────▶ │ validator  │
//! └──────────────┘           └───────────┘            └────────────┘
//!        ▲                                                  │
//!        │ record_operation                                 ▼
//!        └─────────────────────────────────────────── DecisionEngine
//! ```
//!
//! Every operation goes through [`record_operation`](OrchestratorEngine::record_operation):
//! session memory first (durable), then working memory, the live context
//! snapshot and finally the window tally. Crossing into yellow runs an
//! optimization pass; the threshold, time and operation-count triggers
//! create checkpoints; reaching red performs a self-handoff:
//!
//! ```text
//! Running ──red──▶ Checkpointing ──forced checkpoint──▶ Restarting ──reload──▶ Running
//! ```
//!
//! A self-handoff discards all in-memory state, reloads it from the
//! checkpoint just written and restarts the agent conversation. The window
//! restarts at the rehydration cost. At most `max_handoffs_per_session`
//! handoffs happen per session.

use crate::agent::collaborators::{
    AgentResponse, Collaborators, ConfidenceSignals, Deliverables, Task, TaskStatus,
};
use crate::agent::config::OrchestratorConfig;
use crate::agent::decision::{Action, Decision, DecisionEngine, DecisionSignals};
use crate::agent::events::{EventHandler, EventResponse, NoopHandler, OrchestratorEvent};
use crate::agent::prompt::{Keep, PromptBuilder};
use crate::agent::turns::TurnBudget;
use crate::checkpoint::manager::{CheckpointDraft, CheckpointManager, CheckpointOutcome};
use crate::checkpoint::model::{Checkpoint, CheckpointState, CheckpointTrigger, TaskProgress};
use crate::checkpoint::verifier::WorkspaceProbe;
use crate::context::adaptive::{AdaptiveOptimizer, OptimizationProfile};
use crate::context::operation::{Operation, OperationKind};
use crate::context::optimizer::ContextOptimizer;
use crate::context::snapshot::ContextSnapshot;
use crate::context::summarizer::Summarizer;
use crate::context::tokens::TokenEstimator;
use crate::context::window::{ContextWindowManager, RecommendedAction, WindowSnapshot, Zone};
use crate::context::working::WorkingMemory;
use crate::error::{RelayError, Result};
use crate::memory::artifacts::ArtifactStore;
use crate::memory::document::VersionStore;
use crate::memory::episodic::{EpisodicDoc, EpisodicMemoryManager};
use crate::memory::session::{ArchivedSession, SessionMemoryManager};
use crate::persist::generate_id;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Operations shown verbatim in each turn prompt.
const PROMPT_RECENT_OPS: usize = 20;

/// Characters of an agent response kept as its operation summary.
const RESPONSE_SUMMARY_CHARS: usize = 160;

// ── Outcomes and phases ────────────────────────────────────────────

/// How a task run ended, short of an error.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The decision engine accepted a turn.
    Completed { task_id: String, turns: u32 },
    /// Turns ran out but the assessor found validated deliverables.
    SuccessWithLimits {
        task_id: String,
        turns: u32,
        deliverables: Deliverables,
    },
    /// The engine asked for guidance and nobody answered. The task is
    /// blocked.
    NeedsClarification {
        task_id: String,
        turn: u32,
        reason: String,
    },
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Completed { .. } => "success",
            TaskOutcome::SuccessWithLimits { .. } => "success_with_limits",
            TaskOutcome::NeedsClarification { .. } => "needs_clarification",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskOutcome::Completed { task_id, .. }
            | TaskOutcome::SuccessWithLimits { task_id, .. }
            | TaskOutcome::NeedsClarification { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Running,
    Checkpointing,
    Restarting,
}

/// Session-scoped mutable state. Owned by the engine, never shared.
#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    handoffs: u32,
    ops_since_checkpoint: u64,
    last_checkpoint_at: Instant,
    in_turn: bool,
    /// Red was reached during a turn; hand off at the turn boundary.
    handoff_pending: bool,
    optimized_this_cycle: bool,
    last_zone: Zone,
    progress: TaskProgress,
    /// Resume instructions for the first prompt after a reload.
    resume_note: Option<String>,
    stop_requested: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Running,
            handoffs: 0,
            ops_since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
            in_turn: false,
            handoff_pending: false,
            optimized_this_cycle: false,
            last_zone: Zone::Green,
            progress: TaskProgress::default(),
            resume_note: None,
            stop_requested: false,
        }
    }
}

type StopSignal = Box<dyn Fn() -> bool + Send + Sync>;

// ── Engine ─────────────────────────────────────────────────────────

pub struct OrchestratorEngine {
    config: OrchestratorConfig,
    session_id: String,
    estimator: TokenEstimator,
    collaborators: Collaborators,
    profile: OptimizationProfile,
    window: ContextWindowManager,
    working: WorkingMemory,
    context: Mutex<ContextSnapshot>,
    optimizer: Option<ContextOptimizer>,
    artifacts: ArtifactStore,
    session: SessionMemoryManager,
    episodic: EpisodicMemoryManager,
    checkpoints: CheckpointManager,
    decisions: DecisionEngine,
    state: Mutex<SessionState>,
    events: Box<dyn EventHandler>,
    stop: Option<StopSignal>,
}

impl OrchestratorEngine {
    /// Start a new session.
    pub fn open(
        config: OrchestratorConfig,
        collaborators: Collaborators,
        probe: Arc<dyn WorkspaceProbe>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self> {
        Self::build(config, collaborators, probe, summarizer, generate_id("session"))
    }

    /// Continue the session captured by `checkpoint_id`. Fails with
    /// [`RelayError::ResumeIntegrityFailure`] if the checkpoint does not
    /// pass its post-check.
    pub async fn resume(
        config: OrchestratorConfig,
        collaborators: Collaborators,
        probe: Arc<dyn WorkspaceProbe>,
        summarizer: Arc<dyn Summarizer>,
        checkpoint_id: &str,
    ) -> Result<Self> {
        let checkpoints_dir = config.checkpoints_dir();
        let session_id = crate::persist::read_json::<Checkpoint>(
            &checkpoints_dir.join(format!("{checkpoint_id}.json")),
        )
        .map_err(|e| RelayError::ResumeIntegrityFailure {
            checkpoint_id: checkpoint_id.to_string(),
            reason: e.to_string(),
        })?
        .session_id;

        let engine = Self::build(config, collaborators, probe, summarizer, session_id)?;
        let checkpoint = engine.checkpoints.resume_from_checkpoint(checkpoint_id).await?;
        let tokens = engine.rehydrate(&checkpoint);
        info!(
            "Session {} resumed from {} ({tokens} tokens rehydrated)",
            engine.session_id, checkpoint.id
        );
        Ok(engine)
    }

    fn build(
        config: OrchestratorConfig,
        collaborators: Collaborators,
        probe: Arc<dyn WorkspaceProbe>,
        summarizer: Arc<dyn Summarizer>,
        session_id: String,
    ) -> Result<Self> {
        config.validate()?;
        let estimator = TokenEstimator::with_calibration(config.chars_per_token);
        let memory_dir = config.memory_dir();
        let artifacts = ArtifactStore::open(memory_dir.join("artifacts"))?;
        let versions = VersionStore::open(memory_dir.join("versions"), config.version_retention)?;

        let profile = AdaptiveOptimizer::new()
            .with_override(config.profile_override.clone())
            .select_profile(config.context_window);
        let window = ContextWindowManager::with_thresholds(
            config.context_window,
            config.utilization_limit,
            config.zones,
        )?;
        let working = WorkingMemory::for_context(config.context_window, &config.working_memory);
        let optimizer = config.optimizer.enabled.then(|| {
            ContextOptimizer::new(
                config.optimizer.config.clone(),
                estimator,
                artifacts.clone(),
                summarizer.clone(),
            )
            .with_window(config.context_window)
            .with_summarization_trigger(profile.summarization_trigger_tokens)
        });

        let session = SessionMemoryManager::open(
            &memory_dir,
            session_id.clone(),
            versions.clone(),
            summarizer.clone(),
            estimator,
            config.session_memory.clone(),
        )?;
        let episodic = EpisodicMemoryManager::open(
            &memory_dir,
            versions,
            summarizer,
            estimator,
            config.episodic_memory.clone(),
        )?;
        let checkpoints = CheckpointManager::open(
            config.checkpoints_dir(),
            config.checkpoint.clone(),
            config.zones,
            profile.clone(),
            probe,
            artifacts.clone(),
        )?;

        let capacity = working.capacity();
        info!(
            "Session {session_id}: {} tokens x {} ({} profile), working memory {} ops / {} tokens",
            config.context_window,
            config.utilization_limit,
            profile.name,
            capacity.max_operations,
            capacity.max_tokens,
        );

        Ok(Self {
            decisions: DecisionEngine::new(config.decision.clone()),
            config,
            session_id,
            estimator,
            collaborators,
            profile,
            window,
            working,
            context: Mutex::new(ContextSnapshot::new()),
            optimizer,
            artifacts,
            session,
            episodic,
            checkpoints,
            state: Mutex::new(SessionState::new()),
            events: Box::new(NoopHandler),
            stop: None,
        })
    }

    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events = Box::new(handler);
        self
    }

    /// Cancellation signal, polled at turn and checkpoint boundaries.
    pub fn with_stop_signal(mut self, stop: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.stop = Some(Box::new(stop));
        self
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn profile(&self) -> &OptimizationProfile {
        &self.profile
    }

    pub fn window(&self) -> WindowSnapshot {
        self.window.snapshot()
    }

    pub fn working_memory(&self) -> &WorkingMemory {
        &self.working
    }

    pub fn session_memory(&self) -> &SessionMemoryManager {
        &self.session
    }

    pub fn episodic_memory(&self) -> &EpisodicMemoryManager {
        &self.episodic
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn context_snapshot(&self) -> ContextSnapshot {
        self.context().clone()
    }

    pub fn handoffs(&self) -> u32 {
        self.state().handoffs
    }

    pub fn phase(&self) -> SessionPhase {
        self.state().phase
    }

    pub fn progress(&self) -> TaskProgress {
        self.state().progress.clone()
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn context(&self) -> MutexGuard<'_, ContextSnapshot> {
        self.context.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.state().phase = phase;
    }

    fn emit(&self, event: OrchestratorEvent<'_>) -> Option<EventResponse> {
        let response = self.events.on_event(&event);
        if response == Some(EventResponse::Stop) {
            self.state().stop_requested = true;
        }
        response
    }

    fn check_stop(&self) -> Result<()> {
        let requested = self.state().stop_requested || self.stop.as_ref().is_some_and(|s| s());
        if requested {
            info!("Session {} cancelled", self.session_id);
            return Err(RelayError::Cancelled {
                last_checkpoint: self.checkpoints.last_checkpoint_id(),
            });
        }
        Ok(())
    }

    /// Conversation id for the agent. Changes on every self-handoff so the
    /// agent starts from a clean history.
    fn agent_session_ref(&self) -> String {
        match self.state().handoffs {
            0 => self.session_id.clone(),
            n => format!("{}-h{n}", self.session_id),
        }
    }

    fn prompt_budget(&self) -> usize {
        let effective = self.window.snapshot().effective_max;
        ((effective as f64 * self.config.prompt_budget_fraction) as usize).max(1)
    }

    // ── Operation pipeline ─────────────────────────────────────────

    /// Feed one operation through every memory tier, then run the
    /// optimization, checkpoint and handoff checks it may trigger.
    ///
    /// Context items of operations evicted from working memory are released
    /// after the optimization pass. While a turn is in flight, checkpoint
    /// evaluation and handoffs wait for the turn boundary.
    pub async fn record_operation(&self, op: Operation) -> Result<()> {
        self.session.record(&op).await?;
        let evicted = self.working.add(op.clone());
        self.context().push_operation(&op, &self.estimator);
        let update = self.window.add_usage(op.tokens);

        let (in_turn, optimize) = {
            let mut state = self.state();
            state.ops_since_checkpoint += 1;
            let optimize = update.overflow
                || (self.window.recommended_action() == RecommendedAction::Optimize
                    && !state.optimized_this_cycle);
            if optimize {
                state.optimized_this_cycle = true;
            }
            (state.in_turn, optimize)
        };
        self.note_zone(update.zone);

        if update.overflow {
            let available = self.window.snapshot().effective_max;
            warn!(
                "{}",
                RelayError::ContextOverflow {
                    requested: update.used_tokens + update.clamped_tokens,
                    available,
                }
            );
        }
        let optimized = if optimize {
            self.optimize_context().await
        } else {
            Ok(())
        };
        if !evicted.is_empty() {
            let released = self.context().release_operations(&evicted);
            debug!(
                "Working memory evicted {} operation(s), {released} context item(s) released",
                evicted.len()
            );
        }
        optimized?;

        if update.zone == Zone::Red {
            if in_turn {
                self.state().handoff_pending = true;
            } else {
                self.self_handoff().await?;
            }
            return Ok(());
        }
        if !in_turn {
            self.maybe_checkpoint().await?;
        }
        Ok(())
    }

    fn note_zone(&self, zone: Zone) {
        let previous = {
            let mut state = self.state();
            std::mem::replace(&mut state.last_zone, zone)
        };
        if previous != zone {
            self.emit(OrchestratorEvent::ZoneChanged {
                from: previous,
                to: zone,
                usage_pct: self.window.usage_pct(),
            });
        }
    }

    /// Run one optimization pass over the live context snapshot.
    async fn optimize_context(&self) -> Result<()> {
        let Some(optimizer) = &self.optimizer else {
            return Ok(());
        };
        let snapshot = self.context().clone();
        let result = optimizer
            .optimize(&snapshot, self.profile.target_reduction)
            .await?;
        self.emit(OrchestratorEvent::Optimized {
            tokens_before: result.tokens_before,
            tokens_after: result.tokens_after,
            no_op: result.no_op,
        });
        if !result.no_op {
            let mut context = self.context();
            // Keep anything recorded while the pass was running.
            let appended: Vec<_> = context
                .items
                .iter()
                .skip(snapshot.items.len())
                .cloned()
                .collect();
            *context = result.snapshot;
            context.items.extend(appended);
        }
        Ok(())
    }

    // ── Checkpoints ────────────────────────────────────────────────

    /// State blob the next checkpoint diffs against.
    fn state_blob(&self, progress: &TaskProgress, handoffs: u32) -> serde_json::Value {
        serde_json::json!({
            "session_id": self.session_id,
            "handoffs": handoffs,
            "task_id": progress.task_id,
            "turn": progress.turn,
            "files_changed": progress.files_changed,
        })
    }

    fn resume_instructions(&self, progress: &TaskProgress, handoffs: u32) -> String {
        let budget = self.prompt_budget() / 2;
        let recent_decisions = self
            .episodic
            .excerpt(EpisodicDoc::DecisionLog, budget / 4);
        PromptBuilder::new(
            format!(
                "Resuming session {} after context reload #{handoffs}. Earlier work is \
                 summarized below; continue from where it stopped.",
                self.session_id
            ),
            self.estimator,
        )
        .section_opt(
            "Task",
            progress
                .task_id
                .as_ref()
                .map(|id| format!("{id}: turn {} of {}", progress.turn, progress.max_turns)),
        )
        .section_if(!progress.files_changed.is_empty(), "Files changed", || {
            progress
                .files_changed
                .iter()
                .map(|f| format!("- {f}"))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .section_opt("Pending feedback", progress.feedback.clone())
        .trimmable("Recent decisions", recent_decisions, Keep::Tail)
        .trimmable("Session so far", self.session.tail(budget / 2), Keep::Tail)
        .build(budget)
    }

    fn draft(&self) -> CheckpointDraft {
        let (progress, handoffs) = {
            let state = self.state();
            (state.progress.clone(), state.handoffs)
        };
        let blob = self.state_blob(&progress, handoffs);
        let context = {
            let mut context = self.context();
            context.set_state(blob.clone(), &self.estimator);
            context.clone()
        };
        let artifacts = context.artifact_refs();
        CheckpointDraft {
            session_id: self.session_id.clone(),
            task_id: progress.task_id.clone(),
            resume_instructions: self.resume_instructions(&progress, handoffs),
            state: CheckpointState {
                working_memory: self.working.snapshot(),
                context,
                window: self.window.snapshot(),
                session: self.session.reference(),
                episodic: self.episodic.references(),
                artifacts,
                progress,
                state: blob,
            },
        }
    }

    fn after_commit(&self, checkpoint: &Checkpoint) {
        {
            let mut state = self.state();
            state.ops_since_checkpoint = 0;
            state.last_checkpoint_at = Instant::now();
        }
        self.context()
            .set_baseline(checkpoint.id.clone(), checkpoint.context_snapshot.state.clone());
        self.emit(OrchestratorEvent::CheckpointCommitted {
            checkpoint_id: &checkpoint.id,
            trigger: &checkpoint.trigger,
            verified: checkpoint.verification_result.verified,
        });
    }

    /// Evaluate checkpoint triggers and try to commit. A deferred checkpoint
    /// stays pending and is retried on the next evaluation.
    async fn maybe_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let (since, ops, mid_task) = {
            let state = self.state();
            (
                state.last_checkpoint_at.elapsed(),
                state.ops_since_checkpoint,
                state.in_turn,
            )
        };
        let Some(trigger) = self
            .checkpoints
            .should_checkpoint(self.window.usage_pct(), since, ops)
        else {
            return Ok(None);
        };
        self.create_checkpoint(trigger, mid_task).await
    }

    async fn create_checkpoint(
        &self,
        trigger: CheckpointTrigger,
        mid_task: bool,
    ) -> Result<Option<Checkpoint>> {
        self.set_phase(SessionPhase::Checkpointing);
        let draft = self.draft();
        let outcome = self.checkpoints.create_checkpoint(trigger, draft, mid_task).await;
        self.set_phase(SessionPhase::Running);
        match outcome? {
            CheckpointOutcome::Committed(checkpoint) => {
                self.after_commit(&checkpoint);
                Ok(Some(*checkpoint))
            }
            CheckpointOutcome::Deferred { deferrals, reason } => {
                debug!("{}", RelayError::CheckpointVerificationFailure(reason.clone()));
                self.emit(OrchestratorEvent::CheckpointDeferred {
                    deferrals,
                    reason: &reason,
                });
                Ok(None)
            }
        }
    }

    /// Checkpoint on request. Subject to the same verification and
    /// deferral rules as automatic checkpoints.
    pub async fn checkpoint_now(&self) -> Result<Option<Checkpoint>> {
        let mid_task = self.state().in_turn;
        self.create_checkpoint(CheckpointTrigger::Manual, mid_task).await
    }

    // ── Self-handoff ───────────────────────────────────────────────

    /// Force a checkpoint, drop every in-memory tier and reload from it.
    pub async fn self_handoff(&self) -> Result<Checkpoint> {
        let usage_pct = self.window.usage_pct();
        let handoff = {
            let mut state = self.state();
            if state.handoffs >= self.config.max_handoffs_per_session {
                drop(state);
                warn!(
                    "Context reached red but the self-handoff limit ({}) is spent",
                    self.config.max_handoffs_per_session
                );
                return Err(RelayError::HandoffLimitExceeded {
                    limit: self.config.max_handoffs_per_session,
                    last_checkpoint: self.checkpoints.last_checkpoint_id(),
                });
            }
            state.phase = SessionPhase::Checkpointing;
            state.handoff_pending = false;
            state.handoffs + 1
        };
        self.emit(OrchestratorEvent::HandoffStarted { handoff, usage_pct });

        let draft = self.draft();
        let written = match self
            .checkpoints
            .force_checkpoint(CheckpointTrigger::Handoff, draft)
            .await
        {
            Ok(cp) => cp,
            Err(e) => {
                self.set_phase(SessionPhase::Running);
                return Err(e);
            }
        };
        self.after_commit(&written);

        self.set_phase(SessionPhase::Restarting);
        self.working.clear();
        *self.context() = ContextSnapshot::new();
        self.window.reset();
        self.checkpoints.reset_cycle();

        let checkpoint = self.checkpoints.resume_from_checkpoint(&written.id).await?;
        self.state().handoffs = handoff;
        let rehydrated_tokens = self.rehydrate(&checkpoint);

        self.emit(OrchestratorEvent::HandoffCompleted {
            handoff,
            checkpoint_id: &checkpoint.id,
            rehydrated_tokens,
        });
        info!(
            "Self-handoff #{handoff} complete: {} ({rehydrated_tokens} tokens rehydrated)",
            checkpoint.id
        );
        Ok(checkpoint)
    }

    /// Rebuild in-memory state from a checkpoint. Returns the window usage
    /// after reload.
    fn rehydrate(&self, checkpoint: &Checkpoint) -> usize {
        let saved = &checkpoint.context_snapshot;
        self.working.restore(saved.working_memory.clone());
        {
            let mut context = self.context();
            *context = saved.context.clone();
            context.set_baseline(checkpoint.id.clone(), saved.state.clone());
        }
        self.window.reset();
        let tokens = checkpoint.rehydration_tokens(&self.estimator);
        let update = self.window.add_usage(tokens);
        {
            let mut state = self.state();
            state.progress = saved.progress.clone();
            state.ops_since_checkpoint = 0;
            state.last_checkpoint_at = Instant::now();
            state.optimized_this_cycle = false;
            state.last_zone = update.zone;
            state.resume_note = Some(checkpoint.resume_instructions.clone());
            state.phase = SessionPhase::Running;
        }
        tokens
    }

    // ── Turn boundaries ────────────────────────────────────────────

    fn begin_turn(&self, task_id: &str, turn: u32, max_turns: u32) {
        let mut state = self.state();
        state.in_turn = true;
        state.progress.task_id = Some(task_id.to_string());
        state.progress.turn = turn;
        state.progress.max_turns = max_turns;
    }

    /// Leave the turn: hand off if red was reached, otherwise evaluate
    /// checkpoint triggers.
    async fn end_turn(&self) -> Result<()> {
        let pending = {
            let mut state = self.state();
            state.in_turn = false;
            state.handoff_pending
        };
        if pending {
            self.self_handoff().await?;
        } else {
            self.maybe_checkpoint().await?;
        }
        self.check_stop()
    }

    async fn record(&self, kind: OperationKind, summary: impl Into<String>, tokens: Option<usize>) -> Result<()> {
        let mut op = Operation::new(kind, summary, &self.estimator);
        if let Some(t) = tokens {
            op = op.with_tokens(t);
        }
        self.record_operation(op).await
    }

    // ── Task loop ──────────────────────────────────────────────────

    fn build_prompt(&self, task: &Task, turn: u32, max_turns: u32) -> String {
        let budget = self.prompt_budget();
        let (feedback, resume_note) = {
            let mut state = self.state();
            (state.progress.feedback.clone(), state.resume_note.take())
        };
        let recent = self
            .working
            .recent(PROMPT_RECENT_OPS)
            .iter()
            .map(Operation::to_line)
            .collect::<Vec<_>>()
            .join("\n");

        PromptBuilder::new(
            format!("Turn {turn} of {max_turns}. Do the next piece of work on the task below."),
            self.estimator,
        )
        .section(
            "Task",
            format!(
                "{} [{:?}]: {}\n\n{}",
                task.id, task.task_type, task.title, task.description
            ),
        )
        .section_opt("Resume instructions", resume_note)
        .section_opt("Feedback", feedback)
        .trimmable(
            "Project state",
            self.episodic.excerpt(EpisodicDoc::ProjectState, budget / 4),
            Keep::Head,
        )
        .trimmable(
            "Work plan",
            self.episodic.excerpt(EpisodicDoc::WorkPlan, budget / 4),
            Keep::Head,
        )
        .trimmable("Recent operations", recent, Keep::Tail)
        .trimmable("Session so far", self.session.tail(budget / 4), Keep::Tail)
        .build(budget)
    }

    async fn call_agent(&self, prompt: &str, turn: u32) -> Result<AgentResponse> {
        let session_ref = self.agent_session_ref();
        let timeout = self.config.agent_timeout();
        match tokio::time::timeout(timeout, self.collaborators.agent.send(prompt, &session_ref)).await
        {
            Ok(result) => result,
            Err(_) => {
                self.emit(OrchestratorEvent::AgentTimedOut {
                    turn,
                    timeout_secs: self.config.agent_timeout_secs,
                });
                Err(RelayError::AgentTimeout {
                    timeout_secs: self.config.agent_timeout_secs,
                })
            }
        }
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus, meta: &[(&str, String)]) -> Result<()> {
        let metadata: HashMap<String, String> = meta
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.collaborators
            .tasks
            .update_task_status(task_id, status, metadata)
            .await
    }

    fn set_feedback(&self, feedback: Option<String>) {
        self.state().progress.feedback = feedback;
    }

    /// Drive `task_id` to a terminal state.
    ///
    /// Returns an outcome for completion, success with limits and blocked
    /// clarification. Escalation, turn exhaustion without deliverables,
    /// an exhausted handoff budget and cancellation surface as errors that
    /// carry the last good checkpoint. Once the task is marked running,
    /// every error leaves it in a terminal status with an `outcome`.
    pub async fn run_task(&self, task_id: &str) -> Result<TaskOutcome> {
        let task = self.collaborators.tasks.get_task(task_id).await?;
        let budget = TurnBudget::for_task(&task, &self.config.turns);
        self.decisions.reset();

        // A resumed session continues the task it was checkpointed in.
        let start_turn = {
            let mut state = self.state();
            if state.progress.task_id.as_deref() == Some(task_id) {
                state.progress.turn + 1
            } else {
                state.progress = TaskProgress {
                    task_id: Some(task_id.to_string()),
                    max_turns: budget.current_max,
                    ..TaskProgress::default()
                };
                1
            }
        };

        self.set_status(task_id, TaskStatus::Running, &[]).await?;
        self.emit(OrchestratorEvent::TaskStarted {
            task_id,
            max_turns: budget.current_max,
        });

        match self.turn_loop(&task, budget, start_turn).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.abort_task(task_id, e).await),
        }
    }

    async fn turn_loop(&self, task: &Task, mut budget: TurnBudget, start_turn: u32) -> Result<TaskOutcome> {
        let task_id = task.id.as_str();
        let mut turn = start_turn;
        loop {
            self.check_stop()?;
            if !budget.allows(turn) {
                return self.finish_exhausted(task, turn - 1).await;
            }

            let window = self.window.snapshot();
            self.emit(OrchestratorEvent::TurnStart {
                task_id,
                turn,
                max_turns: budget.current_max,
                window: &window,
            });
            self.begin_turn(task_id, turn, budget.current_max);

            let prompt = self.build_prompt(task, turn, budget.current_max);
            let prompt_tokens = self.estimator.estimate(&prompt);
            self.record(
                OperationKind::TaskStep,
                format!("turn {turn}/{}: {}", budget.current_max, task.title),
                Some(prompt_tokens),
            )
            .await?;

            let response = match self.call_agent(&prompt, turn).await {
                Ok(response) => response,
                Err(e) if e.is_retryable() => {
                    warn!("Turn {turn} of {task_id} failed, retrying: {e}");
                    self.record(OperationKind::Error, format!("ISSUE: turn {turn}: {e}"), None)
                        .await?;
                    self.set_feedback(Some(format!("The previous attempt failed: {e}")));
                    self.end_turn().await?;
                    turn += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let decision = self.assess_turn(task, turn, budget.current_max, &response).await?;
            self.end_turn().await?;

            match decision.action {
                Action::Proceed => {
                    self.context().complete_phase();
                    self.episodic
                        .append(
                            EpisodicDoc::ProjectState,
                            &format!("- DONE: {} {} ({turn} turn(s))", task.id, task.title),
                        )
                        .await?;
                    self.set_status(
                        task_id,
                        TaskStatus::Completed,
                        &[("outcome", "success".into()), ("turns", turn.to_string())],
                    )
                    .await?;
                    return Ok(self.finish(TaskOutcome::Completed {
                        task_id: task_id.to_string(),
                        turns: turn,
                    }));
                }
                Action::Retry => {
                    if !budget.allows(turn + 1)
                        && let Some(max_turns) = budget.request_extension()
                    {
                        self.state().progress.max_turns = max_turns;
                        self.emit(OrchestratorEvent::TurnBudgetExtended { task_id, max_turns });
                    }
                }
                Action::Clarify => {
                    let response = self.emit(OrchestratorEvent::ClarificationRequested {
                        task_id,
                        turn,
                        reason: &decision.reason,
                    });
                    match response {
                        Some(EventResponse::InjectGuidance(guidance)) => {
                            self.record(OperationKind::Command, format!("guidance: {guidance}"), None)
                                .await?;
                            self.set_feedback(Some(format!("Guidance from the operator: {guidance}")));
                        }
                        _ => {
                            self.set_status(
                                task_id,
                                TaskStatus::Blocked,
                                &[
                                    ("outcome", "needs_clarification".into()),
                                    ("reason", decision.reason.clone()),
                                ],
                            )
                            .await?;
                            return Ok(self.finish(TaskOutcome::NeedsClarification {
                                task_id: task_id.to_string(),
                                turn,
                                reason: decision.reason,
                            }));
                        }
                    }
                }
                Action::Escalate => {
                    return Err(RelayError::Escalated {
                        task_id: task_id.to_string(),
                        turn,
                        reason: decision.reason,
                        last_checkpoint: self.checkpoints.last_checkpoint_id(),
                    });
                }
            }
            turn += 1;
        }
    }

    /// Record the response, validate it and decide.
    async fn assess_turn(
        &self,
        task: &Task,
        turn: u32,
        max_turns: u32,
        response: &AgentResponse,
    ) -> Result<Decision> {
        let payload_ref = self.artifacts.store(&response.content)?;
        let response_tokens = response
            .tokens_used
            .unwrap_or_else(|| self.estimator.estimate(&response.content));
        let first_line = response.content.lines().next().unwrap_or_default();
        let summary: String = first_line.chars().take(RESPONSE_SUMMARY_CHARS).collect();
        self.emit(OrchestratorEvent::AgentResponded {
            turn,
            content: &response.content,
            files_changed: response.files_changed.len(),
        });
        self.record_operation(
            Operation::new(OperationKind::AgentResponse, summary, &self.estimator)
                .with_payload_ref(payload_ref)
                .with_tokens(response_tokens),
        )
        .await?;

        for change in &response.files_changed {
            {
                let mut state = self.state();
                if !state.progress.files_changed.contains(&change.path) {
                    state.progress.files_changed.push(change.path.clone());
                }
            }
            let op = Operation::new(OperationKind::FileChange, change.path.clone(), &self.estimator);
            if let Some(content) = &change.content {
                self.context().push_file_change(
                    &op,
                    content.clone(),
                    chrono::Utc::now(),
                    &self.estimator,
                );
            }
            self.record_operation(op).await?;
        }

        let quality = self.collaborators.validator.score_quality(response).await?;
        let validation = self.collaborators.validator.validate(response).await?;
        let issues = validation.issues.join("; ");
        let validation_line = if validation.passed {
            format!("passed (score {:.2})", validation.score)
        } else {
            format!("ISSUE: validation failed (score {:.2}): {issues}", validation.score)
        };
        self.record(OperationKind::Validation, validation_line, None).await?;
        if validation.passed {
            self.context().resolve_errors();
        } else {
            debug!("Turn {turn}: {}", RelayError::ValidationFailure(issues.clone()));
        }

        let operation_confidence = self
            .collaborators
            .validator
            .score_confidence(&ConfidenceSignals {
                turn,
                max_turns,
                response_tokens,
                files_changed: response.files_changed.len(),
                validation_passed: validation.passed,
                issue_count: validation.issues.len(),
            })
            .await?;

        let decision = self.decisions.decide(
            &task.id,
            turn,
            &DecisionSignals {
                operation_confidence,
                quality,
                validation_score: validation.score,
                validation_passed: validation.passed,
                fatal: validation.fatal,
            },
        );
        self.emit(OrchestratorEvent::Decision {
            task_id: &task.id,
            turn,
            decision: &decision,
        });

        let decision_line = match &decision.record {
            Some(record) => format!(
                "DECISION: {} (confidence {:.2})",
                record.decision, record.confidence
            ),
            None => format!("{}: {}", decision.action, decision.reason),
        };
        self.record(OperationKind::Decision, decision_line, None).await?;
        if let Some(record) = &decision.record {
            self.episodic.record_decision(record).await?;
        }

        let feedback = match decision.action {
            Action::Proceed => None,
            _ if !issues.is_empty() => Some(format!("Fix these issues: {issues}")),
            Action::Retry => Some(format!("The last turn was not good enough: {}", decision.reason)),
            _ => None,
        };
        self.set_feedback(feedback);
        Ok(decision)
    }

    /// Turns ran out: success with limits if the assessor finds validated
    /// deliverables, otherwise a surfaced failure.
    async fn finish_exhausted(&self, task: &Task, turns: u32) -> Result<TaskOutcome> {
        let deliverables = self.collaborators.assessor.assess(task).await?;
        let validated = !deliverables.files.is_empty()
            && deliverables.quality >= self.config.deliverable_quality_threshold;
        if validated {
            info!(
                "{} exhausted {turns} turn(s) with {} validated file(s)",
                task.id,
                deliverables.files.len()
            );
            self.set_status(
                &task.id,
                TaskStatus::Completed,
                &[
                    ("outcome", "success_with_limits".into()),
                    ("turns", turns.to_string()),
                    ("files", deliverables.files.join(",")),
                ],
            )
            .await?;
            return Ok(self.finish(TaskOutcome::SuccessWithLimits {
                task_id: task.id.clone(),
                turns,
                deliverables,
            }));
        }

        warn!("{} exhausted {turns} turn(s) without deliverables", task.id);
        Err(RelayError::TurnsExhausted {
            task_id: task.id.clone(),
            turns,
            last_checkpoint: self.checkpoints.last_checkpoint_id(),
        })
    }

    /// Leave the turn loop on an error: clear turn state and record a
    /// terminal status for the task. Returns the error for the caller.
    async fn abort_task(&self, task_id: &str, error: RelayError) -> RelayError {
        {
            let mut state = self.state();
            state.in_turn = false;
            state.handoff_pending = false;
            state.phase = SessionPhase::Running;
        }
        let (status, outcome) = match &error {
            RelayError::Cancelled { .. } => (TaskStatus::Cancelled, "cancelled"),
            RelayError::Escalated { .. } => (TaskStatus::Blocked, "escalated"),
            RelayError::TurnsExhausted { .. } => (TaskStatus::Failed, "turns_exhausted"),
            RelayError::HandoffLimitExceeded { .. } => (TaskStatus::Failed, "handoff_limit_exceeded"),
            _ => (TaskStatus::Failed, "error"),
        };
        let mut meta = vec![("outcome", outcome.to_string())];
        match &error {
            RelayError::Escalated { turn, reason, .. } => {
                meta.push(("reason", reason.clone()));
                meta.push(("turn", turn.to_string()));
            }
            RelayError::TurnsExhausted { turns, .. } => meta.push(("turns", turns.to_string())),
            RelayError::Cancelled { .. } | RelayError::HandoffLimitExceeded { .. } => {}
            other => meta.push(("error", other.to_string())),
        }
        let last_checkpoint = error
            .last_checkpoint()
            .map(str::to_string)
            .or_else(|| self.checkpoints.last_checkpoint_id());
        if let Some(id) = last_checkpoint {
            meta.push(("last_checkpoint", id));
        }

        if let Err(e) = self.set_status(task_id, status, &meta).await {
            warn!("Could not record {outcome} for {task_id}: {e}");
        }
        info!("{task_id} stopped ({outcome}): {error}");
        error
    }

    fn finish(&self, outcome: TaskOutcome) -> TaskOutcome {
        self.emit(OrchestratorEvent::TaskFinished {
            task_id: outcome.task_id(),
            outcome: &outcome,
        });
        outcome
    }

    /// End the session and move its narrative and operation log to the
    /// archive.
    pub fn finish_session(self) -> Result<ArchivedSession> {
        info!(
            "Finishing session {} after {} handoff(s)",
            self.session_id,
            self.handoffs()
        );
        self.session.archive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::collaborators::{
        CodingAgent, CollabFuture, DeliverableAssessor, FileChange, InMemoryTaskStore,
        TaskType, ValidationOutcome, Validator,
    };
    use crate::agent::events::FnEventHandler;
    use crate::checkpoint::verifier::StaticProbe;
    use crate::context::summarizer::ExtractiveSummarizer;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoAgent {
        calls: AtomicU32,
    }

    impl CodingAgent for EchoAgent {
        fn send<'a>(&'a self, _prompt: &'a str, _session_ref: &'a str) -> CollabFuture<'a, AgentResponse> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(AgentResponse {
                    content: format!("wrote module {n}"),
                    files_changed: vec![FileChange {
                        path: format!("src/m{n}.rs"),
                        content: None,
                    }],
                    tokens_used: Some(40),
                })
            })
        }
    }

    /// Reports a response far larger than a small window.
    struct HeavyAgent;

    impl CodingAgent for HeavyAgent {
        fn send<'a>(&'a self, _prompt: &'a str, _session_ref: &'a str) -> CollabFuture<'a, AgentResponse> {
            Box::pin(async move {
                Ok(AgentResponse {
                    content: "regenerated the fixtures".into(),
                    files_changed: Vec::new(),
                    tokens_used: Some(5_000),
                })
            })
        }
    }

    struct BrokenAgent;

    impl CodingAgent for BrokenAgent {
        fn send<'a>(&'a self, _prompt: &'a str, _session_ref: &'a str) -> CollabFuture<'a, AgentResponse> {
            Box::pin(async move { Err(RelayError::NotFound("model relay-coder".into())) })
        }
    }

    struct SlowAgent;

    impl CodingAgent for SlowAgent {
        fn send<'a>(&'a self, _prompt: &'a str, _session_ref: &'a str) -> CollabFuture<'a, AgentResponse> {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(AgentResponse::default())
            })
        }
    }

    /// Validator with fixed scores.
    struct FixedValidator {
        quality: f64,
        passed: bool,
        fatal: bool,
    }

    impl Validator for FixedValidator {
        fn score_quality<'a>(&'a self, _response: &'a AgentResponse) -> CollabFuture<'a, f64> {
            Box::pin(async move { Ok(self.quality) })
        }

        fn validate<'a>(&'a self, _response: &'a AgentResponse) -> CollabFuture<'a, ValidationOutcome> {
            Box::pin(async move {
                let mut outcome = if self.passed {
                    ValidationOutcome::pass(0.9)
                } else {
                    ValidationOutcome::fail(0.9, vec!["missing tests".into()])
                };
                outcome.fatal = self.fatal;
                Ok(outcome)
            })
        }

        fn score_confidence<'a>(&'a self, _signals: &'a ConfidenceSignals) -> CollabFuture<'a, f64> {
            Box::pin(async move { Ok(0.9) })
        }
    }

    struct NoDeliverables;

    impl DeliverableAssessor for NoDeliverables {
        fn assess<'a>(&'a self, _task: &'a Task) -> CollabFuture<'a, Deliverables> {
            Box::pin(async move {
                Ok(Deliverables {
                    outcome: "nothing usable".into(),
                    files: Vec::new(),
                    quality: 0.0,
                })
            })
        }
    }

    fn engine(
        dir: &std::path::Path,
        agent: Arc<dyn CodingAgent>,
        validator: FixedValidator,
        task: Task,
    ) -> (OrchestratorEngine, Arc<InMemoryTaskStore>) {
        let tasks = Arc::new(InMemoryTaskStore::new().with_task(task));
        let collaborators = Collaborators {
            agent,
            validator: Arc::new(validator),
            assessor: Arc::new(NoDeliverables),
            tasks: tasks.clone(),
        };
        let config = OrchestratorConfig::default()
            .with_context_window(32_000)
            .with_data_dir(dir);
        let engine = OrchestratorEngine::open(
            config,
            collaborators,
            Arc::new(StaticProbe::default()),
            Arc::new(ExtractiveSummarizer::new(TokenEstimator::default())),
        )
        .unwrap();
        (engine, tasks)
    }

    fn echo() -> Arc<dyn CodingAgent> {
        Arc::new(EchoAgent {
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn strong_turn_completes_task() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FixedValidator {
            quality: 0.9,
            passed: true,
            fatal: false,
        };
        let (engine, tasks) = engine(
            dir.path(),
            echo(),
            validator,
            Task::new("t-1", "add parser", TaskType::Task),
        );
        let outcome = engine.run_task("t-1").await.unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Completed {
                task_id: "t-1".into(),
                turns: 1
            }
        );
        let task = tasks.snapshot("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.metadata["outcome"], "success");
        assert!(
            engine
                .episodic_memory()
                .read(EpisodicDoc::DecisionLog)
                .contains("DECISION: proceed for t-1 turn 1")
        );
        assert!(engine.session_memory().operation_count() >= 5);
    }

    #[tokio::test]
    async fn fatal_validation_escalates_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FixedValidator {
            quality: 0.9,
            passed: false,
            fatal: true,
        };
        let (engine, tasks) = engine(
            dir.path(),
            echo(),
            validator,
            Task::new("t-2", "migrate db", TaskType::Story),
        );
        let err = engine.run_task("t-2").await.unwrap_err();
        assert!(matches!(err, RelayError::Escalated { turn: 1, .. }));
        let task = tasks.snapshot("t-2").unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.metadata["outcome"], "escalated");
    }

    #[tokio::test]
    async fn unanswered_clarification_blocks_task() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FixedValidator {
            quality: 0.9,
            passed: false,
            fatal: false,
        };
        let (engine, tasks) = engine(
            dir.path(),
            echo(),
            validator,
            Task::new("t-3", "refactor", TaskType::Task),
        );
        let outcome = engine.run_task("t-3").await.unwrap();
        assert!(matches!(outcome, TaskOutcome::NeedsClarification { turn: 1, .. }));
        assert_eq!(tasks.snapshot("t-3").unwrap().status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn guidance_continues_until_escalation() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FixedValidator {
            quality: 0.9,
            passed: false,
            fatal: false,
        };
        let (engine, _) = engine(
            dir.path(),
            echo(),
            validator,
            Task::new("t-4", "refactor", TaskType::Task),
        );
        let engine = engine.with_event_handler(FnEventHandler::new(|e| match e {
            OrchestratorEvent::ClarificationRequested { .. } => {
                Some(EventResponse::InjectGuidance("keep the public API".into()))
            }
            _ => None,
        }));
        let err = engine.run_task("t-4").await.unwrap_err();
        // Two clarified turns, escalated on the third low-confidence turn.
        assert!(matches!(err, RelayError::Escalated { turn: 3, .. }));
        assert!(
            engine
                .progress()
                .feedback
                .is_some_and(|f| f.contains("missing tests"))
        );
    }

    #[tokio::test]
    async fn marginal_turns_exhaust_budget() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FixedValidator {
            quality: 0.5,
            passed: true,
            fatal: false,
        };
        let (engine, tasks) = engine(
            dir.path(),
            echo(),
            validator,
            Task::new("t-5", "polish", TaskType::Subtask).with_max_turns(3),
        );
        let err = engine.run_task("t-5").await.unwrap_err();
        assert!(matches!(err, RelayError::TurnsExhausted { turns: 3, .. }));
        assert_eq!(tasks.snapshot("t-5").unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn retry_extends_type_budget() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FixedValidator {
            quality: 0.5,
            passed: true,
            fatal: false,
        };
        let extended = Arc::new(AtomicU32::new(0));
        let seen = extended.clone();
        let (engine, _) = engine(
            dir.path(),
            echo(),
            validator,
            Task::new("t-6", "polish", TaskType::Subtask),
        );
        let engine = engine.with_event_handler(FnEventHandler::new(move |e| {
            if let OrchestratorEvent::TurnBudgetExtended { max_turns, .. } = e {
                seen.store(*max_turns, Ordering::SeqCst);
            }
            None
        }));
        let err = engine.run_task("t-6").await.unwrap_err();
        // 5 -> 8 -> 12 with two extensions.
        assert!(matches!(err, RelayError::TurnsExhausted { turns: 12, .. }));
        assert_eq!(extended.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn agent_timeout_consumes_turn_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FixedValidator {
            quality: 0.9,
            passed: true,
            fatal: false,
        };
        let tasks = Arc::new(
            InMemoryTaskStore::new()
                .with_task(Task::new("t-7", "slow", TaskType::Task).with_max_turns(2)),
        );
        let collaborators = Collaborators {
            agent: Arc::new(SlowAgent),
            validator: Arc::new(validator),
            assessor: Arc::new(NoDeliverables),
            tasks,
        };
        let mut config = OrchestratorConfig::default().with_data_dir(dir.path());
        config.agent_timeout_secs = 0;
        let engine = OrchestratorEngine::open(
            config,
            collaborators,
            Arc::new(StaticProbe::default()),
            Arc::new(ExtractiveSummarizer::new(TokenEstimator::default())),
        )
        .unwrap();
        let err = engine.run_task("t-7").await.unwrap_err();
        assert!(matches!(err, RelayError::TurnsExhausted { turns: 2, .. }));
        let errors = engine
            .session_memory()
            .operations()
            .unwrap()
            .into_iter()
            .filter(|op| op.kind == OperationKind::Error)
            .count();
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn stop_signal_cancels_before_first_turn() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FixedValidator {
            quality: 0.9,
            passed: true,
            fatal: false,
        };
        let (engine, _) = engine(
            dir.path(),
            echo(),
            validator,
            Task::new("t-8", "anything", TaskType::Task),
        );
        let engine = engine.with_stop_signal(|| true);
        assert!(matches!(
            engine.run_task("t-8").await,
            Err(RelayError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn cancellation_mid_task_marks_task_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FixedValidator {
            quality: 0.5,
            passed: true,
            fatal: false,
        };
        let (engine, tasks) = engine(
            dir.path(),
            echo(),
            validator,
            Task::new("t-10", "polish", TaskType::Task),
        );
        // The first poll is at the top of turn 1, the second at its end.
        let polls = AtomicU32::new(0);
        let engine = engine.with_stop_signal(move || polls.fetch_add(1, Ordering::SeqCst) >= 1);
        let checkpoint = engine.checkpoint_now().await.unwrap().unwrap();

        let err = engine.run_task("t-10").await.unwrap_err();
        assert!(matches!(err, RelayError::Cancelled { .. }));
        assert_eq!(err.last_checkpoint(), Some(checkpoint.id.as_str()));

        let task = tasks.snapshot("t-10").unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.metadata["outcome"], "cancelled");
        assert_eq!(task.metadata["last_checkpoint"], checkpoint.id);
        assert!(!engine.state().in_turn);
    }

    #[tokio::test]
    async fn spent_handoff_budget_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = Arc::new(
            InMemoryTaskStore::new().with_task(Task::new("t-11", "fixtures", TaskType::Task)),
        );
        let collaborators = Collaborators {
            agent: Arc::new(HeavyAgent),
            validator: Arc::new(FixedValidator {
                quality: 0.9,
                passed: true,
                fatal: false,
            }),
            assessor: Arc::new(NoDeliverables),
            tasks: tasks.clone(),
        };
        let config = OrchestratorConfig::default()
            .with_context_window(4_096)
            .with_max_handoffs(0)
            .with_data_dir(dir.path());
        let engine = OrchestratorEngine::open(
            config,
            collaborators,
            Arc::new(StaticProbe::default()),
            Arc::new(ExtractiveSummarizer::new(TokenEstimator::default())),
        )
        .unwrap();

        let err = engine.run_task("t-11").await.unwrap_err();
        assert!(matches!(err, RelayError::HandoffLimitExceeded { limit: 0, .. }));
        let task = tasks.snapshot("t-11").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.metadata["outcome"], "handoff_limit_exceeded");
        let state = engine.state();
        assert!(!state.in_turn);
        assert!(!state.handoff_pending);
    }

    #[tokio::test]
    async fn agent_failure_fails_task_and_leaves_turn() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FixedValidator {
            quality: 0.9,
            passed: true,
            fatal: false,
        };
        let (engine, tasks) = engine(
            dir.path(),
            Arc::new(BrokenAgent),
            validator,
            Task::new("t-12", "anything", TaskType::Task),
        );
        let err = engine.run_task("t-12").await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
        let task = tasks.snapshot("t-12").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.metadata["outcome"], "error");
        assert!(task.metadata["error"].contains("relay-coder"));
        assert!(!engine.state().in_turn);

        // Checkpoint evaluation resumes for operations recorded afterwards.
        for i in 0..engine.profile().checkpoint_op_threshold {
            engine
                .record_operation(Operation::new(
                    OperationKind::Command,
                    format!("cargo check #{i}"),
                    &TokenEstimator::default(),
                ))
                .await
                .unwrap();
        }
        assert!(engine.checkpoints().last_checkpoint_id().is_some());
    }

    #[tokio::test]
    async fn manual_checkpoint_and_resume_restore_progress() {
        let dir = tempfile::tempdir().unwrap();
        let validator = FixedValidator {
            quality: 0.9,
            passed: true,
            fatal: false,
        };
        let (engine, _) = engine(
            dir.path(),
            echo(),
            validator,
            Task::new("t-9", "anything", TaskType::Task),
        );
        for i in 0..5 {
            engine
                .record_operation(Operation::new(
                    OperationKind::Command,
                    format!("command {i}"),
                    &TokenEstimator::default(),
                ))
                .await
                .unwrap();
        }
        let recent = engine.working_memory().recent(3);
        let checkpoint = engine.checkpoint_now().await.unwrap().unwrap();
        let session_id = engine.session_id().to_string();

        let tasks = Arc::new(InMemoryTaskStore::new());
        let collaborators = Collaborators {
            agent: echo(),
            validator: Arc::new(FixedValidator {
                quality: 0.9,
                passed: true,
                fatal: false,
            }),
            assessor: Arc::new(NoDeliverables),
            tasks,
        };
        let resumed = OrchestratorEngine::resume(
            OrchestratorConfig::default()
                .with_context_window(32_000)
                .with_data_dir(dir.path()),
            collaborators,
            Arc::new(StaticProbe::default()),
            Arc::new(ExtractiveSummarizer::new(TokenEstimator::default())),
            &checkpoint.id,
        )
        .await
        .unwrap();
        assert_eq!(resumed.session_id(), session_id);
        assert_eq!(resumed.working_memory().recent(3), recent);
        assert_eq!(resumed.session_memory().operation_count(), 5);
        assert_eq!(
            resumed.window().used_tokens,
            checkpoint.rehydration_tokens(&TokenEstimator::default())
        );
    }
}
