//! Events and handlers for the [`OrchestratorEngine`](super::engine::OrchestratorEngine).
//!
//! The engine reports its lifecycle through [`OrchestratorEvent`] variants:
//! turns, decisions, zone changes, optimization passes, checkpoints and
//! self-handoffs. Callers implement [`EventHandler`] to observe them.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Closures that may answer a clarification |
//! | [`EventObserver`] | Closures that only observe |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::agent::decision::Decision;
use crate::agent::engine::TaskOutcome;
use crate::checkpoint::model::CheckpointTrigger;
use crate::context::window::{WindowSnapshot, Zone};
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum OrchestratorEvent<'a> {
    TaskStarted {
        task_id: &'a str,
        max_turns: u32,
    },
    /// A new turn is starting.
    TurnStart {
        task_id: &'a str,
        turn: u32,
        max_turns: u32,
        window: &'a WindowSnapshot,
    },
    /// The coding agent answered.
    AgentResponded {
        turn: u32,
        content: &'a str,
        files_changed: usize,
    },
    /// The agent call timed out; the turn is retried.
    AgentTimedOut { turn: u32, timeout_secs: u64 },
    Decision {
        task_id: &'a str,
        turn: u32,
        decision: &'a Decision,
    },
    /// The turn budget grew after a retry.
    TurnBudgetExtended { task_id: &'a str, max_turns: u32 },
    ZoneChanged {
        from: Zone,
        to: Zone,
        usage_pct: f64,
    },
    /// An optimization pass ran over the live context.
    Optimized {
        tokens_before: usize,
        tokens_after: usize,
        no_op: bool,
    },
    CheckpointCommitted {
        checkpoint_id: &'a str,
        trigger: &'a CheckpointTrigger,
        verified: bool,
    },
    CheckpointDeferred { deferrals: u32, reason: &'a str },
    HandoffStarted { handoff: u32, usage_pct: f64 },
    HandoffCompleted {
        handoff: u32,
        checkpoint_id: &'a str,
        rehydrated_tokens: usize,
    },
    /// The engine needs guidance. Answer with
    /// [`EventResponse::InjectGuidance`] to continue the run; otherwise the
    /// task is blocked.
    ClarificationRequested {
        task_id: &'a str,
        turn: u32,
        reason: &'a str,
    },
    TaskFinished {
        task_id: &'a str,
        outcome: &'a TaskOutcome,
    },
}

/// Response from an event handler for events that accept feedback.
#[derive(Debug, Clone, PartialEq)]
pub enum EventResponse {
    /// Stop the run at the next iteration boundary.
    Stop,
    /// Guidance for the next turn's prompt.
    InjectGuidance(String),
}

/// Handler for orchestrator events.
///
/// Most events are informational and the return value is ignored. For
/// [`OrchestratorEvent::ClarificationRequested`] the return value decides
/// whether the task continues.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &OrchestratorEvent<'_>) -> Option<EventResponse> {
        let _ = event;
        None
    }
}

pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&OrchestratorEvent<'_>) -> Option<EventResponse> + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&OrchestratorEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&OrchestratorEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    fn on_event(&self, event: &OrchestratorEvent<'_>) -> Option<EventResponse> {
        (self.0)(event)
    }
}

/// Adapts an observation-only closure into an [`EventHandler`].
pub struct EventObserver<F>(F)
where
    F: Fn(&OrchestratorEvent<'_>) + Send + Sync;

impl<F> EventObserver<F>
where
    F: Fn(&OrchestratorEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for EventObserver<F>
where
    F: Fn(&OrchestratorEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &OrchestratorEvent<'_>) -> Option<EventResponse> {
        (self.0)(event);
        None
    }
}

/// Dispatches to multiple handlers in registration order. The first
/// non-`None` response wins.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(interactive, PromptingHandler::new());
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &OrchestratorEvent<'_>) -> Option<EventResponse> {
        let mut first = None;
        for handler in &self.handlers {
            let response = handler.on_event(event);
            if first.is_none() {
                first = response;
            }
        }
        first
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &OrchestratorEvent<'_>) -> Option<EventResponse> {
        match event {
            OrchestratorEvent::TaskStarted { task_id, max_turns } => {
                info!("Task {task_id} started (max {max_turns} turns)");
            }
            OrchestratorEvent::TurnStart {
                task_id,
                turn,
                max_turns,
                window,
            } => {
                info!(
                    "[{task_id} turn {turn}/{max_turns}] {}",
                    window.to_log_string()
                );
            }
            OrchestratorEvent::AgentResponded {
                turn,
                content,
                files_changed,
            } => {
                let preview: String = content.chars().take(200).collect();
                debug!(
                    "Turn {turn} response ({files_changed} file(s)): {preview}{}",
                    if content.len() > 200 { "..." } else { "" }
                );
            }
            OrchestratorEvent::AgentTimedOut { turn, timeout_secs } => {
                warn!("Agent timed out after {timeout_secs}s on turn {turn}");
            }
            OrchestratorEvent::Decision {
                task_id,
                turn,
                decision,
            } => {
                info!(
                    "{task_id} turn {turn}: {} (confidence {:.2}): {}",
                    decision.action, decision.confidence, decision.reason
                );
            }
            OrchestratorEvent::TurnBudgetExtended { task_id, max_turns } => {
                info!("{task_id}: turn budget extended to {max_turns}");
            }
            OrchestratorEvent::ZoneChanged {
                from,
                to,
                usage_pct,
            } => {
                info!("Context zone {from} → {to} ({:.0}%)", usage_pct * 100.0);
            }
            OrchestratorEvent::Optimized {
                tokens_before,
                tokens_after,
                no_op,
            } => {
                if *no_op {
                    debug!("Optimization pass made no progress ({tokens_before} tokens)");
                } else {
                    info!("Optimized context: {tokens_before} → {tokens_after} tokens");
                }
            }
            OrchestratorEvent::CheckpointCommitted {
                checkpoint_id,
                trigger,
                verified,
            } => {
                info!("Checkpoint {checkpoint_id} ({trigger}, verified: {verified})");
            }
            OrchestratorEvent::CheckpointDeferred { deferrals, reason } => {
                warn!("Checkpoint deferred ({deferrals}): {reason}");
            }
            OrchestratorEvent::HandoffStarted { handoff, usage_pct } => {
                info!(
                    "Self-handoff #{handoff} at {:.0}% context usage",
                    usage_pct * 100.0
                );
            }
            OrchestratorEvent::HandoffCompleted {
                handoff,
                checkpoint_id,
                rehydrated_tokens,
            } => {
                info!(
                    "Self-handoff #{handoff} resumed from {checkpoint_id} ({rehydrated_tokens} tokens rehydrated)"
                );
            }
            OrchestratorEvent::ClarificationRequested {
                task_id,
                turn,
                reason,
            } => {
                warn!("{task_id} turn {turn} needs clarification: {reason}");
            }
            OrchestratorEvent::TaskFinished { task_id, outcome } => {
                info!("Task {task_id} finished: {}", outcome.label());
            }
        }
        None
    }
}
