//! Confidence-weighted choice of the next action after a turn.
//!
//! Sub-signals are combined conservatively: the overall confidence is the
//! minimum of the operation confidence, the quality score and the
//! validation score, so a single weak signal vetoes proceeding.
//!
//! | Condition | Action |
//! |-----------|--------|
//! | fatal validation failure | `escalate` |
//! | confidence < clarify threshold, or validation failed | `clarify` (the Nth consecutive one escalates) |
//! | confidence and quality above proceed thresholds, validation passed | `proceed` |
//! | anything else | `retry` |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Proceed,
    Retry,
    Clarify,
    Escalate,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Proceed => "proceed",
            Action::Retry => "retry",
            Action::Clarify => "clarify",
            Action::Escalate => "escalate",
        }
    }

    fn consequences(&self) -> &'static str {
        match self {
            Action::Proceed => "The task is marked complete and the loop moves on.",
            Action::Retry => "Another turn runs with the validation feedback attached.",
            Action::Clarify => "Execution pauses until the caller supplies guidance.",
            Action::Escalate => "Execution halts for manual intervention.",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DecisionThresholds {
    pub proceed_confidence: f64,
    pub proceed_quality: f64,
    /// Confidence below this asks for clarification.
    pub clarify_below: f64,
    /// Consecutive low-confidence decisions before escalating.
    pub escalate_after_low: u32,
    /// Minimum confidence for a decision to be recorded.
    pub significance: f64,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            proceed_confidence: 0.7,
            proceed_quality: 0.7,
            clarify_below: 0.4,
            escalate_after_low: 3,
            significance: 0.7,
        }
    }
}

/// Inputs gathered after one turn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionSignals {
    pub operation_confidence: f64,
    pub quality: f64,
    pub validation_score: f64,
    pub validation_passed: bool,
    pub fatal: bool,
}

impl DecisionSignals {
    /// Minimum of the sub-signals, each clamped to `[0, 1]`. NaN counts as 0.
    pub fn confidence(&self) -> f64 {
        [
            self.operation_confidence,
            self.quality,
            self.validation_score,
        ]
        .into_iter()
        .map(|s| if s.is_nan() { 0.0 } else { s.clamp(0.0, 1.0) })
        .fold(1.0, f64::min)
    }
}

/// ADR-style record of a significant decision. Holds structured fields
/// only, never raw model output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DecisionRecord {
    pub id: String,
    pub task_id: String,
    pub turn: u32,
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub confidence: f64,
    pub context: String,
    pub decision: String,
    pub consequences: String,
    pub rationale_redacted: String,
}

impl DecisionRecord {
    pub fn new(
        task_id: impl Into<String>,
        turn: u32,
        action: Action,
        confidence: f64,
        context: impl Into<String>,
    ) -> Self {
        let task_id = task_id.into();
        Self {
            id: crate::persist::generate_id("adr"),
            decision: format!("{action} for {task_id} turn {turn}"),
            task_id,
            turn,
            timestamp: Utc::now(),
            action,
            confidence,
            context: context.into(),
            consequences: action.consequences().to_string(),
            rationale_redacted: String::new(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale_redacted = rationale.into();
        self
    }

    /// Markdown entry for the decision log. The `DECISION:` line is what
    /// survives compression.
    pub fn to_markdown(&self) -> String {
        let mut out = format!(
            "### {} ({})\nDECISION: {} (confidence {:.2})\n- Context: {}\n- Consequences: {}\n",
            self.id,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.decision,
            self.confidence,
            self.context,
            self.consequences
        );
        if !self.rationale_redacted.is_empty() {
            out.push_str(&format!("- Rationale: {}\n", self.rationale_redacted));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub confidence: f64,
    pub reason: String,
    pub record: Option<DecisionRecord>,
}

#[derive(Debug, Default)]
pub struct DecisionEngine {
    thresholds: DecisionThresholds,
    consecutive_low: AtomicU32,
}

impl DecisionEngine {
    pub fn new(thresholds: DecisionThresholds) -> Self {
        Self {
            thresholds,
            consecutive_low: AtomicU32::new(0),
        }
    }

    pub fn thresholds(&self) -> &DecisionThresholds {
        &self.thresholds
    }

    pub fn consecutive_low(&self) -> u32 {
        self.consecutive_low.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.consecutive_low.store(0, Ordering::Relaxed);
    }

    /// Decide the next action for `task_id` after `turn`.
    pub fn decide(&self, task_id: &str, turn: u32, signals: &DecisionSignals) -> Decision {
        let t = &self.thresholds;
        let confidence = signals.confidence();

        let (action, reason) = if signals.fatal {
            (Action::Escalate, "fatal validation failure".to_string())
        } else if confidence < t.clarify_below || !signals.validation_passed {
            let low = self.consecutive_low.fetch_add(1, Ordering::Relaxed) + 1;
            let why = if signals.validation_passed {
                format!("confidence {confidence:.2} below {:.2}", t.clarify_below)
            } else {
                "validation failed".to_string()
            };
            if low >= t.escalate_after_low {
                (
                    Action::Escalate,
                    format!("{why}; {low} consecutive low-confidence turns"),
                )
            } else {
                (Action::Clarify, why)
            }
        } else {
            self.reset();
            if confidence >= t.proceed_confidence && signals.quality >= t.proceed_quality {
                (
                    Action::Proceed,
                    format!(
                        "confidence {confidence:.2} and quality {:.2} meet thresholds",
                        signals.quality
                    ),
                )
            } else {
                (
                    Action::Retry,
                    format!(
                        "marginal result: confidence {confidence:.2}, quality {:.2}",
                        signals.quality
                    ),
                )
            }
        };

        debug!("Decision for {task_id} turn {turn}: {action} ({reason})");

        let record = (confidence >= t.significance).then(|| {
            let context = format!(
                "turn {turn}: quality {:.2}, validation {} (score {:.2}), operation confidence {:.2}",
                signals.quality,
                if signals.validation_passed { "passed" } else { "failed" },
                signals.validation_score,
                signals.operation_confidence
            );
            DecisionRecord::new(task_id, turn, action, confidence, context)
                .with_rationale(reason.clone())
        });

        Decision {
            action,
            confidence,
            reason,
            record,
        }
    }
}
