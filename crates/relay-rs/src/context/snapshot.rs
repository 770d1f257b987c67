//! The live context carried between turns, as a list of typed items.
//!
//! A [`ContextSnapshot`] is what the optimizer shrinks and what a checkpoint
//! freezes. Items are kept in chronological order. Work is grouped into
//! numbered phases: every item records the phase it was created in, and a
//! phase is complete once `current_phase` has moved past it.
//!
//! Operation items, the file contents a file-change operation brought in
//! and phase summaries live only as long as their operation stays in working
//! memory. A summary is tied to the newest operation it covers.
//! [`ContextSnapshot::release_operations`] drops them on eviction; the
//! session log keeps the full record.

use crate::context::operation::{Operation, OperationKind};
use crate::context::tokens::TokenEstimator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    DebugTrace,
    Validation,
    Error,
    File,
    /// The task state blob. At most one per snapshot.
    State,
    /// Narrative of the work done in a phase.
    Phase,
}

/// Replacement for full file contents.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ArtifactRecord {
    pub path: String,
    pub summary: String,
    pub last_modified: DateTime<Utc>,
    pub size: usize,
}

/// Reference to a payload moved into the artifact store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExternalRef {
    pub reference: String,
    pub summary: String,
    /// Token cost of the externalized payload.
    pub tokens: usize,
}

/// State expressed relative to a checkpoint's state blob.
///
/// Only top-level keys are diffed: `set` holds added or changed keys and
/// `removed` lists keys absent from the current state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StateDelta {
    pub base_checkpoint_id: String,
    pub set: Map<String, Value>,
    pub removed: Vec<String>,
}

impl StateDelta {
    /// Diff two object states. Returns `None` when either side is not a
    /// JSON object.
    pub fn compute(base_checkpoint_id: &str, base: &Value, current: &Value) -> Option<Self> {
        let (base, current) = (base.as_object()?, current.as_object()?);
        let set = current
            .iter()
            .filter(|(k, v)| base.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let removed = base
            .keys()
            .filter(|k| !current.contains_key(*k))
            .cloned()
            .collect();
        Some(Self {
            base_checkpoint_id: base_checkpoint_id.to_string(),
            set,
            removed,
        })
    }

    /// Reconstruct the full state from the base it was computed against.
    pub fn apply(&self, base: &Value) -> Value {
        let mut out = base.as_object().cloned().unwrap_or_default();
        for key in &self.removed {
            out.remove(key);
        }
        for (k, v) in &self.set {
            out.insert(k.clone(), v.clone());
        }
        Value::Object(out)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemBody {
    Text {
        text: String,
    },
    FileContents {
        path: String,
        content: String,
        last_modified: DateTime<Utc>,
    },
    FileRef(ArtifactRecord),
    External(ExternalRef),
    State {
        state: Value,
    },
    StateDelta(StateDelta),
    /// Compressed phase narrative; the full text is in the artifact store.
    Summary {
        text: String,
        full_ref: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContextItem {
    pub id: String,
    pub kind: ItemKind,
    pub phase: u32,
    pub created_at: DateTime<Utc>,
    /// Resolved errors are eligible for pruning.
    #[serde(default)]
    pub resolved: bool,
    /// Operation this item mirrors or was introduced by.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    pub body: ItemBody,
    pub tokens: usize,
}

impl ContextItem {
    pub fn new(kind: ItemKind, phase: u32, body: ItemBody, estimator: &TokenEstimator) -> Self {
        let mut item = Self {
            id: crate::persist::generate_id("ctx"),
            kind,
            phase,
            created_at: Utc::now(),
            resolved: false,
            op_id: None,
            body,
            tokens: 0,
        };
        item.tokens = estimator.estimate(&item.render());
        item
    }

    pub fn text(
        kind: ItemKind,
        phase: u32,
        text: impl Into<String>,
        estimator: &TokenEstimator,
    ) -> Self {
        Self::new(kind, phase, ItemBody::Text { text: text.into() }, estimator)
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_op_id(mut self, op_id: impl Into<String>) -> Self {
        self.op_id = Some(op_id.into());
        self
    }

    /// Path of a file item, before or after registry conversion.
    pub fn file_path(&self) -> Option<&str> {
        match &self.body {
            ItemBody::FileContents { path, .. } => Some(path),
            ItemBody::FileRef(r) => Some(&r.path),
            _ => None,
        }
    }

    /// Replace the body and re-estimate the token cost.
    pub fn replace_body(&mut self, body: ItemBody, estimator: &TokenEstimator) {
        self.body = body;
        self.tokens = estimator.estimate(&self.render());
    }

    /// Prompt rendering of the item.
    pub fn render(&self) -> String {
        match &self.body {
            ItemBody::Text { text } => text.clone(),
            ItemBody::FileContents { path, content, .. } => format!("File {path}:\n{content}"),
            ItemBody::FileRef(r) => format!(
                "File {} ({} bytes, modified {}): {}",
                r.path,
                r.size,
                r.last_modified.format("%Y-%m-%d %H:%M"),
                r.summary
            ),
            ItemBody::External(e) => format!(
                "[externalized {} ({} tokens)] {}",
                e.reference, e.tokens, e.summary
            ),
            ItemBody::State { state } => format!("State: {state}"),
            ItemBody::StateDelta(d) => format!(
                "State delta vs {}: set {} removed {:?}",
                d.base_checkpoint_id,
                Value::Object(d.set.clone()),
                d.removed
            ),
            ItemBody::Summary { text, full_ref } => {
                format!("Phase {} summary (full text {full_ref}):\n{text}", self.phase)
            }
        }
    }
}

/// The last checkpoint's state blob, used for differential state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateBaseline {
    pub checkpoint_id: String,
    pub state: Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ContextSnapshot {
    pub items: Vec<ContextItem>,
    pub current_phase: u32,
    #[serde(skip)]
    pub baseline: Option<StateBaseline>,
}

impl ContextSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: ContextItem) {
        self.items.push(item);
    }

    /// Mirror a recorded operation into the snapshot. A task step starts a
    /// new phase.
    pub fn push_operation(&mut self, op: &Operation, estimator: &TokenEstimator) {
        let kind = match op.kind {
            OperationKind::Validation => ItemKind::Validation,
            OperationKind::Error => ItemKind::Error,
            OperationKind::TaskStep => {
                if self.items.iter().any(|i| i.phase == self.current_phase) {
                    self.current_phase += 1;
                }
                ItemKind::Phase
            }
            _ => ItemKind::Phase,
        };
        let item = ContextItem::text(kind, self.current_phase, op.to_line(), estimator)
            .with_created_at(op.timestamp)
            .with_op_id(op.id.clone());
        self.items.push(item);
    }

    /// Add file contents, replacing any earlier item for the same path.
    pub fn push_file(
        &mut self,
        path: impl Into<String>,
        content: impl Into<String>,
        last_modified: DateTime<Utc>,
        estimator: &TokenEstimator,
    ) {
        let item = self.file_item(path.into(), content.into(), last_modified, estimator);
        self.insert_file(item);
    }

    /// Like [`push_file`](Self::push_file), tying the contents to the
    /// file-change operation that produced them.
    pub fn push_file_change(
        &mut self,
        op: &Operation,
        content: impl Into<String>,
        last_modified: DateTime<Utc>,
        estimator: &TokenEstimator,
    ) {
        let item = self
            .file_item(op.summary.clone(), content.into(), last_modified, estimator)
            .with_op_id(op.id.clone());
        self.insert_file(item);
    }

    fn file_item(
        &self,
        path: String,
        content: String,
        last_modified: DateTime<Utc>,
        estimator: &TokenEstimator,
    ) -> ContextItem {
        let body = ItemBody::FileContents {
            path,
            content,
            last_modified,
        };
        ContextItem::new(ItemKind::File, self.current_phase, body, estimator)
    }

    fn insert_file(&mut self, item: ContextItem) {
        if let Some(path) = item.file_path() {
            let path = path.to_string();
            self.items.retain(|i| i.file_path() != Some(path.as_str()));
        }
        self.items.push(item);
    }

    /// Drop the items tied to operations that left working memory.
    /// Returns the number of items removed.
    pub fn release_operations(&mut self, evicted: &[Operation]) -> usize {
        if evicted.is_empty() {
            return 0;
        }
        let ids: HashSet<&str> = evicted.iter().map(|op| op.id.as_str()).collect();
        let before = self.items.len();
        self.items
            .retain(|i| !i.op_id.as_deref().is_some_and(|id| ids.contains(id)));
        before - self.items.len()
    }

    /// Replace the state blob.
    pub fn set_state(&mut self, state: Value, estimator: &TokenEstimator) {
        self.items.retain(|i| i.kind != ItemKind::State);
        self.items.push(ContextItem::new(
            ItemKind::State,
            self.current_phase,
            ItemBody::State { state },
            estimator,
        ));
    }

    /// The full state blob, if present and not yet externalized.
    pub fn state(&self) -> Option<Value> {
        let item = self.items.iter().find(|i| i.kind == ItemKind::State)?;
        match (&item.body, &self.baseline) {
            (ItemBody::State { state }, _) => Some(state.clone()),
            (ItemBody::StateDelta(delta), Some(base)) => Some(delta.apply(&base.state)),
            _ => None,
        }
    }

    pub fn resolve_errors(&mut self) {
        for item in self.items.iter_mut().filter(|i| i.kind == ItemKind::Error) {
            item.resolved = true;
        }
    }

    /// Close the current phase.
    pub fn complete_phase(&mut self) {
        self.current_phase += 1;
    }

    pub fn total_tokens(&self) -> usize {
        self.items.iter().map(|i| i.tokens).sum()
    }

    pub fn render(&self) -> String {
        self.items
            .iter()
            .map(ContextItem::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Artifact ids referenced from the snapshot.
    pub fn artifact_refs(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|i| match &i.body {
                ItemBody::External(e) => Some(e.reference.clone()),
                ItemBody::Summary { full_ref, .. } => Some(full_ref.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn set_baseline(&mut self, checkpoint_id: impl Into<String>, state: Value) {
        self.baseline = Some(StateBaseline {
            checkpoint_id: checkpoint_id.into(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_step_opens_new_phase() {
        let est = TokenEstimator::default();
        let mut snap = ContextSnapshot::new();
        snap.push_operation(
            &Operation::new(OperationKind::TaskStep, "turn 1", &est),
            &est,
        );
        snap.push_operation(
            &Operation::new(OperationKind::AgentResponse, "did work", &est),
            &est,
        );
        snap.push_operation(
            &Operation::new(OperationKind::TaskStep, "turn 2", &est),
            &est,
        );
        assert_eq!(snap.current_phase, 1);
        assert_eq!(snap.items[0].phase, 0);
        assert_eq!(snap.items[2].phase, 1);
    }

    #[test]
    fn delta_round_trips_through_apply() {
        let base = json!({"turn": 3, "status": "running", "old": true});
        let current = json!({"turn": 4, "status": "running", "new": 1});
        let delta = StateDelta::compute("cp-1", &base, &current).unwrap();
        assert_eq!(delta.removed, vec!["old".to_string()]);
        assert!(!delta.set.contains_key("status"));
        assert_eq!(delta.apply(&base), current);
    }

    #[test]
    fn delta_requires_objects() {
        assert!(StateDelta::compute("cp", &json!([1]), &json!({})).is_none());
    }

    #[test]
    fn set_state_keeps_single_state_item() {
        let est = TokenEstimator::default();
        let mut snap = ContextSnapshot::new();
        snap.set_state(json!({"turn": 1}), &est);
        snap.set_state(json!({"turn": 2}), &est);
        let states = snap.items.iter().filter(|i| i.kind == ItemKind::State).count();
        assert_eq!(states, 1);
        assert_eq!(snap.state(), Some(json!({"turn": 2})));
    }

    #[test]
    fn tokens_track_rendering() {
        let est = TokenEstimator::default();
        let item = ContextItem::text(ItemKind::Phase, 0, "x".repeat(350), &est);
        assert_eq!(item.tokens, 100);
    }

    #[test]
    fn evicted_operations_leave_the_snapshot() {
        let est = TokenEstimator::default();
        let mut snap = ContextSnapshot::new();
        let ops: Vec<Operation> = (0..4)
            .map(|i| Operation::new(OperationKind::Command, format!("cargo build #{i}"), &est))
            .collect();
        for op in &ops {
            snap.push_operation(op, &est);
        }
        let change = Operation::new(OperationKind::FileChange, "src/lib.rs", &est);
        snap.push_operation(&change, &est);
        snap.push_file_change(&change, "pub fn lib() {}", Utc::now(), &est);
        snap.set_state(json!({"turn": 1}), &est);

        assert_eq!(snap.release_operations(&ops[..2]), 2);
        assert_eq!(snap.items.len(), 5);
        assert!(snap.items.iter().all(|i| !i.render().contains("#0")));

        assert_eq!(snap.release_operations(std::slice::from_ref(&change)), 2);
        assert!(snap.items.iter().all(|i| i.kind != ItemKind::File));
        // The state blob is not tied to any operation.
        assert!(snap.state().is_some());
    }

    #[test]
    fn summary_outlives_all_but_its_newest_operation() {
        let est = TokenEstimator::default();
        let older = Operation::new(OperationKind::Command, "cargo fmt", &est);
        let newest = Operation::new(OperationKind::Command, "cargo test", &est);
        let mut snap = ContextSnapshot::new();
        snap.push(
            ContextItem::new(
                ItemKind::Phase,
                0,
                ItemBody::Summary {
                    text: "formatted and tested".into(),
                    full_ref: "artifact-0".into(),
                },
                &est,
            )
            .with_op_id(newest.id.clone()),
        );

        assert_eq!(snap.release_operations(std::slice::from_ref(&older)), 0);
        assert_eq!(snap.artifact_refs(), vec!["artifact-0".to_string()]);
        assert_eq!(snap.release_operations(std::slice::from_ref(&newest)), 1);
        assert!(snap.items.is_empty());
    }

    #[test]
    fn newer_file_contents_replace_older() {
        let est = TokenEstimator::default();
        let mut snap = ContextSnapshot::new();
        snap.push_file("src/a.rs", "v1", Utc::now(), &est);
        snap.push_file("src/b.rs", "v1", Utc::now(), &est);
        snap.push_file("src/a.rs", "v2", Utc::now(), &est);
        assert_eq!(snap.items.len(), 2);
        assert_eq!(snap.items[1].render(), "File src/a.rs:\nv2");
    }

    #[test]
    fn serde_skips_baseline() {
        let mut snap = ContextSnapshot::new();
        snap.set_baseline("cp-1", json!({"a": 1}));
        let json = serde_json::to_string(&snap).unwrap();
        let back: ContextSnapshot = serde_json::from_str(&json).unwrap();
        assert!(back.baseline.is_none());
    }
}
