//! Seams to the systems the engine drives but does not own.
//!
//! The coding agent, the validator, the deliverable assessor and the task
//! store are all external. Each is a dyn-compatible trait whose async
//! methods return boxed futures, so the engine can hold them as
//! `Arc<dyn Trait>` and tests can substitute in-process fakes.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Boxed future used by every collaborator trait.
pub type CollabFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

// ── Tasks ──────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Epic,
    Story,
    Task,
    Subtask,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    /// Waiting on a human: clarification or escalation. The `outcome`
    /// metadata key says which.
    Blocked,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub task_type: TaskType,
    /// Explicit turn limit. Overrides the per-type budget and is never
    /// extended.
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            task_type,
            max_turns: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait TaskStore: Send + Sync {
    fn get_task<'a>(&'a self, id: &'a str) -> CollabFuture<'a, Task>;

    fn update_task_status<'a>(
        &'a self,
        id: &'a str,
        status: TaskStatus,
        metadata: HashMap<String, String>,
    ) -> CollabFuture<'a, ()>;
}

/// Task store backed by a map. Used by tests and the demo binary.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(self, task: Task) -> Self {
        self.insert(task);
        self
    }

    pub fn insert(&self, task: Task) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id.clone(), task);
    }

    pub fn snapshot(&self, id: &str) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn get_task<'a>(&'a self, id: &'a str) -> CollabFuture<'a, Task> {
        Box::pin(async move {
            self.snapshot(id)
                .ok_or_else(|| RelayError::NotFound(format!("task {id}")))
        })
    }

    fn update_task_status<'a>(
        &'a self,
        id: &'a str,
        status: TaskStatus,
        metadata: HashMap<String, String>,
    ) -> CollabFuture<'a, ()> {
        Box::pin(async move {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| RelayError::NotFound(format!("task {id}")))?;
            task.status = status;
            task.metadata.extend(metadata);
            Ok(())
        })
    }
}

// ── Coding agent ───────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FileChange {
    pub path: String,
    /// New contents, when the agent reports them.
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AgentResponse {
    pub content: String,
    #[serde(default)]
    pub files_changed: Vec<FileChange>,
    /// Tokens the agent reports consuming, if known.
    #[serde(default)]
    pub tokens_used: Option<usize>,
}

pub trait CodingAgent: Send + Sync {
    /// Send one turn's prompt. `session_ref` lets the agent keep its own
    /// conversation across turns.
    fn send<'a>(&'a self, prompt: &'a str, session_ref: &'a str) -> CollabFuture<'a, AgentResponse>;
}

// ── Validation ─────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub passed: bool,
    /// A failure no retry can fix.
    #[serde(default)]
    pub fatal: bool,
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl ValidationOutcome {
    pub fn pass(score: f64) -> Self {
        Self {
            passed: true,
            fatal: false,
            score,
            issues: Vec::new(),
        }
    }

    pub fn fail(score: f64, issues: Vec<String>) -> Self {
        Self {
            passed: false,
            fatal: false,
            score,
            issues,
        }
    }
}

/// Inputs to [`Validator::score_confidence`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceSignals {
    pub turn: u32,
    pub max_turns: u32,
    pub response_tokens: usize,
    pub files_changed: usize,
    pub validation_passed: bool,
    pub issue_count: usize,
}

pub trait Validator: Send + Sync {
    fn score_quality<'a>(&'a self, response: &'a AgentResponse) -> CollabFuture<'a, f64>;

    fn validate<'a>(&'a self, response: &'a AgentResponse) -> CollabFuture<'a, ValidationOutcome>;

    fn score_confidence<'a>(&'a self, signals: &'a ConfidenceSignals) -> CollabFuture<'a, f64>;
}

// ── Deliverables ───────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Deliverables {
    pub outcome: String,
    pub files: Vec<String>,
    pub quality: f64,
}

pub trait DeliverableAssessor: Send + Sync {
    fn assess<'a>(&'a self, task: &'a Task) -> CollabFuture<'a, Deliverables>;
}

/// The external systems one engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn CodingAgent>,
    pub validator: Arc<dyn Validator>,
    pub assessor: Arc<dyn DeliverableAssessor>,
    pub tasks: Arc<dyn TaskStore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_updates_status() {
        let store = InMemoryTaskStore::new().with_task(Task::new("t-1", "do it", TaskType::Task));
        let mut meta = HashMap::new();
        meta.insert("turns".to_string(), "3".to_string());
        store
            .update_task_status("t-1", TaskStatus::Completed, meta)
            .await
            .unwrap();
        let task = store.get_task("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.metadata["turns"], "3");
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let store = InMemoryTaskStore::new();
        assert!(matches!(
            store.get_task("nope").await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[test]
    fn task_json_defaults() {
        let task: Task = serde_json::from_str(
            r#"{"id":"t","title":"x","status":"pending","task_type":"story"}"#,
        )
        .unwrap();
        assert_eq!(task.task_type, TaskType::Story);
        assert!(task.max_turns.is_none());
    }
}
