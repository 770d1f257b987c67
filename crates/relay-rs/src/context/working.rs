//! Working memory: a bounded FIFO cache of recent operations.
//!
//! Capacity scales with the context window through a configurable step
//! function ([`WorkingMemoryConfig::tiers`]). Eviction is strict FIFO on
//! whichever limit, operation count or tokens, is hit first.
//!
//! Working memory is a performance cache only. Every operation is durably
//! recorded by session memory *before* it is added here, so evicted
//! operations remain recoverable from the session log.

use crate::context::operation::{Operation, OperationKind};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// One bracket of the capacity step function.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CapacityTier {
    /// Upper bound (inclusive) on the context window for this tier. `None`
    /// matches every larger window.
    pub max_context: Option<usize>,
    /// Maximum operations retained.
    pub max_operations: usize,
    /// Fraction of the context window the cache may occupy.
    pub token_fraction: f64,
}

/// Step function mapping context-window size to working memory capacity.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WorkingMemoryConfig {
    /// Tiers sorted by ascending `max_context`; the last tier should be
    /// unbounded.
    pub tiers: Vec<CapacityTier>,
}

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        let tier = |max_context, max_operations, token_fraction| CapacityTier {
            max_context,
            max_operations,
            token_fraction,
        };
        Self {
            tiers: vec![
                tier(Some(4_096), 10, 0.10),
                tier(Some(16_384), 30, 0.10),
                tier(Some(131_072), 50, 0.08),
                tier(Some(524_288), 75, 0.06),
                tier(None, 100, 0.05),
            ],
        }
    }
}

impl WorkingMemoryConfig {
    /// Capacity for a context window of `context_tokens`.
    pub fn capacity_for(&self, context_tokens: usize) -> Capacity {
        let tier = self
            .tiers
            .iter()
            .find(|t| t.max_context.is_none_or(|max| context_tokens <= max))
            .or_else(|| self.tiers.last());
        match tier {
            Some(t) => Capacity {
                max_operations: t.max_operations.max(1),
                max_tokens: ((context_tokens as f64 * t.token_fraction) as usize).max(1),
            },
            None => Capacity {
                max_operations: 10,
                max_tokens: (context_tokens / 10).max(1),
            },
        }
    }
}

/// Resolved working memory limits.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capacity {
    pub max_operations: usize,
    pub max_tokens: usize,
}

#[derive(Debug, Default)]
struct Inner {
    ops: VecDeque<Operation>,
    total_tokens: usize,
    evicted_total: u64,
}

impl Inner {
    fn pop_front(&mut self) -> Option<Operation> {
        let op = self.ops.pop_front()?;
        self.total_tokens = self.total_tokens.saturating_sub(op.tokens);
        self.evicted_total += 1;
        Some(op)
    }
}

/// Bounded FIFO of recent operations.
#[derive(Debug)]
pub struct WorkingMemory {
    capacity: Capacity,
    inner: Mutex<Inner>,
}

impl WorkingMemory {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Size working memory from the context window via the step function.
    pub fn for_context(context_tokens: usize, config: &WorkingMemoryConfig) -> Self {
        Self::new(config.capacity_for(context_tokens))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Add an operation, evicting the oldest entries until both limits hold.
    /// Returns the evicted operations, oldest first.
    ///
    /// An operation that alone exceeds the token limit is not cached; it is
    /// returned as evicted immediately.
    pub fn add(&self, op: Operation) -> Vec<Operation> {
        if op.tokens > self.capacity.max_tokens {
            debug!(
                "Operation {} ({} tokens) exceeds working memory cap of {} tokens; not cached",
                op.id, op.tokens, self.capacity.max_tokens
            );
            let mut inner = self.lock();
            inner.evicted_total += 1;
            return vec![op];
        }

        let mut inner = self.lock();
        let mut evicted = Vec::new();
        while inner.ops.len() >= self.capacity.max_operations
            || inner.total_tokens + op.tokens > self.capacity.max_tokens
        {
            match inner.pop_front() {
                Some(old) => evicted.push(old),
                None => break,
            }
        }
        inner.total_tokens += op.tokens;
        inner.ops.push_back(op);
        evicted
    }

    /// The `limit` most recent operations, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Operation> {
        let inner = self.lock();
        let skip = inner.ops.len().saturating_sub(limit);
        inner.ops.iter().skip(skip).cloned().collect()
    }

    /// The `limit` most recent operations of one kind, oldest first.
    pub fn by_kind(&self, kind: OperationKind, limit: usize) -> Vec<Operation> {
        let inner = self.lock();
        let mut matched: Vec<Operation> = inner
            .ops
            .iter()
            .rev()
            .filter(|op| op.kind == kind)
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    /// Case-insensitive substring search over summaries and kinds.
    pub fn search(&self, query: &str) -> Vec<Operation> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.lock()
            .ops
            .iter()
            .filter(|op| {
                op.summary.to_lowercase().contains(&needle) || op.kind.as_str().contains(&needle)
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ops.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.lock().total_tokens
    }

    /// Number of operations evicted (or rejected) since creation.
    pub fn evicted_total(&self) -> u64 {
        self.lock().evicted_total
    }

    /// Every cached operation, oldest first.
    pub fn snapshot(&self) -> Vec<Operation> {
        self.lock().ops.iter().cloned().collect()
    }

    /// Replace the contents with `ops`, re-applying the limits. Used when
    /// re-hydrating from a checkpoint.
    pub fn restore(&self, ops: Vec<Operation>) {
        self.clear();
        for op in ops {
            self.add(op);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.ops.clear();
        inner.total_tokens = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tokens::TokenEstimator;

    fn op(kind: OperationKind, summary: &str, tokens: usize) -> Operation {
        Operation::new(kind, summary, &TokenEstimator::default()).with_tokens(tokens)
    }

    #[test]
    fn default_tiers_match_brackets() {
        let config = WorkingMemoryConfig::default();
        assert_eq!(config.capacity_for(4_096).max_operations, 10);
        assert_eq!(config.capacity_for(16_000).max_operations, 30);
        assert_eq!(config.capacity_for(128_000).max_operations, 50);
        assert_eq!(config.capacity_for(200_000).max_operations, 75);
        assert_eq!(config.capacity_for(1_000_000).max_operations, 100);
        assert_eq!(config.capacity_for(4_096).max_tokens, 409);
        assert_eq!(config.capacity_for(1_000_000).max_tokens, 50_000);
    }

    #[test]
    fn count_limit_evicts_fifo() {
        let memory = WorkingMemory::new(Capacity {
            max_operations: 3,
            max_tokens: 1_000,
        });
        for i in 0..5 {
            memory.add(op(OperationKind::Command, &format!("op {i}"), 10));
        }
        let recent = memory.recent(10);
        let summaries: Vec<&str> = recent.iter().map(|o| o.summary.as_str()).collect();
        assert_eq!(summaries, vec!["op 2", "op 3", "op 4"]);
        assert_eq!(memory.evicted_total(), 2);
    }

    #[test]
    fn token_limit_evicts_fifo() {
        let memory = WorkingMemory::new(Capacity {
            max_operations: 100,
            max_tokens: 100,
        });
        memory.add(op(OperationKind::Command, "a", 40));
        memory.add(op(OperationKind::Command, "b", 40));
        let evicted = memory.add(op(OperationKind::Command, "c", 40));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].summary, "a");
        assert_eq!(memory.total_tokens(), 80);
    }

    #[test]
    fn limits_hold_after_every_add() {
        let memory = WorkingMemory::new(Capacity {
            max_operations: 7,
            max_tokens: 150,
        });
        for i in 0..200usize {
            memory.add(op(OperationKind::AgentResponse, "x", (i * 37) % 60 + 1));
            assert!(memory.len() <= 7);
            assert!(memory.total_tokens() <= 150);
        }
    }

    #[test]
    fn oversized_operation_is_not_cached() {
        let memory = WorkingMemory::new(Capacity {
            max_operations: 5,
            max_tokens: 50,
        });
        memory.add(op(OperationKind::Command, "small", 10));
        let evicted = memory.add(op(OperationKind::AgentResponse, "huge", 500));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].summary, "huge");
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn by_kind_and_search() {
        let memory = WorkingMemory::new(Capacity {
            max_operations: 10,
            max_tokens: 1_000,
        });
        memory.add(op(OperationKind::FileChange, "edit src/lib.rs", 5));
        memory.add(op(OperationKind::Error, "build failed", 5));
        memory.add(op(OperationKind::FileChange, "edit src/main.rs", 5));

        let files = memory.by_kind(OperationKind::FileChange, 1);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].summary, "edit src/main.rs");

        assert_eq!(memory.search("SRC/").len(), 2);
        assert_eq!(memory.search("error").len(), 1);
        assert!(memory.search("").is_empty());
    }

    #[test]
    fn restore_reproduces_recent() {
        let memory = WorkingMemory::new(Capacity {
            max_operations: 4,
            max_tokens: 1_000,
        });
        for i in 0..6 {
            memory.add(op(OperationKind::Command, &format!("op {i}"), 3));
        }
        let before = memory.snapshot();

        let other = WorkingMemory::new(memory.capacity());
        other.restore(before.clone());
        for k in 0..=before.len() {
            assert_eq!(other.recent(k), memory.recent(k));
        }
    }
}
