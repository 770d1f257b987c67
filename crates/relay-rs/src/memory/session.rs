//! Session memory: the narrative and operation log of one session.
//!
//! Every recorded operation is appended to a JSONL log (synced before
//! `record` returns) and to a markdown narrative. When the narrative grows
//! past its limit it is compressed in place, with the previous text saved as
//! a version. The JSONL log is never compressed, so the full operation
//! history survives any number of compressions.

use crate::context::operation::{Operation, OperationKind};
use crate::context::summarizer::{Summarizer, is_marker_line};
use crate::context::tokens::TokenEstimator;
use crate::error::{RelayError, Result};
use crate::memory::compression::compress_document;
use crate::memory::document::{MemoryDocument, VersionStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionMemoryConfig {
    /// Narrative size that triggers compression.
    pub compress_above_tokens: usize,
    /// Decisions kept verbatim through compression.
    pub keep_decisions: usize,
}

impl Default for SessionMemoryConfig {
    fn default() -> Self {
        Self {
            compress_above_tokens: 40_000,
            keep_decisions: 10,
        }
    }
}

/// Pointer to the session's persisted memory, stored in checkpoints.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionRef {
    pub session_id: String,
    pub narrative_path: PathBuf,
    pub operations_path: PathBuf,
    pub operation_count: u64,
    pub narrative_version: u64,
}

/// Where an archived session ended up.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedSession {
    pub narrative: PathBuf,
    pub operations: PathBuf,
}

struct Inner {
    narrative: MemoryDocument,
    operation_count: u64,
}

pub struct SessionMemoryManager {
    session_id: String,
    sessions_dir: PathBuf,
    operations_path: PathBuf,
    versions: VersionStore,
    summarizer: Arc<dyn Summarizer>,
    estimator: TokenEstimator,
    config: SessionMemoryConfig,
    inner: Mutex<Inner>,
}

impl SessionMemoryManager {
    /// Open (or continue) the session under `memory_root`.
    pub fn open(
        memory_root: &Path,
        session_id: impl Into<String>,
        versions: VersionStore,
        summarizer: Arc<dyn Summarizer>,
        estimator: TokenEstimator,
        config: SessionMemoryConfig,
    ) -> Result<Self> {
        let session_id = session_id.into();
        let sessions_dir = memory_root.join("sessions");
        std::fs::create_dir_all(&sessions_dir)?;
        let narrative_path = sessions_dir.join(format!("{session_id}.md"));
        let operations_path = sessions_dir.join(format!("{session_id}.ops.jsonl"));

        let narrative = MemoryDocument::load(narrative_path, &versions, &estimator)?;
        let operation_count = if operations_path.exists() {
            let file = std::fs::File::open(&operations_path)?;
            std::io::BufReader::new(file)
                .lines()
                .map_while(|l| l.ok())
                .filter(|l| !l.trim().is_empty())
                .count() as u64
        } else {
            0
        };

        Ok(Self {
            session_id,
            sessions_dir,
            operations_path,
            versions,
            summarizer,
            estimator,
            config,
            inner: Mutex::new(Inner {
                narrative,
                operation_count,
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Durably record one operation, compressing the narrative if needed.
    pub async fn record(&self, op: &Operation) -> Result<()> {
        let over_limit = {
            let mut inner = self.lock();
            let line = serde_json::to_string(op)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.operations_path)?;
            writeln!(file, "{line}")?;
            file.sync_data()?;
            inner.operation_count += 1;

            inner
                .narrative
                .append(&narrative_line(op), &self.estimator)?;
            inner.narrative.token_count > self.config.compress_above_tokens
        };
        if over_limit {
            self.compress().await?;
        }
        Ok(())
    }

    /// Compress the narrative now. The prior text is versioned first.
    pub async fn compress(&self) -> Result<()> {
        let (original, before) = {
            let inner = self.lock();
            (inner.narrative.content.clone(), inner.narrative.token_count)
        };
        let label = format!("session {}", self.session_id);
        let mut compressed = compress_document(
            &original,
            &label,
            self.config.keep_decisions,
            self.summarizer.as_ref(),
            &self.estimator,
        )
        .await?;

        let mut inner = self.lock();
        // Lines appended while the summarizer ran are carried over as-is.
        if let Some(tail) = inner.narrative.content.strip_prefix(original.as_str())
            && !tail.is_empty()
        {
            compressed.push_str(tail);
        }
        inner
            .narrative
            .replace(compressed, &self.versions, &self.estimator)?;
        info!(
            "Compressed session narrative {}: {before} -> {} tokens (v{})",
            self.session_id, inner.narrative.token_count, inner.narrative.version
        );
        Ok(())
    }

    /// Every recorded operation, oldest first. Malformed lines are skipped.
    pub fn operations(&self) -> Result<Vec<Operation>> {
        if !self.operations_path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.operations_path)?;
        let mut ops = Vec::new();
        for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Operation>(&line) {
                Ok(op) => ops.push(op),
                Err(e) => warn!("Skipping malformed operation at line {}: {e}", n + 1),
            }
        }
        Ok(ops)
    }

    pub fn operation_count(&self) -> u64 {
        self.lock().operation_count
    }

    pub fn narrative(&self) -> String {
        self.lock().narrative.content.clone()
    }

    pub fn narrative_tokens(&self) -> usize {
        self.lock().narrative.token_count
    }

    /// The most recent narrative lines within `max_tokens`.
    pub fn tail(&self, max_tokens: usize) -> String {
        self.lock().narrative.tail(max_tokens, &self.estimator)
    }

    pub fn reference(&self) -> SessionRef {
        let inner = self.lock();
        SessionRef {
            session_id: self.session_id.clone(),
            narrative_path: inner.narrative.path.clone(),
            operations_path: self.operations_path.clone(),
            operation_count: inner.operation_count,
            narrative_version: inner.narrative.version,
        }
    }

    /// Move the session's files into `sessions/archive/`.
    pub fn archive(self) -> Result<ArchivedSession> {
        let archive_dir = self.sessions_dir.join("archive");
        std::fs::create_dir_all(&archive_dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let narrative_src = self.lock().narrative.path.clone();
        let narrative = archive_dir.join(format!("{}-{stamp}.md", self.session_id));
        let operations = archive_dir.join(format!("{}-{stamp}.ops.jsonl", self.session_id));

        if narrative_src.exists() {
            std::fs::rename(&narrative_src, &narrative)?;
        }
        if self.operations_path.exists() {
            std::fs::rename(&self.operations_path, &operations)?;
        }
        if !narrative.exists() && !operations.exists() {
            return Err(RelayError::NotFound(format!(
                "session {} has nothing to archive",
                self.session_id
            )));
        }
        info!("Archived session {} to {}", self.session_id, archive_dir.display());
        Ok(ArchivedSession {
            narrative,
            operations,
        })
    }
}

/// Narrative rendering of an operation. Decisions and errors get a marker
/// prefix so compression keeps them.
fn narrative_line(op: &Operation) -> String {
    let summary = op.summary.replace('\n', " ");
    let time = op.timestamp.format("%H:%M:%S");
    let marked = if is_marker_line(&summary) {
        Some(summary.clone())
    } else {
        match op.kind {
            OperationKind::Decision => Some(format!("DECISION: {summary}")),
            OperationKind::Error => Some(format!("ISSUE: {summary}")),
            _ => None,
        }
    };
    match marked {
        // The marker must lead the line for compression to find it.
        Some(body) => format!("- {body} ({time})"),
        None => format!("- [{time}] {}: {summary}", op.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::summarizer::ExtractiveSummarizer;

    fn open(dir: &Path, config: SessionMemoryConfig) -> SessionMemoryManager {
        let est = TokenEstimator::default();
        let versions = VersionStore::open(dir.join("versions"), 10).unwrap();
        SessionMemoryManager::open(
            dir,
            "s-test",
            versions,
            Arc::new(ExtractiveSummarizer::new(est)),
            est,
            config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn records_to_log_and_narrative() {
        let dir = tempfile::tempdir().unwrap();
        let est = TokenEstimator::default();
        let mem = open(dir.path(), SessionMemoryConfig::default());
        mem.record(&Operation::new(OperationKind::Command, "cargo test", &est))
            .await
            .unwrap();
        mem.record(&Operation::new(OperationKind::Decision, "proceed", &est))
            .await
            .unwrap();
        assert_eq!(mem.operation_count(), 2);
        assert_eq!(mem.operations().unwrap().len(), 2);
        assert!(mem.narrative().contains("DECISION: proceed"));
    }

    #[tokio::test]
    async fn compression_keeps_full_log() {
        let dir = tempfile::tempdir().unwrap();
        let est = TokenEstimator::default();
        let config = SessionMemoryConfig {
            compress_above_tokens: 2_000,
            keep_decisions: 10,
        };
        let mem = open(dir.path(), config);
        for i in 0..200 {
            let kind = if i % 10 == 0 {
                OperationKind::Decision
            } else {
                OperationKind::Command
            };
            mem.record(&Operation::new(kind, format!("step {i} ran a long command line"), &est))
                .await
                .unwrap();
        }
        assert!(mem.narrative_tokens() <= 2_000);
        assert_eq!(mem.operations().unwrap().len(), 200);
        assert!(mem.narrative().contains("DECISION: step 190"));
        assert!(mem.reference().narrative_version >= 1);
    }

    #[tokio::test]
    async fn reopen_continues_count() {
        let dir = tempfile::tempdir().unwrap();
        let est = TokenEstimator::default();
        {
            let mem = open(dir.path(), SessionMemoryConfig::default());
            mem.record(&Operation::new(OperationKind::TaskStep, "start", &est))
                .await
                .unwrap();
        }
        let mem = open(dir.path(), SessionMemoryConfig::default());
        assert_eq!(mem.operation_count(), 1);
        assert!(mem.narrative().contains("start"));
    }

    #[tokio::test]
    async fn archive_moves_files() {
        let dir = tempfile::tempdir().unwrap();
        let est = TokenEstimator::default();
        let mem = open(dir.path(), SessionMemoryConfig::default());
        mem.record(&Operation::new(OperationKind::TaskStep, "start", &est))
            .await
            .unwrap();
        let archived = mem.archive().unwrap();
        assert!(archived.narrative.exists());
        assert!(archived.operations.exists());
        assert!(!dir.path().join("sessions/s-test.md").exists());
    }
}
