//! Episodic memory: project-level documents that outlive a session.
//!
//! Three markdown documents live under `memory/episodic/`: the project
//! state, the work plan and the decision log. Every write, appends included,
//! versions the previous content first. A document over its limit is
//! compressed, keeping the newest decisions verbatim.

use crate::agent::decision::DecisionRecord;
use crate::context::summarizer::Summarizer;
use crate::context::tokens::TokenEstimator;
use crate::error::Result;
use crate::memory::compression::compress_document;
use crate::memory::document::{MemoryDocument, VersionStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EpisodicDoc {
    ProjectState,
    WorkPlan,
    DecisionLog,
}

impl EpisodicDoc {
    pub const ALL: [EpisodicDoc; 3] = [
        EpisodicDoc::ProjectState,
        EpisodicDoc::WorkPlan,
        EpisodicDoc::DecisionLog,
    ];

    pub fn file_stem(&self) -> &'static str {
        match self {
            EpisodicDoc::ProjectState => "project_state",
            EpisodicDoc::WorkPlan => "work_plan",
            EpisodicDoc::DecisionLog => "decision_log",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            EpisodicDoc::ProjectState => "Project state",
            EpisodicDoc::WorkPlan => "Work plan",
            EpisodicDoc::DecisionLog => "Decision log",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EpisodicMemoryConfig {
    pub compress_above_tokens: usize,
    pub keep_decisions: usize,
}

impl Default for EpisodicMemoryConfig {
    fn default() -> Self {
        Self {
            compress_above_tokens: 30_000,
            keep_decisions: 10,
        }
    }
}

/// Checkpointed pointer to one episodic document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DocumentRef {
    pub doc: EpisodicDoc,
    pub path: PathBuf,
    pub version: u64,
    pub token_count: usize,
}

pub struct EpisodicMemoryManager {
    versions: VersionStore,
    summarizer: Arc<dyn Summarizer>,
    estimator: TokenEstimator,
    config: EpisodicMemoryConfig,
    docs: Mutex<HashMap<EpisodicDoc, MemoryDocument>>,
}

impl EpisodicMemoryManager {
    pub fn open(
        memory_root: &Path,
        versions: VersionStore,
        summarizer: Arc<dyn Summarizer>,
        estimator: TokenEstimator,
        config: EpisodicMemoryConfig,
    ) -> Result<Self> {
        let dir = memory_root.join("episodic");
        std::fs::create_dir_all(&dir)?;
        let mut docs = HashMap::new();
        for doc in EpisodicDoc::ALL {
            let path = dir.join(format!("{}.md", doc.file_stem()));
            docs.insert(doc, MemoryDocument::load(path, &versions, &estimator)?);
        }
        Ok(Self {
            versions,
            summarizer,
            estimator,
            config,
            docs: Mutex::new(docs),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EpisodicDoc, MemoryDocument>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_doc<T>(&self, doc: EpisodicDoc, f: impl FnOnce(&mut MemoryDocument) -> T) -> Option<T> {
        self.lock().get_mut(&doc).map(f)
    }

    pub fn read(&self, doc: EpisodicDoc) -> String {
        self.with_doc(doc, |d| d.content.clone()).unwrap_or_default()
    }

    /// Replace a document. The previous content is versioned first.
    pub async fn write(&self, doc: EpisodicDoc, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        let over = self
            .with_doc(doc, |d| -> Result<bool> {
                d.replace(content, &self.versions, &self.estimator)?;
                Ok(d.token_count > self.config.compress_above_tokens)
            })
            .transpose()?
            .unwrap_or(false);
        if over {
            self.compress(doc).await?;
        }
        Ok(())
    }

    /// Append an entry to a document. Versioned like a rewrite.
    pub async fn append(&self, doc: EpisodicDoc, entry: &str) -> Result<()> {
        let over = self
            .with_doc(doc, |d| -> Result<bool> {
                let content = format!("{}{entry}\n", d.content);
                d.replace(content, &self.versions, &self.estimator)?;
                Ok(d.token_count > self.config.compress_above_tokens)
            })
            .transpose()?
            .unwrap_or(false);
        if over {
            self.compress(doc).await?;
        }
        Ok(())
    }

    pub async fn record_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.append(EpisodicDoc::DecisionLog, &record.to_markdown())
            .await
    }

    /// Compress a document now, keeping the newest decisions.
    pub async fn compress(&self, doc: EpisodicDoc) -> Result<()> {
        let Some((original, before)) = self.with_doc(doc, |d| (d.content.clone(), d.token_count))
        else {
            return Ok(());
        };
        let mut compressed = compress_document(
            &original,
            doc.title(),
            self.config.keep_decisions,
            self.summarizer.as_ref(),
            &self.estimator,
        )
        .await?;
        self.with_doc(doc, |d| -> Result<()> {
            if let Some(tail) = d.content.strip_prefix(original.as_str())
                && !tail.is_empty()
            {
                compressed.push_str(tail);
            }
            d.replace(compressed, &self.versions, &self.estimator)?;
            info!(
                "Compressed {}: {before} -> {} tokens (v{})",
                doc.file_stem(),
                d.token_count,
                d.version
            );
            Ok(())
        })
        .transpose()?;
        Ok(())
    }

    /// The newest part of a document within `max_tokens`, for prompts.
    pub fn excerpt(&self, doc: EpisodicDoc, max_tokens: usize) -> String {
        self.with_doc(doc, |d| d.tail(max_tokens, &self.estimator))
            .unwrap_or_default()
    }

    pub fn references(&self) -> Vec<DocumentRef> {
        let docs = self.lock();
        EpisodicDoc::ALL
            .iter()
            .filter_map(|doc| {
                docs.get(doc).map(|d| DocumentRef {
                    doc: *doc,
                    path: d.path.clone(),
                    version: d.version,
                    token_count: d.token_count,
                })
            })
            .collect()
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::decision::Action;
    use crate::context::summarizer::ExtractiveSummarizer;

    fn open(dir: &Path, config: EpisodicMemoryConfig) -> EpisodicMemoryManager {
        let est = TokenEstimator::default();
        let versions = VersionStore::open(dir.join("versions"), 10).unwrap();
        EpisodicMemoryManager::open(
            dir,
            versions,
            Arc::new(ExtractiveSummarizer::new(est)),
            est,
            config,
        )
        .unwrap()
    }

    fn record(n: usize) -> DecisionRecord {
        DecisionRecord::new(
            "task-1",
            n as u32,
            Action::Proceed,
            0.9,
            format!("turn {n} passed validation with quality 0.90"),
        )
    }

    #[tokio::test]
    async fn write_versions_prior_content() {
        let dir = tempfile::tempdir().unwrap();
        let mem = open(dir.path(), EpisodicMemoryConfig::default());
        mem.write(EpisodicDoc::WorkPlan, "1. design").await.unwrap();
        mem.write(EpisodicDoc::WorkPlan, "1. design\n2. build")
            .await
            .unwrap();
        assert_eq!(mem.read(EpisodicDoc::WorkPlan), "1. design\n2. build");
        assert_eq!(mem.versions().load("work_plan", 1).unwrap(), "1. design");
    }

    #[tokio::test]
    async fn appends_are_versioned() {
        let dir = tempfile::tempdir().unwrap();
        let mem = open(dir.path(), EpisodicMemoryConfig::default());
        mem.record_decision(&record(1)).await.unwrap();
        let after_first = mem.read(EpisodicDoc::DecisionLog);
        mem.record_decision(&record(2)).await.unwrap();

        let versions = mem.versions().list("decision_log").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(mem.versions().load("decision_log", 0).unwrap(), "");
        assert_eq!(mem.versions().load("decision_log", 1).unwrap(), after_first);
        assert!(mem.read(EpisodicDoc::DecisionLog).starts_with(&after_first));
        let on_disk = std::fs::read_to_string(dir.path().join("episodic/decision_log.md")).unwrap();
        assert_eq!(on_disk, mem.read(EpisodicDoc::DecisionLog));
    }

    #[tokio::test]
    async fn decision_log_compresses_and_keeps_recent() {
        let dir = tempfile::tempdir().unwrap();
        let mem = open(
            dir.path(),
            EpisodicMemoryConfig {
                compress_above_tokens: 1_500,
                keep_decisions: 3,
            },
        );
        for n in 0..60 {
            mem.record_decision(&record(n)).await.unwrap();
        }
        let log = mem.read(EpisodicDoc::DecisionLog);
        assert!(log.contains("task-1 turn 59"));
        let refs = mem.references();
        let log_ref = refs
            .iter()
            .find(|r| r.doc == EpisodicDoc::DecisionLog)
            .unwrap();
        assert!(log_ref.token_count <= 1_500);
        assert!(log_ref.version >= 1);
    }

    #[tokio::test]
    async fn excerpt_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mem = open(dir.path(), EpisodicMemoryConfig::default());
        let state: String = (0..100).map(|i| format!("line {i}\n")).collect();
        mem.write(EpisodicDoc::ProjectState, state).await.unwrap();
        let excerpt = mem.excerpt(EpisodicDoc::ProjectState, 20);
        assert!(excerpt.ends_with("line 99"));
        assert!(!excerpt.contains("line 0\n"));
    }
}
