//! Versioned markdown documents.
//!
//! Before a [`MemoryDocument`] is rewritten in place, its previous content is
//! saved to the [`VersionStore`]:
//!
//! ```text
//! memory/versions/
//!   decision_log/
//!     v000000-20260101T120000.000Z.md
//!     v000001-20260101T121500.412Z.md
//! ```
//!
//! The store keeps the newest `retention` versions per document and deletes
//! older ones. Appends do not rewrite existing content and are not versioned.

use crate::context::tokens::TokenEstimator;
use crate::error::{RelayError, Result};
use crate::persist::write_atomic;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default number of versions retained per document.
pub const DEFAULT_VERSION_RETENTION: usize = 10;

/// One saved version of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    pub version: u64,
    pub path: PathBuf,
}

/// Append-only, retention-capped store of document versions.
#[derive(Debug, Clone)]
pub struct VersionStore {
    root: PathBuf,
    retention: usize,
}

impl VersionStore {
    pub fn open(root: impl Into<PathBuf>, retention: usize) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            retention: retention.max(1),
        })
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    fn doc_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Save `content` as `version` of document `name`, then prune.
    pub fn save(&self, name: &str, version: u64, content: &str) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = self
            .doc_dir(name)
            .join(format!("v{version:06}-{stamp}.md"));
        write_atomic(&path, content.as_bytes())?;
        let pruned = self.prune(name)?;
        if pruned > 0 {
            debug!("Pruned {pruned} old version(s) of {name}");
        }
        Ok(path)
    }

    /// Saved versions of `name`, oldest first.
    pub fn list(&self, name: &str) -> Result<Vec<VersionEntry>> {
        let dir = self.doc_dir(name);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(version) = file_name
                .strip_prefix('v')
                .and_then(|rest| rest.split('-').next())
                .and_then(|v| v.parse::<u64>().ok())
                && file_name.ends_with(".md")
            {
                entries.push(VersionEntry {
                    version,
                    path: entry.path(),
                });
            }
        }
        entries.sort_by_key(|e| e.version);
        Ok(entries)
    }

    pub fn latest_version(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.list(name)?.last().map(|e| e.version))
    }

    pub fn load(&self, name: &str, version: u64) -> Result<String> {
        let entry = self
            .list(name)?
            .into_iter()
            .find(|e| e.version == version)
            .ok_or_else(|| RelayError::NotFound(format!("{name} version {version}")))?;
        Ok(std::fs::read_to_string(entry.path)?)
    }

    fn prune(&self, name: &str) -> Result<usize> {
        let entries = self.list(name)?;
        let excess = entries.len().saturating_sub(self.retention);
        for entry in entries.iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&entry.path) {
                warn!("Failed to prune {}: {e}", entry.path.display());
            }
        }
        Ok(excess)
    }
}

/// A markdown document on disk with its current version number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MemoryDocument {
    pub path: PathBuf,
    pub content: String,
    pub token_count: usize,
    pub version: u64,
}

impl MemoryDocument {
    /// Load the document at `path` (empty if missing). The version continues
    /// after the newest saved version.
    pub fn load(path: impl Into<PathBuf>, versions: &VersionStore, estimator: &TokenEstimator) -> Result<Self> {
        let path = path.into();
        let content = if path.exists() {
            std::fs::read_to_string(&path)?
        } else {
            String::new()
        };
        let name = doc_name(&path);
        let version = versions.latest_version(&name)?.map_or(0, |v| v + 1);
        Ok(Self {
            token_count: estimator.estimate(&content),
            path,
            content,
            version,
        })
    }

    /// Version name: the file stem.
    pub fn name(&self) -> String {
        doc_name(&self.path)
    }

    /// Rewrite the document: the previous content is versioned first, then
    /// the new content is written atomically.
    pub fn replace(
        &mut self,
        content: String,
        versions: &VersionStore,
        estimator: &TokenEstimator,
    ) -> Result<()> {
        versions.save(&self.name(), self.version, &self.content)?;
        write_atomic(&self.path, content.as_bytes())?;
        self.token_count = estimator.estimate(&content);
        self.content = content;
        self.version += 1;
        Ok(())
    }

    /// Append a line without rewriting existing content.
    pub fn append(&mut self, entry: &str, estimator: &TokenEstimator) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{entry}")?;
        self.content.push_str(entry);
        self.content.push('\n');
        self.token_count = estimator.estimate(&self.content);
        Ok(())
    }

    /// The trailing lines of the document that fit in `max_tokens`.
    pub fn tail(&self, max_tokens: usize, estimator: &TokenEstimator) -> String {
        tail_within(&self.content, max_tokens, estimator)
    }
}

fn doc_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string())
}

/// The trailing whole lines of `text` that fit in `max_tokens`.
pub fn tail_within(text: &str, max_tokens: usize, estimator: &TokenEstimator) -> String {
    let mut lines = Vec::new();
    let mut used = 0usize;
    for line in text.lines().rev() {
        let cost = estimator.estimate(line) + 1;
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        lines.push(line);
    }
    lines.reverse();
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_versions_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let est = TokenEstimator::default();
        let versions = VersionStore::open(dir.path().join("versions"), 10).unwrap();
        let mut doc = MemoryDocument::load(dir.path().join("plan.md"), &versions, &est).unwrap();
        assert_eq!(doc.version, 0);

        doc.replace("first".into(), &versions, &est).unwrap();
        doc.replace("second".into(), &versions, &est).unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(versions.load("plan", 1).unwrap(), "first");
        assert_eq!(std::fs::read_to_string(&doc.path).unwrap(), "second");

        let reloaded = MemoryDocument::load(&doc.path, &versions, &est).unwrap();
        assert_eq!(reloaded.version, 2);
        assert_eq!(reloaded.content, "second");
    }

    #[test]
    fn retention_keeps_newest_versions() {
        let dir = tempfile::tempdir().unwrap();
        let est = TokenEstimator::default();
        let versions = VersionStore::open(dir.path().join("versions"), 3).unwrap();
        let mut doc = MemoryDocument::load(dir.path().join("state.md"), &versions, &est).unwrap();
        for i in 0..8 {
            doc.replace(format!("rev {i}"), &versions, &est).unwrap();
        }
        let kept: Vec<u64> = versions
            .list("state")
            .unwrap()
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(kept, vec![5, 6, 7]);
        assert_eq!(versions.load("state", 7).unwrap(), "rev 6");
    }

    #[test]
    fn append_does_not_version() {
        let dir = tempfile::tempdir().unwrap();
        let est = TokenEstimator::default();
        let versions = VersionStore::open(dir.path().join("versions"), 10).unwrap();
        let mut doc = MemoryDocument::load(dir.path().join("log.md"), &versions, &est).unwrap();
        doc.append("- one", &est).unwrap();
        doc.append("- two", &est).unwrap();
        assert!(versions.list("log").unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&doc.path).unwrap(), "- one\n- two\n");
        assert_eq!(doc.token_count, est.estimate("- one\n- two\n"));
    }

    #[test]
    fn tail_keeps_whole_trailing_lines() {
        let est = TokenEstimator::default();
        let text = "alpha line\nbeta line\ngamma line";
        assert_eq!(tail_within(text, 8, &est), "gamma line");
        assert_eq!(tail_within(text, 100, &est), text);
    }
}
