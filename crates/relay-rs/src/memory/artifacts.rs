//! Durable storage for externalized payloads.
//!
//! Large agent responses, file contents and pre-summarization text are
//! moved here and replaced by a reference in the live context. Files are
//! written atomically and never rewritten.

use crate::error::{RelayError, Result};
use crate::persist::{generate_id, write_atomic};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory of `<id>.txt` payload files (`memory/artifacts/`).
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Open the store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.txt"))
    }

    /// Persist `content` and return its new artifact id.
    pub fn store(&self, content: &str) -> Result<String> {
        let id = generate_id("art");
        write_atomic(&self.path_for(&id), content.as_bytes())?;
        debug!("Stored artifact {id} ({} bytes)", content.len());
        Ok(id)
    }

    pub fn load(&self, id: &str) -> Result<String> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(RelayError::NotFound(format!("artifact {id}")));
        }
        Ok(std::fs::read_to_string(path)?)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.path_for(id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("artifacts")).unwrap();
        let id = store.store("fn main() {}").unwrap();
        assert!(store.exists(&id));
        assert_eq!(store.load(&id).unwrap(), "fn main() {}");
    }

    #[test]
    fn missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        assert!(matches!(store.load("art-nope"), Err(RelayError::NotFound(_))));
    }
}
