//! Small persistence helpers shared by the memory and checkpoint stores.
//!
//! Every file the orchestrator rewrites goes through [`write_atomic`], so a
//! crash mid-write leaves either the old file or the new one, never a torn
//! mix of both.

use crate::error::{RelayError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Generate a unique, time-ordered identifier with the given prefix.
///
/// Format: `{prefix}-{nanos:x}-{counter:04x}`. The counter disambiguates
/// calls that land in the same clock tick.
pub fn generate_id(prefix: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{ts:x}-{count:04x}")
}

/// Atomic write: write to a hidden temp file next to `path`, then rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| RelayError::NotFound(format!("parent of {}", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{file_name}.tmp"));

    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_atomic(path, json.as_bytes())
}

/// Read and parse a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(RelayError::NotFound(path.display().to_string()));
    }
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_prefixed() {
        let a = generate_id("cp");
        let b = generate_id("cp");
        assert!(a.starts_with("cp-"));
        assert_ne!(a, b);
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_json_atomic(&path, &serde_json::json!({"k": 1})).unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("nested").join(".state.json.tmp").exists());
        let back: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(back["k"], 1);
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_json::<serde_json::Value>(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }
}
