//! Persisted journal cursor
//!
//! One small durable record per volume. On restart: absent means cold start
//! (full bulk pass); present but no longer retained by the journal means
//! Stalled (full re-seed). The cursor is only ever written after the indexer
//! has fully applied up to `last_applied_usn`, and the write is atomic
//! (tmp file + rename) so a crash can never leave a half-written cursor.

use crate::error::{NexScanError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCursor {
    pub volume_id: String,
    /// Journal identity; a recreated journal invalidates the cursor
    pub journal_id: u64,
    pub last_applied_usn: u64,
    /// Optional index snapshot to warm-start from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

impl PersistedCursor {
    /// Load a cursor; `Ok(None)` when none was ever written. A corrupt file
    /// is treated as absent (cold start) but logged.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(NexScanError::Io(e)),
        };

        match serde_json::from_slice(&data) {
            Ok(cursor) => Ok(Some(cursor)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt cursor file, treating as cold start");
                Ok(None)
            }
        }
    }

    /// Atomically persist the cursor
    pub fn store(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path).map_err(|e| {
            NexScanError::CursorStore(format!("rename {} failed: {}", tmp.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");

        assert!(PersistedCursor::load(&path).unwrap().is_none());

        let cursor = PersistedCursor {
            volume_id: "00DEADBEEF00".into(),
            journal_id: 42,
            last_applied_usn: 1234,
            snapshot_path: Some(dir.path().join("index.json")),
        };
        cursor.store(&path).unwrap();

        let loaded = PersistedCursor::load(&path).unwrap().unwrap();
        assert_eq!(loaded, cursor);
    }

    #[test]
    fn corrupt_cursor_reads_as_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(PersistedCursor::load(&path).unwrap().is_none());
    }
}
