//! Error types for NexScan
//!
//! One taxonomy for the whole pipeline. The important split is
//! `is_recoverable()`: record-local failures are skipped and logged, while
//! volume-level failures (permission, journal gap, dismount) propagate to
//! `index_status` so callers can surface a rebuilding/unavailable state.

use crate::index::entry::FileRef;
use thiserror::Error;

/// Main error type for NexScan operations
#[derive(Error, Debug)]
pub enum NexScanError {
    #[error("Failed to open volume '{0}': {1}")]
    VolumeOpen(String, std::io::Error),

    #[error("Access denied opening '{0}' (raw volume reads require elevation)")]
    PermissionDenied(String),

    #[error("Volume '{0}' is not an NTFS filesystem")]
    NotNtfs(String),

    #[error("Invalid MFT record at index {0}: {1}")]
    InvalidRecord(u64, String),

    #[error("Fixup verification failed at record {0}")]
    FixupMismatch(u64),

    #[error("Invalid attribute at offset {0}: {1}")]
    InvalidAttribute(u32, String),

    #[error("USN Journal error: {0}")]
    Journal(String),

    #[error("USN Journal not active on volume '{0}'")]
    JournalInactive(String),

    #[error("Journal gap: cursor {cursor} is older than the retained window (oldest {oldest})")]
    JournalGap { cursor: u64, oldest: u64 },

    #[error("Event usn {usn} is not after last applied usn {last_applied}")]
    OutOfOrderEvent { usn: u64, last_applied: u64 },

    #[error("Parent chain of {0} contains a cycle")]
    BrokenChain(FileRef),

    #[error("Entry {0} is orphaned (parent not indexed)")]
    Orphaned(FileRef),

    #[error("Volume '{0}' is unavailable")]
    VolumeUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Buffer too small: needed {needed}, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("Cursor store error: {0}")]
    CursorStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type alias for NexScan operations
pub type Result<T> = std::result::Result<T, NexScanError>;

impl NexScanError {
    /// Check if this error is local to one record or entry (the scan or
    /// stream can skip it and continue). Everything else compromises the
    /// volume's consistency and must surface through `index_status`.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NexScanError::InvalidRecord(_, _)
                | NexScanError::FixupMismatch(_)
                | NexScanError::InvalidAttribute(_, _)
                | NexScanError::BrokenChain(_)
                | NexScanError::Orphaned(_)
        )
    }
}
