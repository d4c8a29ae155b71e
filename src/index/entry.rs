//! Index entry types
//!
//! `FileRef` is the stable identifier the whole index is keyed on. It packs
//! the NTFS file reference number exactly: the low 48 bits are the MFT record
//! number (the slot), the high 16 bits are the sequence counter that
//! distinguishes successive reuses of that slot. Identity therefore survives
//! renames but not slot reuse — a changed sequence means a different file.

use crate::ntfs::structs::{file_attributes, filetime_to_datetime, FILE_REF_RECORD_MASK, ROOT_RECORD_NUMBER};
use serde::{Deserialize, Serialize};

/// Packed volume-unique file identifier (record number + sequence counter)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileRef(pub u64);

impl FileRef {
    pub const fn from_raw(raw: u64) -> Self {
        FileRef(raw)
    }

    pub const fn from_parts(record_number: u64, sequence: u16) -> Self {
        FileRef(((sequence as u64) << 48) | (record_number & FILE_REF_RECORD_MASK))
    }

    /// MFT record number (the storage slot)
    pub const fn record_number(self) -> u64 {
        self.0 & FILE_REF_RECORD_MASK
    }

    /// Sequence (generation) counter for the slot
    pub const fn sequence(self) -> u16 {
        (self.0 >> 48) as u16
    }

    /// Is this the volume root directory? The root's parent reference points
    /// back at the root itself, which is what path walks terminate on.
    pub const fn is_root(self) -> bool {
        self.record_number() == ROOT_RECORD_NUMBER
    }
}

impl std::fmt::Display for FileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.record_number(), self.sequence())
    }
}

/// One live file or directory in the index.
///
/// The full path is never stored; it is derived on demand by walking `parent`
/// links, so a rename touches exactly one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: FileRef,
    /// Parent reference; the root references itself
    pub parent: FileRef,
    /// Leaf name only
    pub name: String,
    pub is_directory: bool,
    /// File size in bytes (0 for directories)
    pub size: u64,
    /// Allocated size on disk
    pub allocated_size: u64,
    /// Creation time (FILETIME)
    pub created: u64,
    /// Last modification time (FILETIME)
    pub modified: u64,
    /// Last access time (FILETIME)
    pub accessed: u64,
    /// NTFS attribute bits (hidden, system, read-only, reparse, ...)
    pub attributes: u32,
    pub hard_link_count: u16,
    /// Reserved for future content indexing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_tag: Option<String>,
}

impl IndexEntry {
    pub fn is_hidden(&self) -> bool {
        (self.attributes & file_attributes::HIDDEN) != 0
    }

    pub fn is_system(&self) -> bool {
        (self.attributes & file_attributes::SYSTEM) != 0
    }

    pub fn is_readonly(&self) -> bool {
        (self.attributes & file_attributes::READONLY) != 0
    }

    pub fn is_reparse_point(&self) -> bool {
        (self.attributes & file_attributes::REPARSE_POINT) != 0
    }

    pub fn is_compressed(&self) -> bool {
        (self.attributes & file_attributes::COMPRESSED) != 0
    }

    /// Lowercase extension without the dot, if any (directories have none)
    pub fn extension(&self) -> Option<String> {
        if self.is_directory {
            return None;
        }
        match self.name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                Some(ext.to_ascii_lowercase())
            }
            _ => None,
        }
    }

    pub fn modified_at(&self) -> chrono::DateTime<chrono::Utc> {
        filetime_to_datetime(self.modified)
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        filetime_to_datetime(self.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ref_packs_record_and_sequence() {
        let r = FileRef::from_parts(0x1234_5678_9ABC, 42);
        assert_eq!(r.record_number(), 0x1234_5678_9ABC);
        assert_eq!(r.sequence(), 42);
        assert_eq!(FileRef::from_raw(r.0), r);
    }

    #[test]
    fn root_is_detected_by_record_number() {
        assert!(FileRef::from_parts(5, 5).is_root());
        assert!(FileRef::from_parts(5, 1).is_root());
        assert!(!FileRef::from_parts(16, 5).is_root());
    }

    #[test]
    fn extension_rules() {
        let mut e = IndexEntry {
            id: FileRef::from_parts(16, 1),
            parent: FileRef::from_parts(5, 5),
            name: "report.PDF".into(),
            is_directory: false,
            size: 10,
            allocated_size: 4096,
            created: 0,
            modified: 0,
            accessed: 0,
            attributes: 0,
            hard_link_count: 1,
            content_tag: None,
        };
        assert_eq!(e.extension().as_deref(), Some("pdf"));

        e.name = ".gitignore".into();
        assert_eq!(e.extension(), None);

        e.name = "Makefile".into();
        assert_eq!(e.extension(), None);

        e.name = "archive.tar.gz".into();
        assert_eq!(e.extension().as_deref(), Some("gz"));

        e.is_directory = true;
        e.name = "src.old".into();
        assert_eq!(e.extension(), None);
    }
}
