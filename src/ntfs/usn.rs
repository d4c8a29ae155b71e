//! USN journal record decoding
//!
//! Turns raw journal buffers into typed `ChangeEvent`s. The journal reports a
//! rename as a pair of records (RENAME_OLD_NAME then RENAME_NEW_NAME); the
//! `RenameCoalescer` folds the pair into a single `Renamed` event carrying
//! both locations, which is what the indexer needs to move one entry.

use crate::index::entry::FileRef;
use crate::ntfs::structs::{usn_reason, UsnRecord};
use std::collections::HashMap;

// ============================================================================
// Change events
// ============================================================================

/// What happened to a file, as far as the index cares
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    Created,
    Deleted,
    Renamed { old_parent: FileRef, old_name: String },
    DataModified,
    AttributesChanged,
}

/// One mutation applied to the index, in strict `usn` order
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Journal sequence number; strictly increasing per volume
    pub usn: u64,
    pub kind: ChangeKind,
    pub id: FileRef,
    /// Parent after the change (for renames: the new parent)
    pub parent: FileRef,
    /// Name after the change (for renames: the new name)
    pub name: String,
    /// Record timestamp (FILETIME)
    pub timestamp: u64,
    pub attributes: u32,
}

// ============================================================================
// Batch decoding
// ============================================================================

/// Walk a FSCTL_READ_USN_JOURNAL-shaped buffer: 8 bytes of next-USN followed
/// by length-prefixed records. Malformed records end the walk (the next read
/// restarts from the returned cursor).
pub fn decode_usn_batch(buffer: &[u8]) -> (u64, Vec<UsnRecord>) {
    if buffer.len() < 8 {
        return (0, Vec::new());
    }

    let next_usn = u64::from_le_bytes(buffer[0..8].try_into().unwrap());
    let mut records = Vec::new();
    let mut offset = 8;

    while offset + 8 <= buffer.len() {
        let record_len =
            u32::from_le_bytes(buffer[offset..offset + 4].try_into().unwrap()) as usize;

        // Sanity-check the length before trusting it
        if record_len < 60 || record_len > 0x10000 || offset + record_len > buffer.len() {
            break;
        }

        if let Some(record) = UsnRecord::from_bytes(&buffer[offset..offset + record_len]) {
            records.push(record);
        }

        offset += record_len;
    }

    (next_usn, records)
}

// ============================================================================
// Reason classification and rename coalescing
// ============================================================================

const ATTRIBUTE_REASONS: u32 = usn_reason::BASIC_INFO_CHANGE
    | usn_reason::EA_CHANGE
    | usn_reason::SECURITY_CHANGE
    | usn_reason::COMPRESSION_CHANGE
    | usn_reason::ENCRYPTION_CHANGE
    | usn_reason::REPARSE_POINT_CHANGE
    | usn_reason::HARD_LINK_CHANGE;

const DATA_REASONS: u32 =
    usn_reason::DATA_OVERWRITE | usn_reason::DATA_EXTEND | usn_reason::DATA_TRUNCATION;

#[derive(Debug, Clone)]
struct PendingRename {
    parent: FileRef,
    name: String,
}

/// Folds raw USN records into `ChangeEvent`s, pairing rename halves.
///
/// Reason bits accumulate on a file's records until its handle closes, so one
/// record can carry several reasons; classification picks the strongest.
/// Delete wins over everything — a create-then-delete close record must not
/// resurrect the file in the index.
#[derive(Debug, Default)]
pub struct RenameCoalescer {
    pending: HashMap<u64, PendingRename>,
}

impl RenameCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rename-old halves waiting for their new-name record
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one record; returns an event when one is ready
    pub fn fold(&mut self, record: &UsnRecord) -> Option<ChangeEvent> {
        let id = FileRef::from_raw(record.file_reference_number);
        let parent = FileRef::from_raw(record.parent_file_reference_number);
        let reason = record.reason;

        let kind = if reason & usn_reason::FILE_DELETE != 0 {
            self.pending.remove(&record.file_reference_number);
            ChangeKind::Deleted
        } else if reason & usn_reason::RENAME_NEW_NAME != 0 {
            // Pair with the stashed old half when we saw one; an unpaired new
            // half (old half outside the read window) degrades to a rename
            // whose old location equals the record's own
            let old = self.pending.remove(&record.file_reference_number);
            let (old_parent, old_name) = match old {
                Some(p) => (p.parent, p.name),
                None => (parent, record.file_name.clone()),
            };
            ChangeKind::Renamed { old_parent, old_name }
        } else if reason & usn_reason::RENAME_OLD_NAME != 0 {
            self.pending.insert(
                record.file_reference_number,
                PendingRename {
                    parent,
                    name: record.file_name.clone(),
                },
            );
            return None;
        } else if reason & usn_reason::FILE_CREATE != 0 {
            ChangeKind::Created
        } else if reason & DATA_REASONS != 0 {
            ChangeKind::DataModified
        } else if reason & ATTRIBUTE_REASONS != 0 {
            ChangeKind::AttributesChanged
        } else {
            // CLOSE-only or bookkeeping records carry nothing to apply
            return None;
        };

        Some(ChangeEvent {
            usn: record.usn,
            kind,
            id,
            parent,
            name: record.file_name.clone(),
            timestamp: record.timestamp,
            attributes: record.file_attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(usn: u64, frn: u64, parent: u64, name: &str, reason: u32) -> UsnRecord {
        UsnRecord {
            record_length: 60 + name.len() as u32 * 2,
            major_version: 2,
            file_reference_number: frn,
            parent_file_reference_number: parent,
            usn,
            timestamp: 0,
            reason,
            file_attributes: 0,
            file_name: name.to_string(),
        }
    }

    fn frn(rec: u64, seq: u16) -> u64 {
        FileRef::from_parts(rec, seq).0
    }

    #[test]
    fn rename_halves_coalesce_into_one_event() {
        let mut c = RenameCoalescer::new();
        let id = frn(20, 1);

        let old = record(100, id, frn(6, 1), "a.txt", usn_reason::RENAME_OLD_NAME);
        assert!(c.fold(&old).is_none());
        assert_eq!(c.pending_len(), 1);

        let new = record(
            101,
            id,
            frn(5, 5),
            "b.txt",
            usn_reason::RENAME_NEW_NAME | usn_reason::CLOSE,
        );
        let ev = c.fold(&new).unwrap();
        assert_eq!(ev.usn, 101);
        assert_eq!(ev.name, "b.txt");
        assert_eq!(ev.parent, FileRef::from_parts(5, 5));
        match ev.kind {
            ChangeKind::Renamed { old_parent, ref old_name } => {
                assert_eq!(old_parent, FileRef::from_parts(6, 1));
                assert_eq!(old_name, "a.txt");
            }
            ref other => panic!("expected Renamed, got {:?}", other),
        }
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn unpaired_new_name_still_produces_a_rename() {
        let mut c = RenameCoalescer::new();
        let ev = c
            .fold(&record(
                50,
                frn(20, 1),
                frn(5, 5),
                "b.txt",
                usn_reason::RENAME_NEW_NAME,
            ))
            .unwrap();
        assert!(matches!(ev.kind, ChangeKind::Renamed { .. }));
    }

    #[test]
    fn delete_beats_accumulated_create_bit() {
        let mut c = RenameCoalescer::new();
        let ev = c
            .fold(&record(
                7,
                frn(30, 2),
                frn(5, 5),
                "tmp.bin",
                usn_reason::FILE_CREATE | usn_reason::FILE_DELETE | usn_reason::CLOSE,
            ))
            .unwrap();
        assert_eq!(ev.kind, ChangeKind::Deleted);
    }

    #[test]
    fn delete_clears_a_pending_rename_half() {
        let mut c = RenameCoalescer::new();
        let id = frn(21, 1);
        c.fold(&record(1, id, frn(5, 5), "x", usn_reason::RENAME_OLD_NAME));
        let ev = c
            .fold(&record(2, id, frn(5, 5), "x", usn_reason::FILE_DELETE))
            .unwrap();
        assert_eq!(ev.kind, ChangeKind::Deleted);
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn close_only_records_are_ignored() {
        let mut c = RenameCoalescer::new();
        assert!(c
            .fold(&record(3, frn(22, 1), frn(5, 5), "y", usn_reason::CLOSE))
            .is_none());
    }

    #[test]
    fn data_and_attribute_reasons_classify() {
        let mut c = RenameCoalescer::new();
        let ev = c
            .fold(&record(
                4,
                frn(23, 1),
                frn(5, 5),
                "z",
                usn_reason::DATA_EXTEND | usn_reason::CLOSE,
            ))
            .unwrap();
        assert_eq!(ev.kind, ChangeKind::DataModified);

        let ev = c
            .fold(&record(
                5,
                frn(23, 1),
                frn(5, 5),
                "z",
                usn_reason::BASIC_INFO_CHANGE,
            ))
            .unwrap();
        assert_eq!(ev.kind, ChangeKind::AttributesChanged);
    }
}
