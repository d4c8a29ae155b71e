//! NTFS on-disk format support
//!
//! - Pure binary parsing of MFT records, boot sectors, and USN journal
//!   records (`structs`, `usn`)
//! - Bulk MFT reading over any volume backend (`mft`)
//! - Live volume and journal access via Win32 (`winapi`, Windows only)

pub mod mft;
pub mod structs;
pub mod usn;

#[cfg(windows)]
pub mod winapi;

pub use mft::{parse_mft_record, MftReader, ParsedRecord, ScanOptions, ScanStats};
pub use structs::{
    AttributeType, BootSector, DataRun, FileNameAttribute, FilenameNamespace, MftRecordHeader,
    StandardInformation, UsnJournalData, UsnRecord, VolumeGeometry,
};
pub use usn::{ChangeEvent, ChangeKind, RenameCoalescer};
