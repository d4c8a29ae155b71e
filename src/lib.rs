//! NexScan - NTFS volume indexer
//!
//! Builds and maintains a searchable index of every file and directory on an
//! NTFS volume:
//!
//! - **Direct MFT reading**: the initial index comes from a sequential scan
//!   of the Master File Table, orders of magnitude faster than a recursive
//!   directory walk
//! - **USN Journal streaming**: after the seed, the index follows the
//!   volume's change journal; a rename touches one entry, never a rescan
//! - **Gap safety**: if the journal wraps past our cursor the index is no
//!   longer trustworthy incrementally and a full re-seed runs automatically
//! - **Instant search**: name fragment plus extension/size/date/attribute
//!   filters, ranked, with paths derived by walking parent links
//! - **Offline images**: raw volume images scan the same way live volumes do,
//!   on any platform
//!
//! # Example
//!
//! ```no_run
//! use nexscan::index::{parse_query, IndexStore, QueryEngine};
//! use nexscan::ntfs::mft::{MftReader, ScanOptions};
//! use nexscan::volume::ImageVolume;
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! fn main() -> nexscan::Result<()> {
//!     let volume = ImageVolume::open("volume.img")?;
//!     let mut reader = MftReader::new(volume, ScanOptions::default())?;
//!
//!     let store = Arc::new(IndexStore::new(reader.volume_id()));
//!     let cancel = Arc::new(AtomicBool::new(false));
//!     let stats = reader.scan(&cancel, |_, _| {}, |entry| store.upsert(entry))?;
//!     println!("indexed {} entries", stats.entries_emitted);
//!
//!     let engine = QueryEngine::new(store);
//!     for hit in engine.search(&parse_query("*.txt size:>1mb"), 20) {
//!         println!("{:>10}  {}", hit.entry.size, hit.path);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cursor;
pub mod error;
pub mod index;
pub mod indexer;
pub mod journal;
pub mod ntfs;
pub mod sim;
pub mod volume;

// Re-export main types
pub use error::{NexScanError, Result};
pub use index::{
    parse_query, FileRef, IndexEntry, IndexStore, Query, QueryEngine, QueryFilter, SearchHit,
    TextMatch,
};
pub use indexer::{IndexState, IndexStatus, Indexer, IndexerOptions, VolumeIndexer};
pub use journal::{JournalMonitor, JournalSource, MonitorState};
pub use ntfs::{ChangeEvent, ChangeKind, MftReader, ScanOptions, ScanStats, VolumeGeometry};
pub use volume::{ImageVolume, MemVolume, VolumeRead};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Format bytes as a human-readable string
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let exp = (bytes as f64).log(1024.0).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);
    let size = bytes as f64 / 1024_f64.powi(exp as i32);

    if exp == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[exp])
    }
}
