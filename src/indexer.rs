//! Indexer: single writer per volume
//!
//! `Indexer` is the only component that mutates an `IndexStore`. It applies
//! bulk entries during a seed and journal events during streaming, enforcing
//! the ordering invariant (an event's usn must be strictly greater than the
//! last applied one) so the parent-link tree can never be corrupted by
//! out-of-order application.
//!
//! `VolumeIndexer` wraps the lifecycle on a worker thread: warm start from a
//! persisted cursor + snapshot when the journal still retains the cursor,
//! full bulk seed otherwise, then streaming. A journal gap moves the volume
//! to Stalled and forces an automatic re-seed; a dead volume handle tears the
//! store down cleanly. Producers feed the writer through a bounded channel —
//! when the queue is full they block, they never drop.

use crate::cursor::PersistedCursor;
use crate::error::{NexScanError, Result};
use crate::index::entry::IndexEntry;
use crate::index::store::IndexStore;
use crate::journal::{JournalMonitor, JournalSource};
use crate::ntfs::mft::{MftReader, ScanOptions};
use crate::ntfs::structs::file_attributes;
use crate::ntfs::usn::{ChangeEvent, ChangeKind};
use crate::volume::VolumeRead;
use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ============================================================================
// Status
// ============================================================================

/// Externally visible volume index state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexState {
    /// No index yet
    Cold,
    /// Bulk seed in progress; query results are partial
    Rebuilding,
    /// Streaming journal events
    Monitoring,
    /// Journal gap detected; a re-seed is pending
    Stalled,
    /// Volume went away; the store has been torn down
    Unavailable,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IndexState::Cold => "cold",
            IndexState::Rebuilding => "rebuilding",
            IndexState::Monitoring => "monitoring",
            IndexState::Stalled => "stalled",
            IndexState::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Snapshot of a volume's indexing status, the surface external progress
/// indicators and "index is rebuilding" banners are driven from
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub state: IndexState,
    pub entries_indexed: u64,
    pub last_event_applied_at: Option<DateTime<Utc>>,
    pub last_applied_usn: u64,
    /// Bulk scan progress as (processed, total) records
    pub scan_progress: Option<(u64, u64)>,
}

/// Shared status cell: one writer (the indexer thread), many readers
pub struct StatusCell {
    inner: RwLock<IndexStatus>,
}

impl StatusCell {
    fn new() -> Self {
        Self {
            inner: RwLock::new(IndexStatus {
                state: IndexState::Cold,
                entries_indexed: 0,
                last_event_applied_at: None,
                last_applied_usn: 0,
                scan_progress: None,
            }),
        }
    }

    pub fn get(&self) -> IndexStatus {
        self.inner.read().clone()
    }

    fn set_state(&self, state: IndexState) {
        self.inner.write().state = state;
    }

    fn set_scan_progress(&self, processed: u64, total: u64) {
        self.inner.write().scan_progress = Some((processed, total));
    }

    fn seeded(&self, entries: u64, cursor: u64) {
        let mut s = self.inner.write();
        s.state = IndexState::Monitoring;
        s.entries_indexed = entries;
        s.last_applied_usn = cursor;
        s.scan_progress = None;
    }

    fn applied(&self, entries: u64, cursor: u64) {
        let mut s = self.inner.write();
        s.entries_indexed = entries;
        s.last_applied_usn = cursor;
        s.last_event_applied_at = Some(Utc::now());
    }
}

// ============================================================================
// Core indexer (single-threaded application)
// ============================================================================

/// Applies entries and events to a store under the ordering discipline.
/// Exactly one `Indexer` exists per volume and it is the store's only writer.
pub struct Indexer {
    store: Arc<IndexStore>,
    last_applied_usn: u64,
}

impl Indexer {
    pub fn new(store: Arc<IndexStore>) -> Self {
        Self {
            store,
            last_applied_usn: 0,
        }
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn last_applied_usn(&self) -> u64 {
        self.last_applied_usn
    }

    /// Apply one bulk-scan entry (idempotent upsert)
    pub fn apply_entry(&self, entry: IndexEntry) {
        self.store.upsert(entry);
    }

    /// Apply one journal event. Rejects any event at or before the last
    /// applied usn without touching the store or advancing the cursor.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> Result<()> {
        if event.usn <= self.last_applied_usn {
            return Err(NexScanError::OutOfOrderEvent {
                usn: event.usn,
                last_applied: self.last_applied_usn,
            });
        }

        match &event.kind {
            ChangeKind::Created => {
                self.store.upsert(entry_from_event(event));
            }
            ChangeKind::Deleted => {
                self.store.remove(event.id);
            }
            ChangeKind::Renamed { .. } => {
                // Identity is preserved: only name and parent change. An
                // unknown id means the create predates our window; the event
                // is authoritative, so materialize the entry at its new home.
                if !self.store.rename(event.id, event.parent, &event.name) {
                    self.store.upsert(entry_from_event(event));
                }
            }
            ChangeKind::DataModified => {
                if !self.store.touch(event.id, event.timestamp) {
                    self.store.upsert(entry_from_event(event));
                }
            }
            ChangeKind::AttributesChanged => {
                if !self.store.set_attributes(event.id, event.attributes) {
                    self.store.upsert(entry_from_event(event));
                }
            }
        }

        self.last_applied_usn = event.usn;
        Ok(())
    }
}

/// Materialize an entry from journal data alone. The journal carries no
/// sizes; they converge on the next bulk scan.
fn entry_from_event(event: &ChangeEvent) -> IndexEntry {
    IndexEntry {
        id: event.id,
        parent: event.parent,
        name: event.name.clone(),
        is_directory: (event.attributes & file_attributes::DIRECTORY) != 0,
        size: 0,
        allocated_size: 0,
        created: event.timestamp,
        modified: event.timestamp,
        accessed: event.timestamp,
        attributes: event.attributes,
        hard_link_count: 1,
        content_tag: None,
    }
}

// ============================================================================
// Per-volume service
// ============================================================================

#[derive(Debug, Clone)]
pub struct IndexerOptions {
    pub scan: ScanOptions,
    /// Bounded producer->writer queue; senders block when full
    pub queue_capacity: usize,
    /// Sleep between empty journal polls (doubles as a health re-check)
    pub poll_interval: Duration,
    pub cursor_path: Option<PathBuf>,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            queue_capacity: 4096,
            poll_interval: Duration::from_millis(500),
            cursor_path: None,
            snapshot_path: None,
        }
    }
}

/// Owns one volume's indexing lifecycle on a worker thread.
/// Volumes are fully independent: one indexer, one store, one cursor each.
pub struct VolumeIndexer {
    store: Arc<IndexStore>,
    status: Arc<StatusCell>,
    cancel: Arc<AtomicBool>,
    rebuild: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl VolumeIndexer {
    pub fn spawn<V, J>(volume: V, journal: J, options: IndexerOptions) -> Result<Self>
    where
        V: VolumeRead + 'static,
        J: JournalSource + 'static,
    {
        let reader = MftReader::new(volume, options.scan.clone())?;
        let store = Arc::new(IndexStore::new(reader.volume_id()));
        let status = Arc::new(StatusCell::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let rebuild = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            reader,
            monitor: JournalMonitor::new(journal),
            options,
            store: store.clone(),
            status: status.clone(),
            cancel: cancel.clone(),
            rebuild: rebuild.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("nexscan-{}", store.volume_id()))
            .spawn(move || worker.run())?;

        Ok(Self {
            store,
            status,
            cancel,
            rebuild,
            handle: Some(handle),
        })
    }

    /// The read side handed to the query engine; the worker is the only writer
    pub fn store(&self) -> Arc<IndexStore> {
        self.store.clone()
    }

    /// Current status snapshot (the external `index_status` surface)
    pub fn index_status(&self) -> IndexStatus {
        self.status.get()
    }

    /// Force a full re-seed (manual recovery command)
    pub fn request_rebuild(&self) {
        self.rebuild.store(true, Ordering::SeqCst);
    }

    /// Signal the worker to stop after the current record
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Cancel and wait for the worker to finish
    pub fn shutdown(mut self) -> Result<()> {
        self.cancel();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(NexScanError::Journal("indexer thread panicked".into()))),
            None => Ok(()),
        }
    }
}

impl Drop for VolumeIndexer {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Worker<V: VolumeRead, J: JournalSource> {
    reader: MftReader<V>,
    monitor: JournalMonitor<J>,
    options: IndexerOptions,
    store: Arc<IndexStore>,
    status: Arc<StatusCell>,
    cancel: Arc<AtomicBool>,
    rebuild: Arc<AtomicBool>,
}

impl<V: VolumeRead, J: JournalSource> Worker<V, J> {
    fn run(mut self) -> Result<()> {
        let mut indexer = Indexer::new(self.store.clone());

        let warm = match self.try_warm_start() {
            Ok(w) => w,
            Err(NexScanError::VolumeUnavailable(v)) => return self.teardown(v),
            Err(e) => return Err(e),
        };

        if warm {
            self.status.seeded(self.store.len() as u64, self.monitor.cursor());
            tracing::info!(
                volume = %self.store.volume_id(),
                entries = self.store.len(),
                cursor = self.monitor.cursor(),
                "warm start: replaying journal from persisted cursor"
            );
        } else {
            match self.seed(&mut indexer) {
                Ok(()) => {}
                Err(NexScanError::Cancelled) => return Ok(()),
                Err(NexScanError::VolumeUnavailable(v)) => return self.teardown(v),
                Err(e) => return Err(e),
            }
        }

        // Streaming loop
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                let cursor = self.monitor.cursor();
                let _ = self.persist(cursor);
                return Ok(());
            }

            if self.rebuild.swap(false, Ordering::SeqCst) {
                tracing::info!(volume = %self.store.volume_id(), "rebuild requested");
                match self.seed(&mut indexer) {
                    Ok(()) => continue,
                    Err(NexScanError::Cancelled) => return Ok(()),
                    Err(NexScanError::VolumeUnavailable(v)) => return self.teardown(v),
                    Err(e) => return Err(e),
                }
            }

            match self.monitor.poll() {
                Ok(events) if events.is_empty() => {
                    self.sleep_cancellable(self.options.poll_interval);
                }
                Ok(events) => {
                    for event in &events {
                        match indexer.apply_event(event) {
                            Ok(()) => {}
                            Err(e @ NexScanError::OutOfOrderEvent { .. }) => {
                                // Must never advance the cursor over it
                                tracing::warn!(error = %e, "rejected out-of-order event");
                            }
                            Err(e) => return Err(e),
                        }
                    }

                    // The read cursor becomes durable only now, after the
                    // whole batch is applied
                    let cursor = self.monitor.cursor();
                    self.persist(cursor)?;
                    self.status.applied(self.store.len() as u64, cursor);
                }
                Err(NexScanError::JournalGap { cursor, oldest }) => {
                    tracing::warn!(
                        volume = %self.store.volume_id(),
                        cursor,
                        oldest,
                        "journal gap: index no longer trustworthy incrementally, re-seeding"
                    );
                    self.status.set_state(IndexState::Stalled);
                    match self.seed(&mut indexer) {
                        Ok(()) => {}
                        Err(NexScanError::Cancelled) => return Ok(()),
                        Err(NexScanError::VolumeUnavailable(v)) => return self.teardown(v),
                        Err(e) => return Err(e),
                    }
                }
                Err(NexScanError::VolumeUnavailable(v)) => return self.teardown(v),
                Err(e) => {
                    let delay = self.monitor.retry_delay();
                    tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "transient journal error, backing off");
                    self.sleep_cancellable(delay);
                }
            }
        }
    }

    /// Attempt to resume from a persisted cursor + snapshot. Returns true on
    /// success; false means a full seed is required.
    fn try_warm_start(&mut self) -> Result<bool> {
        let cursor_path = match &self.options.cursor_path {
            Some(p) => p.clone(),
            None => return Ok(false),
        };

        let cursor = match PersistedCursor::load(&cursor_path)? {
            Some(c) if c.volume_id == self.store.volume_id() => c,
            Some(c) => {
                tracing::warn!(
                    persisted = %c.volume_id,
                    actual = %self.store.volume_id(),
                    "cursor belongs to a different volume, cold start"
                );
                return Ok(false);
            }
            None => return Ok(false),
        };

        let snapshot_path = match &cursor.snapshot_path {
            Some(p) => p.clone(),
            None => return Ok(false),
        };

        match self.monitor.attach(Some(cursor.last_applied_usn)) {
            Ok(data) if data.usn_journal_id == cursor.journal_id => {}
            Ok(_) => {
                tracing::warn!("journal was recreated since the cursor was written, re-seeding");
                return Ok(false);
            }
            Err(NexScanError::JournalGap { cursor, oldest }) => {
                tracing::warn!(cursor, oldest, "persisted cursor outside retained window, re-seeding");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        match self.store.load_snapshot(&snapshot_path) {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "snapshot load failed, re-seeding");
                self.store.clear();
                Ok(false)
            }
        }
    }

    /// Full bulk seed: capture the journal position, clear the store, stream
    /// every MFT entry through the bounded queue into the writer, then make
    /// the new cursor durable.
    fn seed(&mut self, indexer: &mut Indexer) -> Result<()> {
        self.status.set_state(IndexState::Rebuilding);

        // Anything persisted is about to become inconsistent with the store
        if let Some(path) = &self.options.cursor_path {
            let _ = std::fs::remove_file(path);
        }

        // Capture the journal position before reading a single record:
        // mutations during the scan replay through the journal afterwards,
        // and upserts make that replay idempotent
        let start_cursor = self.monitor.attach_at_now()?;

        self.store.clear();

        let (tx, rx) = bounded::<IndexEntry>(self.options.queue_capacity.max(1));
        let reader = &mut self.reader;
        let cancel = self.cancel.clone();
        let status = self.status.clone();

        let scan_result = thread::scope(|scope| {
            let producer = scope.spawn(move || {
                reader.scan(
                    &cancel,
                    |processed, total| status.set_scan_progress(processed, total),
                    |entry| {
                        // A full queue blocks the producer; entries are never
                        // dropped
                        let _ = tx.send(entry);
                    },
                )
            });

            for entry in rx.iter() {
                indexer.apply_entry(entry);
            }

            producer
                .join()
                .unwrap_or_else(|_| Err(NexScanError::Journal("bulk scan thread panicked".into())))
        });

        let stats = scan_result?;

        self.persist(start_cursor)?;
        self.status.seeded(self.store.len() as u64, start_cursor);

        tracing::info!(
            volume = %self.store.volume_id(),
            entries = stats.entries_emitted,
            records = stats.records_processed,
            cursor = start_cursor,
            "seed complete, switching to journal streaming"
        );

        Ok(())
    }

    /// Persist the snapshot and cursor as a consistent pair
    fn persist(&self, cursor: u64) -> Result<()> {
        let cursor_path = match &self.options.cursor_path {
            Some(p) => p,
            None => return Ok(()),
        };

        let snapshot_path = match &self.options.snapshot_path {
            Some(snap) => match self.store.save_snapshot(snap) {
                Ok(_) => Some(snap.clone()),
                Err(e) => {
                    tracing::warn!(error = %e, "snapshot save failed; cursor written without one");
                    None
                }
            },
            None => None,
        };

        PersistedCursor {
            volume_id: self.store.volume_id().to_string(),
            journal_id: self
                .monitor
                .journal_data()
                .map(|j| j.usn_journal_id)
                .unwrap_or(0),
            last_applied_usn: cursor,
            snapshot_path,
        }
        .store(cursor_path)
    }

    /// Volume dismounted: clear the store, mark unavailable, stop cleanly.
    /// No retry here — the owner re-spawns when the volume reappears.
    fn teardown(&mut self, volume: String) -> Result<()> {
        tracing::warn!(volume = %volume, "volume unavailable, tearing down its index");
        self.store.clear();
        self.status.set_state(IndexState::Unavailable);
        Ok(())
    }

    fn sleep_cancellable(&self, total: Duration) {
        let step = Duration::from_millis(20);
        let mut slept = Duration::ZERO;
        while slept < total {
            if self.cancel.load(Ordering::SeqCst) || self.rebuild.load(Ordering::SeqCst) {
                return;
            }
            let chunk = step.min(total - slept);
            thread::sleep(chunk);
            slept += chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::entry::FileRef;

    fn store() -> Arc<IndexStore> {
        let store = Arc::new(IndexStore::new("test"));
        store.upsert(IndexEntry {
            id: FileRef::from_parts(5, 5),
            parent: FileRef::from_parts(5, 5),
            name: ".".into(),
            is_directory: true,
            size: 0,
            allocated_size: 0,
            created: 0,
            modified: 0,
            accessed: 0,
            attributes: 0,
            hard_link_count: 1,
            content_tag: None,
        });
        store
    }

    fn create_event(usn: u64, record: u64, parent: u64, name: &str) -> ChangeEvent {
        ChangeEvent {
            usn,
            kind: ChangeKind::Created,
            id: FileRef::from_parts(record, 1),
            parent: FileRef::from_parts(parent, if parent == 5 { 5 } else { 1 }),
            name: name.into(),
            timestamp: 0,
            attributes: 0,
        }
    }

    #[test]
    fn out_of_order_events_are_rejected_without_cursor_advance() {
        let mut indexer = Indexer::new(store());

        indexer.apply_event(&create_event(10, 16, 5, "a.txt")).unwrap();
        assert_eq!(indexer.last_applied_usn(), 10);

        let err = indexer.apply_event(&create_event(10, 17, 5, "b.txt")).unwrap_err();
        assert!(matches!(err, NexScanError::OutOfOrderEvent { .. }));
        assert_eq!(indexer.last_applied_usn(), 10);

        let err = indexer.apply_event(&create_event(3, 18, 5, "c.txt")).unwrap_err();
        assert!(matches!(err, NexScanError::OutOfOrderEvent { .. }));
        assert_eq!(indexer.last_applied_usn(), 10);
        assert!(indexer.store().get(FileRef::from_parts(17, 1)).is_none());
    }

    #[test]
    fn sorted_permutation_yields_the_in_order_state() {
        let events = vec![
            create_event(1, 16, 5, "docs"),
            create_event(2, 17, 16, "a.txt"),
            ChangeEvent {
                usn: 3,
                kind: ChangeKind::Renamed {
                    old_parent: FileRef::from_parts(16, 1),
                    old_name: "a.txt".into(),
                },
                id: FileRef::from_parts(17, 1),
                parent: FileRef::from_parts(5, 5),
                name: "b.txt".into(),
                timestamp: 0,
                attributes: 0,
            },
            ChangeEvent {
                usn: 4,
                kind: ChangeKind::DataModified,
                id: FileRef::from_parts(17, 1),
                parent: FileRef::from_parts(5, 5),
                name: "b.txt".into(),
                timestamp: 999,
                attributes: 0,
            },
        ];

        let mut in_order = Indexer::new(store());
        for e in &events {
            in_order.apply_event(e).unwrap();
        }

        // Deliver shuffled, sort by sequence, apply
        let mut shuffled = vec![events[2].clone(), events[0].clone(), events[3].clone(), events[1].clone()];
        shuffled.sort_by_key(|e| e.usn);
        let mut sorted = Indexer::new(store());
        for e in &shuffled {
            sorted.apply_event(e).unwrap();
        }

        assert_eq!(
            in_order.store().snapshot_entries(),
            sorted.store().snapshot_entries()
        );
    }

    #[test]
    fn rename_preserves_identity_and_metadata() {
        let mut indexer = Indexer::new(store());
        indexer.apply_event(&create_event(1, 16, 5, "docs")).unwrap();
        indexer.apply_event(&create_event(2, 17, 16, "a.txt")).unwrap();

        let before = indexer.store().get(FileRef::from_parts(17, 1)).unwrap();

        indexer
            .apply_event(&ChangeEvent {
                usn: 3,
                kind: ChangeKind::Renamed {
                    old_parent: FileRef::from_parts(16, 1),
                    old_name: "a.txt".into(),
                },
                id: FileRef::from_parts(17, 1),
                parent: FileRef::from_parts(5, 5),
                name: "b.txt".into(),
                timestamp: 0,
                attributes: 0,
            })
            .unwrap();

        let after = indexer.store().get(FileRef::from_parts(17, 1)).unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.name, "b.txt");
        assert_eq!(after.created, before.created);
        assert_eq!(
            indexer.store().resolve_path_string(after.id).unwrap(),
            "b.txt"
        );
        // The sibling directory is untouched
        assert_eq!(
            indexer.store().get(FileRef::from_parts(16, 1)).unwrap().name,
            "docs"
        );
    }

    #[test]
    fn events_for_unknown_ids_materialize_entries() {
        let mut indexer = Indexer::new(store());

        indexer
            .apply_event(&ChangeEvent {
                usn: 1,
                kind: ChangeKind::DataModified,
                id: FileRef::from_parts(30, 1),
                parent: FileRef::from_parts(5, 5),
                name: "late.txt".into(),
                timestamp: 123,
                attributes: 0,
            })
            .unwrap();

        let entry = indexer.store().get(FileRef::from_parts(30, 1)).unwrap();
        assert_eq!(entry.name, "late.txt");
        assert_eq!(entry.modified, 123);
    }

    #[test]
    fn delete_for_stale_generation_is_a_no_op() {
        let mut indexer = Indexer::new(store());
        indexer.apply_event(&create_event(1, 16, 5, "keep.txt")).unwrap();

        // Slot 16 was reused: generation 2 lives there now
        indexer
            .apply_event(&ChangeEvent {
                usn: 2,
                kind: ChangeKind::Created,
                id: FileRef::from_parts(16, 2),
                parent: FileRef::from_parts(5, 5),
                name: "reused.txt".into(),
                timestamp: 0,
                attributes: 0,
            })
            .unwrap();

        // A delete for the old generation must not remove the new file
        indexer
            .apply_event(&ChangeEvent {
                usn: 3,
                kind: ChangeKind::Deleted,
                id: FileRef::from_parts(16, 1),
                parent: FileRef::from_parts(5, 5),
                name: "keep.txt".into(),
                timestamp: 0,
                attributes: 0,
            })
            .unwrap();

        assert_eq!(
            indexer.store().get(FileRef::from_parts(16, 2)).unwrap().name,
            "reused.txt"
        );
    }
}
