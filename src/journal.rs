//! Change journal monitoring
//!
//! `JournalMonitor` drives a `JournalSource` through the state machine
//! Uninitialized → Attached → Streaming → Stalled. Stalled is the critical
//! transition: the journal no longer retains history back to our cursor, the
//! index can no longer be trusted incrementally, and the owner must run a
//! full bulk re-seed. Silently resuming from "now" after a gap would leave
//! the index permanently wrong, so a gap is always an error here.
//!
//! The monitor's cursor is a *read* position. The durable, last-applied
//! cursor lives with the indexer and only advances after events are applied.

use crate::error::{NexScanError, Result};
use crate::ntfs::structs::UsnJournalData;
use crate::ntfs::usn::{decode_usn_batch, ChangeEvent, RenameCoalescer};
use std::time::Duration;

/// Raw access to a volume's change journal
pub trait JournalSource: Send {
    /// Query journal identity and retention bounds (FSCTL_QUERY_USN_JOURNAL)
    fn attach(&mut self) -> Result<UsnJournalData>;

    /// Read records starting at `start_usn` into `buffer`, formatted as an
    /// 8-byte next-USN followed by USN records. Returns `(next_usn, bytes)`.
    /// Must fail with `JournalGap` when `start_usn` predates the retained
    /// window, and `VolumeUnavailable` when the handle died.
    fn read_batch(&mut self, start_usn: u64, buffer: &mut [u8]) -> Result<(u64, usize)>;
}

/// Monitor states, in spec order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Uninitialized,
    Attached,
    Streaming,
    Stalled,
}

/// Bounded exponential backoff for transient read errors
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { attempt: 0, base, cap }
    }

    /// Delay for the next retry, doubling up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

/// Reads and decodes journal records into ordered `ChangeEvent`s
pub struct JournalMonitor<J: JournalSource> {
    source: J,
    state: MonitorState,
    journal: Option<UsnJournalData>,
    cursor: u64,
    buffer: Vec<u8>,
    coalescer: RenameCoalescer,
    backoff: Backoff,
}

impl<J: JournalSource> JournalMonitor<J> {
    pub fn new(source: J) -> Self {
        Self {
            source,
            state: MonitorState::Uninitialized,
            journal: None,
            cursor: 0,
            buffer: vec![0u8; 64 * 1024],
            coalescer: RenameCoalescer::new(),
            backoff: Backoff::default(),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Current read cursor (USN)
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn journal_data(&self) -> Option<&UsnJournalData> {
        self.journal.as_ref()
    }

    /// Attach to the journal. `resume_from` is a persisted last-applied
    /// cursor; `None` starts from "now". A cursor older than the retained
    /// window (or a journal recreated under a new id) moves the monitor to
    /// Stalled and fails with `JournalGap` — the caller must re-seed.
    pub fn attach(&mut self, resume_from: Option<u64>) -> Result<&UsnJournalData> {
        let data = self.source.attach()?;

        match resume_from {
            Some(cursor) if cursor < data.first_usn => {
                self.state = MonitorState::Stalled;
                self.journal = Some(data.clone());
                return Err(NexScanError::JournalGap {
                    cursor,
                    oldest: data.first_usn,
                });
            }
            Some(cursor) => self.cursor = cursor,
            None => self.cursor = data.next_usn,
        }

        self.journal = Some(data);
        self.state = MonitorState::Attached;
        self.backoff.reset();
        Ok(self.journal.as_ref().unwrap())
    }

    /// Re-attach at the journal's current position (used right before a bulk
    /// re-seed so nothing between seed start and streaming start is lost).
    pub fn attach_at_now(&mut self) -> Result<u64> {
        self.attach(None)?;
        Ok(self.cursor)
    }

    /// Read and decode the next batch of events, in strictly increasing usn
    /// order. Empty result means no new records; callers sleep their poll
    /// interval (the periodic wakeup doubles as a volume health check).
    pub fn poll(&mut self) -> Result<Vec<ChangeEvent>> {
        match self.state {
            MonitorState::Attached | MonitorState::Streaming => {}
            MonitorState::Uninitialized => {
                return Err(NexScanError::Journal("monitor not attached".to_string()))
            }
            MonitorState::Stalled => {
                return Err(NexScanError::JournalGap {
                    cursor: self.cursor,
                    oldest: self.journal.as_ref().map(|j| j.first_usn).unwrap_or(0),
                })
            }
        }

        match self.source.read_batch(self.cursor, &mut self.buffer) {
            Ok((next_usn, bytes)) => {
                self.state = MonitorState::Streaming;
                self.backoff.reset();

                let (_, records) = decode_usn_batch(&self.buffer[..bytes]);
                let mut events = Vec::new();
                let mut last_usn = self.cursor;

                for record in &records {
                    if record.usn < self.cursor {
                        // Already consumed in a previous batch
                        continue;
                    }
                    debug_assert!(record.usn >= last_usn, "journal delivered records out of order");
                    last_usn = record.usn;

                    if let Some(event) = self.coalescer.fold(record) {
                        events.push(event);
                    }
                }

                if next_usn > self.cursor {
                    self.cursor = next_usn;
                }

                Ok(events)
            }
            Err(e @ NexScanError::JournalGap { .. }) => {
                tracing::warn!(cursor = self.cursor, "journal wrapped past our cursor; index needs re-seed");
                self.state = MonitorState::Stalled;
                Err(e)
            }
            Err(e @ NexScanError::VolumeUnavailable(_)) => {
                self.state = MonitorState::Uninitialized;
                self.journal = None;
                Err(e)
            }
            Err(e) => {
                // Transient: drop back to Attached; caller retries with backoff
                self.state = MonitorState::Attached;
                Err(e)
            }
        }
    }

    /// Delay before retrying after a transient error
    pub fn retry_delay(&mut self) -> Duration {
        self.backoff.next_delay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::entry::FileRef;
    use crate::ntfs::structs::usn_reason;
    use crate::ntfs::usn::ChangeKind;
    use crate::sim::SimJournal;

    fn id(rec: u64) -> FileRef {
        FileRef::from_parts(rec, 1)
    }

    #[test]
    fn attach_from_now_skips_history() {
        let journal = SimJournal::new(7);
        journal.push_create(id(20), id(5), "before.txt", 0);

        let mut monitor = JournalMonitor::new(journal.clone());
        monitor.attach(None).unwrap();
        assert_eq!(monitor.state(), MonitorState::Attached);

        journal.push_create(id(21), id(5), "after.txt", 0);
        let events = monitor.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "after.txt");
        assert_eq!(monitor.state(), MonitorState::Streaming);
    }

    #[test]
    fn stale_cursor_stalls_on_attach() {
        let journal = SimJournal::new(7);
        journal.push_create(id(20), id(5), "a", 0);
        journal.push_create(id(21), id(5), "b", 0);
        journal.truncate_to(journal.next_usn());

        let mut monitor = JournalMonitor::new(journal);
        let err = monitor.attach(Some(1)).unwrap_err();
        assert!(matches!(err, NexScanError::JournalGap { .. }));
        assert_eq!(monitor.state(), MonitorState::Stalled);
    }

    #[test]
    fn wrap_during_streaming_stalls() {
        let journal = SimJournal::new(7);
        let mut monitor = JournalMonitor::new(journal.clone());
        monitor.attach(None).unwrap();

        journal.push_create(id(20), id(5), "a", 0);
        assert_eq!(monitor.poll().unwrap().len(), 1);

        // Journal discards history beyond our cursor
        journal.push_create(id(21), id(5), "b", 0);
        journal.truncate_to(journal.next_usn());

        let err = monitor.poll().unwrap_err();
        assert!(matches!(err, NexScanError::JournalGap { .. }));
        assert_eq!(monitor.state(), MonitorState::Stalled);

        // Stalled is sticky until re-attach
        assert!(monitor.poll().is_err());
        monitor.attach_at_now().unwrap();
        assert_eq!(monitor.state(), MonitorState::Attached);
    }

    #[test]
    fn rename_pair_spanning_batches_still_coalesces() {
        let journal = SimJournal::new(7);
        let mut monitor = JournalMonitor::new(journal.clone());
        monitor.attach(None).unwrap();

        journal.push_raw(id(20), id(6), "old.txt", usn_reason::RENAME_OLD_NAME, 0, 0);
        assert!(monitor.poll().unwrap().is_empty());

        journal.push_raw(id(20), id(5), "new.txt", usn_reason::RENAME_NEW_NAME, 0, 0);
        let events = monitor.poll().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            ChangeKind::Renamed { old_parent, old_name } => {
                assert_eq!(*old_parent, id(6));
                assert_eq!(old_name, "old.txt");
            }
            other => panic!("expected Renamed, got {:?}", other),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(400));
        assert_eq!(b.next_delay(), Duration::from_millis(800));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }
}
