//! End-to-end indexer lifecycle over simulated volumes and journals:
//! seed -> stream -> gap -> re-seed, warm starts, rename scenarios, teardown.

use nexscan::index::{parse_query, FileRef, Query, QueryEngine};
use nexscan::indexer::{IndexState, IndexerOptions, VolumeIndexer};
use nexscan::ntfs::mft::ScanOptions;
use nexscan::sim::{SimJournal, SimVolumeBuilder};
use std::time::{Duration, Instant};

fn options() -> IndexerOptions {
    IndexerOptions {
        scan: ScanOptions::default(),
        queue_capacity: 64,
        poll_interval: Duration::from_millis(10),
        cursor_path: None,
        snapshot_path: None,
    }
}

fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

const WAIT: Duration = Duration::from_secs(10);

/// Seed {root, docs/, docs/a.txt}, query ext:txt, rename a.txt -> b.txt into
/// the root, re-query.
#[test]
fn seed_query_rename_query() {
    let mut sim = SimVolumeBuilder::new();
    let root = sim.root();
    let docs = sim.dir("docs", root);
    let a_txt = sim.file("a.txt", docs, 10);
    let volume = sim.build().unwrap();

    let journal = SimJournal::new(1);
    let indexer = VolumeIndexer::spawn(volume, journal.clone(), options()).unwrap();

    assert!(wait_for(
        || indexer.index_status().state == IndexState::Monitoring,
        WAIT
    ));

    let engine = QueryEngine::new(indexer.store());

    let hits = engine.search(&parse_query("ext:txt"), 10);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entry.name, "a.txt");
    assert_eq!(hits[0].path, "docs/a.txt");
    assert_eq!(hits[0].entry.size, 10);

    // Rename a.txt -> b.txt, moving it to the root
    let (_, new_usn) = journal.push_rename(a_txt, docs, "a.txt", root, "b.txt");

    assert!(wait_for(
        || indexer.index_status().last_applied_usn > new_usn,
        WAIT
    ));

    assert!(engine.search(&Query::substring("a.txt"), 10).is_empty());

    let hits = engine.search(&Query::substring("b.txt"), 10);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "b.txt");
    assert_eq!(hits[0].entry.id, a_txt, "rename must preserve identity");
    assert_eq!(hits[0].entry.size, 10, "rename must preserve metadata");

    indexer.shutdown().unwrap();
}

/// Streamed creates and deletes show up in the index in order.
#[test]
fn streams_creates_and_deletes() {
    let mut sim = SimVolumeBuilder::new();
    let root = sim.root();
    sim.file("existing.txt", root, 5);
    let volume = sim.build().unwrap();

    let journal = SimJournal::new(2);
    let indexer = VolumeIndexer::spawn(volume, journal.clone(), options()).unwrap();
    assert!(wait_for(
        || indexer.index_status().state == IndexState::Monitoring,
        WAIT
    ));

    let fresh = FileRef::from_parts(40, 1);
    journal.push_create(fresh, root, "fresh.log", 0);
    let delete_usn = journal.push_delete(fresh, root, "fresh.log");

    assert!(wait_for(
        || indexer.index_status().last_applied_usn > delete_usn,
        WAIT
    ));

    let engine = QueryEngine::new(indexer.store());
    assert!(engine.search(&Query::substring("fresh.log"), 10).is_empty());

    indexer.shutdown().unwrap();
}

/// A journal gap moves the volume through Stalled into a full re-seed: state
/// comes back to Monitoring, journal-only entries are gone (they never
/// existed on the volume), and streaming resumes from the new position.
#[test]
fn journal_gap_triggers_reseed() {
    let mut sim = SimVolumeBuilder::new();
    let root = sim.root();
    sim.file("durable.txt", root, 1);
    let volume = sim.build().unwrap();

    let journal = SimJournal::new(3);
    let indexer = VolumeIndexer::spawn(volume, journal.clone(), options()).unwrap();
    assert!(wait_for(
        || indexer.index_status().state == IndexState::Monitoring,
        WAIT
    ));

    // An event that exists only in the journal, not on the (static) volume
    let ghost = FileRef::from_parts(50, 1);
    let usn = journal.push_create(ghost, root, "journal-only.tmp", 0);
    assert!(wait_for(
        || indexer.index_status().last_applied_usn > usn,
        WAIT
    ));
    let engine = QueryEngine::new(indexer.store());
    assert_eq!(engine.search(&Query::substring("journal-only"), 10).len(), 1);

    // Wrap the journal past the monitor's cursor
    journal.push_create(FileRef::from_parts(51, 1), root, "lost.tmp", 0);
    journal.truncate_to(journal.next_usn());

    // The re-seed rebuilds from the volume alone
    assert!(wait_for(
        || {
            indexer.index_status().state == IndexState::Monitoring
                && engine.search(&Query::substring("journal-only"), 10).is_empty()
        },
        WAIT
    ));

    assert_eq!(engine.search(&Query::substring("durable.txt"), 10).len(), 1);

    // Streaming works after the re-seed
    let usn = journal.push_create(FileRef::from_parts(52, 1), root, "post-gap.txt", 0);
    assert!(wait_for(
        || indexer.index_status().last_applied_usn > usn,
        WAIT
    ));
    assert_eq!(engine.search(&Query::substring("post-gap"), 10).len(), 1);

    indexer.shutdown().unwrap();
}

/// An explicit rebuild command re-seeds without a gap.
#[test]
fn rebuild_command_forces_reseed() {
    let mut sim = SimVolumeBuilder::new();
    let root = sim.root();
    sim.file("base.txt", root, 1);
    let volume = sim.build().unwrap();

    let journal = SimJournal::new(4);
    let indexer = VolumeIndexer::spawn(volume, journal.clone(), options()).unwrap();
    assert!(wait_for(
        || indexer.index_status().state == IndexState::Monitoring,
        WAIT
    ));

    let ghost = FileRef::from_parts(60, 1);
    let usn = journal.push_create(ghost, root, "ephemeral.txt", 0);
    assert!(wait_for(
        || indexer.index_status().last_applied_usn > usn,
        WAIT
    ));

    indexer.request_rebuild();

    let engine = QueryEngine::new(indexer.store());
    assert!(wait_for(
        || {
            indexer.index_status().state == IndexState::Monitoring
                && engine.search(&Query::substring("ephemeral"), 10).is_empty()
        },
        WAIT
    ));

    indexer.shutdown().unwrap();
}

/// Warm start: cursor + snapshot persisted, process restarts, the journal
/// still retains the cursor, so the bulk reader is skipped and
/// journal-derived entries survive.
#[test]
fn warm_start_skips_bulk_scan() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options();
    opts.cursor_path = Some(dir.path().join("cursor.json"));
    opts.snapshot_path = Some(dir.path().join("index.json"));

    let mut sim = SimVolumeBuilder::new();
    let root = sim.root();
    sim.file("on-disk.txt", root, 1);
    let image = sim.build_bytes();

    let journal = SimJournal::new(5);

    // First run: seed, apply one journal-only create, shut down
    {
        let volume = nexscan::volume::MemVolume::new(image.clone(), "sim").unwrap();
        let indexer = VolumeIndexer::spawn(volume, journal.clone(), opts.clone()).unwrap();
        assert!(wait_for(
            || indexer.index_status().state == IndexState::Monitoring,
            WAIT
        ));

        let usn = journal.push_create(FileRef::from_parts(70, 1), root, "journal-born.txt", 0);
        assert!(wait_for(
            || indexer.index_status().last_applied_usn > usn,
            WAIT
        ));
        indexer.shutdown().unwrap();
    }

    // Second run: the snapshot must carry journal-born.txt; a cold re-seed
    // would lose it (it never existed on the volume)
    {
        let volume = nexscan::volume::MemVolume::new(image, "sim").unwrap();
        let indexer = VolumeIndexer::spawn(volume, journal.clone(), opts).unwrap();
        assert!(wait_for(
            || indexer.index_status().state == IndexState::Monitoring,
            WAIT
        ));

        let engine = QueryEngine::new(indexer.store());
        assert_eq!(
            engine.search(&Query::substring("journal-born"), 10).len(),
            1,
            "warm start must preserve journal-derived entries"
        );
        indexer.shutdown().unwrap();
    }
}

/// A persisted cursor the journal no longer retains must force a re-seed,
/// never a silent resume.
#[test]
fn stale_cursor_forces_reseed_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options();
    opts.cursor_path = Some(dir.path().join("cursor.json"));
    opts.snapshot_path = Some(dir.path().join("index.json"));

    let mut sim = SimVolumeBuilder::new();
    let root = sim.root();
    sim.file("on-disk.txt", root, 1);
    let image = sim.build_bytes();

    let journal = SimJournal::new(6);

    {
        let volume = nexscan::volume::MemVolume::new(image.clone(), "sim").unwrap();
        let indexer = VolumeIndexer::spawn(volume, journal.clone(), opts.clone()).unwrap();
        assert!(wait_for(
            || indexer.index_status().state == IndexState::Monitoring,
            WAIT
        ));
        let usn = journal.push_create(FileRef::from_parts(71, 1), root, "doomed.txt", 0);
        assert!(wait_for(
            || indexer.index_status().last_applied_usn > usn,
            WAIT
        ));
        indexer.shutdown().unwrap();
    }

    // History disappears while we are down
    journal.push_create(FileRef::from_parts(72, 1), root, "while-down.txt", 0);
    journal.truncate_to(journal.next_usn());

    {
        let volume = nexscan::volume::MemVolume::new(image, "sim").unwrap();
        let indexer = VolumeIndexer::spawn(volume, journal.clone(), opts).unwrap();
        assert!(wait_for(
            || indexer.index_status().state == IndexState::Monitoring,
            WAIT
        ));

        let engine = QueryEngine::new(indexer.store());
        // Re-seeded from the volume: journal-only entries are gone
        assert!(engine.search(&Query::substring("doomed"), 10).is_empty());
        assert_eq!(engine.search(&Query::substring("on-disk"), 10).len(), 1);
        indexer.shutdown().unwrap();
    }
}

/// A dead volume handle tears the index down cleanly.
#[test]
fn volume_loss_tears_down_the_store() {
    let mut sim = SimVolumeBuilder::new();
    let root = sim.root();
    sim.file("gone-soon.txt", root, 1);
    let volume = sim.build().unwrap();

    let journal = SimJournal::new(7);
    let indexer = VolumeIndexer::spawn(volume, journal.clone(), options()).unwrap();
    assert!(wait_for(
        || indexer.index_status().state == IndexState::Monitoring,
        WAIT
    ));
    assert!(indexer.store().len() > 0);

    journal.invalidate();

    assert!(wait_for(
        || indexer.index_status().state == IndexState::Unavailable,
        WAIT
    ));
    assert_eq!(indexer.store().len(), 0, "store must be removed on teardown");

    indexer.shutdown().unwrap();
}
