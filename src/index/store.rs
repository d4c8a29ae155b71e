//! Index store
//!
//! Entries are keyed by MFT record number (the slot); the stored `FileRef`
//! carries the generation, so a slot reused by a different file is detected
//! and the stale entry purged rather than updated. Paths are never stored:
//! `resolve_path` walks parent links on demand, failing fast on cycles and
//! orphans instead of looping or fabricating locations.
//!
//! Secondary indexes (name, extension, size bucket, modified-day bucket) are
//! maintained incrementally on every upsert/remove under a briefly-held write
//! lock; readers snapshot candidate ids under the read lock and then look
//! entries up in the sharded map, so queries never wait on a long writer.

use crate::error::{NexScanError, Result};
use crate::index::entry::{FileRef, IndexEntry};
use crate::index::query::QueryFilter;
use crate::ntfs::structs::{unix_to_filetime, FILETIME_PER_DAY};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Log2-style size bucket; bucket n holds sizes in [2^(n-1), 2^n)
fn size_bucket(size: u64) -> u8 {
    (64 - size.leading_zeros()) as u8
}

/// Modified-day bucket (FILETIME days since 1601)
fn day_bucket(filetime: u64) -> u32 {
    (filetime / FILETIME_PER_DAY) as u32
}

#[derive(Default)]
struct SecondaryIndexes {
    /// lowercase leaf name -> record numbers
    by_name: BTreeMap<String, Vec<u64>>,
    /// lowercase extension (no dot) -> record numbers
    by_ext: HashMap<String, HashSet<u64>>,
    /// size bucket -> record numbers (files only)
    by_size: BTreeMap<u8, HashSet<u64>>,
    /// modified-day bucket -> record numbers
    by_day: BTreeMap<u32, HashSet<u64>>,
}

impl SecondaryIndexes {
    fn add(&mut self, entry: &IndexEntry) {
        let record = entry.id.record_number();

        self.by_name
            .entry(entry.name.to_lowercase())
            .or_default()
            .push(record);

        if let Some(ext) = entry.extension() {
            self.by_ext.entry(ext).or_default().insert(record);
        }

        if !entry.is_directory {
            self.by_size
                .entry(size_bucket(entry.size))
                .or_default()
                .insert(record);
        }

        self.by_day
            .entry(day_bucket(entry.modified))
            .or_default()
            .insert(record);
    }

    fn remove(&mut self, entry: &IndexEntry) {
        let record = entry.id.record_number();

        let name_key = entry.name.to_lowercase();
        if let Some(ids) = self.by_name.get_mut(&name_key) {
            ids.retain(|&r| r != record);
            if ids.is_empty() {
                self.by_name.remove(&name_key);
            }
        }

        if let Some(ext) = entry.extension() {
            if let Some(ids) = self.by_ext.get_mut(&ext) {
                ids.remove(&record);
                if ids.is_empty() {
                    self.by_ext.remove(&ext);
                }
            }
        }

        if !entry.is_directory {
            let bucket = size_bucket(entry.size);
            if let Some(ids) = self.by_size.get_mut(&bucket) {
                ids.remove(&record);
                if ids.is_empty() {
                    self.by_size.remove(&bucket);
                }
            }
        }

        let day = day_bucket(entry.modified);
        if let Some(ids) = self.by_day.get_mut(&day) {
            ids.remove(&record);
            if ids.is_empty() {
                self.by_day.remove(&day);
            }
        }
    }
}

/// The per-volume index: identifier-keyed entries plus lookup structures
pub struct IndexStore {
    volume_id: String,
    entries: DashMap<u64, IndexEntry>,
    secondary: RwLock<SecondaryIndexes>,
}

impl IndexStore {
    pub fn new(volume_id: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            entries: DashMap::new(),
            secondary: RwLock::new(SecondaryIndexes::default()),
        }
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch by full identifier; a generation mismatch reads as absent
    pub fn get(&self, id: FileRef) -> Option<IndexEntry> {
        let entry = self.entries.get(&id.record_number())?;
        if entry.id != id {
            return None;
        }
        Some(entry.value().clone())
    }

    /// Fetch whatever currently occupies a record slot
    pub fn get_record(&self, record_number: u64) -> Option<IndexEntry> {
        self.entries.get(&record_number).map(|e| e.value().clone())
    }

    /// Insert or replace an entry. A different generation in the same slot
    /// purges the stale entry's postings before inserting the new ones.
    pub fn upsert(&self, entry: IndexEntry) {
        let record = entry.id.record_number();
        let old = self.entries.insert(record, entry.clone());

        let mut sec = self.secondary.write();
        if let Some(old) = &old {
            sec.remove(old);
        }
        sec.add(&entry);
    }

    /// Remove the entry for `id`. A generation mismatch removes nothing —
    /// the slot already belongs to a different file.
    pub fn remove(&self, id: FileRef) -> Option<IndexEntry> {
        let record = id.record_number();

        let matches = self
            .entries
            .get(&record)
            .map(|e| e.id == id)
            .unwrap_or(false);
        if !matches {
            return None;
        }

        let (_, old) = self.entries.remove(&record)?;
        self.secondary.write().remove(&old);
        Some(old)
    }

    /// Apply a rename: updates exactly one entry's name and parent, leaving
    /// identity, metadata, and every descendant untouched.
    pub fn rename(&self, id: FileRef, new_parent: FileRef, new_name: &str) -> bool {
        let record = id.record_number();

        let change = {
            let mut entry = match self.entries.get_mut(&record) {
                Some(e) => e,
                None => return false,
            };
            if entry.id != id {
                return false;
            }
            let old = entry.clone();
            entry.name = new_name.to_string();
            entry.parent = new_parent;
            Some((old, entry.clone()))
        };

        if let Some((old, new)) = change {
            let mut sec = self.secondary.write();
            sec.remove(&old);
            sec.add(&new);
            true
        } else {
            false
        }
    }

    /// Refresh the modified stamp (data change seen in the journal)
    pub fn touch(&self, id: FileRef, modified: u64) -> bool {
        let record = id.record_number();

        let change = {
            let mut entry = match self.entries.get_mut(&record) {
                Some(e) => e,
                None => return false,
            };
            if entry.id != id {
                return false;
            }
            let old = entry.clone();
            entry.modified = modified;
            Some((old, entry.clone()))
        };

        if let Some((old, new)) = change {
            let mut sec = self.secondary.write();
            sec.remove(&old);
            sec.add(&new);
            true
        } else {
            false
        }
    }

    /// Replace the attribute bits
    pub fn set_attributes(&self, id: FileRef, attributes: u32) -> bool {
        let record = id.record_number();
        let mut entry = match self.entries.get_mut(&record) {
            Some(e) => e,
            None => return false,
        };
        if entry.id != id {
            return false;
        }
        entry.attributes = attributes;
        true
    }

    pub fn clear(&self) {
        self.entries.clear();
        *self.secondary.write() = SecondaryIndexes::default();
    }

    // ------------------------------------------------------------------
    // Path resolution
    // ------------------------------------------------------------------

    /// Resolve the name chain from the root to `id` (root itself resolves to
    /// an empty chain). Fails fast with `BrokenChain` on a parent cycle and
    /// `Orphaned` when a link is missing or stale; such entries stay out of
    /// path-dependent results until a later event repairs the chain.
    pub fn resolve_path(&self, id: FileRef) -> Result<Vec<String>> {
        if id.is_root() {
            return Ok(Vec::new());
        }

        let entry = self.get(id).ok_or(NexScanError::Orphaned(id))?;

        let mut names = vec![entry.name];
        let mut visited = HashSet::new();
        visited.insert(id.record_number());

        let mut parent = entry.parent;
        while !parent.is_root() {
            let record = parent.record_number();
            if !visited.insert(record) {
                return Err(NexScanError::BrokenChain(id));
            }

            let link = self.get_record(record).ok_or(NexScanError::Orphaned(id))?;
            if link.id.sequence() != parent.sequence() {
                // The referenced generation is gone; the slot was reused
                return Err(NexScanError::Orphaned(id));
            }

            names.push(link.name);
            parent = link.parent;
        }

        names.reverse();
        Ok(names)
    }

    /// Resolved path joined with `/`
    pub fn resolve_path_string(&self, id: FileRef) -> Result<String> {
        Ok(self.resolve_path(id)?.join("/"))
    }

    // ------------------------------------------------------------------
    // Query support (candidate sets from the secondary indexes)
    // ------------------------------------------------------------------

    pub fn ids_with_extension(&self, ext: &str) -> Vec<u64> {
        let key = ext.trim_start_matches('.').to_lowercase();
        self.secondary
            .read()
            .by_ext
            .get(&key)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Record numbers of files whose size lies in `[min, max]`
    pub fn ids_in_size_range(&self, min: u64, max: u64) -> Vec<u64> {
        if min > max {
            return Vec::new();
        }
        let lo = size_bucket(min);
        let hi = size_bucket(max);

        let candidates: Vec<u64> = {
            let sec = self.secondary.read();
            sec.by_size
                .range(lo..=hi)
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect()
        };

        candidates
            .into_iter()
            .filter(|r| {
                self.entries
                    .get(r)
                    .map(|e| e.size >= min && e.size <= max)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Record numbers of entries modified within `[lo, hi]` (FILETIME)
    pub fn ids_modified_between(&self, lo: u64, hi: u64) -> Vec<u64> {
        if lo > hi {
            return Vec::new();
        }

        let candidates: Vec<u64> = {
            let sec = self.secondary.read();
            sec.by_day
                .range(day_bucket(lo)..=day_bucket(hi))
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect()
        };

        candidates
            .into_iter()
            .filter(|r| {
                self.entries
                    .get(r)
                    .map(|e| e.modified >= lo && e.modified <= hi)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn ids_with_name(&self, name: &str) -> Vec<u64> {
        self.secondary
            .read()
            .by_name
            .get(&name.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn ids_with_name_prefix(&self, prefix: &str) -> Vec<u64> {
        let prefix = prefix.to_lowercase();
        self.secondary
            .read()
            .by_name
            .range(prefix.clone()..)
            .take_while(|(name, _)| name.starts_with(&prefix))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    /// Visit every distinct lowercase name and its record numbers
    pub fn for_each_name<F: FnMut(&str, &[u64])>(&self, mut f: F) {
        let sec = self.secondary.read();
        for (name, ids) in &sec.by_name {
            f(name, ids);
        }
    }

    /// Candidate record numbers for a metadata filter, intersected across
    /// every active clause. `None` means the filter constrains nothing.
    pub fn filter_ids(&self, filter: &QueryFilter) -> Option<HashSet<u64>> {
        let mut result: Option<HashSet<u64>> = None;
        let mut fold = |ids: Vec<u64>| {
            let set: HashSet<u64> = ids.into_iter().collect();
            result = Some(match result.take() {
                None => set,
                Some(prev) => prev.intersection(&set).copied().collect(),
            });
        };

        if let Some(exts) = &filter.extensions {
            let mut ids = Vec::new();
            for ext in exts {
                ids.extend(self.ids_with_extension(ext));
            }
            fold(ids);
        }

        if filter.min_size.is_some() || filter.max_size.is_some() {
            fold(self.ids_in_size_range(
                filter.min_size.unwrap_or(0),
                filter.max_size.unwrap_or(u64::MAX),
            ));
        }

        if filter.modified_after.is_some() || filter.modified_before.is_some() {
            let lo = filter
                .modified_after
                .map(|dt| unix_to_filetime(dt.timestamp()))
                .unwrap_or(0);
            let hi = filter
                .modified_before
                .map(|dt| unix_to_filetime(dt.timestamp()))
                .unwrap_or(u64::MAX);
            fold(self.ids_modified_between(lo, hi));
        }

        result
    }

    /// Lazily yield the entries matching a metadata filter. Text ranking is
    /// the query engine's job; this is the raw candidate stream.
    pub fn query<'a>(&'a self, filter: &QueryFilter) -> Box<dyn Iterator<Item = IndexEntry> + 'a> {
        let mask = filter.attribute_mask;
        let matches_mask = move |e: &IndexEntry| mask == 0 || e.attributes & mask == mask;

        match self.filter_ids(filter) {
            Some(ids) => Box::new(
                ids.into_iter()
                    .filter_map(move |record| self.get_record(record))
                    .filter(matches_mask),
            ),
            None => Box::new(
                self.entries
                    .iter()
                    .map(|e| e.value().clone())
                    .filter(matches_mask),
            ),
        }
    }

    /// All current entries (snapshot order: by record number)
    pub fn snapshot_entries(&self) -> Vec<IndexEntry> {
        let mut entries: Vec<IndexEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.id.record_number());
        entries
    }

    // ------------------------------------------------------------------
    // Snapshot persistence
    // ------------------------------------------------------------------

    /// Write all entries as JSON, atomically (tmp file + rename).
    /// Returns the number of entries written.
    pub fn save_snapshot(&self, path: &Path) -> Result<u64> {
        let entries = self.snapshot_entries();
        let count = entries.len() as u64;

        let tmp = path.with_extension("tmp");
        {
            let file = fs::File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &entries)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;

        tracing::debug!(volume = %self.volume_id, count, path = %path.display(), "index snapshot saved");
        Ok(count)
    }

    /// Replace the store's contents from a snapshot file.
    /// Returns the number of entries loaded.
    pub fn load_snapshot(&self, path: &Path) -> Result<u64> {
        let file = fs::File::open(path)?;
        let entries: Vec<IndexEntry> = serde_json::from_reader(BufReader::new(file))?;
        let count = entries.len() as u64;

        self.clear();
        for entry in entries {
            self.upsert(entry);
        }

        tracing::debug!(volume = %self.volume_id, count, path = %path.display(), "index snapshot loaded");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(record: u64, seq: u16, parent: FileRef, name: &str, is_dir: bool, size: u64) -> IndexEntry {
        IndexEntry {
            id: FileRef::from_parts(record, seq),
            parent,
            name: name.to_string(),
            is_directory: is_dir,
            size,
            allocated_size: size,
            created: 0,
            modified: 0,
            accessed: 0,
            attributes: 0,
            hard_link_count: 1,
            content_tag: None,
        }
    }

    fn root() -> IndexEntry {
        entry(5, 5, FileRef::from_parts(5, 5), ".", true, 0)
    }

    #[test]
    fn upsert_and_lookup_by_generation() {
        let store = IndexStore::new("test");
        store.upsert(entry(16, 1, FileRef::from_parts(5, 5), "a.txt", false, 10));

        assert!(store.get(FileRef::from_parts(16, 1)).is_some());
        assert!(store.get(FileRef::from_parts(16, 2)).is_none());
    }

    #[test]
    fn generation_mismatch_purges_stale_postings() {
        let store = IndexStore::new("test");
        store.upsert(entry(16, 1, FileRef::from_parts(5, 5), "old.log", false, 10));
        // Slot 16 reused by a different file
        store.upsert(entry(16, 2, FileRef::from_parts(5, 5), "new.txt", false, 20));

        assert!(store.ids_with_extension("log").is_empty());
        assert_eq!(store.ids_with_extension("txt"), vec![16]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_refuses_stale_generation() {
        let store = IndexStore::new("test");
        store.upsert(entry(16, 2, FileRef::from_parts(5, 5), "live.txt", false, 1));

        assert!(store.remove(FileRef::from_parts(16, 1)).is_none());
        assert_eq!(store.len(), 1);
        assert!(store.remove(FileRef::from_parts(16, 2)).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn resolve_path_walks_parent_links() {
        let store = IndexStore::new("test");
        store.upsert(root());
        store.upsert(entry(16, 1, FileRef::from_parts(5, 5), "docs", true, 0));
        store.upsert(entry(17, 1, FileRef::from_parts(16, 1), "a.txt", false, 10));

        let path = store.resolve_path(FileRef::from_parts(17, 1)).unwrap();
        assert_eq!(path, vec!["docs".to_string(), "a.txt".to_string()]);
        assert_eq!(
            store.resolve_path_string(FileRef::from_parts(17, 1)).unwrap(),
            "docs/a.txt"
        );
        assert!(store.resolve_path(FileRef::from_parts(5, 5)).unwrap().is_empty());
    }

    #[test]
    fn three_entry_cycle_fails_fast() {
        let store = IndexStore::new("test");
        // A -> B -> C -> A
        store.upsert(entry(16, 1, FileRef::from_parts(18, 1), "a", true, 0));
        store.upsert(entry(17, 1, FileRef::from_parts(16, 1), "b", true, 0));
        store.upsert(entry(18, 1, FileRef::from_parts(17, 1), "c", true, 0));

        for record in [16u64, 17, 18] {
            let err = store.resolve_path(FileRef::from_parts(record, 1)).unwrap_err();
            assert!(
                matches!(err, NexScanError::BrokenChain(_)),
                "record {} should report a broken chain, got {:?}",
                record,
                err
            );
        }
    }

    #[test]
    fn missing_or_stale_parent_is_orphaned() {
        let store = IndexStore::new("test");
        store.upsert(root());
        store.upsert(entry(17, 1, FileRef::from_parts(40, 1), "lost.txt", false, 1));
        assert!(matches!(
            store.resolve_path(FileRef::from_parts(17, 1)),
            Err(NexScanError::Orphaned(_))
        ));

        // Parent slot exists but under a newer generation
        store.upsert(entry(40, 2, FileRef::from_parts(5, 5), "newdir", true, 0));
        assert!(matches!(
            store.resolve_path(FileRef::from_parts(17, 1)),
            Err(NexScanError::Orphaned(_))
        ));
    }

    #[test]
    fn rename_updates_postings_and_nothing_else() {
        let store = IndexStore::new("test");
        store.upsert(root());
        store.upsert(entry(16, 1, FileRef::from_parts(5, 5), "docs", true, 0));
        let mut e = entry(17, 1, FileRef::from_parts(16, 1), "a.txt", false, 10);
        e.modified = 777;
        store.upsert(e);

        assert!(store.rename(FileRef::from_parts(17, 1), FileRef::from_parts(5, 5), "b.txt"));

        let moved = store.get(FileRef::from_parts(17, 1)).unwrap();
        assert_eq!(moved.name, "b.txt");
        assert_eq!(moved.size, 10);
        assert_eq!(moved.modified, 777);
        assert!(store.ids_with_name("a.txt").is_empty());
        assert_eq!(store.ids_with_name("b.txt"), vec![17]);
        assert_eq!(store.resolve_path_string(FileRef::from_parts(17, 1)).unwrap(), "b.txt");
    }

    #[test]
    fn size_and_day_ranges_are_exact() {
        let store = IndexStore::new("test");
        store.upsert(root());
        for (rec, size) in [(16u64, 100u64), (17, 1000), (18, 100_000)] {
            let mut e = entry(rec, 1, FileRef::from_parts(5, 5), &format!("f{}.bin", rec), false, size);
            e.modified = size * FILETIME_PER_DAY / 100; // spread across days
            store.upsert(e);
        }

        let mut ids = store.ids_in_size_range(100, 1000);
        ids.sort_unstable();
        assert_eq!(ids, vec![16, 17]);

        assert!(store.ids_in_size_range(1001, 99_999).is_empty());
    }

    #[test]
    fn filter_query_yields_matching_entries() {
        let store = IndexStore::new("test");
        store.upsert(root());
        store.upsert(entry(16, 1, FileRef::from_parts(5, 5), "a.txt", false, 10));
        store.upsert(entry(17, 1, FileRef::from_parts(5, 5), "b.log", false, 10));

        let filter = QueryFilter {
            extensions: Some(vec!["txt".into()]),
            ..Default::default()
        };
        let names: Vec<String> = store.query(&filter).map(|e| e.name).collect();
        assert_eq!(names, vec!["a.txt".to_string()]);

        // No clauses: everything comes back
        assert_eq!(store.query(&QueryFilter::default()).count(), 3);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let store = IndexStore::new("test");
        store.upsert(root());
        store.upsert(entry(16, 1, FileRef::from_parts(5, 5), "docs", true, 0));
        store.upsert(entry(17, 3, FileRef::from_parts(16, 1), "a.txt", false, 10));

        assert_eq!(store.save_snapshot(&path).unwrap(), 3);

        let restored = IndexStore::new("test");
        assert_eq!(restored.load_snapshot(&path).unwrap(), 3);
        assert_eq!(restored.snapshot_entries(), store.snapshot_entries());
        assert_eq!(
            restored.resolve_path_string(FileRef::from_parts(17, 3)).unwrap(),
            "docs/a.txt"
        );
    }
}
