//! Simulation harness
//!
//! Builds byte-accurate synthetic NTFS volumes (boot sector, fixup arrays,
//! resident and non-resident attributes, attribute-list fragments) and a
//! synthetic USN journal with retention trimming. Tests drive the real
//! decoder, bulk reader, and journal monitor against these images instead of
//! mocking them, so the parsing paths stay honest.

use crate::error::{NexScanError, Result};
use crate::index::entry::FileRef;
use crate::journal::JournalSource;
use crate::ntfs::structs::{file_attributes, UsnJournalData, ROOT_RECORD_NUMBER};
use crate::volume::MemVolume;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

const SIM_SECTOR: usize = 512;
const SIM_CLUSTER: usize = 4096;
const SIM_RECORD: usize = 1024;
const SIM_MFT_LCN: u64 = 4;

// ============================================================================
// Synthetic volume
// ============================================================================

#[derive(Debug, Clone)]
struct SimRecord {
    name: String,
    parent: FileRef,
    is_directory: bool,
    size: u64,
    created: u64,
    modified: u64,
    accessed: u64,
    attributes: u32,
    sequence: u16,
    in_use: bool,
    /// Torn-write simulation: wrong update sequence at a sector boundary
    torn: bool,
    /// For fragmented files: attributes live in this extension record
    extension_record: Option<u64>,
    /// Set on the extension record itself: the base it belongs to
    base_record: Option<FileRef>,
}

impl SimRecord {
    fn blank(name: &str, parent: FileRef, is_directory: bool, sequence: u16) -> Self {
        Self {
            name: name.to_string(),
            parent,
            is_directory,
            size: 0,
            created: 0,
            modified: 0,
            accessed: 0,
            attributes: 0,
            sequence,
            in_use: true,
            torn: false,
            extension_record: None,
            base_record: None,
        }
    }
}

/// Builds an in-memory NTFS volume image. Record numbers are handed out from
/// 16 upward (0-15 are reserved); the root is record 5 and `$MFT` record 0
/// describes the table itself, data runs included.
pub struct SimVolumeBuilder {
    serial: u64,
    records: BTreeMap<u64, SimRecord>,
    next_record: u64,
}

impl Default for SimVolumeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SimVolumeBuilder {
    pub fn new() -> Self {
        let mut records = BTreeMap::new();

        let root = FileRef::from_parts(ROOT_RECORD_NUMBER, 5);
        let mut root_rec = SimRecord::blank(".", root, true, 5);
        root_rec.attributes = file_attributes::HIDDEN | file_attributes::SYSTEM;
        records.insert(ROOT_RECORD_NUMBER, root_rec);

        Self {
            serial: 0x4E45_5853_4341_4E01,
            records,
            next_record: 16,
        }
    }

    pub fn with_serial(mut self, serial: u64) -> Self {
        self.serial = serial;
        self
    }

    pub fn root(&self) -> FileRef {
        FileRef::from_parts(ROOT_RECORD_NUMBER, 5)
    }

    fn allocate(&mut self) -> u64 {
        let record = self.next_record;
        self.next_record += 1;
        record
    }

    pub fn dir(&mut self, name: &str, parent: FileRef) -> FileRef {
        let record = self.allocate();
        self.records
            .insert(record, SimRecord::blank(name, parent, true, 1));
        FileRef::from_parts(record, 1)
    }

    pub fn file(&mut self, name: &str, parent: FileRef, size: u64) -> FileRef {
        self.file_with(name, parent, size, 0, 1)
    }

    pub fn file_with(
        &mut self,
        name: &str,
        parent: FileRef,
        size: u64,
        attributes: u32,
        sequence: u16,
    ) -> FileRef {
        let record = self.allocate();
        let mut rec = SimRecord::blank(name, parent, false, sequence);
        rec.size = size;
        rec.attributes = attributes;
        self.records.insert(record, rec);
        FileRef::from_parts(record, sequence)
    }

    pub fn set_times(&mut self, id: FileRef, created: u64, modified: u64, accessed: u64) {
        if let Some(rec) = self.records.get_mut(&id.record_number()) {
            rec.created = created;
            rec.modified = modified;
            rec.accessed = accessed;
        }
    }

    /// Leave a never-initialized slot (zeroed record) in the table
    pub fn free_slot(&mut self) -> u64 {
        self.allocate()
    }

    /// A record carrying a valid header but not marked in use (deleted file)
    pub fn not_in_use(&mut self, name: &str) -> u64 {
        let record = self.allocate();
        let mut rec = SimRecord::blank(name, self.root(), false, 2);
        rec.in_use = false;
        self.records.insert(record, rec);
        record
    }

    /// A record whose fixup verification fails (simulated torn write)
    pub fn torn_record(&mut self, name: &str) -> u64 {
        let record = self.allocate();
        let mut rec = SimRecord::blank(name, self.root(), false, 1);
        rec.torn = true;
        self.records.insert(record, rec);
        record
    }

    /// A file whose $FILE_NAME and $DATA live in an extension record, with
    /// the base record carrying only $STANDARD_INFORMATION plus an
    /// $ATTRIBUTE_LIST pointing at the extension.
    pub fn fragmented_file(&mut self, name: &str, parent: FileRef, size: u64) -> FileRef {
        let base = self.allocate();
        let ext = self.allocate();
        let base_ref = FileRef::from_parts(base, 1);

        let mut base_rec = SimRecord::blank(name, parent, false, 1);
        base_rec.size = size;
        base_rec.extension_record = Some(ext);
        self.records.insert(base, base_rec);

        let mut ext_rec = SimRecord::blank(name, parent, false, 1);
        ext_rec.size = size;
        ext_rec.base_record = Some(base_ref);
        self.records.insert(ext, ext_rec);

        base_ref
    }

    pub fn build(self) -> Result<MemVolume> {
        let bytes = self.build_bytes();
        MemVolume::new(bytes, "sim")
    }

    pub fn build_bytes(mut self) -> Vec<u8> {
        let total_records = self.next_record.max(ROOT_RECORD_NUMBER + 1);
        let mft_bytes = total_records * SIM_RECORD as u64;

        // $MFT's own record, describing the table
        let mut mft_rec = SimRecord::blank("$MFT", self.root(), false, 1);
        mft_rec.size = mft_bytes;
        mft_rec.attributes = file_attributes::HIDDEN | file_attributes::SYSTEM;
        self.records.insert(0, mft_rec);

        let mft_offset = SIM_MFT_LCN * SIM_CLUSTER as u64;
        let image_len = (mft_offset + mft_bytes).next_multiple_of(SIM_CLUSTER as u64) as usize;
        let mut image = vec![0u8; image_len];

        self.write_boot_sector(&mut image);

        let records = std::mem::take(&mut self.records);
        for (number, record) in &records {
            let start = mft_offset as usize + *number as usize * SIM_RECORD;
            let buf = &mut image[start..start + SIM_RECORD];
            encode_mft_record(buf, *number, record, mft_bytes);
        }

        image
    }

    fn write_boot_sector(&self, image: &mut [u8]) {
        let total_sectors = (image.len() / SIM_SECTOR) as u64;
        let boot = &mut image[..SIM_SECTOR];

        boot[0x03..0x0B].copy_from_slice(b"NTFS    ");
        boot[0x0B..0x0D].copy_from_slice(&(SIM_SECTOR as u16).to_le_bytes());
        boot[0x0D] = (SIM_CLUSTER / SIM_SECTOR) as u8;
        boot[0x28..0x30].copy_from_slice(&total_sectors.to_le_bytes());
        boot[0x30..0x38].copy_from_slice(&SIM_MFT_LCN.to_le_bytes());
        boot[0x38..0x40].copy_from_slice(&SIM_MFT_LCN.to_le_bytes());
        boot[0x40] = (-10i8) as u8; // 2^10 = 1024 bytes per record
        boot[0x44] = 1;
        boot[0x48..0x50].copy_from_slice(&self.serial.to_le_bytes());
    }
}

// ============================================================================
// MFT record encoding
// ============================================================================

fn push_resident_attribute(out: &mut Vec<u8>, attr_type: u32, value: &[u8]) {
    let length = (24 + value.len() + 7) & !7;
    let start = out.len();
    out.resize(start + length, 0);

    out[start..start + 4].copy_from_slice(&attr_type.to_le_bytes());
    out[start + 4..start + 8].copy_from_slice(&(length as u32).to_le_bytes());
    // non_resident = 0, name_length = 0, name_offset = 0, flags = 0, id = 0
    out[start + 16..start + 20].copy_from_slice(&(value.len() as u32).to_le_bytes());
    out[start + 20..start + 22].copy_from_slice(&24u16.to_le_bytes());
    out[start + 24..start + 24 + value.len()].copy_from_slice(value);
}

fn push_nonresident_data(out: &mut Vec<u8>, size: u64, runs: &[u8]) {
    let length = (64 + runs.len() + 7) & !7;
    let start = out.len();
    out.resize(start + length, 0);

    let clusters = size.div_ceil(SIM_CLUSTER as u64);
    out[start..start + 4].copy_from_slice(&0x80u32.to_le_bytes());
    out[start + 4..start + 8].copy_from_slice(&(length as u32).to_le_bytes());
    out[start + 8] = 1; // non-resident
    out[start + 24..start + 32].copy_from_slice(&clusters.saturating_sub(1).to_le_bytes());
    out[start + 32..start + 34].copy_from_slice(&64u16.to_le_bytes()); // runs offset
    out[start + 40..start + 48].copy_from_slice(&(clusters * SIM_CLUSTER as u64).to_le_bytes());
    out[start + 48..start + 56].copy_from_slice(&size.to_le_bytes());
    out[start + 56..start + 64].copy_from_slice(&size.to_le_bytes());
    out[start + 64..start + 64 + runs.len()].copy_from_slice(runs);
}

fn standard_information_value(rec: &SimRecord) -> Vec<u8> {
    let mut v = vec![0u8; 48];
    v[0..8].copy_from_slice(&rec.created.to_le_bytes());
    v[8..16].copy_from_slice(&rec.modified.to_le_bytes());
    v[16..24].copy_from_slice(&rec.modified.to_le_bytes());
    v[24..32].copy_from_slice(&rec.accessed.to_le_bytes());
    v[32..36].copy_from_slice(&rec.attributes.to_le_bytes());
    v
}

fn file_name_value(rec: &SimRecord) -> Vec<u8> {
    let name_units: Vec<u16> = rec.name.encode_utf16().collect();
    let mut v = vec![0u8; 66 + name_units.len() * 2];

    v[0..8].copy_from_slice(&rec.parent.0.to_le_bytes());
    v[8..16].copy_from_slice(&rec.created.to_le_bytes());
    v[16..24].copy_from_slice(&rec.modified.to_le_bytes());
    v[24..32].copy_from_slice(&rec.modified.to_le_bytes());
    v[32..40].copy_from_slice(&rec.accessed.to_le_bytes());
    v[40..48].copy_from_slice(&rec.size.next_multiple_of(SIM_CLUSTER as u64).to_le_bytes());
    v[48..56].copy_from_slice(&rec.size.to_le_bytes());
    v[56..60].copy_from_slice(&rec.attributes.to_le_bytes());
    v[64] = name_units.len() as u8;
    v[65] = 1; // Win32 namespace

    for (i, unit) in name_units.iter().enumerate() {
        v[66 + i * 2..68 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }

    v
}

fn attribute_list_value(entries: &[(u32, FileRef)]) -> Vec<u8> {
    let mut v = Vec::with_capacity(entries.len() * 32);
    for (attr_type, target) in entries {
        let start = v.len();
        v.resize(start + 32, 0);
        v[start..start + 4].copy_from_slice(&attr_type.to_le_bytes());
        v[start + 4..start + 6].copy_from_slice(&32u16.to_le_bytes());
        v[start + 16..start + 24].copy_from_slice(&target.0.to_le_bytes());
    }
    v
}

/// Encode a variable-length data run: count then LCN delta
fn encode_run(cluster_count: u64, lcn_delta: i64) -> Vec<u8> {
    fn varint_len_u(v: u64) -> usize {
        let mut n = 1;
        while n < 8 && v >= 1u64 << (8 * n) {
            n += 1;
        }
        n
    }
    fn varint_len_i(v: i64) -> usize {
        let mut n = 1;
        // Need the top bit of the last byte to match the sign
        while n < 8 {
            let shifted = (v << (64 - 8 * n)) >> (64 - 8 * n);
            if shifted == v {
                break;
            }
            n += 1;
        }
        n
    }

    let count_len = varint_len_u(cluster_count);
    let lcn_len = varint_len_i(lcn_delta);

    let mut run = Vec::with_capacity(1 + count_len + lcn_len);
    run.push(((lcn_len as u8) << 4) | count_len as u8);
    run.extend_from_slice(&cluster_count.to_le_bytes()[..count_len]);
    run.extend_from_slice(&lcn_delta.to_le_bytes()[..lcn_len]);
    run
}

fn encode_mft_record(buf: &mut [u8], record_number: u64, rec: &SimRecord, mft_bytes: u64) {
    // Header
    buf[0..4].copy_from_slice(b"FILE");
    buf[4..6].copy_from_slice(&48u16.to_le_bytes()); // USA offset
    buf[6..8].copy_from_slice(&3u16.to_le_bytes()); // USA size: usn + 2 sectors
    buf[16..18].copy_from_slice(&rec.sequence.to_le_bytes());
    buf[18..20].copy_from_slice(&1u16.to_le_bytes()); // hard links
    buf[20..22].copy_from_slice(&56u16.to_le_bytes()); // first attribute

    let mut flags = 0u16;
    if rec.in_use {
        flags |= 0x0001;
    }
    if rec.is_directory {
        flags |= 0x0002;
    }
    buf[22..24].copy_from_slice(&flags.to_le_bytes());
    buf[28..32].copy_from_slice(&(SIM_RECORD as u32).to_le_bytes());

    if let Some(base) = rec.base_record {
        buf[32..40].copy_from_slice(&base.0.to_le_bytes());
    }

    // Attributes. Normal records carry $STANDARD_INFORMATION + $FILE_NAME +
    // $DATA; a base with an extension carries $STANDARD_INFORMATION plus the
    // $ATTRIBUTE_LIST; the extension itself carries the listed attributes.
    let mut attrs: Vec<u8> = Vec::new();

    if rec.base_record.is_none() {
        attrs_push_std(&mut attrs, rec);
    }

    if let Some(ext) = rec.extension_record {
        let ext_ref = FileRef::from_parts(ext, 1);
        let list = attribute_list_value(&[(0x30, ext_ref), (0x80, ext_ref)]);
        push_resident_attribute(&mut attrs, 0x20, &list);
    } else {
        push_file_name_and_data(&mut attrs, record_number, rec, mft_bytes);
    }

    attrs.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    attrs.extend_from_slice(&[0u8; 4]);

    let attr_end = 56 + attrs.len();
    buf[56..attr_end].copy_from_slice(&attrs);
    buf[24..28].copy_from_slice(&(attr_end as u32).to_le_bytes());

    apply_sim_fixup(buf, rec.torn);
}

fn attrs_push_std(attrs: &mut Vec<u8>, rec: &SimRecord) {
    let std_info = standard_information_value(rec);
    push_resident_attribute(attrs, 0x10, &std_info);
}

fn push_file_name_and_data(attrs: &mut Vec<u8>, record_number: u64, rec: &SimRecord, mft_bytes: u64) {
    let fname = file_name_value(rec);
    push_resident_attribute(attrs, 0x30, &fname);

    if !rec.is_directory {
        if record_number == 0 {
            // $MFT: real data runs so the reader can map a fragmented table
            let clusters = mft_bytes.div_ceil(SIM_CLUSTER as u64);
            let run = encode_run(clusters, SIM_MFT_LCN as i64);
            let mut runs = run;
            runs.push(0);
            push_nonresident_data(attrs, mft_bytes, &runs);
        } else if rec.size > 0 {
            let clusters = rec.size.div_ceil(SIM_CLUSTER as u64);
            // Sparse run: sizes without backing clusters in the image
            let mut runs = vec![0x01u8, 0, 0x00];
            runs[1] = (clusters.min(255)) as u8;
            push_nonresident_data(attrs, rec.size, &runs);
        } else {
            push_resident_attribute(attrs, 0x80, &[]);
        }
    }
}

fn apply_sim_fixup(buf: &mut [u8], torn: bool) {
    let usn: u16 = 0x0042;
    buf[48..50].copy_from_slice(&usn.to_le_bytes());

    for sector in 1..=2usize {
        let end = sector * SIM_SECTOR - 2;
        let slot = 48 + sector * 2;
        // Stash the original bytes in the update sequence array
        let orig = [buf[end], buf[end + 1]];
        buf[slot] = orig[0];
        buf[slot + 1] = orig[1];
        // Replace with the sequence value, as the driver would on write
        buf[end..end + 2].copy_from_slice(&usn.to_le_bytes());
    }

    if torn {
        // Second sector carries a mismatched update sequence number
        let end = 2 * SIM_SECTOR - 2;
        buf[end..end + 2].copy_from_slice(&0x9999u16.to_le_bytes());
    }
}

// ============================================================================
// Synthetic USN journal
// ============================================================================

struct SimJournalInner {
    journal_id: u64,
    first_usn: u64,
    next_usn: u64,
    records: VecDeque<(u64, Vec<u8>)>,
    available: bool,
}

/// In-memory change journal with the same read semantics as
/// FSCTL_READ_USN_JOURNAL, including retention trimming (wrap) and handle
/// invalidation. Clones share state, so a test can push events while a
/// monitor owns another handle.
#[derive(Clone)]
pub struct SimJournal {
    inner: Arc<Mutex<SimJournalInner>>,
}

impl SimJournal {
    pub fn new(journal_id: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimJournalInner {
                journal_id,
                first_usn: 1,
                next_usn: 1,
                records: VecDeque::new(),
                available: true,
            })),
        }
    }

    pub fn next_usn(&self) -> u64 {
        self.inner.lock().next_usn
    }

    /// Append a raw journal record; returns its usn
    pub fn push_raw(
        &self,
        id: FileRef,
        parent: FileRef,
        name: &str,
        reason: u32,
        timestamp: u64,
        attributes: u32,
    ) -> u64 {
        let mut inner = self.inner.lock();
        let usn = inner.next_usn;
        inner.next_usn += 1;

        let encoded = encode_usn_record_v2(usn, id, parent, name, reason, timestamp, attributes);
        inner.records.push_back((usn, encoded));
        usn
    }

    pub fn push_create(&self, id: FileRef, parent: FileRef, name: &str, attributes: u32) -> u64 {
        use crate::ntfs::structs::usn_reason::{CLOSE, FILE_CREATE};
        self.push_raw(id, parent, name, FILE_CREATE | CLOSE, 0, attributes)
    }

    pub fn push_delete(&self, id: FileRef, parent: FileRef, name: &str) -> u64 {
        use crate::ntfs::structs::usn_reason::{CLOSE, FILE_DELETE};
        self.push_raw(id, parent, name, FILE_DELETE | CLOSE, 0, 0)
    }

    pub fn push_modify(&self, id: FileRef, parent: FileRef, name: &str, timestamp: u64) -> u64 {
        use crate::ntfs::structs::usn_reason::{CLOSE, DATA_EXTEND};
        self.push_raw(id, parent, name, DATA_EXTEND | CLOSE, timestamp, 0)
    }

    pub fn push_attrib(&self, id: FileRef, parent: FileRef, name: &str, attributes: u32) -> u64 {
        use crate::ntfs::structs::usn_reason::{BASIC_INFO_CHANGE, CLOSE};
        self.push_raw(id, parent, name, BASIC_INFO_CHANGE | CLOSE, 0, attributes)
    }

    /// Paired rename records; returns (old_usn, new_usn)
    pub fn push_rename(
        &self,
        id: FileRef,
        old_parent: FileRef,
        old_name: &str,
        new_parent: FileRef,
        new_name: &str,
    ) -> (u64, u64) {
        use crate::ntfs::structs::usn_reason::{CLOSE, RENAME_NEW_NAME, RENAME_OLD_NAME};
        let old = self.push_raw(id, old_parent, old_name, RENAME_OLD_NAME, 0, 0);
        let new = self.push_raw(id, new_parent, new_name, RENAME_NEW_NAME | CLOSE, 0, 0);
        (old, new)
    }

    /// Simulate journal wrap: history before `usn` is discarded
    pub fn truncate_to(&self, usn: u64) {
        let mut inner = self.inner.lock();
        inner.first_usn = usn;
        inner.records.retain(|(u, _)| *u >= usn);
    }

    /// Simulate the volume handle dying (dismount)
    pub fn invalidate(&self) {
        self.inner.lock().available = false;
    }

    pub fn revive(&self) {
        self.inner.lock().available = true;
    }
}

impl JournalSource for SimJournal {
    fn attach(&mut self) -> Result<UsnJournalData> {
        let inner = self.inner.lock();
        if !inner.available {
            return Err(NexScanError::VolumeUnavailable("sim".to_string()));
        }
        Ok(UsnJournalData {
            usn_journal_id: inner.journal_id,
            first_usn: inner.first_usn,
            next_usn: inner.next_usn,
            lowest_valid_usn: inner.first_usn,
            max_usn: u64::MAX,
            maximum_size: 0,
            allocation_delta: 0,
        })
    }

    fn read_batch(&mut self, start_usn: u64, buffer: &mut [u8]) -> Result<(u64, usize)> {
        let inner = self.inner.lock();

        if !inner.available {
            return Err(NexScanError::VolumeUnavailable("sim".to_string()));
        }

        if start_usn < inner.first_usn {
            return Err(NexScanError::JournalGap {
                cursor: start_usn,
                oldest: inner.first_usn,
            });
        }

        if buffer.len() < 8 {
            return Err(NexScanError::BufferTooSmall {
                needed: 8,
                got: buffer.len(),
            });
        }

        let mut offset = 8;
        let mut next = start_usn;

        for (usn, encoded) in inner.records.iter() {
            if *usn < start_usn {
                continue;
            }
            if offset + encoded.len() > buffer.len() {
                break;
            }
            buffer[offset..offset + encoded.len()].copy_from_slice(encoded);
            offset += encoded.len();
            next = usn + 1;
        }

        buffer[0..8].copy_from_slice(&next.to_le_bytes());
        Ok((next, if offset > 8 { offset } else { 8 }))
    }
}

fn encode_usn_record_v2(
    usn: u64,
    id: FileRef,
    parent: FileRef,
    name: &str,
    reason: u32,
    timestamp: u64,
    attributes: u32,
) -> Vec<u8> {
    let name_units: Vec<u16> = name.encode_utf16().collect();
    let name_bytes = name_units.len() * 2;
    let length = (60 + name_bytes + 7) & !7;

    let mut v = vec![0u8; length];
    v[0..4].copy_from_slice(&(length as u32).to_le_bytes());
    v[4..6].copy_from_slice(&2u16.to_le_bytes()); // major version
    v[8..16].copy_from_slice(&id.0.to_le_bytes());
    v[16..24].copy_from_slice(&parent.0.to_le_bytes());
    v[24..32].copy_from_slice(&usn.to_le_bytes());
    v[32..40].copy_from_slice(&timestamp.to_le_bytes());
    v[40..44].copy_from_slice(&reason.to_le_bytes());
    v[52..56].copy_from_slice(&attributes.to_le_bytes());
    v[56..58].copy_from_slice(&(name_bytes as u16).to_le_bytes());
    v[58..60].copy_from_slice(&60u16.to_le_bytes());

    for (i, unit) in name_units.iter().enumerate() {
        v[60 + i * 2..62 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }

    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::mft::{MftReader, ScanOptions};
    use crate::ntfs::structs::UsnRecord;
    use std::sync::atomic::AtomicBool;

    fn scan_all(volume: MemVolume) -> Vec<crate::index::entry::IndexEntry> {
        let mut reader = MftReader::new(volume, ScanOptions::default()).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut out = Vec::new();
        reader.scan(&cancel, |_, _| {}, |e| out.push(e)).unwrap();
        out
    }

    #[test]
    fn built_volume_scans_back_to_the_same_tree() {
        let mut sim = SimVolumeBuilder::new();
        let root = sim.root();
        let docs = sim.dir("docs", root);
        sim.file("a.txt", docs, 10);
        sim.file("big.bin", root, 10_000_000);
        sim.free_slot();
        sim.not_in_use("ghost.tmp");

        let entries = scan_all(sim.build().unwrap());
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        assert!(names.contains(&"$MFT"));
        assert!(names.contains(&"."));
        assert!(names.contains(&"docs"));
        assert!(names.contains(&"a.txt"));
        assert!(names.contains(&"big.bin"));
        assert!(!names.contains(&"ghost.tmp"));

        let big = entries.iter().find(|e| e.name == "big.bin").unwrap();
        assert_eq!(big.size, 10_000_000);
        assert!(!big.is_directory);

        let docs_entry = entries.iter().find(|e| e.name == "docs").unwrap();
        assert!(docs_entry.is_directory);
        assert_eq!(docs_entry.size, 0);
    }

    #[test]
    fn torn_record_is_skipped_not_fatal() {
        let mut sim = SimVolumeBuilder::new();
        let root = sim.root();
        sim.file("good.txt", root, 1);
        sim.torn_record("torn.txt");
        sim.file("after.txt", root, 2);

        let volume = sim.build().unwrap();
        let mut reader = MftReader::new(volume, ScanOptions::default()).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut names = Vec::new();
        let stats = reader
            .scan(&cancel, |_, _| {}, |e| names.push(e.name))
            .unwrap();

        assert_eq!(stats.decode_errors, 1);
        assert!(names.contains(&"good.txt".to_string()));
        assert!(names.contains(&"after.txt".to_string()));
        assert!(!names.contains(&"torn.txt".to_string()));
    }

    #[test]
    fn fragmented_attribute_list_resolves_the_name() {
        let mut sim = SimVolumeBuilder::new();
        let root = sim.root();
        let id = sim.fragmented_file("spanned.dat", root, 4242);

        let entries = scan_all(sim.build().unwrap());
        let spanned = entries.iter().find(|e| e.id == id).expect("base record indexed");
        assert_eq!(spanned.name, "spanned.dat");
        assert_eq!(spanned.size, 4242);

        // The extension record itself must not surface as its own entry
        assert_eq!(entries.iter().filter(|e| e.name == "spanned.dat").count(), 1);
    }

    #[test]
    fn progress_reports_fraction_of_total() {
        let mut sim = SimVolumeBuilder::new();
        let root = sim.root();
        for i in 0..10 {
            sim.file(&format!("f{}.txt", i), root, i);
        }

        let volume = sim.build().unwrap();
        let mut reader = MftReader::new(volume, ScanOptions { batch_size: 4, ..Default::default() }).unwrap();
        let total = reader.total_records();
        assert_eq!(total, 26); // records 0..=25

        let cancel = Arc::new(AtomicBool::new(false));
        let mut last = (0, 0);
        reader.scan(&cancel, |done, all| last = (done, all), |_| {}).unwrap();
        assert_eq!(last, (total, total));
    }

    #[test]
    fn cancellation_stops_within_a_batch() {
        let mut sim = SimVolumeBuilder::new();
        let root = sim.root();
        for i in 0..50 {
            sim.file(&format!("f{}.txt", i), root, 1);
        }

        let volume = sim.build().unwrap();
        let mut reader = MftReader::new(volume, ScanOptions { batch_size: 8, ..Default::default() }).unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let err = reader.scan(&cancel, |_, _| {}, |_| {}).unwrap_err();
        assert!(matches!(err, NexScanError::Cancelled));
    }

    #[test]
    fn sim_journal_records_decode_as_v2() {
        let journal = SimJournal::new(1);
        let id = FileRef::from_parts(20, 3);
        journal.push_create(id, FileRef::from_parts(5, 5), "hello.txt", 0x20);

        let mut j = journal.clone();
        let mut buf = vec![0u8; 4096];
        let (_, bytes) = j.read_batch(1, &mut buf).unwrap();
        assert!(bytes > 8);

        let record = UsnRecord::from_bytes(&buf[8..bytes]).unwrap();
        assert_eq!(record.major_version, 2);
        assert_eq!(record.file_reference_number, id.0);
        assert_eq!(record.file_name, "hello.txt");
        assert_eq!(record.usn, 1);
    }

    #[test]
    fn journal_gap_and_invalidate_semantics() {
        let journal = SimJournal::new(1);
        let id = FileRef::from_parts(20, 1);
        journal.push_create(id, FileRef::from_parts(5, 5), "a", 0);
        journal.truncate_to(journal.next_usn());

        let mut j = journal.clone();
        let mut buf = vec![0u8; 1024];
        assert!(matches!(
            j.read_batch(1, &mut buf),
            Err(NexScanError::JournalGap { .. })
        ));

        journal.invalidate();
        assert!(matches!(
            j.read_batch(journal.next_usn(), &mut buf),
            Err(NexScanError::VolumeUnavailable(_))
        ));
    }
}
