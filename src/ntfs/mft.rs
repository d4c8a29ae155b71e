//! MFT record decoding and bulk reading
//!
//! `parse_mft_record` is the Record Decoder: a pure function over one
//! record's bytes (fixup repair, attribute walk, $ATTRIBUTE_LIST discovery).
//! `MftReader` is the Bulk Reader: it streams records in storage order over a
//! `VolumeRead`, resolves attribute-list fragments through extra record
//! fetches, and emits `IndexEntry` values for the indexer.

use crate::error::{NexScanError, Result};
use crate::index::entry::{FileRef, IndexEntry};
use crate::ntfs::structs::*;
use crate::volume::VolumeRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Fixup
// ============================================================================

/// Verify and undo the update sequence array.
///
/// NTFS replaces the last two bytes of each sector with a sequence number and
/// stashes the originals in the fixup array; a mismatch means a torn write.
pub fn apply_fixup(record_number: u64, data: &mut [u8], header: &MftRecordHeader) -> Result<()> {
    let sector_size = SECTOR_SIZE as usize;
    let usa_offset = header.update_sequence_offset as usize;
    let usa_count = header.update_sequence_size as usize;

    if usa_offset + 2 > data.len() {
        return Err(NexScanError::FixupMismatch(record_number));
    }

    let seq_number = u16::from_le_bytes([data[usa_offset], data[usa_offset + 1]]);

    for i in 1..usa_count {
        let sector_end = i * sector_size - 2;
        let fixup_offset = usa_offset + i * 2;

        if sector_end + 2 > data.len() || fixup_offset + 2 > data.len() {
            break;
        }

        let stored_seq = u16::from_le_bytes([data[sector_end], data[sector_end + 1]]);
        if stored_seq != seq_number {
            return Err(NexScanError::FixupMismatch(record_number));
        }

        data[sector_end] = data[fixup_offset];
        data[sector_end + 1] = data[fixup_offset + 1];
    }

    Ok(())
}

// ============================================================================
// Parsed record
// ============================================================================

/// Decoded form of one MFT record, before extension-record merging
#[derive(Debug, Clone, Default)]
pub struct ParsedRecord {
    pub record_number: u64,
    pub sequence: u16,
    pub in_use: bool,
    pub is_directory: bool,
    pub hard_link_count: u16,
    /// Non-zero when this is an extension record belonging to a base record
    pub base_record: u64,
    pub name: Option<String>,
    name_rank: u8,
    pub parent: Option<FileRef>,
    pub std_info: Option<StandardInformation>,
    /// Main $DATA stream size, when a $DATA attribute was present
    pub size: Option<u64>,
    pub allocated_size: u64,
    /// Data runs of the main $DATA stream (used for record 0 / $MFT extents)
    pub data_runs: Vec<DataRun>,
    pub attr_list: Vec<AttributeListEntry>,
    /// $FILE_NAME timestamps, fallback when $STANDARD_INFORMATION is elsewhere
    fn_times: Option<(u64, u64, u64)>,
    fn_attributes: u32,
}

impl ParsedRecord {
    /// Fold attributes found in an extension record into this base record
    pub fn merge_extension(&mut self, ext: ParsedRecord) {
        if ext.name.is_some() && (self.name.is_none() || ext.name_rank > self.name_rank) {
            self.name = ext.name;
            self.name_rank = ext.name_rank;
            if ext.parent.is_some() {
                self.parent = ext.parent;
            }
            if ext.fn_times.is_some() {
                self.fn_times = ext.fn_times;
            }
            self.fn_attributes |= ext.fn_attributes;
        }
        if self.std_info.is_none() {
            self.std_info = ext.std_info;
        }
        if self.size.is_none() {
            self.size = ext.size;
            self.allocated_size = self.allocated_size.max(ext.allocated_size);
        }
    }

    /// Does this base record need extension records fetched to be complete?
    pub fn needs_extensions(&self) -> bool {
        !self.attr_list.is_empty() && (self.name.is_none() || self.std_info.is_none() || self.size.is_none())
    }

    /// Convert into an index entry. Returns `None` for records with no
    /// usable name (extension records, corrupt name attributes).
    pub fn into_entry(self) -> Option<IndexEntry> {
        let name = self.name?;
        let parent = self.parent?;

        let (created, modified, accessed, attributes) = match &self.std_info {
            Some(si) => (
                si.creation_time,
                si.modification_time,
                si.access_time,
                si.file_attributes,
            ),
            None => {
                let (c, m, a) = self.fn_times.unwrap_or((0, 0, 0));
                (c, m, a, self.fn_attributes)
            }
        };

        let attributes = if self.is_directory {
            attributes | file_attributes::DIRECTORY
        } else {
            attributes
        };

        Some(IndexEntry {
            id: FileRef::from_parts(self.record_number, self.sequence),
            parent,
            name,
            is_directory: self.is_directory,
            size: if self.is_directory { 0 } else { self.size.unwrap_or(0) },
            allocated_size: if self.is_directory { 0 } else { self.allocated_size },
            created,
            modified,
            accessed,
            attributes,
            hard_link_count: self.hard_link_count,
            content_tag: None,
        })
    }
}

/// Decode one raw MFT record.
///
/// Returns `Ok(None)` for never-initialized slots (zeroed signature), which
/// are normal in a growing MFT. Records marked "not in use" come back with
/// `in_use == false` so the caller can count and skip them. Actual corruption
/// (bad signature, torn write, malformed attributes) is an error the caller
/// logs and skips without aborting the stream.
pub fn parse_mft_record(record_number: u64, data: &mut [u8]) -> Result<Option<ParsedRecord>> {
    let header = MftRecordHeader::from_bytes(data).ok_or_else(|| {
        NexScanError::InvalidRecord(record_number, "record shorter than header".to_string())
    })?;

    if header.signature == 0 {
        return Ok(None);
    }

    if header.signature == MFT_RECORD_BAD_SIGNATURE {
        return Err(NexScanError::InvalidRecord(
            record_number,
            "BAAD signature (sector mismatch logged by NTFS)".to_string(),
        ));
    }

    if !header.is_valid() {
        return Err(NexScanError::InvalidRecord(
            record_number,
            format!("unexpected signature 0x{:08X}", header.signature),
        ));
    }

    apply_fixup(record_number, data, &header)?;

    let mut parsed = ParsedRecord {
        record_number,
        sequence: header.sequence_number,
        in_use: header.is_in_use(),
        is_directory: header.is_directory(),
        hard_link_count: header.hard_link_count,
        base_record: header.base_record_number(),
        ..Default::default()
    };

    if !parsed.in_use {
        return Ok(Some(parsed));
    }

    walk_attributes(data, &header, &mut parsed)?;

    Ok(Some(parsed))
}

fn walk_attributes(
    data: &[u8],
    header: &MftRecordHeader,
    parsed: &mut ParsedRecord,
) -> Result<()> {
    let mut offset = header.first_attribute_offset as usize;

    while offset + 16 <= data.len() {
        let attr_header = AttributeHeader::from_bytes(&data[offset..]).ok_or_else(|| {
            NexScanError::InvalidAttribute(offset as u32, "failed to parse header".to_string())
        })?;

        if attr_header.attribute_type == ATTRIBUTE_END_MARKER || attr_header.length == 0 {
            break;
        }

        // Bounds check before slicing the attribute
        if offset + attr_header.length as usize > data.len() {
            break;
        }

        let attr_data = &data[offset..offset + attr_header.length as usize];

        match AttributeType::from_u32(attr_header.attribute_type) {
            Some(AttributeType::StandardInformation) => {
                if let Some(h) = ResidentAttributeHeader::from_bytes(attr_data) {
                    if let Some(content) = h.value(attr_data) {
                        parsed.std_info = StandardInformation::from_bytes(content);
                    }
                }
            }
            Some(AttributeType::FileName) => {
                if let Some(h) = ResidentAttributeHeader::from_bytes(attr_data) {
                    if let Some(content) = h.value(attr_data) {
                        if let Some(fn_attr) = FileNameAttribute::from_bytes(content) {
                            let rank = fn_attr.namespace.rank();
                            if parsed.name.is_none() || rank > parsed.name_rank {
                                parsed.parent =
                                    Some(FileRef::from_raw(fn_attr.parent_reference));
                                parsed.fn_times = Some((
                                    fn_attr.creation_time,
                                    fn_attr.modification_time,
                                    fn_attr.access_time,
                                ));
                                parsed.fn_attributes = fn_attr.file_attributes;
                                parsed.name = Some(fn_attr.name);
                                parsed.name_rank = rank;
                            }
                        }
                    }
                }
            }
            Some(AttributeType::Data) => {
                // Only the unnamed (main) stream contributes the file size
                if attr_header.name_length == 0 {
                    if attr_header.non_resident {
                        if let Some(nr) = NonResidentAttributeHeader::from_bytes(attr_data) {
                            parsed.size = Some(nr.data_size);
                            parsed.allocated_size = nr.allocated_size;

                            let runs_offset = nr.data_runs_offset as usize;
                            if runs_offset < attr_data.len() {
                                let (runs, _) = DataRun::decode_runs(&attr_data[runs_offset..]);
                                parsed.data_runs = runs;
                            }
                        }
                    } else if let Some(r) = ResidentAttributeHeader::from_bytes(attr_data) {
                        parsed.size = Some(r.value_length as u64);
                    }
                }
            }
            Some(AttributeType::AttributeList) => {
                if let Some(h) = ResidentAttributeHeader::from_bytes(attr_data) {
                    if let Some(content) = h.value(attr_data) {
                        parsed.attr_list = parse_attribute_list(content);
                    }
                }
                // Non-resident attribute lists exist on pathological volumes;
                // those records fall back to $FILE_NAME data from this record.
            }
            _ => {}
        }

        offset += attr_header.length as usize;
    }

    Ok(())
}

// ============================================================================
// Bulk reader
// ============================================================================

/// Bulk scan configuration
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// MFT records fetched per read
    pub batch_size: usize,
    pub include_hidden: bool,
    pub include_system: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            include_hidden: true,
            include_system: true,
        }
    }
}

/// Statistics from one bulk scan pass
#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    pub records_total: u64,
    pub records_processed: u64,
    pub entries_emitted: u64,
    pub free_skipped: u64,
    pub extension_records: u64,
    pub decode_errors: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
struct MftExtent {
    vcn: u64,
    lcn: u64,
    cluster_count: u64,
}

/// Sequential MFT reader over any `VolumeRead` backend.
///
/// Reads records in storage order (not tree order), never mutates the volume,
/// and is restartable from the start: every `scan` call begins at record 0.
pub struct MftReader<V: VolumeRead> {
    volume: V,
    geometry: VolumeGeometry,
    extents: Vec<MftExtent>,
    options: ScanOptions,
}

impl<V: VolumeRead> MftReader<V> {
    /// Open a reader, bootstrapping MFT length and extents from record 0
    /// ($MFT's own record) when the geometry alone does not provide them.
    pub fn new(volume: V, options: ScanOptions) -> Result<Self> {
        let mut geometry = volume.geometry().clone();
        let record_size = geometry.bytes_per_record as usize;

        if record_size == 0 {
            return Err(NexScanError::NotNtfs(volume.volume_id()));
        }

        let mut extents = Vec::new();
        let mut buf = vec![0u8; record_size];
        let read = volume.read_at(geometry.mft_byte_offset(), &mut buf)?;

        if read == record_size {
            match parse_mft_record(0, &mut buf) {
                Ok(Some(rec0)) if rec0.in_use => {
                    if geometry.mft_valid_data_length == 0 {
                        if let Some(size) = rec0.size {
                            geometry.mft_valid_data_length = size;
                        }
                    }
                    extents = extents_from_runs(&rec0.data_runs);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse $MFT record 0, assuming contiguous MFT");
                }
            }
        }

        Ok(Self {
            volume,
            geometry,
            extents,
            options,
        })
    }

    pub fn volume_id(&self) -> String {
        self.volume.volume_id()
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Total MFT records, known up front (drives progress fractions)
    pub fn total_records(&self) -> u64 {
        self.geometry.total_records()
    }

    /// Byte offset of a record, extent-aware for fragmented MFTs
    fn record_offset(&self, record_number: u64) -> u64 {
        let record_size = self.geometry.bytes_per_record as u64;
        let bpc = self.geometry.bytes_per_cluster as u64;

        if self.extents.is_empty() {
            return self.geometry.mft_byte_offset() + record_number * record_size;
        }

        let byte_pos = record_number * record_size;
        let target_vcn = byte_pos / bpc;
        let offset_in_cluster = byte_pos % bpc;

        for extent in &self.extents {
            if target_vcn >= extent.vcn && target_vcn < extent.vcn + extent.cluster_count {
                let lcn = extent.lcn + (target_vcn - extent.vcn);
                return lcn * bpc + offset_in_cluster;
            }
        }

        // Beyond the mapped extents: fall back to the contiguous assumption
        self.geometry.mft_byte_offset() + record_number * record_size
    }

    /// Fetch one record's raw bytes (used for extension-record resolution)
    pub fn read_record(&self, record_number: u64) -> Result<Vec<u8>> {
        let record_size = self.geometry.bytes_per_record as usize;
        let mut buf = vec![0u8; record_size];
        let read = self.volume.read_at(self.record_offset(record_number), &mut buf)?;

        if read < record_size {
            return Err(NexScanError::InvalidRecord(
                record_number,
                format!("short read: {} of {} bytes", read, record_size),
            ));
        }

        Ok(buf)
    }

    /// Resolve attributes living in extension records into the base record
    fn resolve_extensions(&self, parsed: &mut ParsedRecord) {
        let entries = parsed.attr_list.clone();
        for entry in entries {
            let ext_record = entry.record_number();
            if ext_record == parsed.record_number {
                continue;
            }
            let wanted = matches!(
                AttributeType::from_u32(entry.attribute_type),
                Some(AttributeType::FileName)
                    | Some(AttributeType::StandardInformation)
                    | Some(AttributeType::Data)
            );
            if !wanted {
                continue;
            }

            match self.read_record(ext_record) {
                Ok(mut data) => match parse_mft_record(ext_record, &mut data) {
                    Ok(Some(ext)) if ext.base_record == parsed.record_number => {
                        parsed.merge_extension(ext);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(record = ext_record, error = %e, "skipping unreadable extension record");
                    }
                },
                Err(e) => {
                    tracing::debug!(record = ext_record, error = %e, "failed to fetch extension record");
                }
            }

            if !parsed.needs_extensions() {
                break;
            }
        }
    }

    /// Scan the whole MFT from record 0, feeding every decoded entry to
    /// `sink`. `progress` receives `(records_processed, records_total)` once
    /// per batch. Cancellation is honored between records; the scan never
    /// mutates anything, so restarting is just calling `scan` again.
    pub fn scan<P, S>(
        &mut self,
        cancel: &Arc<AtomicBool>,
        mut progress: P,
        mut sink: S,
    ) -> Result<ScanStats>
    where
        P: FnMut(u64, u64),
        S: FnMut(IndexEntry),
    {
        let start = Instant::now();
        let total = self.total_records();
        let record_size = self.geometry.bytes_per_record as usize;
        let batch = self.options.batch_size.max(1);
        let mut buffer = vec![0u8; record_size * batch];

        let mut stats = ScanStats {
            records_total: total,
            ..Default::default()
        };

        let mut processed = 0u64;
        while processed < total {
            let count = (total - processed).min(batch as u64) as usize;
            let span = &mut buffer[..record_size * count];

            let got = if self.extents.len() <= 1 {
                self.volume.read_at(self.record_offset(processed), span)?
            } else {
                // Fragmented MFT: fetch record by record so extent boundaries
                // inside the batch stay correct
                let mut filled = 0;
                for i in 0..count {
                    let slice = &mut span[i * record_size..(i + 1) * record_size];
                    let n = self
                        .volume
                        .read_at(self.record_offset(processed + i as u64), slice)?;
                    if n < record_size {
                        break;
                    }
                    filled += record_size;
                }
                filled
            };

            let whole_records = got / record_size;

            for i in 0..whole_records {
                if cancel.load(Ordering::SeqCst) {
                    stats.elapsed = start.elapsed();
                    return Err(NexScanError::Cancelled);
                }

                let record_number = processed + i as u64;
                let data = &mut span[i * record_size..(i + 1) * record_size];

                match parse_mft_record(record_number, data) {
                    Ok(None) => stats.free_skipped += 1,
                    Ok(Some(parsed)) if !parsed.in_use => stats.free_skipped += 1,
                    Ok(Some(parsed)) if parsed.base_record != 0 => {
                        // Extension records surface through their base record
                        stats.extension_records += 1;
                    }
                    Ok(Some(mut parsed)) => {
                        if parsed.needs_extensions() {
                            self.resolve_extensions(&mut parsed);
                        }
                        if let Some(entry) = parsed.into_entry() {
                            if !self.options.include_hidden && entry.is_hidden() {
                                continue;
                            }
                            if !self.options.include_system && entry.is_system() {
                                continue;
                            }
                            stats.entries_emitted += 1;
                            sink(entry);
                        }
                    }
                    Err(e) if e.is_recoverable() => {
                        stats.decode_errors += 1;
                        tracing::debug!(record = record_number, error = %e, "skipping undecodable record");
                    }
                    Err(e) => {
                        stats.elapsed = start.elapsed();
                        return Err(e);
                    }
                }
            }

            processed += whole_records as u64;
            stats.records_processed = processed;
            progress(processed, total);

            if whole_records < count {
                // Short read at the tail of the volume
                break;
            }
        }

        stats.elapsed = start.elapsed();
        tracing::info!(
            volume = %self.volume_id(),
            entries = stats.entries_emitted,
            records = stats.records_processed,
            skipped = stats.free_skipped,
            errors = stats.decode_errors,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "bulk scan complete"
        );

        Ok(stats)
    }
}

fn extents_from_runs(runs: &[DataRun]) -> Vec<MftExtent> {
    let mut extents = Vec::new();
    let mut vcn = 0u64;

    for run in runs {
        if !run.is_sparse && run.lcn >= 0 {
            extents.push(MftExtent {
                vcn,
                lcn: run.lcn as u64,
                cluster_count: run.cluster_count,
            });
        }
        vcn += run.cluster_count;
    }

    extents
}
