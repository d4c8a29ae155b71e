//! NTFS on-disk structures and constants
//!
//! Everything here is pure parsing over byte buffers. Every length and offset
//! field is validated against the buffer bound before use; a short or
//! inconsistent buffer yields `None`, never a panic.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

// ============================================================================
// NTFS Constants
// ============================================================================

/// MFT record signature "FILE"
pub const MFT_RECORD_SIGNATURE: u32 = 0x454C4946; // "FILE" in little-endian

/// Bad MFT record signature "BAAD"
pub const MFT_RECORD_BAD_SIGNATURE: u32 = 0x44414142; // "BAAD"

/// End of attributes marker
pub const ATTRIBUTE_END_MARKER: u32 = 0xFFFFFFFF;

/// Standard MFT record size
pub const DEFAULT_MFT_RECORD_SIZE: u32 = 1024;

/// Standard sector size
pub const SECTOR_SIZE: u32 = 512;

/// MFT record number of the volume root directory
pub const ROOT_RECORD_NUMBER: u64 = 5;

/// Records 0-15 are reserved for NTFS metadata files ($MFT, $LogFile, ...)
pub const FIRST_USER_RECORD: u64 = 16;

/// Mask extracting the record number from a 64-bit file reference
pub const FILE_REF_RECORD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

// MFT Record Flags
pub const MFT_RECORD_IN_USE: u16 = 0x0001;
pub const MFT_RECORD_IS_DIRECTORY: u16 = 0x0002;

// ============================================================================
// Attribute Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AttributeType {
    StandardInformation = 0x10,
    AttributeList = 0x20,
    FileName = 0x30,
    ObjectId = 0x40,
    SecurityDescriptor = 0x50,
    VolumeName = 0x60,
    VolumeInformation = 0x70,
    Data = 0x80,
    IndexRoot = 0x90,
    IndexAllocation = 0xA0,
    Bitmap = 0xB0,
    ReparsePoint = 0xC0,
    EaInformation = 0xD0,
    Ea = 0xE0,
    LoggedUtilityStream = 0x100,
    End = 0xFFFFFFFF,
}

impl AttributeType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x10 => Some(Self::StandardInformation),
            0x20 => Some(Self::AttributeList),
            0x30 => Some(Self::FileName),
            0x40 => Some(Self::ObjectId),
            0x50 => Some(Self::SecurityDescriptor),
            0x60 => Some(Self::VolumeName),
            0x70 => Some(Self::VolumeInformation),
            0x80 => Some(Self::Data),
            0x90 => Some(Self::IndexRoot),
            0xA0 => Some(Self::IndexAllocation),
            0xB0 => Some(Self::Bitmap),
            0xC0 => Some(Self::ReparsePoint),
            0xD0 => Some(Self::EaInformation),
            0xE0 => Some(Self::Ea),
            0x100 => Some(Self::LoggedUtilityStream),
            0xFFFFFFFF => Some(Self::End),
            _ => None,
        }
    }
}

// ============================================================================
// Filename Namespace
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FilenameNamespace {
    Posix = 0,
    Win32 = 1,
    Dos = 2,
    Win32AndDos = 3,
}

impl FilenameNamespace {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Posix),
            1 => Some(Self::Win32),
            2 => Some(Self::Dos),
            3 => Some(Self::Win32AndDos),
            _ => None,
        }
    }

    /// Rank for picking the display name when a record carries several
    /// $FILE_NAME attributes: Win32 > Win32+DOS > POSIX > DOS.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Win32 => 3,
            Self::Win32AndDos => 2,
            Self::Posix => 1,
            Self::Dos => 0,
        }
    }
}

// ============================================================================
// Volume Geometry
// ============================================================================

/// The handful of volume parameters the reader needs to locate and size MFT
/// records. Derived either from FSCTL_GET_NTFS_VOLUME_DATA (live volumes) or
/// from the boot sector (raw images).
#[derive(Debug, Clone, Default)]
pub struct VolumeGeometry {
    pub serial_number: u64,
    pub bytes_per_sector: u32,
    pub bytes_per_cluster: u32,
    pub bytes_per_record: u32,
    pub total_clusters: u64,
    pub mft_start_lcn: u64,
    /// Valid data length of $MFT's $DATA stream. Zero when derived from a
    /// boot sector alone; filled in by parsing record 0.
    pub mft_valid_data_length: u64,
}

impl VolumeGeometry {
    /// Parse from the raw 0x60-byte FSCTL_GET_NTFS_VOLUME_DATA buffer
    pub fn from_ntfs_volume_data(data: &[u8]) -> Option<Self> {
        if data.len() < 0x60 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        let serial_number = cursor.read_u64::<LittleEndian>().ok()?;
        let _number_sectors = cursor.read_u64::<LittleEndian>().ok()?;
        let total_clusters = cursor.read_u64::<LittleEndian>().ok()?;
        let _free_clusters = cursor.read_u64::<LittleEndian>().ok()?;
        let _total_reserved = cursor.read_u64::<LittleEndian>().ok()?;
        let bytes_per_sector = cursor.read_u32::<LittleEndian>().ok()?;
        let bytes_per_cluster = cursor.read_u32::<LittleEndian>().ok()?;
        let bytes_per_record = cursor.read_u32::<LittleEndian>().ok()?;
        let _clusters_per_record = cursor.read_u32::<LittleEndian>().ok()?;
        let mft_valid_data_length = cursor.read_u64::<LittleEndian>().ok()?;
        let mft_start_lcn = cursor.read_u64::<LittleEndian>().ok()?;

        Some(Self {
            serial_number,
            bytes_per_sector,
            bytes_per_cluster,
            bytes_per_record,
            total_clusters,
            mft_start_lcn,
            mft_valid_data_length,
        })
    }

    /// Byte offset of the start of the MFT on the volume
    pub fn mft_byte_offset(&self) -> u64 {
        self.mft_start_lcn * self.bytes_per_cluster as u64
    }

    /// Total MFT records, known up front from the valid data length
    pub fn total_records(&self) -> u64 {
        if self.bytes_per_record == 0 {
            return 0;
        }
        self.mft_valid_data_length / self.bytes_per_record as u64
    }

    /// Stable identifier string for this volume (the NTFS serial)
    pub fn volume_id(&self) -> String {
        format!("{:016X}", self.serial_number)
    }
}

// ============================================================================
// NTFS Boot Sector
// ============================================================================

/// Parsed NTFS boot sector (first 512 bytes of an NTFS partition)
#[derive(Debug, Clone)]
pub struct BootSector {
    /// OEM ID - must be "NTFS    " (8 bytes at offset 0x03)
    pub oem_id: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_sectors: u64,
    /// MFT starting cluster number (LCN)
    pub mft_cluster_number: u64,
    pub mft_mirror_cluster_number: u64,
    /// Clusters per MFT record (signed: negative means 2^|value| bytes)
    pub clusters_per_mft_record: i8,
    pub volume_serial_number: u64,
}

impl BootSector {
    /// Parse from raw boot sector data
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 0x50 {
            return None;
        }

        let mut oem_id = [0u8; 8];
        oem_id.copy_from_slice(&data[0x03..0x0B]);

        let bytes_per_sector = u16::from_le_bytes([data[0x0B], data[0x0C]]);
        let sectors_per_cluster = data[0x0D];
        let total_sectors = u64::from_le_bytes(data[0x28..0x30].try_into().ok()?);
        let mft_cluster_number = u64::from_le_bytes(data[0x30..0x38].try_into().ok()?);
        let mft_mirror_cluster_number = u64::from_le_bytes(data[0x38..0x40].try_into().ok()?);
        let clusters_per_mft_record = data[0x40] as i8;
        let volume_serial_number = u64::from_le_bytes(data[0x48..0x50].try_into().ok()?);

        Some(Self {
            oem_id,
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors,
            mft_cluster_number,
            mft_mirror_cluster_number,
            clusters_per_mft_record,
            volume_serial_number,
        })
    }

    /// Validate this is an NTFS boot sector
    pub fn is_valid_ntfs(&self) -> bool {
        &self.oem_id == b"NTFS    "
            && self.bytes_per_sector >= 256
            && self.bytes_per_sector.is_power_of_two()
            && self.sectors_per_cluster > 0
            && self.sectors_per_cluster.is_power_of_two()
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    /// If clusters_per_mft_record is negative, size = 2^|value|;
    /// if positive, size = value * bytes_per_cluster.
    pub fn bytes_per_mft_record(&self) -> u32 {
        if self.clusters_per_mft_record < 0 {
            1u32 << (-self.clusters_per_mft_record as u32)
        } else {
            self.clusters_per_mft_record as u32 * self.bytes_per_cluster()
        }
    }

    /// Derive volume geometry. `mft_valid_data_length` stays 0 until record
    /// 0's $DATA attribute has been parsed.
    pub fn to_geometry(&self) -> VolumeGeometry {
        VolumeGeometry {
            serial_number: self.volume_serial_number,
            bytes_per_sector: self.bytes_per_sector as u32,
            bytes_per_cluster: self.bytes_per_cluster(),
            bytes_per_record: self.bytes_per_mft_record(),
            total_clusters: self.total_sectors / self.sectors_per_cluster as u64,
            mft_start_lcn: self.mft_cluster_number,
            mft_valid_data_length: 0,
        }
    }
}

// ============================================================================
// MFT Record Header
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MftRecordHeader {
    pub signature: u32,
    pub update_sequence_offset: u16,
    pub update_sequence_size: u16,
    pub log_sequence_number: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub first_attribute_offset: u16,
    pub flags: u16,
    pub used_size: u32,
    pub allocated_size: u32,
    pub base_record_reference: u64,
    pub next_attribute_id: u16,
}

impl MftRecordHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 48 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        Some(Self {
            signature: cursor.read_u32::<LittleEndian>().ok()?,
            update_sequence_offset: cursor.read_u16::<LittleEndian>().ok()?,
            update_sequence_size: cursor.read_u16::<LittleEndian>().ok()?,
            log_sequence_number: cursor.read_u64::<LittleEndian>().ok()?,
            sequence_number: cursor.read_u16::<LittleEndian>().ok()?,
            hard_link_count: cursor.read_u16::<LittleEndian>().ok()?,
            first_attribute_offset: cursor.read_u16::<LittleEndian>().ok()?,
            flags: cursor.read_u16::<LittleEndian>().ok()?,
            used_size: cursor.read_u32::<LittleEndian>().ok()?,
            allocated_size: cursor.read_u32::<LittleEndian>().ok()?,
            base_record_reference: cursor.read_u64::<LittleEndian>().ok()?,
            next_attribute_id: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.signature == MFT_RECORD_SIGNATURE
    }

    pub fn is_in_use(&self) -> bool {
        (self.flags & MFT_RECORD_IN_USE) != 0
    }

    pub fn is_directory(&self) -> bool {
        (self.flags & MFT_RECORD_IS_DIRECTORY) != 0
    }

    /// Base record number (lower 48 bits); 0 means this IS a base record
    pub fn base_record_number(&self) -> u64 {
        self.base_record_reference & FILE_REF_RECORD_MASK
    }

    pub fn is_base_record(&self) -> bool {
        self.base_record_reference == 0
    }
}

// ============================================================================
// Attribute Headers
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct AttributeHeader {
    pub attribute_type: u32,
    pub length: u32,
    pub non_resident: bool,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub attribute_id: u16,
}

impl AttributeHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        Some(Self {
            attribute_type: cursor.read_u32::<LittleEndian>().ok()?,
            length: cursor.read_u32::<LittleEndian>().ok()?,
            non_resident: cursor.read_u8().ok()? != 0,
            name_length: cursor.read_u8().ok()?,
            name_offset: cursor.read_u16::<LittleEndian>().ok()?,
            flags: cursor.read_u16::<LittleEndian>().ok()?,
            attribute_id: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResidentAttributeHeader {
    pub base: AttributeHeader,
    pub value_length: u32,
    pub value_offset: u16,
}

impl ResidentAttributeHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let base = AttributeHeader::from_bytes(data)?;
        if base.non_resident || data.len() < 24 {
            return None;
        }

        let mut cursor = Cursor::new(&data[16..]);

        Some(Self {
            base,
            value_length: cursor.read_u32::<LittleEndian>().ok()?,
            value_offset: cursor.read_u16::<LittleEndian>().ok()?,
        })
    }

    /// The attribute content, bound-checked against the enclosing buffer
    pub fn value<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        let start = self.value_offset as usize;
        let end = start.checked_add(self.value_length as usize)?;
        data.get(start..end)
    }
}

#[derive(Debug, Clone)]
pub struct NonResidentAttributeHeader {
    pub base: AttributeHeader,
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub data_runs_offset: u16,
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
}

impl NonResidentAttributeHeader {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let base = AttributeHeader::from_bytes(data)?;
        if !base.non_resident || data.len() < 64 {
            return None;
        }

        let mut cursor = Cursor::new(&data[16..]);

        let lowest_vcn = cursor.read_u64::<LittleEndian>().ok()?;
        let highest_vcn = cursor.read_u64::<LittleEndian>().ok()?;
        let data_runs_offset = cursor.read_u16::<LittleEndian>().ok()?;
        let compression_unit = cursor.read_u16::<LittleEndian>().ok()?;
        let _padding = cursor.read_u32::<LittleEndian>().ok()?;
        let allocated_size = cursor.read_u64::<LittleEndian>().ok()?;
        let data_size = cursor.read_u64::<LittleEndian>().ok()?;
        let initialized_size = cursor.read_u64::<LittleEndian>().ok()?;

        Some(Self {
            base,
            lowest_vcn,
            highest_vcn,
            data_runs_offset,
            compression_unit,
            allocated_size,
            data_size,
            initialized_size,
        })
    }
}

// ============================================================================
// Standard Information Attribute
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct StandardInformation {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
    pub file_attributes: u32,
}

impl StandardInformation {
    /// Parse from resident attribute content
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 48 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        Some(Self {
            creation_time: cursor.read_u64::<LittleEndian>().ok()?,
            modification_time: cursor.read_u64::<LittleEndian>().ok()?,
            mft_modification_time: cursor.read_u64::<LittleEndian>().ok()?,
            access_time: cursor.read_u64::<LittleEndian>().ok()?,
            file_attributes: cursor.read_u32::<LittleEndian>().ok()?,
        })
    }
}

// ============================================================================
// File Name Attribute
// ============================================================================

#[derive(Debug, Clone)]
pub struct FileNameAttribute {
    /// Full parent file reference (record number + sequence)
    pub parent_reference: u64,
    pub creation_time: u64,
    pub modification_time: u64,
    pub access_time: u64,
    pub allocated_size: u64,
    pub data_size: u64,
    pub file_attributes: u32,
    pub namespace: FilenameNamespace,
    pub name: String,
}

impl FileNameAttribute {
    /// Parse from resident attribute content
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 66 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        let parent_reference = cursor.read_u64::<LittleEndian>().ok()?;
        let creation_time = cursor.read_u64::<LittleEndian>().ok()?;
        let modification_time = cursor.read_u64::<LittleEndian>().ok()?;
        let _mft_modification_time = cursor.read_u64::<LittleEndian>().ok()?;
        let access_time = cursor.read_u64::<LittleEndian>().ok()?;
        let allocated_size = cursor.read_u64::<LittleEndian>().ok()?;
        let data_size = cursor.read_u64::<LittleEndian>().ok()?;
        let file_attributes = cursor.read_u32::<LittleEndian>().ok()?;
        let _reparse_value = cursor.read_u32::<LittleEndian>().ok()?;
        let name_length = cursor.read_u8().ok()?;
        let namespace_byte = cursor.read_u8().ok()?;
        let namespace = FilenameNamespace::from_u8(namespace_byte)?;

        // Filename is UTF-16LE right after the fixed part
        let name_bytes = name_length as usize * 2;
        if data.len() < 66 + name_bytes {
            return None;
        }

        let name = utf16le_to_string(&data[66..66 + name_bytes]);

        Some(Self {
            parent_reference,
            creation_time,
            modification_time,
            access_time,
            allocated_size,
            data_size,
            file_attributes,
            namespace,
            name,
        })
    }

    /// Parent record number (lower 48 bits)
    pub fn parent_record_number(&self) -> u64 {
        self.parent_reference & FILE_REF_RECORD_MASK
    }
}

/// Decode a UTF-16LE byte slice, lossily
pub fn utf16le_to_string(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

// ============================================================================
// Data Run (for non-resident attributes)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataRun {
    pub cluster_count: u64,
    pub lcn: i64, // Absolute LCN after applying the signed delta chain
    pub is_sparse: bool,
}

impl DataRun {
    /// Decode data runs from raw bytes.
    /// Returns the list of runs and the total cluster count.
    pub fn decode_runs(data: &[u8]) -> (Vec<DataRun>, u64) {
        let mut runs = Vec::new();
        let mut total_clusters = 0u64;
        let mut pos = 0;
        let mut current_lcn: i64 = 0;

        while pos < data.len() {
            let header = data[pos];
            if header == 0 {
                break; // End marker
            }

            let length_bytes = (header & 0x0F) as usize;
            let offset_bytes = ((header >> 4) & 0x0F) as usize;

            if length_bytes == 0 || length_bytes > 8 || offset_bytes > 8 {
                break;
            }

            pos += 1;

            if pos + length_bytes > data.len() {
                break;
            }
            let mut cluster_count = 0u64;
            for i in 0..length_bytes {
                cluster_count |= (data[pos + i] as u64) << (i * 8);
            }
            pos += length_bytes;

            // LCN delta is signed, variable length, relative to the previous run
            let is_sparse = offset_bytes == 0;
            if !is_sparse {
                if pos + offset_bytes > data.len() {
                    break;
                }

                let mut lcn_delta = 0i64;
                for i in 0..offset_bytes {
                    lcn_delta |= (data[pos + i] as i64) << (i * 8);
                }

                // Sign extend if the high bit of the last byte is set
                if offset_bytes < 8 && (data[pos + offset_bytes - 1] & 0x80) != 0 {
                    for i in offset_bytes..8 {
                        lcn_delta |= 0xFFi64 << (i * 8);
                    }
                }

                current_lcn += lcn_delta;
                pos += offset_bytes;
            }

            total_clusters += cluster_count;

            runs.push(DataRun {
                cluster_count,
                lcn: if is_sparse { 0 } else { current_lcn },
                is_sparse,
            });
        }

        (runs, total_clusters)
    }
}

// ============================================================================
// Attribute List Entry (for records whose attributes span extension records)
// ============================================================================

/// Entry in an $ATTRIBUTE_LIST attribute. Present when a file has too many
/// attributes to fit in a single MFT record; the listed attributes live in
/// extension records.
#[derive(Debug, Clone)]
pub struct AttributeListEntry {
    pub attribute_type: u32,
    pub entry_length: u16,
    pub starting_vcn: u64,
    /// MFT file reference where the attribute is stored
    pub mft_reference: u64,
    pub attribute_id: u16,
}

impl AttributeListEntry {
    /// Parse one entry; returns the entry and the number of bytes consumed
    pub fn from_bytes(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < 26 {
            return None;
        }

        let attribute_type = u32::from_le_bytes(data[0..4].try_into().ok()?);
        let entry_length = u16::from_le_bytes(data[4..6].try_into().ok()?);
        let starting_vcn = u64::from_le_bytes(data[8..16].try_into().ok()?);
        let mft_reference = u64::from_le_bytes(data[16..24].try_into().ok()?);
        let attribute_id = u16::from_le_bytes(data[24..26].try_into().ok()?);

        if entry_length < 26 || entry_length as usize > data.len() {
            return None;
        }

        Some((
            Self {
                attribute_type,
                entry_length,
                starting_vcn,
                mft_reference,
                attribute_id,
            },
            entry_length as usize,
        ))
    }

    /// Referenced MFT record number (lower 48 bits)
    pub fn record_number(&self) -> u64 {
        self.mft_reference & FILE_REF_RECORD_MASK
    }
}

/// Parse all entries from an $ATTRIBUTE_LIST value
pub fn parse_attribute_list(data: &[u8]) -> Vec<AttributeListEntry> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset + 26 <= data.len() {
        match AttributeListEntry::from_bytes(&data[offset..]) {
            Some((entry, consumed)) => {
                if consumed == 0 {
                    break;
                }
                entries.push(entry);
                offset += consumed;
            }
            None => break,
        }
    }

    entries
}

// ============================================================================
// USN Journal Structures
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct UsnJournalData {
    pub usn_journal_id: u64,
    pub first_usn: u64,
    pub next_usn: u64,
    pub lowest_valid_usn: u64,
    pub max_usn: u64,
    pub maximum_size: u64,
    pub allocation_delta: u64,
}

impl UsnJournalData {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 0x38 {
            return None;
        }

        let mut cursor = Cursor::new(data);

        Some(Self {
            usn_journal_id: cursor.read_u64::<LittleEndian>().ok()?,
            first_usn: cursor.read_u64::<LittleEndian>().ok()?,
            next_usn: cursor.read_u64::<LittleEndian>().ok()?,
            lowest_valid_usn: cursor.read_u64::<LittleEndian>().ok()?,
            max_usn: cursor.read_u64::<LittleEndian>().ok()?,
            maximum_size: cursor.read_u64::<LittleEndian>().ok()?,
            allocation_delta: cursor.read_u64::<LittleEndian>().ok()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UsnRecord {
    pub record_length: u32,
    pub major_version: u16,
    pub file_reference_number: u64,
    pub parent_file_reference_number: u64,
    pub usn: u64,
    pub timestamp: u64,
    pub reason: u32,
    pub file_attributes: u32,
    pub file_name: String,
}

impl UsnRecord {
    /// Parse a USN record (V2 or V3).
    /// V2 header is 60 bytes with 64-bit file references; V3 is 76 bytes with
    /// 128-bit references (we keep the low 64 bits, which carry the FRN).
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }

        let record_length = u32::from_le_bytes(data[0..4].try_into().ok()?);
        let major_version = u16::from_le_bytes(data[4..6].try_into().ok()?);

        let min_size = if major_version >= 3 { 76 } else { 60 };
        if data.len() < min_size {
            return None;
        }

        let (file_ref, parent_ref, usn, timestamp, reason, file_attributes, name_len, name_off) =
            if major_version >= 3 {
                (
                    u64::from_le_bytes(data[8..16].try_into().ok()?),
                    u64::from_le_bytes(data[24..32].try_into().ok()?),
                    u64::from_le_bytes(data[40..48].try_into().ok()?),
                    u64::from_le_bytes(data[48..56].try_into().ok()?),
                    u32::from_le_bytes(data[56..60].try_into().ok()?),
                    u32::from_le_bytes(data[68..72].try_into().ok()?),
                    u16::from_le_bytes(data[72..74].try_into().ok()?),
                    u16::from_le_bytes(data[74..76].try_into().ok()?),
                )
            } else {
                (
                    u64::from_le_bytes(data[8..16].try_into().ok()?),
                    u64::from_le_bytes(data[16..24].try_into().ok()?),
                    u64::from_le_bytes(data[24..32].try_into().ok()?),
                    u64::from_le_bytes(data[32..40].try_into().ok()?),
                    u32::from_le_bytes(data[40..44].try_into().ok()?),
                    u32::from_le_bytes(data[52..56].try_into().ok()?),
                    u16::from_le_bytes(data[56..58].try_into().ok()?),
                    u16::from_le_bytes(data[58..60].try_into().ok()?),
                )
            };

        let name_start = name_off as usize;
        let name_end = name_start.checked_add(name_len as usize)?;
        if name_end > data.len() || name_end > record_length as usize {
            return None;
        }

        let file_name = utf16le_to_string(&data[name_start..name_end]);

        Some(Self {
            record_length,
            major_version,
            file_reference_number: file_ref,
            parent_file_reference_number: parent_ref,
            usn,
            timestamp,
            reason,
            file_attributes,
            file_name,
        })
    }

    pub fn file_record_number(&self) -> u64 {
        self.file_reference_number & FILE_REF_RECORD_MASK
    }

    pub fn parent_record_number(&self) -> u64 {
        self.parent_file_reference_number & FILE_REF_RECORD_MASK
    }
}

// USN Reason flags
pub mod usn_reason {
    pub const DATA_OVERWRITE: u32 = 0x00000001;
    pub const DATA_EXTEND: u32 = 0x00000002;
    pub const DATA_TRUNCATION: u32 = 0x00000004;
    pub const FILE_CREATE: u32 = 0x00000100;
    pub const FILE_DELETE: u32 = 0x00000200;
    pub const EA_CHANGE: u32 = 0x00000400;
    pub const SECURITY_CHANGE: u32 = 0x00000800;
    pub const RENAME_OLD_NAME: u32 = 0x00001000;
    pub const RENAME_NEW_NAME: u32 = 0x00002000;
    pub const INDEXABLE_CHANGE: u32 = 0x00004000;
    pub const BASIC_INFO_CHANGE: u32 = 0x00008000;
    pub const HARD_LINK_CHANGE: u32 = 0x00010000;
    pub const COMPRESSION_CHANGE: u32 = 0x00020000;
    pub const ENCRYPTION_CHANGE: u32 = 0x00040000;
    pub const OBJECT_ID_CHANGE: u32 = 0x00080000;
    pub const REPARSE_POINT_CHANGE: u32 = 0x00100000;
    pub const STREAM_CHANGE: u32 = 0x00200000;
    pub const CLOSE: u32 = 0x80000000;
}

// ============================================================================
// FILETIME conversion utilities
// ============================================================================

/// 100-nanosecond intervals between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_EPOCH: u64 = 116444736000000000;

const FILETIME_PER_SECOND: u64 = 10_000_000;

/// 100-nanosecond intervals per day
pub const FILETIME_PER_DAY: u64 = 864_000_000_000;

/// Convert a Windows FILETIME to a Unix timestamp (seconds)
pub fn filetime_to_unix(filetime: u64) -> i64 {
    if filetime < FILETIME_UNIX_EPOCH {
        return 0;
    }

    ((filetime - FILETIME_UNIX_EPOCH) / FILETIME_PER_SECOND) as i64
}

/// Convert a Unix timestamp (seconds) to a Windows FILETIME
pub fn unix_to_filetime(unix: i64) -> u64 {
    if unix <= 0 {
        return FILETIME_UNIX_EPOCH;
    }
    FILETIME_UNIX_EPOCH + unix as u64 * FILETIME_PER_SECOND
}

/// Convert a Windows FILETIME to a chrono DateTime
pub fn filetime_to_datetime(filetime: u64) -> chrono::DateTime<chrono::Utc> {
    use chrono::{TimeZone, Utc};
    let unix_ts = filetime_to_unix(filetime);
    Utc.timestamp_opt(unix_ts, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap())
}

// ============================================================================
// File Attributes
// ============================================================================

pub mod file_attributes {
    pub const READONLY: u32 = 0x00000001;
    pub const HIDDEN: u32 = 0x00000002;
    pub const SYSTEM: u32 = 0x00000004;
    pub const DIRECTORY: u32 = 0x00000010;
    pub const ARCHIVE: u32 = 0x00000020;
    pub const NORMAL: u32 = 0x00000080;
    pub const TEMPORARY: u32 = 0x00000100;
    pub const SPARSE_FILE: u32 = 0x00000200;
    pub const REPARSE_POINT: u32 = 0x00000400;
    pub const COMPRESSED: u32 = 0x00000800;
    pub const OFFLINE: u32 = 0x00001000;
    pub const NOT_CONTENT_INDEXED: u32 = 0x00002000;
    pub const ENCRYPTED: u32 = 0x00004000;
}
