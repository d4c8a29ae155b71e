//! Volume access abstraction
//!
//! The bulk reader only needs positioned reads plus the volume geometry, so
//! that is the whole trait. Backends: live NTFS volumes via Win32 handles
//! (`ntfs::winapi`, Windows only), raw volume image files (memory-mapped),
//! and in-memory buffers built by the simulation harness.

use crate::error::{NexScanError, Result};
use crate::ntfs::structs::{BootSector, VolumeGeometry};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Read access to an NTFS volume's raw bytes
pub trait VolumeRead: Send {
    /// Volume geometry as probed at open time
    fn geometry(&self) -> &VolumeGeometry;

    /// Read bytes at a volume-relative offset; returns the number of bytes
    /// actually read (short reads at the end of the volume are allowed)
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<usize>;

    /// Stable identifier for this volume (serial number or source path)
    fn volume_id(&self) -> String;
}

/// Parse and validate the boot sector at the start of a volume
pub fn probe_boot_sector(sector: &[u8], source: &str) -> Result<VolumeGeometry> {
    let boot = BootSector::from_bytes(sector).ok_or_else(|| NexScanError::NotNtfs(source.to_string()))?;

    if !boot.is_valid_ntfs() {
        return Err(NexScanError::NotNtfs(source.to_string()));
    }

    Ok(boot.to_geometry())
}

// ============================================================================
// ImageVolume — memory-mapped raw volume image
// ============================================================================

/// A raw NTFS volume image on disk (e.g. a `dd` capture), memory-mapped for
/// zero-copy sequential reads. Works on every platform; used for offline
/// analysis and throughout the test suite.
pub struct ImageVolume {
    map: Mmap,
    geometry: VolumeGeometry,
    source: String,
}

impl ImageVolume {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = path.display().to_string();

        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => NexScanError::PermissionDenied(source.clone()),
            _ => NexScanError::VolumeOpen(source.clone(), e),
        })?;

        // SAFETY: the map is read-only and we never hand out the raw pointer.
        // Concurrent truncation of the backing file is the usual mmap caveat;
        // volume images are treated as immutable inputs.
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| NexScanError::VolumeOpen(source.clone(), e))?;

        if map.len() < 512 {
            return Err(NexScanError::NotNtfs(source));
        }

        let geometry = probe_boot_sector(&map[..512], &source)?;

        Ok(Self { map, geometry, source })
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl VolumeRead for ImageVolume {
    fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        copy_from_slice_at(&self.map, offset, buffer)
    }

    fn volume_id(&self) -> String {
        if self.geometry.serial_number != 0 {
            self.geometry.volume_id()
        } else {
            self.source.clone()
        }
    }
}

// ============================================================================
// MemVolume — in-memory volume image
// ============================================================================

/// An in-memory volume image, produced by the simulation harness or loaded
/// from a small capture. Same read semantics as `ImageVolume`.
#[derive(Debug)]
pub struct MemVolume {
    data: Vec<u8>,
    geometry: VolumeGeometry,
    source: String,
}

impl MemVolume {
    pub fn new(data: Vec<u8>, source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        if data.len() < 512 {
            return Err(NexScanError::NotNtfs(source));
        }
        let geometry = probe_boot_sector(&data[..512], &source)?;
        Ok(Self { data, geometry, source })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl VolumeRead for MemVolume {
    fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        copy_from_slice_at(&self.data, offset, buffer)
    }

    fn volume_id(&self) -> String {
        if self.geometry.serial_number != 0 {
            self.geometry.volume_id()
        } else {
            self.source.clone()
        }
    }
}

fn copy_from_slice_at(data: &[u8], offset: u64, buffer: &mut [u8]) -> Result<usize> {
    let len = data.len() as u64;
    if offset >= len {
        return Ok(0);
    }

    let start = offset as usize;
    let n = buffer.len().min((len - offset) as usize);
    buffer[..n].copy_from_slice(&data[start..start + n]);
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ntfs_boot_sector() -> Vec<u8> {
        let mut raw = vec![0u8; 1024];
        raw[0x03..0x0B].copy_from_slice(b"NTFS    ");
        raw[0x0B] = 0x00;
        raw[0x0C] = 0x02; // 512 bytes/sector
        raw[0x0D] = 8; // 4096 bytes/cluster
        raw[0x28..0x30].copy_from_slice(&1024u64.to_le_bytes());
        raw[0x30..0x38].copy_from_slice(&4u64.to_le_bytes());
        raw[0x40] = (-10i8) as u8;
        raw[0x48..0x50].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes());
        raw
    }

    #[test]
    fn mem_volume_probes_geometry() {
        let vol = MemVolume::new(ntfs_boot_sector(), "test").unwrap();
        let g = vol.geometry();
        assert_eq!(g.bytes_per_cluster, 4096);
        assert_eq!(g.bytes_per_record, 1024);
        assert_eq!(g.mft_byte_offset(), 4 * 4096);
        assert_eq!(vol.volume_id(), format!("{:016X}", 0xDEAD_BEEFu64));
    }

    #[test]
    fn mem_volume_rejects_garbage() {
        let err = MemVolume::new(vec![0u8; 4096], "garbage").unwrap_err();
        assert!(matches!(err, NexScanError::NotNtfs(_)));
    }

    #[test]
    fn reads_are_bounded() {
        let vol = MemVolume::new(ntfs_boot_sector(), "test").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(vol.read_at(1000, &mut buf).unwrap(), 24);
        assert_eq!(vol.read_at(5000, &mut buf).unwrap(), 0);
    }
}
