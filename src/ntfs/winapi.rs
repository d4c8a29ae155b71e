//! Windows API bindings for live NTFS volume access
//!
//! Safe wrappers around Win32 volume handles and the FSCTL surface, plus the
//! `LiveVolume`/`LiveJournal` backends used on a running system. Raw volume
//! reads require elevation: ERROR_ACCESS_DENIED maps to `PermissionDenied`
//! and is fatal for that volume — there is no silent fallback to directory
//! enumeration here.

use crate::error::{NexScanError, Result};
use crate::journal::JournalSource;
use crate::ntfs::structs::{usn_reason, UsnJournalData, VolumeGeometry};
use crate::volume::VolumeRead;
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use std::sync::Mutex;

// ============================================================================
// IOCTL control codes (winioctl.h)
// ============================================================================

pub const FSCTL_GET_NTFS_VOLUME_DATA: u32 = 0x00090064;
pub const FSCTL_READ_USN_JOURNAL: u32 = 0x000900BB;
pub const FSCTL_QUERY_USN_JOURNAL: u32 = 0x000900F4;

pub const GENERIC_READ: u32 = 0x80000000;
pub const FILE_SHARE_READ: u32 = 0x00000001;
pub const FILE_SHARE_WRITE: u32 = 0x00000002;
pub const FILE_FLAG_NO_BUFFERING: u32 = 0x20000000;

pub const INVALID_HANDLE_VALUE: isize = -1;

const ERROR_ACCESS_DENIED: i32 = 5;
const ERROR_INVALID_HANDLE: i32 = 6;
const ERROR_NOT_READY: i32 = 21;
const ERROR_HANDLE_EOF: i32 = 38;
const ERROR_JOURNAL_NOT_ACTIVE: i32 = 1179;
const ERROR_JOURNAL_DELETE_IN_PROGRESS: i32 = 1178;
const ERROR_JOURNAL_ENTRY_DELETED: i32 = 1181;

// ============================================================================
// Safe handle wrapper
// ============================================================================

/// RAII wrapper for a Windows HANDLE
pub struct SafeHandle {
    handle: isize,
}

impl SafeHandle {
    pub fn new(handle: isize) -> Option<Self> {
        if handle == INVALID_HANDLE_VALUE || handle == 0 {
            None
        } else {
            Some(Self { handle })
        }
    }

    pub fn as_raw(&self) -> isize {
        self.handle
    }
}

impl Drop for SafeHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = windows::Win32::Foundation::CloseHandle(windows::Win32::Foundation::HANDLE(
                self.handle as *mut std::ffi::c_void,
            ));
        }
    }
}

// SAFETY: the handle is only used through synchronized wrappers
unsafe impl Send for SafeHandle {}

fn io_error_for(path: &str, error: std::io::Error) -> NexScanError {
    match error.raw_os_error() {
        Some(ERROR_ACCESS_DENIED) => NexScanError::PermissionDenied(path.to_string()),
        Some(ERROR_INVALID_HANDLE) | Some(ERROR_NOT_READY) => {
            NexScanError::VolumeUnavailable(path.to_string())
        }
        _ => NexScanError::VolumeOpen(path.to_string(), error),
    }
}

/// Open a volume (`\\.\C:`) for raw read access
pub fn open_volume(drive_letter: char) -> Result<SafeHandle> {
    let path = format!("\\\\.\\{}:", drive_letter.to_ascii_uppercase());
    open_volume_path(&path)
}

pub fn open_volume_path(path: &str) -> Result<SafeHandle> {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_MODE,
    };

    let wide_path: Vec<u16> = OsStr::new(path)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    let handle = unsafe {
        CreateFileW(
            PCWSTR::from_raw(wide_path.as_ptr()),
            GENERIC_READ,
            FILE_SHARE_MODE(FILE_SHARE_READ | FILE_SHARE_WRITE),
            None,
            windows::Win32::Storage::FileSystem::OPEN_EXISTING,
            FILE_FLAGS_AND_ATTRIBUTES(FILE_FLAG_NO_BUFFERING),
            HANDLE::default(),
        )
    };

    match handle {
        Ok(h) => SafeHandle::new(h.0 as isize)
            .ok_or_else(|| io_error_for(path, std::io::Error::last_os_error())),
        Err(e) => Err(io_error_for(
            path,
            std::io::Error::from_raw_os_error(e.code().0 as i32),
        )),
    }
}

// ============================================================================
// IOCTL plumbing
// ============================================================================

fn device_io_control(
    handle: &SafeHandle,
    control_code: u32,
    in_buffer: Option<&[u8]>,
    out_buffer: &mut [u8],
) -> std::result::Result<u32, std::io::Error> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::IO::DeviceIoControl;

    let mut bytes_returned: u32 = 0;

    let (in_ptr, in_size) = match in_buffer {
        Some(buf) => (buf.as_ptr() as *const std::ffi::c_void, buf.len() as u32),
        None => (ptr::null(), 0),
    };

    let result = unsafe {
        DeviceIoControl(
            HANDLE(handle.as_raw() as *mut std::ffi::c_void),
            control_code,
            Some(in_ptr),
            in_size,
            Some(out_buffer.as_mut_ptr() as *mut std::ffi::c_void),
            out_buffer.len() as u32,
            Some(&mut bytes_returned),
            None,
        )
    };

    if result.is_ok() {
        Ok(bytes_returned)
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Volume geometry via FSCTL_GET_NTFS_VOLUME_DATA
pub fn get_volume_geometry(handle: &SafeHandle, path: &str) -> Result<VolumeGeometry> {
    let mut buffer = [0u8; 0x60];
    device_io_control(handle, FSCTL_GET_NTFS_VOLUME_DATA, None, &mut buffer)
        .map_err(|e| io_error_for(path, e))?;

    VolumeGeometry::from_ntfs_volume_data(&buffer)
        .ok_or_else(|| NexScanError::NotNtfs(path.to_string()))
}

fn read_at(handle: &SafeHandle, offset: u64, buffer: &mut [u8]) -> std::result::Result<usize, std::io::Error> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{ReadFile, SetFilePointerEx, FILE_BEGIN};

    let raw = HANDLE(handle.as_raw() as *mut std::ffi::c_void);

    let mut new_pos: i64 = 0;
    let seek = unsafe { SetFilePointerEx(raw, offset as i64, Some(&mut new_pos), FILE_BEGIN) };
    if seek.is_err() {
        return Err(std::io::Error::last_os_error());
    }

    let mut bytes_read: u32 = 0;
    let read = unsafe { ReadFile(raw, Some(buffer), Some(&mut bytes_read), None) };
    if read.is_ok() {
        Ok(bytes_read as usize)
    } else {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() == Some(ERROR_HANDLE_EOF) {
            Ok(0)
        } else {
            Err(e)
        }
    }
}

// ============================================================================
// Live volume backend
// ============================================================================

/// A mounted NTFS volume opened for raw reads. Seek+read share the handle,
/// so positioned reads are serialized behind a mutex.
pub struct LiveVolume {
    handle: Mutex<SafeHandle>,
    geometry: VolumeGeometry,
    path: String,
}

impl LiveVolume {
    pub fn open(drive_letter: char) -> Result<Self> {
        let path = format!("\\\\.\\{}:", drive_letter.to_ascii_uppercase());
        let handle = open_volume_path(&path)?;
        let geometry = get_volume_geometry(&handle, &path)?;

        Ok(Self {
            handle: Mutex::new(handle),
            geometry,
            path,
        })
    }
}

impl VolumeRead for LiveVolume {
    fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        let handle = self
            .handle
            .lock()
            .map_err(|_| NexScanError::VolumeUnavailable(self.path.clone()))?;
        read_at(&handle, offset, buffer).map_err(|e| io_error_for(&self.path, e))
    }

    fn volume_id(&self) -> String {
        self.geometry.volume_id()
    }
}

// ============================================================================
// Live journal backend
// ============================================================================

#[repr(C, packed)]
struct ReadUsnJournalDataV0 {
    start_usn: i64,
    reason_mask: u32,
    return_only_on_close: u32,
    timeout: u64,
    bytes_to_wait_for: u64,
    usn_journal_id: u64,
}

/// Reason mask covering everything the index reacts to
const REASON_MASK: u32 = usn_reason::FILE_CREATE
    | usn_reason::FILE_DELETE
    | usn_reason::RENAME_OLD_NAME
    | usn_reason::RENAME_NEW_NAME
    | usn_reason::DATA_OVERWRITE
    | usn_reason::DATA_EXTEND
    | usn_reason::DATA_TRUNCATION
    | usn_reason::BASIC_INFO_CHANGE
    | usn_reason::EA_CHANGE
    | usn_reason::SECURITY_CHANGE
    | usn_reason::COMPRESSION_CHANGE
    | usn_reason::ENCRYPTION_CHANGE
    | usn_reason::REPARSE_POINT_CHANGE
    | usn_reason::HARD_LINK_CHANGE;

/// USN journal of a mounted volume, read non-blocking: an empty batch comes
/// back immediately and the monitor's poll interval provides the wait.
pub struct LiveJournal {
    handle: SafeHandle,
    path: String,
    journal_id: u64,
}

impl LiveJournal {
    pub fn open(drive_letter: char) -> Result<Self> {
        let path = format!("\\\\.\\{}:", drive_letter.to_ascii_uppercase());
        let handle = open_volume_path(&path)?;

        Ok(Self {
            handle,
            path,
            journal_id: 0,
        })
    }

    fn map_journal_error(&self, error: std::io::Error) -> NexScanError {
        match error.raw_os_error() {
            Some(ERROR_JOURNAL_ENTRY_DELETED) => NexScanError::JournalGap {
                // The caller learns the true oldest usn from a re-attach
                cursor: 0,
                oldest: 0,
            },
            Some(ERROR_JOURNAL_NOT_ACTIVE) | Some(ERROR_JOURNAL_DELETE_IN_PROGRESS) => {
                NexScanError::JournalInactive(self.path.clone())
            }
            Some(ERROR_ACCESS_DENIED) => NexScanError::PermissionDenied(self.path.clone()),
            Some(ERROR_INVALID_HANDLE) | Some(ERROR_NOT_READY) => {
                NexScanError::VolumeUnavailable(self.path.clone())
            }
            _ => NexScanError::Journal(format!("{}: {}", self.path, error)),
        }
    }
}

impl JournalSource for LiveJournal {
    fn attach(&mut self) -> Result<UsnJournalData> {
        let mut buffer = [0u8; 0x38];
        device_io_control(&self.handle, FSCTL_QUERY_USN_JOURNAL, None, &mut buffer)
            .map_err(|e| self.map_journal_error(e))?;

        let data = UsnJournalData::from_bytes(&buffer)
            .ok_or_else(|| NexScanError::Journal("short FSCTL_QUERY_USN_JOURNAL reply".into()))?;

        self.journal_id = data.usn_journal_id;
        Ok(data)
    }

    fn read_batch(&mut self, start_usn: u64, buffer: &mut [u8]) -> Result<(u64, usize)> {
        let input = ReadUsnJournalDataV0 {
            start_usn: start_usn as i64,
            reason_mask: REASON_MASK,
            return_only_on_close: 0,
            timeout: 0,
            bytes_to_wait_for: 0,
            usn_journal_id: self.journal_id,
        };

        let input_bytes = unsafe {
            std::slice::from_raw_parts(
                &input as *const ReadUsnJournalDataV0 as *const u8,
                std::mem::size_of::<ReadUsnJournalDataV0>(),
            )
        };

        let bytes_returned =
            device_io_control(&self.handle, FSCTL_READ_USN_JOURNAL, Some(input_bytes), buffer)
                .map_err(|e| match self.map_journal_error(e) {
                    NexScanError::JournalGap { .. } => NexScanError::JournalGap {
                        cursor: start_usn,
                        oldest: 0,
                    },
                    other => other,
                })?;

        if bytes_returned < 8 {
            return Ok((start_usn, 0));
        }

        let next_usn = u64::from_le_bytes(buffer[0..8].try_into().unwrap());
        Ok((next_usn, bytes_returned as usize))
    }
}
