#![forbid(unsafe_code)]
//! Read-only byte-addressed devices.
//!
//! Offline scans read btrfs tree nodes straight from an image file or block
//! device with `pread` semantics. Nothing here ever writes.

use bgs_error::{BgsError, Result};
use bgs_types::{BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device for fixed-offset reads.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| BgsError::Format("read range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(BgsError::Format(format!(
            "read out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed device using `std::os::unix::fs::FileExt` positional reads,
/// so no shared seek position is involved.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open `path` read-only.
    ///
    /// Failure to open is a [`BgsError::HandleAcquisition`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| BgsError::HandleAcquisition {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory device, for building images in tests and tools.
#[derive(Debug, Clone, Default)]
pub struct MemoryByteDevice {
    bytes: Vec<u8>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset)
            .map_err(|_| BgsError::Format("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Read the btrfs superblock region (4096 bytes at offset 64 KiB).
pub fn read_btrfs_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; BTRFS_SUPER_INFO_SIZE]> {
    let mut buf = [0_u8; BTRFS_SUPER_INFO_SIZE];
    let offset = u64::try_from(BTRFS_SUPER_INFO_OFFSET)
        .map_err(|_| BgsError::Format("btrfs superblock offset does not fit u64".to_owned()))?;
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}
