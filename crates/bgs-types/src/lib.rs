#![forbid(unsafe_code)]
//! Shared constants and byte-level helpers.
//!
//! Everything here is pure: tree identifiers, item-type discriminants,
//! on-disk offsets, and bounds-checked readers that turn short buffers into
//! [`ParseError`] instead of panics.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const BTRFS_SUPER_INFO_OFFSET: usize = 64 * 1024;
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;
pub const BTRFS_MAGIC: u64 = 0x4D5F_5366_5248_425F;

// ── Tree identifiers ────────────────────────────────────────────────────────

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
/// Tree holding extent back-references and block-group items.
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

// ── Item type discriminants ─────────────────────────────────────────────────

pub const BTRFS_ROOT_ITEM_KEY: u8 = 132;
pub const BTRFS_EXTENT_ITEM_KEY: u8 = 168;
pub const BTRFS_METADATA_ITEM_KEY: u8 = 169;
pub const BTRFS_TREE_BLOCK_REF_KEY: u8 = 176;
pub const BTRFS_EXTENT_DATA_REF_KEY: u8 = 178;
pub const BTRFS_SHARED_BLOCK_REF_KEY: u8 = 182;
pub const BTRFS_SHARED_DATA_REF_KEY: u8 = 184;
pub const BTRFS_BLOCK_GROUP_ITEM_KEY: u8 = 192;
pub const BTRFS_CHUNK_ITEM_KEY: u8 = 228;

/// Default result buffer handed to a single tree search.
pub const SZ_4K: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId(pub u64);

impl TreeId {
    pub const ROOT: Self = Self(BTRFS_ROOT_TREE_OBJECTID);
    pub const EXTENT: Self = Self(BTRFS_EXTENT_TREE_OBJECTID);
    pub const CHUNK: Self = Self(BTRFS_CHUNK_TREE_OBJECTID);

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_le_bytes(read_fixed::<2>(data, offset)?))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

/// Host-order read, for kernel ioctl buffers rather than on-disk structures.
#[inline]
pub fn read_ne_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_ne_bytes(read_fixed::<4>(data, offset)?))
}

/// Host-order read, for kernel ioctl buffers rather than on-disk structures.
#[inline]
pub fn read_ne_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_ne_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_reject_short_buffers() {
        let data = [1_u8, 2, 3];
        assert_eq!(read_le_u16(&data, 1), Ok(0x0302));
        assert_eq!(
            read_le_u32(&data, 0),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 0,
                actual: 3,
            })
        );
        assert_eq!(
            read_le_u64(&data, 5),
            Err(ParseError::InsufficientData {
                needed: 8,
                offset: 5,
                actual: 0,
            })
        );
    }

    #[test]
    fn ensure_slice_detects_offset_overflow() {
        let err = ensure_slice(&[0_u8; 4], usize::MAX, 2).unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidField {
                field: "offset",
                reason: "overflow",
            }
        );
    }

    #[test]
    fn native_readers_match_host_order() {
        let value = 0x0102_0304_0506_0708_u64;
        let bytes = value.to_ne_bytes();
        assert_eq!(read_ne_u64(&bytes, 0), Ok(value));
        let small = 0xAABB_CCDD_u32.to_ne_bytes();
        assert_eq!(read_ne_u32(&small, 0), Ok(0xAABB_CCDD));
    }

    #[test]
    fn trim_nul_padded_stops_at_first_nul() {
        assert_eq!(trim_nul_padded(b"scratch\0\0junk"), "scratch");
        assert_eq!(trim_nul_padded(b"  label  "), "label");
        assert_eq!(trim_nul_padded(b""), "");
    }

    #[test]
    fn tree_id_constants() {
        assert_eq!(TreeId::EXTENT.get(), 2);
        assert_eq!(TreeId::ROOT.to_string(), "1");
        assert!(TreeId::ROOT < TreeId::CHUNK);
    }
}
