#![forbid(unsafe_code)]
//! Argument and result layouts of `BTRFS_IOC_TREE_SEARCH_V2`.
//!
//! These are kernel ABI structures, so every field is in host byte order
//! (unlike the little-endian on-disk format in [`crate::btrfs`]).
//!
//! ```text
//! btrfs_ioctl_search_args_v2
//! ├── btrfs_ioctl_search_key   104 bytes
//! ├── buf_size                 u64
//! └── buf[]                    repeated: btrfs_ioctl_search_header (32) + payload
//! ```

use crate::btrfs::BtrfsKey;
use bgs_types::{ParseError, ensure_slice, read_ne_u32, read_ne_u64};

pub const SEARCH_KEY_SIZE: usize = 104;
pub const SEARCH_HEADER_SIZE: usize = 32;
/// Search key plus the `buf_size` field, i.e. the offset of `buf[]`.
pub const SEARCH_ARGS_V2_FIXED_SIZE: usize = SEARCH_KEY_SIZE + 8;

const NR_ITEMS_OFFSET: usize = 64;

/// `btrfs_ioctl_search_key`: the key range, transid range and item limit of
/// one search.
///
/// The kernel compares whole keys against `(min_objectid, min_type,
/// min_offset)` and `(max_objectid, max_type, max_offset)`, so the bounds
/// behave as composite keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchKeyArgs {
    pub tree_id: u64,
    pub min_key: BtrfsKey,
    pub max_key: BtrfsKey,
    pub min_transid: u64,
    pub max_transid: u64,
    /// In: maximum number of items to return. Out: items actually returned.
    pub nr_items: u32,
}

impl SearchKeyArgs {
    /// Search `[min_key, max_key]` in `tree_id`, any transid, no item limit.
    #[must_use]
    pub fn new(tree_id: u64, min_key: BtrfsKey, max_key: BtrfsKey) -> Self {
        Self {
            tree_id,
            min_key,
            max_key,
            min_transid: 0,
            max_transid: u64::MAX,
            nr_items: u32::MAX,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; SEARCH_KEY_SIZE] {
        let mut out = [0_u8; SEARCH_KEY_SIZE];
        out[0..8].copy_from_slice(&self.tree_id.to_ne_bytes());
        out[8..16].copy_from_slice(&self.min_key.objectid.to_ne_bytes());
        out[16..24].copy_from_slice(&self.max_key.objectid.to_ne_bytes());
        out[24..32].copy_from_slice(&self.min_key.offset.to_ne_bytes());
        out[32..40].copy_from_slice(&self.max_key.offset.to_ne_bytes());
        out[40..48].copy_from_slice(&self.min_transid.to_ne_bytes());
        out[48..56].copy_from_slice(&self.max_transid.to_ne_bytes());
        out[56..60].copy_from_slice(&u32::from(self.min_key.item_type).to_ne_bytes());
        out[60..64].copy_from_slice(&u32::from(self.max_key.item_type).to_ne_bytes());
        out[NR_ITEMS_OFFSET..NR_ITEMS_OFFSET + 4].copy_from_slice(&self.nr_items.to_ne_bytes());
        out
    }

    /// Read back the `nr_items` the kernel wrote into a returned search key.
    pub fn returned_items(encoded: &[u8]) -> Result<u32, ParseError> {
        read_ne_u32(encoded, NR_ITEMS_OFFSET)
    }
}

/// `btrfs_ioctl_search_header`: one result record's key, transid and
/// payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSearchHeader {
    pub transid: u64,
    pub key: BtrfsKey,
    pub len: u32,
}

impl RawSearchHeader {
    pub fn parse(buf: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw_type = read_ne_u32(buf, offset + 24)?;
        let item_type = u8::try_from(raw_type)
            .map_err(|_| ParseError::IntegerConversion { field: "item_type" })?;
        Ok(Self {
            transid: read_ne_u64(buf, offset)?,
            key: BtrfsKey {
                objectid: read_ne_u64(buf, offset + 8)?,
                item_type,
                offset: read_ne_u64(buf, offset + 16)?,
            },
            len: read_ne_u32(buf, offset + 28)?,
        })
    }
}

/// Split a search result buffer into `nr_items` (header, payload) records.
///
/// Records are packed back to back with no padding.
pub fn parse_search_results(
    buf: &[u8],
    nr_items: u32,
) -> Result<Vec<(RawSearchHeader, Vec<u8>)>, ParseError> {
    let count = usize::try_from(nr_items)
        .map_err(|_| ParseError::IntegerConversion { field: "nr_items" })?;
    // Every record needs at least a header, so a bogus count fails here
    // rather than reserving a huge vector.
    if count > buf.len() / SEARCH_HEADER_SIZE {
        return Err(ParseError::InvalidField {
            field: "nr_items",
            reason: "more records than the buffer can hold",
        });
    }

    let mut records = Vec::with_capacity(count);
    let mut cur = 0_usize;
    for _ in 0..count {
        let header = RawSearchHeader::parse(buf, cur)?;
        cur += SEARCH_HEADER_SIZE;
        let len = usize::try_from(header.len)
            .map_err(|_| ParseError::IntegerConversion { field: "len" })?;
        let payload = ensure_slice(buf, cur, len)?.to_vec();
        cur += len;
        records.push((header, payload));
    }
    Ok(records)
}
