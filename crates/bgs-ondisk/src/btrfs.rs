#![forbid(unsafe_code)]

use bgs_types::{
    BTRFS_MAGIC, BTRFS_SUPER_INFO_SIZE, ParseError, read_fixed,
    read_le_u16, read_le_u32, read_le_u64, read_u8, trim_nul_padded,
};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const BTRFS_HEADER_SIZE: usize = 101;
pub const BTRFS_ITEM_SIZE: usize = 25;
/// Size of a btrfs_key_ptr on disk (key:17 + blockptr:u64 + generation:u64).
pub const BTRFS_KEY_PTR_SIZE: usize = 33;
/// Size of a btrfs_disk_key on disk (objectid:u64 + type:u8 + offset:u64).
pub const BTRFS_DISK_KEY_SIZE: usize = 17;
/// Maximum tree depth in btrfs (kernel enforces 8 levels, 0-7).
const BTRFS_MAX_LEVEL: u8 = 7;
const BTRFS_SUPER_LABEL_OFFSET: usize = 0x12B;
const BTRFS_SUPER_LABEL_LEN: usize = 256;
const BTRFS_SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;
const BTRFS_SYS_CHUNK_ARRAY_MAX: usize = 2048;
/// Fixed part of a btrfs_chunk, before the stripe array.
const BTRFS_CHUNK_FIXED_SIZE: usize = 48;
/// Size of one btrfs_stripe on disk (devid:u64 + offset:u64 + dev_uuid:16).
const BTRFS_STRIPE_SIZE: usize = 32;
/// btrfs_root_item field offsets (after the embedded 160-byte inode item).
const ROOT_ITEM_GENERATION_OFFSET: usize = 160;
const ROOT_ITEM_BYTENR_OFFSET: usize = 176;
const ROOT_ITEM_LEVEL_OFFSET: usize = 238;

// ── Keys ────────────────────────────────────────────────────────────────────

/// Composite tree key, ordered by objectid, then type, then offset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BtrfsKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl BtrfsKey {
    pub const MIN: Self = Self::new(0, 0, 0);
    pub const MAX: Self = Self::new(u64::MAX, u8::MAX, u64::MAX);

    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Smallest key strictly greater than `self`, or `None` for [`Self::MAX`].
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        if let Some(offset) = self.offset.checked_add(1) {
            return Some(Self { offset, ..self });
        }
        if let Some(item_type) = self.item_type.checked_add(1) {
            return Some(Self::new(self.objectid, item_type, 0));
        }
        let objectid = self.objectid.checked_add(1)?;
        Some(Self::new(objectid, 0, 0))
    }

    fn parse_at(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            objectid: read_le_u64(data, offset)?,
            item_type: read_u8(data, offset + 8)?,
            offset: read_le_u64(data, offset + 9)?,
        })
    }
}

impl fmt::Display for BtrfsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.objectid, self.item_type, self.offset)
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsSuperblock {
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub magic: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub label: String,
    pub sys_chunk_array_size: u32,
    pub sys_chunk_array: Vec<u8>,
}

impl BtrfsSuperblock {
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < BTRFS_SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != BTRFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: BTRFS_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, 0x90)?;
        let nodesize = read_le_u32(region, 0x94)?;

        if sectorsize == 0 || !sectorsize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be non-zero power of two",
            });
        }
        if nodesize == 0 || !nodesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be non-zero power of two",
            });
        }
        if nodesize > 64 * 1024 {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "exceeds 64K upper bound",
            });
        }

        let sys_chunk_array_size = read_le_u32(region, 0xA0)?;
        let sys_array_len =
            usize::try_from(sys_chunk_array_size).map_err(|_| ParseError::IntegerConversion {
                field: "sys_chunk_array_size",
            })?;
        if sys_array_len > BTRFS_SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }
        let sys_chunk_array = region
            [BTRFS_SYS_CHUNK_ARRAY_OFFSET..BTRFS_SYS_CHUNK_ARRAY_OFFSET + sys_array_len]
            .to_vec();

        Ok(Self {
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            total_bytes: read_le_u64(region, 0x70)?,
            bytes_used: read_le_u64(region, 0x78)?,
            num_devices: read_le_u64(region, 0x88)?,
            sectorsize,
            nodesize,
            root_level: read_u8(region, 0xC6)?,
            chunk_root_level: read_u8(region, 0xC7)?,
            label: trim_nul_padded(&read_fixed::<BTRFS_SUPER_LABEL_LEN>(
                region,
                BTRFS_SUPER_LABEL_OFFSET,
            )?),
            sys_chunk_array_size,
            sys_chunk_array,
        })
    }
}

// ── Chunks ──────────────────────────────────────────────────────────────────

/// A single stripe within a btrfs chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsStripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// A chunk mapping a logical range (`key.offset .. key.offset + length`)
/// onto device stripes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsChunkEntry {
    pub key: BtrfsKey,
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<BtrfsStripe>,
}

/// Parse one `btrfs_chunk` body starting at `cur`, returning the entry and
/// the number of bytes consumed.
fn parse_chunk_body(
    key: BtrfsKey,
    data: &[u8],
    cur: usize,
) -> Result<(BtrfsChunkEntry, usize), ParseError> {
    if cur + BTRFS_CHUNK_FIXED_SIZE > data.len() {
        return Err(ParseError::InsufficientData {
            needed: BTRFS_CHUNK_FIXED_SIZE,
            offset: cur,
            actual: data.len().saturating_sub(cur),
        });
    }

    let length = read_le_u64(data, cur)?;
    let owner = read_le_u64(data, cur + 8)?;
    let stripe_len = read_le_u64(data, cur + 16)?;
    let chunk_type = read_le_u64(data, cur + 24)?;
    let num_stripes = read_le_u16(data, cur + 44)?;
    let sub_stripes = read_le_u16(data, cur + 46)?;

    if num_stripes == 0 {
        return Err(ParseError::InvalidField {
            field: "num_stripes",
            reason: "chunk must have at least one stripe",
        });
    }

    let stripes_count = usize::from(num_stripes);
    let stripes_start = cur + BTRFS_CHUNK_FIXED_SIZE;
    let stripes_bytes = stripes_count * BTRFS_STRIPE_SIZE;
    if stripes_start + stripes_bytes > data.len() {
        return Err(ParseError::InsufficientData {
            needed: stripes_bytes,
            offset: stripes_start,
            actual: data.len().saturating_sub(stripes_start),
        });
    }

    let stripes = (0..stripes_count)
        .map(|idx| {
            let base = stripes_start + idx * BTRFS_STRIPE_SIZE;
            Ok(BtrfsStripe {
                devid: read_le_u64(data, base)?,
                offset: read_le_u64(data, base + 8)?,
                dev_uuid: read_fixed::<16>(data, base + 16)?,
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;

    let entry = BtrfsChunkEntry {
        key,
        length,
        owner,
        stripe_len,
        chunk_type,
        num_stripes,
        sub_stripes,
        stripes,
    };
    Ok((entry, BTRFS_CHUNK_FIXED_SIZE + stripes_bytes))
}

/// Parse all entries from a sys_chunk_array byte slice.
///
/// The array alternates `btrfs_disk_key` and `btrfs_chunk` records.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<BtrfsChunkEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        if cur + BTRFS_DISK_KEY_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_DISK_KEY_SIZE,
                offset: cur,
                actual: data.len() - cur,
            });
        }
        let key = BtrfsKey::parse_at(data, cur)?;
        cur += BTRFS_DISK_KEY_SIZE;

        let (entry, consumed) = parse_chunk_body(key, data, cur)?;
        cur += consumed;
        entries.push(entry);
    }

    Ok(entries)
}

/// Parse a CHUNK_ITEM payload read from a chunk-tree leaf.
pub fn parse_chunk_item(key: BtrfsKey, payload: &[u8]) -> Result<BtrfsChunkEntry, ParseError> {
    parse_chunk_body(key, payload, 0).map(|(entry, _)| entry)
}

/// Result of a logical-to-physical bytenr mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtrfsPhysicalMapping {
    pub devid: u64,
    pub physical: u64,
}

/// Map a logical byte address to a physical (device, offset) pair.
///
/// Uses the first stripe of the covering chunk, which is exact for
/// single-device images (SINGLE and DUP profiles).
///
/// Returns `Ok(None)` if no chunk covers `logical`.
pub fn map_logical_to_physical(
    chunks: &[BtrfsChunkEntry],
    logical: u64,
) -> Result<Option<BtrfsPhysicalMapping>, ParseError> {
    for chunk in chunks {
        let chunk_start = chunk.key.offset;
        let chunk_end = chunk_start
            .checked_add(chunk.length)
            .ok_or(ParseError::InvalidField {
                field: "chunk_length",
                reason: "logical range overflow",
            })?;

        if (chunk_start..chunk_end).contains(&logical) {
            let stripe = chunk.stripes.first().ok_or(ParseError::InvalidField {
                field: "stripes",
                reason: "chunk has no stripes",
            })?;
            let physical = stripe.offset.checked_add(logical - chunk_start).ok_or(
                ParseError::InvalidField {
                    field: "stripe_offset",
                    reason: "physical address overflow",
                },
            )?;
            return Ok(Some(BtrfsPhysicalMapping {
                devid: stripe.devid,
                physical,
            }));
        }
    }
    Ok(None)
}

// ── Tree nodes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsHeader {
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl BtrfsHeader {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < BTRFS_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        Ok(Self {
            fsid: read_fixed::<16>(block, 0x20)?,
            bytenr: read_le_u64(block, 0x30)?,
            generation: read_le_u64(block, 0x50)?,
            owner: read_le_u64(block, 0x58)?,
            nritems: read_le_u32(block, 0x60)?,
            level: read_u8(block, 0x64)?,
        })
    }

    /// Check `bytenr` against where the node was read from, the level
    /// against the depth limit, and `nritems` against block capacity.
    pub fn validate(
        &self,
        block_size: usize,
        expected_bytenr: Option<u64>,
    ) -> Result<(), ParseError> {
        if expected_bytenr.is_some_and(|expected| self.bytenr != expected) {
            return Err(ParseError::InvalidField {
                field: "bytenr",
                reason: "header bytenr does not match expected",
            });
        }

        if self.level > BTRFS_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let item_size = if self.level == 0 {
            BTRFS_ITEM_SIZE
        } else {
            BTRFS_KEY_PTR_SIZE
        };
        let max_items = block_size.saturating_sub(BTRFS_HEADER_SIZE) / item_size;
        let nritems = usize::try_from(self.nritems)
            .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;

        if nritems > max_items {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds block capacity",
            });
        }

        Ok(())
    }
}

/// A leaf item table entry. `data_offset` is relative to the end of the
/// node header, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsItem {
    pub key: BtrfsKey,
    pub data_offset: u32,
    pub data_size: u32,
}

impl BtrfsItem {
    /// Absolute byte range of the payload inside its leaf block.
    pub fn payload_range(&self) -> Result<std::ops::Range<usize>, ParseError> {
        let start = usize::try_from(self.data_offset)
            .ok()
            .and_then(|off| off.checked_add(BTRFS_HEADER_SIZE))
            .ok_or(ParseError::IntegerConversion {
                field: "data_offset",
            })?;
        let end = usize::try_from(self.data_size)
            .ok()
            .and_then(|size| start.checked_add(size))
            .ok_or(ParseError::InvalidField {
                field: "item_offset",
                reason: "overflow",
            })?;
        Ok(start..end)
    }
}

/// An internal (non-leaf) node item: a key paired with a child block pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsKeyPtr {
    pub key: BtrfsKey,
    pub blockptr: u64,
    pub generation: u64,
}

pub fn parse_leaf_items(block: &[u8]) -> Result<(BtrfsHeader, Vec<BtrfsItem>), ParseError> {
    let header = BtrfsHeader::parse_from_block(block)?;
    if header.level != 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
    let items_end = nritems
        .checked_mul(BTRFS_ITEM_SIZE)
        .and_then(|bytes| bytes.checked_add(BTRFS_HEADER_SIZE))
        .ok_or(ParseError::InvalidField {
            field: "items",
            reason: "overflow",
        })?;

    if block.len() < items_end {
        return Err(ParseError::InsufficientData {
            needed: items_end,
            offset: BTRFS_HEADER_SIZE,
            actual: block.len().saturating_sub(BTRFS_HEADER_SIZE),
        });
    }

    let mut items = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
        let item = BtrfsItem {
            key: BtrfsKey::parse_at(block, base)?,
            data_offset: read_le_u32(block, base + 17)?,
            data_size: read_le_u32(block, base + 21)?,
        };

        if item.payload_range()?.end > block.len() {
            return Err(ParseError::InvalidField {
                field: "item_offset",
                reason: "item points outside block",
            });
        }
        items.push(item);
    }

    Ok((header, items))
}

/// Parse a btrfs internal (non-leaf) node, returning the header and key-pointer items.
pub fn parse_internal_items(block: &[u8]) -> Result<(BtrfsHeader, Vec<BtrfsKeyPtr>), ParseError> {
    let header = BtrfsHeader::parse_from_block(block)?;
    if header.level == 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal node (level > 0)",
        });
    }

    header.validate(block.len(), None)?;

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;

    let mut ptrs = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
        let key = BtrfsKey::parse_at(block, base)?;
        let blockptr = read_le_u64(block, base + 17)?;
        let generation = read_le_u64(block, base + 25)?;

        if blockptr == 0 {
            return Err(ParseError::InvalidField {
                field: "blockptr",
                reason: "child block pointer is zero",
            });
        }

        ptrs.push(BtrfsKeyPtr {
            key,
            blockptr,
            generation,
        });
    }

    Ok((header, ptrs))
}

// ── Root items ──────────────────────────────────────────────────────────────

/// The parts of a ROOT_ITEM needed to locate a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsRootItem {
    pub generation: u64,
    pub bytenr: u64,
    pub level: u8,
}

impl BtrfsRootItem {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let item = Self {
            generation: read_le_u64(payload, ROOT_ITEM_GENERATION_OFFSET)?,
            bytenr: read_le_u64(payload, ROOT_ITEM_BYTENR_OFFSET)?,
            level: read_u8(payload, ROOT_ITEM_LEVEL_OFFSET)?,
        };
        if item.bytenr == 0 {
            return Err(ParseError::InvalidField {
                field: "root_bytenr",
                reason: "tree root pointer is zero",
            });
        }
        if item.level > BTRFS_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "root_level",
                reason: "exceeds maximum tree depth",
            });
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgs_types::BTRFS_CHUNK_ITEM_KEY;

    fn base_superblock() -> [u8; BTRFS_SUPER_INFO_SIZE] {
        let mut sb = [0_u8; BTRFS_SUPER_INFO_SIZE];
        sb[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
        sb[0x90..0x94].copy_from_slice(&4096_u32.to_le_bytes());
        sb[0x94..0x98].copy_from_slice(&16384_u32.to_le_bytes());
        sb
    }

    fn write_chunk(buf: &mut [u8], at: usize, length: u64, stripe_offset: u64) -> usize {
        buf[at..at + 8].copy_from_slice(&length.to_le_bytes());
        buf[at + 8..at + 16].copy_from_slice(&2_u64.to_le_bytes());
        buf[at + 16..at + 24].copy_from_slice(&(64 * 1024_u64).to_le_bytes());
        buf[at + 24..at + 32].copy_from_slice(&2_u64.to_le_bytes());
        buf[at + 44..at + 46].copy_from_slice(&1_u16.to_le_bytes());
        let s = at + BTRFS_CHUNK_FIXED_SIZE;
        buf[s..s + 8].copy_from_slice(&1_u64.to_le_bytes());
        buf[s + 8..s + 16].copy_from_slice(&stripe_offset.to_le_bytes());
        BTRFS_CHUNK_FIXED_SIZE + BTRFS_STRIPE_SIZE
    }

    fn one_chunk(logical: u64, length: u64, physical: u64) -> Vec<BtrfsChunkEntry> {
        vec![BtrfsChunkEntry {
            key: BtrfsKey::new(256, BTRFS_CHUNK_ITEM_KEY, logical),
            length,
            owner: 2,
            stripe_len: 0x1_0000,
            chunk_type: 2,
            num_stripes: 1,
            sub_stripes: 0,
            stripes: vec![BtrfsStripe {
                devid: 1,
                offset: physical,
                dev_uuid: [0; 16],
            }],
        }]
    }

    fn make_block(size: usize, nritems: u32, level: u8) -> Vec<u8> {
        let mut block = vec![0_u8; size];
        block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
        block[0x64] = level;
        block
    }

    #[test]
    fn key_order_is_objectid_type_offset() {
        let a = BtrfsKey::new(100, 200, 0);
        let b = BtrfsKey::new(101, 0, 0);
        let c = BtrfsKey::new(101, 0, 5);
        let d = BtrfsKey::new(101, 1, 0);
        assert!(a < b && b < c && c < d);
        assert_eq!(BtrfsKey::MIN, BtrfsKey::default());
    }

    #[test]
    fn key_successor_carries_into_higher_fields() {
        assert_eq!(
            BtrfsKey::new(7, 192, 9).successor(),
            Some(BtrfsKey::new(7, 192, 10))
        );
        assert_eq!(
            BtrfsKey::new(7, 192, u64::MAX).successor(),
            Some(BtrfsKey::new(7, 193, 0))
        );
        assert_eq!(
            BtrfsKey::new(7, u8::MAX, u64::MAX).successor(),
            Some(BtrfsKey::new(8, 0, 0))
        );
        assert_eq!(BtrfsKey::MAX.successor(), None);
    }

    #[test]
    fn key_display() {
        assert_eq!(BtrfsKey::new(800, 192, 0).to_string(), "(800 192 0)");
    }

    #[test]
    fn parse_superblock_smoke() {
        let mut sb = base_superblock();
        sb[0x48..0x50].copy_from_slice(&9_u64.to_le_bytes());
        sb[0x50..0x58].copy_from_slice(&0x40_0000_u64.to_le_bytes());
        sb[0x58..0x60].copy_from_slice(&0x2_0000_u64.to_le_bytes());
        sb[0xC6] = 1;
        sb[BTRFS_SUPER_LABEL_OFFSET..BTRFS_SUPER_LABEL_OFFSET + 4].copy_from_slice(b"data");

        let parsed = BtrfsSuperblock::parse_superblock_region(&sb).expect("superblock parse");
        assert_eq!(parsed.generation, 9);
        assert_eq!(parsed.root, 0x40_0000);
        assert_eq!(parsed.chunk_root, 0x2_0000);
        assert_eq!(parsed.root_level, 1);
        assert_eq!(parsed.nodesize, 16384);
        assert_eq!(parsed.label, "data");
        assert!(parsed.sys_chunk_array.is_empty());
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut sb = base_superblock();
        sb[0x40..0x48].copy_from_slice(&0_u64.to_le_bytes());
        let err = BtrfsSuperblock::parse_superblock_region(&sb).unwrap_err();
        assert!(matches!(err, ParseError::InvalidMagic { actual: 0, .. }));
    }

    #[test]
    fn superblock_rejects_non_power_of_two_nodesize() {
        let mut sb = base_superblock();
        sb[0x94..0x98].copy_from_slice(&5000_u32.to_le_bytes());
        let err = BtrfsSuperblock::parse_superblock_region(&sb).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "nodesize",
                    ..
                }
            ),
            "expected nodesize error, got: {err:?}"
        );
    }

    #[test]
    fn superblock_sys_chunk_array_parsed() {
        let mut sb = base_superblock();
        let entry_size = BTRFS_DISK_KEY_SIZE + BTRFS_CHUNK_FIXED_SIZE + BTRFS_STRIPE_SIZE;
        sb[0xA0..0xA4].copy_from_slice(&u32::try_from(entry_size).unwrap().to_le_bytes());

        let base = BTRFS_SYS_CHUNK_ARRAY_OFFSET;
        sb[base..base + 8].copy_from_slice(&256_u64.to_le_bytes());
        sb[base + 8] = BTRFS_CHUNK_ITEM_KEY;
        sb[base + 9..base + 17].copy_from_slice(&0x10_0000_u64.to_le_bytes());
        write_chunk(&mut sb, base + BTRFS_DISK_KEY_SIZE, 8 * 1024 * 1024, 0x10_0000);

        let parsed = BtrfsSuperblock::parse_superblock_region(&sb).expect("sb parse");
        let entries = parse_sys_chunk_array(&parsed.sys_chunk_array).expect("chunk parse");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key.offset, 0x10_0000);
        assert_eq!(entries[0].length, 8 * 1024 * 1024);
        assert_eq!(entries[0].stripes[0].devid, 1);
        assert_eq!(entries[0].stripes[0].offset, 0x10_0000);
    }

    #[test]
    fn parse_sys_chunk_array_truncated_key() {
        let err = parse_sys_chunk_array(&[0_u8; 10]).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }

    #[test]
    fn chunk_item_payload_parsed() {
        let mut payload = vec![0_u8; BTRFS_CHUNK_FIXED_SIZE + BTRFS_STRIPE_SIZE];
        write_chunk(&mut payload, 0, 0x4000_0000, 0x50_0000);
        let key = BtrfsKey::new(256, BTRFS_CHUNK_ITEM_KEY, 0x100_0000);
        let chunk = parse_chunk_item(key, &payload).expect("chunk item");
        assert_eq!(chunk.key, key);
        assert_eq!(chunk.length, 0x4000_0000);
        assert_eq!(chunk.stripes[0].offset, 0x50_0000);
    }

    #[test]
    fn chunk_item_without_stripes_rejected() {
        let payload = vec![0_u8; BTRFS_CHUNK_FIXED_SIZE];
        let err = parse_chunk_item(BtrfsKey::MIN, &payload).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "num_stripes",
                ..
            }
        ));
    }

    #[test]
    fn map_logical_to_physical_hit_and_miss() {
        let chunks = one_chunk(0x100_0000, 0x80_0000, 0x20_0000);
        let mapping = map_logical_to_physical(&chunks, 0x108_0000)
            .expect("mapping should succeed")
            .expect("should find a mapping");
        assert_eq!(mapping.devid, 1);
        assert_eq!(mapping.physical, 0x28_0000);

        let miss = map_logical_to_physical(&chunks, 0x200_0000).expect("no error");
        assert!(miss.is_none());
        assert!(map_logical_to_physical(&[], 0x1000).expect("no error").is_none());
    }

    #[test]
    fn parse_leaf_items_payload_is_header_relative() {
        let mut block = make_block(512, 1, 0);
        let base = BTRFS_HEADER_SIZE;
        block[base..base + 8].copy_from_slice(&123_u64.to_le_bytes());
        block[base + 8] = 192;
        block[base + 9..base + 17].copy_from_slice(&999_u64.to_le_bytes());
        block[base + 17..base + 21].copy_from_slice(&300_u32.to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&8_u32.to_le_bytes());

        let (_, items) = parse_leaf_items(&block).expect("leaf parse");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, BtrfsKey::new(123, 192, 999));
        assert_eq!(
            items[0].payload_range().expect("range"),
            BTRFS_HEADER_SIZE + 300..BTRFS_HEADER_SIZE + 308
        );
    }

    #[test]
    fn parse_leaf_items_rejects_out_of_bounds_data() {
        let mut block = make_block(512, 1, 0);
        let base = BTRFS_HEADER_SIZE;
        block[base + 17..base + 21].copy_from_slice(&420_u32.to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&10_u32.to_le_bytes());

        let err = parse_leaf_items(&block).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "item_offset",
                    ..
                }
            ),
            "expected item_offset error, got: {err:?}"
        );
    }

    #[test]
    fn parse_internal_items_smoke() {
        let mut block = make_block(4096, 2, 1);
        for (idx, (objectid, ptr)) in [(256_u64, 0x4000_u64), (512, 0x8000)].iter().enumerate() {
            let b = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
            block[b..b + 8].copy_from_slice(&objectid.to_le_bytes());
            block[b + 8] = 132;
            block[b + 17..b + 25].copy_from_slice(&ptr.to_le_bytes());
            block[b + 25..b + 33].copy_from_slice(&10_u64.to_le_bytes());
        }

        let (header, ptrs) = parse_internal_items(&block).expect("internal parse");
        assert_eq!(header.level, 1);
        assert_eq!(ptrs.len(), 2);
        assert_eq!(ptrs[0].blockptr, 0x4000);
        assert_eq!(ptrs[1].key.objectid, 512);
        assert_eq!(ptrs[1].generation, 10);
    }

    #[test]
    fn parse_internal_items_rejects_zero_blockptr() {
        let block = make_block(4096, 1, 1);
        let err = parse_internal_items(&block).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "blockptr",
                    ..
                }
            ),
            "expected blockptr error, got: {err:?}"
        );
    }

    #[test]
    fn header_validate_limits() {
        let header = BtrfsHeader::parse_from_block(&make_block(4096, 0, 0)).expect("parse");
        assert!(matches!(
            header.validate(4096, Some(0x1000)).unwrap_err(),
            ParseError::InvalidField {
                field: "bytenr",
                ..
            }
        ));

        // (4096-101)/25 = 159 leaf items fit.
        let crowded = BtrfsHeader::parse_from_block(&make_block(4096, 200, 0)).expect("parse");
        assert!(matches!(
            crowded.validate(4096, None).unwrap_err(),
            ParseError::InvalidField {
                field: "nritems",
                ..
            }
        ));

        let deep = BtrfsHeader::parse_from_block(&make_block(4096, 0, 8)).expect("parse");
        assert!(matches!(
            deep.validate(4096, None).unwrap_err(),
            ParseError::InvalidField { field: "level", .. }
        ));
    }

    #[test]
    fn root_item_locates_tree() {
        let mut payload = vec![0_u8; 439];
        payload[ROOT_ITEM_GENERATION_OFFSET..ROOT_ITEM_GENERATION_OFFSET + 8]
            .copy_from_slice(&12_u64.to_le_bytes());
        payload[ROOT_ITEM_BYTENR_OFFSET..ROOT_ITEM_BYTENR_OFFSET + 8]
            .copy_from_slice(&0x1d0_0000_u64.to_le_bytes());
        payload[ROOT_ITEM_LEVEL_OFFSET] = 1;

        let root = BtrfsRootItem::parse(&payload).expect("root item");
        assert_eq!(root.generation, 12);
        assert_eq!(root.bytenr, 0x1d0_0000);
        assert_eq!(root.level, 1);

        let err = BtrfsRootItem::parse(&payload[..200]).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }
}
