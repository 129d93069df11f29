#![deny(unsafe_code)]
//! Bounded, key-ordered tree search.
//!
//! A [`SearchTransport`] answers one question: starting at a key, which
//! items follow, in ascending key order, as far as a byte budget allows?
//! Every transport charges an item [`SEARCH_HEADER_SIZE`] bytes plus its
//! payload, the same accounting the kernel uses for `TREE_SEARCH_V2`.
//!
//! | Transport | Backing | Use |
//! |-----------|---------|-----|
//! | [`IoctlTransport`] | mounted filesystem | production scans (Linux, `CAP_SYS_ADMIN`) |
//! | [`ImageTransport`] | unmounted image file | offline scans |
//! | [`MemoryTransport`] | sorted vectors | tests |

pub mod image;
#[cfg(target_os = "linux")]
pub mod ioctl;
pub mod memory;

pub use bgs_ondisk::{BtrfsKey, SEARCH_HEADER_SIZE};
pub use bgs_types::TreeId;
pub use image::ImageTransport;
#[cfg(target_os = "linux")]
pub use ioctl::IoctlTransport;
pub use memory::MemoryTransport;

use bgs_error::{BgsError, Result};
use bgs_types::{
    BTRFS_BLOCK_GROUP_ITEM_KEY, BTRFS_EXTENT_DATA_REF_KEY, BTRFS_EXTENT_ITEM_KEY,
    BTRFS_METADATA_ITEM_KEY, BTRFS_SHARED_BLOCK_REF_KEY, BTRFS_SHARED_DATA_REF_KEY,
    BTRFS_TREE_BLOCK_REF_KEY,
};
use serde::{Deserialize, Serialize};

/// One bounded search: `[min_key, max_key]` in `tree_id`, results capped
/// at `buffer_budget` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRequest {
    pub tree_id: TreeId,
    pub min_key: BtrfsKey,
    pub max_key: BtrfsKey,
    pub buffer_budget: usize,
}

impl SearchRequest {
    /// Search from `min_key` to the end of the tree.
    #[must_use]
    pub fn from_key(tree_id: TreeId, min_key: BtrfsKey, buffer_budget: usize) -> Self {
        Self {
            tree_id,
            min_key,
            max_key: BtrfsKey::MAX,
            buffer_budget,
        }
    }
}

/// Closed set of extent-tree item types, plus everything else by raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    ExtentItem,
    MetadataItem,
    TreeBlockRef,
    ExtentDataRef,
    SharedBlockRef,
    SharedDataRef,
    BlockGroup,
    Other(u8),
}

impl ItemKind {
    #[must_use]
    pub fn from_raw(item_type: u8) -> Self {
        match item_type {
            BTRFS_EXTENT_ITEM_KEY => Self::ExtentItem,
            BTRFS_METADATA_ITEM_KEY => Self::MetadataItem,
            BTRFS_TREE_BLOCK_REF_KEY => Self::TreeBlockRef,
            BTRFS_EXTENT_DATA_REF_KEY => Self::ExtentDataRef,
            BTRFS_SHARED_BLOCK_REF_KEY => Self::SharedBlockRef,
            BTRFS_SHARED_DATA_REF_KEY => Self::SharedDataRef,
            BTRFS_BLOCK_GROUP_ITEM_KEY => Self::BlockGroup,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub fn raw(self) -> u8 {
        match self {
            Self::ExtentItem => BTRFS_EXTENT_ITEM_KEY,
            Self::MetadataItem => BTRFS_METADATA_ITEM_KEY,
            Self::TreeBlockRef => BTRFS_TREE_BLOCK_REF_KEY,
            Self::ExtentDataRef => BTRFS_EXTENT_DATA_REF_KEY,
            Self::SharedBlockRef => BTRFS_SHARED_BLOCK_REF_KEY,
            Self::SharedDataRef => BTRFS_SHARED_DATA_REF_KEY,
            Self::BlockGroup => BTRFS_BLOCK_GROUP_ITEM_KEY,
            Self::Other(raw) => raw,
        }
    }
}

/// Header of one search result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemHeader {
    pub key: BtrfsKey,
    pub transid: u64,
    /// Payload length in bytes.
    pub len: u32,
}

impl ItemHeader {
    #[must_use]
    pub fn objectid(&self) -> u64 {
        self.key.objectid
    }

    #[must_use]
    pub fn item_type(&self) -> u8 {
        self.key.item_type
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.key.offset
    }

    #[must_use]
    pub fn kind(&self) -> ItemKind {
        ItemKind::from_raw(self.key.item_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchItem {
    pub header: ItemHeader,
    pub data: Vec<u8>,
}

impl SearchItem {
    /// Build an item, deriving `header.len` from the payload.
    pub fn new(key: BtrfsKey, transid: u64, data: Vec<u8>) -> Result<Self> {
        let len = u32::try_from(data.len())
            .map_err(|_| BgsError::Format(format!("item {key} payload exceeds u32")))?;
        Ok(Self {
            header: ItemHeader { key, transid, len },
            data,
        })
    }

    /// Bytes this item occupies in a search result buffer.
    #[must_use]
    pub fn buffer_cost(&self) -> usize {
        SEARCH_HEADER_SIZE + self.data.len()
    }
}

/// Result of one search call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchBatch {
    /// Items in ascending key order, all within the requested range.
    pub items: Vec<SearchItem>,
    /// `true` when the batch reached the end of the requested range: no
    /// item beyond the last one returned exists in `[min_key, max_key]`.
    /// `false` means the budget cut the batch short, or the transport
    /// cannot tell.
    pub exhausted: bool,
}

impl SearchBatch {
    #[must_use]
    pub fn last_key(&self) -> Option<BtrfsKey> {
        self.items.last().map(|item| item.header.key)
    }
}

/// A bounded, ascending-key range query over one filesystem's trees.
///
/// Implementations must return items in ascending key order, all within
/// `[request.min_key, request.max_key]`, whose total
/// [`SearchItem::buffer_cost`] fits `request.buffer_budget`. A search that
/// cannot fit even one item fails rather than returning an empty batch.
pub trait SearchTransport {
    fn search(&self, request: &SearchRequest) -> Result<SearchBatch>;
}

/// Serve `request` from a fully materialised, key-sorted tree.
///
/// Shared by the in-process transports so they charge the budget exactly
/// like the kernel: when the first matching item does not fit, the search
/// fails with `EOVERFLOW`.
pub fn window(items: &[SearchItem], request: &SearchRequest) -> Result<SearchBatch> {
    let start = items.partition_point(|item| item.header.key < request.min_key);
    let mut batch = SearchBatch::default();
    let mut used = 0_usize;

    for item in &items[start..] {
        if item.header.key > request.max_key {
            batch.exhausted = true;
            return Ok(batch);
        }
        let cost = item.buffer_cost();
        if used + cost > request.buffer_budget {
            if batch.items.is_empty() {
                return Err(BgsError::Io(std::io::Error::from_raw_os_error(
                    libc::EOVERFLOW,
                )));
            }
            return Ok(batch);
        }
        used += cost;
        batch.items.push(item.clone());
    }

    batch.exhausted = true;
    Ok(batch)
}
