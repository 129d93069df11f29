use bgs_ondisk::BtrfsKey;
use bgs_search::{ItemHeader, ItemKind};
use serde::{Deserialize, Serialize};

/// A BLOCK_GROUP_ITEM header: the key's objectid is the group's first
/// logical byte, its offset the group's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupRecord {
    pub key: BtrfsKey,
    pub transid: u64,
}

impl BlockGroupRecord {
    /// Narrow a search header to a block-group record.
    #[must_use]
    pub fn from_header(header: &ItemHeader) -> Option<Self> {
        match header.kind() {
            ItemKind::BlockGroup => Some(Self {
                key: header.key,
                transid: header.transid,
            }),
            ItemKind::ExtentItem
            | ItemKind::MetadataItem
            | ItemKind::TreeBlockRef
            | ItemKind::ExtentDataRef
            | ItemKind::SharedBlockRef
            | ItemKind::SharedDataRef
            | ItemKind::Other(_) => None,
        }
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.key.objectid
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.key.offset
    }

    /// First byte past the group, `None` if it would not fit in u64.
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        self.start().checked_add(self.length())
    }
}
