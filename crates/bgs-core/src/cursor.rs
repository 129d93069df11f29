use crate::BlockGroupRecord;
use bgs_ondisk::BtrfsKey;
use bgs_types::BTRFS_BLOCK_GROUP_ITEM_KEY;
use std::fmt;

/// Inclusive lower bound of the next search.
///
/// Only ever moves forward: every constructor except [`Cursor::start`]
/// produces a key strictly greater than the one it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(BtrfsKey);

impl Cursor {
    #[must_use]
    pub const fn start() -> Self {
        Self(BtrfsKey::MIN)
    }

    /// Resume from an arbitrary key.
    #[must_use]
    pub const fn at(key: BtrfsKey) -> Self {
        Self(key)
    }

    #[must_use]
    pub const fn key(self) -> BtrfsKey {
        self.0
    }

    /// Where to look for the block group following `record`:
    /// `(start + length, BLOCK_GROUP_ITEM_KEY, 0)`.
    ///
    /// A zero-length record advances to the successor of its own key.
    /// `None` when the group ends at or beyond the top of the address space.
    #[must_use]
    pub fn after_block_group(record: &BlockGroupRecord) -> Option<Self> {
        if record.length() == 0 {
            return Self::past(record.key);
        }
        record
            .end()
            .map(|end| Self(BtrfsKey::new(end, BTRFS_BLOCK_GROUP_ITEM_KEY, 0)))
    }

    /// The smallest cursor strictly after `key`.
    #[must_use]
    pub fn past(key: BtrfsKey) -> Option<Self> {
        key.successor().map(Self)
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::start()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
