#![forbid(unsafe_code)]
//! btrfs layout parsing.
//!
//! Pure parsing crate, no I/O. Turns byte slices into typed structures:
//! superblock, chunk items, tree-node headers, leaf item tables, root items,
//! and the argument/result buffers of the `TREE_SEARCH_V2` ioctl.

pub mod btrfs;
pub mod search;

pub use btrfs::{
    BtrfsChunkEntry, BtrfsHeader, BtrfsItem, BtrfsKey, BtrfsKeyPtr, BtrfsPhysicalMapping,
    BtrfsRootItem, BtrfsStripe, BtrfsSuperblock, map_logical_to_physical, parse_chunk_item,
    parse_internal_items, parse_leaf_items, parse_sys_chunk_array,
};
pub use search::{
    RawSearchHeader, SEARCH_ARGS_V2_FIXED_SIZE, SEARCH_HEADER_SIZE, SEARCH_KEY_SIZE,
    SearchKeyArgs, parse_search_results,
};
