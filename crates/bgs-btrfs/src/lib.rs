#![forbid(unsafe_code)]
//! Tree traversal over an unmounted btrfs image.
//!
//! Builds on `bgs_ondisk` parsing primitives. [`walk_tree`] is I/O-agnostic
//! (callers provide a read callback for physical byte access);
//! [`BtrfsImage`] wires it to a [`ByteDevice`] and resolves trees by id.

#[cfg(any(test, feature = "fixtures"))]
pub mod fixture;

use bgs_block::{ByteDevice, FileByteDevice, read_btrfs_superblock_region};
use bgs_error::{BgsError, Result};
use bgs_ondisk::{
    BtrfsChunkEntry, BtrfsHeader, BtrfsKey, BtrfsRootItem, BtrfsSuperblock,
    map_logical_to_physical, parse_chunk_item, parse_internal_items, parse_leaf_items,
    parse_sys_chunk_array,
};
use bgs_types::{
    BTRFS_CHUNK_ITEM_KEY, BTRFS_CHUNK_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY,
    BTRFS_ROOT_TREE_OBJECTID, ParseError,
};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, trace};

/// A single leaf item yielded by tree traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtrfsLeafEntry {
    pub key: BtrfsKey,
    /// Generation of the leaf the item was read from.
    pub generation: u64,
    pub data: Vec<u8>,
}

/// Walk a btrfs tree from `root_logical` down to all leaves, collecting items.
///
/// `read_physical` reads `nodesize` bytes at the given physical byte offset.
/// `chunks` provides the logical→physical address mapping.
///
/// Returns all leaf items in key order (left-to-right DFS). Rejects levels
/// above 7, node cycles, and nodes referenced twice.
pub fn walk_tree(
    read_physical: &mut dyn FnMut(u64) -> std::result::Result<Vec<u8>, ParseError>,
    chunks: &[BtrfsChunkEntry],
    root_logical: u64,
    nodesize: u32,
) -> std::result::Result<Vec<BtrfsLeafEntry>, ParseError> {
    let mut walk = Walk {
        read_physical,
        chunks,
        nodesize,
        out: Vec::new(),
        active_path: HashSet::new(),
        visited_nodes: HashSet::new(),
    };
    walk.node(root_logical)?;
    Ok(walk.out)
}

struct Walk<'a> {
    read_physical: &'a mut dyn FnMut(u64) -> std::result::Result<Vec<u8>, ParseError>,
    chunks: &'a [BtrfsChunkEntry],
    nodesize: u32,
    out: Vec<BtrfsLeafEntry>,
    active_path: HashSet<u64>,
    visited_nodes: HashSet<u64>,
}

impl Walk<'_> {
    fn node(&mut self, logical: u64) -> std::result::Result<(), ParseError> {
        if !self.active_path.insert(logical) {
            return Err(ParseError::InvalidField {
                field: "logical_address",
                reason: "cycle detected in btrfs tree pointers",
            });
        }
        if !self.visited_nodes.insert(logical) {
            return Err(ParseError::InvalidField {
                field: "logical_address",
                reason: "duplicate node reference in btrfs tree pointers",
            });
        }

        let mapping = map_logical_to_physical(self.chunks, logical)?.ok_or(
            ParseError::InvalidField {
                field: "logical_address",
                reason: "not covered by any chunk",
            },
        )?;

        let block = (self.read_physical)(mapping.physical)?;
        let ns = usize::try_from(self.nodesize)
            .map_err(|_| ParseError::IntegerConversion { field: "nodesize" })?;
        if block.len() != ns {
            return Err(ParseError::InsufficientData {
                needed: ns,
                offset: 0,
                actual: block.len(),
            });
        }

        let header = BtrfsHeader::parse_from_block(&block)?;
        header.validate(block.len(), Some(logical))?;
        trace!(logical, level = header.level, nritems = header.nritems, "btrfs node");

        if header.level == 0 {
            self.collect_leaf(&block, header.generation)?;
        } else {
            let (_, ptrs) = parse_internal_items(&block)?;
            for kp in &ptrs {
                self.node(kp.blockptr)?;
            }
        }

        self.active_path.remove(&logical);
        Ok(())
    }

    fn collect_leaf(&mut self, block: &[u8], generation: u64) -> std::result::Result<(), ParseError> {
        let (_, items) = parse_leaf_items(block)?;
        for item in items {
            let range = item.payload_range()?;
            self.out.push(BtrfsLeafEntry {
                key: item.key,
                generation,
                data: block[range].to_vec(),
            });
        }
        Ok(())
    }
}

/// Convert a parse failure into the runtime error type.
#[must_use]
pub fn parse_to_bgs_error(err: &ParseError) -> BgsError {
    match err {
        ParseError::InvalidMagic { .. } => BgsError::Format(err.to_string()),
        ParseError::InsufficientData { offset, .. } => BgsError::Corruption {
            location: *offset as u64,
            detail: err.to_string(),
        },
        ParseError::InvalidField { .. } | ParseError::IntegerConversion { .. } => {
            BgsError::Parse(err.to_string())
        }
    }
}

/// An unmounted btrfs image opened read-only, with its full chunk map.
pub struct BtrfsImage {
    superblock: BtrfsSuperblock,
    chunks: Vec<BtrfsChunkEntry>,
    dev: Box<dyn ByteDevice>,
}

impl std::fmt::Debug for BtrfsImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtrfsImage")
            .field("label", &self.superblock.label)
            .field("generation", &self.superblock.generation)
            .field("chunks", &self.chunks.len())
            .field("dev_len", &self.dev.len_bytes())
            .finish()
    }
}

impl BtrfsImage {
    /// Open the image or block device at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let dev = FileByteDevice::open(path)?;
        Self::from_device(Box::new(dev))
    }

    /// Parse the superblock and load the chunk map from an opened device.
    pub fn from_device(dev: Box<dyn ByteDevice>) -> Result<Self> {
        let region = read_btrfs_superblock_region(&*dev)?;
        let superblock =
            BtrfsSuperblock::parse_superblock_region(&region).map_err(|e| parse_to_bgs_error(&e))?;
        let mut image = Self {
            chunks: parse_sys_chunk_array(&superblock.sys_chunk_array)
                .map_err(|e| parse_to_bgs_error(&e))?,
            superblock,
            dev,
        };
        image.load_chunk_tree()?;
        debug!(
            label = %image.superblock.label,
            generation = image.superblock.generation,
            chunks = image.chunks.len(),
            "opened btrfs image"
        );
        Ok(image)
    }

    #[must_use]
    pub fn superblock(&self) -> &BtrfsSuperblock {
        &self.superblock
    }

    #[must_use]
    pub fn chunks(&self) -> &[BtrfsChunkEntry] {
        &self.chunks
    }

    /// Replace the bootstrap (sys_chunk_array) mapping with every CHUNK_ITEM
    /// in the chunk tree, which also covers METADATA and DATA chunks.
    fn load_chunk_tree(&mut self) -> Result<()> {
        let entries = self.walk(self.superblock.chunk_root)?;
        let mut chunks = entries
            .iter()
            .filter(|entry| entry.key.item_type == BTRFS_CHUNK_ITEM_KEY)
            .map(|entry| parse_chunk_item(entry.key, &entry.data))
            .collect::<std::result::Result<Vec<_>, ParseError>>()
            .map_err(|e| parse_to_bgs_error(&e))?;
        if chunks.is_empty() {
            return Err(BgsError::Format("chunk tree holds no chunk items".into()));
        }
        chunks.sort_by_key(|chunk| chunk.key.offset);
        self.chunks = chunks;
        Ok(())
    }

    /// Walk the tree rooted at `root_logical`, reading nodes via the device.
    pub fn walk(&self, root_logical: u64) -> Result<Vec<BtrfsLeafEntry>> {
        let nodesize = self.superblock.nodesize;
        let ns = usize::try_from(nodesize)
            .map_err(|_| BgsError::Format("nodesize overflow".into()))?;

        // The callback speaks ParseError; keep the real I/O error aside.
        let mut io_error = None;
        let mut read_fn = |phys: u64| -> std::result::Result<Vec<u8>, ParseError> {
            let mut buf = vec![0_u8; ns];
            match self.dev.read_exact_at(phys, &mut buf) {
                Ok(()) => Ok(buf),
                Err(err) => {
                    io_error = Some(err);
                    Err(ParseError::InsufficientData {
                        needed: ns,
                        offset: 0,
                        actual: 0,
                    })
                }
            }
        };

        let walked = walk_tree(&mut read_fn, &self.chunks, root_logical, nodesize);
        match (walked, io_error) {
            (Ok(entries), _) => Ok(entries),
            (Err(_), Some(io)) => Err(io),
            (Err(parse), None) => Err(parse_to_bgs_error(&parse)),
        }
    }

    /// Logical address of the root node of `tree_id`.
    ///
    /// The root and chunk trees come from the superblock; every other tree
    /// is looked up as a ROOT_ITEM in the root tree.
    pub fn tree_root(&self, tree_id: u64) -> Result<u64> {
        match tree_id {
            BTRFS_ROOT_TREE_OBJECTID => return Ok(self.superblock.root),
            BTRFS_CHUNK_TREE_OBJECTID => return Ok(self.superblock.chunk_root),
            _ => {}
        }

        let root_tree = self.walk(self.superblock.root)?;
        let entry = root_tree
            .iter()
            .rev()
            .find(|entry| {
                entry.key.objectid == tree_id && entry.key.item_type == BTRFS_ROOT_ITEM_KEY
            })
            .ok_or_else(|| BgsError::NotFound(format!("tree {tree_id} in root tree")))?;
        let root = BtrfsRootItem::parse(&entry.data).map_err(|e| parse_to_bgs_error(&e))?;
        Ok(root.bytenr)
    }

    /// All leaf items of `tree_id`, in key order.
    pub fn tree_items(&self, tree_id: u64) -> Result<Vec<BtrfsLeafEntry>> {
        let root = self.tree_root(tree_id)?;
        let items = self.walk(root)?;
        debug!(tree_id, root, items = items.len(), "walked btrfs tree");
        Ok(items)
    }
}
