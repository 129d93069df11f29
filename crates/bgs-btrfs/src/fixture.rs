//! Synthetic single-device btrfs images.
//!
//! Layout of a built image (logical == physical, one chunk covering it all):
//!
//! ```text
//! 0x10000   superblock (sys_chunk_array holds the chunk)
//! 0x100000  chunk tree leaf
//! 0x101000  root tree leaf (one ROOT_ITEM for the extent tree)
//! 0x102000… extent tree nodes, leaves first, then internal levels
//! ```

use bgs_ondisk::BtrfsKey;
use bgs_types::{
    BTRFS_BLOCK_GROUP_ITEM_KEY, BTRFS_CHUNK_ITEM_KEY, BTRFS_CHUNK_TREE_OBJECTID,
    BTRFS_EXTENT_ITEM_KEY, BTRFS_EXTENT_TREE_OBJECTID, BTRFS_FIRST_CHUNK_TREE_OBJECTID,
    BTRFS_MAGIC, BTRFS_ROOT_ITEM_KEY, BTRFS_ROOT_TREE_OBJECTID, BTRFS_SUPER_INFO_OFFSET,
};

pub const FIXTURE_NODESIZE: u32 = 4096;
const NODESIZE: usize = FIXTURE_NODESIZE as usize;
const FIRST_NODE: u64 = 0x10_0000;
const HEADER_SIZE: usize = 101;
const ITEM_SIZE: usize = 25;
const KEY_PTR_SIZE: usize = 33;
const MAX_PTRS: usize = (NODESIZE - HEADER_SIZE) / KEY_PTR_SIZE;
const LEAF_SPACE: usize = NODESIZE - HEADER_SIZE;
const CHUNK_ITEM_SIZE: usize = 48 + 32;
const ROOT_ITEM_SIZE: usize = 439;
const GENERATION: u64 = 7;

enum Node {
    Leaf(Vec<(BtrfsKey, Vec<u8>)>),
    Internal { level: u8, children: Vec<usize> },
}

/// Builder for an image whose extent tree holds the given items.
#[derive(Debug, Default, Clone)]
pub struct ImageBuilder {
    items: Vec<(BtrfsKey, Vec<u8>)>,
}

impl ImageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an arbitrary extent-tree item.
    #[must_use]
    pub fn item(mut self, key: BtrfsKey, payload: Vec<u8>) -> Self {
        self.items.push((key, payload));
        self
    }

    /// Add a BLOCK_GROUP_ITEM covering `[start, start + length)`.
    #[must_use]
    pub fn block_group(self, start: u64, length: u64) -> Self {
        let mut payload = vec![0_u8; 24];
        payload[8..16].copy_from_slice(&BTRFS_FIRST_CHUNK_TREE_OBJECTID.to_le_bytes());
        payload[16..24].copy_from_slice(&1_u64.to_le_bytes());
        self.item(
            BtrfsKey::new(start, BTRFS_BLOCK_GROUP_ITEM_KEY, length),
            payload,
        )
    }

    /// Add an EXTENT_ITEM for a data extent at `start`.
    #[must_use]
    pub fn extent_item(self, start: u64, length: u64) -> Self {
        let mut payload = vec![0_u8; 24];
        payload[0..8].copy_from_slice(&1_u64.to_le_bytes());
        payload[8..16].copy_from_slice(&GENERATION.to_le_bytes());
        payload[16..24].copy_from_slice(&1_u64.to_le_bytes());
        self.item(BtrfsKey::new(start, BTRFS_EXTENT_ITEM_KEY, length), payload)
    }

    /// Serialize the image.
    ///
    /// # Panics
    ///
    /// Panics if a single item payload does not fit in a leaf.
    #[must_use]
    pub fn build(mut self) -> Vec<u8> {
        self.items.sort_by_key(|(key, _)| *key);

        let mut nodes = Vec::new();
        let mut level_nodes: Vec<usize> = pack_leaves(self.items)
            .into_iter()
            .map(|leaf| {
                nodes.push(Node::Leaf(leaf));
                nodes.len() - 1
            })
            .collect();
        let mut level = 0_u8;
        while level_nodes.len() > 1 {
            level += 1;
            level_nodes = level_nodes
                .chunks(MAX_PTRS)
                .map(|children| {
                    nodes.push(Node::Internal {
                        level,
                        children: children.to_vec(),
                    });
                    nodes.len() - 1
                })
                .collect();
        }
        let extent_root = node_addr(level_nodes[0]);

        let image_len = usize::try_from(node_addr(nodes.len())).expect("image fits usize");
        let mut image = vec![0_u8; image_len];

        for (idx, node) in nodes.iter().enumerate() {
            let block = node_block(&mut image, node_addr(idx));
            match node {
                Node::Leaf(items) => write_leaf(block, node_addr(idx), items),
                Node::Internal { level, children } => {
                    write_header(
                        block,
                        node_addr(idx),
                        BTRFS_EXTENT_TREE_OBJECTID,
                        children.len(),
                        *level,
                    );
                    for (slot, child) in children.iter().enumerate() {
                        let base = HEADER_SIZE + slot * KEY_PTR_SIZE;
                        write_key(block, base, first_key(&nodes, *child));
                        block[base + 17..base + 25]
                            .copy_from_slice(&node_addr(*child).to_le_bytes());
                        block[base + 25..base + 33].copy_from_slice(&GENERATION.to_le_bytes());
                    }
                }
            }
        }

        let image_len = image_len as u64;
        let chunk_key = BtrfsKey::new(BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_CHUNK_ITEM_KEY, 0);
        let chunk = chunk_body(image_len);

        let chunk_leaf_addr = FIRST_NODE;
        write_leaf(
            node_block(&mut image, chunk_leaf_addr),
            chunk_leaf_addr,
            &[(chunk_key, chunk.clone())],
        );
        rewrite_owner(&mut image, chunk_leaf_addr, BTRFS_CHUNK_TREE_OBJECTID);

        let root_leaf_addr = FIRST_NODE + FIXTURE_NODESIZE as u64;
        let mut root_item = vec![0_u8; ROOT_ITEM_SIZE];
        root_item[160..168].copy_from_slice(&GENERATION.to_le_bytes());
        root_item[176..184].copy_from_slice(&extent_root.to_le_bytes());
        root_item[238] = level;
        write_leaf(
            node_block(&mut image, root_leaf_addr),
            root_leaf_addr,
            &[(
                BtrfsKey::new(BTRFS_EXTENT_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY, 0),
                root_item,
            )],
        );
        rewrite_owner(&mut image, root_leaf_addr, BTRFS_ROOT_TREE_OBJECTID);

        let sb = &mut image[BTRFS_SUPER_INFO_OFFSET..BTRFS_SUPER_INFO_OFFSET + 4096];
        sb[0x30..0x38].copy_from_slice(&(BTRFS_SUPER_INFO_OFFSET as u64).to_le_bytes());
        sb[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
        sb[0x48..0x50].copy_from_slice(&GENERATION.to_le_bytes());
        sb[0x50..0x58].copy_from_slice(&root_leaf_addr.to_le_bytes());
        sb[0x58..0x60].copy_from_slice(&chunk_leaf_addr.to_le_bytes());
        sb[0x70..0x78].copy_from_slice(&image_len.to_le_bytes());
        sb[0x88..0x90].copy_from_slice(&1_u64.to_le_bytes());
        sb[0x90..0x94].copy_from_slice(&FIXTURE_NODESIZE.to_le_bytes());
        sb[0x94..0x98].copy_from_slice(&FIXTURE_NODESIZE.to_le_bytes());
        sb[0x9C..0xA0].copy_from_slice(&FIXTURE_NODESIZE.to_le_bytes());
        let sys_len = 17 + CHUNK_ITEM_SIZE;
        sb[0xA0..0xA4].copy_from_slice(&(sys_len as u32).to_le_bytes());
        sb[0x12B..0x12B + 7].copy_from_slice(b"fixture");
        write_key(sb, 0x32B, chunk_key);
        sb[0x32B + 17..0x32B + sys_len].copy_from_slice(&chunk);

        image
    }
}

fn node_addr(idx: usize) -> u64 {
    FIRST_NODE + (idx as u64 + 2) * FIXTURE_NODESIZE as u64
}

fn node_block(image: &mut [u8], addr: u64) -> &mut [u8] {
    let start = usize::try_from(addr).expect("address fits usize");
    &mut image[start..start + NODESIZE]
}

fn pack_leaves(items: Vec<(BtrfsKey, Vec<u8>)>) -> Vec<Vec<(BtrfsKey, Vec<u8>)>> {
    let mut leaves = vec![Vec::new()];
    let mut used = 0_usize;
    for (key, payload) in items {
        let cost = ITEM_SIZE + payload.len();
        assert!(cost <= LEAF_SPACE, "item payload too large for a leaf");
        if used + cost > LEAF_SPACE {
            leaves.push(Vec::new());
            used = 0;
        }
        used += cost;
        leaves
            .last_mut()
            .expect("at least one leaf")
            .push((key, payload));
    }
    leaves
}

fn first_key(nodes: &[Node], idx: usize) -> BtrfsKey {
    match &nodes[idx] {
        Node::Leaf(items) => items.first().map_or(BtrfsKey::MIN, |(key, _)| *key),
        Node::Internal { children, .. } => first_key(nodes, children[0]),
    }
}

fn write_key(buf: &mut [u8], at: usize, key: BtrfsKey) {
    buf[at..at + 8].copy_from_slice(&key.objectid.to_le_bytes());
    buf[at + 8] = key.item_type;
    buf[at + 9..at + 17].copy_from_slice(&key.offset.to_le_bytes());
}

fn write_header(block: &mut [u8], bytenr: u64, owner: u64, nritems: usize, level: u8) {
    block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
    block[0x50..0x58].copy_from_slice(&GENERATION.to_le_bytes());
    block[0x58..0x60].copy_from_slice(&owner.to_le_bytes());
    block[0x60..0x64].copy_from_slice(&(nritems as u32).to_le_bytes());
    block[0x64] = level;
}

fn rewrite_owner(image: &mut [u8], addr: u64, owner: u64) {
    node_block(image, addr)[0x58..0x60].copy_from_slice(&owner.to_le_bytes());
}

/// Item table grows from the front, payloads are packed from the end.
fn write_leaf(block: &mut [u8], bytenr: u64, items: &[(BtrfsKey, Vec<u8>)]) {
    write_header(block, bytenr, BTRFS_EXTENT_TREE_OBJECTID, items.len(), 0);
    let mut data_end = LEAF_SPACE;
    for (slot, (key, payload)) in items.iter().enumerate() {
        data_end -= payload.len();
        let base = HEADER_SIZE + slot * ITEM_SIZE;
        write_key(block, base, *key);
        block[base + 17..base + 21].copy_from_slice(&(data_end as u32).to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        let start = HEADER_SIZE + data_end;
        block[start..start + payload.len()].copy_from_slice(payload);
    }
}

/// SYSTEM chunk mapping `[0, length)` onto device 1 at the same offsets.
fn chunk_body(length: u64) -> Vec<u8> {
    let mut body = vec![0_u8; CHUNK_ITEM_SIZE];
    body[0..8].copy_from_slice(&length.to_le_bytes());
    body[8..16].copy_from_slice(&BTRFS_EXTENT_TREE_OBJECTID.to_le_bytes());
    body[16..24].copy_from_slice(&0x1_0000_u64.to_le_bytes());
    body[24..32].copy_from_slice(&2_u64.to_le_bytes());
    body[32..36].copy_from_slice(&FIXTURE_NODESIZE.to_le_bytes());
    body[36..40].copy_from_slice(&FIXTURE_NODESIZE.to_le_bytes());
    body[40..44].copy_from_slice(&FIXTURE_NODESIZE.to_le_bytes());
    body[44..46].copy_from_slice(&1_u16.to_le_bytes());
    body[48..56].copy_from_slice(&1_u64.to_le_bytes());
    body
}
