//! In-memory transport for tests and synthetic trees.

use crate::{SearchBatch, SearchItem, SearchRequest, SearchTransport, window};
use bgs_error::{BgsError, Result};
use bgs_ondisk::BtrfsKey;
use bgs_types::TreeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Trees held as key-sorted vectors.
///
/// Counts every search it serves so callers can assert how many round
/// trips an enumeration took.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    trees: HashMap<TreeId, Vec<SearchItem>>,
    searches: AtomicUsize,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tree_id` with no items, so searches in it succeed empty.
    pub fn add_tree(&mut self, tree_id: TreeId) -> &mut Self {
        self.trees.entry(tree_id).or_default();
        self
    }

    /// Insert (or replace) the item at `key`.
    pub fn insert(&mut self, tree_id: TreeId, key: BtrfsKey, data: Vec<u8>) -> Result<&mut Self> {
        let item = SearchItem::new(key, 1, data)?;
        let items = self.trees.entry(tree_id).or_default();
        match items.binary_search_by_key(&key, |existing| existing.header.key) {
            Ok(idx) => items[idx] = item,
            Err(idx) => items.insert(idx, item),
        }
        Ok(self)
    }

    /// Builder form of [`Self::insert`].
    pub fn with_item(mut self, tree_id: TreeId, key: BtrfsKey, data: Vec<u8>) -> Result<Self> {
        self.insert(tree_id, key, data)?;
        Ok(self)
    }

    /// Number of searches served so far, failed ones included.
    #[must_use]
    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::Relaxed)
    }
}

impl SearchTransport for MemoryTransport {
    fn search(&self, request: &SearchRequest) -> Result<SearchBatch> {
        self.searches.fetch_add(1, Ordering::Relaxed);
        let items = self
            .trees
            .get(&request.tree_id)
            .ok_or_else(|| BgsError::NotFound(format!("tree {}", request.tree_id)))?;
        window(items, request)
    }
}
