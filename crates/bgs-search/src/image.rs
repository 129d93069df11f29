//! Tree search over an unmounted image file.
//!
//! The first search in a tree walks it once through [`BtrfsImage`]; later
//! searches are served from the cached, key-sorted item list.

use crate::{SearchBatch, SearchItem, SearchRequest, SearchTransport, window};
use bgs_btrfs::BtrfsImage;
use bgs_error::{BgsError, Result};
use bgs_types::TreeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug)]
pub struct ImageTransport {
    image: BtrfsImage,
    trees: Mutex<HashMap<TreeId, Arc<Vec<SearchItem>>>>,
    searches: AtomicUsize,
}

impl ImageTransport {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_image(BtrfsImage::open(path)?))
    }

    #[must_use]
    pub fn from_image(image: BtrfsImage) -> Self {
        Self {
            image,
            trees: Mutex::new(HashMap::new()),
            searches: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn image(&self) -> &BtrfsImage {
        &self.image
    }

    #[must_use]
    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::Relaxed)
    }

    fn tree(&self, tree_id: TreeId) -> Result<Arc<Vec<SearchItem>>> {
        let mut trees = self.trees.lock();
        if let Some(items) = trees.get(&tree_id) {
            return Ok(Arc::clone(items));
        }

        let mut items = self
            .image
            .tree_items(tree_id.get())?
            .into_iter()
            .map(|entry| SearchItem::new(entry.key, entry.generation, entry.data))
            .collect::<Result<Vec<_>>>()?;
        // `window` binary-searches, so misordered leaves are fatal here.
        if !items.is_sorted_by_key(|item| item.header.key) {
            return Err(BgsError::Corruption {
                location: tree_id.get(),
                detail: "tree items out of key order".into(),
            });
        }
        items.dedup_by_key(|item| item.header.key);
        debug!(tree_id = tree_id.get(), items = items.len(), "cached tree");

        let items = Arc::new(items);
        trees.insert(tree_id, Arc::clone(&items));
        Ok(items)
    }
}

impl SearchTransport for ImageTransport {
    fn search(&self, request: &SearchRequest) -> Result<SearchBatch> {
        self.searches.fetch_add(1, Ordering::Relaxed);
        let items = self.tree(request.tree_id)?;
        window(&items, request)
    }
}
