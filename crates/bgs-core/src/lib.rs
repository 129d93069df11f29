#![forbid(unsafe_code)]
//! Block-group enumeration by bounded tree search.
//!
//! The extent tree keys every block group as
//! `(start, BLOCK_GROUP_ITEM_KEY, length)`, interleaved with far more
//! numerous extent and backref items. [`BlockGroups`] walks it with a
//! [`Cursor`]: search from the cursor, take the first block-group item in
//! the returned window, move the cursor to the end of that group, repeat.
//! Everything between two block groups is skipped without being read.
//!
//! ```text
//! cursor (0 0 0) ──search──► [EXTENT, EXTENT, BG(0,100), …] ─► yield [0,100)
//! cursor (100 192 0) ─search─► [BG(100,150), …]              ─► yield [100,250)
//! cursor (250 192 0) ─search─► []                            ─► end
//! ```

pub mod config;
pub mod cursor;
pub mod record;

pub use config::{MAX_BUFFER_BUDGET, SEARCH_BUFFER_BUDGET, ScanConfig};
pub use cursor::Cursor;
pub use record::BlockGroupRecord;

use bgs_error::{BgsError, Result};
use bgs_ondisk::BtrfsKey;
use bgs_search::{SearchBatch, SearchRequest, SearchTransport};
use bgs_types::TreeId;
use serde::Serialize;
use std::iter::FusedIterator;
use tracing::{debug, info, trace};

/// Counters for one enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    /// Search calls issued, failed ones included.
    pub searches: usize,
    /// Items inspected across all returned windows.
    pub items_scanned: usize,
    pub block_groups: usize,
    /// Sum of block-group lengths, saturating.
    pub bytes_covered: u64,
}

/// First block group at or after `cursor` in `tree_id`, using the default
/// search buffer.
///
/// A window with no block group that was cut short by the buffer is
/// continued from just past its last key, so `None` means there is none.
pub fn find_next_block_group<T>(
    transport: &T,
    tree_id: TreeId,
    cursor: Cursor,
) -> Result<Option<BlockGroupRecord>>
where
    T: SearchTransport + ?Sized,
{
    let config = ScanConfig {
        tree_id,
        ..ScanConfig::default()
    };
    let mut stats = ScanStats::default();
    scan_from(transport, &config, cursor, &mut stats)
}

/// Every block group of the extent tree, in ascending address order.
pub fn enumerate_block_groups<T>(transport: &T) -> BlockGroups<'_, T>
where
    T: SearchTransport + ?Sized,
{
    BlockGroups {
        transport,
        config: ScanConfig::default(),
        cursor: Some(Cursor::start()),
        stats: ScanStats::default(),
    }
}

/// Lazy enumeration of block groups.
///
/// Yields each record once, in ascending order. After the last record, or
/// after the first error, it only returns `None`.
#[derive(Debug)]
pub struct BlockGroups<'a, T: SearchTransport + ?Sized> {
    transport: &'a T,
    config: ScanConfig,
    cursor: Option<Cursor>,
    stats: ScanStats,
}

impl<'a, T: SearchTransport + ?Sized> BlockGroups<'a, T> {
    pub fn with_config(transport: &'a T, config: ScanConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            config,
            cursor: Some(Cursor::start()),
            stats: ScanStats::default(),
        })
    }

    /// Start from `cursor` instead of the beginning of the tree.
    #[must_use]
    pub fn resume_at(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Lower bound of the next search; `None` once the enumeration is over.
    #[must_use]
    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    #[must_use]
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    #[must_use]
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }
}

impl<T: SearchTransport + ?Sized> Iterator for BlockGroups<'_, T> {
    type Item = Result<BlockGroupRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor?;
        match scan_from(self.transport, &self.config, cursor, &mut self.stats) {
            Ok(Some(record)) => {
                self.stats.block_groups += 1;
                self.stats.bytes_covered =
                    self.stats.bytes_covered.saturating_add(record.length());
                self.cursor = Cursor::after_block_group(&record);
                if self.cursor.is_none() {
                    debug!(start = record.start(), "block group reaches end of address space");
                }
                Some(Ok(record))
            }
            Ok(None) => {
                self.cursor = None;
                info!(
                    tree_id = self.config.tree_id.get(),
                    block_groups = self.stats.block_groups,
                    searches = self.stats.searches,
                    "block group enumeration complete"
                );
                None
            }
            Err(err) => {
                self.cursor = None;
                debug!(
                    errno = err.to_errno(),
                    block_groups = self.stats.block_groups,
                    error = %err,
                    "block group enumeration failed"
                );
                Some(Err(err))
            }
        }
    }
}

impl<T: SearchTransport + ?Sized> FusedIterator for BlockGroups<'_, T> {}

fn scan_from<T>(
    transport: &T,
    config: &ScanConfig,
    cursor: Cursor,
    stats: &mut ScanStats,
) -> Result<Option<BlockGroupRecord>>
where
    T: SearchTransport + ?Sized,
{
    let tree_id = config.tree_id;
    let mut from = cursor;
    loop {
        if let Some(cap) = config.max_searches.filter(|&cap| stats.searches >= cap) {
            return Err(BgsError::Format(format!(
                "search limit of {cap} reached at {from}"
            )));
        }

        let request = SearchRequest::from_key(tree_id, from.key(), config.buffer_budget);
        stats.searches += 1;
        let batch = transport
            .search(&request)
            .and_then(|batch| check_batch(&request, batch))
            .map_err(|err| search_failed(tree_id, from.key(), err))?;
        debug!(
            tree_id = tree_id.get(),
            cursor = %from,
            items = batch.items.len(),
            exhausted = batch.exhausted,
            "tree search"
        );

        for item in &batch.items {
            stats.items_scanned += 1;
            if let Some(record) = BlockGroupRecord::from_header(&item.header) {
                return Ok(Some(record));
            }
            trace!(key = %item.header.key, kind = ?item.header.kind(), "skipping item");
        }

        if batch.exhausted {
            return Ok(None);
        }
        match batch.last_key().and_then(Cursor::past) {
            Some(next) => from = next,
            None => return Ok(None),
        }
    }
}

/// Reject batches that break the transport contract: items outside the
/// requested range or not in strictly ascending key order.
fn check_batch(request: &SearchRequest, batch: SearchBatch) -> Result<SearchBatch> {
    let mut prev: Option<BtrfsKey> = None;
    for item in &batch.items {
        let key = item.header.key;
        if key < request.min_key || key > request.max_key {
            return Err(BgsError::Corruption {
                location: key.objectid,
                detail: format!(
                    "item {key} outside searched range {}..={}",
                    request.min_key, request.max_key
                ),
            });
        }
        if prev.is_some_and(|prev| prev >= key) {
            return Err(BgsError::Corruption {
                location: key.objectid,
                detail: format!("item {key} out of key order"),
            });
        }
        prev = Some(key);
    }
    Ok(batch)
}

fn search_failed(tree_id: TreeId, key: BtrfsKey, source: BgsError) -> BgsError {
    BgsError::search_failed(tree_id.get(), (key.objectid, key.item_type, key.offset), source)
}
