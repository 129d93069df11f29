use bgs_error::{BgsError, Result};
use bgs_ondisk::SEARCH_HEADER_SIZE;
use bgs_types::TreeId;
use serde::{Deserialize, Serialize};

/// Default result buffer for one search.
pub const SEARCH_BUFFER_BUDGET: usize = bgs_types::SZ_4K;

/// Largest buffer `TREE_SEARCH_V2` accepts.
pub const MAX_BUFFER_BUDGET: usize = 16 * 1024 * 1024;

/// Knobs of one enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Tree to enumerate; the extent tree unless the filesystem keeps block
    /// groups elsewhere.
    pub tree_id: TreeId,
    /// Bytes of search results requested per call.
    pub buffer_budget: usize,
    /// Abort with an error after this many searches.
    pub max_searches: Option<usize>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            tree_id: TreeId::EXTENT,
            buffer_budget: SEARCH_BUFFER_BUDGET,
            max_searches: None,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_budget < SEARCH_HEADER_SIZE {
            return Err(BgsError::Format(format!(
                "buffer budget {} is smaller than one {SEARCH_HEADER_SIZE}-byte search header",
                self.buffer_budget
            )));
        }
        if self.buffer_budget > MAX_BUFFER_BUDGET {
            return Err(BgsError::Format(format!(
                "buffer budget {} exceeds {MAX_BUFFER_BUDGET} bytes",
                self.buffer_budget
            )));
        }
        if self.max_searches == Some(0) {
            return Err(BgsError::Format("max_searches must be at least 1".into()));
        }
        Ok(())
    }
}
