//! Tree search on a mounted filesystem via `BTRFS_IOC_TREE_SEARCH_V2`.

use crate::{SearchBatch, SearchItem, SearchRequest, SearchTransport};
use bgs_btrfs::parse_to_bgs_error;
use bgs_error::{BgsError, Result};
use bgs_ondisk::{
    SEARCH_ARGS_V2_FIXED_SIZE, SEARCH_KEY_SIZE, SearchKeyArgs, parse_search_results,
};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::trace;

const BTRFS_IOCTL_MAGIC: u64 = 0x94;
const IOC_READ_WRITE: u64 = 3;

/// `_IOWR(BTRFS_IOCTL_MAGIC, 17, struct btrfs_ioctl_search_args_v2)`.
pub const BTRFS_IOC_TREE_SEARCH_V2: u64 = (IOC_READ_WRITE << 30)
    | ((SEARCH_ARGS_V2_FIXED_SIZE as u64) << 16)
    | (BTRFS_IOCTL_MAGIC << 8)
    | 17;

/// Largest result buffer the kernel accepts for one search.
pub const MAX_SEARCH_BUFFER: usize = 16 * 1024 * 1024;

/// A directory handle on a mounted btrfs filesystem.
///
/// Searching needs `CAP_SYS_ADMIN`; opening the handle does not.
#[derive(Debug)]
pub struct IoctlTransport {
    dir: File,
    path: PathBuf,
}

impl IoctlTransport {
    /// Open `path` (normally the mount point) read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let dir = File::open(path).map_err(|source| BgsError::HandleAcquisition {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SearchTransport for IoctlTransport {
    fn search(&self, request: &SearchRequest) -> Result<SearchBatch> {
        if request.buffer_budget > MAX_SEARCH_BUFFER {
            return Err(BgsError::Format(format!(
                "search buffer of {} bytes exceeds {MAX_SEARCH_BUFFER}",
                request.buffer_budget
            )));
        }

        let key = SearchKeyArgs::new(request.tree_id.get(), request.min_key, request.max_key);
        let mut args = SearchArgs::new(&key, request.buffer_budget);
        tree_search_v2(self.dir.as_raw_fd(), &mut args.words).map_err(ioctl_error)?;

        let bytes = args.to_bytes();
        let returned = SearchKeyArgs::returned_items(&bytes[..SEARCH_KEY_SIZE])
            .map_err(|e| parse_to_bgs_error(&e))?;
        let results =
            &bytes[SEARCH_ARGS_V2_FIXED_SIZE..SEARCH_ARGS_V2_FIXED_SIZE + request.buffer_budget];
        let items = parse_search_results(results, returned)
            .map_err(|e| parse_to_bgs_error(&e))?
            .into_iter()
            .map(|(header, data)| SearchItem::new(header.key, header.transid, data))
            .collect::<Result<Vec<_>>>()?;
        trace!(
            tree_id = request.tree_id.get(),
            min_key = %request.min_key,
            returned,
            "tree search"
        );

        // The kernel does not say why it stopped filling the buffer, so
        // only an empty answer proves the range is exhausted.
        let exhausted = items.is_empty();
        Ok(SearchBatch { items, exhausted })
    }
}

/// The search needs `CAP_SYS_ADMIN`; every other failure keeps its errno.
fn ioctl_error(err: io::Error) -> BgsError {
    match err.raw_os_error() {
        Some(libc::EPERM | libc::EACCES) => BgsError::PermissionDenied,
        _ => BgsError::Io(err),
    }
}

/// `btrfs_ioctl_search_args_v2` with `buf_size` bytes of result space,
/// backed by `u64` words for the struct's 8-byte alignment.
struct SearchArgs {
    words: Vec<u64>,
}

impl SearchArgs {
    fn new(key: &SearchKeyArgs, buf_size: usize) -> Self {
        let total = SEARCH_ARGS_V2_FIXED_SIZE + buf_size;
        let mut words = vec![0_u64; total.div_ceil(8)];
        for (word, chunk) in words.iter_mut().zip(key.encode().chunks_exact(8)) {
            let mut raw = [0_u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_ne_bytes(raw);
        }
        words[SEARCH_KEY_SIZE / 8] = buf_size as u64;
        Self { words }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|word| word.to_ne_bytes()).collect()
    }
}

#[allow(unsafe_code)]
fn tree_search_v2(fd: RawFd, words: &mut [u64]) -> io::Result<()> {
    // SAFETY: `words` is an exclusively borrowed, 8-byte aligned buffer
    // holding a search key, a `buf_size` no larger than the space that
    // follows it, and that space. The kernel reads and writes only within
    // those bounds.
    let ret = unsafe {
        libc::ioctl(
            fd,
            BTRFS_IOC_TREE_SEARCH_V2 as _,
            words.as_mut_ptr().cast::<libc::c_void>(),
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
