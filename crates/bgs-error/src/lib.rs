#![forbid(unsafe_code)]
//! Error types for the block-group scanner.
//!
//! # Error Taxonomy
//!
//! Two layers, mirroring the crate graph:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `bgs-types` | Byte-level violations in superblocks, nodes, ioctl buffers |
//! | Runtime | `BgsError` | `bgs-error` (this crate) | Everything surfaced to the CLI and library callers |
//!
//! `bgs-error` does not depend on `bgs-types`; parse failures are carried
//! as `BgsError::Parse(String)` and converted where both crates are visible.
//!
//! ## Fatal Conditions
//!
//! | Condition | Variant | When |
//! |-----------|---------|------|
//! | Bad command line | `Usage` | Missing mount point, unknown flag |
//! | Cannot open the path | `HandleAcquisition` | Path missing, not readable |
//! | Search call failed | `SearchFailed` | Any transport error during enumeration |
//!
//! None of these are retried. `SearchFailed` wraps the transport's own
//! error as its source so the errno survives.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BgsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The command line could not be interpreted.
    #[error("usage: {0}")]
    Usage(String),

    /// The given path could not be opened as a filesystem handle.
    #[error("cannot open {}", path.display())]
    HandleAcquisition {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A tree search failed; enumeration stops at the key that was being
    /// searched from.
    #[error("tree search failed in tree {tree_id} from key ({objectid} {item_type} {offset})")]
    SearchFailed {
        tree_id: u64,
        objectid: u64,
        item_type: u8,
        offset: u64,
        #[source]
        source: Box<BgsError>,
    },

    /// Metadata read back from the tree or the search transport violates
    /// its own structure (out-of-order keys, truncated records).
    #[error("corrupt metadata at {location}: {detail}")]
    Corruption { location: u64, detail: String },

    /// Invalid on-disk format or an invalid configuration value.
    #[error("invalid format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    #[error("parse error: {0}")]
    Parse(String),

    /// Tree or item that was asked for does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The tree search ioctl requires `CAP_SYS_ADMIN`.
    #[error("permission denied")]
    PermissionDenied,
}

impl BgsError {
    /// Wrap a transport failure with the search position it happened at.
    #[must_use]
    pub fn search_failed(tree_id: u64, key: (u64, u8, u64), source: Self) -> Self {
        Self::SearchFailed {
            tree_id,
            objectid: key.0,
            item_type: key.1,
            offset: key.2,
            source: Box::new(source),
        }
    }

    /// POSIX errno for this error, used as the process exit detail and for
    /// log fields.
    ///
    /// Exhaustive on purpose: a new variant does not compile until it has
    /// an errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::HandleAcquisition { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::SearchFailed { source, .. } => source.to_errno(),
            Self::Usage(_) | Self::Format(_) | Self::Parse(_) => libc::EINVAL,
            Self::Corruption { .. } => libc::EIO,
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied => libc::EPERM,
        }
    }
}

/// Result alias using `BgsError`.
pub type Result<T> = std::result::Result<T, BgsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(BgsError, libc::c_int)> = vec![
            (BgsError::Io(std::io::Error::other("test")), libc::EIO),
            (BgsError::Usage("missing mount point".into()), libc::EINVAL),
            (
                BgsError::HandleAcquisition {
                    path: PathBuf::from("/mnt/missing"),
                    source: std::io::Error::from_raw_os_error(libc::ENOENT),
                },
                libc::ENOENT,
            ),
            (
                BgsError::search_failed(2, (0, 0, 0), BgsError::PermissionDenied),
                libc::EPERM,
            ),
            (
                BgsError::Corruption {
                    location: 4096,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (BgsError::Format("test".into()), libc::EINVAL),
            (BgsError::Parse("test".into()), libc::EINVAL),
            (BgsError::NotFound("tree 9".into()), libc::ENOENT),
            (BgsError::PermissionDenied, libc::EPERM),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn search_failed_keeps_inner_errno() {
        let inner = BgsError::Io(std::io::Error::from_raw_os_error(libc::ENOTTY));
        let err = BgsError::search_failed(2, (100, 192, 0), inner);
        assert_eq!(err.to_errno(), libc::ENOTTY);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn display_formatting() {
        let err = BgsError::search_failed(2, (800, 192, 0), BgsError::PermissionDenied);
        assert_eq!(
            err.to_string(),
            "tree search failed in tree 2 from key (800 192 0)"
        );
        let cause = std::error::Error::source(&err).expect("source");
        assert_eq!(cause.to_string(), "permission denied");

        let open = BgsError::HandleAcquisition {
            path: PathBuf::from("/mnt/data"),
            source: std::io::Error::other("boom"),
        };
        assert_eq!(open.to_string(), "cannot open /mnt/data");
        let cause = std::error::Error::source(&open).expect("source");
        assert_eq!(cause.to_string(), "boom");

        let io = BgsError::search_failed(
            2,
            (0, 0, 0),
            BgsError::Io(std::io::Error::from_raw_os_error(libc::ENOTTY)),
        );
        let mut chain = Vec::new();
        let mut next: Option<&dyn std::error::Error> = Some(&io);
        while let Some(err) = next {
            chain.push(err.to_string());
            next = err.source();
        }
        assert_eq!(chain.len(), 2, "{chain:?}");
        assert!(chain[1].contains("os error"), "{chain:?}");

        let usage = BgsError::Usage("missing <mountpoint>".into());
        assert_eq!(usage.to_string(), "usage: missing <mountpoint>");

        let corrupt = BgsError::Corruption {
            location: 12,
            detail: "keys out of order".into(),
        };
        assert_eq!(
            corrupt.to_string(),
            "corrupt metadata at 12: keys out of order"
        );
    }
}
