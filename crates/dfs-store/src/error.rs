//! Store error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Every failure of a store operation, surfaced to the caller as-is.
/// Nothing is retried.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to create file {}: {source}", .path.display())]
    CreateFile { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to move {} to {}: {source}", .from.display(), .to.display())]
    Persist {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("failed to open {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("invalid content hash: {0:?}")]
    InvalidHash(String),

    #[error("no object stored under {0}")]
    NotFound(String),

    /// A path transform produced a directory outside the store.
    #[error("object directory {} is not inside the store", .0.display())]
    InvalidPath(PathBuf),

    #[error("invalid shard layout: {depth} levels of {width} hex chars (each non-zero, at most {max} chars total)")]
    InvalidLayout {
        depth: usize,
        width: usize,
        max: usize,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;
