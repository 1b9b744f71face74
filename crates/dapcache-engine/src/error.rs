//! Cache engine errors

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::lock::LockError;

/// Cache result type
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors from cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid resource id: {0}")]
    InvalidResourceId(String),

    /// Every suffix of the bucket is taken by another resource id. The
    /// hashing scheme no longer fits the load and the request must fail.
    #[error("cache error: {attempts} hash collisions for resource '{resource_id}'")]
    CollisionCeilingExceeded { resource_id: String, attempts: u32 },

    /// Reading a matching entry failed. Treat as a miss: the caller may
    /// remove the entry and derive the value again.
    #[error("corrupt cache entry {}: {}", .path.display(), .source)]
    Corrupt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("not a cache entry: {}", .0.display())]
    NotAnEntry(PathBuf),

    #[error("ledger error: {0}")]
    Ledger(String),

    /// The payload producer failed for a reason of its own.
    #[error("producer failed: {0}")]
    Producer(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    pub fn corrupt(path: &Path, source: io::Error) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn producer<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Producer(err.into())
    }

    /// True for errors the caller may treat like a cache miss.
    pub fn is_miss_equivalent(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Lock(LockError::Timeout(_)))
    }

    fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io(e) | Self::Lock(LockError::Io(e)) => Some(e.kind()),
            _ => None,
        }
    }

    pub(crate) fn is_permission_denied(&self) -> bool {
        self.io_kind() == Some(io::ErrorKind::PermissionDenied)
    }
}
