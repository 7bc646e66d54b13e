//! Error types for the pack cache

use std::fmt;
use std::path::PathBuf;

use crate::storage::StorageError;

#[derive(Debug)]
pub enum CacheError {
    /// Local filesystem failure, with the step that failed
    Io {
        context: String,
        source: std::io::Error,
    },
    /// Memory-mapped open still failing after all retries
    Mmap {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Rename into place failed and no concurrent writer published the entry
    CommitFailed(String),
    /// Blob id that cannot be used as a cache file name
    InvalidBlobId(String),
    InvalidIndex(String),
    /// Error returned by remote storage, passed through unchanged
    Storage(StorageError),
    Config(String),
}

impl CacheError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CacheError::Io {
            context: context.into(),
            source,
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io { context, source } => write!(f, "{}: {}", context, source),
            CacheError::Mmap { path, source } => {
                write!(f, "mmap() error for {}: {}", path.display(), source)
            }
            CacheError::CommitFailed(id) => write!(f, "unsuccessful cache write of {:?}", id),
            CacheError::InvalidBlobId(id) => write!(f, "Invalid blob id: {:?}", id),
            CacheError::InvalidIndex(msg) => write!(f, "Invalid pack index: {}", msg),
            CacheError::Storage(err) => write!(f, "{}", err),
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io { source, .. } => Some(source),
            CacheError::Mmap { source, .. } => Some(source),
            CacheError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for CacheError {
    fn from(err: StorageError) -> Self {
        CacheError::Storage(err)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
