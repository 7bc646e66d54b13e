//! Contract for the remote blob storage the caches sit in front of

use async_trait::async_trait;
use std::fmt;

use crate::types::BlobInfo;

/// Errors reported by remote storage. The cache never interprets these beyond
/// passing them back to the caller.
#[derive(Debug)]
pub enum StorageError {
    NotFound(String),
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(id) => write!(f, "blob not found: {}", id),
            StorageError::Backend(err) => write!(f, "Storage backend error: {}", err),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Backend(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Remote object storage holding pack blocks and index blobs.
///
/// Every call is assumed to cost a network round-trip.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Read `length` bytes of `id` starting at `offset`; `None` reads to the end.
    async fn get_blob(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>, StorageError>;

    async fn put_blob(&self, id: &str, data: &[u8]) -> Result<(), StorageError>;

    /// List all blobs whose id starts with `prefix`.
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobInfo>, StorageError>;
}
