//! Passthrough used when caching is disabled

use std::sync::Arc;

use async_trait::async_trait;

use super::{BlockCache, INDEX_BLOB_PREFIX};
use crate::error::Result;
use crate::storage::BlobStorage;
use crate::types::BlobInfo;

/// Forwards every call to remote storage and keeps nothing locally
pub struct NullBlockCache {
    storage: Arc<dyn BlobStorage>,
}

impl NullBlockCache {
    pub fn new(storage: Arc<dyn BlobStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl BlockCache for NullBlockCache {
    async fn get_block(&self, block_id: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        Ok(self.storage.get_blob(block_id, offset, length).await?)
    }

    async fn put_block(&self, block_id: &str, data: &[u8]) -> Result<()> {
        Ok(self.storage.put_blob(block_id, data).await?)
    }

    async fn list_index_blocks(&self) -> Result<Vec<BlobInfo>> {
        Ok(self.storage.list_blobs(INDEX_BLOB_PREFIX).await?)
    }
}
