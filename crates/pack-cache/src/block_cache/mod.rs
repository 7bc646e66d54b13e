//! Block cache in front of remote storage
//!
//! Two implementations behind one trait: [`NullBlockCache`] when caching is
//! disabled and [`DiskBlockCache`] otherwise. [`new_block_cache`] picks one from
//! [`CachingOptions`] at construction.

mod disk;
mod null;
mod sweep;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::storage::BlobStorage;
use crate::types::{BlobInfo, CachingOptions};

pub use disk::{DiskBlockCache, HMAC_TRAILER_SIZE, SWEEP_INTERVAL};
pub use null::NullBlockCache;
pub use sweep::{scan_directory, sweep_directory, CacheFile};

/// Id prefix of index blobs in remote storage
pub const INDEX_BLOB_PREFIX: &str = "n";

#[async_trait]
pub trait BlockCache: Send + Sync {
    /// Read `length` bytes of a block starting at `offset` (`None` = to the end)
    async fn get_block(&self, block_id: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>>;

    async fn put_block(&self, block_id: &str, data: &[u8]) -> Result<()>;

    /// List index blobs in remote storage
    async fn list_index_blocks(&self) -> Result<Vec<BlobInfo>>;

    /// Stop background work. Further calls still work.
    async fn close(&self) {}
}

/// Build the block cache described by `options`.
pub async fn new_block_cache(
    storage: Arc<dyn BlobStorage>,
    options: &CachingOptions,
) -> Result<Box<dyn BlockCache>> {
    if !options.caching_enabled() {
        info!("local block cache disabled");
        return Ok(Box::new(NullBlockCache::new(storage)));
    }

    let cache = DiskBlockCache::open(storage, options).await?;
    Ok(Box::new(cache))
}
