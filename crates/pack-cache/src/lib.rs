//! Local caching tier for a deduplicating, content-addressable backup store
//!
//! Two disk caches sit in front of remote blob storage:
//!
//! - [`BlockCache`]: fetched pack blocks, size-bounded by a background sweep,
//!   plus a short-lived cache of index listings.
//! - [`CommittedIndexCache`]: committed content-index blobs, read through
//!   memory maps and garbage-collected by age.
//!
//! Both are safe to share between tasks and between processes pointing at the
//! same directory; files are only ever published by atomic rename.

pub mod atomic;
pub mod block_cache;
pub mod clock;
mod error;
pub mod index_cache;
pub mod mmap;
pub mod pack_index;
pub mod storage;
mod types;

#[cfg(test)]
mod testutil;

pub use block_cache::{new_block_cache, BlockCache, DiskBlockCache, NullBlockCache};
pub use clock::{Clock, SystemClock};
pub use error::{CacheError, Result};
pub use index_cache::{CachedIndexBlob, CommittedIndexCache};
pub use pack_index::{ContentInfo, PackIndex, PackIndexBuilder};
pub use storage::{BlobStorage, StorageError};
pub use types::{BlobInfo, CacheStats, CachingOptions, SweepStats, INDEX_CACHE_SUBDIR};
