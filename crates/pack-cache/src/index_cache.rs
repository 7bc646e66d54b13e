//! Disk cache of committed content-index blobs
//!
//! Each committed index blob is stored once as `<blob id>.sndx` and read back
//! through a memory map. Several processes may share the directory; adds are
//! idempotent and race-safe, and unused blobs are garbage-collected by age.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::fs;
use tracing::{debug, error};

use crate::atomic::{path_exists, publish, write_temp_file};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};
use crate::mmap::{open_mapped_with_retry, RetryPolicy};
use crate::pack_index::PackIndex;

/// File suffix of committed index blobs
pub const SIMPLE_INDEX_SUFFIX: &str = ".sndx";

/// Unused index blobs younger than this are never deleted
pub const UNUSED_INDEX_CLEANUP_AGE: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// A committed index blob found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIndexBlob {
    pub id: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

pub struct CommittedIndexCache {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    per_content_overhead: u32,
    retry: RetryPolicy,
}

pub(crate) fn validate_blob_id(id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if bad {
        return Err(CacheError::InvalidBlobId(id.to_string()));
    }
    Ok(())
}

impl CommittedIndexCache {
    /// Create a cache over `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>, per_content_overhead: u32) -> Self {
        Self {
            dir: dir.into(),
            clock: Arc::new(SystemClock),
            per_content_overhead,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_blob_path(&self, index_blob_id: &str) -> Result<PathBuf> {
        validate_blob_id(index_blob_id)?;
        Ok(self
            .dir
            .join(format!("{}{}", index_blob_id, SIMPLE_INDEX_SUFFIX)))
    }

    /// Whether the blob is already cached. A missing file is not an error.
    pub async fn has_index_blob_id(&self, index_blob_id: &str) -> Result<bool> {
        let path = self.index_blob_path(index_blob_id)?;
        path_exists(&path)
            .await
            .map_err(|e| CacheError::io(format!("error checking {}", index_blob_id), e))
    }

    /// Store the blob unless it is already present.
    ///
    /// Safe to call concurrently for the same id from many tasks or processes:
    /// all callers succeed and exactly one file remains.
    pub async fn add_content_to_cache(&self, index_blob_id: &str, data: &[u8]) -> Result<()> {
        if self.has_index_blob_id(index_blob_id).await? {
            return Ok(());
        }

        let tmp = write_temp_file(self.dir.clone(), data.to_vec()).await?;
        let dest = self.index_blob_path(index_blob_id)?;
        publish(tmp, &dest, index_blob_id).await?;

        debug!(index_blob_id, size = data.len(), "cached committed index blob");
        Ok(())
    }

    /// Map the cached blob and parse it. The returned index owns the mapping.
    pub async fn open_index(&self, index_blob_id: &str) -> Result<PackIndex> {
        let path = self.index_blob_path(index_blob_id)?;
        let mmap = open_mapped_with_retry(&path, self.retry).await?;
        PackIndex::open(mmap, self.per_content_overhead)
    }

    /// All committed index blobs currently on disk
    pub async fn list_cached(&self) -> Result<Vec<CachedIndexBlob>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io("can't list cache", e)),
        };

        let mut blobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io("can't list cache", e))?
        {
            let file_name = entry.file_name();
            let Some(id) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(SIMPLE_INDEX_SUFFIX))
            else {
                continue;
            };

            // files may vanish under a concurrent expiration
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    debug!(id, error = %e, "skipping unreadable index blob");
                    continue;
                }
            };
            let modified = metadata
                .modified()
                .map_err(|e| CacheError::io(format!("can't read mtime of {}", id), e))?;

            blobs.push(CachedIndexBlob {
                id: id.to_string(),
                size: metadata.len(),
                modified: modified.into(),
            });
        }

        Ok(blobs)
    }

    /// Delete cached blobs that are not in `used` and older than
    /// [`UNUSED_INDEX_CLEANUP_AGE`]. Deletion failures are logged, never returned.
    /// Returns the number of blobs removed.
    pub async fn expire_unused<I, S>(&self, used: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let used: std::collections::HashSet<String> =
            used.into_iter().map(|s| s.as_ref().to_string()).collect();
        debug!(used = used.len(), "expireUnused");

        let max_age = Duration::from_std(UNUSED_INDEX_CLEANUP_AGE)
            .map_err(|e| CacheError::Config(e.to_string()))?;
        let now = self.clock.now();
        let mut removed = 0;

        for blob in self.list_cached().await? {
            if used.contains(&blob.id) {
                continue;
            }

            if now - blob.modified <= max_age {
                debug!(id = %blob.id, modified = %blob.modified, "keeping unused index blob because it's too new");
                continue;
            }

            debug!(id = %blob.id, modified = %blob.modified, "removing unused index blob");
            let path = self.dir.join(format!("{}{}", blob.id, SIMPLE_INDEX_SUFFIX));
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => error!(id = %blob.id, error = %e, "unable to remove unused index file"),
            }
        }

        Ok(removed)
    }
}
