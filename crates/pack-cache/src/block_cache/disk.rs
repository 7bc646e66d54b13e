//! Disk-resident block cache
//!
//! Entries are stored directly in the cache directory under a keyed hash of the
//! block id and requested range, so names can't be predicted or forged without
//! the secret. Every file carries an HMAC trailer over its payload and is
//! discarded on mismatch. A background task keeps the directory under its size
//! ceiling by evicting the oldest files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use moka::future::Cache;
use sha2::Sha256;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::sweep::sweep_directory;
use super::{BlockCache, INDEX_BLOB_PREFIX};
use crate::atomic::{publish, write_temp_file};
use crate::error::{CacheError, Result};
use crate::storage::BlobStorage;
use crate::types::{BlobInfo, CacheStats, CachingOptions, SweepStats};

type HmacSha256 = Hmac<Sha256>;

/// Period between background sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Bytes of HMAC-SHA256 appended to every cached payload
pub const HMAC_TRAILER_SIZE: usize = 32;

pub struct DiskBlockCache {
    storage: Arc<dyn BlobStorage>,
    dir: PathBuf,
    max_size_bytes: u64,
    mac: HmacSha256,
    list_cache: Option<Cache<&'static str, Arc<Vec<BlobInfo>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl DiskBlockCache {
    /// Open the cache described by `options`, sweep it once, and start the
    /// periodic sweeper.
    pub async fn open(storage: Arc<dyn BlobStorage>, options: &CachingOptions) -> Result<Self> {
        Self::open_with_interval(storage, options, SWEEP_INTERVAL).await
    }

    pub async fn open_with_interval(
        storage: Arc<dyn BlobStorage>,
        options: &CachingOptions,
        sweep_interval: Duration,
    ) -> Result<Self> {
        let dir = options
            .enabled_directory()
            .ok_or_else(|| {
                CacheError::Config("disk block cache needs a directory and a size limit".to_string())
            })?
            .to_path_buf();

        if sweep_interval.is_zero() {
            return Err(CacheError::Config("sweep interval must be non-zero".to_string()));
        }

        let mac = HmacSha256::new_from_slice(&options.hmac_secret)
            .map_err(|e| CacheError::Config(format!("invalid HMAC secret: {}", e)))?;

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io(format!("can't create {}", dir.display()), e))?;

        let list_ttl = options.list_cache_duration();
        let list_cache = (!list_ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(16)
                .time_to_live(list_ttl)
                .build()
        });

        let max_size_bytes = options.max_cache_size_bytes;

        // don't start life with an unbounded leftover cache
        sweep_logged(&dir, max_size_bytes).await;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let sweeper = spawn_sweeper(dir.clone(), max_size_bytes, sweep_interval, shutdown_rx);

        info!(
            dir = %dir.display(),
            max_size_bytes,
            list_cache_secs = list_ttl.as_secs(),
            "disk block cache opened"
        );

        Ok(Self {
            storage,
            dir,
            max_size_bytes,
            mac,
            list_cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shutdown: Mutex::new(Some(shutdown_tx)),
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// File name of the entry for a block range
    pub(crate) fn cache_key(&self, block_id: &str, offset: u64, length: Option<u64>) -> String {
        let length = length.map_or_else(|| "all".to_string(), |l| l.to_string());
        let mut mac = self.mac.clone();
        mac.update(format!("{}:{}:{}", block_id, offset, length).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        let mut out = Vec::with_capacity(payload.len() + HMAC_TRAILER_SIZE);
        out.extend_from_slice(payload);
        out.extend_from_slice(&mac.finalize().into_bytes());
        out
    }

    fn verify_and_strip(&self, mut stored: Vec<u8>) -> Option<Vec<u8>> {
        if stored.len() < HMAC_TRAILER_SIZE {
            return None;
        }
        let payload_len = stored.len() - HMAC_TRAILER_SIZE;
        let mut mac = self.mac.clone();
        mac.update(&stored[..payload_len]);
        mac.verify_slice(&stored[payload_len..]).ok()?;
        stored.truncate(payload_len);
        Some(stored)
    }

    /// Read a verified entry. Any local failure is a miss.
    async fn read_cached(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.dir.join(key);
        let stored = match tokio::fs::read(&path).await {
            Ok(stored) => stored,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(key, error = %e, "failed to read cached block");
                return None;
            }
        };

        match self.verify_and_strip(stored) {
            Some(payload) => Some(payload),
            None => {
                warn!(key, "cached block failed verification, removing");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(key, error = %e, "unable to remove corrupt cache entry");
                    }
                }
                None
            }
        }
    }

    async fn write_cached(&self, key: &str, data: &[u8]) -> Result<()> {
        let tmp = write_temp_file(self.dir.clone(), self.sign(data)).await?;
        publish(tmp, &self.dir.join(key), key).await
    }

    async fn populate(&self, block_id: &str, key: &str, data: &[u8]) {
        if let Err(e) = self.write_cached(key, data).await {
            warn!(block_id, error = %e, "failed to cache block");
        }
    }

    async fn lookup(&self, block_id: &str, offset: u64, length: Option<u64>) -> Option<Vec<u8>> {
        if let Some(data) = self.read_cached(&self.cache_key(block_id, offset, length)).await {
            return Some(data);
        }

        if offset == 0 && length.is_none() {
            return None;
        }

        // a cached full block can answer any range inside it
        let full = self.read_cached(&self.cache_key(block_id, 0, None)).await?;
        let start = usize::try_from(offset).ok()?;
        let end = match length {
            Some(len) => start.checked_add(usize::try_from(len).ok()?)?,
            None => full.len(),
        };
        full.get(start..end).map(|range| range.to_vec())
    }

    async fn invalidate_list_cache(&self) {
        if let Some(list_cache) = &self.list_cache {
            list_cache.invalidate(INDEX_BLOB_PREFIX).await;
        }
    }
}

/// Sweep `dir`, logging instead of failing. Returns `None` when the sweep failed.
async fn sweep_logged(dir: &Path, max_size_bytes: u64) -> Option<SweepStats> {
    match sweep_directory(dir, max_size_bytes).await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cache sweep failed");
            None
        }
    }
}

fn spawn_sweeper(
    dir: PathBuf,
    max_size_bytes: u64,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // fires on close() and when the cache is dropped
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    sweep_logged(&dir, max_size_bytes).await;
                }
            }
        }

        debug!(dir = %dir.display(), "cache sweeper stopped");
    })
}

#[async_trait]
impl BlockCache for DiskBlockCache {
    async fn get_block(&self, block_id: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        if let Some(data) = self.lookup(block_id, offset, length).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(block_id, offset, "block cache hit");
            return Ok(data);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let data = self.storage.get_blob(block_id, offset, length).await?;

        let key = self.cache_key(block_id, offset, length);
        self.populate(block_id, &key, &data).await;

        Ok(data)
    }

    async fn put_block(&self, block_id: &str, data: &[u8]) -> Result<()> {
        self.storage.put_blob(block_id, data).await?;

        if block_id.starts_with(INDEX_BLOB_PREFIX) {
            self.invalidate_list_cache().await;
        }

        let key = self.cache_key(block_id, 0, None);
        self.populate(block_id, &key, data).await;
        Ok(())
    }

    async fn list_index_blocks(&self) -> Result<Vec<BlobInfo>> {
        let Some(list_cache) = &self.list_cache else {
            return Ok(self.storage.list_blobs(INDEX_BLOB_PREFIX).await?);
        };

        if let Some(cached) = list_cache.get(INDEX_BLOB_PREFIX).await {
            debug!(count = cached.len(), "using cached index listing");
            return Ok(cached.as_ref().clone());
        }

        let blobs = self.storage.list_blobs(INDEX_BLOB_PREFIX).await?;
        list_cache
            .insert(INDEX_BLOB_PREFIX, Arc::new(blobs.clone()))
            .await;
        Ok(blobs)
    }

    async fn close(&self) {
        let shutdown = self.shutdown.lock().ok().and_then(|mut s| s.take());
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }

        let sweeper = self.sweeper.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "cache sweeper task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use crate::testutil::{set_mtime, MemoryStorage};
    use chrono::Utc;
    use tempfile::tempdir;

    fn storage() -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::with_blobs([
            ("p1", &b"0123456789abcdef"[..]),
            ("n1", &b"index-one"[..]),
        ]))
    }

    fn options(dir: &Path) -> CachingOptions {
        CachingOptions::new(dir, 1 << 20).with_hmac_secret(b"secret".to_vec())
    }

    fn cache_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_file())
            .collect()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let dir = tempdir().unwrap();
        let storage = storage();
        let cache = DiskBlockCache::open(storage.clone(), &options(dir.path()))
            .await
            .unwrap();

        assert_eq!(cache.get_block("p1", 4, Some(4)).await.unwrap(), b"4567");
        assert_eq!(cache.get_block("p1", 4, Some(4)).await.unwrap(), b"4567");

        assert_eq!(storage.gets(), 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
        assert_eq!(cache_files(dir.path()).len(), 1);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_entries_are_named_by_keyed_hash() {
        let dir = tempdir().unwrap();
        let cache = DiskBlockCache::open(storage(), &options(dir.path()))
            .await
            .unwrap();
        cache.get_block("p1", 0, None).await.unwrap();

        let key = cache.cache_key("p1", 0, None);
        assert_eq!(key.len(), 64);
        assert!(!key.contains("p1"));
        assert!(dir.path().join(&key).exists());

        let other_dir = tempdir().unwrap();
        let other = DiskBlockCache::open(
            storage(),
            &CachingOptions::new(other_dir.path(), 1 << 20).with_hmac_secret(b"other".to_vec()),
        )
        .await
        .unwrap();
        assert_ne!(other.cache_key("p1", 0, None), key);
    }

    #[tokio::test]
    async fn test_range_served_from_cached_full_block() {
        let dir = tempdir().unwrap();
        let storage = storage();
        let cache = DiskBlockCache::open(storage.clone(), &options(dir.path()))
            .await
            .unwrap();

        cache.get_block("p1", 0, None).await.unwrap();
        assert_eq!(cache.get_block("p1", 10, Some(6)).await.unwrap(), b"abcdef");
        assert_eq!(cache.get_block("p1", 12, None).await.unwrap(), b"cdef");
        assert_eq!(storage.gets(), 1);

        // out of range falls through to storage
        cache.get_block("p1", 12, Some(100)).await.unwrap();
        assert_eq!(storage.gets(), 2);
    }

    #[tokio::test]
    async fn test_tampered_entry_is_refetched() {
        let dir = tempdir().unwrap();
        let storage = storage();
        let cache = DiskBlockCache::open(storage.clone(), &options(dir.path()))
            .await
            .unwrap();

        cache.get_block("p1", 0, None).await.unwrap();
        let path = dir.path().join(cache.cache_key("p1", 0, None));
        let mut stored = std::fs::read(&path).unwrap();
        stored[0] ^= 0xff;
        std::fs::write(&path, &stored).unwrap();

        assert_eq!(cache.get_block("p1", 0, None).await.unwrap(), b"0123456789abcdef");
        assert_eq!(storage.gets(), 2);
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_storage_errors_propagate() {
        let dir = tempdir().unwrap();
        let cache = DiskBlockCache::open(storage(), &options(dir.path()))
            .await
            .unwrap();

        let err = cache.get_block("nope", 0, None).await.unwrap_err();
        assert!(matches!(err, CacheError::Storage(StorageError::NotFound(ref id)) if id == "nope"));
        assert!(cache_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_put_writes_through_and_populates() {
        let dir = tempdir().unwrap();
        let storage = storage();
        let cache = DiskBlockCache::open(storage.clone(), &options(dir.path()))
            .await
            .unwrap();

        cache.put_block("p2", b"fresh pack").await.unwrap();
        assert!(storage.contains("p2"));

        assert_eq!(cache.get_block("p2", 0, None).await.unwrap(), b"fresh pack");
        assert_eq!(storage.gets(), 0);
    }

    #[tokio::test]
    async fn test_list_is_cached_until_index_put() {
        let dir = tempdir().unwrap();
        let storage = storage();
        let cache = DiskBlockCache::open(
            storage.clone(),
            &options(dir.path()).with_list_cache_duration(600),
        )
        .await
        .unwrap();

        assert_eq!(cache.list_index_blocks().await.unwrap().len(), 1);
        assert_eq!(cache.list_index_blocks().await.unwrap().len(), 1);
        assert_eq!(storage.lists(), 1);

        // pack writes keep the listing
        cache.put_block("p9", b"pack").await.unwrap();
        cache.list_index_blocks().await.unwrap();
        assert_eq!(storage.lists(), 1);

        cache.put_block("n2", b"index-two").await.unwrap();
        let listed = cache.list_index_blocks().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(storage.lists(), 2);
    }

    #[tokio::test]
    async fn test_list_cache_expires() {
        let dir = tempdir().unwrap();
        let storage = storage();
        let cache = DiskBlockCache::open(
            storage.clone(),
            &options(dir.path()).with_list_cache_duration(1),
        )
        .await
        .unwrap();

        cache.list_index_blocks().await.unwrap();
        cache.list_index_blocks().await.unwrap();
        assert_eq!(storage.lists(), 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        cache.list_index_blocks().await.unwrap();
        assert_eq!(storage.lists(), 2);
    }

    #[tokio::test]
    async fn test_zero_list_duration_disables_list_cache() {
        let dir = tempdir().unwrap();
        let storage = storage();
        let cache = DiskBlockCache::open(storage.clone(), &options(dir.path()))
            .await
            .unwrap();

        cache.list_index_blocks().await.unwrap();
        cache.list_index_blocks().await.unwrap();
        assert_eq!(storage.lists(), 2);
    }

    #[tokio::test]
    async fn test_open_sweeps_existing_oversized_cache() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        for (i, name) in ["oldest", "older", "newest"].iter().enumerate() {
            let path = dir.path().join(name);
            std::fs::write(&path, vec![0u8; 100]).unwrap();
            set_mtime(&path, now - chrono::Duration::minutes(30 - i as i64 * 10));
        }

        let options = CachingOptions::new(dir.path(), 150);
        let cache = DiskBlockCache::open(storage(), &options).await.unwrap();

        let remaining = cache_files(dir.path());
        assert_eq!(remaining, vec![dir.path().join("newest")]);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_failed_sweep_is_not_fatal() {
        let dir = tempdir().unwrap();
        let not_a_dir = dir.path().join("file");
        std::fs::write(&not_a_dir, b"x").unwrap();

        assert!(sweep_directory(&not_a_dir, 10).await.is_err());
        assert_eq!(sweep_logged(&not_a_dir, 10).await, None);

        std::fs::write(dir.path().join("entry"), vec![0u8; 40]).unwrap();
        let stats = sweep_logged(dir.path(), 0).await.unwrap();
        assert_eq!(stats.evicted_files, 2);
    }

    #[tokio::test]
    async fn test_background_sweep_bounds_size() {
        let dir = tempdir().unwrap();
        // each entry is 20 bytes of payload plus the trailer
        let options = CachingOptions::new(dir.path(), 120);
        let cache = DiskBlockCache::open_with_interval(storage(), &options, Duration::from_millis(50))
            .await
            .unwrap();

        for i in 0..5 {
            cache.put_block(&format!("p-{}", i), &[7u8; 20]).await.unwrap();
        }
        assert_eq!(cache_files(dir.path()).len(), 5);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let files = cache_files(dir.path());
        let total: u64 = files
            .iter()
            .map(|p| std::fs::metadata(p).unwrap().len())
            .sum();
        assert_eq!(files.len(), 2);
        assert!(total <= 120, "cache holds {} bytes", total);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_sweeper() {
        let dir = tempdir().unwrap();
        let options = CachingOptions::new(dir.path(), 50);
        let cache = DiskBlockCache::open_with_interval(storage(), &options, Duration::from_millis(20))
            .await
            .unwrap();

        cache.close().await;
        assert!(cache.sweeper.lock().unwrap().is_none());

        for i in 0..5 {
            cache.put_block(&format!("p-{}", i), &[7u8; 20]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache_files(dir.path()).len(), 5);

        // closing twice is harmless
        cache.close().await;
    }
}
