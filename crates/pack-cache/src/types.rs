//! Cache types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the committed-index directory inside the cache directory
pub const INDEX_CACHE_SUBDIR: &str = "indexes";

/// Configuration of the local cache.
///
/// Caching is disabled unless both a directory and a non-zero size ceiling are set.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_directory: Option<PathBuf>,
    #[serde(default, rename = "maxCacheSize", skip_serializing_if = "is_zero")]
    pub max_cache_size_bytes: u64,
    #[serde(default, rename = "maxListCacheDuration", skip_serializing_if = "is_zero")]
    pub max_list_cache_duration_secs: u64,
    /// Key for cache-entry names and integrity trailers. Never persisted.
    #[serde(skip)]
    pub hmac_secret: Vec<u8>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl CachingOptions {
    pub fn new(cache_directory: impl Into<PathBuf>, max_cache_size_bytes: u64) -> Self {
        Self {
            cache_directory: Some(cache_directory.into()),
            max_cache_size_bytes,
            ..Self::default()
        }
    }

    pub fn with_list_cache_duration(mut self, secs: u64) -> Self {
        self.max_list_cache_duration_secs = secs;
        self
    }

    pub fn with_hmac_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.hmac_secret = secret.into();
        self
    }

    /// Returns the cache directory when block caching should be enabled
    pub fn enabled_directory(&self) -> Option<&Path> {
        match &self.cache_directory {
            Some(dir) if self.max_cache_size_bytes > 0 && !dir.as_os_str().is_empty() => {
                Some(dir.as_path())
            }
            _ => None,
        }
    }

    pub fn caching_enabled(&self) -> bool {
        self.enabled_directory().is_some()
    }

    pub fn list_cache_duration(&self) -> Duration {
        Duration::from_secs(self.max_list_cache_duration_secs)
    }

    /// Directory for committed index blobs, if a cache directory is configured
    pub fn index_cache_dir(&self) -> Option<PathBuf> {
        self.cache_directory
            .as_ref()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| dir.join(INDEX_CACHE_SUBDIR))
    }
}

impl fmt::Debug for CachingOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingOptions")
            .field("cache_directory", &self.cache_directory)
            .field("max_cache_size_bytes", &self.max_cache_size_bytes)
            .field(
                "max_list_cache_duration_secs",
                &self.max_list_cache_duration_secs,
            )
            .field("hmac_secret", &"<redacted>")
            .finish()
    }
}

/// Metadata for a blob in remote storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub id: String,
    pub length: u64,
    pub timestamp: DateTime<Utc>,
}

/// Statistics about the block cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Outcome of one size-bounding sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    pub retained_files: usize,
    pub retained_bytes: u64,
    pub evicted_files: usize,
    pub evicted_bytes: u64,
}
