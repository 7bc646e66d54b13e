//! Cache maintenance commands

use std::path::{Path, PathBuf};

use pack_cache::block_cache::{scan_directory, sweep_directory};
use pack_cache::{CachingOptions, CommittedIndexCache, SweepStats};
use serde::Serialize;
use tracing::info;

use crate::error::{CliError, Result};

/// Summary printed by `info`
#[derive(Debug, Serialize)]
pub struct InfoReport {
    pub cache_dir: PathBuf,
    pub max_size_bytes: u64,
    pub block_files: usize,
    pub block_bytes: u64,
    pub index_blobs: usize,
    pub index_bytes: u64,
}

fn block_dir(options: &CachingOptions) -> Result<&Path> {
    options
        .cache_directory
        .as_deref()
        .filter(|dir| !dir.as_os_str().is_empty())
        .ok_or_else(|| CliError::Config("no cache directory configured".to_string()))
}

fn index_cache(options: &CachingOptions) -> Result<CommittedIndexCache> {
    let dir = options
        .index_cache_dir()
        .ok_or_else(|| CliError::Config("no cache directory configured".to_string()))?;
    Ok(CommittedIndexCache::new(dir, 0))
}

pub async fn info(options: &CachingOptions) -> Result<InfoReport> {
    let dir = block_dir(options)?;
    let blocks = scan_directory(dir).await?;
    let indexes = index_cache(options)?.list_cached().await?;

    Ok(InfoReport {
        cache_dir: dir.to_path_buf(),
        max_size_bytes: options.max_cache_size_bytes,
        block_files: blocks.len(),
        block_bytes: blocks.iter().map(|f| f.size).sum(),
        index_blobs: indexes.len(),
        index_bytes: indexes.iter().map(|b| b.size).sum(),
    })
}

/// Run one size-bounding sweep with the configured ceiling
pub async fn sweep(options: &CachingOptions) -> Result<SweepStats> {
    let dir = options.enabled_directory().ok_or_else(|| {
        CliError::Config("caching is disabled (zero size limit), refusing to sweep".to_string())
    })?;
    let stats = sweep_directory(dir, options.max_cache_size_bytes).await?;
    info!(
        evicted_files = stats.evicted_files,
        evicted_bytes = stats.evicted_bytes,
        "sweep complete"
    );
    Ok(stats)
}

/// Remove every cached block; committed index blobs are kept
pub async fn clear(options: &CachingOptions) -> Result<SweepStats> {
    let dir = block_dir(options)?;
    let stats = sweep_directory(dir, 0).await?;
    info!(evicted_files = stats.evicted_files, "block cache cleared");
    Ok(stats)
}

/// Expire unused committed index blobs, keeping `keep`
pub async fn expire_index(options: &CachingOptions, keep: &[String]) -> Result<usize> {
    let removed = index_cache(options)?.expire_unused(keep).await?;
    info!(removed, kept = keep.len(), "expired unused index blobs");
    Ok(removed)
}
