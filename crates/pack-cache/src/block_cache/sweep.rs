//! Size-bounding sweep of a block cache directory

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::types::SweepStats;

/// A regular file directly inside a cache directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// List the regular files directly inside `dir`. A missing directory is empty.
pub async fn scan_directory(dir: &Path) -> Result<Vec<CacheFile>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CacheError::io("can't list cache directory", e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CacheError::io("can't list cache directory", e))?
    {
        if let Some(file) = cache_file(entry.path(), entry.metadata().await) {
            files.push(file);
        }
    }

    Ok(files)
}

/// Turn a directory entry into a sweep candidate. Entries that can't be
/// inspected are skipped so one bad file doesn't stop eviction of the rest.
fn cache_file(path: PathBuf, metadata: std::io::Result<std::fs::Metadata>) -> Option<CacheFile> {
    let metadata = match metadata {
        Ok(m) if m.is_file() => m,
        Ok(_) => return None,
        // removed by another process between listing and stat
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "can't stat cache entry, skipping");
            return None;
        }
    };

    match metadata.modified() {
        Ok(modified) => Some(CacheFile {
            path,
            size: metadata.len(),
            modified,
        }),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "can't read cache entry mtime, skipping");
            None
        }
    }
}

/// Evict the oldest files (by modification time) until the directory holds at
/// most `max_size_bytes`.
pub async fn sweep_directory(dir: &Path, max_size_bytes: u64) -> Result<SweepStats> {
    let mut files = scan_directory(dir).await?;
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

    let mut total: u64 = files.iter().map(|f| f.size).sum();
    let mut stats = SweepStats::default();

    for file in &files {
        if total <= max_size_bytes {
            break;
        }

        match fs::remove_file(&file.path).await {
            Ok(()) => {
                total -= file.size;
                stats.evicted_files += 1;
                stats.evicted_bytes += file.size;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                total -= file.size;
            }
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "unable to evict cache entry");
            }
        }
    }

    stats.retained_files = files.len() - stats.evicted_files;
    stats.retained_bytes = total;

    debug!(
        dir = %dir.display(),
        retained_files = stats.retained_files,
        retained_bytes = stats.retained_bytes,
        evicted_files = stats.evicted_files,
        evicted_bytes = stats.evicted_bytes,
        "swept cache directory"
    );

    Ok(stats)
}
