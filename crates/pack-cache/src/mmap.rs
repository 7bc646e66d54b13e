//! Read-only memory-mapped file access with retry
//!
//! Right after a file is renamed into place some platforms and network
//! filesystems briefly refuse to open or map it. Opening is retried with
//! exponential back-off to ride out that window.

use std::path::Path;
use std::time::Duration;

use memmap2::Mmap;
use tracing::debug;

use crate::error::{CacheError, Result};

/// Back-off schedule for mapped opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubled after each one
    pub starting_delay: Duration,
}

impl Default for RetryPolicy {
    // retry delays: 10, 20, 40, 80, 160, 320, 640, 1280 ms, total ~2.5s
    fn default() -> Self {
        Self {
            max_retries: 8,
            starting_delay: Duration::from_millis(10),
        }
    }
}

/// Open and map `path` read-only in a single attempt.
pub fn map_file(path: &Path) -> std::io::Result<Mmap> {
    let file = std::fs::File::open(path)?;
    // SAFETY: cache files are published by rename and never modified in place,
    // so the mapped bytes do not change underneath us.
    unsafe { Mmap::map(&file) }
}

/// Map `path` read-only, retrying failed opens according to `policy`.
pub async fn open_mapped_with_retry(path: &Path, policy: RetryPolicy) -> Result<Mmap> {
    open_with_retry(path, policy, map_file).await
}

/// Retry loop behind [`open_mapped_with_retry`], generic over the opener.
pub async fn open_with_retry<T, F>(path: &Path, policy: RetryPolicy, mut open: F) -> Result<T>
where
    F: FnMut(&Path) -> std::io::Result<T>,
{
    let mut result = open(path);
    let mut next_delay = policy.starting_delay;
    let mut retry_count = 0;

    while let Err(e) = &result {
        if retry_count >= policy.max_retries {
            break;
        }
        retry_count += 1;
        debug!(
            retry = retry_count,
            path = %path.display(),
            error = %e,
            "unable to mmap file, retrying"
        );
        tokio::time::sleep(next_delay).await;
        next_delay *= 2;
        result = open(path);
    }

    result.map_err(|source| CacheError::Mmap {
        path: path.to_path_buf(),
        source,
    })
}
