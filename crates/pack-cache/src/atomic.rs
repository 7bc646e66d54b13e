//! Temp-file + rename publishing of cache entries
//!
//! A cache file only ever appears under its final name once it is fully written.
//! Writers racing on the same name converge: one rename wins and the others
//! observe the published file.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tracing::debug;

use crate::error::{CacheError, Result};

/// Prefix of in-flight temp files inside cache directories
pub const TEMP_FILE_PREFIX: &str = "tmp";

/// Write `data` to a fresh temp file inside `dir` and return its path.
///
/// If `dir` does not exist yet it is created and file creation is retried exactly
/// once. The returned [`TempPath`] deletes the file when dropped unless it is
/// persisted.
pub fn write_temp_file_atomic(dir: &Path, data: &[u8]) -> Result<TempPath> {
    let builder = {
        let mut b = tempfile::Builder::new();
        b.prefix(TEMP_FILE_PREFIX);
        b
    };

    let mut file = match builder.tempfile_in(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // A concurrent creator may win this race; the retry below decides.
            let _ = std::fs::create_dir_all(dir);
            builder.tempfile_in(dir)
        }
        other => other,
    }
    .map_err(|e| CacheError::io("can't create tmp file", e))?;

    file.write_all(data)
        .map_err(|e| CacheError::io("can't write to temp file", e))?;
    file.flush()
        .map_err(|e| CacheError::io("can't close tmp file", e))?;

    Ok(file.into_temp_path())
}

/// Async wrapper running [`write_temp_file_atomic`] on the blocking pool
pub async fn write_temp_file(dir: PathBuf, data: Vec<u8>) -> Result<TempPath> {
    tokio::task::spawn_blocking(move || write_temp_file_atomic(&dir, &data))
        .await
        .map_err(|e| CacheError::io("temp file writer panicked", std::io::Error::other(e)))?
}

pub(crate) async fn path_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Publish a fully written temp file under `dest`.
///
/// An existing destination means another writer already committed it; the temp
/// file is discarded.
pub async fn publish(tmp: TempPath, dest: &Path, name: &str) -> Result<()> {
    let exists = path_exists(dest)
        .await
        .map_err(|e| CacheError::io(format!("error checking {}", name), e))?;
    if exists {
        debug!(name, "already committed by another writer");
        return Ok(());
    }

    commit(tmp, dest, name).await
}

/// Rename `tmp` onto `dest`. A failed rename is only an error if the
/// destination is still missing afterwards.
pub(crate) async fn commit(tmp: TempPath, dest: &Path, name: &str) -> Result<()> {
    let dest_owned = dest.to_path_buf();
    let renamed = tokio::task::spawn_blocking(move || tmp.persist(&dest_owned))
        .await
        .map_err(|e| CacheError::io("rename task panicked", std::io::Error::other(e)))?;

    if let Err(e) = renamed {
        debug!(name, error = %e.error, "rename failed, re-checking destination");
        let exists = path_exists(dest)
            .await
            .map_err(|e| CacheError::io(format!("error checking {}", name), e))?;
        if !exists {
            return Err(CacheError::CommitFailed(name.to_string()));
        }
    }

    Ok(())
}
