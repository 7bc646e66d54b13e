//! In-memory collaborators for tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::storage::{BlobStorage, StorageError};
use crate::types::BlobInfo;

/// Blob storage backed by a map, counting every call
#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
    lists: AtomicUsize,
}

impl MemoryStorage {
    pub fn with_blobs<'a>(blobs: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        let storage = Self::default();
        {
            let mut map = storage.blobs.lock().unwrap();
            for (id, data) in blobs {
                map.insert(id.to_string(), data.to_vec());
            }
        }
        storage
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(id)
    }
}

#[async_trait]
impl BlobStorage for MemoryStorage {
    async fn get_blob(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Vec<u8>, StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let blobs = self.blobs.lock().unwrap();
        let data = blobs
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        let start = (offset as usize).min(data.len());
        let end = match length {
            Some(len) => (start + len as usize).min(data.len()),
            None => data.len(),
        };
        Ok(data[start..end].to_vec())
    }

    async fn put_blob(&self, id: &str, data: &[u8]) -> Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .unwrap()
            .insert(id.to_string(), data.to_vec());
        Ok(())
    }

    async fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobInfo>, StorageError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(id, data)| BlobInfo {
                id: id.clone(),
                length: data.len() as u64,
                timestamp: DateTime::from_timestamp(0, 0).unwrap_or_default(),
            })
            .collect())
    }
}

/// Clock that only moves when told to
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Set a file's modification time
pub fn set_mtime(path: &std::path::Path, at: DateTime<Utc>) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(at.into()).unwrap();
}
