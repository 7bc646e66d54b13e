//! Read-only view over a committed pack index
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! header:  version:u8 | key_size:u8 | entry_size:u16 | count:u32
//! record:  key[key_size] | timestamp:u32 | pack_offset:u32 | original_length:u32 | pack_ref:u32
//! ```
//!
//! Records are sorted by key. The high bit of `pack_offset` marks a deleted
//! content. `pack_ref` holds the pack blob id as `len << 24 | offset`, pointing
//! at bytes stored after the records.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use memmap2::Mmap;

use crate::error::{CacheError, Result};

const VERSION: u8 = 1;
const HEADER_SIZE: usize = 8;
const ENTRY_SIZE: usize = 16;
const DELETED_FLAG: u32 = 1 << 31;
const MAX_PACK_NAME_OFFSET: usize = (1 << 24) - 1;

/// Location of one content inside a pack blob, borrowed from the index bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentInfo<'a> {
    pub content_id: &'a [u8],
    pub pack_blob_id: &'a str,
    pub pack_offset: u32,
    pub original_length: u32,
    /// Stored length including per-content overhead (e.g. encryption framing)
    pub packed_length: u32,
    pub timestamp: DateTime<Utc>,
    pub deleted: bool,
}

/// Parsed index over bytes it owns.
///
/// The backing storage (a memory map by default) lives exactly as long as the
/// index; every [`ContentInfo`] borrows from it.
pub struct PackIndex<B = Mmap> {
    data: B,
    key_size: usize,
    count: usize,
    per_content_overhead: u32,
}

impl<B: AsRef<[u8]>> PackIndex<B> {
    /// Validate the header and take ownership of `data`.
    pub fn open(data: B, per_content_overhead: u32) -> Result<Self> {
        let bytes = data.as_ref();
        if bytes.len() < HEADER_SIZE {
            return Err(CacheError::InvalidIndex(format!(
                "file too small for header ({} bytes)",
                bytes.len()
            )));
        }

        if bytes[0] != VERSION {
            return Err(CacheError::InvalidIndex(format!(
                "unsupported version {}",
                bytes[0]
            )));
        }

        let key_size = bytes[1] as usize;
        if key_size == 0 {
            return Err(CacheError::InvalidIndex("zero key size".to_string()));
        }

        let entry_size = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if entry_size != ENTRY_SIZE {
            return Err(CacheError::InvalidIndex(format!(
                "unsupported entry size {}",
                entry_size
            )));
        }

        let count = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let records_end = count
            .checked_mul(key_size + ENTRY_SIZE)
            .and_then(|n| n.checked_add(HEADER_SIZE));
        match records_end {
            Some(end) if end <= bytes.len() => {}
            _ => {
                return Err(CacheError::InvalidIndex(format!(
                    "{} records do not fit in {} bytes",
                    count,
                    bytes.len()
                )))
            }
        }

        Ok(Self {
            data,
            key_size,
            count,
            per_content_overhead,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    fn record(&self, i: usize) -> &[u8] {
        let record_len = self.key_size + ENTRY_SIZE;
        let start = HEADER_SIZE + i * record_len;
        &self.data.as_ref()[start..start + record_len]
    }

    fn key(&self, i: usize) -> &[u8] {
        &self.record(i)[..self.key_size]
    }

    fn decode(&self, i: usize) -> Result<ContentInfo<'_>> {
        let record = self.record(i);
        let (key, entry) = record.split_at(self.key_size);
        let word = |n: usize| {
            u32::from_be_bytes([entry[n * 4], entry[n * 4 + 1], entry[n * 4 + 2], entry[n * 4 + 3]])
        };

        let timestamp = word(0);
        let raw_offset = word(1);
        let original_length = word(2);
        let pack_ref = word(3);

        let name_len = (pack_ref >> 24) as usize;
        let name_offset = (pack_ref as usize) & MAX_PACK_NAME_OFFSET;
        let name_bytes = self
            .data
            .as_ref()
            .get(name_offset..name_offset + name_len)
            .ok_or_else(|| {
                CacheError::InvalidIndex(format!(
                    "pack name at {}+{} out of bounds",
                    name_offset, name_len
                ))
            })?;
        let pack_blob_id = std::str::from_utf8(name_bytes)
            .map_err(|e| CacheError::InvalidIndex(format!("pack name is not UTF-8: {}", e)))?;

        Ok(ContentInfo {
            content_id: key,
            pack_blob_id,
            pack_offset: raw_offset & !DELETED_FLAG,
            original_length,
            packed_length: original_length.saturating_add(self.per_content_overhead),
            timestamp: DateTime::from_timestamp(i64::from(timestamp), 0).unwrap_or_default(),
            deleted: raw_offset & DELETED_FLAG != 0,
        })
    }

    /// Look up a content by id. Ids of the wrong length are simply absent.
    pub fn get_info(&self, content_id: &[u8]) -> Result<Option<ContentInfo<'_>>> {
        if content_id.len() != self.key_size {
            return Ok(None);
        }

        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(content_id) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return self.decode(mid).map(Some),
            }
        }

        Ok(None)
    }

    /// Iterate all records in key order
    pub fn iter(&self) -> impl Iterator<Item = Result<ContentInfo<'_>>> + '_ {
        (0..self.count).map(move |i| self.decode(i))
    }
}

struct PendingEntry {
    pack_blob_id: String,
    pack_offset: u32,
    original_length: u32,
    timestamp: u32,
    deleted: bool,
}

/// Serializes content locations into the pack index layout
#[derive(Default)]
pub struct PackIndexBuilder {
    entries: BTreeMap<Vec<u8>, PendingEntry>,
}

impl PackIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a content location. A later add for the same id replaces the earlier one.
    pub fn add(
        &mut self,
        content_id: &[u8],
        pack_blob_id: &str,
        pack_offset: u32,
        original_length: u32,
        timestamp: DateTime<Utc>,
    ) -> &mut Self {
        self.entries.insert(
            content_id.to_vec(),
            PendingEntry {
                pack_blob_id: pack_blob_id.to_string(),
                pack_offset,
                original_length,
                timestamp: timestamp.timestamp().clamp(0, i64::from(u32::MAX)) as u32,
                deleted: false,
            },
        );
        self
    }

    /// Mark a previously added content as deleted
    pub fn mark_deleted(&mut self, content_id: &[u8]) -> &mut Self {
        if let Some(entry) = self.entries.get_mut(content_id) {
            entry.deleted = true;
        }
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let key_size = match self.entries.keys().next() {
            Some(k) => k.len(),
            None => 1,
        };
        if key_size == 0 || key_size > u8::MAX as usize {
            return Err(CacheError::InvalidIndex(format!(
                "unsupported key size {}",
                key_size
            )));
        }
        if let Some(bad) = self.entries.keys().find(|k| k.len() != key_size) {
            return Err(CacheError::InvalidIndex(format!(
                "inconsistent key length {} (expected {})",
                bad.len(),
                key_size
            )));
        }

        let count = self.entries.len();
        let records_end = HEADER_SIZE + count * (key_size + ENTRY_SIZE);

        // pack names are stored once each, after the records
        let mut names: Vec<u8> = Vec::new();
        let mut name_refs: HashMap<&str, u32> = HashMap::new();
        for entry in self.entries.values() {
            if name_refs.contains_key(entry.pack_blob_id.as_str()) {
                continue;
            }
            let len = entry.pack_blob_id.len();
            let offset = records_end + names.len();
            if len > u8::MAX as usize || offset > MAX_PACK_NAME_OFFSET {
                return Err(CacheError::InvalidIndex(format!(
                    "pack name {:?} does not fit the index layout",
                    entry.pack_blob_id
                )));
            }
            name_refs.insert(entry.pack_blob_id.as_str(), ((len as u32) << 24) | offset as u32);
            names.extend_from_slice(entry.pack_blob_id.as_bytes());
        }

        let mut out = Vec::with_capacity(records_end + names.len());
        out.push(VERSION);
        out.push(key_size as u8);
        out.extend_from_slice(&(ENTRY_SIZE as u16).to_be_bytes());
        out.extend_from_slice(&(count as u32).to_be_bytes());

        for (key, entry) in &self.entries {
            if entry.pack_offset & DELETED_FLAG != 0 {
                return Err(CacheError::InvalidIndex(format!(
                    "pack offset {} too large",
                    entry.pack_offset
                )));
            }
            let offset = if entry.deleted {
                entry.pack_offset | DELETED_FLAG
            } else {
                entry.pack_offset
            };

            out.extend_from_slice(key);
            out.extend_from_slice(&entry.timestamp.to_be_bytes());
            out.extend_from_slice(&offset.to_be_bytes());
            out.extend_from_slice(&entry.original_length.to_be_bytes());
            out.extend_from_slice(&name_refs[entry.pack_blob_id.as_str()].to_be_bytes());
        }

        out.extend_from_slice(&names);
        Ok(out)
    }
}
