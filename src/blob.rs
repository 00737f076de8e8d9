//! Content-addressable blob storage with deduplication
//!
//! Payload bytes (request/response bodies) are keyed by the SHA-256 of their
//! content: identical bytes always map to the same key, and a key is stored
//! at most once per store instance. Small payloads are kept inline, larger
//! ones spill to a file under the store's blobs directory. Payloads may be
//! compressed before placement; both the stored and decompressed sizes are
//! recorded so reads can be transparent.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::{LoupeError, Result};

/// Zstd level used for blob compression; favors speed over ratio
const COMPRESSION_LEVEL: i32 = 3;

/// Content-derived key of a stored blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey([u8; 32]);

impl BlobKey {
    /// Compute the key for a payload.
    #[must_use]
    pub fn for_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Construct from raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hex rendering, used for blob file names.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for BlobKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlobKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| serde::de::Error::custom("blob key must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Result of placing a payload in the blob store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHandle {
    /// Content key
    pub key: BlobKey,
    /// Stored size in bytes (compressed when compression applied)
    pub size: u64,
    /// Original payload size in bytes
    pub decompressed_size: u64,
    /// Whether this call placed the bytes, false when deduplicated
    pub newly_stored: bool,
}

/// Persisted metadata for a blob entry (serialized into store frames)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BlobRecord {
    pub key: BlobKey,
    pub size: u64,
    pub decompressed_size: u64,
    pub compressed: bool,
    pub inline: bool,
}

#[derive(Debug, Clone)]
enum BlobData {
    Inline(Bytes),
    File,
}

#[derive(Debug, Clone)]
struct BlobEntry {
    size: u64,
    decompressed_size: u64,
    compressed: bool,
    data: BlobData,
}

/// Content-addressable, deduplicated storage for payload bytes
pub struct BlobStore {
    /// Directory for file-backed blobs; `None` keeps everything inline
    dir: Option<PathBuf>,
    inline_limit: usize,
    compression_enabled: bool,
    index: DashMap<BlobKey, BlobEntry>,
}

impl BlobStore {
    /// Create a blob store rooted at `dir`, or fully in-memory when `None`.
    ///
    /// # Errors
    ///
    /// Returns error if the blobs directory cannot be created
    pub fn new(dir: Option<PathBuf>, inline_limit: usize, compression_enabled: bool) -> Result<Self> {
        if let Some(dir) = &dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            dir,
            inline_limit,
            compression_enabled,
            index: DashMap::new(),
        })
    }

    /// Store a payload, returning its content key.
    ///
    /// Identical content is stored once: a second call with the same bytes
    /// returns the existing handle without rewriting anything.
    ///
    /// # Errors
    ///
    /// Returns error if a file-backed blob cannot be written
    pub fn store(&self, bytes: &[u8]) -> Result<BlobHandle> {
        let key = BlobKey::for_bytes(bytes);

        if let Some(existing) = self.index.get(&key) {
            return Ok(BlobHandle {
                key,
                size: existing.size,
                decompressed_size: existing.decompressed_size,
                newly_stored: false,
            });
        }

        let decompressed_size = bytes.len() as u64;
        let mut compressed = false;
        let stored: Bytes = if self.compression_enabled {
            match zstd::encode_all(bytes, COMPRESSION_LEVEL) {
                Ok(encoded) if encoded.len() < bytes.len() => {
                    compressed = true;
                    Bytes::from(encoded)
                }
                Ok(_) => Bytes::copy_from_slice(bytes),
                Err(e) => {
                    warn!("Blob compression failed, storing raw: {e}");
                    Bytes::copy_from_slice(bytes)
                }
            }
        } else {
            Bytes::copy_from_slice(bytes)
        };

        let size = stored.len() as u64;
        let data = if stored.len() <= self.inline_limit || self.dir.is_none() {
            BlobData::Inline(stored)
        } else {
            std::fs::write(self.blob_path(&key), &stored)?;
            BlobData::File
        };

        self.index.insert(
            key,
            BlobEntry {
                size,
                decompressed_size,
                compressed,
                data,
            },
        );

        trace!("Stored blob {key} ({size} bytes, compressed: {compressed})");

        Ok(BlobHandle {
            key,
            size,
            decompressed_size,
            newly_stored: true,
        })
    }

    /// Retrieve a payload by key, transparently decompressing.
    ///
    /// # Errors
    ///
    /// Returns [`LoupeError::BlobNotFound`] if the key is absent (for
    /// example, after a sweep removed it)
    pub fn retrieve(&self, key: &BlobKey) -> Result<Vec<u8>> {
        let (compressed, raw) = {
            let entry = self
                .index
                .get(key)
                .ok_or(LoupeError::BlobNotFound(*key))?;
            let raw = match &entry.data {
                BlobData::Inline(bytes) => bytes.to_vec(),
                BlobData::File => std::fs::read(self.blob_path(key)).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        LoupeError::BlobNotFound(*key)
                    } else {
                        LoupeError::Io(e)
                    }
                })?,
            };
            (entry.compressed, raw)
        };

        if compressed {
            zstd::decode_all(raw.as_slice())
                .map_err(|e| LoupeError::InvalidFormat(format!("blob decompression failed: {e}")))
        } else {
            Ok(raw)
        }
    }

    /// Advisory release of a reference to `key`.
    ///
    /// Physical deletion is deferred to the sweep and export paths, which
    /// recompute blob reachability from the surviving row set instead of
    /// trusting per-call reference counts.
    pub fn release(&self, key: &BlobKey) {
        trace!("Blob released (advisory): {key}");
    }

    /// Whether a key is present.
    #[must_use]
    pub fn contains(&self, key: &BlobKey) -> bool {
        self.index.contains_key(key)
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the store holds no blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Total stored size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.index.iter().map(|e| e.value().size).sum()
    }

    /// All stored keys.
    #[must_use]
    pub fn keys(&self) -> Vec<BlobKey> {
        self.index.iter().map(|e| *e.key()).collect()
    }

    /// Remove every blob whose key is not in `live`, deleting any backing
    /// files. Used by the sweep pass after recomputing reachability.
    pub(crate) fn retain_keys(&self, live: &HashSet<BlobKey>) -> usize {
        let dead: Vec<BlobKey> = self
            .index
            .iter()
            .filter(|e| !live.contains(e.key()))
            .map(|e| *e.key())
            .collect();

        for key in &dead {
            self.remove(key);
        }
        if !dead.is_empty() {
            debug!("Removed {} unreferenced blobs", dead.len());
        }
        dead.len()
    }

    /// Remove a single blob and its backing file, if any.
    pub(crate) fn remove(&self, key: &BlobKey) {
        if let Some((_, entry)) = self.index.remove(key) {
            if matches!(entry.data, BlobData::File) {
                if let Err(e) = std::fs::remove_file(self.blob_path(key)) {
                    warn!("Failed to remove blob file {key}: {e}");
                }
            }
        }
    }

    /// Persisted metadata for a stored blob.
    pub(crate) fn record(&self, key: &BlobKey) -> Option<BlobRecord> {
        self.index.get(key).map(|entry| BlobRecord {
            key: *key,
            size: entry.size,
            decompressed_size: entry.decompressed_size,
            compressed: entry.compressed,
            inline: matches!(entry.data, BlobData::Inline(_)),
        })
    }

    /// Raw stored bytes (compressed form when compression applied).
    pub(crate) fn stored_bytes(&self, key: &BlobKey) -> Result<Bytes> {
        let entry = self
            .index
            .get(key)
            .ok_or(LoupeError::BlobNotFound(*key))?;
        match &entry.data {
            BlobData::Inline(bytes) => Ok(bytes.clone()),
            BlobData::File => Ok(Bytes::from(std::fs::read(self.blob_path(key))?)),
        }
    }

    /// Re-register a blob from a persisted record during replay.
    ///
    /// Inline entries carry their bytes; file-backed entries are expected
    /// to still exist under the blobs directory.
    pub(crate) fn register(&self, record: &BlobRecord, data: Option<Bytes>) {
        let blob_data = match data {
            Some(bytes) => BlobData::Inline(bytes),
            None if record.inline => {
                warn!("Inline blob {} replayed without data, dropping", record.key);
                return;
            }
            None => BlobData::File,
        };
        self.index.insert(
            record.key,
            BlobEntry {
                size: record.size,
                decompressed_size: record.decompressed_size,
                compressed: record.compressed,
                data: blob_data,
            },
        );
    }

    fn blob_path(&self, key: &BlobKey) -> PathBuf {
        debug_assert!(self.dir.is_some());
        self.dir
            .as_deref()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join(key.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory_store() -> BlobStore {
        BlobStore::new(None, 1024, false).unwrap()
    }

    #[test]
    fn test_identical_content_same_key() {
        let store = memory_store();

        let a = store.store(b"payload").unwrap();
        let b = store.store(b"payload").unwrap();

        assert_eq!(a.key, b.key);
        assert!(a.newly_stored);
        assert!(!b.newly_stored);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_different_content_different_key() {
        let store = memory_store();

        let a = store.store(b"payload-a").unwrap();
        let b = store.store(b"payload-b").unwrap();

        assert_ne!(a.key, b.key);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_retrieve_roundtrip() {
        let store = memory_store();

        let handle = store.store(b"hello blob").unwrap();
        let bytes = store.retrieve(&handle.key).unwrap();
        assert_eq!(bytes, b"hello blob");
    }

    #[test]
    fn test_retrieve_missing_key() {
        let store = memory_store();
        let key = BlobKey::for_bytes(b"never stored");

        match store.retrieve(&key) {
            Err(LoupeError::BlobNotFound(missing)) => assert_eq!(missing, key),
            other => panic!("expected BlobNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_file_placement_over_inline_limit() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(Some(dir.path().to_path_buf()), 16, false).unwrap();

        let small = store.store(b"tiny").unwrap();
        let large_payload = vec![7u8; 1024];
        let large = store.store(&large_payload).unwrap();

        assert!(!dir.path().join(small.key.to_hex()).exists());
        assert!(dir.path().join(large.key.to_hex()).exists());
        assert_eq!(store.retrieve(&large.key).unwrap(), large_payload);
    }

    #[test]
    fn test_compression_records_both_sizes() {
        let store = BlobStore::new(None, 1024 * 1024, true).unwrap();

        // Highly compressible payload
        let payload = vec![b'a'; 100_000];
        let handle = store.store(&payload).unwrap();

        assert_eq!(handle.decompressed_size, 100_000);
        assert!(handle.size < handle.decompressed_size);
        assert_eq!(store.retrieve(&handle.key).unwrap(), payload);
    }

    #[test]
    fn test_incompressible_payload_stored_raw() {
        let store = BlobStore::new(None, 1024 * 1024, true).unwrap();

        // Pseudo-random bytes don't shrink under zstd
        let payload: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
            .collect();
        let handle = store.store(&payload).unwrap();

        assert_eq!(handle.size, handle.decompressed_size);
        assert_eq!(store.retrieve(&handle.key).unwrap(), payload);
    }

    #[test]
    fn test_retain_keys_removes_files() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(Some(dir.path().to_path_buf()), 4, false).unwrap();

        let keep = store.store(b"keep this payload").unwrap();
        let drop = store.store(b"drop this payload").unwrap();

        let live: HashSet<BlobKey> = [keep.key].into_iter().collect();
        let removed = store.retain_keys(&live);

        assert_eq!(removed, 1);
        assert!(store.contains(&keep.key));
        assert!(!store.contains(&drop.key));
        assert!(!dir.path().join(drop.key.to_hex()).exists());
        assert!(dir.path().join(keep.key.to_hex()).exists());
    }

    #[test]
    fn test_release_is_advisory() {
        let store = memory_store();
        let handle = store.store(b"still here").unwrap();

        store.release(&handle.key);

        // Physical deletion only happens via reachability recomputation
        assert!(store.contains(&handle.key));
        assert_eq!(store.retrieve(&handle.key).unwrap(), b"still here");
    }

    #[test]
    fn test_key_serde_hex() {
        let key = BlobKey::for_bytes(b"abc");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json.len(), 66); // 64 hex chars + quotes

        let parsed: BlobKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_register_roundtrip() {
        let store = memory_store();
        let handle = store.store(b"original").unwrap();
        let record = store.record(&handle.key).unwrap();
        let stored = store.stored_bytes(&handle.key).unwrap();

        let other = memory_store();
        other.register(&record, Some(stored));
        assert_eq!(other.retrieve(&handle.key).unwrap(), b"original");
    }
}
