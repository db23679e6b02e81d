//! Content-addressed local store for retrieved file-version blobs.
//!
//! Layout under the cache directory:
//! - `index.sqlite`: one row per version key (`element@@/main/1`) holding the
//!   SHA-256 digest, size, MD5, fetch time and a verified flag;
//! - `blobs/<2 hex>/<digest>`: blob files, written via temp file + rename.
//!
//! Zero-size entries are untrusted until re-fetched once from the source,
//! unless verification is disabled.

pub mod prefetch;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use md5::Md5;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::RetryPolicy;
use crate::errors::{ConvertError, ConvertResult, SourceError};
use crate::history::retry;
use crate::models::{BlobRef, ElementVersion, VersionId};
use crate::store::{self, schema};

/// Blob retrieval collaborator.
pub trait BlobSource: Send + Sync {
    fn fetch(&self, element: &str, version: &VersionId) -> Result<Vec<u8>, SourceError>;
}

/// Reads blob bytes back for the dump writer.
pub trait BlobReader {
    fn read_blob(&self, blob: &BlobRef) -> ConvertResult<Vec<u8>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(BlobRef),
    /// Zero-size entry awaiting its verification re-fetch.
    Suspect(BlobRef),
    NotCached,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub refetches: u64,
    pub corruptions: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    refetches: AtomicU64,
    corruptions: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub removed: usize,
    pub kept: usize,
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub struct ContentCache {
    root: PathBuf,
    conn: Mutex<Connection>,
    verify_zero_size: bool,
    counters: Counters,
}

impl ContentCache {
    pub fn open(root: &Path, verify_zero_size: bool) -> ConvertResult<Self> {
        std::fs::create_dir_all(root.join("blobs"))?;
        let conn = store::connect(&root.join("index.sqlite"), false)?;
        schema::init_schema(&conn, schema::CACHE_SCHEMA)?;
        Ok(Self {
            root: root.to_path_buf(),
            conn: Mutex::new(conn),
            verify_zero_size,
            counters: Counters::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let shard = digest.get(..2).unwrap_or("00");
        self.root.join("blobs").join(shard).join(digest)
    }

    fn entry(&self, key: &str) -> ConvertResult<Option<(BlobRef, bool)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT digest, size, md5, verified FROM cache_entries WHERE version_key = ?1;",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(digest, size, md5, verified)| {
            (
                BlobRef {
                    key: key.to_string(),
                    digest,
                    size: size.max(0) as u64,
                    md5,
                },
                verified != 0,
            )
        }))
    }

    /// Look up a version.  A missing blob file or a size mismatch is
    /// reported as `CacheCorruption`, never as an empty file.  The digest is
    /// checked once, when [`BlobReader::read_blob`] loads the bytes.
    pub fn get(&self, version: &ElementVersion) -> ConvertResult<CacheLookup> {
        let key = version.key();
        let Some((blob, verified)) = self.entry(&key)? else {
            return Ok(CacheLookup::NotCached);
        };
        let len = std::fs::metadata(self.blob_path(&blob.digest))
            .map(|meta| meta.len())
            .map_err(|e| ConvertError::CacheCorruption {
                key: key.clone(),
                reason: format!("blob {} unreadable: {e}", blob.digest),
            })?;
        if len != blob.size {
            return Err(ConvertError::CacheCorruption {
                key,
                reason: format!("blob {} holds {len} bytes, expected {}", blob.digest, blob.size),
            });
        }
        if blob.size == 0 && !verified && self.verify_zero_size {
            return Ok(CacheLookup::Suspect(blob));
        }
        Ok(CacheLookup::Hit(blob))
    }

    /// Store `bytes` for `version`.  Zero-size blobs stay unverified.
    pub fn put(&self, version: &ElementVersion, bytes: &[u8]) -> ConvertResult<BlobRef> {
        self.store(version, bytes, !bytes.is_empty())
    }

    fn store(&self, version: &ElementVersion, bytes: &[u8], verified: bool) -> ConvertResult<BlobRef> {
        let digest = sha256_hex(bytes);
        let md5 = md5_hex(bytes);
        self.write_blob(&digest, bytes)?;
        let blob = BlobRef {
            key: version.key(),
            digest,
            size: bytes.len() as u64,
            md5,
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cache_entries(version_key, digest, size, md5, fetched_at, verified) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(version_key) DO UPDATE SET digest = excluded.digest, \
             size = excluded.size, md5 = excluded.md5, fetched_at = excluded.fetched_at, \
             verified = excluded.verified;",
            params![
                blob.key,
                blob.digest,
                blob.size as i64,
                blob.md5,
                now_unix(),
                verified as i64
            ],
        )?;
        Ok(blob)
    }

    fn write_blob(&self, digest: &str, bytes: &[u8]) -> ConvertResult<()> {
        let path = self.blob_path(digest);
        if let Ok(meta) = std::fs::metadata(&path) {
            if meta.len() == bytes.len() as u64 {
                return Ok(());
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!(
            "tmp{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&tmp, bytes)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop the entry for `version`.  Returns whether one existed.
    pub fn invalidate(&self, version: &ElementVersion) -> ConvertResult<bool> {
        self.invalidate_key(&version.key())
    }

    fn invalidate_key(&self, key: &str) -> ConvertResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE version_key = ?1;",
            params![key],
        )?;
        Ok(removed > 0)
    }

    fn mark_verified(&self, key: &str) -> ConvertResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE cache_entries SET verified = 1 WHERE version_key = ?1;",
            params![key],
        )?;
        Ok(())
    }

    /// Return the cached blob for `version`, fetching from `source` on a miss.
    /// A suspect zero-size entry is re-fetched exactly once; a corrupted
    /// entry is reported, invalidated and re-fetched.
    pub fn fetch_through(
        &self,
        source: &dyn BlobSource,
        policy: &RetryPolicy,
        version: &ElementVersion,
    ) -> ConvertResult<BlobRef> {
        match self.get(version) {
            Ok(CacheLookup::Hit(blob)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(blob)
            }
            Ok(CacheLookup::Suspect(blob)) => {
                self.counters.refetches.fetch_add(1, Ordering::Relaxed);
                debug!(key = %blob.key, "re-fetching zero-size cache entry");
                let bytes = fetch_with_retry(source, policy, version)?;
                if bytes.is_empty() {
                    self.mark_verified(&blob.key)?;
                    return Ok(blob);
                }
                self.store(version, &bytes, true)
            }
            Ok(CacheLookup::NotCached) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                let bytes = fetch_with_retry(source, policy, version)?;
                self.store(version, &bytes, true)
            }
            Err(ConvertError::CacheCorruption { key, reason }) => {
                self.counters.corruptions.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, reason = %reason, "cache entry corrupted, re-fetching");
                self.invalidate(version)?;
                let bytes = fetch_with_retry(source, policy, version)?;
                self.store(version, &bytes, true)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether a trusted entry exists for `version` (used by prefetch).
    pub fn is_cached(&self, version: &ElementVersion) -> bool {
        matches!(self.entry(&version.key()), Ok(Some(_)))
    }

    /// Remove blob files no entry references.
    pub fn gc(&self) -> ConvertResult<GcStats> {
        let referenced: HashSet<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT DISTINCT digest FROM cache_entries;")?;
            let digests = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            digests
        };
        let mut stats = GcStats::default();
        for entry in WalkDir::new(self.root.join("blobs")).min_depth(2) {
            let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if referenced.contains(name.as_ref()) {
                stats.kept += 1;
            } else {
                std::fs::remove_file(entry.path())?;
                stats.removed += 1;
            }
        }
        debug!(removed = stats.removed, kept = stats.kept, "cache gc finished");
        Ok(stats)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            refetches: self.counters.refetches.load(Ordering::Relaxed),
            corruptions: self.counters.corruptions.load(Ordering::Relaxed),
        }
    }
}

impl BlobReader for ContentCache {
    fn read_blob(&self, blob: &BlobRef) -> ConvertResult<Vec<u8>> {
        let bytes = std::fs::read(self.blob_path(&blob.digest)).map_err(|e| {
            ConvertError::CacheCorruption {
                key: blob.key.clone(),
                reason: format!("blob {} unreadable: {e}", blob.digest),
            }
        })?;
        if bytes.len() as u64 != blob.size || sha256_hex(&bytes) != blob.digest {
            // The next lookup must miss so the version is fetched again.
            self.counters.corruptions.fetch_add(1, Ordering::Relaxed);
            self.invalidate_key(&blob.key)?;
            warn!(key = %blob.key, digest = %blob.digest, "cache blob fails its digest check, entry dropped");
            return Err(ConvertError::CacheCorruption {
                key: blob.key.clone(),
                reason: format!("blob {} fails its digest check", blob.digest),
            });
        }
        Ok(bytes)
    }
}

fn fetch_with_retry(
    source: &dyn BlobSource,
    policy: &RetryPolicy,
    version: &ElementVersion,
) -> ConvertResult<Vec<u8>> {
    retry::run(policy, "get", || {
        source
            .fetch(&version.element, &version.version)
            .map_err(ConvertError::from)
    })
}

/// In-memory blob source with per-key fetch counters.
#[derive(Default)]
pub struct MemoryBlobs {
    blobs: HashMap<String, Vec<u8>>,
    failures: Mutex<HashMap<String, SourceError>>,
    fetches: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, element: &str, version: &str, bytes: impl Into<Vec<u8>>) {
        self.blobs
            .insert(format!("{element}@@{version}"), bytes.into());
    }

    /// Make every fetch of `element@@version` fail with `error`.
    pub fn fail(&self, element: &str, version: &str, error: SourceError) {
        self.failures
            .lock()
            .insert(format!("{element}@@{version}"), error);
    }

    pub fn heal(&self) {
        self.failures.lock().clear();
    }

    pub fn fetch_count(&self, element: &str, version: &str) -> usize {
        self.fetches
            .lock()
            .get(&format!("{element}@@{version}"))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl BlobSource for MemoryBlobs {
    fn fetch(&self, element: &str, version: &VersionId) -> Result<Vec<u8>, SourceError> {
        let key = format!("{element}@@{version}");
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.fetches.lock().entry(key.clone()).or_insert(0) += 1;
        if let Some(error) = self.failures.lock().get(&key) {
            return Err(error.clone());
        }
        self.blobs
            .get(&key)
            .cloned()
            .ok_or(SourceError::NotFound(key))
    }
}
