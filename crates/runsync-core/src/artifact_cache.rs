//! Content-addressed artifact cache.
//!
//! Layout: `<root>/obj/<algorithm>/<first two digest chars>/<rest>`.
//!
//! Nothing is ever visible at a final path until it is complete: a writer
//! claims `<rest>.tmp-partial` with `create_new`, holds an exclusive lock on
//! it while writing, and renames it into place on commit. Everyone else
//! either finds the final file or waits for it. A temp file whose lock can be
//! taken belongs to a writer that died; it is removed and the race is rerun.
//!
//! Eviction (`cleanup`) serializes on `<root>/cleanup.lock`, never touches
//! temp files, and removes least-recently-accessed entries first.

use crate::error::ErrorClass;
use base64::Engine;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

const OBJECTS_DIR: &str = "obj";
const CLEANUP_LOCK: &str = "cleanup.lock";
/// Suffix of in-progress writes.
pub const TEMP_SUFFIX: &str = ".tmp-partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Md5,
    Sha256,
    Etag,
}

impl HashAlgorithm {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
            Self::Etag => "etag",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid {algorithm} digest {digest:?}: {reason}")]
    InvalidDigest {
        algorithm: HashAlgorithm,
        digest: String,
        reason: &'static str,
    },

    #[error("timed out after {waited_ms}ms waiting for another writer of {key}")]
    ReservationTimeout { key: String, waited_ms: u64 },

    #[error("size mismatch for {key}: expected {expected} bytes, wrote {actual}")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("digest mismatch for {key}: content hashes to {actual}")]
    DigestMismatch { key: String, actual: String },

    #[error("cached entry {} holds {actual} bytes, expected {expected}", path.display())]
    EntrySizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Io { .. } => ErrorClass::Durability,
            Self::InvalidDigest { .. } => ErrorClass::Config,
            Self::ReservationTimeout { .. } => ErrorClass::Race,
            Self::SizeMismatch { .. }
            | Self::DigestMismatch { .. }
            | Self::EntrySizeMismatch { .. } => ErrorClass::Corruption,
        }
    }
}

/// Identity of one cached blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    algorithm: HashAlgorithm,
    digest: String,
}

impl CacheKey {
    /// Normalize and validate a digest.
    ///
    /// Hex digests are lower-cased; a base64 MD5 (as object stores report
    /// it) is converted to hex. ETags lose their surrounding quotes.
    pub fn new(algorithm: HashAlgorithm, digest: &str) -> Result<Self, CacheError> {
        let invalid = |reason| CacheError::InvalidDigest {
            algorithm,
            digest: digest.to_string(),
            reason,
        };
        let trimmed = digest.trim();
        let normalized = match algorithm {
            HashAlgorithm::Md5 | HashAlgorithm::Sha256 => {
                if trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
                    trimmed.to_ascii_lowercase()
                } else if algorithm == HashAlgorithm::Md5 {
                    let raw = base64::engine::general_purpose::STANDARD
                        .decode(trimmed)
                        .map_err(|_| invalid("neither hex nor base64"))?;
                    if raw.len() != 16 {
                        return Err(invalid("base64 md5 must decode to 16 bytes"));
                    }
                    hex::encode(raw)
                } else {
                    return Err(invalid("not hex"));
                }
            }
            HashAlgorithm::Etag => {
                let tag = trimmed.trim_start_matches("W/").trim_matches('"');
                if !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                    return Err(invalid("etag has unsupported characters"));
                }
                tag.to_ascii_lowercase()
            }
        };
        if normalized.len() < 3 {
            return Err(invalid("too short"));
        }
        Ok(Self {
            algorithm,
            digest: normalized,
        })
    }

    pub fn md5(digest: &str) -> Result<Self, CacheError> {
        Self::new(HashAlgorithm::Md5, digest)
    }

    pub fn sha256(digest: &str) -> Result<Self, CacheError> {
        Self::new(HashAlgorithm::Sha256, digest)
    }

    pub fn etag(tag: &str) -> Result<Self, CacheError> {
        Self::new(HashAlgorithm::Etag, tag)
    }

    /// SHA-256 key of in-memory content.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            digest: hex::encode(Sha256::digest(data)),
        }
    }

    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    fn verifies_sha256(&self) -> bool {
        self.algorithm == HashAlgorithm::Sha256 && self.digest.len() == 64
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub root: PathBuf,
    /// How long `reserve` waits on another writer.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    /// Unlocked temp files younger than this are left alone.
    pub stale_grace: Duration,
    /// Evict down to this size whenever a store pushes the cache past it.
    pub budget_bytes: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            wait_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
            stale_grace: Duration::from_secs(2),
            budget_bytes: None,
        }
    }
}

/// `<platform cache dir>/runsync`, or a temp-dir fallback.
#[must_use]
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("runsync")
}

/// Outcome of [`ArtifactCache::reserve`].
#[derive(Debug)]
pub enum Reservation {
    /// The content is already cached.
    Hit { path: PathBuf },
    /// The caller must produce the content.
    Write(CacheWriter),
}

impl Reservation {
    #[must_use]
    pub const fn already_exists(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }

    /// Final path of the entry (not yet populated for `Write`).
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Hit { path } => path,
            Self::Write(writer) => &writer.final_path,
        }
    }
}

/// Exclusive writer for one cache entry.
#[derive(Debug)]
pub struct CacheWriter {
    key: CacheKey,
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    expected_size: u64,
    written: u64,
    hasher: Option<Sha256>,
}

impl CacheWriter {
    #[must_use]
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Verify, fsync and publish the entry at its final path.
    pub fn commit(mut self) -> Result<PathBuf, CacheError> {
        if self.written != self.expected_size {
            return Err(CacheError::SizeMismatch {
                key: self.key.to_string(),
                expected: self.expected_size,
                actual: self.written,
            });
        }
        if let Some(hasher) = self.hasher.take() {
            let actual = hex::encode(hasher.finalize());
            if actual != self.key.digest {
                return Err(CacheError::DigestMismatch {
                    key: self.key.to_string(),
                    actual,
                });
            }
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()
                .and_then(|()| file.sync_all())
                .map_err(|e| CacheError::io(&self.temp_path, e))?;
        }
        fs::rename(&self.temp_path, &self.final_path)
            .map_err(|e| CacheError::io(&self.final_path, e))?;
        // Closing the handle releases the lock only after the rename.
        self.file = None;
        tracing::debug!(key = %self.key, path = %self.final_path.display(), size = self.written, "cache entry committed");
        Ok(self.final_path.clone())
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("cache writer already finished"))?;
        let n = file.write(buf)?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(err) = fs::remove_file(&self.temp_path) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.temp_path.display(), error = %err, "failed to remove abandoned cache temp file");
                }
            }
            self.file = None;
        }
    }
}

/// Result of a [`ArtifactCache::cleanup`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub bytes_reclaimed: u64,
    pub entries_removed: u64,
    pub remaining_bytes: u64,
    /// Entries that could not be removed.
    pub errors: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    config: CacheConfig,
}

struct CachedFile {
    path: PathBuf,
    size: u64,
    last_access: SystemTime,
}

impl ArtifactCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self { config }
    }

    /// Cache rooted at `root` with default timings.
    #[must_use]
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self::new(CacheConfig {
            root: root.into(),
            ..CacheConfig::default()
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    #[must_use]
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        let (shard, rest) = key.digest.split_at(2);
        self.config
            .root
            .join(OBJECTS_DIR)
            .join(key.algorithm.as_str())
            .join(shard)
            .join(rest)
    }

    fn temp_path_for(final_path: &Path) -> PathBuf {
        let mut name = final_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(TEMP_SUFFIX);
        final_path.with_file_name(name)
    }

    /// Claim the right to write `key`, or learn that it already exists.
    pub fn reserve(&self, key: &CacheKey, expected_size: u64) -> Result<Reservation, CacheError> {
        let final_path = self.path_for(key);
        let temp_path = Self::temp_path_for(&final_path);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }

        let started = Instant::now();
        loop {
            if is_complete(&final_path, expected_size)? {
                touch(&final_path);
                return Ok(Reservation::Hit { path: final_path });
            }

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)
            {
                Ok(file) => {
                    if file.try_lock_exclusive().is_err() || !is_same_file(&file, &temp_path) {
                        // A stale-temp check grabbed or unlinked it first; rerun the race.
                        drop(file);
                        std::thread::sleep(self.config.poll_interval);
                        continue;
                    }
                    // Another writer may have published between our check and the claim.
                    let published = is_complete(&final_path, expected_size);
                    if !matches!(published, Ok(false)) {
                        drop(file);
                        let _ = fs::remove_file(&temp_path);
                        published?;
                        touch(&final_path);
                        return Ok(Reservation::Hit { path: final_path });
                    }
                    return Ok(Reservation::Write(CacheWriter {
                        key: key.clone(),
                        final_path,
                        temp_path,
                        file: Some(file),
                        expected_size,
                        written: 0,
                        hasher: key.verifies_sha256().then(Sha256::new),
                    }));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if self.remove_if_stale(&temp_path) {
                        continue;
                    }
                    if started.elapsed() >= self.config.wait_timeout {
                        return Err(CacheError::ReservationTimeout {
                            key: key.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(self.config.poll_interval);
                }
                Err(err) => return Err(CacheError::io(&temp_path, err)),
            }
        }
    }

    /// True if the temp file was abandoned by a dead writer and removed.
    fn remove_if_stale(&self, temp_path: &Path) -> bool {
        let Ok(file) = File::open(temp_path) else {
            // Vanished: its writer committed or gave up.
            return true;
        };
        if file.try_lock_exclusive().is_err() {
            return false;
        }
        let age = file
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default();
        if age < self.config.stale_grace {
            let _ = file.unlock();
            return false;
        }
        if !is_same_file(&file, temp_path) {
            // Replaced by a new writer since we opened it.
            let _ = file.unlock();
            return true;
        }
        tracing::warn!(path = %temp_path.display(), age_ms = age.as_millis() as u64, "removing stale cache temp file");
        let removed = fs::remove_file(temp_path).is_ok();
        let _ = file.unlock();
        removed
    }

    /// Store in-memory content under `key`. Returns the final path and
    /// whether this call wrote it.
    pub fn store_bytes(&self, key: &CacheKey, data: &[u8]) -> Result<(PathBuf, bool), CacheError> {
        match self.reserve(key, data.len() as u64)? {
            Reservation::Hit { path } => Ok((path, false)),
            Reservation::Write(mut writer) => {
                let temp = writer.temp_path.clone();
                writer
                    .write_all(data)
                    .map_err(|e| CacheError::io(&temp, e))?;
                let path = writer.commit()?;
                self.enforce_budget(&path)?;
                Ok((path, true))
            }
        }
    }

    /// Copy a file into the cache under `key`.
    pub fn store_file(&self, key: &CacheKey, source: &Path) -> Result<(PathBuf, bool), CacheError> {
        let size = fs::metadata(source)
            .map_err(|e| CacheError::io(source, e))?
            .len();
        match self.reserve(key, size)? {
            Reservation::Hit { path } => Ok((path, false)),
            Reservation::Write(mut writer) => {
                let mut input = File::open(source).map_err(|e| CacheError::io(source, e))?;
                io::copy(&mut input, &mut writer).map_err(|e| CacheError::io(source, e))?;
                let path = writer.commit()?;
                self.enforce_budget(&path)?;
                Ok((path, true))
            }
        }
    }

    /// Bytes held by completed entries.
    pub fn total_size(&self) -> Result<u64, CacheError> {
        Ok(self.completed_entries()?.iter().map(|f| f.size).sum())
    }

    /// Run [`cleanup`](Self::cleanup) against the configured budget if the
    /// cache has grown past it. `keep` is never evicted.
    ///
    /// Returns `None` when no budget is set or the cache is within it.
    pub fn enforce_budget(&self, keep: &Path) -> Result<Option<CleanupReport>, CacheError> {
        let Some(budget) = self.config.budget_bytes else {
            return Ok(None);
        };
        if self.total_size()? <= budget {
            return Ok(None);
        }
        self.cleanup_keeping(budget, Some(keep)).map(Some)
    }

    /// Evict least-recently-accessed entries until at most `target_bytes`
    /// remain.
    pub fn cleanup(&self, target_bytes: u64) -> Result<CleanupReport, CacheError> {
        self.cleanup_keeping(target_bytes, None)
    }

    fn cleanup_keeping(
        &self,
        target_bytes: u64,
        keep: Option<&Path>,
    ) -> Result<CleanupReport, CacheError> {
        fs::create_dir_all(&self.config.root).map_err(|e| CacheError::io(&self.config.root, e))?;
        let lock_path = self.config.root.join(CLEANUP_LOCK);
        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| CacheError::io(&lock_path, e))?;
        lock.lock_exclusive()
            .map_err(|e| CacheError::io(&lock_path, e))?;

        let mut entries = self.completed_entries()?;
        let mut total: u64 = entries.iter().map(|f| f.size).sum();
        let mut report = CleanupReport::default();

        if total > target_bytes {
            entries.sort_by_key(|f| f.last_access);
            for entry in entries {
                if total <= target_bytes {
                    break;
                }
                if keep == Some(entry.path.as_path()) {
                    continue;
                }
                match fs::remove_file(&entry.path) {
                    Ok(()) => {
                        total -= entry.size;
                        report.bytes_reclaimed += entry.size;
                        report.entries_removed += 1;
                    }
                    Err(err) => {
                        tracing::warn!(path = %entry.path.display(), error = %err, "failed to evict cache entry");
                        report.errors += 1;
                    }
                }
            }
        }
        report.remaining_bytes = total;
        let _ = lock.unlock();

        tracing::info!(
            target_bytes,
            reclaimed = report.bytes_reclaimed,
            removed = report.entries_removed,
            remaining = report.remaining_bytes,
            "cache cleanup finished"
        );
        Ok(report)
    }

    fn completed_entries(&self) -> Result<Vec<CachedFile>, CacheError> {
        let mut out = Vec::new();
        let objects = self.config.root.join(OBJECTS_DIR);
        if objects.is_dir() {
            collect_files(&objects, &mut out)?;
        }
        Ok(out)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<CachedFile>) -> Result<(), CacheError> {
    for entry in fs::read_dir(dir).map_err(|e| CacheError::io(dir, e))? {
        let entry = entry.map_err(|e| CacheError::io(dir, e))?;
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            // Raced with a concurrent eviction.
            continue;
        };
        if meta.is_dir() {
            collect_files(&path, out)?;
        } else if meta.is_file()
            && !path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with(TEMP_SUFFIX))
        {
            let last_access = meta
                .accessed()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            out.push(CachedFile {
                path,
                size: meta.len(),
                last_access,
            });
        }
    }
    Ok(())
}

/// Published entries are never rewritten, so one of the wrong size is an
/// error rather than a miss.
fn is_complete(path: &Path, expected_size: u64) -> Result<bool, CacheError> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() == expected_size => Ok(true),
        Ok(meta) => Err(CacheError::EntrySizeMismatch {
            path: path.to_path_buf(),
            expected: expected_size,
            actual: meta.len(),
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CacheError::io(path, err)),
    }
}

#[cfg(unix)]
fn is_same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(named)) => held.dev() == named.dev() && held.ino() == named.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// Refresh the access time used for eviction ordering.
fn touch(path: &Path) {
    let now = SystemTime::now();
    let result = OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_times(FileTimes::new().set_accessed(now)));
    if let Err(err) = result {
        tracing::debug!(path = %path.display(), error = %err, "could not refresh cache access time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    fn fast_cache(root: &Path) -> ArtifactCache {
        ArtifactCache::new(CacheConfig {
            root: root.to_path_buf(),
            wait_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            stale_grace: Duration::ZERO,
            budget_bytes: None,
        })
    }

    fn set_access(path: &Path, secs_ago: u64) {
        let when = SystemTime::now() - Duration::from_secs(secs_ago);
        OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap()
            .set_times(FileTimes::new().set_accessed(when).set_modified(when))
            .unwrap();
    }

    // ── Keys ──

    #[test]
    fn keys_normalize_case_and_encoding() {
        let key = CacheKey::md5("DEADBEEF").unwrap();
        assert_eq!(key.digest(), "deadbeef");

        // base64 of 16 zero bytes
        let key = CacheKey::md5("AAAAAAAAAAAAAAAAAAAAAA==").unwrap();
        assert_eq!(key.digest(), "00000000000000000000000000000000");

        let key = CacheKey::etag("\"9b2cf535f27731c974343645a3985328\"").unwrap();
        assert_eq!(key.digest(), "9b2cf535f27731c974343645a3985328");

        assert!(CacheKey::sha256("not-hex!").is_err());
        assert!(CacheKey::md5("ab").is_err());
    }

    #[test]
    fn layout_shards_by_prefix() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(dir.path());
        let key = CacheKey::md5("deadbeef").unwrap();
        assert_eq!(
            cache.path_for(&key),
            dir.path().join("obj").join("md5").join("de").join("adbeef")
        );
    }

    // ── Reservation ──

    #[test]
    fn write_then_hit() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(dir.path());
        let key = CacheKey::md5("deadbeef").unwrap();

        let Reservation::Write(mut writer) = cache.reserve(&key, 4).unwrap() else {
            panic!("first reservation must write");
        };
        assert!(!cache.path_for(&key).exists());
        writer.write_all(b"abcd").unwrap();
        let path = writer.commit().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abcd");

        let second = cache.reserve(&key, 4).unwrap();
        assert!(second.already_exists());
        assert_eq!(second.path(), path);
    }

    #[test]
    fn dropped_writer_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(dir.path());
        let key = CacheKey::md5("cafebabe").unwrap();
        let Reservation::Write(mut writer) = cache.reserve(&key, 10).unwrap() else {
            panic!("expected writer");
        };
        writer.write_all(b"half").unwrap();
        let temp = writer.temp_path().to_path_buf();
        assert!(temp.exists());
        drop(writer);
        assert!(!temp.exists());
        assert!(!cache.path_for(&key).exists());
        assert!(!cache.reserve(&key, 10).unwrap().already_exists());
    }

    #[test]
    fn short_write_is_rejected_at_commit() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(dir.path());
        let key = CacheKey::md5("0123abcd").unwrap();
        let Reservation::Write(mut writer) = cache.reserve(&key, 8).unwrap() else {
            panic!("expected writer");
        };
        writer.write_all(b"1234").unwrap();
        assert!(matches!(
            writer.commit().unwrap_err(),
            CacheError::SizeMismatch { expected: 8, actual: 4, .. }
        ));
        assert!(!cache.path_for(&key).exists());
    }

    #[test]
    fn sha256_content_is_verified() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(dir.path());
        let key = CacheKey::from_bytes(b"expected");
        let Reservation::Write(mut writer) = cache.reserve(&key, 8).unwrap() else {
            panic!("expected writer");
        };
        writer.write_all(b"imposter").unwrap();
        assert!(matches!(
            writer.commit().unwrap_err(),
            CacheError::DigestMismatch { .. }
        ));

        let (path, wrote) = cache.store_bytes(&key, b"expected").unwrap();
        assert!(wrote);
        assert_eq!(fs::read(path).unwrap(), b"expected");
    }

    #[test]
    fn waiter_times_out_while_writer_holds_the_claim() {
        let dir = tempdir().unwrap();
        let mut config = fast_cache(dir.path()).config;
        config.wait_timeout = Duration::from_millis(50);
        let cache = ArtifactCache::new(config);
        let key = CacheKey::md5("feedface").unwrap();
        let _writer = cache.reserve(&key, 1).unwrap();
        let err = cache.reserve(&key, 1).unwrap_err();
        assert!(matches!(err, CacheError::ReservationTimeout { .. }));
        assert_eq!(err.class(), ErrorClass::Race);
    }

    #[test]
    fn stale_temp_from_dead_writer_is_reclaimed() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(dir.path());
        let key = CacheKey::md5("abad1dea").unwrap();
        let final_path = cache.path_for(&key);
        fs::create_dir_all(final_path.parent().unwrap()).unwrap();
        // Left behind by a crashed process: present but unlocked.
        fs::write(ArtifactCache::temp_path_for(&final_path), b"garbage").unwrap();

        let (path, wrote) = cache.store_bytes(&key, b"fresh").unwrap();
        assert!(wrote);
        assert_eq!(fs::read(path).unwrap(), b"fresh");
    }

    #[test]
    fn store_file_copies_content() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(&dir.path().join("cache"));
        let source = dir.path().join("weights.bin");
        fs::write(&source, vec![7u8; 4096]).unwrap();
        let key = CacheKey::md5("0badc0de").unwrap();
        let (path, wrote) = cache.store_file(&key, &source).unwrap();
        assert!(wrote);
        let mut content = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content.len(), 4096);
        let (_, wrote_again) = cache.store_file(&key, &source).unwrap();
        assert!(!wrote_again);
    }

    // ── Cleanup ──

    #[test]
    fn cleanup_evicts_oldest_first_and_skips_temp_files() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(dir.path());
        let mut paths = Vec::new();
        for (i, digest) in ["aaa111", "bbb222", "ccc333"].iter().enumerate() {
            let key = CacheKey::md5(digest).unwrap();
            let (path, _) = cache.store_bytes(&key, &[i as u8; 100]).unwrap();
            paths.push(path);
        }
        set_access(&paths[0], 300);
        set_access(&paths[1], 10);
        set_access(&paths[2], 200);

        // An in-flight write must survive cleanup.
        let pending = CacheKey::md5("ddd444").unwrap();
        let writer = match cache.reserve(&pending, 1000).unwrap() {
            Reservation::Write(writer) => writer,
            Reservation::Hit { .. } => panic!("expected writer"),
        };

        let report = cache.cleanup(150).unwrap();
        assert_eq!(report.entries_removed, 2);
        assert_eq!(report.bytes_reclaimed, 200);
        assert_eq!(report.remaining_bytes, 100);
        assert!(!paths[0].exists());
        assert!(paths[1].exists());
        assert!(!paths[2].exists());
        assert!(writer.temp_path().exists());
        assert_eq!(cache.total_size().unwrap(), 100);
    }

    #[test]
    fn cleanup_under_target_is_a_no_op() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(dir.path());
        cache
            .store_bytes(&CacheKey::md5("abc123").unwrap(), b"tiny")
            .unwrap();
        let report = cache.cleanup(1 << 20).unwrap();
        assert_eq!(report.entries_removed, 0);
        assert_eq!(report.remaining_bytes, 4);
    }

    #[test]
    fn store_past_budget_evicts_oldest_but_keeps_new_entry() {
        let dir = tempdir().unwrap();
        let cache = ArtifactCache::new(CacheConfig {
            budget_bytes: Some(250),
            ..fast_cache(dir.path()).config
        });
        let (first, _) = cache
            .store_bytes(&CacheKey::md5("aaa111").unwrap(), &[1; 100])
            .unwrap();
        let (second, _) = cache
            .store_bytes(&CacheKey::md5("bbb222").unwrap(), &[2; 100])
            .unwrap();
        set_access(&first, 300);
        set_access(&second, 200);

        let (third, wrote) = cache
            .store_bytes(&CacheKey::md5("ccc333").unwrap(), &[3; 100])
            .unwrap();
        assert!(wrote);
        assert!(!first.exists());
        assert!(second.exists());
        assert!(third.exists());
        assert_eq!(cache.total_size().unwrap(), 200);

        // An entry larger than the whole budget still lands.
        let (big, _) = cache
            .store_bytes(&CacheKey::md5("ddd444").unwrap(), &[4; 400])
            .unwrap();
        assert!(big.exists());
        assert_eq!(cache.total_size().unwrap(), 400);
    }

    #[test]
    fn store_without_budget_never_evicts() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(dir.path());
        for digest in ["aaa111", "bbb222", "ccc333"] {
            cache
                .store_bytes(&CacheKey::md5(digest).unwrap(), &[0; 100])
                .unwrap();
        }
        assert_eq!(cache.total_size().unwrap(), 300);
    }

    #[test]
    fn resized_entry_is_reported_not_rewritten() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(dir.path());
        let key = CacheKey::md5("feedface").unwrap();
        let (path, _) = cache.store_bytes(&key, b"original").unwrap();
        fs::write(&path, b"tampered with").unwrap();

        let err = cache.reserve(&key, 8).unwrap_err();
        assert!(matches!(
            err,
            CacheError::EntrySizeMismatch { expected: 8, actual: 13, .. }
        ));
        assert_eq!(err.class(), ErrorClass::Corruption);
        assert_eq!(fs::read(&path).unwrap(), b"tampered with");
        assert!(!ArtifactCache::temp_path_for(&path).exists());
    }

    #[test]
    fn cleanup_of_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let cache = fast_cache(&dir.path().join("never-used"));
        assert_eq!(cache.cleanup(0).unwrap(), CleanupReport::default());
    }
}
