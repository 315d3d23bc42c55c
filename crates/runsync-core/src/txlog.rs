//! Append-only transaction log for run records.
//!
//! File layout:
//!
//! ```text
//! [":RSL"][magic u16 LE = 0xBEE1][version u8 = 1]
//! [len u32 LE][payload crc32 u32 LE][header crc32 u32 LE][payload ...]
//! [len u32 LE][payload crc32 u32 LE][header crc32 u32 LE][payload ...]
//! ...
//! ```
//!
//! The header checksum covers the eight bytes before it, so a damaged length
//! is detected before it is trusted. Entries are never rewritten; offset
//! order is causal order.
//!
//! A single [`TxLogWriter`] appends (enforced with an exclusive file lock);
//! any number of [`TxLogReader`]s open the file independently and tolerate a
//! file that is still growing.

use crate::error::ErrorClass;
use crate::record::Envelope;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// File name of the log inside a run directory.
pub const LOG_FILE_NAME: &str = "run.rslog";

pub const LOG_IDENT: [u8; 4] = *b":RSL";
pub const LOG_MAGIC: u16 = 0xBEE1;
pub const LOG_VERSION: u8 = 1;

/// Bytes before the first entry.
pub const FILE_HEADER_LEN: u64 = 7;
/// Bytes of framing in front of every payload.
pub const ENTRY_HEADER_LEN: u64 = 12;
/// Largest payload the writer accepts.
pub const MAX_ENTRY_BYTES: u32 = 64 * 1024 * 1024;

/// When appended entries are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DurabilityPolicy {
    /// fsync after every entry.
    EveryWrite,
    /// fsync once `max_entries` entries or `max_interval_ms` have accumulated.
    Batched {
        #[serde(default = "default_batch_entries")]
        max_entries: usize,
        #[serde(default = "default_batch_interval_ms")]
        max_interval_ms: u64,
    },
    /// Leave flushing to the OS.
    OsBuffered,
}

const fn default_batch_entries() -> usize {
    64
}

const fn default_batch_interval_ms() -> u64 {
    200
}

impl Default for DurabilityPolicy {
    fn default() -> Self {
        Self::Batched {
            max_entries: default_batch_entries(),
            max_interval_ms: default_batch_interval_ms(),
        }
    }
}

impl DurabilityPolicy {
    /// Parse the short names used by environment overrides.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "every_write" | "strict" => Some(Self::EveryWrite),
            "batched" => Some(Self::default()),
            "os_buffered" | "none" => Some(Self::OsBuffered),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::EveryWrite => "every_write",
            Self::Batched { .. } => "batched",
            Self::OsBuffered => "os_buffered",
        }
    }
}

#[derive(Debug, Error)]
pub enum TxLogError {
    #[error("transaction log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{path} is not a run log: {reason}")]
    BadHeader { path: PathBuf, reason: String },

    #[error("run log {path} is already open for writing by another process")]
    Locked { path: PathBuf },

    #[error("corrupt log entry at offset {offset} ({skipped} bytes skipped): {reason}")]
    Corrupt {
        offset: u64,
        skipped: u64,
        reason: &'static str,
    },

    #[error("log entry of {len} bytes exceeds the {max} byte limit")]
    EntryTooLarge { len: usize, max: u32 },

    #[error("undecodable log entry at offset {offset}: {source}")]
    Decode {
        offset: u64,
        #[source]
        source: serde_json::Error,
    },
}

impl TxLogError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) | Self::EntryTooLarge { .. } => ErrorClass::Durability,
            Self::Locked { .. } => ErrorClass::Race,
            Self::BadHeader { .. } | Self::Corrupt { .. } | Self::Decode { .. } => {
                ErrorClass::Corruption
            }
        }
    }

    /// True for errors confined to a single entry; reading can continue.
    #[must_use]
    pub const fn is_entry_local(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::Decode { .. })
    }
}

fn file_header() -> [u8; FILE_HEADER_LEN as usize] {
    let magic = LOG_MAGIC.to_le_bytes();
    [
        LOG_IDENT[0],
        LOG_IDENT[1],
        LOG_IDENT[2],
        LOG_IDENT[3],
        magic[0],
        magic[1],
        LOG_VERSION,
    ]
}

fn check_file_header(path: &Path, header: &[u8]) -> Result<(), TxLogError> {
    let bad = |reason: String| TxLogError::BadHeader {
        path: path.to_path_buf(),
        reason,
    };
    if header.len() < FILE_HEADER_LEN as usize {
        return Err(bad(format!("header is only {} bytes", header.len())));
    }
    if header[0..4] != LOG_IDENT {
        return Err(bad("identifier mismatch".to_string()));
    }
    let magic = u16::from_le_bytes([header[4], header[5]]);
    if magic != LOG_MAGIC {
        return Err(bad(format!("magic {magic:#06x}")));
    }
    if header[6] != LOG_VERSION {
        return Err(bad(format!("unsupported version {}", header[6])));
    }
    Ok(())
}

/// Frame a payload as one log entry.
pub fn encode_entry(payload: &[u8]) -> Result<Vec<u8>, TxLogError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_ENTRY_BYTES)
        .ok_or(TxLogError::EntryTooLarge {
            len: payload.len(),
            max: MAX_ENTRY_BYTES,
        })?;

    let mut frame = Vec::with_capacity(ENTRY_HEADER_LEN as usize + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    let header_crc = crc32fast::hash(&frame[0..8]);
    frame.extend_from_slice(&header_crc.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Length and payload checksum of a framed header, or `None` if the header
/// checksum does not validate.
fn parse_entry_header(header: &[u8]) -> Option<(u32, u32)> {
    let word = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let len = word(0);
    let payload_crc = word(4);
    let header_crc = word(8);
    (crc32fast::hash(&header[0..8]) == header_crc).then_some((len, payload_crc))
}

/// One decoded-from-disk entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Byte offset of the entry header.
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Offset just past this entry.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.offset + ENTRY_HEADER_LEN + self.payload.len() as u64
    }

    pub fn decode(&self) -> Result<Envelope, TxLogError> {
        Envelope::decode(&self.payload).map_err(|source| TxLogError::Decode {
            offset: self.offset,
            source,
        })
    }
}

/// What the writer found when it reopened an existing log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub valid_entries: u64,
    pub corrupt_spans: u64,
    pub truncated_bytes: u64,
}

/// Exclusive appender for a run log.
#[derive(Debug)]
pub struct TxLogWriter {
    path: PathBuf,
    file: File,
    next_offset: u64,
    entry_count: u64,
    policy: DurabilityPolicy,
    unsynced: usize,
    last_sync: Instant,
    recovery: RecoveryReport,
}

impl TxLogWriter {
    /// Open or create the log at `path`.
    ///
    /// An existing log is scanned; a torn tail left by a crash is truncated
    /// before anything new is appended.
    pub fn open(path: impl AsRef<Path>, policy: DurabilityPolicy) -> Result<Self, TxLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(TxLogError::Locked { path });
        }

        let len = file.metadata()?.len();
        let expected = file_header();
        let mut recovery = RecoveryReport::default();

        if len < FILE_HEADER_LEN {
            let mut existing = Vec::new();
            file.read_to_end(&mut existing)?;
            if !expected.starts_with(&existing) {
                check_file_header(&path, &existing)?;
            }
            // Fresh file, or a header torn during creation.
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&expected)?;
            file.sync_all()?;
        } else {
            let mut header = [0u8; FILE_HEADER_LEN as usize];
            file.read_exact(&mut header)?;
            check_file_header(&path, &header)?;

            let mut entries = Entries::open(&path, FILE_HEADER_LEN)?;
            for item in entries.by_ref() {
                match item {
                    Ok(_) => recovery.valid_entries += 1,
                    Err(TxLogError::Corrupt { .. }) => recovery.corrupt_spans += 1,
                    Err(err) => return Err(err),
                }
            }
            let valid_len = entries.position();
            if valid_len < len {
                recovery.truncated_bytes = len - valid_len;
                tracing::warn!(
                    path = %path.display(),
                    valid_len,
                    truncated_bytes = recovery.truncated_bytes,
                    "truncating torn tail of run log"
                );
                file.set_len(valid_len)?;
                file.sync_data()?;
            }
        }

        let next_offset = file.seek(SeekFrom::End(0))?;
        tracing::debug!(
            path = %path.display(),
            next_offset,
            entries = recovery.valid_entries,
            durability = policy.name(),
            "run log opened for append"
        );

        Ok(Self {
            path,
            file,
            next_offset,
            entry_count: recovery.valid_entries,
            policy,
            unsynced: 0,
            last_sync: Instant::now(),
            recovery,
        })
    }

    /// Append one payload; returns the offset its entry starts at.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64, TxLogError> {
        let frame = encode_entry(payload)?;
        let offset = self.next_offset;
        self.file.write_all(&frame)?;
        self.next_offset += frame.len() as u64;
        self.entry_count += 1;

        match self.policy {
            DurabilityPolicy::EveryWrite => self.sync()?,
            DurabilityPolicy::Batched {
                max_entries,
                max_interval_ms,
            } => {
                self.unsynced += 1;
                if self.unsynced >= max_entries.max(1)
                    || self.last_sync.elapsed() >= Duration::from_millis(max_interval_ms)
                {
                    self.sync()?;
                }
            }
            DurabilityPolicy::OsBuffered => self.unsynced += 1,
        }
        Ok(offset)
    }

    /// Force everything appended so far to stable storage.
    pub fn sync(&mut self) -> Result<(), TxLogError> {
        self.file.flush()?;
        self.file.sync_data()?;
        self.unsynced = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn next_offset(&self) -> u64 {
        self.next_offset
    }

    #[must_use]
    pub const fn entry_count(&self) -> u64 {
        self.entry_count
    }

    #[must_use]
    pub const fn recovery(&self) -> RecoveryReport {
        self.recovery
    }
}

/// Read-only view of a run log.
#[derive(Debug, Clone)]
pub struct TxLogReader {
    path: PathBuf,
}

impl TxLogReader {
    /// Open a log and validate its file header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TxLogError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let mut header = Vec::with_capacity(FILE_HEADER_LEN as usize);
        Read::by_ref(&mut file)
            .take(FILE_HEADER_LEN)
            .read_to_end(&mut header)?;
        check_file_header(&path, &header)?;
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the file.
    pub fn len(&self) -> Result<u64, TxLogError> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, TxLogError> {
        Ok(self.len()? <= FILE_HEADER_LEN)
    }

    /// Iterate entries starting at `offset` (clamped past the file header).
    ///
    /// The iterator sees the file as it was when created. Entries appended
    /// later are picked up by a new iterator started at
    /// [`Entries::position`].
    pub fn read_from(&self, offset: u64) -> Result<Entries, TxLogError> {
        Entries::open(&self.path, offset.max(FILE_HEADER_LEN))
    }
}

/// Lazy iterator over log entries.
#[derive(Debug)]
pub struct Entries {
    reader: BufReader<File>,
    position: u64,
    file_len: u64,
    finished: bool,
}

impl Entries {
    fn open(path: &Path, offset: u64) -> Result<Self, TxLogError> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            reader: BufReader::new(file),
            position: offset,
            file_len,
            finished: false,
        })
    }

    /// Offset of the next entry not yet yielded; resume from here.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    fn next_entry(&mut self) -> Result<Option<LogEntry>, TxLogError> {
        if self.position + ENTRY_HEADER_LEN > self.file_len {
            return Ok(None);
        }

        let mut header = [0u8; ENTRY_HEADER_LEN as usize];
        self.reader.read_exact(&mut header)?;
        let offset = self.position;

        let Some((len, payload_crc)) =
            parse_entry_header(&header).filter(|(len, _)| *len <= MAX_ENTRY_BYTES)
        else {
            let resumed_at = self.resync(offset)?;
            return Err(TxLogError::Corrupt {
                offset,
                skipped: resumed_at - offset,
                reason: "entry header checksum mismatch",
            });
        };

        let end = offset + ENTRY_HEADER_LEN + u64::from(len);
        if end > self.file_len {
            // Torn or still being written: not yet available.
            self.reader.seek(SeekFrom::Start(offset))?;
            return Ok(None);
        }

        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;
        self.position = end;

        if crc32fast::hash(&payload) != payload_crc {
            return Err(TxLogError::Corrupt {
                offset,
                skipped: end - offset,
                reason: "payload checksum mismatch",
            });
        }
        Ok(Some(LogEntry { offset, payload }))
    }

    /// Find the next offset after `corrupt_at` holding a plausible entry and
    /// position the reader there.
    fn resync(&mut self, corrupt_at: u64) -> Result<u64, TxLogError> {
        let start = corrupt_at + 1;
        self.reader.seek(SeekFrom::Start(start))?;
        let mut window = Vec::new();
        self.reader
            .by_ref()
            .take(self.file_len.saturating_sub(start))
            .read_to_end(&mut window)?;

        let header_len = ENTRY_HEADER_LEN as usize;
        let mut at = 0usize;
        while at + header_len <= window.len() {
            if let Some((len, payload_crc)) = parse_entry_header(&window[at..at + header_len]) {
                if len <= MAX_ENTRY_BYTES {
                    let body_end = at + header_len + len as usize;
                    // A valid header whose payload runs past the end is an
                    // entry still being written.
                    if body_end > window.len()
                        || crc32fast::hash(&window[at + header_len..body_end]) == payload_crc
                    {
                        break;
                    }
                }
            }
            at += 1;
        }

        let resumed_at = start + at as u64;
        self.reader.seek(SeekFrom::Start(resumed_at))?;
        self.position = resumed_at;
        Ok(resumed_at)
    }
}

impl Iterator for Entries {
    type Item = Result<LogEntry, TxLogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err @ TxLogError::Corrupt { .. }) => Some(Err(err)),
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn log_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join(LOG_FILE_NAME)
    }

    fn collect_ok(reader: &TxLogReader, from: u64) -> Vec<Vec<u8>> {
        reader
            .read_from(from)
            .unwrap()
            .filter_map(Result::ok)
            .map(|entry| entry.payload)
            .collect()
    }

    #[test]
    fn new_log_has_only_header() {
        let dir = tempdir().unwrap();
        let path = log_path(&dir);
        let writer = TxLogWriter::open(&path, DurabilityPolicy::EveryWrite).unwrap();
        assert_eq!(writer.next_offset(), FILE_HEADER_LEN);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b":RSL");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 0xBEE1);
        assert_eq!(bytes[6], 1);
    }

    #[test]
    fn append_returns_increasing_offsets_and_reads_back_in_order() {
        let dir = tempdir().unwrap();
        let path = log_path(&dir);
        let mut writer = TxLogWriter::open(&path, DurabilityPolicy::EveryWrite).unwrap();
        let a = writer.append(b"alpha").unwrap();
        let b = writer.append(b"beta").unwrap();
        let c = writer.append(b"").unwrap();
        assert_eq!(a, FILE_HEADER_LEN);
        assert!(a < b && b < c);

        let reader = TxLogReader::open(&path).unwrap();
        let entries: Vec<LogEntry> = reader.read_from(0).unwrap().map(Result::unwrap).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].offset, a);
        assert_eq!(entries[1].offset, b);
        assert_eq!(entries[1].payload, b"beta");
        assert_eq!(entries[2].next_offset(), writer.next_offset());
    }

    #[test]
    fn truncated_tail_is_not_yet_available() {
        let dir = tempdir().unwrap();
        let path = log_path(&dir);
        let mut writer = TxLogWriter::open(&path, DurabilityPolicy::EveryWrite).unwrap();
        writer.append(b"complete").unwrap();
        let boundary = writer.next_offset();
        writer.append(b"will be torn").unwrap();
        drop(writer);

        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let reader = TxLogReader::open(&path).unwrap();
        let mut entries = reader.read_from(0).unwrap();
        assert_eq!(entries.next().unwrap().unwrap().payload, b"complete");
        assert!(entries.next().is_none());
        assert_eq!(entries.position(), boundary);
    }

    #[test]
    fn reopen_truncates_torn_tail_and_appends_cleanly() {
        let dir = tempdir().unwrap();
        let path = log_path(&dir);
        let mut writer = TxLogWriter::open(&path, DurabilityPolicy::EveryWrite).unwrap();
        writer.append(b"one").unwrap();
        let boundary = writer.next_offset();
        drop(writer);

        // Simulate a crash halfway through the next frame.
        let frame = encode_entry(b"two-two-two").unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame[..frame.len() / 2]).unwrap();
        drop(file);

        let mut writer = TxLogWriter::open(&path, DurabilityPolicy::EveryWrite).unwrap();
        assert_eq!(writer.next_offset(), boundary);
        assert_eq!(writer.recovery().valid_entries, 1);
        assert!(writer.recovery().truncated_bytes > 0);
        writer.append(b"three").unwrap();

        let reader = TxLogReader::open(&path).unwrap();
        assert_eq!(collect_ok(&reader, 0), vec![b"one".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn payload_corruption_is_isolated_to_the_entry() {
        let dir = tempdir().unwrap();
        let path = log_path(&dir);
        let mut writer = TxLogWriter::open(&path, DurabilityPolicy::EveryWrite).unwrap();
        writer.append(b"first").unwrap();
        let damaged = writer.append(b"second").unwrap();
        writer.append(b"third").unwrap();
        drop(writer);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[(damaged + ENTRY_HEADER_LEN) as usize] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let reader = TxLogReader::open(&path).unwrap();
        let items: Vec<_> = reader.read_from(0).unwrap().collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().payload, b"first");
        match &items[1] {
            Err(TxLogError::Corrupt { offset, .. }) => assert_eq!(*offset, damaged),
            other => panic!("expected corruption, got {other:?}"),
        }
        assert_eq!(items[2].as_ref().unwrap().payload, b"third");
    }

    #[test]
    fn header_corruption_resyncs_to_next_entry() {
        let dir = tempdir().unwrap();
        let path = log_path(&dir);
        let mut writer = TxLogWriter::open(&path, DurabilityPolicy::EveryWrite).unwrap();
        writer.append(b"first").unwrap();
        let damaged = writer.append(b"second entry").unwrap();
        let survivor = writer.append(b"third").unwrap();
        drop(writer);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[damaged as usize] ^= 0x40;
        std::fs::write(&path, &bytes).unwrap();

        let reader = TxLogReader::open(&path).unwrap();
        let items: Vec<_> = reader.read_from(0).unwrap().collect();
        assert_eq!(items.len(), 3);
        match &items[1] {
            Err(TxLogError::Corrupt {
                offset, skipped, ..
            }) => {
                assert_eq!(*offset, damaged);
                assert_eq!(offset + skipped, survivor);
            }
            other => panic!("expected corruption, got {other:?}"),
        }
        assert_eq!(items[2].as_ref().unwrap().offset, survivor);
    }

    #[test]
    fn restarted_iterator_sees_later_appends() {
        let dir = tempdir().unwrap();
        let path = log_path(&dir);
        let mut writer = TxLogWriter::open(&path, DurabilityPolicy::OsBuffered).unwrap();
        writer.append(b"a").unwrap();

        let reader = TxLogReader::open(&path).unwrap();
        let mut entries = reader.read_from(0).unwrap();
        assert_eq!(entries.by_ref().count(), 1);
        let resume = entries.position();

        writer.append(b"b").unwrap();
        writer.append(b"c").unwrap();
        assert_eq!(collect_ok(&reader, resume), vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn second_writer_is_rejected() {
        let dir = tempdir().unwrap();
        let path = log_path(&dir);
        let _writer = TxLogWriter::open(&path, DurabilityPolicy::EveryWrite).unwrap();
        let err = TxLogWriter::open(&path, DurabilityPolicy::EveryWrite).unwrap_err();
        assert!(matches!(err, TxLogError::Locked { .. }));
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = log_path(&dir);
        std::fs::write(&path, b"definitely not a log").unwrap();
        assert!(matches!(
            TxLogReader::open(&path).unwrap_err(),
            TxLogError::BadHeader { .. }
        ));
        assert!(matches!(
            TxLogWriter::open(&path, DurabilityPolicy::EveryWrite).unwrap_err(),
            TxLogError::BadHeader { .. }
        ));
    }

    #[test]
    fn torn_file_header_is_rewritten() {
        let dir = tempdir().unwrap();
        let path = log_path(&dir);
        std::fs::write(&path, b":RS").unwrap();
        let writer = TxLogWriter::open(&path, DurabilityPolicy::EveryWrite).unwrap();
        assert_eq!(writer.next_offset(), FILE_HEADER_LEN);
    }

    #[test]
    fn batched_policy_counts_unsynced_entries() {
        let dir = tempdir().unwrap();
        let policy = DurabilityPolicy::Batched {
            max_entries: 3,
            max_interval_ms: 60_000,
        };
        let mut writer = TxLogWriter::open(log_path(&dir), policy).unwrap();
        writer.append(b"1").unwrap();
        writer.append(b"2").unwrap();
        assert_eq!(writer.unsynced, 2);
        writer.append(b"3").unwrap();
        assert_eq!(writer.unsynced, 0);
    }

    #[test]
    fn durability_names_parse() {
        assert_eq!(
            DurabilityPolicy::from_name("every_write"),
            Some(DurabilityPolicy::EveryWrite)
        );
        assert_eq!(
            DurabilityPolicy::from_name("OS-Buffered"),
            Some(DurabilityPolicy::OsBuffered)
        );
        assert!(matches!(
            DurabilityPolicy::from_name("batched"),
            Some(DurabilityPolicy::Batched { .. })
        ));
        assert_eq!(DurabilityPolicy::from_name("sometimes"), None);
    }

    #[test]
    fn error_classes() {
        let corrupt = TxLogError::Corrupt {
            offset: 7,
            skipped: 12,
            reason: "payload checksum mismatch",
        };
        assert_eq!(corrupt.class(), ErrorClass::Corruption);
        assert!(corrupt.is_entry_local());
        let io = TxLogError::Io(io::Error::other("disk full"));
        assert_eq!(io.class(), ErrorClass::Durability);
        assert!(!io.is_entry_local());
    }
}
