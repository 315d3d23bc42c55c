//! SQLite metadata kept next to a run log.
//!
//! Holds what the append-only log itself cannot: run identity, upload
//! checkpoints (log offset plus per-stream line offsets) and per-target sync
//! markers. The schema evolves through an ordered, forward-only list of
//! migrations applied in one `EXCLUSIVE` transaction, so a reader never sees
//! a half-migrated store and two processes opening the store at once cannot
//! both migrate it.

use crate::error::ErrorClass;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name of the store inside a run directory.
pub const META_DB_NAME: &str = "meta.db";

/// Checkpoint consumer name used by the live uploader.
pub const LIVE_UPLOADER: &str = "uploader";

/// One forward-only schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// The schema, oldest step first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "log_meta",
        sql: "CREATE TABLE log_meta (
                  key TEXT PRIMARY KEY,
                  value TEXT NOT NULL
              );",
    },
    Migration {
        version: 2,
        name: "upload_checkpoints",
        sql: "CREATE TABLE upload_checkpoints (
                  consumer TEXT PRIMARY KEY,
                  log_offset INTEGER NOT NULL,
                  dropped_chunks INTEGER NOT NULL DEFAULT 0,
                  updated_at_ms INTEGER NOT NULL
              );
              CREATE TABLE stream_offsets (
                  consumer TEXT NOT NULL,
                  stream TEXT NOT NULL,
                  line_offset INTEGER NOT NULL,
                  PRIMARY KEY (consumer, stream)
              );",
    },
    Migration {
        version: 3,
        name: "checkpoint_completion",
        sql: "ALTER TABLE upload_checkpoints ADD COLUMN complete INTEGER NOT NULL DEFAULT 0;",
    },
];

#[derive(Debug, Error)]
pub enum MetaStoreError {
    #[error("metadata store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("metadata store schema v{found} is newer than supported v{supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("migration v{version} ({name}) failed: {source}")]
    MigrationFailed {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("checkpoint for {consumer} would move backwards ({current} -> {requested})")]
    CheckpointRegression {
        consumer: String,
        current: u64,
        requested: u64,
    },

    #[error("malformed metadata value for {key}: {reason}")]
    Malformed { key: String, reason: String },

    #[error("metadata store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MetaStoreError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Sqlite(_) | Self::MigrationFailed { .. } | Self::Io(_) => ErrorClass::Durability,
            Self::SchemaTooNew { .. } => ErrorClass::Config,
            Self::CheckpointRegression { .. } => ErrorClass::Race,
            Self::Malformed { .. } => ErrorClass::Corruption,
        }
    }
}

/// Progress of one consumer through the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    /// Next log byte offset to read.
    pub log_offset: u64,
    /// Next line offset per stream file name.
    pub stream_offsets: BTreeMap<String, u64>,
    pub dropped_chunks: u64,
    /// The final request (exit code) was acknowledged.
    pub complete: bool,
    pub updated_at_ms: u64,
}

/// Identity of the run a log belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRunInfo {
    pub entity: String,
    pub project: String,
    pub run_id: String,
    pub started_at_ms: u64,
    pub format_version: u8,
}

pub struct MetaStore {
    conn: Connection,
    path: PathBuf,
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore").field("path", &self.path).finish()
    }
}

impl MetaStore {
    /// Open (creating and migrating as needed) the store in `log_dir`.
    pub fn open(log_dir: impl AsRef<Path>) -> Result<Self, MetaStoreError> {
        Self::open_with_migrations(log_dir.as_ref().join(META_DB_NAME), MIGRATIONS)
    }

    /// Open a store at an explicit path with an explicit migration list.
    pub fn open_with_migrations(
        path: impl AsRef<Path>,
        migrations: &[Migration],
    ) -> Result<Self, MetaStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let version = apply_migrations(&mut conn, migrations)?;
        tracing::debug!(path = %path.display(), schema_version = version, "metadata store ready");
        Ok(Self { conn, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> Result<u32, MetaStoreError> {
        current_version(&self.conn)
    }

    // ── Key/value metadata ──

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), MetaStoreError> {
        self.conn.execute(
            "INSERT INTO log_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, MetaStoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM log_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn record_run_info(&self, info: &StoredRunInfo) -> Result<(), MetaStoreError> {
        let encoded = serde_json::to_string(info).map_err(|e| MetaStoreError::Malformed {
            key: "run_info".to_string(),
            reason: e.to_string(),
        })?;
        self.set_meta("run_info", &encoded)
    }

    pub fn run_info(&self) -> Result<Option<StoredRunInfo>, MetaStoreError> {
        self.get_meta("run_info")?
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| MetaStoreError::Malformed {
                    key: "run_info".to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    // ── Checkpoints ──

    pub fn load_checkpoint(&self, consumer: &str) -> Result<Option<UploadCheckpoint>, MetaStoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT log_offset, dropped_chunks, complete, updated_at_ms
                 FROM upload_checkpoints WHERE consumer = ?1",
                params![consumer],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((log_offset, dropped, complete, updated_at_ms)) = row else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare("SELECT stream, line_offset FROM stream_offsets WHERE consumer = ?1")?;
        let stream_offsets = stmt
            .query_map(params![consumer], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Some(UploadCheckpoint {
            log_offset: log_offset as u64,
            stream_offsets,
            dropped_chunks: dropped as u64,
            complete,
            updated_at_ms: updated_at_ms as u64,
        }))
    }

    /// Persist a consumer's progress. The log offset may never move
    /// backwards.
    pub fn commit_checkpoint(
        &mut self,
        consumer: &str,
        checkpoint: &UploadCheckpoint,
    ) -> Result<(), MetaStoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT log_offset FROM upload_checkpoints WHERE consumer = ?1",
                params![consumer],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(current) = current {
            if (current as u64) > checkpoint.log_offset {
                return Err(MetaStoreError::CheckpointRegression {
                    consumer: consumer.to_string(),
                    current: current as u64,
                    requested: checkpoint.log_offset,
                });
            }
        }

        tx.execute(
            "INSERT INTO upload_checkpoints (consumer, log_offset, dropped_chunks, complete, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(consumer) DO UPDATE SET
                 log_offset = excluded.log_offset,
                 dropped_chunks = excluded.dropped_chunks,
                 complete = excluded.complete,
                 updated_at_ms = excluded.updated_at_ms",
            params![
                consumer,
                checkpoint.log_offset as i64,
                checkpoint.dropped_chunks as i64,
                checkpoint.complete,
                checkpoint.updated_at_ms as i64,
            ],
        )?;
        for (stream, offset) in &checkpoint.stream_offsets {
            tx.execute(
                "INSERT INTO stream_offsets (consumer, stream, line_offset) VALUES (?1, ?2, ?3)
                 ON CONFLICT(consumer, stream) DO UPDATE SET line_offset = excluded.line_offset",
                params![consumer, stream, *offset as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Every consumer with a checkpoint, by name.
    pub fn checkpoints(&self) -> Result<BTreeMap<String, UploadCheckpoint>, MetaStoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT consumer FROM upload_checkpoints ORDER BY consumer")?;
        let consumers = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = BTreeMap::new();
        for consumer in consumers {
            if let Some(checkpoint) = self.load_checkpoint(&consumer)? {
                out.insert(consumer, checkpoint);
            }
        }
        Ok(out)
    }
}

/// Checkpoint consumer name for a sync target.
#[must_use]
pub fn sync_marker_name(target_key: &str) -> String {
    format!("sync:{target_key}")
}

fn current_version(conn: &Connection) -> Result<u32, MetaStoreError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }
    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version as u32)
}

fn apply_migrations(conn: &mut Connection, migrations: &[Migration]) -> Result<u32, MetaStoreError> {
    let supported = migrations.last().map_or(0, |m| m.version);
    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             version INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             applied_at_ms INTEGER NOT NULL
         );",
    )?;
    let current = current_version(&tx)?;
    if current > supported {
        return Err(MetaStoreError::SchemaTooNew {
            found: current,
            supported,
        });
    }

    let now = crate::record::epoch_ms_now() as i64;
    for migration in migrations.iter().filter(|m| m.version > current) {
        tx.execute_batch(migration.sql)
            .map_err(|source| MetaStoreError::MigrationFailed {
                version: migration.version,
                name: migration.name,
                source,
            })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at_ms) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, now],
        )?;
        tracing::info!(version = migration.version, name = migration.name, "applied metadata migration");
    }
    tx.commit()?;
    Ok(supported.max(current))
}
