//! SQLite-backed skill store implementation.
//!
//! One write connection serializes commits (the per-name compare-and-swap
//! happens inside a single transaction); a small pool of read-only
//! connections serves gets, history and replay concurrently.

use super::models::{CommitRequest, ReplayEntry, VersionRecord};
use super::schema::SKILL_STORE_VERSIONED_SCHEMAS;
use super::trait_def::SkillStore;
use crate::error::RegistryError;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

const BASE_DB_VERSION: usize = 7200;

/// SQLite-backed versioned skill store.
#[derive(Clone)]
pub struct SqliteSkillStore {
    write_conn: Arc<Mutex<Connection>>,
    read_pool: Vec<Arc<Mutex<Connection>>>,
    read_index: Arc<AtomicUsize>,
}

fn migrate_if_needed(conn: &mut Connection) -> Result<()> {
    let db_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

    let latest = SKILL_STORE_VERSIONED_SCHEMAS.last().unwrap();
    let current = if db_version < BASE_DB_VERSION as i64 {
        0
    } else {
        (db_version - BASE_DB_VERSION as i64) as usize
    };

    if current >= latest.version {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for schema in SKILL_STORE_VERSIONED_SCHEMAS.iter().skip(current) {
        info!("Applying skill store schema version {}", schema.version);
        tx.execute_batch(schema.up)?;
    }
    tx.pragma_update(None, "user_version", BASE_DB_VERSION + latest.version)?;
    tx.commit()?;
    Ok(())
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

impl SqliteSkillStore {
    /// Open (creating if needed) the store at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        Self::with_read_pool_size(db_path, 4)
    }

    pub fn with_read_pool_size<P: AsRef<Path>>(db_path: P, read_pool_size: usize) -> Result<Self> {
        let db_path_ref = db_path.as_ref();

        let mut write_conn = Connection::open_with_flags(
            db_path_ref,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open skill database")?;

        migrate_if_needed(&mut write_conn)?;
        write_conn.pragma_update(None, "journal_mode", "WAL")?;

        let skill_count: i64 = write_conn
            .query_row("SELECT COUNT(*) FROM skills WHERE deleted = 0", [], |r| {
                r.get(0)
            })
            .unwrap_or(0);
        let version_count: i64 = write_conn
            .query_row("SELECT COUNT(*) FROM skill_versions", [], |r| r.get(0))
            .unwrap_or(0);
        info!(
            "Opened skill store: {} live skills, {} versions",
            skill_count, version_count
        );

        let mut read_pool = Vec::with_capacity(read_pool_size);
        for _ in 0..read_pool_size {
            let read_conn = Connection::open_with_flags(
                db_path_ref,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            read_conn.pragma_update(None, "journal_mode", "WAL")?;
            read_pool.push(Arc::new(Mutex::new(read_conn)));
        }

        Ok(SqliteSkillStore {
            write_conn: Arc::new(Mutex::new(write_conn)),
            read_pool,
            read_index: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn get_read_conn(&self) -> Arc<Mutex<Connection>> {
        let index = self.read_index.fetch_add(1, Ordering::SeqCst) % self.read_pool.len();
        self.read_pool[index].clone()
    }

    /// Parse a VersionRecord from a full `skill_versions` row
    /// (seq, name, version, parent_version, content, content_hash,
    /// description, tags, author_id, tombstone, created_at).
    fn parse_version_row(row: &rusqlite::Row) -> rusqlite::Result<VersionRecord> {
        let tags_json: String = row.get(7)?;
        Ok(VersionRecord {
            seq: row.get::<_, i64>(0)? as u64,
            name: row.get(1)?,
            version: row.get::<_, i64>(2)? as u64,
            parent_version: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
            content: row.get(4)?,
            content_hash: row.get(5)?,
            description: row.get(6)?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            author_id: row.get(8)?,
            tombstone: row.get::<_, i32>(9)? != 0,
            created_at: row.get(10)?,
        })
    }

    fn select_version(
        conn: &Connection,
        name: &str,
        version: u64,
    ) -> Result<Option<VersionRecord>, RegistryError> {
        let mut stmt = conn.prepare_cached(
            "SELECT seq, name, version, parent_version, content, content_hash, description, \
             tags, author_id, tombstone, created_at \
             FROM skill_versions WHERE name = ?1 AND version = ?2",
        )?;
        match stmt.query_row(params![name, version as i64], Self::parse_version_row) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Current (latest_version, deleted) for a name, if any.
    fn skill_head(conn: &Connection, name: &str) -> Result<Option<(u64, bool)>, RegistryError> {
        let mut stmt =
            conn.prepare_cached("SELECT latest_version, deleted FROM skills WHERE name = ?1")?;
        match stmt.query_row(params![name], |r| {
            Ok((r.get::<_, i64>(0)? as u64, r.get::<_, i32>(1)? != 0))
        }) {
            Ok(head) => Ok(Some(head)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert a version row plus the head upsert, returning the commit
    /// sequence SQLite assigned to the row.
    fn insert_version(tx: &rusqlite::Transaction, record: &VersionRecord) -> Result<u64, RegistryError> {
        tx.execute(
            "INSERT INTO skill_versions \
             (name, version, parent_version, content, content_hash, description, tags, \
              author_id, tombstone, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.name,
                record.version as i64,
                record.parent_version.map(|v| v as i64),
                record.content,
                record.content_hash,
                record.description,
                serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string()),
                record.author_id,
                record.tombstone as i32,
                record.created_at,
            ],
        )?;
        let seq = tx.last_insert_rowid() as u64;
        tx.execute(
            "INSERT INTO skills (name, latest_version, deleted) VALUES (?1, ?2, ?3) \
             ON CONFLICT(name) DO UPDATE SET latest_version = ?2, deleted = ?3",
            params![record.name, record.version as i64, record.tombstone as i32],
        )?;
        Ok(seq)
    }
}

impl SkillStore for SqliteSkillStore {
    fn commit(&self, req: CommitRequest) -> Result<VersionRecord, RegistryError> {
        let mut conn = self.write_conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(RegistryError::from)?;

        let head = Self::skill_head(&tx, &req.name)?;
        let (parent, version) = match head {
            None => {
                if req.expected_parent.is_some() {
                    return Err(RegistryError::Conflict {
                        name: req.name,
                        expected: req.expected_parent,
                        latest: None,
                    });
                }
                (None, 1)
            }
            Some((latest, deleted)) => {
                // A tombstoned name can be recreated either with the tombstone
                // version as parent or with no parent at all; a live name
                // requires an exact parent match.
                let matches = req.expected_parent == Some(latest)
                    || (deleted && req.expected_parent.is_none());
                if !matches {
                    return Err(RegistryError::Conflict {
                        name: req.name,
                        expected: req.expected_parent,
                        latest: Some(latest),
                    });
                }
                (Some(latest), latest + 1)
            }
        };

        let mut record = VersionRecord {
            seq: 0,
            content_hash: content_hash(&req.content),
            name: req.name,
            version,
            parent_version: parent,
            content: req.content,
            description: req.description,
            tags: req.tags,
            author_id: req.author_id,
            tombstone: false,
            created_at: now(),
        };

        record.seq = Self::insert_version(&tx, &record)?;
        tx.commit().map_err(RegistryError::from)?;
        Ok(record)
    }

    fn get(&self, name: &str, version: Option<u64>) -> Result<VersionRecord, RegistryError> {
        let conn = self.get_read_conn();
        let conn = conn.lock().unwrap();

        let version = match version {
            Some(v) => v,
            None => match Self::skill_head(&conn, name)? {
                Some((latest, false)) => latest,
                // Tombstoned or unknown: latest does not resolve.
                _ => return Err(RegistryError::NotFound(name.to_string())),
            },
        };

        Self::select_version(&conn, name, version)?
            .ok_or_else(|| RegistryError::NotFound(format!("{}@{}", name, version)))
    }

    fn history(&self, name: &str) -> Result<Vec<VersionRecord>, RegistryError> {
        let conn = self.get_read_conn();
        let conn = conn.lock().unwrap();

        let mut stmt = conn.prepare_cached(
            "SELECT seq, name, version, parent_version, content, content_hash, description, \
             tags, author_id, tombstone, created_at \
             FROM skill_versions WHERE name = ?1 ORDER BY version ASC",
        )?;
        let records = stmt
            .query_map(params![name], Self::parse_version_row)?
            .collect::<Result<Vec<_>, _>>()?;

        if records.is_empty() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(records)
    }

    fn delete(&self, name: &str, author_id: &str) -> Result<VersionRecord, RegistryError> {
        let mut conn = self.write_conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(RegistryError::from)?;

        let (latest, deleted) = Self::skill_head(&tx, name)?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if deleted {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        let mut record = VersionRecord {
            seq: 0,
            name: name.to_string(),
            version: latest + 1,
            parent_version: Some(latest),
            content_hash: content_hash(&[]),
            content: Vec::new(),
            description: String::new(),
            tags: Vec::new(),
            author_id: author_id.to_string(),
            tombstone: true,
            created_at: now(),
        };

        record.seq = Self::insert_version(&tx, &record)?;
        tx.commit().map_err(RegistryError::from)?;
        Ok(record)
    }

    fn replay(&self) -> Result<Vec<ReplayEntry>, RegistryError> {
        let conn = self.get_read_conn();
        let conn = conn.lock().unwrap();

        let mut stmt = conn.prepare_cached(
            "SELECT seq, name, version, tombstone, created_at FROM skill_versions ORDER BY seq ASC",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(ReplayEntry {
                    seq: row.get::<_, i64>(0)? as u64,
                    name: row.get(1)?,
                    version: row.get::<_, i64>(2)? as u64,
                    tombstone: row.get::<_, i32>(3)? != 0,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn latest_records(&self) -> Result<Vec<VersionRecord>, RegistryError> {
        let conn = self.get_read_conn();
        let conn = conn.lock().unwrap();

        let mut stmt = conn.prepare_cached(
            "SELECT v.seq, v.name, v.version, v.parent_version, v.content, v.content_hash, \
             v.description, v.tags, v.author_id, v.tombstone, v.created_at \
             FROM skill_versions v \
             JOIN skills s ON s.name = v.name AND s.latest_version = v.version \
             WHERE s.deleted = 0 ORDER BY v.name ASC",
        )?;
        let records = stmt
            .query_map([], Self::parse_version_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn skill_count(&self) -> usize {
        let conn = self.get_read_conn();
        let conn = conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM skills WHERE deleted = 0", [], |r| {
            r.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }
}
