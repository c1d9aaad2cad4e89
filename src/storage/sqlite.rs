//! SQLite storage backend.
//!
//! One database holds both queue kinds, their dead-letter tables, the
//! processing locks, and a schema-version record. WAL journaling makes a
//! committed write survive an abrupt process stop.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::types::{now_ms, DeadLetterMessage, QueueRecord};

use super::StorageBackend;

const SCHEMA_VERSION: i64 = 1;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Shared handle to the queue database.
///
/// A single connection behind a mutex serializes conflicting writers; WAL mode
/// keeps readers unblocked during writes.
#[derive(Clone)]
pub struct QueueDb {
    conn: Arc<Mutex<Connection>>,
}

impl QueueDb {
    /// Open (creating if needed) the queue database and initialize the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::configure(conn, DEFAULT_BUSY_TIMEOUT_MS)
    }

    /// Open with an explicit busy timeout.
    pub fn open_with_timeout(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::configure(conn, busy_timeout_ms)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?, DEFAULT_BUSY_TIMEOUT_MS)
    }

    fn configure(conn: Connection, busy_timeout_ms: u64) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", busy_timeout_ms as i64)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Checkpoint the WAL and release the handle.
    pub fn close(self) {
        let conn = self.lock();
        // wal_checkpoint returns a result row, so execute() would reject it.
        if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
            tracing::warn!("WAL checkpoint on close failed: {}", e);
        }
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS inbound_queue (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at INTEGER,
            last_error TEXT,
            record TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_inbound_enqueued ON inbound_queue(enqueued_at);
        CREATE INDEX IF NOT EXISTS idx_inbound_session ON inbound_queue(session_id);
        CREATE TABLE IF NOT EXISTS outbound_queue (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at INTEGER,
            last_error TEXT,
            record TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_outbound_enqueued ON outbound_queue(enqueued_at);
        CREATE INDEX IF NOT EXISTS idx_outbound_session ON outbound_queue(session_id);
        CREATE TABLE IF NOT EXISTS inbound_dead_letter (
            id TEXT PRIMARY KEY,
            original TEXT NOT NULL,
            reason TEXT NOT NULL,
            moved_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS outbound_dead_letter (
            id TEXT PRIMARY KEY,
            original TEXT NOT NULL,
            reason TEXT NOT NULL,
            moved_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS processing_locks (
            session_id TEXT NOT NULL,
            lock_type TEXT NOT NULL,
            worker_id TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (session_id, lock_type)
        );
        CREATE INDEX IF NOT EXISTS idx_locks_expires ON processing_locks(expires_at);
        "#,
    )?;

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(v) if v != SCHEMA_VERSION => {
            return Err(Error::Storage(format!(
                "unsupported queue schema version {} (expected {})",
                v, SCHEMA_VERSION
            )));
        }
        Some(_) => {}
    }
    Ok(())
}

/// SQLite-backed store for a single queue kind.
pub struct SqliteBackend<M: QueueRecord> {
    db: QueueDb,
    _marker: PhantomData<M>,
}

impl<M: QueueRecord> SqliteBackend<M> {
    pub fn new(db: QueueDb) -> Self {
        Self {
            db,
            _marker: PhantomData,
        }
    }

    pub fn db(&self) -> &QueueDb {
        &self.db
    }

    fn parse_record(raw: &str) -> Result<M> {
        serde_json::from_str(raw)
            .map_err(|e| Error::Storage(format!("corrupt queue record: {}", e)))
    }
}

impl<M: QueueRecord> StorageBackend<M> for SqliteBackend<M> {
    fn create(&self, message: &M) -> Result<()> {
        let conn = self.db.lock();
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {}
                 (id, session_id, enqueued_at, retry_count, next_retry_at, last_error, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                M::KIND.table()
            ),
            params![
                message.id(),
                message.session_id(),
                message.enqueued_at(),
                message.retry_count(),
                message.next_retry_at(),
                message.last_error(),
                serde_json::to_string(message)?,
            ],
        )?;
        if inserted == 0 {
            return Err(Error::Storage(format!(
                "duplicate queue record id {}",
                message.id()
            )));
        }
        Ok(())
    }

    fn read(&self, id: &str) -> Result<Option<M>> {
        let conn = self.db.lock();
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT record FROM {} WHERE id = ?1", M::KIND.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| Self::parse_record(&r)).transpose()
    }

    fn update(&self, id: &str, mutate: &mut dyn FnMut(&mut M)) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let raw: Option<String> = tx
            .query_row(
                &format!("SELECT record FROM {} WHERE id = ?1", M::KIND.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let mut record =
            Self::parse_record(&raw.ok_or_else(|| Error::NotFound(format!("queue record {}", id)))?)?;
        mutate(&mut record);

        tx.execute(
            &format!(
                "UPDATE {}
                 SET retry_count = ?2, next_retry_at = ?3, last_error = ?4, record = ?5
                 WHERE id = ?1",
                M::KIND.table()
            ),
            params![
                id,
                record.retry_count(),
                record.next_retry_at(),
                record.last_error(),
                serde_json::to_string(&record)?,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let conn = self.db.lock();
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", M::KIND.table()),
            params![id],
        )?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("queue record {}", id)));
        }
        Ok(())
    }

    fn list_pending(&self) -> Result<Vec<M>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT record FROM {} ORDER BY enqueued_at ASC, id ASC",
            M::KIND.table()
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(Self::parse_record(&raw?)?);
        }
        Ok(records)
    }

    fn move_to_dead_letter(&self, id: &str, reason: &str) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let raw: Option<String> = tx
            .query_row(
                &format!("SELECT record FROM {} WHERE id = ?1", M::KIND.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let record =
            Self::parse_record(&raw.ok_or_else(|| Error::NotFound(format!("queue record {}", id)))?)?;

        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {}
                 (id, original, reason, moved_at, retry_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                M::KIND.dead_letter_table()
            ),
            params![
                id,
                serde_json::to_string(&record)?,
                reason,
                now_ms(),
                record.retry_count(),
            ],
        )?;
        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", M::KIND.table()),
            params![id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetterMessage>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, original, reason, moved_at, retry_count
             FROM {} ORDER BY moved_at ASC, id ASC",
            M::KIND.dead_letter_table()
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, u32>(4)?,
            ))
        })?;

        let mut letters = Vec::new();
        for row in rows {
            let (id, original, reason, moved_at, retry_count) = row?;
            letters.push(DeadLetterMessage {
                id,
                original: serde_json::from_str(&original)
                    .map_err(|e| Error::Storage(format!("corrupt dead-letter record: {}", e)))?,
                reason,
                moved_at,
                retry_count,
            });
        }
        Ok(letters)
    }

    fn count_pending(&self) -> Result<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", M::KIND.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn count_dead_letters(&self) -> Result<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", M::KIND.dead_letter_table()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
