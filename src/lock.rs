//! Session-scoped processing locks.
//!
//! At most one worker may process a given session's messages at a time. Locks
//! auto-expire after their TTL so a crashed worker cannot block a session
//! forever; releasing a lock the caller no longer holds is a no-op to
//! tolerate late releases after TTL reclamation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rusqlite::params;

use crate::error::{Error, Result};
use crate::storage::QueueDb;
use crate::types::{now_ms, ProcessingLock, QueueKind};

/// Default lock TTL - a worker that goes silent this long loses its session.
pub const DEFAULT_LOCK_TTL_MS: i64 = 30_000;

/// Worker identity for this process.
pub fn default_worker_id() -> String {
    format!("worker-{}-{}", std::process::id(), now_ms())
}

/// Mutual exclusion per session, one lock type per queue kind.
pub trait LockManager: Send {
    /// Atomically take the session lock. Returns false when another worker
    /// holds an unexpired lock.
    fn acquire(&self, session_id: &str, worker_id: &str, ttl_ms: i64) -> Result<bool>;

    /// Release the lock if (and only if) `worker_id` holds it.
    fn release(&self, session_id: &str, worker_id: &str) -> Result<()>;

    /// Extend a held lock's expiry. Returns false when the lock was lost.
    fn renew(&self, session_id: &str, worker_id: &str, ttl_ms: i64) -> Result<bool>;

    /// Whether any worker holds an unexpired lock on the session.
    fn is_held(&self, session_id: &str) -> Result<bool>;

    /// Drop expired locks; returns how many were removed.
    fn cleanup_expired(&self) -> Result<usize>;

    /// Unexpired locks, oldest first.
    fn active_locks(&self) -> Result<Vec<ProcessingLock>>;
}

/// Lock manager backed by the queue database.
pub struct SqliteLockManager {
    db: QueueDb,
    kind: QueueKind,
}

impl SqliteLockManager {
    pub fn new(db: QueueDb, kind: QueueKind) -> Self {
        Self { db, kind }
    }
}

impl LockManager for SqliteLockManager {
    fn acquire(&self, session_id: &str, worker_id: &str, ttl_ms: i64) -> Result<bool> {
        let now = now_ms();
        let conn = self.db.lock();
        // Single check-and-set statement: insert wins a free slot, the update
        // arm only fires when the existing lock has expired.
        let changes = conn.execute(
            "INSERT INTO processing_locks
             (session_id, lock_type, worker_id, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id, lock_type) DO UPDATE SET
               worker_id = excluded.worker_id,
               acquired_at = excluded.acquired_at,
               expires_at = excluded.expires_at
             WHERE processing_locks.expires_at < ?4",
            params![session_id, self.kind.to_string(), worker_id, now, now + ttl_ms],
        )?;
        Ok(changes > 0)
    }

    fn release(&self, session_id: &str, worker_id: &str) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "DELETE FROM processing_locks
             WHERE session_id = ?1 AND lock_type = ?2 AND worker_id = ?3",
            params![session_id, self.kind.to_string(), worker_id],
        )?;
        Ok(())
    }

    fn renew(&self, session_id: &str, worker_id: &str, ttl_ms: i64) -> Result<bool> {
        let now = now_ms();
        let conn = self.db.lock();
        let changes = conn.execute(
            "UPDATE processing_locks SET expires_at = ?4
             WHERE session_id = ?1 AND lock_type = ?2 AND worker_id = ?3
               AND expires_at >= ?5",
            params![session_id, self.kind.to_string(), worker_id, now + ttl_ms, now],
        )?;
        Ok(changes > 0)
    }

    fn is_held(&self, session_id: &str) -> Result<bool> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processing_locks
             WHERE session_id = ?1 AND lock_type = ?2 AND expires_at >= ?3",
            params![session_id, self.kind.to_string(), now_ms()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn cleanup_expired(&self) -> Result<usize> {
        let conn = self.db.lock();
        let changes = conn.execute(
            "DELETE FROM processing_locks WHERE expires_at < ?1",
            params![now_ms()],
        )?;
        Ok(changes)
    }

    fn active_locks(&self) -> Result<Vec<ProcessingLock>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, lock_type, worker_id, acquired_at, expires_at
             FROM processing_locks WHERE expires_at >= ?1
             ORDER BY acquired_at ASC",
        )?;
        let rows = stmt.query_map(params![now_ms()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut locks = Vec::new();
        for row in rows {
            let (session_id, lock_type, worker_id, acquired_at, expires_at) = row?;
            let kind = match lock_type.as_str() {
                "inbound" => QueueKind::Inbound,
                "outbound" => QueueKind::Outbound,
                other => {
                    return Err(Error::Storage(format!("unknown lock type '{}'", other)));
                }
            };
            locks.push(ProcessingLock {
                session_id,
                kind,
                worker_id,
                acquired_at,
                expires_at,
            });
        }
        Ok(locks)
    }
}

/// Lock manager backed by lock files, for deployments on the file backend.
///
/// `File::create_new` is the atomic check-and-set: exactly one contender can
/// create the lock file. Stale files (past their recorded expiry) are
/// reclaimed on the next acquire attempt.
pub struct FileLockManager {
    locks_dir: PathBuf,
    kind: QueueKind,
}

impl FileLockManager {
    pub fn new(state_dir: &Path, kind: QueueKind) -> Result<Self> {
        let locks_dir = state_dir.join("locks").join(kind.dir_name());
        fs::create_dir_all(&locks_dir)?;
        Ok(Self { locks_dir, kind })
    }

    fn lock_path(&self, session_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", session_id))
    }

    fn read_lock(&self, path: &Path) -> Option<ProcessingLock> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn try_create(&self, path: &Path, lock: &ProcessingLock) -> Result<bool> {
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(serde_json::to_string_pretty(lock)?.as_bytes())?;
                file.sync_all()?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl LockManager for FileLockManager {
    fn acquire(&self, session_id: &str, worker_id: &str, ttl_ms: i64) -> Result<bool> {
        let path = self.lock_path(session_id);
        let now = now_ms();
        let lock = ProcessingLock {
            session_id: session_id.to_string(),
            kind: self.kind,
            worker_id: worker_id.to_string(),
            acquired_at: now,
            expires_at: now + ttl_ms,
        };

        // Second pass handles the case where we just reclaimed a stale file.
        for _ in 0..2 {
            if self.try_create(&path, &lock)? {
                tracing::debug!("Acquired session lock {}", path.display());
                return Ok(true);
            }
            match self.read_lock(&path) {
                Some(existing) if existing.expires_at >= now => return Ok(false),
                _ => {
                    tracing::warn!("Removing stale session lock {}", path.display());
                    let _ = fs::remove_file(&path);
                }
            }
        }
        Ok(false)
    }

    fn release(&self, session_id: &str, worker_id: &str) -> Result<()> {
        let path = self.lock_path(session_id);
        match self.read_lock(&path) {
            Some(lock) if lock.worker_id == worker_id => {
                fs::remove_file(&path)?;
                tracing::debug!("Released session lock {}", path.display());
            }
            // Held by someone else (or gone): late release after TTL
            // reclamation, deliberately a no-op.
            _ => {}
        }
        Ok(())
    }

    fn renew(&self, session_id: &str, worker_id: &str, ttl_ms: i64) -> Result<bool> {
        let path = self.lock_path(session_id);
        let now = now_ms();
        match self.read_lock(&path) {
            Some(mut lock) if lock.worker_id == worker_id && lock.expires_at >= now => {
                lock.expires_at = now + ttl_ms;
                let tmp = path.with_extension(format!("lock.{}.tmp", std::process::id()));
                fs::write(&tmp, serde_json::to_string_pretty(&lock)?)?;
                fs::rename(&tmp, &path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn is_held(&self, session_id: &str) -> Result<bool> {
        let path = self.lock_path(session_id);
        Ok(self
            .read_lock(&path)
            .map_or(false, |lock| lock.expires_at >= now_ms()))
    }

    fn cleanup_expired(&self) -> Result<usize> {
        let now = now_ms();
        let mut removed = 0;
        for entry in fs::read_dir(&self.locks_dir)? {
            let path = entry?.path();
            if !path.extension().map_or(false, |ext| ext == "lock") {
                continue;
            }
            match self.read_lock(&path) {
                Some(lock) if lock.expires_at >= now => {}
                _ => {
                    if fs::remove_file(&path).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    fn active_locks(&self) -> Result<Vec<ProcessingLock>> {
        let now = now_ms();
        let mut locks = Vec::new();
        for entry in fs::read_dir(&self.locks_dir)? {
            let path = entry?.path();
            if !path.extension().map_or(false, |ext| ext == "lock") {
                continue;
            }
            if let Some(lock) = self.read_lock(&path) {
                if lock.expires_at >= now {
                    locks.push(lock);
                }
            }
        }
        locks.sort_by_key(|l| l.acquired_at);
        Ok(locks)
    }
}
