//! Migration from the file-based queue layout to the SQLite layout.
//!
//! One-shot and idempotent: records already present in the database (by id)
//! are skipped, so a partially completed run is safe to repeat. The source
//! directory is never modified - it stays the fallback until an operator has
//! confirmed validation.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::params;

use crate::error::{Error, Result};
use crate::storage::QueueDb;
use crate::types::{DeadLetterMessage, QueueKind};

/// Counters for one migration run.
#[derive(Debug, Clone, Default)]
pub struct MigrationResult {
    /// Records copied into the database.
    pub migrated: usize,
    /// Records already present (or invalid) and left alone.
    pub skipped: usize,
    /// Records that could not be read or inserted.
    pub failed: usize,
    /// Per-file error detail for the failed ones.
    pub errors: Vec<(String, String)>,
}

/// Source/destination id comparison, computed independently of migration.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub source_pending: usize,
    pub source_dead_letters: usize,
    pub dest_pending: usize,
    pub dest_dead_letters: usize,
    /// Source ids absent from the destination.
    pub missing_ids: Vec<String>,
    /// Ids present on both sides but with differing retry counts.
    pub mismatched_ids: Vec<String>,
}

impl ValidationReport {
    /// True when every source record exists in the destination unchanged.
    pub fn is_consistent(&self) -> bool {
        self.missing_ids.is_empty() && self.mismatched_ids.is_empty()
    }
}

pub struct MigrationOptions<'a> {
    /// State directory holding the file-based queue layout.
    pub state_dir: &'a Path,
    pub db: &'a QueueDb,
    pub kind: QueueKind,
    /// Count what would happen without writing.
    pub dry_run: bool,
}

/// Minimal view of a pending record, read schema-agnostically so migration
/// preserves the full original JSON byte-for-byte in the `record` column.
struct RawRecord {
    id: String,
    session_id: String,
    enqueued_at: i64,
    retry_count: u32,
    next_retry_at: Option<i64>,
    last_error: Option<String>,
    raw: String,
}

fn parse_raw_record(raw: &str) -> Result<RawRecord> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let field_str = |name: &str| -> Result<String> {
        value
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Migration(format!("record missing field '{}'", name)))
    };
    let field_i64 = |name: &str| -> Result<i64> {
        value
            .get(name)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::Migration(format!("record missing field '{}'", name)))
    };
    Ok(RawRecord {
        id: field_str("id")?,
        session_id: field_str("session_id")?,
        enqueued_at: field_i64("enqueued_at")?,
        retry_count: field_i64("retry_count")? as u32,
        next_retry_at: value.get("next_retry_at").and_then(|v| v.as_i64()),
        last_error: value
            .get("last_error")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        raw: raw.to_string(),
    })
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Copy all pending and dead-lettered records for one queue kind from the
/// file layout into SQLite, preserving id, retry count, enqueue time, and
/// status. Re-runnable: already-migrated ids are skipped.
pub fn migrate_file_queue_to_sqlite(opts: &MigrationOptions<'_>) -> Result<MigrationResult> {
    let mut result = MigrationResult::default();
    let queue_dir = opts.state_dir.join(opts.kind.dir_name());

    if !queue_dir.exists() {
        tracing::warn!("Queue directory does not exist: {}", queue_dir.display());
        return Ok(result);
    }

    let pending_files = json_files(&queue_dir)?;
    let failed_files = json_files(&queue_dir.join("failed"))?;
    tracing::info!(
        "Migrating {} queue: {} pending files, {} dead-letter files",
        opts.kind,
        pending_files.len(),
        failed_files.len()
    );

    for path in &pending_files {
        let file_name = path.display().to_string();
        let outcome: Result<bool> = (|| {
            let raw = fs::read_to_string(path)?;
            let record = parse_raw_record(&raw)?;
            let conn = opts.db.lock();
            if opts.dry_run {
                let exists: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM {} WHERE id = ?1", opts.kind.table()),
                    params![record.id],
                    |row| row.get(0),
                )?;
                return Ok(exists == 0);
            }
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {}
                     (id, session_id, enqueued_at, retry_count, next_retry_at, last_error, record)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    opts.kind.table()
                ),
                params![
                    record.id,
                    record.session_id,
                    record.enqueued_at,
                    record.retry_count,
                    record.next_retry_at,
                    record.last_error,
                    record.raw,
                ],
            )?;
            Ok(inserted > 0)
        })();

        match outcome {
            Ok(true) => result.migrated += 1,
            Ok(false) => {
                tracing::debug!("Already migrated, skipping {}", file_name);
                result.skipped += 1;
            }
            Err(e) => {
                tracing::error!("Failed to migrate {}: {}", file_name, e);
                result.failed += 1;
                result.errors.push((file_name, e.to_string()));
            }
        }
    }

    for path in &failed_files {
        let file_name = path.display().to_string();
        let outcome: Result<bool> = (|| {
            let raw = fs::read_to_string(path)?;
            let letter: DeadLetterMessage = serde_json::from_str(&raw)?;
            let conn = opts.db.lock();
            if opts.dry_run {
                let exists: i64 = conn.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {} WHERE id = ?1",
                        opts.kind.dead_letter_table()
                    ),
                    params![letter.id],
                    |row| row.get(0),
                )?;
                return Ok(exists == 0);
            }
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {}
                     (id, original, reason, moved_at, retry_count)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    opts.kind.dead_letter_table()
                ),
                params![
                    letter.id,
                    serde_json::to_string(&letter.original)?,
                    letter.reason,
                    letter.moved_at,
                    letter.retry_count,
                ],
            )?;
            Ok(inserted > 0)
        })();

        match outcome {
            Ok(true) => result.migrated += 1,
            Ok(false) => result.skipped += 1,
            Err(e) => {
                tracing::error!("Failed to migrate dead letter {}: {}", file_name, e);
                result.failed += 1;
                result.errors.push((file_name, e.to_string()));
            }
        }
    }

    tracing::info!(
        "Migration complete: {} migrated, {} skipped, {} failed",
        result.migrated,
        result.skipped,
        result.failed
    );
    Ok(result)
}

/// Independently diff the file layout against the database.
///
/// Reports every source id missing from the destination and every id whose
/// retry count differs. Discrepancies are reported, never corrected.
pub fn validate_migration(opts: &MigrationOptions<'_>) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();
    let queue_dir = opts.state_dir.join(opts.kind.dir_name());

    let conn = opts.db.lock();
    report.dest_pending = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", opts.kind.table()),
        [],
        |row| row.get::<_, i64>(0),
    )? as usize;
    report.dest_dead_letters = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", opts.kind.dead_letter_table()),
        [],
        |row| row.get::<_, i64>(0),
    )? as usize;

    for path in json_files(&queue_dir)? {
        let raw = fs::read_to_string(&path)?;
        let record = parse_raw_record(&raw)?;
        report.source_pending += 1;

        let dest_retry: Option<u32> = conn
            .query_row(
                &format!("SELECT retry_count FROM {} WHERE id = ?1", opts.kind.table()),
                params![record.id],
                |row| row.get(0),
            )
            .ok();
        match dest_retry {
            None => report.missing_ids.push(record.id),
            Some(retry) if retry != record.retry_count => report.mismatched_ids.push(record.id),
            Some(_) => {}
        }
    }

    for path in json_files(&queue_dir.join("failed"))? {
        let raw = fs::read_to_string(&path)?;
        let letter: DeadLetterMessage = serde_json::from_str(&raw)?;
        report.source_dead_letters += 1;

        let dest_retry: Option<u32> = conn
            .query_row(
                &format!(
                    "SELECT retry_count FROM {} WHERE id = ?1",
                    opts.kind.dead_letter_table()
                ),
                params![letter.id],
                |row| row.get(0),
            )
            .ok();
        match dest_retry {
            None => report.missing_ids.push(letter.id),
            Some(retry) if retry != letter.retry_count => report.mismatched_ids.push(letter.id),
            Some(_) => {}
        }
    }

    if report.is_consistent() {
        tracing::info!(
            "Validation clean: {} pending + {} dead-letter source records all present",
            report.source_pending,
            report.source_dead_letters
        );
    } else {
        tracing::warn!(
            "Validation found discrepancies: {} missing, {} mismatched",
            report.missing_ids.len(),
            report.mismatched_ids.len()
        );
    }
    Ok(report)
}
