//! File-based storage backend.
//!
//! Layout under the state directory:
//! - `<kind>/`        : one `{id}.json` file per pending message
//! - `<kind>/failed/` : dead-lettered messages in the same per-id format
//!
//! Writes go to a `.tmp` sibling first and land via atomic rename, so a crash
//! mid-write cannot corrupt an existing record.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::{now_ms, DeadLetterMessage, QueueRecord};

use super::StorageBackend;

const FAILED_DIRNAME: &str = "failed";

/// One-file-per-message backend for a single queue kind.
pub struct FileBackend<M: QueueRecord> {
    queue_dir: PathBuf,
    /// Serializes mutations so concurrent writers cannot interleave a
    /// read-modify-write on the same record.
    write_lock: Mutex<()>,
    _marker: PhantomData<M>,
}

impl<M: QueueRecord> FileBackend<M> {
    /// Open (and create if needed) the queue directories under `state_dir`.
    pub fn new(state_dir: &Path) -> Result<Self> {
        let queue_dir = state_dir.join(M::KIND.dir_name());
        fs::create_dir_all(&queue_dir)?;
        fs::create_dir_all(queue_dir.join(FAILED_DIRNAME))?;
        Ok(Self {
            queue_dir,
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        })
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.queue_dir.join(format!("{}.json", id))
    }

    fn failed_path(&self, id: &str) -> PathBuf {
        self.queue_dir.join(FAILED_DIRNAME).join(format!("{}.json", id))
    }

    /// Write JSON to a temp sibling, then rename into place.
    fn write_atomic<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_record(&self, path: &Path) -> Result<Option<M>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

impl<M: QueueRecord> StorageBackend<M> for FileBackend<M> {
    fn create(&self, message: &M) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.record_path(message.id());
        if path.exists() {
            return Err(Error::Storage(format!(
                "duplicate queue record id {}",
                message.id()
            )));
        }
        self.write_atomic(&path, message)
    }

    fn read(&self, id: &str) -> Result<Option<M>> {
        self.read_record(&self.record_path(id))
    }

    fn update(&self, id: &str, mutate: &mut dyn FnMut(&mut M)) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.record_path(id);
        let mut record = self
            .read_record(&path)?
            .ok_or_else(|| Error::NotFound(format!("queue record {}", id)))?;
        mutate(&mut record);
        self.write_atomic(&path, &record)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.record_path(id);
        if !path.exists() {
            return Err(Error::NotFound(format!("queue record {}", id)));
        }
        fs::remove_file(&path)?;
        Ok(())
    }

    fn list_pending(&self) -> Result<Vec<M>> {
        if !self.queue_dir.exists() {
            return Ok(vec![]);
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.queue_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.extension().map_or(false, |ext| ext == "json") {
                continue;
            }
            // Malformed or half-migrated entries are skipped, not fatal.
            match fs::read_to_string(&path).ok().as_deref().map(serde_json::from_str::<M>) {
                Some(Ok(record)) => {
                    // A crash between dead-letter snapshot and unlink can leave
                    // both copies; the dead-letter copy wins.
                    if self.failed_path(record.id()).exists() {
                        continue;
                    }
                    records.push(record);
                }
                _ => {
                    tracing::warn!("Skipping malformed queue file {}", path.display());
                }
            }
        }

        records.sort_by(|a, b| {
            a.enqueued_at()
                .cmp(&b.enqueued_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(records)
    }

    fn move_to_dead_letter(&self, id: &str, reason: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.record_path(id);
        let record = self
            .read_record(&path)?
            .ok_or_else(|| Error::NotFound(format!("queue record {}", id)))?;

        let snapshot = DeadLetterMessage {
            id: record.id().to_string(),
            original: serde_json::to_value(&record)?,
            reason: reason.to_string(),
            moved_at: now_ms(),
            retry_count: record.retry_count(),
        };

        // Snapshot first, unlink second: a crash in between duplicates the
        // record instead of losing it, and list_pending resolves the duplicate.
        self.write_atomic(&self.failed_path(id), &snapshot)?;
        fs::remove_file(&path)?;
        Ok(())
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetterMessage>> {
        let failed_dir = self.queue_dir.join(FAILED_DIRNAME);
        if !failed_dir.exists() {
            return Ok(vec![]);
        }

        let mut letters = Vec::new();
        for entry in fs::read_dir(&failed_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.extension().map_or(false, |ext| ext == "json") {
                continue;
            }
            if let Ok(content) = fs::read_to_string(&path) {
                if let Ok(letter) = serde_json::from_str::<DeadLetterMessage>(&content) {
                    letters.push(letter);
                } else {
                    tracing::warn!("Skipping malformed dead-letter file {}", path.display());
                }
            }
        }

        letters.sort_by(|a, b| a.moved_at.cmp(&b.moved_at).then_with(|| a.id.cmp(&b.id)));
        Ok(letters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InboundMessage, InboundParams};
    use tempfile::TempDir;

    fn params(session: &str, body: &str) -> InboundParams {
        InboundParams {
            session_id: session.to_string(),
            channel: "telegram".to_string(),
            from_address: "12345".to_string(),
            chat_id: None,
            chat_type: None,
            body: Some(body.to_string()),
            media_urls: None,
            metadata: None,
        }
    }

    fn message(id: &str, enqueued_at: i64) -> InboundMessage {
        InboundMessage::from_params(id.to_string(), enqueued_at, params("s1", "hello"))
    }

    #[test]
    fn test_create_read_delete() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::<InboundMessage>::new(temp.path()).unwrap();

        backend.create(&message("m1", 1)).unwrap();
        let loaded = backend.read("m1").unwrap().unwrap();
        assert_eq!(loaded.id, "m1");
        assert_eq!(loaded.body.as_deref(), Some("hello"));

        backend.delete("m1").unwrap();
        assert!(backend.read("m1").unwrap().is_none());
        assert!(matches!(backend.delete("m1"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::<InboundMessage>::new(temp.path()).unwrap();

        backend.create(&message("m1", 1)).unwrap();
        assert!(matches!(
            backend.create(&message("m1", 2)),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn test_list_pending_fifo() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::<InboundMessage>::new(temp.path()).unwrap();

        backend.create(&message("m2", 200)).unwrap();
        backend.create(&message("m1", 100)).unwrap();
        backend.create(&message("m3", 300)).unwrap();

        let pending = backend.list_pending().unwrap();
        let ids: Vec<&str> = pending.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_list_pending_skips_malformed() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::<InboundMessage>::new(temp.path()).unwrap();

        backend.create(&message("m1", 1)).unwrap();
        fs::write(backend.queue_dir().join("broken.json"), "{ not json").unwrap();

        let pending = backend.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_update_mutates_record() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::<InboundMessage>::new(temp.path()).unwrap();

        backend.create(&message("m1", 1)).unwrap();
        backend
            .update("m1", &mut |m| m.record_failure(1, 5_000, "boom"))
            .unwrap();

        let loaded = backend.read("m1").unwrap().unwrap();
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.next_retry_at, Some(5_000));
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_move_to_dead_letter() {
        let temp = TempDir::new().unwrap();
        let backend = FileBackend::<InboundMessage>::new(temp.path()).unwrap();

        backend.create(&message("m1", 1)).unwrap();
        backend.move_to_dead_letter("m1", "handler kept failing").unwrap();

        assert!(backend.read("m1").unwrap().is_none());
        assert!(backend.list_pending().unwrap().is_empty());

        let letters = backend.list_dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].id, "m1");
        assert_eq!(letters[0].reason, "handler kept failing");
        assert_eq!(letters[0].original["body"], "hello");
    }
}
