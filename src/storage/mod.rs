//! Storage backends for the message queues.
//!
//! One capability trait, two conforming implementations selected by
//! configuration: a file-per-message layout and a SQLite layout.

pub mod file;
pub mod sqlite;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{DeadLetterMessage, QueueRecord};

pub use file::FileBackend;
pub use sqlite::{QueueDb, SqliteBackend};

/// Which storage implementation a queue runs on.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    File,
    Sqlite,
}

/// Durable record store for one queue.
///
/// Every mutation on a single record is atomic: a reader never observes a
/// record both pending and dead-lettered, nor partially written. Conflicting
/// writes to the same id are serialized by the implementation.
pub trait StorageBackend<M: QueueRecord>: Send {
    /// Persist a new record. Fails on a duplicate id.
    fn create(&self, message: &M) -> Result<()>;

    /// Read one pending record by id.
    fn read(&self, id: &str) -> Result<Option<M>>;

    /// Atomic read-modify-write of one record. `Error::NotFound` if absent.
    fn update(&self, id: &str, mutate: &mut dyn FnMut(&mut M)) -> Result<()>;

    /// Remove a pending record. `Error::NotFound` if absent.
    fn delete(&self, id: &str) -> Result<()>;

    /// All pending records, FIFO by enqueue time.
    fn list_pending(&self) -> Result<Vec<M>>;

    /// Terminal transition: snapshot the record into the dead-letter set and
    /// remove it from pending.
    fn move_to_dead_letter(&self, id: &str, reason: &str) -> Result<()>;

    /// All dead-lettered records, oldest first.
    fn list_dead_letters(&self) -> Result<Vec<DeadLetterMessage>>;

    fn count_pending(&self) -> Result<usize> {
        Ok(self.list_pending()?.len())
    }

    fn count_dead_letters(&self) -> Result<usize> {
        Ok(self.list_dead_letters()?.len())
    }
}
