//! Mailroom library root.

pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod migrate;
pub mod queue;
pub mod recovery;
pub mod storage;
pub mod types;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use error::{Error, Result};
pub use lock::{FileLockManager, LockManager, SqliteLockManager};
pub use migrate::{migrate_file_queue_to_sqlite, validate_migration, MigrationOptions};
pub use queue::MessageQueue;
pub use recovery::{recover_pending, RecoveryOptions, RecoveryResult};
pub use storage::{BackendKind, FileBackend, QueueDb, SqliteBackend, StorageBackend};
pub use types::{
    DeadLetterMessage, InboundMessage, InboundParams, OutboundMessage, OutboundParams,
    ProcessingLock, QueueKind, QueueMetrics, QueueRecord,
};
