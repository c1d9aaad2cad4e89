//! CLI commands for mailroom using clap.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use crate::config::{load_settings_or_default, Settings};
use crate::lock::{FileLockManager, LockManager, SqliteLockManager};
use crate::migrate::{migrate_file_queue_to_sqlite, validate_migration, MigrationOptions};
use crate::queue::MessageQueue;
use crate::storage::{BackendKind, FileBackend, QueueDb, SqliteBackend};
use crate::types::{InboundMessage, OutboundMessage, QueueKind, QueueRecord};

/// Mailroom - Crash-safe message queues for chat-assistant message processing.
#[derive(Parser)]
#[command(name = "mailroom")]
#[command(version = "0.1.0")]
#[command(about = "Persistent inbound/outbound message queues", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum KindArg {
    Inbound,
    Outbound,
}

impl From<KindArg> for QueueKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Inbound => QueueKind::Inbound,
            KindArg::Outbound => QueueKind::Outbound,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Show queue depth and dead-letter counts
    Stats,

    /// List pending messages
    Pending {
        /// Which queue to inspect
        #[arg(value_enum)]
        kind: KindArg,
    },

    /// List dead-lettered messages
    DeadLetters {
        /// Which queue to inspect
        #[arg(value_enum)]
        kind: KindArg,
    },

    /// Copy file-based queue state into the SQLite backend
    Migrate {
        /// Which queue to migrate (default: both)
        #[arg(value_enum)]
        kind: Option<KindArg>,

        /// Report what would be migrated without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Compare file-based queue state against the SQLite backend
    Validate {
        /// Which queue to validate (default: both)
        #[arg(value_enum)]
        kind: Option<KindArg>,
    },

    /// Show session processing locks
    Locks {
        /// Remove expired locks while listing
        #[arg(long)]
        cleanup: bool,
    },
}

fn open_db(settings: &Settings) -> Result<QueueDb> {
    let path = settings.resolve_db_path()?;
    Ok(QueueDb::open_with_timeout(
        &path,
        settings.queue.busy_timeout_ms,
    )?)
}

fn open_queue<M: QueueRecord>(settings: &Settings) -> Result<MessageQueue<M>> {
    let queue = match settings.queue.backend {
        BackendKind::File => {
            let state_dir = settings.resolve_state_dir()?;
            MessageQueue::with_max_retries(
                Box::new(FileBackend::<M>::new(&state_dir)?),
                settings.queue.max_retries,
            )
        }
        BackendKind::Sqlite => MessageQueue::with_max_retries(
            Box::new(SqliteBackend::<M>::new(open_db(settings)?)),
            settings.queue.max_retries,
        ),
    };
    Ok(queue)
}

fn open_lock_manager(settings: &Settings, kind: QueueKind) -> Result<Box<dyn LockManager>> {
    Ok(match settings.queue.backend {
        BackendKind::File => {
            let state_dir = settings.resolve_state_dir()?;
            Box::new(FileLockManager::new(&state_dir, kind)?)
        }
        BackendKind::Sqlite => Box::new(SqliteLockManager::new(open_db(settings)?, kind)),
    })
}

impl Commands {
    /// Execute the parsed command.
    pub fn run(&self) -> Result<()> {
        let settings = load_settings_or_default();
        match &self.command {
            Command::Stats => cmd_stats(&settings),
            Command::Pending { kind } => match QueueKind::from(*kind) {
                QueueKind::Inbound => cmd_pending::<InboundMessage>(&settings),
                QueueKind::Outbound => cmd_pending::<OutboundMessage>(&settings),
            },
            Command::DeadLetters { kind } => match QueueKind::from(*kind) {
                QueueKind::Inbound => cmd_dead_letters::<InboundMessage>(&settings),
                QueueKind::Outbound => cmd_dead_letters::<OutboundMessage>(&settings),
            },
            Command::Migrate { kind, dry_run } => cmd_migrate(&settings, *kind, *dry_run),
            Command::Validate { kind } => cmd_validate(&settings, *kind),
            Command::Locks { cleanup } => cmd_locks(&settings, *cleanup),
        }
    }
}

fn cmd_stats(settings: &Settings) -> Result<()> {
    let inbound = open_queue::<InboundMessage>(settings)?.metrics()?;
    let outbound = open_queue::<OutboundMessage>(settings)?.metrics()?;
    println!("Inbound {}", inbound);
    println!("Outbound {}", outbound);
    Ok(())
}

fn cmd_pending<M: QueueRecord>(settings: &Settings) -> Result<()> {
    let queue = open_queue::<M>(settings)?;
    let messages = queue.load_pending()?;
    println!("Pending {} messages ({}):", M::KIND, messages.len());
    for msg in messages {
        println!(
            "  {}: session={} retries={} next_retry_at={}",
            msg.id(),
            msg.session_id(),
            msg.retry_count(),
            msg.next_retry_at()
                .map_or_else(|| "-".to_string(), |t| t.to_string()),
        );
    }
    Ok(())
}

fn cmd_dead_letters<M: QueueRecord>(settings: &Settings) -> Result<()> {
    let queue = open_queue::<M>(settings)?;
    let letters = queue.load_dead_letters()?;
    println!("Dead-lettered {} messages ({}):", M::KIND, letters.len());
    for letter in letters {
        println!(
            "  {}: retries={} reason={}",
            letter.id, letter.retry_count, letter.reason
        );
    }
    Ok(())
}

fn kinds_for(kind: Option<KindArg>) -> Vec<QueueKind> {
    match kind {
        Some(k) => vec![k.into()],
        None => vec![QueueKind::Inbound, QueueKind::Outbound],
    }
}

fn cmd_migrate(settings: &Settings, kind: Option<KindArg>, dry_run: bool) -> Result<()> {
    let state_dir = settings.resolve_state_dir()?;
    let db = open_db(settings)?;

    for kind in kinds_for(kind) {
        let result = migrate_file_queue_to_sqlite(&MigrationOptions {
            state_dir: &state_dir,
            db: &db,
            kind,
            dry_run,
        })?;
        let label = if dry_run { "Would migrate" } else { "Migrated" };
        println!(
            "{} {} queue: {} migrated, {} skipped, {} failed",
            label, kind, result.migrated, result.skipped, result.failed
        );
        for (file, error) in &result.errors {
            println!("  failed {}: {}", file, error);
        }
    }
    Ok(())
}

fn cmd_validate(settings: &Settings, kind: Option<KindArg>) -> Result<()> {
    let state_dir = settings.resolve_state_dir()?;
    let db = open_db(settings)?;

    let mut clean = true;
    for kind in kinds_for(kind) {
        let report = validate_migration(&MigrationOptions {
            state_dir: &state_dir,
            db: &db,
            kind,
            dry_run: true,
        })?;
        println!(
            "{} queue: {} pending + {} dead-lettered in files, {} + {} in SQLite",
            kind,
            report.source_pending,
            report.source_dead_letters,
            report.dest_pending,
            report.dest_dead_letters
        );
        for id in &report.missing_ids {
            println!("  missing: {}", id);
            clean = false;
        }
        for id in &report.mismatched_ids {
            println!("  mismatched: {}", id);
            clean = false;
        }
    }
    println!("{}", if clean { "Consistent" } else { "Inconsistent" });
    Ok(())
}

fn cmd_locks(settings: &Settings, cleanup: bool) -> Result<()> {
    for kind in [QueueKind::Inbound, QueueKind::Outbound] {
        let manager = open_lock_manager(settings, kind)?;
        if cleanup {
            let removed = manager.cleanup_expired()?;
            if removed > 0 {
                println!("Removed {} expired {} locks", removed, kind);
            }
        }
        let locks = manager.active_locks()?;
        println!("Active {} locks ({}):", kind, locks.len());
        for lock in locks {
            println!(
                "  {}: held by {} until {}",
                lock.session_id, lock.worker_id, lock.expires_at
            );
        }
    }
    Ok(())
}
