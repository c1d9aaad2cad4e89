//! Mailroom - Crash-safe message queues for chat-assistant message processing.

use clap::Parser;
use std::process::ExitCode;

mod backoff;
mod cli;
mod config;
mod error;
mod lock;
mod logging;
mod migrate;
mod queue;
mod recovery;
mod storage;
mod types;

use cli::Commands;

fn main() -> ExitCode {
    let _guard = match logging::init() {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let args = Commands::parse();

    match args.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
