//! CLI command implementations
//!
//! Both commands load a [`JournalConfig`], act on the journal directory and
//! print one JSON response. Neither keeps the journal open afterwards.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::config::JournalConfig;
use crate::extent::{list_extent_files, FilePool};
use crate::journal::{Journal, QueueStore};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Init { config } => init(&config),
        Command::Inspect { config, payloads } => inspect(&config, payloads),
    }
}

fn open_pool(config: &JournalConfig) -> CliResult<Arc<FilePool>> {
    let pool = FilePool::open(config.pool_path(), config.extent_size())
        .map_err(|e| CliError::io_error(format!("failed to open extent pool: {}", e)))?;
    Ok(Arc::new(pool))
}

/// Lay down an empty journal.
///
/// Refuses a directory that already holds extent files, so an existing
/// journal is never wiped by accident.
pub fn init(config_path: &Path) -> CliResult<()> {
    let config = JournalConfig::load(config_path)?;
    let existing = list_extent_files(&config.directory)?;
    if !existing.is_empty() {
        return Err(CliError::already_initialized(
            &config.directory.display().to_string(),
        ));
    }
    fs::create_dir_all(&config.directory).map_err(|e| {
        CliError::io_error(format!(
            "failed to create {}: {}",
            config.directory.display(),
            e
        ))
    })?;

    let pool = open_pool(&config)?;
    let journal = Journal::new(config.clone())?;
    journal.initialize(pool.clone(), config.wcache_pages, config.wcache_page_sblks)?;
    journal.stop(true);
    info!(journal = %config.journal_id, directory = %config.directory.display(), "journal initialized");

    write_response(json!({
        "journal_id": config.journal_id,
        "directory": config.directory.display().to_string(),
        "pool_directory": pool.dir().display().to_string(),
        "pooled_extents": pool.free_count(),
    }))
}

/// Recover a journal without completing recovery, so nothing on disk
/// changes, and print the result.
pub fn inspect(config_path: &Path, payloads: bool) -> CliResult<()> {
    let config = JournalConfig::load(config_path)?;
    let pool = open_pool(&config)?;
    let journal = Journal::new(config.clone())?;
    let recovered = journal.recover(
        pool,
        config.wcache_pages,
        config.wcache_page_sblks,
        config.queue_id,
    )?;

    let mut data = serde_json::to_value(&recovered)?;
    if payloads {
        if let Some(messages) = data.get_mut("messages").and_then(Value::as_array_mut) {
            for (value, message) in messages.iter_mut().zip(&recovered.messages) {
                value["payload"] =
                    Value::String(String::from_utf8_lossy(&message.data).into_owned());
            }
        }
    }
    data["journal_id"] = json!(config.journal_id);
    journal.stop(true);

    write_response(data)
}
