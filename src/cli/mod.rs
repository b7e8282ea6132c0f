//! CLI module for msgjournal
//!
//! Provides command-line interface for:
//! - init: Create the journal directory and extent pool
//! - inspect: Recover read-only and report live messages and in-doubt
//!   transactions

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{init, inspect, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
