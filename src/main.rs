//! msgjournal CLI entry point
//!
//! Installs the tracing subscriber (filtered by `RUST_LOG`, default `warn`),
//! runs the command and exits non-zero with a JSON error on stderr when it
//! fails.

use msgjournal::cli;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = cli::run() {
        if cli::write_error(&e).is_err() {
            eprintln!("{}", e);
        }
        std::process::exit(1);
    }
}
