//! CLI argument definitions using clap
//!
//! Commands:
//! - msgjournal init --config <path>
//! - msgjournal inspect --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// msgjournal - durable message journal tooling
#[derive(Parser, Debug)]
#[command(name = "msgjournal")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an empty journal directory and its extent pool
    Init {
        /// Path to configuration file
        #[arg(long, default_value = "./msgjournal.json")]
        config: PathBuf,
    },

    /// Recover a journal read-only and print what it holds
    Inspect {
        /// Path to configuration file
        #[arg(long, default_value = "./msgjournal.json")]
        config: PathBuf,

        /// Include message payloads (lossy UTF-8)
        #[arg(long)]
        payloads: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect() {
        let cli = Cli::try_parse_from(["msgjournal", "inspect", "--config", "j.json", "--payloads"])
            .unwrap();
        match cli.command {
            Command::Inspect { config, payloads } => {
                assert_eq!(config, PathBuf::from("j.json"));
                assert!(payloads);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_default_config_path() {
        let cli = Cli::try_parse_from(["msgjournal", "init"]).unwrap();
        assert!(matches!(cli.command, Command::Init { ref config } if config == &PathBuf::from("./msgjournal.json")));
    }
}
