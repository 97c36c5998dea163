//! Station input: receive RSP packet streams into a shared sample buffer.
//!
//! # Usage
//!
//! Ingest every configured board until Ctrl+C:
//! ```bash
//! station-input run --config station.toml
//! ```
//!
//! Stop a running ingestion process from another shell:
//! ```bash
//! station-input stop --config station.toml
//! ```
//!
//! Read blocks back out of the shared buffer, splitting beamlets over ranks:
//! ```bash
//! station-input read --config station.toml --board 0 --rank 0 --ranks 2
//! ```
//!
//! Feed synthetic packets to a running ingestion process:
//! ```bash
//! station-input generate --config station.toml --board 0 --target 127.0.0.1:4346
//! ```

// Global allocator: many short-lived window copies on reader threads
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;
mod logging;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use station_input::InputConfig;

#[derive(Parser)]
#[command(name = "station-input")]
#[command(about = "Station packet ingestion into a time-indexed sample buffer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest all configured boards until Ctrl+C or a stop request
    Run {
        /// Configuration file (TOML)
        #[arg(long)]
        config: PathBuf,
    },

    /// Ask a running ingestion process to stop, through its shared buffer
    Stop {
        /// Configuration file of the running process
        #[arg(long)]
        config: PathBuf,
    },

    /// Read consecutive blocks of one board from the shared buffer
    Read {
        /// Configuration file of the running process
        #[arg(long)]
        config: PathBuf,

        /// Board to read
        #[arg(long, default_value_t = 0)]
        board: u32,

        /// This reader's rank
        #[arg(long, default_value_t = 0)]
        rank: u32,

        /// Number of ranks sharing the beamlets
        #[arg(long, default_value_t = 1)]
        ranks: u32,

        /// Samples per block
        #[arg(long, default_value_t = 16_384)]
        block_size: u64,

        /// Number of blocks to read
        #[arg(long, default_value_t = 10)]
        blocks: u64,

        /// How long past a block's end to wait for late packets, in milliseconds
        #[arg(long, default_value_t = 250)]
        max_delay_ms: u64,
    },

    /// Send synthetic real-time packets for one board over UDP
    Generate {
        /// Configuration file describing the station
        #[arg(long)]
        config: PathBuf,

        /// Board number put in the packet headers
        #[arg(long, default_value_t = 0)]
        board: u8,

        /// Destination address
        #[arg(long)]
        target: String,

        /// How long to send for
        #[arg(long, default_value_t = 10.0)]
        seconds: f64,
    },

    /// Validate a configuration file and print the effective settings
    Check {
        /// Configuration file (TOML)
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Run { config }
        | Commands::Stop { config }
        | Commands::Read { config, .. }
        | Commands::Generate { config, .. }
        | Commands::Check { config } => config.clone(),
    };
    let config = InputConfig::load_validated(&config_path)?;
    logging::init(logging::TracingConfig::from_input_config(&config).map_err(|e| anyhow!(e))?)
        .map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Run { .. } => commands::run(config).await,
        Commands::Stop { .. } => commands::stop(&config),
        Commands::Read {
            board,
            rank,
            ranks,
            block_size,
            blocks,
            max_delay_ms,
            ..
        } => {
            let request = commands::ReadRequest {
                board,
                rank,
                ranks,
                block_size,
                blocks,
                max_delay: std::time::Duration::from_millis(max_delay_ms),
            };
            commands::read(config, request).await
        }
        Commands::Generate {
            board,
            target,
            seconds,
            ..
        } => commands::generate(config, board, target, seconds).await,
        Commands::Check { .. } => commands::check(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_read_defaults() {
        let args = ["station-input", "read", "--config", "s.toml", "--ranks", "4"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Read {
                board,
                rank,
                ranks,
                block_size,
                ..
            } => {
                assert_eq!((board, rank, ranks), (0, 0, 4));
                assert_eq!(block_size, 16_384);
            }
            _ => panic!("expected read"),
        }
    }

    #[test]
    fn test_generate_requires_target() {
        assert!(Cli::try_parse_from(["station-input", "generate", "--config", "s.toml"]).is_err());
    }
}
