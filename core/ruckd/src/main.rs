//! ruckd: host binary for the ruck session engine.
//!
//! ## Subcommands
//!
//! - `replay`: run a full session from a recorded sample file against a
//!   logging backend, optionally with a simulated outage
//! - `inspect`: print the persisted session snapshot as JSON
//! - `clear`: delete the persisted snapshot
//!
//! Summaries go to stdout as JSON; logs go to stderr (and to `--log-dir`).

mod backend;
mod error;
mod logging;
mod replay;

use clap::{Parser, Subcommand};
use fs_err as fs;
use ruck_session_engine::{SessionStore, StorageConfig};
use std::path::PathBuf;
use tracing::{error, info};

use crate::error::RuckdError;
use crate::replay::ReplayOptions;

#[derive(Parser)]
#[command(name = "ruckd")]
#[command(about = "Ruck session engine host")]
#[command(version)]
struct Cli {
    /// Data directory (defaults to ~/.ruck)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Also write daily-rolling log files here
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded samples through a complete session
    Replay {
        /// JSON file with `locations` and `heart_rates` arrays
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Seconds after the first sample when the backend becomes unreachable
        #[arg(long, value_name = "SECS")]
        outage_from: Option<i64>,

        /// Length of the simulated outage
        #[arg(long, value_name = "SECS", default_value_t = 60)]
        outage_secs: i64,

        /// Ruck weight in kilograms (overrides the file)
        #[arg(long)]
        ruck_kg: Option<f64>,

        /// User body weight in kilograms (overrides the file)
        #[arg(long)]
        user_kg: Option<f64>,
    },

    /// Print the persisted snapshot
    Inspect,

    /// Delete the persisted snapshot
    Clear,
}

fn main() {
    let cli = Cli::parse();
    let _logging_guard = logging::init(cli.log_dir.as_deref());

    let storage = match resolve_storage(cli.data_dir) {
        Ok(storage) => storage,
        Err(err) => {
            error!(error = %err, "Failed to resolve data directory");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(cli.command, &storage) {
        error!(error = %err, "ruckd failed");
        std::process::exit(1);
    }
}

fn resolve_storage(data_dir: Option<PathBuf>) -> Result<StorageConfig, RuckdError> {
    let storage = match data_dir {
        Some(root) => StorageConfig::with_root(root),
        None => StorageConfig::from_home()?,
    };
    fs::create_dir_all(storage.root()).map_err(|source| RuckdError::Prepare {
        path: storage.root().to_path_buf(),
        source,
    })?;
    Ok(storage)
}

fn run(command: Commands, storage: &StorageConfig) -> Result<(), RuckdError> {
    match command {
        Commands::Replay {
            file,
            outage_from,
            outage_secs,
            ruck_kg,
            user_kg,
        } => {
            let options = ReplayOptions {
                file,
                ruck_weight_kg: ruck_kg,
                user_weight_kg: user_kg,
                outage_from_secs: outage_from,
                outage_secs,
            };
            let summary = replay::run(&options, storage)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Inspect => {
            let store = SessionStore::open(storage.session_db())?;
            match store.load()? {
                Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                None => println!("null"),
            }
        }
        Commands::Clear => {
            let store = SessionStore::open(storage.session_db())?;
            store.clear()?;
            info!(path = %store.path().display(), "Snapshot cleared");
        }
    }
    Ok(())
}
