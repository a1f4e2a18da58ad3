use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use clap_complete::Shell;
use upkeep_core::RunId;

mod completion;
mod dispatch;
mod logging;
mod render;

#[derive(Parser, Debug)]
#[command(name = "upkeep")]
#[command(about = "Staged self-update orchestrator with backup and rollback", long_about = None)]
struct Cli {
    /// Updater config file.
    #[arg(
        long,
        env = "UPKEEP_CONFIG",
        default_value = "upkeep.toml",
        global = true
    )]
    config: PathBuf,
    /// Print machine-readable JSON on stdout.
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the release catalog whether updates are available.
    Check {
        #[arg(long)]
        force: bool,
    },
    /// Start a run: checks requirements and writable paths.
    Prepare {
        /// Files were replaced by hand; only run the database stages.
        #[arg(long)]
        manual: bool,
    },
    Download {
        run_id: RunId,
    },
    BackupFiles {
        run_id: RunId,
    },
    UpdateFiles {
        run_id: RunId,
    },
    BackupDb {
        run_id: RunId,
    },
    UpdateDb {
        run_id: RunId,
        #[arg(long)]
        db_backup: Option<PathBuf>,
    },
    Cleanup {
        run_id: RunId,
    },
    Rollback {
        run_id: RunId,
        #[arg(long)]
        db_backup: Option<PathBuf>,
    },
    /// Run every stage in one go, rolling back on failure.
    Update {
        #[arg(long)]
        manual: bool,
    },
    /// Run one plugin's migrations and record its new version.
    UpdatePlugin {
        handle: String,
    },
    /// Show the record and journal of a run (default: the active run).
    Status {
        run_id: Option<RunId>,
    },
    CheckWritable {
        paths: Vec<PathBuf>,
    },
    FlushCache,
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.log_json)?;
    dispatch::run_cli(cli)
}

#[cfg(test)]
mod tests;
