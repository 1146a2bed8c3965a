//! pacs-retire CLI - archive aged series off a PACS server

use anyhow::Result;
use clap::{Parser, Subcommand};
use retire_cli::cmd;
use std::path::PathBuf;

/// pacs-retire - move aged imaging series from Orthanc to cold storage
#[derive(Parser)]
#[command(name = "pacs-retire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive every eligible series, then delete it from the source
    Run,
    /// List committed archive records
    List {
        /// Only records for this patient
        #[arg(long)]
        patient: Option<String>,
        /// Only records for this study
        #[arg(long)]
        study: Option<String>,
        /// Archived on or after this date (YYYY-MM-DD, UTC)
        #[arg(long)]
        since: Option<String>,
        /// Archived before this date (YYYY-MM-DD, UTC)
        #[arg(long)]
        until: Option<String>,
        /// Maximum number of records to show
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show PENDING records left by interrupted runs
    Pending,
    /// Re-check committed containers against their recorded size and BLAKE3
    Verify {
        /// Only verify this series
        series_id: Option<String>,
    },
    /// Configuration helpers
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print an annotated example configuration
    Example,
    /// Validate a configuration and print the effective values
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Run => cmd::run::run(config).await,
        Commands::List {
            patient,
            study,
            since,
            until,
            limit,
        } => cmd::list::run(config, patient, study, since.as_deref(), until.as_deref(), limit),
        Commands::Pending => cmd::pending::run(config),
        Commands::Verify { series_id } => cmd::verify::run(config, series_id.as_deref()),
        Commands::Config(config_cmd) => match config_cmd {
            ConfigCommands::Example => cmd::config::run_example(),
            ConfigCommands::Show => cmd::config::run_show(config),
        },
    }
}
