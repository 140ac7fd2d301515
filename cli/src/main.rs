//! EverQuest combat log analyzer.

use clap::{Parser, Subcommand};
use eqlog_cli::commands;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eqlog", version, about = "EverQuest combat log analyzer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flat per-actor and per-target damage tables
    Parse(commands::ParseArgs),
    /// Per-target encounter segmentation and tables
    Encounters(commands::EncountersArgs),
    /// Tail a log and publish outgoing damage to a hub room
    Publish(commands::PublishArgs),
    /// Subscribe to a hub room and render its live bucket series
    Watch(commands::WatchArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    // clap exits with status 2 on usage errors.
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Parse(args) => commands::run_parse(args).await,
        Commands::Encounters(args) => commands::run_encounters(args).await,
        Commands::Publish(args) => commands::run_publish(args).await,
        Commands::Watch(args) => commands::run_watch(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
