mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{merge::MergeArgs, run::RunArgs};

#[derive(Parser)]
#[command(author, version, about = "Disk-backed grouped result store")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.config/resultdbx/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate JSON lines rows and print the grouped result tree
    Run(RunArgs),
    /// Merge payload files into one store and print the result tree
    Merge(MergeArgs),
    /// Print information about the result environment
    Info,
}

fn main() -> Result<()> {
    logging::init()?;

    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Run(args) => commands::run::execute(config, args)?,
        Commands::Merge(args) => commands::merge::execute(config, args)?,
        Commands::Info => commands::info::execute(config)?,
    }

    Ok(())
}
