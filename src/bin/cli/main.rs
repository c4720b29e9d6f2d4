mod commands;
mod loopback;
mod render;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use nous_sync::sync::SendChangesConfig;

#[derive(Parser)]
#[command(name = "nous-sync-cli", about = "Send local note changes to the sync service", version)]
struct Cli {
    /// Config file (default: <config dir>/nous/sync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "plain")]
    format: OutputFormat,

    /// Disable ANSI colors
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Push dirty entities of a storage snapshot to a loopback service
    Push {
        /// Snapshot file (JSON), rewritten with the results
        snapshot: PathBuf,
        /// Last update count known to be in sync
        #[arg(long, default_value = "0")]
        cursor: i32,
        /// Update count the loopback service hands out first (default: cursor + 1)
        #[arg(long)]
        first_usn: Option<i32>,
        /// Don't write the snapshot back
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the effective engine configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let use_color = !cli.no_color && atty_check();
    let config_path = cli.config.clone().or_else(SendChangesConfig::default_path);
    let config = load_config(config_path.as_deref())?;

    match cli.command {
        Command::Push {
            snapshot,
            cursor,
            first_usn,
            dry_run,
        } => {
            let options = commands::push::PushOptions::new(snapshot, cursor, first_usn, dry_run)?;
            commands::push::run(&options, config, &cli.format, use_color)?;
        }
        Command::Config => {
            commands::config::run(&config, config_path.as_deref(), &cli.format)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SendChangesConfig> {
    let Some(path) = path else {
        return Ok(SendChangesConfig::default());
    };
    SendChangesConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

/// Check if stdout is a terminal (for color support)
fn atty_check() -> bool {
    unsafe { libc_isatty(1) != 0 }
}

extern "C" {
    #[link_name = "isatty"]
    fn libc_isatty(fd: i32) -> i32;
}
