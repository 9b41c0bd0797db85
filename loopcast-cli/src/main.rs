//! Loopcast CLI - Command-line interface
//!
//! Provides command-line access to Loopcast functionality.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use loopcast_core::config::LoopcastConfig;
use loopcast_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "loopcast")]
#[command(about = "Loop a video to a live streaming endpoint")]
struct Cli {
    /// Console log level; the log file always records everything
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the debug log file
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    /// Working directory holding local videos and downloads
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .context("failed to initialise logging")?;

    let mut config = LoopcastConfig::from_env();
    if let Some(dir) = cli.dir {
        config.working_dir = dir;
    }

    if let Err(error) = commands::handle_command(cli.command, config).await {
        tracing::debug!("Command failed: {}", error);
        anyhow::bail!(error.user_message());
    }

    Ok(())
}
