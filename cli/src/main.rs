// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Hangar Controller CLI
//!
//! The `hangar` binary runs the build controller that agents connect to.
//!
//! ## Commands
//!
//! - `hangar daemon` - Accept agent connections until Ctrl+C or SIGTERM
//! - `hangar config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use hangar_controller::commands::{self, ConfigCommand};
use hangar_controller::daemon;
use hangar_core::domain::controller_config::ControllerConfigManifest;

/// Hangar build controller
#[derive(Parser)]
#[command(name = "hangar")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "HANGAR_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Agent listener port (overrides configuration)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "HANGAR_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller in the foreground
    #[command(name = "daemon")]
    Daemon,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon => {
            let mut config = ControllerConfigManifest::load_or_default(cli.config)
                .context("Failed to load configuration")?;
            if let Some(port) = cli.port {
                config.spec.listener.port = port;
            }

            let observability = &config.spec.observability;
            let level = cli.log_level.unwrap_or_else(|| observability.log_level.clone());
            init_logging(&level, &observability.log_format)?;

            daemon::run_daemon(config).await
        }
        Commands::Config { command } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "text")?;
            commands::config::handle_command(command, cli.config).await
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        _ => builder.compact().init(),
    }

    Ok(())
}
