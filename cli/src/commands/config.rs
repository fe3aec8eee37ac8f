// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use hangar_core::domain::controller_config::ControllerConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./hangar-config.yaml)
        #[arg(short, long, default_value = "./hangar-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(&output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = ControllerConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        for (index, path) in ControllerConfigManifest::search_paths().iter().enumerate() {
            let marker = if path.exists() { "✓".green() } else { "-".dimmed() };
            println!("  {}. {} {}", index + 2, marker, path.display());
        }
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Listener:".bold());
    println!("  Address: {}", config.listen_address());
    println!("  Handshake timeout: {}s", spec.listener.handshake_timeout_secs);
    println!();

    println!("{}", "Admission:".bold());
    println!("  Launcher policy: {:?}", spec.admission.launcher_policy);
    println!("  Max launcher depth: {}", spec.admission.max_launcher_depth);
    println!("  Preempt timeout: {}s", spec.admission.preempt_timeout_secs);
    println!();

    println!("{}", "Channels:".bold());
    println!("  Log directory: {}", spec.channel.log_dir.display());
    match spec.channel.heartbeat_interval_secs {
        Some(secs) => println!("  Heartbeat: every {}s", secs),
        None => println!("  Heartbeat: {}", "(disabled)".dimmed()),
    }
    println!("  Max frame length: {} bytes", spec.channel.max_frame_length);
    println!();

    println!("{}", "Agents:".bold());
    if spec.agents.is_empty() {
        println!("  {}", "(none declared)".dimmed());
    }
    for agent in &spec.agents {
        let node = agent.to_agent();
        println!("  {} ({} executors)", agent.name.bold(), agent.num_executors);
        println!(
            "    Launcher: {}",
            node.launcher_chain(spec.admission.max_launcher_depth).join(" -> ")
        );
        if !agent.labels.is_empty() {
            println!("    Labels: {}", agent.labels.join(", "));
        }
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ControllerConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, with_examples: bool) -> Result<()> {
    std::fs::write(output, sample(with_examples))
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}

fn sample(with_examples: bool) -> &'static str {
    if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_are_valid() {
        for with_examples in [false, true] {
            let config = ControllerConfigManifest::from_yaml_str(sample(with_examples)).unwrap();
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_example_sample_declares_agents() {
        let config = ControllerConfigManifest::from_yaml_str(sample(true)).unwrap();
        let names: Vec<_> = config.spec.agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["build-1", "build-mac"]);
        assert_eq!(config.heartbeat_interval(), Some(std::time::Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_generate_writes_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("hangar-config.yaml");
        generate(&output, false).await.unwrap();

        let config = ControllerConfigManifest::from_yaml_file(&output).unwrap();
        assert_eq!(config.spec.listener.port, 50000);
    }
}
