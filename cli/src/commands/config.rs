// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use bulwark_core::domain::capability::Capability;
use bulwark_core::domain::node_config::FacadeConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective manifest as YAML instead of a summary
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./bulwark-config.yaml)
        #[arg(short, long, default_value = "./bulwark-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = FacadeConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. BULWARK_CONFIG_PATH: {}",
            std::env::var("BULWARK_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./bulwark-config.yaml");
        println!("  4. ~/.bulwark/config.yaml");
        println!("  5. /etc/bulwark/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node:".bold());
    println!("  Name: {}", config.metadata.name);
    if let Some(version) = &config.metadata.version {
        println!("  Version: {}", version);
    }
    println!();

    println!("{}", "Circuit Breakers:".bold());
    for capability in Capability::ALL {
        let breaker = spec.breaker_for(capability);
        let overridden = spec.capabilities.iter().any(|c| c.capability == capability);
        println!(
            "  {:<9} threshold={} recovery={:?} (max {:?}) probes={} call_timeout={:?}{}",
            capability.as_str().bold(),
            breaker.failure_threshold,
            breaker.recovery_timeout,
            breaker.max_recovery_timeout,
            breaker.half_open_max_probes,
            breaker.timeout_per_call,
            if overridden { " [override]".yellow().to_string() } else { String::new() }
        );
    }
    println!();

    println!("{}", "Health Monitor:".bold());
    if spec.health.enabled {
        println!("  Interval: {:?}", spec.health.interval);
    } else {
        println!("  {}", "disabled".dimmed());
    }
    println!();

    println!("{}", "Router:".bold());
    println!("  Handler timeout: {:?}", spec.router.handler_timeout);
    println!("  Replay window: {:?}", spec.router.replay_window);
    let mut callers: Vec<_> = spec.router.tenant_grants.iter().collect();
    callers.sort();
    for (caller, tenants) in callers {
        println!("    {} → {}", caller, tenants.join(", "));
    }
    println!();

    println!("{}", "Reply Dispatcher:".bold());
    let retry = &spec.dispatcher.retry;
    println!(
        "  Retry: {} attempts, {:?} base, x{} backoff, {:?} cap, jitter {}",
        retry.max_attempts, retry.base_delay, retry.factor, retry.max_delay, retry.jitter
    );
    println!("  Concurrency: {}", spec.dispatcher.max_concurrent_deliveries);
    println!("  Delivery timeout: {:?}", spec.dispatcher.delivery_timeout);
    match &spec.dispatcher.dead_letter_path {
        Some(path) => println!("  Dead letters: {}", path.display()),
        None => println!("  Dead letters: {}", "(in memory)".dimmed()),
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = FacadeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    };

    std::fs::write(&output, sample).with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}

#[cfg(test)]
mod tests {
    use bulwark_core::domain::node_config::FacadeConfigManifest;

    #[test]
    fn shipped_templates_are_valid() {
        for template in [
            include_str!("../../templates/config-minimal.yaml"),
            include_str!("../../templates/config-with-examples.yaml"),
        ] {
            let manifest = FacadeConfigManifest::from_yaml_str(template).unwrap();
            manifest.validate().unwrap();
        }
    }
}
