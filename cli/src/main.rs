// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Bulwark Operator CLI
//!
//! The `bulwark` binary is the operator's handle on a facade node's
//! configuration and on the signed agent messaging protocol.
//!
//! ## Commands
//!
//! - `bulwark config show|validate|generate` - Configuration management
//! - `bulwark keygen` - Ed25519 identity for an agent
//! - `bulwark envelope sign|verify|canonical` - Envelope tooling
//! - `bulwark dead-letters list|show|redeliver` - Undeliverable replies

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use bulwark_cli::commands::{self, ConfigCommand, DeadLetterCommand, EnvelopeCommand, KeygenArgs};

/// Bulwark - resilient service facade and agent messaging tooling
#[derive(Parser)]
#[command(name = "bulwark")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "BULWARK_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "BULWARK_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Generate an Ed25519 signing identity
    #[command(name = "keygen")]
    Keygen(KeygenArgs),

    /// Sign, verify and inspect message envelopes
    #[command(name = "envelope")]
    Envelope {
        #[command(subcommand)]
        command: EnvelopeCommand,
    },

    /// Inspect and redeliver dead-lettered replies
    #[command(name = "dead-letters")]
    DeadLetters {
        #[command(subcommand)]
        command: DeadLetterCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.log_json)?;

    match cli.command {
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Keygen(args)) => commands::keygen::execute(args).await,
        Some(Commands::Envelope { command }) => commands::envelope::handle_command(command, cli.config).await,
        Some(Commands::DeadLetters { command }) => {
            commands::dead_letter::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
