// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Dead-letter commands
//!
//! Commands: list, show, redeliver, remove

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use bulwark_core::application::ReplyDispatcher;
use bulwark_core::domain::delivery::DeadLetterStore;
use bulwark_core::domain::envelope::EnvelopeId;
use bulwark_core::domain::errors::DeliveryExhaustedError;
use bulwark_core::domain::events::{BulwarkEvent, DeliveryEvent};
use bulwark_core::domain::node_config::FacadeConfigManifest;
use bulwark_core::domain::reply::{DeadLetter, ReplyOutcome};
use bulwark_core::infrastructure::{
    CompositeTransport, EventBus, FileDeadLetterStore, HttpReplyTransport, InProcessTransport, PresenceRegistry,
    TraceEventReceiver,
};

#[derive(Subcommand)]
pub enum DeadLetterCommand {
    /// List dead-lettered replies
    List {
        /// Dead-letter file (default: spec.dispatcher.dead_letter_path)
        #[arg(long, value_name = "FILE")]
        path: Option<PathBuf>,

        /// Output as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show one dead letter in full
    Show {
        /// Envelope id
        id: String,

        #[arg(long, value_name = "FILE")]
        path: Option<PathBuf>,
    },

    /// Attempt delivery again with a fresh retry budget
    Redeliver {
        /// Envelope id
        id: String,

        #[arg(long, value_name = "FILE")]
        path: Option<PathBuf>,
    },

    /// Discard a dead letter without delivering it
    Remove {
        /// Envelope id
        id: String,

        #[arg(long, value_name = "FILE")]
        path: Option<PathBuf>,
    },
}

pub async fn handle_command(command: DeadLetterCommand, config_override: Option<PathBuf>) -> Result<()> {
    let config = FacadeConfigManifest::load_or_default(config_override).context("Failed to load configuration")?;

    match command {
        DeadLetterCommand::List { path, json } => {
            let store = open_store(path, &config).await?;
            list(&store, json).await
        }
        DeadLetterCommand::Show { id, path } => {
            let store = open_store(path, &config).await?;
            let id = parse_id(&id)?;
            let letter = store
                .get(&id)
                .await?
                .with_context(|| format!("No dead letter for envelope {}", id))?;
            println!("{}", serde_json::to_string_pretty(&letter)?);
            Ok(())
        }
        DeadLetterCommand::Redeliver { id, path } => {
            let store = open_store(path, &config).await?;
            redeliver(Arc::new(store), parse_id(&id)?, &config).await
        }
        DeadLetterCommand::Remove { id, path } => {
            let store = open_store(path, &config).await?;
            let letter = store.remove(&parse_id(&id)?).await?;
            println!(
                "{}",
                format!("✓ Removed dead letter {} (trace {})", letter.envelope_id, letter.payload.trace_id).green()
            );
            Ok(())
        }
    }
}

async fn open_store(path: Option<PathBuf>, config: &FacadeConfigManifest) -> Result<FileDeadLetterStore> {
    let path = path
        .or_else(|| config.spec.dispatcher.dead_letter_path.clone())
        .context("No dead-letter file: pass --path or set spec.dispatcher.dead_letter_path")?;
    debug!(path = %path.display(), "opening dead-letter store");
    FileDeadLetterStore::open(&path)
        .await
        .with_context(|| format!("Failed to open dead-letter file {:?}", path))
}

fn parse_id(id: &str) -> Result<EnvelopeId> {
    EnvelopeId::parse(id).with_context(|| format!("Invalid envelope id: {}", id))
}

async fn list(store: &FileDeadLetterStore, json: bool) -> Result<()> {
    let mut letters = store.list().await?;
    letters.sort_by_key(|l| l.dead_lettered_at);

    if json {
        for letter in &letters {
            println!("{}", serde_json::to_string(letter)?);
        }
        return Ok(());
    }

    if letters.is_empty() {
        println!("{}", "No dead letters".green());
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<12}  {:>8}  {}",
        "ENVELOPE".bold(),
        "DEAD-LETTERED".bold(),
        "TENANT".bold(),
        "ATTEMPTS".bold(),
        "REPLY TO".bold()
    );
    for letter in &letters {
        println!(
            "{:<36}  {:<20}  {:<12}  {:>8}  {}",
            letter.envelope_id,
            letter.dead_lettered_at.format("%Y-%m-%d %H:%M:%S"),
            letter.payload.tenant_id,
            letter.attempts,
            letter.reply_to
        );
        println!("    {} {}", outcome_label(letter), letter.last_error.dimmed());
    }
    println!();
    println!("{} dead letter(s)", letters.len());

    Ok(())
}

fn outcome_label(letter: &DeadLetter) -> colored::ColoredString {
    match letter.payload.outcome {
        ReplyOutcome::Success { .. } => format!("[{} ok]", letter.payload.tool_name).normal(),
        ReplyOutcome::Failure { .. } => format!("[{} failed]", letter.payload.tool_name).yellow(),
    }
}

async fn redeliver(
    store: Arc<FileDeadLetterStore>,
    id: EnvelopeId,
    config: &FacadeConfigManifest,
) -> Result<()> {
    let letter = store
        .get(&id)
        .await?
        .with_context(|| format!("No dead letter for envelope {}", id))?;

    let dispatcher_config = config.spec.dispatcher.clone();
    let http = HttpReplyTransport::new(dispatcher_config.delivery_timeout).context("Failed to build HTTP transport")?;
    let transport = CompositeTransport::standard(Arc::new(http), Arc::new(InProcessTransport::new()));
    let event_bus = EventBus::with_default_capacity();
    let mut events = event_bus.subscribe_trace(letter.payload.trace_id.clone());

    let dispatcher = Arc::new(ReplyDispatcher::new(
        Arc::new(transport),
        Arc::new(PresenceRegistry::new()),
        store,
        event_bus,
        dispatcher_config,
    ));
    let shutdown = dispatcher.shutdown_token();
    let worker = dispatcher.clone().start();

    println!("Redelivering {} to {}...", id, letter.reply_to);
    dispatcher.redeliver(&id).await.context("Failed to queue redelivery")?;

    // Runs until the reply is delivered or dead-lettered again.
    let outcome = wait_for_outcome(&mut events).await;

    shutdown.cancel();
    if let Err(e) = worker.await {
        warn!(error = %e, "reply dispatcher task ended abnormally");
    }

    match outcome {
        Ok(Ok(attempts)) => {
            info!(envelope_id = %id, attempts, "dead letter redelivered");
            println!("{}", format!("✓ Delivered after {} attempt(s)", attempts).green());
            Ok(())
        }
        Ok(Err(error)) => {
            anyhow::bail!("Redelivery failed, reply is dead-lettered again: {}", error)
        }
        Err(e) => Err(e.context("Lost track of the redelivery")),
    }
}

async fn wait_for_outcome(events: &mut TraceEventReceiver) -> Result<Result<u32, DeliveryExhaustedError>> {
    loop {
        match events.recv().await? {
            BulwarkEvent::Delivery(DeliveryEvent::Delivered { attempts, .. }) => return Ok(Ok(attempts)),
            BulwarkEvent::Delivery(DeliveryEvent::DeadLettered { error, .. }) => return Ok(Err(error)),
            BulwarkEvent::Delivery(DeliveryEvent::RetryScheduled { attempt, delay_ms, error, .. }) => {
                println!("  attempt {} failed ({}), retrying in {}ms", attempt, error, delay_ms);
            }
            BulwarkEvent::Delivery(DeliveryEvent::DeadLetterStoreFailed { error, .. }) => {
                println!("  {} could not write dead letter ({}), retrying", "!".yellow(), error);
            }
            _ => {}
        }
    }
}
