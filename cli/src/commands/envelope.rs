// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Envelope tooling
//!
//! Commands: sign, verify, canonical

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;
use colored::Colorize;
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};

use bulwark_core::domain::envelope::{MessageEnvelope, SignatureVerifier};
use bulwark_core::domain::node_config::FacadeConfigManifest;
use bulwark_core::domain::tenancy::{StaticTenantPolicy, TenantAuthorizer};
use bulwark_core::infrastructure::{Ed25519KeyRing, Ed25519Signer};

#[derive(Subcommand)]
pub enum EnvelopeCommand {
    /// Build and sign a tool-call envelope, printing it as JSON
    Sign {
        /// Calling agent (must match the key)
        #[arg(long)]
        agent: String,

        /// Base64 Ed25519 secret key
        #[arg(long, env = "BULWARK_SIGNING_KEY", hide_env_values = true, conflicts_with = "secret_file")]
        secret: Option<String>,

        /// File holding the base64 secret key (as written by `bulwark keygen`)
        #[arg(long, value_name = "FILE")]
        secret_file: Option<PathBuf>,

        /// Tenant the call acts within
        #[arg(long)]
        tenant: String,

        /// Tool to invoke
        #[arg(long)]
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Where the reply should be delivered
        #[arg(long)]
        reply_to: String,

        /// Trace id (generated when omitted)
        #[arg(long)]
        trace_id: Option<String>,

        /// Conversation id (generated when omitted)
        #[arg(long)]
        conversation_id: Option<String>,

        /// Pretty-print the envelope
        #[arg(long)]
        pretty: bool,
    },

    /// Check an envelope's headers, signature and tenant scope
    Verify {
        /// Envelope JSON file, or `-` for stdin
        #[arg(value_name = "FILE", default_value = "-")]
        file: PathBuf,

        /// Caller's base64 Ed25519 public key
        #[arg(long, conflicts_with = "public_key_file")]
        public_key: Option<String>,

        /// File holding the caller's base64 public key
        #[arg(long, value_name = "FILE")]
        public_key_file: Option<PathBuf>,

        /// Also check the caller against the configured tenant grants
        #[arg(long)]
        check_grants: bool,
    },

    /// Print the bytes covered by the envelope signature
    Canonical {
        /// Envelope JSON file, or `-` for stdin
        #[arg(value_name = "FILE", default_value = "-")]
        file: PathBuf,
    },
}

pub async fn handle_command(command: EnvelopeCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        EnvelopeCommand::Sign {
            agent,
            secret,
            secret_file,
            tenant,
            tool,
            args,
            reply_to,
            trace_id,
            conversation_id,
            pretty,
        } => {
            let secret = read_key(secret, secret_file.as_deref(), "secret key")?;
            let signer = Ed25519Signer::from_base64(agent.as_str(), &secret).context("Failed to load signing key")?;
            let arguments: Value = serde_json::from_str(&args).context("--args must be valid JSON")?;
            if !arguments.is_object() {
                anyhow::bail!("--args must be a JSON object");
            }

            let mut builder = MessageEnvelope::builder(tenant.as_str())
                .reply_to(reply_to.as_str())
                .tool(tool, arguments);
            if let Some(trace_id) = trace_id {
                builder = builder.trace_id(trace_id.as_str());
            }
            if let Some(conversation_id) = conversation_id {
                builder = builder.conversation_id(conversation_id.as_str());
            }
            let envelope = builder.sign(&signer).context("Failed to sign envelope")?;

            let json = if pretty {
                serde_json::to_string_pretty(&envelope)?
            } else {
                envelope.to_json()?
            };
            println!("{}", json);
            Ok(())
        }
        EnvelopeCommand::Verify {
            file,
            public_key,
            public_key_file,
            check_grants,
        } => {
            let envelope = read_envelope(&file)?;
            let public_key = read_key(public_key, public_key_file.as_deref(), "public key")?;
            let policy = if check_grants {
                let config = FacadeConfigManifest::load_or_default(config_override)
                    .context("Failed to load configuration")?;
                Some(StaticTenantPolicy::from_grants(&config.spec.router.tenant_grants))
            } else {
                None
            };

            let problems = verify_envelope(&envelope, &public_key, policy.as_ref())?;
            print_summary(&envelope);
            if problems.is_empty() {
                println!("{}", "✓ Envelope is valid".green());
                Ok(())
            } else {
                for problem in &problems {
                    println!("{} {}", "✗".red(), problem);
                }
                anyhow::bail!("Envelope failed {} check(s)", problems.len())
            }
        }
        EnvelopeCommand::Canonical { file } => {
            let envelope = read_envelope(&file)?;
            let bytes = envelope.canonical_bytes().context("Failed to encode envelope")?;
            println!("{}", String::from_utf8_lossy(&bytes));
            Ok(())
        }
    }
}

/// Checks the router would apply before dispatch, minus replay tracking.
/// Returns one message per failed check.
pub(crate) fn verify_envelope(
    envelope: &MessageEnvelope,
    public_key: &str,
    policy: Option<&StaticTenantPolicy>,
) -> Result<Vec<String>> {
    let mut problems = Vec::new();

    if let Some(header) = envelope.missing_header() {
        problems.push(format!("missing required header: {}", header));
    }

    let key_ring = Ed25519KeyRing::new();
    key_ring
        .register_base64(envelope.caller().clone(), public_key)
        .context("Invalid public key")?;
    let bytes = envelope.canonical_bytes().context("Failed to encode envelope")?;
    if !key_ring.verify(&bytes, envelope.auth_sig(), envelope.caller()) {
        problems.push(format!("signature does not verify for caller '{}'", envelope.caller()));
    }

    if let Some(referenced) = envelope.referenced_tenant() {
        if referenced != envelope.tenant_id().as_str() {
            problems.push(format!(
                "arguments reference tenant '{}' but envelope is scoped to '{}'",
                referenced,
                envelope.tenant_id()
            ));
        }
    }

    if let Some(policy) = policy {
        if !policy.is_authorized(envelope.caller(), envelope.tenant_id()) {
            problems.push(format!(
                "caller '{}' is not granted tenant '{}'",
                envelope.caller(),
                envelope.tenant_id()
            ));
        }
    }

    Ok(problems)
}

fn print_summary(envelope: &MessageEnvelope) {
    let age = Utc::now().signed_duration_since(envelope.issued_at());
    println!("{}", "Envelope:".bold());
    println!("  Id: {}", envelope.id());
    println!("  Issued: {} ({}s ago)", envelope.issued_at().to_rfc3339(), age.num_seconds());
    println!("  Caller: {}", envelope.caller());
    println!("  Tenant: {}", envelope.tenant_id());
    println!("  Trace: {}", envelope.trace_id());
    println!("  Conversation: {}", envelope.conversation_id());
    println!("  Reply to: {}", envelope.reply_to());
    println!("  Tool: {}", envelope.tool_name());
    println!();
}

fn read_key(inline: Option<String>, file: Option<&Path>, what: &str) -> Result<String> {
    match (inline, file) {
        (Some(key), _) => Ok(key.trim().to_string()),
        (None, Some(path)) => Ok(std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {} from {:?}", what, path))?
            .trim()
            .to_string()),
        (None, None) => anyhow::bail!("A {} is required", what),
    }
}

fn read_envelope(path: &Path) -> Result<MessageEnvelope> {
    let json = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read envelope from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read envelope from {:?}", path))?
    };
    MessageEnvelope::from_json(&json).context("Failed to parse envelope JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signed(signer: &Ed25519Signer, tenant: &str, arguments: Value) -> MessageEnvelope {
        MessageEnvelope::builder(tenant)
            .reply_to("https://planner.internal/replies")
            .tool("db.query", arguments)
            .sign(signer)
            .unwrap()
    }

    #[test]
    fn signed_envelope_passes() {
        let signer = Ed25519Signer::generate("planner");
        let envelope = signed(&signer, "acme", json!({"sql": "select 1"}));
        let policy = StaticTenantPolicy::new().grant("planner", ["acme"]);

        let problems = verify_envelope(&envelope, &signer.public_key_base64(), Some(&policy)).unwrap();
        assert!(problems.is_empty(), "{:?}", problems);
    }

    #[test]
    fn wrong_key_and_ungranted_tenant_are_reported() {
        let signer = Ed25519Signer::generate("planner");
        let other = Ed25519Signer::generate("planner");
        let envelope = signed(&signer, "globex", json!({}));
        let policy = StaticTenantPolicy::new().grant("planner", ["acme"]);

        let problems = verify_envelope(&envelope, &other.public_key_base64(), Some(&policy)).unwrap();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("signature"));
        assert!(problems[1].contains("not granted"));
    }

    #[test]
    fn cross_tenant_reference_is_reported() {
        let signer = Ed25519Signer::generate("planner");
        let envelope = signed(&signer, "acme", json!({"tenant_id": "globex"}));

        let problems = verify_envelope(&envelope, &signer.public_key_base64(), None).unwrap();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("globex"));
    }

    #[test]
    fn tampered_json_fails_signature() {
        let signer = Ed25519Signer::generate("planner");
        let envelope = signed(&signer, "acme", json!({"sql": "select 1"}));
        let tampered = envelope.to_json().unwrap().replace("select 1", "drop table notes");
        let tampered = MessageEnvelope::from_json(&tampered).unwrap();

        let problems = verify_envelope(&tampered, &signer.public_key_base64(), None).unwrap();
        assert_eq!(problems.len(), 1);
    }

    #[test]
    fn malformed_public_key_is_an_error() {
        let signer = Ed25519Signer::generate("planner");
        let envelope = signed(&signer, "acme", json!({}));
        assert!(verify_envelope(&envelope, "not-base64!", None).is_err());
    }
}
