// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `bulwark keygen` - generate an Ed25519 identity for an agent.
//!
//! Writes `<agent>.key` (base64 secret, owner-only on Unix) and
//! `<agent>.pub` (base64 verifying key) into the output directory.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::{Path, PathBuf};

use bulwark_core::infrastructure::Ed25519Signer;

#[derive(Args)]
pub struct KeygenArgs {
    /// Agent identity the key belongs to (recorded as `caller` on signed envelopes)
    #[arg(value_name = "AGENT")]
    pub agent: String,

    /// Directory to write the key files into. Keys are only printed when omitted.
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Overwrite existing key files
    #[arg(long)]
    pub force: bool,
}

pub async fn execute(args: KeygenArgs) -> Result<()> {
    if args.agent.trim().is_empty() {
        anyhow::bail!("Agent id cannot be empty");
    }

    let signer = Ed25519Signer::generate(args.agent.as_str());
    let public_key = signer.public_key_base64();
    let secret_key = signer.secret_key_base64();

    println!("{}", format!("Generated Ed25519 identity for '{}'", args.agent).bold());
    println!("  Public key: {}", public_key.cyan());

    match &args.output_dir {
        Some(dir) => {
            let (key_path, pub_path) = write_key_files(dir, &args.agent, &secret_key, &public_key, args.force)?;
            println!("{}", format!("✓ Secret key written to {}", key_path.display()).green());
            println!("{}", format!("✓ Public key written to {}", pub_path.display()).green());
        }
        None => {
            println!("  Secret key: {}", secret_key);
            println!();
            println!(
                "{}",
                "Store the secret key securely; it is not saved anywhere.".yellow()
            );
        }
    }

    Ok(())
}

pub(crate) fn write_key_files(
    dir: &Path,
    agent: &str,
    secret_key: &str,
    public_key: &str,
    force: bool,
) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

    let key_path = dir.join(format!("{}.key", agent));
    let pub_path = dir.join(format!("{}.pub", agent));

    if !force {
        for path in [&key_path, &pub_path] {
            if path.exists() {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
        }
    }

    std::fs::write(&key_path, format!("{}\n", secret_key))
        .with_context(|| format!("Failed to write {:?}", key_path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {:?}", key_path))?;
    }

    std::fs::write(&pub_path, format!("{}\n", public_key))
        .with_context(|| format!("Failed to write {:?}", pub_path))?;

    Ok((key_path, pub_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_loadable_key_pair() {
        let dir = tempfile::tempdir().unwrap();
        let signer = Ed25519Signer::generate("planner");

        let (key_path, pub_path) = write_key_files(
            dir.path(),
            "planner",
            &signer.secret_key_base64(),
            &signer.public_key_base64(),
            false,
        )
        .unwrap();

        let secret = std::fs::read_to_string(&key_path).unwrap();
        let reloaded = Ed25519Signer::from_base64("planner", &secret).unwrap();
        assert_eq!(reloaded.public_key_base64(), std::fs::read_to_string(&pub_path).unwrap().trim());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        write_key_files(dir.path(), "planner", "a", "b", false).unwrap();

        assert!(write_key_files(dir.path(), "planner", "c", "d", false).is_err());
        write_key_files(dir.path(), "planner", "c", "d", true).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("planner.pub")).unwrap(), "d\n");
    }
}
