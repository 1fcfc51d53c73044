// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Envelope signature providers.
//!
//! - [`Ed25519Signer`] / [`Ed25519KeyRing`]: asymmetric, base64 signatures,
//!   one verifying key per caller.
//! - [`HmacSigner`] / [`HmacKeyRing`]: HMAC-SHA256, hex signatures, one shared
//!   secret per caller, constant-time comparison.
//!
//! Key rings answer `false` for callers they hold no key for.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand_core::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::domain::envelope::{AgentId, EnvelopeSigner, SignatureVerifier};
use crate::domain::errors::SigningError;

type HmacSha256 = Hmac<Sha256>;

pub struct Ed25519Signer {
    agent_id: AgentId,
    signing_key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(agent_id: impl Into<AgentId>, signing_key: SigningKey) -> Self {
        Self {
            agent_id: agent_id.into(),
            signing_key,
        }
    }

    pub fn generate(agent_id: impl Into<AgentId>) -> Self {
        Self::new(agent_id, SigningKey::generate(&mut OsRng))
    }

    /// Load from a base64-encoded 32-byte secret key.
    pub fn from_base64(agent_id: impl Into<AgentId>, secret: &str) -> Result<Self, SigningError> {
        let bytes = STANDARD
            .decode(secret.trim())
            .map_err(|e| SigningError::InvalidKey(format!("invalid base64 secret key: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidKey("secret key must be 32 bytes".to_string()))?;
        Ok(Self::new(agent_id, SigningKey::from_bytes(&bytes)))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn secret_key_base64(&self) -> String {
        STANDARD.encode(self.signing_key.to_bytes())
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.verifying_key().as_bytes())
    }
}

impl EnvelopeSigner for Ed25519Signer {
    fn signer_id(&self) -> &AgentId {
        &self.agent_id
    }

    fn sign(&self, bytes: &[u8]) -> Result<String, SigningError> {
        Ok(STANDARD.encode(self.signing_key.sign(bytes).to_bytes()))
    }
}

/// Caller → Ed25519 verifying key.
#[derive(Default)]
pub struct Ed25519KeyRing {
    keys: DashMap<AgentId, VerifyingKey>,
}

impl Ed25519KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_id: impl Into<AgentId>, key: VerifyingKey) {
        self.keys.insert(agent_id.into(), key);
    }

    /// Register a base64-encoded 32-byte public key.
    pub fn register_base64(&self, agent_id: impl Into<AgentId>, public_key: &str) -> Result<(), SigningError> {
        let bytes = STANDARD
            .decode(public_key.trim())
            .map_err(|e| SigningError::InvalidKey(format!("invalid base64 public key: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidKey("public key must be 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SigningError::InvalidKey(format!("invalid public key: {}", e)))?;
        self.register(agent_id, key);
        Ok(())
    }

    pub fn revoke(&self, agent_id: &AgentId) -> bool {
        self.keys.remove(agent_id).is_some()
    }
}

impl SignatureVerifier for Ed25519KeyRing {
    fn verify(&self, bytes: &[u8], signature: &str, caller: &AgentId) -> bool {
        let Some(key) = self.keys.get(caller).map(|k| *k) else {
            debug!(caller = %caller, "no verifying key registered");
            return false;
        };
        let Ok(decoded) = STANDARD.decode(signature) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(decoded.as_slice()) else {
            return false;
        };
        key.verify(bytes, &Signature::from_bytes(&sig_bytes)).is_ok()
    }
}

pub struct HmacSigner {
    agent_id: AgentId,
    secret: Vec<u8>,
}

impl HmacSigner {
    pub fn new(agent_id: impl Into<AgentId>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            agent_id: agent_id.into(),
            secret: secret.into(),
        }
    }
}

fn hmac_digest(secret: &[u8], bytes: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    mac.update(bytes);
    Ok(mac.finalize().into_bytes().to_vec())
}

impl EnvelopeSigner for HmacSigner {
    fn signer_id(&self) -> &AgentId {
        &self.agent_id
    }

    fn sign(&self, bytes: &[u8]) -> Result<String, SigningError> {
        Ok(hex::encode(hmac_digest(&self.secret, bytes)?))
    }
}

/// Caller → shared HMAC secret.
#[derive(Default)]
pub struct HmacKeyRing {
    secrets: DashMap<AgentId, Vec<u8>>,
}

impl HmacKeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_id: impl Into<AgentId>, secret: impl Into<Vec<u8>>) {
        self.secrets.insert(agent_id.into(), secret.into());
    }
}

impl SignatureVerifier for HmacKeyRing {
    fn verify(&self, bytes: &[u8], signature: &str, caller: &AgentId) -> bool {
        let Some(secret) = self.secrets.get(caller).map(|s| s.clone()) else {
            debug!(caller = %caller, "no shared secret registered");
            return false;
        };
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        match hmac_digest(&secret, bytes) {
            Ok(expected) => expected.ct_eq(&provided).into(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_sign_verify() {
        let signer = Ed25519Signer::generate("agent-a");
        let ring = Ed25519KeyRing::new();
        ring.register_base64("agent-a", &signer.public_key_base64()).unwrap();

        let sig = signer.sign(b"payload").unwrap();
        assert!(ring.verify(b"payload", &sig, &"agent-a".into()));
        assert!(!ring.verify(b"payload!", &sig, &"agent-a".into()));
        assert!(!ring.verify(b"payload", &sig, &"agent-b".into()));
        assert!(!ring.verify(b"payload", "not base64 !!", &"agent-a".into()));
    }

    #[test]
    fn ed25519_secret_roundtrip() {
        let signer = Ed25519Signer::generate("agent-a");
        let restored = Ed25519Signer::from_base64("agent-a", &signer.secret_key_base64()).unwrap();
        assert_eq!(restored.public_key_base64(), signer.public_key_base64());
        assert!(Ed25519Signer::from_base64("agent-a", "c2hvcnQ=").is_err());
    }

    #[test]
    fn revoked_key_no_longer_verifies() {
        let signer = Ed25519Signer::generate("agent-a");
        let ring = Ed25519KeyRing::new();
        ring.register("agent-a", signer.verifying_key());
        let sig = signer.sign(b"x").unwrap();
        assert!(ring.revoke(&"agent-a".into()));
        assert!(!ring.verify(b"x", &sig, &"agent-a".into()));
    }

    #[test]
    fn hmac_sign_verify() {
        let signer = HmacSigner::new("agent-a", b"s3cret".to_vec());
        let ring = HmacKeyRing::new();
        ring.register("agent-a", b"s3cret".to_vec());

        let sig = signer.sign(b"payload").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(ring.verify(b"payload", &sig, &"agent-a".into()));
        assert!(!ring.verify(b"payload", &sig[..62], &"agent-a".into()));

        ring.register("agent-a", b"rotated".to_vec());
        assert!(!ring.verify(b"payload", &sig, &"agent-a".into()));
    }
}
