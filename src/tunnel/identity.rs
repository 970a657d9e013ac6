//! Ed25519 identity presented to the relay.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{SECRET_KEY_LENGTH, Signer, SigningKey};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::info;

use super::TunnelError;
use crate::fs;

/// Signing key stored as a base64 seed in a private file.
pub struct TunnelIdentity {
    key: SigningKey,
}

impl std::fmt::Debug for TunnelIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelIdentity")
            .field("public_key", &self.public_key())
            .finish()
    }
}

impl TunnelIdentity {
    /// Wraps an existing seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Loads the identity at `path`, creating it with owner-only
    /// permissions when absent.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Configuration`] when the file cannot be read,
    /// written or decoded.
    pub fn load_or_create(path: &str) -> Result<Self, TunnelError> {
        if fs::exists(path) {
            let encoded = fs::read_to_string(path).map_err(|err| {
                TunnelError::Configuration(format!("failed to read tunnel identity {path}: {err}"))
            })?;
            let decoded = STANDARD.decode(encoded.trim()).map_err(|err| {
                TunnelError::Configuration(format!("tunnel identity {path} is not base64: {err}"))
            })?;
            let seed: [u8; SECRET_KEY_LENGTH] = decoded.try_into().map_err(|_| {
                TunnelError::Configuration(format!(
                    "tunnel identity {path} must hold {SECRET_KEY_LENGTH} bytes"
                ))
            })?;
            return Ok(Self::from_seed(&seed));
        }

        let mut seed = [0_u8; SECRET_KEY_LENGTH];
        OsRng.fill_bytes(&mut seed);
        fs::write_private(path, &format!("{}\n", STANDARD.encode(seed))).map_err(|err| {
            TunnelError::Configuration(format!("failed to write tunnel identity {path}: {err}"))
        })?;
        info!(path, "created tunnel identity");
        Ok(Self::from_seed(&seed))
    }

    /// Base64 public key.
    #[must_use]
    pub fn public_key(&self) -> String {
        STANDARD.encode(self.key.verifying_key().to_bytes())
    }

    /// Base64 signature over `nonce || environment_id`.
    #[must_use]
    pub fn sign_challenge(&self, nonce: &str, environment_id: &str) -> String {
        let mut message = Vec::with_capacity(nonce.len() + environment_id.len());
        message.extend_from_slice(nonce.as_bytes());
        message.extend_from_slice(environment_id.as_bytes());
        STANDARD.encode(self.key.sign(&message).to_bytes())
    }
}

/// Checks a challenge signature; used by relays and tests.
#[must_use]
pub fn verify_challenge(public_key: &str, signature: &str, nonce: &str, environment_id: &str) -> bool {
    let Ok(key_bytes) = STANDARD.decode(public_key) else {
        return false;
    };
    let Ok(signature_bytes) = STANDARD.decode(signature) else {
        return false;
    };
    let Ok(key_array) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = ed25519_dalek::VerifyingKey::from_bytes(&key_array) else {
        return false;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_slice(&signature_bytes) else {
        return false;
    };
    let mut message = nonce.as_bytes().to_vec();
    message.extend_from_slice(environment_id.as_bytes());
    verifying_key.verify_strict(&message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_identities_are_reloaded_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/tunnel.key");
        let path = path.to_str().expect("utf8 path");
        let first = TunnelIdentity::load_or_create(path).expect("create");
        let second = TunnelIdentity::load_or_create(path).expect("reload");
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn signatures_bind_nonce_and_environment() {
        let identity = TunnelIdentity::from_seed(&[7; SECRET_KEY_LENGTH]);
        let signature = identity.sign_challenge("nonce-1", "demo");
        let public_key = identity.public_key();
        assert!(verify_challenge(&public_key, &signature, "nonce-1", "demo"));
        assert!(!verify_challenge(&public_key, &signature, "nonce-2", "demo"));
        assert!(!verify_challenge(&public_key, &signature, "nonce-1", "other"));
    }

    #[test]
    fn corrupt_identity_files_are_configuration_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tunnel.key");
        std::fs::write(&path, "c2hvcnQ=\n").expect("write");
        let err = TunnelIdentity::load_or_create(path.to_str().expect("utf8"))
            .expect_err("short seed");
        assert!(matches!(err, TunnelError::Configuration(_)));
    }
}
