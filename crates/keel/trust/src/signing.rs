//! Process-local signing authority.
//!
//! One active RSA-2048 key signs (PKCS#1 v1.5 over SHA-256); rotation retires
//! it. Retired keys keep verifying already-issued signatures until the
//! retention window (the longest token lifetime) has elapsed, then they are
//! dropped.

use crate::error::{Result, TrustError};
use chrono::{DateTime, Utc};
use rand::rngs::{OsRng, StdRng};
use rand::{CryptoRng, RngCore, SeedableRng};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::EncodePublicKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::RwLock;
use std::time::Duration;

pub const SIGNATURE_ALGORITHM: &str = "RSA-SHA256";
pub const KEY_BITS: usize = 2048;

/// A payload together with a detached signature over its exact bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub payload: String,
    /// Hex-encoded signature.
    pub signature: String,
    pub algorithm: String,
    pub key_fingerprint: String,
    pub timestamp: DateTime<Utc>,
}

/// SHA-256 of the DER (SubjectPublicKeyInfo) public key, hex, first 16 characters.
pub fn key_fingerprint(key: &RsaPublicKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|err| TrustError::KeyGeneration(format!("public key export failed: {err}")))?;
    let mut digest = hex::encode(Sha256::digest(der.as_bytes()));
    digest.truncate(16);
    Ok(digest)
}

struct ActiveKey {
    signing_key: SigningKey<Sha256>,
    public_key: RsaPublicKey,
    fingerprint: String,
}

impl ActiveKey {
    fn generate<R: CryptoRng + RngCore>(rng: &mut R) -> Result<Self> {
        let private_key = RsaPrivateKey::new(rng, KEY_BITS)
            .map_err(|err| TrustError::KeyGeneration(err.to_string()))?;
        let public_key = private_key.to_public_key();
        let fingerprint = key_fingerprint(&public_key)?;
        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(private_key),
            public_key,
            fingerprint,
        })
    }
}

struct RetiredKey {
    public_key: RsaPublicKey,
    fingerprint: String,
    retired_at: DateTime<Utc>,
}

#[derive(Default)]
struct AuthorityState {
    active: Option<ActiveKey>,
    retired: Vec<RetiredKey>,
}

pub struct SigningAuthority {
    state: RwLock<AuthorityState>,
    retention: Duration,
}

impl SigningAuthority {
    /// Generate a fresh key pair. `retention` bounds how long a rotated-out
    /// key is still accepted for verification.
    pub fn new(retention: Duration) -> Result<Self> {
        Ok(Self::with_key(ActiveKey::generate(&mut OsRng)?, retention))
    }

    /// Derive the initial key pair deterministically from `seed`.
    /// Rotated keys are always drawn from the OS generator.
    pub fn from_seed(seed: [u8; 32], retention: Duration) -> Result<Self> {
        let mut rng = StdRng::from_seed(seed);
        Ok(Self::with_key(ActiveKey::generate(&mut rng)?, retention))
    }

    fn with_key(active: ActiveKey, retention: Duration) -> Self {
        tracing::info!(
            key_fingerprint = %active.fingerprint,
            bits = KEY_BITS,
            "signing authority initialised"
        );
        Self {
            state: RwLock::new(AuthorityState {
                active: Some(active),
                retired: Vec::new(),
            }),
            retention,
        }
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.active.as_ref().map(|key| key.fingerprint.clone()))
    }

    pub fn public_key(&self) -> Option<RsaPublicKey> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.active.as_ref().map(|key| key.public_key.clone()))
    }

    pub fn sign(&self, payload: impl Into<String>) -> Result<SignedPayload> {
        let payload = payload.into();
        let state = self
            .state
            .read()
            .map_err(|_| TrustError::Internal("authority lock poisoned".to_string()))?;
        let active = state.active.as_ref().ok_or(TrustError::AuthorityShutdown)?;
        let signature = active
            .signing_key
            .try_sign(payload.as_bytes())
            .map_err(|err| TrustError::Internal(format!("signing failed: {err}")))?;
        Ok(SignedPayload {
            payload,
            signature: hex::encode(signature.to_bytes()),
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            key_fingerprint: active.fingerprint.clone(),
            timestamp: Utc::now(),
        })
    }

    /// Verify `signed`. With an explicit `public_key` only that key is tried;
    /// otherwise the key is looked up by fingerprint among the active key and
    /// retired keys still inside their retention window.
    pub fn verify(&self, signed: &SignedPayload, public_key: Option<&RsaPublicKey>) -> bool {
        if signed.algorithm != SIGNATURE_ALGORITHM {
            return false;
        }
        let Some(signature) = decode_signature(&signed.signature) else {
            return false;
        };

        let key = match public_key {
            Some(key) => Some(key.clone()),
            None => {
                let Ok(state) = self.state.read() else {
                    return false;
                };
                match state.active {
                    Some(ref active) if active.fingerprint == signed.key_fingerprint => {
                        Some(active.public_key.clone())
                    }
                    _ => {
                        let cutoff = retention_cutoff(Utc::now(), self.retention);
                        state
                            .retired
                            .iter()
                            .find(|k| {
                                k.fingerprint == signed.key_fingerprint && k.retired_at > cutoff
                            })
                            .map(|k| k.public_key.clone())
                    }
                }
            }
        };
        key.is_some_and(|key| {
            VerifyingKey::<Sha256>::new(key)
                .verify(signed.payload.as_bytes(), &signature)
                .is_ok()
        })
    }

    /// Replace the active key. Returns the new key fingerprint.
    pub fn rotate(&self) -> Result<String> {
        // Key generation is slow; keep it outside the write lock.
        let next = ActiveKey::generate(&mut OsRng)?;
        let fingerprint = next.fingerprint.clone();

        let mut state = self
            .state
            .write()
            .map_err(|_| TrustError::Internal("authority lock poisoned".to_string()))?;
        let previous = state.active.take().ok_or(TrustError::AuthorityShutdown)?;

        let now = Utc::now();
        let cutoff = retention_cutoff(now, self.retention);
        state.retired.retain(|k| k.retired_at > cutoff);
        state.retired.push(RetiredKey {
            public_key: previous.public_key,
            fingerprint: previous.fingerprint.clone(),
            retired_at: now,
        });
        state.active = Some(next);
        tracing::info!(
            previous = %previous.fingerprint,
            current = %fingerprint,
            "signing key rotated"
        );
        Ok(fingerprint)
    }

    /// Drop every key. Signing fails and nothing verifies afterwards.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.state.write() {
            state.active = None;
            state.retired.clear();
            tracing::info!("signing authority shut down");
        }
    }
}

fn decode_signature(encoded: &str) -> Option<Signature> {
    let bytes = hex::decode(encoded).ok()?;
    Signature::try_from(bytes.as_slice()).ok()
}

// Keys retired at or before the cutoff no longer verify.
fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> SigningAuthority {
        SigningAuthority::from_seed([7u8; 32], Duration::from_secs(300)).unwrap()
    }

    #[test]
    fn sign_and_verify() {
        let authority = authority();
        let signed = authority.sign(r#"{"a":1}"#).unwrap();
        assert_eq!(signed.algorithm, "RSA-SHA256");
        assert_eq!(signed.key_fingerprint.len(), 16);
        // 2048-bit modulus, hex encoded.
        assert_eq!(signed.signature.len(), 512);
        assert!(authority.verify(&signed, None));

        let key = authority.public_key().unwrap();
        assert!(authority.verify(&signed, Some(&key)));
    }

    #[test]
    fn seeded_authority_is_reproducible() {
        let a = authority();
        let b = authority();
        assert_eq!(a.fingerprint(), b.fingerprint());
        let expected = key_fingerprint(&a.public_key().unwrap()).unwrap();
        assert_eq!(a.fingerprint().unwrap(), expected);
        // PKCS#1 v1.5 signatures are deterministic.
        assert_eq!(a.sign("same").unwrap().signature, b.sign("same").unwrap().signature);
    }

    #[test]
    fn wrong_algorithm_label_fails() {
        let authority = authority();
        let mut signed = authority.sign("payload").unwrap();
        signed.algorithm = "ed25519".to_string();
        assert!(!authority.verify(&signed, None));
    }

    #[test]
    fn tampered_payload_fails() {
        let authority = authority();
        let mut signed = authority.sign("original").unwrap();
        signed.payload = "forged".to_string();
        assert!(!authority.verify(&signed, None));
    }

    #[test]
    fn foreign_key_fails() {
        let authority = authority();
        let other = SigningAuthority::from_seed([9u8; 32], Duration::from_secs(300)).unwrap();
        let signed = authority.sign("payload").unwrap();
        assert!(!other.verify(&signed, None));
        assert!(!authority.verify(&signed, other.public_key().as_ref()));
    }

    #[test]
    fn rotated_key_verifies_within_retention() {
        let authority = authority();
        let before = authority.sign("issued before rotation").unwrap();
        let old = authority.fingerprint().unwrap();
        let new = authority.rotate().unwrap();
        assert_ne!(old, new);

        assert!(authority.verify(&before, None));
        let after = authority.sign("issued after rotation").unwrap();
        assert_eq!(after.key_fingerprint, new);
        assert!(authority.verify(&after, None));
    }

    #[test]
    fn rotated_key_expires_after_retention() {
        let authority = SigningAuthority::from_seed([7u8; 32], Duration::ZERO).unwrap();
        let before = authority.sign("payload").unwrap();
        authority.rotate().unwrap();
        assert!(!authority.verify(&before, None));
    }

    #[test]
    fn shutdown_disables_authority() {
        let authority = authority();
        let signed = authority.sign("payload").unwrap();
        authority.shutdown();
        assert!(matches!(
            authority.sign("again"),
            Err(TrustError::AuthorityShutdown)
        ));
        assert!(!authority.verify(&signed, None));
        assert!(authority.rotate().is_err());
    }
}
