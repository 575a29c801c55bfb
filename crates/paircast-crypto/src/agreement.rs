//! X25519 key agreement for pairing.
//!
//! Both peers hold a static key pair; the shared secret of a completed
//! agreement drives everything downstream: it is the AES key for the
//! topic's envelopes and its hash is the settled topic itself. Private
//! material is zeroized on drop.

use std::fmt;

use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use paircast_proto::types::{ParticipantKey, Topic};

use crate::cipher::SymmetricKey;
use crate::hash::derive_topic;

/// Error type for agreement operations.
#[derive(Debug, thiserror::Error)]
pub enum AgreementError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// An X25519 key pair held by one side of a pairing.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AgreementKeyPair {
    #[zeroize(skip)] // StaticSecret implements Zeroize internally
    secret: StaticSecret,
}

impl AgreementKeyPair {
    /// Generate a new random key pair using a secure random source.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Rebuild a key pair from stored private key bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Private key bytes for persistence.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// X25519 public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        *X25519PublicKey::from(&self.secret).as_bytes()
    }

    /// Public key in wire form.
    pub fn public_key(&self) -> ParticipantKey {
        ParticipantKey::from_raw(self.public_bytes())
    }

    /// Perform X25519 Diffie-Hellman against a peer public key.
    ///
    /// Fails on a key of the wrong length and on low-order peer points,
    /// which would produce an all-zero shared secret.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<[u8; 32], AgreementError> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| AgreementError::InvalidKeyLength {
                expected: 32,
                got: peer_public.len(),
            })?;
        let shared = self.secret.diffie_hellman(&X25519PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(AgreementError::InvalidPublicKey);
        }
        Ok(*shared.as_bytes())
    }

    /// Run the full agreement and package the result for persistence.
    pub fn agree(&self, peer_public: &ParticipantKey) -> Result<AgreementSecret, AgreementError> {
        let shared_secret = self.shared_secret(peer_public.as_bytes())?;
        Ok(AgreementSecret {
            shared_secret,
            public_key: self.public_bytes(),
        })
    }
}

impl fmt::Debug for AgreementKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgreementKeyPair")
            .field("secret", &"[redacted]")
            .field("public_key", &hex::encode(self.public_bytes()))
            .finish()
    }
}

/// Outcome of a completed key agreement: the shared secret plus the local
/// public key that took part in it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AgreementSecret {
    shared_secret: [u8; 32],
    #[zeroize(skip)]
    public_key: [u8; 32],
}

impl AgreementSecret {
    pub fn new(shared_secret: [u8; 32], public_key: [u8; 32]) -> Self {
        Self {
            shared_secret,
            public_key,
        }
    }

    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }

    /// Local public key in wire form.
    pub fn public_key(&self) -> ParticipantKey {
        ParticipantKey::from_raw(self.public_key)
    }

    /// The settled topic this agreement converges on: sha256 of the shared
    /// secret. Both peers compute the same value.
    pub fn derived_topic(&self) -> Topic {
        derive_topic(&self.shared_secret)
    }

    /// The shared secret as an AES-256 key for envelope encryption.
    pub fn symmetric_key(&self) -> SymmetricKey {
        SymmetricKey::from_bytes(self.shared_secret)
    }

    /// Persistence codec: `shared_secret || public_key`, 64 bytes.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.shared_secret);
        out[32..].copy_from_slice(&self.public_key);
        out
    }

    /// Inverse of [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AgreementError> {
        if bytes.len() != 64 {
            return Err(AgreementError::InvalidKeyLength {
                expected: 64,
                got: bytes.len(),
            });
        }
        let mut shared_secret = [0u8; 32];
        let mut public_key = [0u8; 32];
        shared_secret.copy_from_slice(&bytes[..32]);
        public_key.copy_from_slice(&bytes[32..]);
        Ok(Self {
            shared_secret,
            public_key,
        })
    }
}

impl PartialEq for AgreementSecret {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq::constant_time_eq(&self.shared_secret, &other.shared_secret)
            && self.public_key == other.public_key
    }
}

impl Eq for AgreementSecret {}

impl fmt::Debug for AgreementSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgreementSecret")
            .field("shared_secret", &"[redacted]")
            .field("public_key", &hex::encode(self.public_key))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_symmetry() {
        let alice = AgreementKeyPair::generate();
        let bob = AgreementKeyPair::generate();

        // Both parties should derive the same shared secret
        let from_alice = alice.shared_secret(&bob.public_bytes()).expect("agree");
        let from_bob = bob.shared_secret(&alice.public_bytes()).expect("agree");
        assert_eq!(from_alice, from_bob);
    }

    #[test]
    fn test_derived_topic_matches_on_both_sides() {
        let alice = AgreementKeyPair::generate();
        let bob = AgreementKeyPair::generate();

        let a = alice.agree(&bob.public_key()).expect("agree");
        let b = bob.agree(&alice.public_key()).expect("agree");

        assert_eq!(a.derived_topic(), b.derived_topic());
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_rejects_wrong_length_peer_key() {
        let pair = AgreementKeyPair::generate();
        let err = pair.shared_secret(&[0u8; 16]).expect_err("short key");
        assert!(matches!(
            err,
            AgreementError::InvalidKeyLength {
                expected: 32,
                got: 16
            }
        ));
    }

    #[test]
    fn test_rejects_low_order_peer_key() {
        let pair = AgreementKeyPair::generate();
        // The identity point: DH with it yields an all-zero secret.
        let err = pair.shared_secret(&[0u8; 32]).expect_err("low order");
        assert!(matches!(err, AgreementError::InvalidPublicKey));
    }

    #[test]
    fn test_key_pair_persistence_round_trip() {
        let original = AgreementKeyPair::generate();
        let restored = AgreementKeyPair::from_secret_bytes(original.secret_bytes());
        assert_eq!(original.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn test_agreement_secret_codec_round_trip() {
        let secret = AgreementSecret::new([9u8; 32], [4u8; 32]);
        let bytes = secret.to_bytes();
        assert_eq!(bytes.len(), 64);
        let back = AgreementSecret::from_bytes(&bytes).expect("decode");
        assert_eq!(back, secret);
    }

    #[test]
    fn test_agreement_secret_codec_rejects_bad_length() {
        let err = AgreementSecret::from_bytes(&[0u8; 63]).expect_err("short");
        assert!(matches!(
            err,
            AgreementError::InvalidKeyLength {
                expected: 64,
                got: 63
            }
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let secret = AgreementSecret::new([9u8; 32], [4u8; 32]);
        let rendered = format!("{:?}", secret);
        assert!(rendered.contains("[redacted]"));
        assert!(!rendered.contains("090909"));
    }
}
