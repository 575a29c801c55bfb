//! Key management: key pairs and agreement secrets over a secret store.
//!
//! Key pairs are persisted under the hex of their public key, agreement
//! secrets under the hex of their settled topic. Both live in the same
//! [`SecretStore`]; identifier prefixes keep the namespaces apart.

use std::sync::Arc;

use tracing::debug;
use zeroize::Zeroizing;

use paircast_crypto::agreement::{AgreementKeyPair, AgreementSecret};
use paircast_proto::types::{ParticipantKey, Topic};

use crate::errors::{CoreError, StoreError};
use crate::secret_store::SecretStore;

const KEY_PAIR_PREFIX: &str = "keypair/";
const AGREEMENT_PREFIX: &str = "agreement/";

/// Creates, loads, and retires key material.
pub struct KeyManagement<S: SecretStore> {
    store: Arc<S>,
}

impl<S: SecretStore> KeyManagement<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn key_pair_id(public_key: &ParticipantKey) -> String {
        format!("{}{}", KEY_PAIR_PREFIX, public_key)
    }

    fn agreement_id(topic: &Topic) -> String {
        format!("{}{}", AGREEMENT_PREFIX, topic)
    }

    // ------------------------------------------------------------------------
    // Key pairs
    // ------------------------------------------------------------------------

    /// Generate a fresh key pair and persist the private half.
    pub async fn create_key_pair(&self) -> Result<AgreementKeyPair, CoreError> {
        let pair = AgreementKeyPair::generate();
        let secret = Zeroizing::new(pair.secret_bytes().to_vec());
        self.store
            .put(&Self::key_pair_id(&pair.public_key()), &secret)
            .await?;
        debug!(public_key = %pair.public_key(), "created key pair");
        Ok(pair)
    }

    /// Reload a key pair by its public key.
    pub async fn load_key_pair(
        &self,
        public_key: &ParticipantKey,
    ) -> Result<AgreementKeyPair, CoreError> {
        let id = Self::key_pair_id(public_key);
        let bytes = Zeroizing::new(
            self.store
                .get(&id)
                .await?
                .ok_or_else(|| CoreError::KeyNotFound(public_key.clone()))?,
        );
        let secret: [u8; 32] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Corrupt {
                    identifier: id,
                    reason: "key pair record is not 32 bytes",
                })?;
        Ok(AgreementKeyPair::from_secret_bytes(secret))
    }

    /// X25519 between a stored private key and a peer public key.
    pub async fn perform_agreement(
        &self,
        self_public: &ParticipantKey,
        peer_public: &ParticipantKey,
    ) -> Result<AgreementSecret, CoreError> {
        let pair = self.load_key_pair(self_public).await?;
        Ok(pair.agree(peer_public)?)
    }

    /// Remove a key pair. Missing keys are a no-op by store contract.
    pub async fn delete_key_pair(&self, public_key: &ParticipantKey) -> Result<(), CoreError> {
        self.store.delete(&Self::key_pair_id(public_key)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Agreement secrets
    // ------------------------------------------------------------------------

    /// Persist the agreement secret that protects a settled topic.
    pub async fn save_agreement(
        &self,
        topic: &Topic,
        secret: &AgreementSecret,
    ) -> Result<(), CoreError> {
        let bytes = Zeroizing::new(secret.to_bytes().to_vec());
        self.store.put(&Self::agreement_id(topic), &bytes).await?;
        Ok(())
    }

    /// Fetch the agreement secret for a topic, if one is stored.
    pub async fn load_agreement(&self, topic: &Topic) -> Result<Option<AgreementSecret>, CoreError> {
        match self.store.get(&Self::agreement_id(topic)).await? {
            None => Ok(None),
            Some(bytes) => {
                let bytes = Zeroizing::new(bytes);
                Ok(Some(AgreementSecret::from_bytes(&bytes)?))
            }
        }
    }

    /// Remove the agreement secret for a topic. Never fails on absence.
    pub async fn delete_agreement(&self, topic: &Topic) -> Result<(), CoreError> {
        debug!(%topic, "deleting agreement secret");
        self.store.delete(&Self::agreement_id(topic)).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
