//! Registry of live pairing sequences.
//!
//! Lookups purge expired entries on sight, so callers never observe a
//! sequence past its expiry: it is simply absent.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use paircast_proto::types::Topic;

use crate::errors::{CoreError, SequenceError};
use crate::sequence::PairingSequence;

/// Sequences keyed by topic.
#[derive(Default)]
pub struct SequenceRegistry {
    sequences: RwLock<HashMap<Topic, PairingSequence>>,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the sequence for its topic.
    pub async fn insert(&self, sequence: PairingSequence) {
        self.sequences
            .write()
            .await
            .insert(sequence.topic.clone(), sequence);
    }

    /// Remove and return the sequence for a topic.
    pub async fn remove(&self, topic: &Topic) -> Option<PairingSequence> {
        self.sequences.write().await.remove(topic)
    }

    /// Fetch a clone of a live sequence. Expired entries are purged and
    /// reported absent.
    pub async fn find(&self, topic: &Topic, now_unix: u64) -> Option<PairingSequence> {
        {
            let sequences = self.sequences.read().await;
            match sequences.get(topic) {
                None => return None,
                Some(seq) if !seq.is_expired(now_unix) => return Some(seq.clone()),
                Some(_) => {}
            }
        }

        // Expired: retake the lock as a writer and purge.
        let mut sequences = self.sequences.write().await;
        if sequences
            .get(topic)
            .map(|seq| seq.is_expired(now_unix))
            .unwrap_or(false)
        {
            sequences.remove(topic);
            debug!(%topic, "purged expired sequence");
        }
        None
    }

    pub async fn contains(&self, topic: &Topic, now_unix: u64) -> bool {
        self.find(topic, now_unix).await.is_some()
    }

    /// Run a mutation against a live sequence under the write lock.
    ///
    /// The closure only runs for an unexpired, present sequence; an expired
    /// one is purged and reported as [`SequenceError::Expired`].
    pub async fn update<F, T>(&self, topic: &Topic, now_unix: u64, mutate: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut PairingSequence) -> Result<T, SequenceError>,
    {
        let mut sequences = self.sequences.write().await;
        let sequence = sequences
            .get_mut(topic)
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;

        if sequence.is_expired(now_unix) {
            sequences.remove(topic);
            debug!(%topic, "purged expired sequence");
            return Err(SequenceError::Expired {
                topic: topic.clone(),
            }
            .into());
        }

        mutate(sequence).map_err(CoreError::from)
    }

    /// Drop every expired sequence, returning what was removed.
    pub async fn cleanup_expired(&self, now_unix: u64) -> Vec<PairingSequence> {
        let mut sequences = self.sequences.write().await;
        let expired: Vec<Topic> = sequences
            .iter()
            .filter(|(_, seq)| seq.is_expired(now_unix))
            .map(|(topic, _)| topic.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for topic in expired {
            if let Some(seq) = sequences.remove(&topic) {
                removed.push(seq);
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "purged expired sequences");
        }
        removed
    }

    /// Topics of all live sequences.
    pub async fn topics(&self, now_unix: u64) -> Vec<Topic> {
        self.sequences
            .read()
            .await
            .values()
            .filter(|seq| !seq.is_expired(now_unix))
            .map(|seq| seq.topic.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sequences.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sequences.read().await.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{PairingSequence, SequenceState};
    use paircast_proto::types::{
        PairingProposal, PairingProposer, PairingSignal, ParticipantKey, ProposedPermissions,
        RelayProtocolOptions,
    };

    fn make_sequence(topic_byte: u8, expiry_unix: u64) -> PairingSequence {
        let topic = Topic::from_raw([topic_byte; 32]);
        let key = ParticipantKey::from_raw([0xaa; 32]);
        let proposal = PairingProposal {
            topic: topic.clone(),
            relay: RelayProtocolOptions::default(),
            proposer: PairingProposer {
                public_key: key.clone(),
                controller: false,
            },
            signal: PairingSignal::Uri {
                uri: String::new(),
            },
            permissions: ProposedPermissions::default(),
            ttl: 86_400,
        };
        PairingSequence::propose(
            topic,
            RelayProtocolOptions::default(),
            key,
            proposal,
            expiry_unix,
        )
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let registry = SequenceRegistry::new();
        registry.insert(make_sequence(1, 1_000)).await;

        let topic = Topic::from_raw([1u8; 32]);
        let found = registry.find(&topic, 100).await.unwrap();
        assert_eq!(found.topic, topic);
        assert!(registry.contains(&topic, 100).await);
    }

    #[tokio::test]
    async fn test_find_purges_expired() {
        let registry = SequenceRegistry::new();
        registry.insert(make_sequence(1, 100)).await;

        let topic = Topic::from_raw([1u8; 32]);
        assert!(registry.find(&topic, 100).await.is_none());
        // gone entirely, not just hidden
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_update_mutates_in_place() {
        let registry = SequenceRegistry::new();
        registry.insert(make_sequence(1, 1_000)).await;

        let topic = Topic::from_raw([1u8; 32]);
        let derived = Topic::from_raw([9u8; 32]);
        registry
            .update(&topic, 100, |seq| {
                seq.mark_responded(derived.clone(), 100)
            })
            .await
            .unwrap();

        let found = registry.find(&topic, 101).await.unwrap();
        assert!(matches!(found.state(), SequenceState::Pending(_)));
        assert_eq!(found.derived_topic(), Some(&derived));
    }

    #[tokio::test]
    async fn test_update_missing_topic() {
        let registry = SequenceRegistry::new();
        let topic = Topic::from_raw([1u8; 32]);
        let err = registry
            .update(&topic, 100, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoMatchingSequence(t) if t == topic));
    }

    #[tokio::test]
    async fn test_update_expired_purges_and_fails() {
        let registry = SequenceRegistry::new();
        registry.insert(make_sequence(1, 100)).await;

        let topic = Topic::from_raw([1u8; 32]);
        let err = registry.update(&topic, 200, |_| Ok(())).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Sequence(SequenceError::Expired { .. })
        ));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let registry = SequenceRegistry::new();
        registry.insert(make_sequence(1, 100)).await;
        registry.insert(make_sequence(2, 1_000)).await;
        registry.insert(make_sequence(3, 150)).await;

        let removed = registry.cleanup_expired(500).await;
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len().await, 1);
        assert!(registry
            .contains(&Topic::from_raw([2u8; 32]), 500)
            .await);
    }

    #[tokio::test]
    async fn test_topics_skips_expired() {
        let registry = SequenceRegistry::new();
        registry.insert(make_sequence(1, 100)).await;
        registry.insert(make_sequence(2, 1_000)).await;

        let topics = registry.topics(500).await;
        assert_eq!(topics, vec![Topic::from_raw([2u8; 32])]);
    }

    #[tokio::test]
    async fn test_remove_returns_sequence() {
        let registry = SequenceRegistry::new();
        registry.insert(make_sequence(1, 1_000)).await;

        let topic = Topic::from_raw([1u8; 32]);
        let removed = registry.remove(&topic).await.unwrap();
        assert_eq!(removed.topic, topic);
        assert!(registry.remove(&topic).await.is_none());
    }
}
