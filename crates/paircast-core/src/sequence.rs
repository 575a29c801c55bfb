//! Pairing sequence state machine.
//!
//! A pairing lives as two records over its lifetime: a pending sequence on
//! the proposal topic (`Proposed` then `Responded`) and a settled sequence
//! on the topic derived from the shared secret (`PreSettled` then
//! `Acknowledged`). Transitions only move forward and only through the
//! methods here, which check expiry first: an expired sequence refuses
//! every transition and the registry treats it as absent.

use paircast_proto::types::{
    PairingProposal, PairingProposer, PairingState, Participant, ParticipantKey,
    ProposedPermissions, RelayProtocolOptions, SettledPermissions, Topic,
};

use crate::errors::SequenceError;

// ============================================================================
// States
// ============================================================================

/// Status of a pending (not yet settled) sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingStatus {
    /// Waiting for any response to the proposal.
    Proposed,
    /// A response arrived; the settled sequence lives at the derived topic.
    Responded { derived_topic: Topic },
}

/// Status of a settled sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettledStatus {
    /// Settled locally, acknowledgement from the peer outstanding.
    PreSettled,
    /// Both sides confirmed the pairing.
    Acknowledged,
}

/// A sequence still on its proposal topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Pending {
    pub proposal: PairingProposal,
    pub status: PendingStatus,
}

/// A sequence on its settled topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled {
    pub peer: Participant,
    pub permissions: SettledPermissions,
    pub state: PairingState,
    pub status: SettledStatus,
}

/// The two phases a sequence record can be in.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceState {
    Pending(Pending),
    Settled(Settled),
}

// ============================================================================
// Sequence
// ============================================================================

/// One pairing record, keyed by its topic.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingSequence {
    pub topic: Topic,
    pub relay: RelayProtocolOptions,
    /// Our own public key on this sequence.
    pub self_key: ParticipantKey,
    /// Unix seconds after which the sequence is dead.
    pub expiry_unix: u64,
    state: SequenceState,
}

impl PairingSequence {
    /// New pending sequence in `Proposed`.
    pub fn propose(
        topic: Topic,
        relay: RelayProtocolOptions,
        self_key: ParticipantKey,
        proposal: PairingProposal,
        expiry_unix: u64,
    ) -> Self {
        Self {
            topic,
            relay,
            self_key,
            expiry_unix,
            state: SequenceState::Pending(Pending {
                proposal,
                status: PendingStatus::Proposed,
            }),
        }
    }

    /// New settled sequence in `PreSettled`.
    #[allow(clippy::too_many_arguments)]
    pub fn settle(
        topic: Topic,
        relay: RelayProtocolOptions,
        self_key: ParticipantKey,
        peer: Participant,
        permissions: SettledPermissions,
        pairing_state: PairingState,
        expiry_unix: u64,
    ) -> Self {
        Self {
            topic,
            relay,
            self_key,
            expiry_unix,
            state: SequenceState::Settled(Settled {
                peer,
                permissions,
                state: pairing_state,
                status: SettledStatus::PreSettled,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// `Proposed` -> `Responded`.
    pub fn mark_responded(
        &mut self,
        derived_topic: Topic,
        now_unix: u64,
    ) -> Result<(), SequenceError> {
        self.check_unexpired(now_unix)?;
        let from = self.status_label();
        match &mut self.state {
            SequenceState::Pending(pending) if pending.status == PendingStatus::Proposed => {
                pending.status = PendingStatus::Responded { derived_topic };
                Ok(())
            }
            _ => Err(SequenceError::InvalidTransition {
                from,
                action: "respond",
            }),
        }
    }

    /// `PreSettled` -> `Acknowledged`. Acknowledging twice is harmless.
    pub fn acknowledge(&mut self, now_unix: u64) -> Result<(), SequenceError> {
        self.check_unexpired(now_unix)?;
        let from = self.status_label();
        match &mut self.state {
            SequenceState::Settled(settled) => {
                settled.status = SettledStatus::Acknowledged;
                Ok(())
            }
            _ => Err(SequenceError::InvalidTransition {
                from,
                action: "acknowledge",
            }),
        }
    }

    /// Replace the shared state of an acknowledged pairing.
    pub fn apply_state(
        &mut self,
        new_state: PairingState,
        now_unix: u64,
    ) -> Result<(), SequenceError> {
        self.check_unexpired(now_unix)?;
        let from = self.status_label();
        match &mut self.state {
            SequenceState::Settled(settled) if settled.status == SettledStatus::Acknowledged => {
                settled.state = new_state;
                Ok(())
            }
            _ => Err(SequenceError::InvalidTransition {
                from,
                action: "update",
            }),
        }
    }

    /// Widen the permitted methods of an acknowledged pairing.
    ///
    /// Methods already present are not duplicated.
    pub fn apply_upgrade(
        &mut self,
        permissions: &ProposedPermissions,
        now_unix: u64,
    ) -> Result<(), SequenceError> {
        self.check_unexpired(now_unix)?;
        let from = self.status_label();
        match &mut self.state {
            SequenceState::Settled(settled) if settled.status == SettledStatus::Acknowledged => {
                for method in &permissions.jsonrpc.methods {
                    if !settled.permissions.jsonrpc.methods.contains(method) {
                        settled.permissions.jsonrpc.methods.push(method.clone());
                    }
                }
                Ok(())
            }
            _ => Err(SequenceError::InvalidTransition {
                from,
                action: "upgrade",
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn is_expired(&self, now_unix: u64) -> bool {
        now_unix >= self.expiry_unix
    }

    fn check_unexpired(&self, now_unix: u64) -> Result<(), SequenceError> {
        if self.is_expired(now_unix) {
            Err(SequenceError::Expired {
                topic: self.topic.clone(),
            })
        } else {
            Ok(())
        }
    }

    pub fn state(&self) -> &SequenceState {
        &self.state
    }

    pub fn pending(&self) -> Option<&Pending> {
        match &self.state {
            SequenceState::Pending(pending) => Some(pending),
            SequenceState::Settled(_) => None,
        }
    }

    pub fn settled(&self) -> Option<&Settled> {
        match &self.state {
            SequenceState::Settled(settled) => Some(settled),
            SequenceState::Pending(_) => None,
        }
    }

    /// Topic of the settled half, once a response has been recorded.
    pub fn derived_topic(&self) -> Option<&Topic> {
        match &self.state {
            SequenceState::Pending(Pending {
                status: PendingStatus::Responded { derived_topic },
                ..
            }) => Some(derived_topic),
            _ => None,
        }
    }

    /// Whether the peer holds the controller role on this settled sequence.
    pub fn peer_is_controller(&self) -> bool {
        match &self.state {
            SequenceState::Settled(settled) => {
                settled.permissions.controller.public_key == settled.peer.public_key
            }
            SequenceState::Pending(_) => false,
        }
    }

    /// Whether we hold the controller role on this settled sequence.
    pub fn self_is_controller(&self) -> bool {
        match &self.state {
            SequenceState::Settled(settled) => {
                settled.permissions.controller.public_key == self.self_key
            }
            SequenceState::Pending(_) => false,
        }
    }

    pub fn status_label(&self) -> &'static str {
        match &self.state {
            SequenceState::Pending(pending) => match pending.status {
                PendingStatus::Proposed => "proposed",
                PendingStatus::Responded { .. } => "responded",
            },
            SequenceState::Settled(settled) => match settled.status {
                SettledStatus::PreSettled => "pre-settled",
                SettledStatus::Acknowledged => "acknowledged",
            },
        }
    }
}

// ============================================================================
// Controller resolution
// ============================================================================

/// The controlling participant of a settled pairing: the proposer when it
/// claimed the role, the responder otherwise.
pub fn resolve_controller(proposer: &PairingProposer, responder: &Participant) -> Participant {
    if proposer.controller {
        Participant {
            public_key: proposer.public_key.clone(),
        }
    } else {
        responder.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
