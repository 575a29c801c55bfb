//! Error types for the pairing core.
//!
//! Each layer has its own error enum; [`CoreError`] aggregates them at the
//! engine boundary so callers match on one type. Inbound relay traffic is
//! untrusted: every decode and transition failure surfaces as a `CoreError`
//! that the engine logs and discards rather than propagating as a panic.

use thiserror::Error;

use paircast_crypto::agreement::AgreementError;
use paircast_crypto::cipher::CipherError;
use paircast_crypto::envelope::EnvelopeError;
use paircast_proto::types::{ParticipantKey, Topic, TypeError};
use paircast_proto::uri::UriError;

// ============================================================================
// Storage errors
// ============================================================================

/// Errors from a secret store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed at the I/O level.
    #[error("secret store i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record does not decode to what was written.
    #[error("secret store record '{identifier}' is corrupt: {reason}")]
    Corrupt {
        identifier: String,
        reason: &'static str,
    },

    /// A stored file is readable by other users.
    #[error("secret store record '{identifier}' has insecure permissions")]
    InsecurePermissions { identifier: String },
}

// ============================================================================
// Relay errors
// ============================================================================

/// Errors from the relay transport.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The subscription channel for a topic is gone.
    #[error("relay channel closed for topic {0}")]
    ChannelClosed(Topic),

    /// The relay backend is unreachable or refused the operation.
    #[error("relay unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Sequence lifecycle errors
// ============================================================================

/// Errors from pairing sequence transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    /// The sequence outlived its expiry and must be treated as absent.
    #[error("sequence {topic} has expired")]
    Expired { topic: Topic },

    /// The requested transition is not legal from the current status.
    #[error("illegal {action} from status '{from}'")]
    InvalidTransition {
        from: &'static str,
        action: &'static str,
    },

    /// The acting participant does not hold the controller role.
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
}

// ============================================================================
// Unified core error
// ============================================================================

/// Any failure the pairing core can produce.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("agreement failure: {0}")]
    Agreement(#[from] AgreementError),

    #[error("cipher failure: {0}")]
    Cipher(#[from] CipherError),

    #[error("envelope failure: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("uri failure: {0}")]
    Uri(#[from] UriError),

    #[error("field failure: {0}")]
    Field(#[from] TypeError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("relay failure: {0}")]
    Relay(#[from] RelayError),

    #[error("sequence failure: {0}")]
    Sequence(#[from] SequenceError),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No private key is stored for the given public key.
    #[error("no key pair stored for public key {0}")]
    KeyNotFound(ParticipantKey),

    /// A message arrived for a topic with no live sequence.
    #[error("no matching sequence for topic {0}")]
    NoMatchingSequence(Topic),

    /// A pairing already exists for the topic.
    #[error("pairing for topic {0} already exists")]
    TopicExists(Topic),

    /// A response arrived for a request id this engine never sent.
    #[error("response for unknown request id {0}")]
    UnknownRequest(u64),

    /// The system random source failed.
    #[error("random source failure")]
    Rng,
}

impl CoreError {
    /// Whether this error is expected noise from untrusted relay traffic.
    ///
    /// Noise is logged at debug and dropped; anything else is an anomaly
    /// worth a warning.
    pub fn is_traffic_noise(&self) -> bool {
        matches!(
            self,
            CoreError::NoMatchingSequence(_)
                | CoreError::UnknownRequest(_)
                | CoreError::Envelope(_)
                | CoreError::Cipher(_)
                | CoreError::Serialization(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
