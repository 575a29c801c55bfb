//! Core wire types shared across the pairing protocol.
//!
//! Topics and participant keys are fixed-size byte strings carried as
//! lowercase hex on the wire. Both are validated at construction so the
//! rest of the stack can treat them as well-formed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Constants for wire field sizes.
pub mod sizes {
    /// Raw length of a relay topic (SHA-256 output).
    pub const TOPIC_SIZE: usize = 32;
    /// Raw length of an X25519 public key.
    pub const X25519_PUB_SIZE: usize = 32;
    /// Hex-encoded length of topics and public keys.
    pub const HEX_LEN: usize = 64;
}

/// Validation error for wire-level fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    /// Field has the wrong encoded length (expected, actual).
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    /// Field is not valid hex.
    InvalidHex { field: &'static str },
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength {
                field,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "field '{}' has invalid length: expected {} hex chars, got {}",
                    field, expected, actual
                )
            }
            Self::InvalidHex { field } => write!(f, "field '{}' is not valid hex", field),
        }
    }
}

impl std::error::Error for TypeError {}

fn decode_hex32(field: &'static str, s: &str) -> Result<[u8; 32], TypeError> {
    if s.len() != sizes::HEX_LEN {
        return Err(TypeError::InvalidLength {
            field,
            expected: sizes::HEX_LEN,
            actual: s.len(),
        });
    }
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out).map_err(|_| TypeError::InvalidHex { field })?;
    Ok(out)
}

// ============================================================================
// Topic
// ============================================================================

/// A relay topic: 32 bytes, hex-encoded on the wire.
///
/// Pending pairings use a random topic; settled pairings use the topic
/// derived from the shared secret. Input hex is accepted in either case,
/// output is always lowercase.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic([u8; sizes::TOPIC_SIZE]);

impl Topic {
    pub fn from_raw(bytes: [u8; sizes::TOPIC_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        decode_hex32("topic", s).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; sizes::TOPIC_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.to_hex())
    }
}

impl TryFrom<String> for Topic {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<Topic> for String {
    fn from(t: Topic) -> Self {
        t.to_hex()
    }
}

// ============================================================================
// Participant keys
// ============================================================================

/// An X25519 public key carried as hex on the wire.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantKey([u8; sizes::X25519_PUB_SIZE]);

impl ParticipantKey {
    pub fn from_raw(bytes: [u8; sizes::X25519_PUB_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        decode_hex32("publicKey", s).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; sizes::X25519_PUB_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ParticipantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ParticipantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipantKey({})", self.to_hex())
    }
}

impl TryFrom<String> for ParticipantKey {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<ParticipantKey> for String {
    fn from(k: ParticipantKey) -> Self {
        k.to_hex()
    }
}

/// One side of a pairing, identified by its public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub public_key: ParticipantKey,
}

// ============================================================================
// Relay options and metadata
// ============================================================================

/// Relay protocol selection carried in proposals and approvals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayProtocolOptions {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<serde_json::Value>,
}

impl Default for RelayProtocolOptions {
    fn default() -> Self {
        Self {
            protocol: "waku".to_string(),
            params: None,
        }
    }
}

/// Application metadata attached to a settled pairing's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub icons: Vec<String>,
}

/// User-facing state of a settled pairing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PairingState {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<AppMetadata>,
}

/// Reason attached to deletes and errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub code: i64,
    pub message: String,
}

// ============================================================================
// Permissions
// ============================================================================

/// JSON-RPC methods a pairing is allowed to carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcPermissions {
    pub methods: Vec<String>,
}

/// Permissions attached to a proposal.
///
/// The default set contains exactly the session-propose method: a freshly
/// settled pairing may carry nothing else until upgraded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedPermissions {
    pub jsonrpc: JsonRpcPermissions,
}

impl Default for ProposedPermissions {
    fn default() -> Self {
        Self {
            jsonrpc: JsonRpcPermissions {
                methods: vec![crate::jsonrpc::methods::SESSION_PROPOSE.to_string()],
            },
        }
    }
}

/// Permissions of a settled pairing, including the controller participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledPermissions {
    pub jsonrpc: JsonRpcPermissions,
    pub controller: Participant,
}

// ============================================================================
// Proposal
// ============================================================================

/// Out-of-band signal delivering the proposal, currently always a URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "camelCase")]
pub enum PairingSignal {
    Uri { uri: String },
}

/// The proposing side of a pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingProposer {
    pub public_key: ParticipantKey,
    /// Whether the proposer claims the controller role.
    pub controller: bool,
}

/// A pairing proposal as materialized from (or encoded into) a pairing URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingProposal {
    pub topic: Topic,
    pub relay: RelayProtocolOptions,
    pub proposer: PairingProposer,
    pub signal: PairingSignal,
    pub permissions: ProposedPermissions,
    /// Pending lifetime in seconds.
    pub ttl: u64,
}
