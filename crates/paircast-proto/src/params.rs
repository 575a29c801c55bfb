//! Control-message payloads carried inside JSON-RPC requests.

use serde::{Deserialize, Serialize};

use crate::types::{PairingState, Participant, ProposedPermissions, Reason, RelayProtocolOptions};

/// Sent by the responder to approve a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalParams {
    pub relay: RelayProtocolOptions,
    pub responder: Participant,
    /// Unix seconds at which the settled pairing expires.
    pub expiry: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<PairingState>,
}

/// Sent by the responder to decline a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectParams {
    pub reason: String,
}

/// Tears a settled pairing down on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteParams {
    pub reason: Reason,
}

/// Replaces the user-facing state of a settled pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateParams {
    pub state: PairingState,
}

/// Extends the permissions of a settled pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeParams {
    pub permissions: ProposedPermissions,
}

/// Liveness probe; carries no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PingParams {}
