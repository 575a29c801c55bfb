#![forbid(unsafe_code)]

pub mod types;
pub mod uri;

pub mod jsonrpc;
pub mod params;

#[cfg(test)]
mod proptests;

pub use types::{
    AppMetadata, JsonRpcPermissions, PairingProposal, PairingProposer, PairingSignal,
    PairingState, Participant, ParticipantKey, ProposedPermissions, Reason,
    RelayProtocolOptions, SettledPermissions, Topic,
};
pub use uri::{PairingUri, UriError, PROTOCOL_VERSION, URI_SCHEME};
