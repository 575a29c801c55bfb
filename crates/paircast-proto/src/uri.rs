//! Pairing URI codec.
//!
//! A proposal travels out of band as a compact URI:
//!
//! ```text
//! wc:{topic}@{version}?controller={bool}&publicKey={hex}&relay={urlencoded json}
//! ```
//!
//! Parsing is strict: unknown versions, missing or duplicate query
//! parameters, and malformed field values are all rejected with a typed
//! error. Serialization always produces the canonical lowercase form, so
//! `parse(uri.to_string()) == uri` for every valid value.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::types::{
    PairingProposal, PairingProposer, PairingSignal, ParticipantKey, ProposedPermissions,
    RelayProtocolOptions, Topic, TypeError,
};

/// URI scheme for pairing proposals.
pub const URI_SCHEME: &str = "wc";

/// Protocol version this crate speaks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Error parsing a pairing URI.
#[derive(Debug)]
pub enum UriError {
    /// The URI is syntactically broken.
    Malformed { reason: &'static str },
    /// The URI is well-formed but carries a version we do not speak.
    UnsupportedVersion { found: u32 },
    /// The topic or public key failed field validation.
    InvalidField(TypeError),
    /// The relay parameter is not valid JSON for relay options.
    InvalidRelay(serde_json::Error),
}

impl fmt::Display for UriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { reason } => write!(f, "malformed pairing uri: {}", reason),
            Self::UnsupportedVersion { found } => {
                write!(
                    f,
                    "unsupported pairing protocol version {} (expected {})",
                    found, PROTOCOL_VERSION
                )
            }
            Self::InvalidField(err) => write!(f, "malformed pairing uri: {}", err),
            Self::InvalidRelay(err) => {
                write!(f, "malformed pairing uri: relay options: {}", err)
            }
        }
    }
}

impl std::error::Error for UriError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidField(err) => Some(err),
            Self::InvalidRelay(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TypeError> for UriError {
    fn from(err: TypeError) -> Self {
        Self::InvalidField(err)
    }
}

/// Decoded form of a pairing URI.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingUri {
    pub topic: Topic,
    pub version: u32,
    pub public_key: ParticipantKey,
    pub controller: bool,
    pub relay: RelayProtocolOptions,
}

impl PairingUri {
    /// Build a version-2 URI for a freshly proposed pairing.
    pub fn new(
        topic: Topic,
        public_key: ParticipantKey,
        controller: bool,
        relay: RelayProtocolOptions,
    ) -> Self {
        Self {
            topic,
            version: PROTOCOL_VERSION,
            public_key,
            controller,
            relay,
        }
    }

    /// Parse a pairing URI string.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let url = Url::parse(input).map_err(|_| UriError::Malformed {
            reason: "not a valid uri",
        })?;
        if url.scheme() != URI_SCHEME {
            return Err(UriError::Malformed {
                reason: "scheme must be wc",
            });
        }
        if url.has_host() {
            return Err(UriError::Malformed {
                reason: "unexpected authority component",
            });
        }

        let path = url.path();
        let (topic_str, version_str) = path.rsplit_once('@').ok_or(UriError::Malformed {
            reason: "missing version separator",
        })?;
        let topic = Topic::from_hex(topic_str)?;
        let version: u32 = version_str.parse().map_err(|_| UriError::Malformed {
            reason: "invalid version number",
        })?;
        if version != PROTOCOL_VERSION {
            return Err(UriError::UnsupportedVersion { found: version });
        }

        let mut controller: Option<&str> = None;
        let mut public_key: Option<String> = None;
        let mut relay: Option<String> = None;
        for (name, value) in url.query_pairs() {
            let slot = match name.as_ref() {
                "controller" => {
                    if controller.is_some() {
                        return Err(UriError::Malformed {
                            reason: "duplicate controller parameter",
                        });
                    }
                    controller = Some(match value.as_ref() {
                        "true" => "true",
                        "false" => "false",
                        _ => {
                            return Err(UriError::Malformed {
                                reason: "controller must be true or false",
                            })
                        }
                    });
                    continue;
                }
                "publicKey" => &mut public_key,
                "relay" => &mut relay,
                // Unknown parameters are ignored for forward compatibility.
                _ => continue,
            };
            if slot.is_some() {
                return Err(UriError::Malformed {
                    reason: "duplicate query parameter",
                });
            }
            *slot = Some(value.into_owned());
        }

        let controller = controller.ok_or(UriError::Malformed {
            reason: "missing controller parameter",
        })? == "true";
        let public_key = public_key.ok_or(UriError::Malformed {
            reason: "missing publicKey parameter",
        })?;
        let relay = relay.ok_or(UriError::Malformed {
            reason: "missing relay parameter",
        })?;

        Ok(Self {
            topic,
            version,
            public_key: ParticipantKey::from_hex(&public_key)?,
            controller,
            relay: serde_json::from_str(&relay).map_err(UriError::InvalidRelay)?,
        })
    }

    /// Materialize the proposal a responder works from after receiving
    /// this URI out of band. Permissions start at the default set; `ttl`
    /// is the pending lifetime in seconds.
    pub fn to_proposal(&self, ttl: u64) -> PairingProposal {
        PairingProposal {
            topic: self.topic.clone(),
            relay: self.relay.clone(),
            proposer: PairingProposer {
                public_key: self.public_key.clone(),
                controller: self.controller,
            },
            signal: PairingSignal::Uri {
                uri: self.to_string(),
            },
            permissions: ProposedPermissions::default(),
            ttl,
        }
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let relay_json = serde_json::to_string(&self.relay).map_err(|_| fmt::Error)?;
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("controller", if self.controller { "true" } else { "false" })
            .append_pair("publicKey", &self.public_key.to_hex())
            .append_pair("relay", &relay_json)
            .finish();
        write!(
            f,
            "{}:{}@{}?{}",
            URI_SCHEME, self.topic, self.version, query
        )
    }
}

impl FromStr for PairingUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
