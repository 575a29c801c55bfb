//! JSON-RPC 2.0 framing for relay traffic.
//!
//! Every payload published to a topic is either a request or a response.
//! Request ids are derived from the wall clock plus a random salt and stay
//! below 2^53 so peers treating ids as IEEE doubles keep them exact.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method names carried over pairing topics.
pub mod methods {
    pub const PAIRING_APPROVE: &str = "wc_pairingApprove";
    pub const PAIRING_REJECT: &str = "wc_pairingReject";
    pub const PAIRING_UPDATE: &str = "wc_pairingUpdate";
    pub const PAIRING_UPGRADE: &str = "wc_pairingUpgrade";
    pub const PAIRING_DELETE: &str = "wc_pairingDelete";
    pub const PAIRING_PING: &str = "wc_pairingPing";
    pub const SESSION_PROPOSE: &str = "wc_sessionPropose";
}

/// Generate a request id: unix milliseconds scaled by 1000 plus a random
/// three-digit salt. Falls back to a clock-derived salt if the system RNG
/// is unavailable.
pub fn next_request_id() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let millis = now.as_millis() as u64;
    let mut buf = [0u8; 2];
    let salt = match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from(u16::from_le_bytes(buf)) % 1000,
        Err(_) => u64::from(now.subsec_nanos()) % 1000,
    };
    millis * 1000 + salt
}

/// A JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: next_request_id(),
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Error object carried in a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

/// A JSON-RPC response, either a result or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Inbound payload: a request or a response.
///
/// Variant order matters for untagged deserialization: requests carry a
/// `method` field that responses lack, so `Request` must be tried first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Request(Request),
    Response(Response),
}
