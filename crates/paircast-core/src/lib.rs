//! Paircast core - pairing logic and session establishment.
//!
//! This crate implements:
//! - Key management over a pluggable secret store
//! - Pairing sequence state machines with expiry
//! - A registry of live sequences keyed by topic
//! - The relay-facing engine: proposals, settlement, and control traffic
//! - An in-process relay and harness for end-to-end tests

#![forbid(unsafe_code)]

// Core state machines
pub mod sequence;
pub mod registry;

// Services
pub mod engine;
pub mod key_management;
pub mod relay;

// Infrastructure
pub mod secret_store;
pub mod file_store;

// Supporting modules
pub mod config;
pub mod errors;
pub mod harness;

pub use config::{EngineConfig, ExpiryConfig};
pub use engine::{EngineHandles, PairingEngine, PairingEvent};
pub use errors::CoreError;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
