//! Engine configuration.
//!
//! Lifetimes are plain integer seconds so the config serializes cleanly;
//! [`ExpiryConfig`] offers [`std::time::Duration`] accessors for callers that
//! want them. Environment overrides use the `PAIRCAST_` prefix.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use paircast_proto::types::{AppMetadata, RelayProtocolOptions};

// ============================================================================
// Expiry configuration
// ============================================================================

/// Time-to-live for each stage of a pairing sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryConfig {
    /// Lifetime of a freshly proposed sequence awaiting any response.
    pub proposed_ttl_secs: u64,
    /// Lifetime carried by the proposal itself; bounds how long the peer
    /// may take to settle.
    pub pending_ttl_secs: u64,
    /// Lifetime of a settled pairing.
    pub settled_ttl_secs: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            proposed_ttl_secs: 60 * 60,            // 1 hour
            pending_ttl_secs: 24 * 60 * 60,        // 1 day
            settled_ttl_secs: 30 * 24 * 60 * 60,   // 30 days
        }
    }
}

impl ExpiryConfig {
    /// Build from environment variables, starting from defaults.
    ///
    /// Recognized: `PAIRCAST_TTL_PROPOSED`, `PAIRCAST_TTL_PENDING`,
    /// `PAIRCAST_TTL_SETTLED` (all in seconds).
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("PAIRCAST_TTL_PROPOSED") {
            config.proposed_ttl_secs = v
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid PAIRCAST_TTL_PROPOSED: {}", e))?;
        }
        if let Ok(v) = std::env::var("PAIRCAST_TTL_PENDING") {
            config.pending_ttl_secs = v
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid PAIRCAST_TTL_PENDING: {}", e))?;
        }
        if let Ok(v) = std::env::var("PAIRCAST_TTL_SETTLED") {
            config.settled_ttl_secs = v
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid PAIRCAST_TTL_SETTLED: {}", e))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for nonsense values.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.proposed_ttl_secs == 0 {
            anyhow::bail!("proposed_ttl_secs must be greater than zero");
        }
        if self.pending_ttl_secs == 0 {
            anyhow::bail!("pending_ttl_secs must be greater than zero");
        }
        if self.settled_ttl_secs == 0 {
            anyhow::bail!("settled_ttl_secs must be greater than zero");
        }
        if self.settled_ttl_secs < self.proposed_ttl_secs {
            anyhow::bail!("settled_ttl_secs must not be shorter than proposed_ttl_secs");
        }
        Ok(())
    }

    pub fn proposed(&self) -> Duration {
        Duration::from_secs(self.proposed_ttl_secs)
    }

    pub fn pending(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn settled(&self) -> Duration {
        Duration::from_secs(self.settled_ttl_secs)
    }
}

// ============================================================================
// Engine configuration
// ============================================================================

/// Everything a [`crate::engine::PairingEngine`] needs to know about itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sequence lifetimes.
    pub expiry: ExpiryConfig,
    /// Relay protocol advertised in proposals.
    pub relay: RelayProtocolOptions,
    /// Application metadata shared with peers on settlement, if any.
    pub metadata: Option<AppMetadata>,
    /// Whether this engine claims the controller role when proposing.
    pub controller: bool,
}

impl EngineConfig {
    /// Build from environment variables, starting from defaults.
    ///
    /// Recognized: the `ExpiryConfig` variables plus `PAIRCAST_CONTROLLER`
    /// (`true`/`false`).
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self {
            expiry: ExpiryConfig::from_env()?,
            ..Self::default()
        };

        if let Ok(v) = std::env::var("PAIRCAST_CONTROLLER") {
            config.controller = match v.as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                other => anyhow::bail!("invalid PAIRCAST_CONTROLLER: {}", other),
            };
        }

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.expiry.validate()
    }
}

// ============================================================================
// Tests
// ============================================================================
