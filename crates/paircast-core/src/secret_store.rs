//! Secret storage abstraction.
//!
//! Key material never touches a concrete backend directly: everything goes
//! through the [`SecretStore`] capability so platform keychains, files, or
//! test fakes can be swapped without touching callers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::StoreError;

// ============================================================================
// Store trait
// ============================================================================

/// Opaque byte storage for secrets, keyed by string identifier.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store a secret, replacing any previous value for the identifier.
    async fn put(&self, identifier: &str, secret: &[u8]) -> Result<(), StoreError>;

    /// Fetch a secret. Absence is `Ok(None)`, not an error.
    async fn get(&self, identifier: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove a secret. Removing a missing identifier is a no-op.
    async fn delete(&self, identifier: &str) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Volatile store for tests and short-lived sessions.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored secrets.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn put(&self, identifier: &str, secret: &[u8]) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(identifier.to_string(), secret.to_vec());
        Ok(())
    }

    async fn get(&self, identifier: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(identifier).cloned())
    }

    async fn delete(&self, identifier: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(identifier);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
