//! File-backed secret store.
//!
//! One file per identifier under a private root directory. Writes go to a
//! temp file first and are renamed into place, so a crash never leaves a
//! half-written secret. Files are created owner-only; reads on unix verify
//! the permission bits and refuse records other users could have read.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::StoreError;
use crate::secret_store::SecretStore;

/// Secrets stored as individual files.
pub struct FileSecretStore {
    root: PathBuf,
    // Serializes writers against each other; reads share.
    guard: RwLock<()>,
}

impl FileSecretStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&root).await?.permissions();
            perms.set_mode(0o700);
            fs::set_permissions(&root, perms).await?;
        }

        Ok(Self {
            root,
            guard: RwLock::new(()),
        })
    }

    // Identifiers may contain path separators; hex keeps filenames flat.
    fn path_for(&self, identifier: &str) -> PathBuf {
        self.root
            .join(format!("{}.secret", hex::encode(identifier.as_bytes())))
    }

    fn redact(identifier: &str) -> String {
        let prefix: String = identifier.chars().take(12).collect();
        if identifier.len() > 12 {
            format!("{}...", prefix)
        } else {
            prefix
        }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn put(&self, identifier: &str, secret: &[u8]) -> Result<(), StoreError> {
        let _guard = self.guard.write().await;
        let path = self.path_for(identifier);
        let tmp = path.with_extension("secret.tmp");

        {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o600);

            let mut file = options.open(&tmp).await?;
            file.write_all(secret).await?;
            file.sync_all().await?;
        }

        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, identifier: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self.guard.read().await;
        let path = self.path_for(identifier);

        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o077 != 0 {
                return Err(StoreError::InsecurePermissions {
                    identifier: Self::redact(identifier),
                });
            }
        }
        #[cfg(not(unix))]
        let _ = metadata;

        Ok(Some(fs::read(&path).await?))
    }

    async fn delete(&self, identifier: &str) -> Result<(), StoreError> {
        let _guard = self.guard.write().await;
        match fs::remove_file(self.path_for(identifier)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(
                    identifier = %Self::redact(identifier),
                    "delete of missing secret ignored"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
