use std::sync::Arc;

use log::{info, warn};

use crate::config::StorageKeys;
use crate::error::{StorageError, StorageOperation, UpdateError};
use crate::persist::write_verified;
use crate::traits::KeyValueStore;
use crate::types::VersionDescriptor;

/// Durable record of the last applied version, mirrored to a backup key.
pub struct VersionStore {
    storage: Arc<dyn KeyValueStore>,
    secondary: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
}

impl VersionStore {
    /// `secondary` receives the emergency record when the primary storage
    /// cannot be written. Pass the same store to keep everything in one place.
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        secondary: Arc<dyn KeyValueStore>,
        keys: StorageKeys,
    ) -> Self {
        Self {
            storage,
            secondary,
            keys,
        }
    }

    /// Persist `version` to the primary and backup keys.
    ///
    /// # Errors
    /// Returns an error when the primary copy cannot be written and verified.
    /// A failed backup copy is only logged.
    pub async fn put(&self, version: &VersionDescriptor) -> Result<(), UpdateError> {
        let payload = encode(version, &self.keys.version)?;

        write_verified(self.storage.as_ref(), &self.keys.version, &payload).await?;
        if let Err(error) =
            write_verified(self.storage.as_ref(), &self.keys.version_backup, &payload).await
        {
            warn!("Backup version record not written: {error}");
        }
        Ok(())
    }

    /// Last applied version, or `None` on first run or when both copies are
    /// unusable. A valid backup repairs a missing or corrupt primary.
    pub async fn get(&self) -> Option<VersionDescriptor> {
        if let Some(version) = read_valid(self.storage.as_ref(), &self.keys.version).await {
            return Some(version);
        }

        let backup = read_valid(self.storage.as_ref(), &self.keys.version_backup).await?;
        info!(
            "Restoring primary version record from backup ({})",
            backup.build_id
        );
        match encode(&backup, &self.keys.version) {
            Ok(payload) => {
                if let Err(error) =
                    write_verified(self.storage.as_ref(), &self.keys.version, &payload).await
                {
                    warn!("Primary version record could not be repaired: {error}");
                }
            }
            Err(error) => warn!("{error}"),
        }
        Some(backup)
    }

    /// Single-copy write to the emergency key on the secondary store.
    ///
    /// # Errors
    /// Returns an error when the emergency record cannot be written and
    /// verified.
    pub async fn put_emergency(&self, version: &VersionDescriptor) -> Result<(), UpdateError> {
        let payload = encode(version, &self.keys.emergency)?;
        write_verified(self.secondary.as_ref(), &self.keys.emergency, &payload).await
    }

    pub async fn get_emergency(&self) -> Option<VersionDescriptor> {
        read_valid(self.secondary.as_ref(), &self.keys.emergency).await
    }

    /// Drop the emergency record once `version` reached the primary store. If
    /// the record cannot be removed it is overwritten with `version` so it can
    /// never shadow a newer primary record.
    pub async fn retire_emergency(&self, version: &VersionDescriptor) {
        if self.secondary.remove(&self.keys.emergency).await.is_ok() {
            return;
        }
        if let Ok(payload) = encode(version, &self.keys.emergency)
            && let Err(error) = self.secondary.set(&self.keys.emergency, &payload).await
        {
            warn!("Stale emergency version record left in place: {error}");
        }
    }
}

fn encode(version: &VersionDescriptor, key: &str) -> Result<String, UpdateError> {
    serde_json::to_string(version).map_err(|e| {
        UpdateError::storage(
            StorageOperation::Write,
            key,
            StorageError::Unavailable(format!("failed to encode version record: {e}")),
        )
    })
}

async fn read_valid(storage: &dyn KeyValueStore, key: &str) -> Option<VersionDescriptor> {
    match storage.get(key).await {
        Ok(Some(raw)) => match VersionDescriptor::parse(&raw) {
            Ok(version) => Some(version),
            Err(details) => {
                warn!("Discarding corrupt version record {key}: {details}");
                None
            }
        },
        Ok(None) => None,
        Err(error) => {
            warn!("Failed to read version record {key}: {error}");
            None
        }
    }
}
