use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::error::{StorageError, StorageOperation, UpdateError};
use crate::persist::write_verified;
use crate::traits::KeyValueStore;
use crate::types::{QueuedUpdate, UpdateQueueState, VersionDescriptor};

/// Deduplicated, persisted list of pending updates, newest first.
///
/// Every operation reads the persisted state, changes it and writes it back,
/// so the stored record is the only source of truth.
pub struct UpdateQueue {
    storage: Arc<dyn KeyValueStore>,
    key: String,
    max_retries: u32,
    lock: Mutex<()>,
}

impl UpdateQueue {
    pub fn new(storage: Arc<dyn KeyValueStore>, key: impl Into<String>, max_retries: u32) -> Self {
        Self {
            storage,
            key: key.into(),
            max_retries: max_retries.max(1),
            lock: Mutex::new(()),
        }
    }

    /// Queue `version`, replacing any entry for the same build.
    ///
    /// # Errors
    /// Returns an error when the updated queue cannot be persisted.
    pub async fn enqueue(&self, version: &VersionDescriptor) -> Result<String, UpdateError> {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await;

        state
            .updates
            .retain(|update| update.version.build_id != version.build_id);

        let enqueued_at = Utc::now();
        let mut priority = enqueued_at.timestamp_millis();
        if let Some(newest) = state.updates.iter().map(|update| update.priority).max()
            && priority <= newest
        {
            priority = newest + 1;
        }

        let id = format!("{}-{priority}", version.build_id);
        state.updates.push(QueuedUpdate {
            id: id.clone(),
            version: version.clone(),
            enqueued_at,
            priority,
            retry_count: 0,
        });
        state.updates.sort_by(|a, b| b.priority.cmp(&a.priority));

        self.persist(&state).await?;
        info!("Queued update {id} ({})", version.version);
        Ok(id)
    }

    pub async fn peek_next(&self) -> Option<QueuedUpdate> {
        self.load().await.updates.into_iter().next()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.load().await.updates.iter().any(|update| update.id == id)
    }

    pub async fn len(&self) -> usize {
        self.load().await.updates.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> UpdateQueueState {
        self.load().await
    }

    /// Remove a successfully applied entry.
    pub async fn complete(&self, id: &str) {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await;

        state.updates.retain(|update| update.id != id);
        state.processing = false;
        state.last_processed_at = Some(Utc::now());

        if let Err(error) = self.persist(&state).await {
            warn!("Failed to record completion of {id}, clearing update queue: {error}");
            self.clear().await;
        }
    }

    /// Record a failed application attempt. Returns whether the entry should be
    /// retried; once the retry budget is spent the entry is dropped.
    pub async fn fail(&self, id: &str, reason: &str) -> bool {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await;
        state.processing = false;

        let Some(index) = state.updates.iter().position(|update| update.id == id) else {
            warn!("Cannot record failure for unknown update {id}");
            return false;
        };

        let entry = &mut state.updates[index];
        entry.retry_count += 1;
        let retry_count = entry.retry_count;
        let should_retry = retry_count < self.max_retries;
        if should_retry {
            debug!("Update {id} failed (attempt {retry_count}): {reason}");
        } else {
            state.updates.remove(index);
            warn!("Dropping update {id} after {retry_count} failed attempt(s): {reason}");
        }

        if let Err(error) = self.persist(&state).await {
            warn!("Failed to record failure of {id}, clearing update queue: {error}");
            self.clear().await;
            return false;
        }
        should_retry
    }

    /// Mark whether an entry is currently being applied.
    pub async fn set_processing(&self, processing: bool) {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await;
        state.processing = processing;
        if let Err(error) = self.persist(&state).await {
            debug!("Failed to persist queue processing flag: {error}");
        }
    }

    /// Best-effort removal of the whole queue record.
    pub async fn clear(&self) {
        if let Err(error) = self.storage.remove(&self.key).await {
            warn!("Failed to remove update queue record: {error}");
            if let Ok(empty) = serde_json::to_string(&UpdateQueueState::default()) {
                let _ = self.storage.set(&self.key, &empty).await;
            }
        }
    }

    async fn load(&self) -> UpdateQueueState {
        match self.storage.get(&self.key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|error| {
                warn!("Discarding unreadable update queue: {error}");
                UpdateQueueState::default()
            }),
            Ok(None) => UpdateQueueState::default(),
            Err(error) => {
                warn!("Failed to read update queue: {error}");
                UpdateQueueState::default()
            }
        }
    }

    async fn persist(&self, state: &UpdateQueueState) -> Result<(), UpdateError> {
        let payload = serde_json::to_string(state).map_err(|e| {
            UpdateError::storage(
                StorageOperation::Write,
                self.key.clone(),
                StorageError::Unavailable(format!("failed to encode update queue: {e}")),
            )
        })?;
        write_verified(self.storage.as_ref(), &self.key, &payload).await
    }
}
