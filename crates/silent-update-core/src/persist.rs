use std::time::Duration;

use log::debug;

use crate::error::{StorageError, StorageOperation, UpdateError};
use crate::traits::KeyValueStore;

pub(crate) const WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Write `value` under `key` and confirm it by reading it back, retrying with
/// linear backoff.
pub(crate) async fn write_verified(
    storage: &dyn KeyValueStore,
    key: &str,
    value: &str,
) -> Result<(), UpdateError> {
    let mut attempt = 1;
    loop {
        match write_once(storage, key, value).await {
            Ok(()) => return Ok(()),
            Err(error) if attempt < WRITE_ATTEMPTS => {
                debug!("Write of {key} attempt {attempt} failed: {error}");
                tokio::time::sleep(WRITE_BACKOFF_STEP * attempt).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn write_once(storage: &dyn KeyValueStore, key: &str, value: &str) -> Result<(), UpdateError> {
    storage
        .set(key, value)
        .await
        .map_err(|source| UpdateError::storage(StorageOperation::Write, key, source))?;

    match storage.get(key).await {
        Ok(Some(read_back)) if read_back == value => Ok(()),
        Ok(_) => Err(UpdateError::storage(
            StorageOperation::Verify,
            key,
            StorageError::VerifyMismatch,
        )),
        Err(source) => Err(UpdateError::storage(StorageOperation::Read, key, source)),
    }
}
