use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::activity::Interaction;
use crate::error::{ActivityError, CacheError, ReloadError, StorageError, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Issues the GET request for the version endpoint.
///
/// Implementations must send no-cache request headers and honor `timeout` as
/// the request deadline.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError>;
}

/// Durable string key-value storage shared by the version store and the
/// update queue.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Named cache stores that can be enumerated and deleted individually.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn cache_names(&self) -> Result<Vec<String>, CacheError>;

    /// Returns whether a cache with that name existed.
    async fn delete_cache(&self, name: &str) -> Result<bool, CacheError>;
}

/// Any other cache layer cleared before a reload.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the number of entries removed.
    async fn clear(&self) -> Result<usize, CacheError>;
}

#[async_trait]
pub trait ReloadStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reload(&self) -> Result<(), ReloadError>;
}

pub trait ActivitySource: Send + Sync {
    /// Attach a listener for user interaction events.
    ///
    /// # Errors
    /// Returns an error when instrumentation cannot be attached.
    fn subscribe(&self) -> Result<broadcast::Receiver<Interaction>, ActivityError>;
}
