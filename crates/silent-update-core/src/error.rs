use thiserror::Error;

/// Coarse classification used to decide whether a failed version check is
/// worth another attempt.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    #[error("network")]
    Network,
    #[error("timeout")]
    Timeout,
    #[error("server")]
    Server,
    #[error("rate-limited")]
    RateLimited,
    #[error("other")]
    Other,
}

impl ErrorClass {
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Other)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOperation {
    #[error("read")]
    Read,
    #[error("write")]
    Write,
    #[error("verify")]
    Verify,
    #[error("remove")]
    Remove,
}

/// Failure reported by a [`crate::KeyValueStore`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("read-back did not match the written value")]
    VerifyMismatch,

    #[error("IO error ({kind}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        if matches!(
            err.kind(),
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded
        ) {
            return StorageError::QuotaExceeded;
        }
        StorageError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Failure reported by a [`crate::HttpTransport`] before any response arrived.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Network(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{context}: {details}")]
pub struct CacheError {
    pub context: &'static str,
    pub details: String,
}

impl CacheError {
    pub fn new(context: &'static str, details: impl Into<String>) -> Self {
        Self {
            context,
            details: details.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivityError {
    #[error("activity source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{strategy} reload failed: {details}")]
pub struct ReloadError {
    pub strategy: &'static str,
    pub details: String,
}

impl ReloadError {
    pub fn new(strategy: &'static str, details: impl Into<String>) -> Self {
        Self {
            strategy,
            details: details.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("network error while requesting {url}: {details}")]
    Network { url: String, details: String },

    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("server error (HTTP {status}) from {url}")]
    Server { url: String, status: u16 },

    #[error("rate limited (HTTP 429) by {url}")]
    RateLimited { url: String },

    #[error("unexpected HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("malformed version descriptor from {url}: {details}")]
    Parse { url: String, details: String },

    #[error("version check failed after {attempts} attempt(s) ({class}): {last}")]
    RetriesExhausted {
        attempts: u32,
        class: ErrorClass,
        last: Box<UpdateError>,
    },

    #[error("storage {operation} failed for {key}: {source}")]
    Storage {
        operation: StorageOperation,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("update queue error: {0}")]
    Queue(String),

    #[error("update {build_id} dropped after {retries} failed attempt(s): {reason}")]
    UpdateAbandoned {
        build_id: String,
        retries: u32,
        reason: String,
    },

    #[error("reload failed after {attempts} strategy attempt(s): {last}")]
    Reload { attempts: usize, last: ReloadError },

    #[error("invalid updater configuration: {0}")]
    Configuration(String),
}

impl UpdateError {
    pub fn storage(operation: StorageOperation, key: impl Into<String>, source: StorageError) -> Self {
        Self::Storage {
            operation,
            key: key.into(),
            source,
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network { .. } => ErrorClass::Network,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Server { .. } => ErrorClass::Server,
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::RetriesExhausted { class, .. } => *class,
            _ => ErrorClass::Other,
        }
    }

    /// Whether a failure while applying a queued update may be retried later
    /// through the queue's retry budget.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Reload { .. } | Self::UpdateAbandoned { .. } | Self::Configuration(_)
        )
    }
}
