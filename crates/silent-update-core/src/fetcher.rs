use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use rand::Rng;

use crate::backoff::Backoff;
use crate::config::UpdaterConfig;
use crate::error::{TransportError, UpdateError};
use crate::traits::HttpTransport;
use crate::types::VersionDescriptor;

const BASE_TIMEOUT_MS: u64 = 5_000;
const TIMEOUT_STEP_MS: u64 = 2_000;
const MAX_TIMEOUT_MS: u64 = 15_000;

/// Per-attempt request timeout: `min(5000 + attempt * 2000, 15000)` ms.
#[must_use]
pub fn attempt_timeout(attempt: u32) -> Duration {
    let ms = BASE_TIMEOUT_MS.saturating_add(u64::from(attempt).saturating_mul(TIMEOUT_STEP_MS));
    Duration::from_millis(ms.min(MAX_TIMEOUT_MS))
}

/// Shape of the cache-defeating query appended to a version URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBust {
    Timestamp,
    TimestampAndNonce,
    NoCacheFlag,
}

impl CacheBust {
    pub const ALL: [CacheBust; 3] = [
        CacheBust::Timestamp,
        CacheBust::TimestampAndNonce,
        CacheBust::NoCacheFlag,
    ];

    fn query(self, now_ms: i64, nonce: u32) -> String {
        match self {
            Self::Timestamp => format!("t={now_ms}"),
            Self::TimestampAndNonce => format!("v={now_ms}&r={nonce:08x}"),
            Self::NoCacheFlag => format!("_={now_ms}&nocache=1"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointVariant {
    pub base_url: String,
    pub bust: CacheBust,
}

impl EndpointVariant {
    #[must_use]
    pub fn url(&self, now_ms: i64, nonce: u32) -> String {
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        format!("{}{separator}{}", self.base_url, self.bust.query(now_ms, nonce))
    }
}

/// Every cache-bust shape for each base URL, in order.
#[must_use]
pub fn endpoint_variants(base_urls: &[String]) -> Vec<EndpointVariant> {
    base_urls
        .iter()
        .flat_map(|base_url| {
            CacheBust::ALL.into_iter().map(|bust| EndpointVariant {
                base_url: base_url.clone(),
                bust,
            })
        })
        .collect()
}

pub struct VersionFetcher {
    transport: Arc<dyn HttpTransport>,
    variants: Vec<EndpointVariant>,
    max_attempts: u32,
    backoff: Backoff,
}

impl VersionFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        variants: Vec<EndpointVariant>,
        max_attempts: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            transport,
            variants,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(transport: Arc<dyn HttpTransport>, config: &UpdaterConfig) -> Self {
        Self::new(
            transport,
            endpoint_variants(&config.endpoint_urls()),
            config.max_fetch_attempts,
            Backoff::from_config(config),
        )
    }

    /// Fetch the deployed version descriptor, retrying transient failures.
    ///
    /// # Errors
    /// Returns the classified failure as-is when it is not retryable, or
    /// [`UpdateError::RetriesExhausted`] once the attempt budget is spent.
    pub async fn fetch(&self) -> Result<VersionDescriptor, UpdateError> {
        let mut attempt = 0;
        loop {
            let error = match self.fetch_attempt(attempt).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(error) => error,
            };

            let class = error.class();
            let attempts = attempt + 1;
            if !class.is_retryable() {
                return Err(error);
            }
            if attempts >= self.max_attempts {
                return Err(UpdateError::RetriesExhausted {
                    attempts,
                    class,
                    last: Box::new(error),
                });
            }

            let delay = self.backoff.delay_for(attempt, class);
            warn!(
                "Version check attempt {attempts} failed ({class}): {error}; retrying in {}ms",
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run one attempt across every endpoint variant; the first well-formed
    /// descriptor wins.
    ///
    /// # Errors
    /// Returns the error from the last variant tried.
    pub async fn fetch_attempt(&self, attempt: u32) -> Result<VersionDescriptor, UpdateError> {
        let timeout = attempt_timeout(attempt);
        let mut last_error =
            UpdateError::Configuration("no version endpoint configured".to_string());

        for variant in &self.variants {
            let url = variant.url(Utc::now().timestamp_millis(), rand::thread_rng().r#gen());
            match self.request(&url, timeout).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(error) => {
                    debug!("Version endpoint variant {url} failed: {error}");
                    last_error = error;
                }
            }
        }

        Err(last_error)
    }

    async fn request(&self, url: &str, timeout: Duration) -> Result<VersionDescriptor, UpdateError> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let response = match tokio::time::timeout(timeout, self.transport.get(url, timeout)).await {
            Ok(Ok(response)) => response,
            Ok(Err(TransportError::Timeout)) | Err(_) => {
                return Err(UpdateError::Timeout {
                    url: url.to_string(),
                    timeout_ms,
                });
            }
            Ok(Err(TransportError::Network(details))) => {
                return Err(UpdateError::Network {
                    url: url.to_string(),
                    details,
                });
            }
        };

        match response.status {
            200..=299 => VersionDescriptor::parse(&response.body).map_err(|details| {
                UpdateError::Parse {
                    url: url.to_string(),
                    details,
                }
            }),
            429 => Err(UpdateError::RateLimited {
                url: url.to_string(),
            }),
            500..=599 => Err(UpdateError::Server {
                url: url.to_string(),
                status: response.status,
            }),
            status => Err(UpdateError::HttpStatus {
                url: url.to_string(),
                status,
            }),
        }
    }
}
