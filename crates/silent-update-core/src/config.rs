use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default)]
    pub version_url: String,

    #[serde(default)]
    pub fallback_urls: Vec<String>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,

    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,

    #[serde(default = "default_true")]
    pub activity_aware: bool,

    #[serde(default = "default_inactivity_threshold")]
    pub inactivity_threshold_ms: u64,

    #[serde(default = "default_immediate_apply_delay")]
    pub immediate_apply_delay_ms: u64,

    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,

    #[serde(default)]
    pub storage_keys: StorageKeys,

    #[serde(default)]
    pub known_cache_names: Vec<String>,

    #[serde(default)]
    pub purge_storage_keys: Vec<String>,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default)]
    pub relaunch_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageKeys {
    #[serde(default = "default_version_key")]
    pub version: String,

    #[serde(default = "default_version_backup_key")]
    pub version_backup: String,

    #[serde(default = "default_queue_key")]
    pub queue: String,

    #[serde(default = "default_emergency_key")]
    pub emergency: String,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    300
}

fn default_max_fetch_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_backoff_cap() -> u64 {
    30_000
}

fn default_jitter() -> u64 {
    1_000
}

fn default_max_update_retries() -> u32 {
    3
}

fn default_inactivity_threshold() -> u64 {
    30_000
}

fn default_immediate_apply_delay() -> u64 {
    1_000
}

fn default_max_wait() -> u64 {
    60_000
}

fn default_http_timeout() -> u64 {
    30
}

fn default_version_key() -> String {
    "silent-update.version".to_string()
}

fn default_version_backup_key() -> String {
    "silent-update.version.backup".to_string()
}

fn default_queue_key() -> String {
    "silent-update.queue".to_string()
}

fn default_emergency_key() -> String {
    "silent-update.version.emergency".to_string()
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            version: default_version_key(),
            version_backup: default_version_backup_key(),
            queue: default_queue_key(),
            emergency: default_emergency_key(),
        }
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            version_url: String::new(),
            fallback_urls: Vec::new(),
            poll_interval_secs: default_poll_interval(),
            max_fetch_attempts: default_max_fetch_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            jitter_ms: default_jitter(),
            max_update_retries: default_max_update_retries(),
            activity_aware: true,
            inactivity_threshold_ms: default_inactivity_threshold(),
            immediate_apply_delay_ms: default_immediate_apply_delay(),
            max_wait_ms: default_max_wait(),
            storage_keys: StorageKeys::default(),
            known_cache_names: Vec::new(),
            purge_storage_keys: Vec::new(),
            http_timeout_secs: default_http_timeout(),
            relaunch_command: None,
        }
    }
}

impl UpdaterConfig {
    /// Convenience constructor for a config polling a single endpoint.
    pub fn for_url(version_url: impl Into<String>) -> Self {
        Self {
            version_url: version_url.into(),
            ..Self::default()
        }
    }

    /// Primary URL followed by fallbacks, blanks removed.
    #[must_use]
    pub fn endpoint_urls(&self) -> Vec<String> {
        std::iter::once(&self.version_url)
            .chain(&self.fallback_urls)
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    #[must_use]
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.inactivity_threshold_ms)
    }

    #[must_use]
    pub fn immediate_apply_delay(&self) -> Duration {
        Duration::from_millis(self.immediate_apply_delay_ms)
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
