use serde::{Deserialize, Serialize};
use silent_update_core::UpdaterConfig;
use silent_update_platform::AppPaths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,

    /// Run the updater even when another instance holds the leader lock.
    /// Only useful for single-process test setups.
    #[serde(default)]
    pub skip_leader_election: bool,

    /// How often a passive instance retries the leader lock.
    #[serde(default = "default_leader_retry_ms")]
    pub leader_retry_ms: u64,

    #[serde(default)]
    pub updater: UpdaterConfig,
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_leader_retry_ms() -> u64 {
    5_000
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
            skip_leader_election: false,
            leader_retry_ms: default_leader_retry_ms(),
            updater: UpdaterConfig::default(),
        }
    }
}

impl HostSettings {
    #[must_use]
    pub fn leader_retry_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.leader_retry_ms.max(1))
    }

    /// Missing or unreadable settings fall back to defaults.
    pub fn load(paths: &AppPaths) -> Self {
        let settings_path = paths.settings_file();
        if !settings_path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&settings_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!(
                    "Ignoring unreadable settings at {}: {error}",
                    settings_path.display()
                );
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// # Errors
    /// Returns an error when the config directory or settings file cannot be
    /// written.
    pub fn save(&self, paths: &AppPaths) -> Result<(), std::io::Error> {
        paths.ensure_dirs()?;

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.settings_file(), content)?;
        Ok(())
    }
}
