use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// The four-field record identifying a deployed build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDescriptor {
    pub version: String,
    pub build_id: String,
    pub build_time: String,
    pub cache_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    build_id: Option<String>,
    #[serde(default)]
    build_time: Option<String>,
    #[serde(default)]
    cache_name: Option<String>,
}

impl VersionDescriptor {
    pub fn new(
        version: impl Into<String>,
        build_id: impl Into<String>,
        build_time: impl Into<String>,
        cache_name: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            build_id: build_id.into(),
            build_time: build_time.into(),
            cache_name: cache_name.into(),
        }
    }

    /// Parse and validate a JSON descriptor.
    ///
    /// # Errors
    /// Returns a description of the first problem: invalid JSON, or a field
    /// that is missing or blank.
    pub fn parse(json: &str) -> Result<Self, String> {
        let raw: RawDescriptor =
            serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))?;

        Ok(Self {
            version: required("version", raw.version)?,
            build_id: required("buildId", raw.build_id)?,
            build_time: required("buildTime", raw.build_time)?,
            cache_name: required("cacheName", raw.cache_name)?,
        })
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        [
            &self.version,
            &self.build_id,
            &self.build_time,
            &self.cache_name,
        ]
        .iter()
        .all(|field| !field.trim().is_empty())
    }

    /// Build identity is the only thing that decides whether a deployment is
    /// new.
    #[must_use]
    pub fn same_build(&self, other: &Self) -> bool {
        self.build_id == other.build_id
    }
}

fn required(name: &str, value: Option<String>) -> Result<String, String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        Some(_) => Err(format!("field `{name}` is empty")),
        None => Err(format!("field `{name}` is missing")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedUpdate {
    pub id: String,
    pub version: VersionDescriptor,
    pub enqueued_at: DateTime<Utc>,
    pub priority: i64,
    #[serde(default)]
    pub retry_count: u32,
}

/// Persisted shape of the update queue, newest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateQueueState {
    pub updates: Vec<QueuedUpdate>,
    pub processing: bool,
    pub last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    pub is_active: bool,
    pub last_activity_at: DateTime<Utc>,
    pub inactivity_threshold_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePhase {
    #[default]
    Idle,
    Checking,
    UpdateAvailable,
    Applying,
    Completed,
    Failed,
}

impl std::fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::UpdateAvailable => "update-available",
            Self::Applying => "applying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Orchestrator state as observed by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateState {
    pub phase: UpdatePhase,
    pub last_check_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<UpdateError>,
    pub pending_version: Option<VersionDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::{UpdatePhase, UpdateQueueState, VersionDescriptor};

    #[test]
    fn parse_accepts_complete_descriptor() {
        let descriptor = VersionDescriptor::parse(
            r#"{"version":"2.4.0","buildId":"b2","buildTime":"2026-10-01T12:00:00Z","cacheName":"app-b2"}"#,
        )
        .expect("complete descriptor should parse");

        assert_eq!(descriptor.build_id, "b2");
        assert_eq!(descriptor.cache_name, "app-b2");
        assert!(descriptor.is_valid());
    }

    #[test]
    fn parse_rejects_missing_and_blank_fields() {
        let missing =
            VersionDescriptor::parse(r#"{"version":"1","buildTime":"t","cacheName":"c"}"#)
                .unwrap_err();
        assert_eq!(missing, "field `buildId` is missing");

        let blank = VersionDescriptor::parse(
            r#"{"version":"1","buildId":"b","buildTime":"t","cacheName":"  "}"#,
        )
        .unwrap_err();
        assert_eq!(blank, "field `cacheName` is empty");

        assert!(
            VersionDescriptor::parse("<html>")
                .unwrap_err()
                .starts_with("invalid JSON")
        );
    }

    #[test]
    fn same_build_ignores_other_fields() {
        let a = VersionDescriptor::new("1.0.0", "b1", "t1", "cache-a");
        let b = VersionDescriptor::new("1.0.1", "b1", "t2", "cache-b");
        let c = VersionDescriptor::new("1.0.0", "b2", "t1", "cache-a");

        assert!(a.same_build(&b));
        assert!(!a.same_build(&c));
    }

    #[test]
    fn queue_state_tolerates_missing_fields() {
        let state: UpdateQueueState =
            serde_json::from_str("{}").expect("empty object should deserialize");
        assert!(state.updates.is_empty());
        assert!(!state.processing);
        assert!(state.last_processed_at.is_none());
    }

    #[test]
    fn phase_display_uses_kebab_case() {
        assert_eq!(UpdatePhase::UpdateAvailable.to_string(), "update-available");
        assert_eq!(
            serde_json::to_string(&UpdatePhase::UpdateAvailable).expect("phase serializes"),
            "\"update-available\""
        );
    }
}
