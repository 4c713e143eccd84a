use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, info, warn};

use crate::error::CacheError;
use crate::traits::{CacheLayer, CacheStorage, KeyValueStore};

const NAMED_CACHES: &str = "named-caches";
const EMERGENCY: &str = "emergency";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerOutcome {
    pub layer: &'static str,
    pub cleared: usize,
    pub error: Option<CacheError>,
}

impl LayerOutcome {
    fn from_result(layer: &'static str, result: Result<usize, CacheError>) -> Self {
        match result {
            Ok(cleared) => Self {
                layer,
                cleared,
                error: None,
            },
            Err(error) => Self {
                layer,
                cleared: 0,
                error: Some(error),
            },
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// At least one layer (or the emergency path) cleared without error.
    pub success: bool,
    /// The emergency path had to run.
    pub degraded: bool,
    pub layers: Vec<LayerOutcome>,
    pub errors: Vec<CacheError>,
}

impl InvalidationReport {
    fn record(&mut self, outcome: LayerOutcome) {
        if let Some(error) = &outcome.error {
            warn!("Cache layer {} failed: {error}", outcome.layer);
            self.errors.push(error.clone());
        } else {
            debug!("Cache layer {} cleared {} entries", outcome.layer, outcome.cleared);
        }
        self.layers.push(outcome);
    }

    #[must_use]
    pub fn cleared(&self) -> usize {
        self.layers.iter().map(|outcome| outcome.cleared).sum()
    }
}

/// Clears every cache layer ahead of a reload. A failing layer never stops
/// the others.
pub struct CacheInvalidator {
    storage: Option<Arc<dyn CacheStorage>>,
    layers: Vec<Arc<dyn CacheLayer>>,
    known_names: Vec<String>,
}

impl CacheInvalidator {
    pub fn new(
        storage: Option<Arc<dyn CacheStorage>>,
        layers: Vec<Arc<dyn CacheLayer>>,
        known_names: Vec<String>,
    ) -> Self {
        Self {
            storage,
            layers,
            known_names,
        }
    }

    /// Clear named caches and all other layers concurrently. `extra_names`
    /// joins the configured cache names on the emergency path.
    pub async fn clear_all(&self, extra_names: &[String]) -> InvalidationReport {
        let layer_clears = join_all(
            self.layers
                .iter()
                .map(|layer| async move { (layer.name(), layer.clear().await) }),
        );
        let (named, layer_results) = tokio::join!(self.clear_named(), layer_clears);

        let mut report = InvalidationReport::default();
        if let Some(outcome) = named {
            report.record(outcome);
        }
        for (layer, result) in layer_results {
            report.record(LayerOutcome::from_result(layer, result));
        }

        report.success =
            report.layers.is_empty() || report.layers.iter().any(LayerOutcome::succeeded);
        if !report.success {
            self.emergency_clear(extra_names, &mut report).await;
        }

        info!(
            "Cache invalidation finished: success={} degraded={} cleared={}",
            report.success,
            report.degraded,
            report.cleared()
        );
        report
    }

    async fn clear_named(&self) -> Option<LayerOutcome> {
        let storage = self.storage.as_ref()?;
        let result = match storage.cache_names().await {
            Ok(names) => delete_named(storage.as_ref(), &names).await,
            Err(error) => Err(error),
        };
        Some(LayerOutcome::from_result(NAMED_CACHES, result))
    }

    async fn emergency_clear(&self, extra_names: &[String], report: &mut InvalidationReport) {
        report.degraded = true;
        let Some(storage) = &self.storage else {
            warn!("No cache storage available for emergency invalidation");
            return;
        };

        let mut names = self.known_names.clone();
        for name in extra_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        warn!("Primary cache invalidation failed, deleting {} known caches", names.len());

        let results = join_all(names.iter().map(|name| storage.delete_cache(name))).await;
        let mut cleared = 0;
        let mut last_error = None;
        let mut any_ok = false;
        for result in results {
            match result {
                Ok(existed) => {
                    any_ok = true;
                    cleared += usize::from(existed);
                }
                Err(error) => last_error = Some(error),
            }
        }

        report.success = any_ok;
        let outcome = if any_ok || last_error.is_none() {
            LayerOutcome::from_result(EMERGENCY, Ok(cleared))
        } else {
            LayerOutcome {
                layer: EMERGENCY,
                cleared,
                error: last_error,
            }
        };
        report.record(outcome);
    }
}

async fn delete_named(storage: &dyn CacheStorage, names: &[String]) -> Result<usize, CacheError> {
    let results = join_all(names.iter().map(|name| storage.delete_cache(name))).await;
    let mut cleared = 0;
    let mut last_error = None;
    for result in results {
        match result {
            Ok(existed) => cleared += usize::from(existed),
            Err(error) => last_error = Some(error),
        }
    }
    match last_error {
        Some(error) => Err(error),
        None => Ok(cleared),
    }
}

/// Removes application-owned keys from the durable store.
pub struct StoragePurgeLayer {
    storage: Arc<dyn KeyValueStore>,
    keys: Vec<String>,
}

impl StoragePurgeLayer {
    pub fn new(storage: Arc<dyn KeyValueStore>, keys: Vec<String>) -> Self {
        Self { storage, keys }
    }
}

#[async_trait]
impl CacheLayer for StoragePurgeLayer {
    fn name(&self) -> &'static str {
        "app-storage"
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        let mut failures = Vec::new();
        for key in &self.keys {
            match self.storage.remove(key).await {
                Ok(()) => removed += 1,
                Err(error) => failures.push(format!("{key}: {error}")),
            }
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(CacheError::new(
                "Purge application storage",
                failures.join("; "),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{CacheInvalidator, StoragePurgeLayer};
    use crate::error::CacheError;
    use crate::memory::MemoryStore;
    use crate::traits::{CacheLayer, CacheStorage, KeyValueStore};

    struct FakeCaches {
        names: Mutex<BTreeSet<String>>,
        enumerate_fails: bool,
    }

    impl FakeCaches {
        fn with(names: &[&str], enumerate_fails: bool) -> Self {
            Self {
                names: Mutex::new(names.iter().map(|name| (*name).to_string()).collect()),
                enumerate_fails,
            }
        }

        fn remaining(&self) -> Vec<String> {
            self.names.lock().expect("lock").iter().cloned().collect()
        }
    }

    #[async_trait]
    impl CacheStorage for FakeCaches {
        async fn cache_names(&self) -> Result<Vec<String>, CacheError> {
            if self.enumerate_fails {
                return Err(CacheError::new("List caches", "storage unavailable"));
            }
            Ok(self.remaining())
        }

        async fn delete_cache(&self, name: &str) -> Result<bool, CacheError> {
            Ok(self.names.lock().expect("lock").remove(name))
        }
    }

    struct FixedLayer {
        name: &'static str,
        result: Result<usize, CacheError>,
    }

    #[async_trait]
    impl CacheLayer for FixedLayer {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn clear(&self) -> Result<usize, CacheError> {
            self.result.clone()
        }
    }

    fn failing_layer(name: &'static str) -> Arc<dyn CacheLayer> {
        Arc::new(FixedLayer {
            name,
            result: Err(CacheError::new("Clear layer", "boom")),
        })
    }

    #[tokio::test]
    async fn failing_layer_does_not_stop_others() {
        let caches = Arc::new(FakeCaches::with(&["app-b1", "images"], false));
        let invalidator = CacheInvalidator::new(
            Some(caches.clone()),
            vec![
                failing_layer("http"),
                Arc::new(FixedLayer {
                    name: "loose",
                    result: Ok(4),
                }),
            ],
            Vec::new(),
        );

        let report = invalidator.clear_all(&[]).await;

        assert!(report.success);
        assert!(!report.degraded);
        assert_eq!(report.layers.len(), 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.cleared(), 6);
        assert!(caches.remaining().is_empty());
    }

    #[tokio::test]
    async fn total_failure_runs_emergency_path_with_extra_names() {
        let caches = Arc::new(FakeCaches::with(&["app-b1", "app-b2", "unrelated"], true));
        let invalidator = CacheInvalidator::new(
            Some(caches.clone()),
            vec![failing_layer("http")],
            vec!["app-b1".to_string()],
        );

        let report = invalidator.clear_all(&["app-b2".to_string()]).await;

        assert!(report.success);
        assert!(report.degraded);
        assert_eq!(caches.remaining(), vec!["unrelated".to_string()]);
        assert_eq!(report.errors.len(), 2);
    }

    #[tokio::test]
    async fn emergency_without_cache_storage_reports_failure() {
        let invalidator = CacheInvalidator::new(None, vec![failing_layer("http")], Vec::new());

        let report = invalidator.clear_all(&[]).await;

        assert!(!report.success);
        assert!(report.degraded);
    }

    #[tokio::test]
    async fn nothing_configured_is_a_trivial_success() {
        let report = CacheInvalidator::new(None, Vec::new(), Vec::new())
            .clear_all(&[])
            .await;

        assert!(report.success);
        assert!(!report.degraded);
    }

    #[tokio::test]
    async fn purge_layer_removes_only_listed_keys() {
        let storage = Arc::new(MemoryStore::new());
        storage.insert_raw("app.session", "s");
        storage.insert_raw("app.drafts", "d");
        storage.insert_raw("silent-update.version", "v");
        let layer = StoragePurgeLayer::new(
            storage.clone(),
            vec!["app.session".to_string(), "app.drafts".to_string()],
        );

        assert_eq!(layer.clear().await.expect("purge should succeed"), 2);
        assert!(storage.get("app.session").await.expect("read").is_none());
        assert_eq!(storage.raw("silent-update.version"), Some("v".to_string()));
    }
}
