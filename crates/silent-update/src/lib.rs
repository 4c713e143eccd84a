//! Host integration for the silent updater.
//!
//! Wires the core orchestrator to the local filesystem: file-backed storage,
//! cache directories, process restart, settings, logging and the per-profile
//! leader lock.

mod cache_dirs;
mod file_store;
mod leader;
mod logging;
mod reload;
mod settings;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use silent_update_core::{
    ActivitySource, CacheLayer, Collaborators, InteractionHub, Orchestrator, ReloadStrategy,
    ReqwestTransport, TransportError,
};
use silent_update_platform::{AppPaths, AppPathsError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use cache_dirs::{DirectoryCacheStorage, LooseEntryLayer};
pub use file_store::FileStore;
pub use leader::{LeaderError, UpdateLeader};
pub use logging::{init_logging, set_logging_enabled};
pub use reload::{RelaunchCommand, RestartExecutable};
pub use settings::HostSettings;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to resolve application paths: {0}")]
    Paths(#[from] AppPathsError),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to claim the updater lock: {0}")]
    Leader(#[source] LeaderError),
    #[error("failed to create HTTP transport: {0}")]
    Transport(#[from] TransportError),
    #[error("no version endpoint configured")]
    MissingEndpoint,
}

/// Result of [`Launcher::launch`].
pub enum Launched {
    /// This process runs the updater.
    Leader(UpdaterHandle),
    /// Another instance runs the updater for this profile. The standby takes
    /// over once that instance releases the leader lock.
    Passive(Standby),
}

/// Passive instance waiting for the leader lock. Dropping it stops waiting.
pub struct Standby {
    cancel: CancellationToken,
    task: Option<JoinHandle<Option<Result<UpdaterHandle, LaunchError>>>>,
}

impl Standby {
    /// Resolves once this instance holds the leader lock and runs the updater.
    /// `None` after [`cancel`](Self::cancel).
    pub async fn promoted(mut self) -> Option<Result<UpdaterHandle, LaunchError>> {
        let task = self.task.take()?;
        match task.await {
            Ok(promotion) => promotion,
            Err(error) => {
                warn!("Leader standby task ended abnormally: {error}");
                None
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Standby {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn wait_for_leadership(
    launcher: Launcher,
    cancel: CancellationToken,
) -> Option<Result<UpdaterHandle, LaunchError>> {
    let interval = launcher.settings.leader_retry_interval();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(interval) => {}
        }
        match UpdateLeader::acquire(&launcher.paths) {
            Ok(leader) => {
                info!("Previous updater instance is gone, taking over");
                return Some(launcher.start(Some(leader)));
            }
            Err(LeaderError::AlreadyRunning) => debug!("Updater lock still held elsewhere"),
            Err(error) => return Some(Err(LaunchError::Leader(error))),
        }
    }
}

/// Running updater owned by the leader process.
pub struct UpdaterHandle {
    orchestrator: Arc<Orchestrator>,
    poller: JoinHandle<()>,
    _leader: Option<UpdateLeader>,
}

impl UpdaterHandle {
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Stop polling and release the leader lock.
    pub async fn shutdown(mut self) {
        self.orchestrator.shutdown();
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.poller)
            .await
            .is_err()
        {
            warn!("Update polling did not stop in time, aborting it");
            self.poller.abort();
        }
    }
}

/// Builds the orchestrator from host settings.
#[derive(Clone)]
pub struct Launcher {
    paths: AppPaths,
    settings: HostSettings,
    hub: Option<Arc<InteractionHub>>,
    reload_strategies: Option<Vec<Arc<dyn ReloadStrategy>>>,
    extra_layers: Vec<Arc<dyn CacheLayer>>,
}

impl Launcher {
    pub fn new(paths: AppPaths, settings: HostSettings) -> Self {
        Self {
            paths,
            settings,
            hub: None,
            reload_strategies: None,
            extra_layers: Vec::new(),
        }
    }

    /// Interaction events emitted on `hub` defer updates while the user is
    /// active.
    #[must_use]
    pub fn with_interaction_hub(mut self, hub: Arc<InteractionHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Replace the default restart strategies.
    #[must_use]
    pub fn with_reload_strategies(mut self, strategies: Vec<Arc<dyn ReloadStrategy>>) -> Self {
        self.reload_strategies = Some(strategies);
        self
    }

    #[must_use]
    pub fn with_cache_layer(mut self, layer: Arc<dyn CacheLayer>) -> Self {
        self.extra_layers.push(layer);
        self
    }

    fn default_reload_strategies(&self) -> Vec<Arc<dyn ReloadStrategy>> {
        let mut strategies = vec![Arc::new(RestartExecutable::new()) as Arc<dyn ReloadStrategy>];
        if let Some(command) = self
            .settings
            .updater
            .relaunch_command
            .as_deref()
            .and_then(RelaunchCommand::from_argv)
        {
            strategies.push(Arc::new(command));
        }
        strategies
    }

    /// Claim the leader lock and start the updater, or stand by when another
    /// instance holds the lock. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns an error when no endpoint is configured, the app directories
    /// cannot be created, or the lock or HTTP client cannot be set up.
    pub fn launch(self) -> Result<Launched, LaunchError> {
        if self.settings.updater.endpoint_urls().is_empty() {
            return Err(LaunchError::MissingEndpoint);
        }
        self.paths.ensure_dirs().map_err(|source| LaunchError::Io {
            context: "failed to create app directories",
            source,
        })?;

        if self.settings.skip_leader_election {
            return self.start(None).map(Launched::Leader);
        }
        match UpdateLeader::acquire(&self.paths) {
            Ok(leader) => self.start(Some(leader)).map(Launched::Leader),
            Err(LeaderError::AlreadyRunning) => {
                info!("Another instance owns the updater, standing by");
                Ok(Launched::Passive(self.stand_by()))
            }
            Err(error) => Err(LaunchError::Leader(error)),
        }
    }

    fn stand_by(self) -> Standby {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(wait_for_leadership(self, cancel.clone()));
        Standby {
            cancel,
            task: Some(task),
        }
    }

    fn start(&self, leader: Option<UpdateLeader>) -> Result<UpdaterHandle, LaunchError> {
        let config = &self.settings.updater;
        let transport = ReqwestTransport::new(
            &format!("silent-update/{}", env!("CARGO_PKG_VERSION")),
            config.http_timeout(),
        )?;

        let reload_strategies = match &self.reload_strategies {
            Some(strategies) => strategies.clone(),
            None => self.default_reload_strategies(),
        };
        let mut cache_layers =
            vec![Arc::new(LooseEntryLayer::new(&self.paths.cache_dir)) as Arc<dyn CacheLayer>];
        cache_layers.extend(self.extra_layers.iter().cloned());

        let collaborators = Collaborators {
            secondary_storage: Some(Arc::new(FileStore::new(
                self.paths.secondary_storage_dir(),
            ))),
            cache_storage: Some(Arc::new(DirectoryCacheStorage::new(&self.paths.cache_dir))),
            cache_layers,
            reload_strategies,
            activity: self
                .hub
                .clone()
                .map(|hub| hub as Arc<dyn ActivitySource>),
            ..Collaborators::new(
                Arc::new(transport),
                Arc::new(FileStore::new(self.paths.storage_dir())),
            )
        };

        let orchestrator = Orchestrator::new(config.clone(), collaborators);
        let poller = orchestrator.start();
        info!("Updater started, polling {}", config.endpoint_urls().join(", "));

        Ok(UpdaterHandle {
            orchestrator,
            poller,
            _leader: leader,
        })
    }
}

/// Load settings for `app_name`, initialize logging and launch the updater.
///
/// # Errors
/// See [`Launcher::launch`].
pub fn launch_for_app(
    app_name: &str,
    hub: Option<Arc<InteractionHub>>,
) -> Result<Launched, LaunchError> {
    let paths = AppPaths::new(app_name)?;
    let settings = HostSettings::load(&paths);
    init_logging(&paths, settings.debug_logging, settings.max_log_size_bytes);

    let mut launcher = Launcher::new(paths, settings);
    if let Some(hub) = hub {
        launcher = launcher.with_interaction_hub(hub);
    }
    launcher.launch()
}
