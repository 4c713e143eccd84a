use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityMonitor;
use crate::backoff::Backoff;
use crate::cache::{CacheInvalidator, InvalidationReport, StoragePurgeLayer};
use crate::config::UpdaterConfig;
use crate::error::UpdateError;
use crate::fetcher::VersionFetcher;
use crate::queue::UpdateQueue;
use crate::reload::reload_with_fallbacks;
use crate::scheduler::{ScheduledApply, UpdateScheduler};
use crate::store::VersionStore;
use crate::traits::{
    ActivitySource, CacheLayer, CacheStorage, HttpTransport, KeyValueStore, ReloadStrategy,
};
use crate::transition::{VersionTransition, classify};
use crate::types::{QueuedUpdate, UpdatePhase, UpdateState, VersionDescriptor};

/// Host-provided primitives the orchestrator drives.
pub struct Collaborators {
    pub transport: Arc<dyn HttpTransport>,
    pub storage: Arc<dyn KeyValueStore>,
    /// Receives the emergency version record. Defaults to `storage`.
    pub secondary_storage: Option<Arc<dyn KeyValueStore>>,
    pub cache_storage: Option<Arc<dyn CacheStorage>>,
    pub cache_layers: Vec<Arc<dyn CacheLayer>>,
    /// Tried in order; the first success wins.
    pub reload_strategies: Vec<Arc<dyn ReloadStrategy>>,
    pub activity: Option<Arc<dyn ActivitySource>>,
}

impl Collaborators {
    pub fn new(transport: Arc<dyn HttpTransport>, storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            transport,
            storage,
            secondary_storage: None,
            cache_storage: None,
            cache_layers: Vec::new(),
            reload_strategies: Vec::new(),
            activity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    UpToDate,
    UpdateQueued {
        id: String,
        version: VersionDescriptor,
    },
    /// The deployed build is already waiting in the queue.
    AlreadyQueued,
    /// The deployed build already exhausted its retries this session.
    PreviouslyAbandoned,
    /// Another check or an apply is running.
    Busy,
    /// A reload failed earlier; the host must be restarted by the user.
    Halted,
}

/// Where the applied version record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistTier {
    Durable,
    Secondary,
    InMemory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Completed {
        version: VersionDescriptor,
        persisted: PersistTier,
        reload_strategy: &'static str,
        cache: InvalidationReport,
    },
    NothingPending,
    AlreadyApplying,
    RetryScheduled {
        retry_count: u32,
        delay: Duration,
    },
    /// The server went back to the running build; the queued update was
    /// dropped.
    RolledBack,
    Halted,
}

struct FlightGuard<'a> {
    slot: &'a Mutex<Option<String>>,
}

impl<'a> FlightGuard<'a> {
    fn acquire(slot: &'a Mutex<Option<String>>, id: &str) -> Option<Self> {
        let mut current = lock(slot);
        if let Some(active) = current.as_deref() {
            debug!("Update {active} already applying, ignoring trigger for {id}");
            return None;
        }
        *current = Some(id.to_string());
        Some(Self { slot })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives version checks, deferred application and reloads.
///
/// ```text
/// idle -> checking -> idle | update-available
/// update-available -> applying -> completed | failed
/// applying -> update-available   (recoverable failure, retry armed)
/// ```
pub struct Orchestrator {
    config: UpdaterConfig,
    fetcher: VersionFetcher,
    store: VersionStore,
    queue: UpdateQueue,
    monitor: Option<Arc<ActivityMonitor>>,
    scheduler: UpdateScheduler,
    invalidator: CacheInvalidator,
    reloaders: Vec<Arc<dyn ReloadStrategy>>,
    backoff: Backoff,
    state: watch::Sender<UpdateState>,
    check_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<Option<String>>,
    memory_marker: Mutex<Option<VersionDescriptor>>,
    abandoned_build: Mutex<Option<String>>,
    halted: AtomicBool,
    visibility: Arc<Notify>,
    scheduled: Mutex<Option<ScheduledApply>>,
    retry_at: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Wire up every manager. Must be called from within a tokio runtime when
    /// activity awareness is enabled, since the monitor starts its timers here.
    pub fn new(config: UpdaterConfig, collaborators: Collaborators) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let keys = config.storage_keys.clone();
        let storage = collaborators.storage;

        let monitor = config.activity_aware.then(|| {
            Arc::new(ActivityMonitor::start_with_token(
                collaborators.activity.as_deref(),
                config.inactivity_threshold(),
                cancel.child_token(),
            ))
        });
        let scheduler = UpdateScheduler::from_config(monitor.clone(), &config, cancel.child_token());

        let secondary = collaborators
            .secondary_storage
            .unwrap_or_else(|| Arc::clone(&storage));
        let store = VersionStore::new(Arc::clone(&storage), secondary, keys.clone());
        let queue = UpdateQueue::new(
            Arc::clone(&storage),
            keys.queue.clone(),
            config.max_update_retries,
        );

        let own_keys = [&keys.version, &keys.version_backup, &keys.queue, &keys.emergency];
        let purge_keys: Vec<String> = config
            .purge_storage_keys
            .iter()
            .filter(|key| !own_keys.contains(key))
            .cloned()
            .collect();
        let mut layers = collaborators.cache_layers;
        if !purge_keys.is_empty() {
            layers.push(Arc::new(StoragePurgeLayer::new(Arc::clone(&storage), purge_keys)));
        }
        let invalidator = CacheInvalidator::new(
            collaborators.cache_storage,
            layers,
            config.known_cache_names.clone(),
        );

        let (state, _) = watch::channel(UpdateState::default());

        Arc::new(Self {
            fetcher: VersionFetcher::from_config(collaborators.transport, &config),
            backoff: Backoff::from_config(&config),
            config,
            store,
            queue,
            monitor,
            scheduler,
            invalidator,
            reloaders: collaborators.reload_strategies,
            state,
            check_lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
            memory_marker: Mutex::new(None),
            abandoned_build: Mutex::new(None),
            halted: AtomicBool::new(false),
            visibility: Arc::new(Notify::new()),
            scheduled: Mutex::new(None),
            retry_at: Mutex::new(None),
            cancel,
        })
    }

    /// Resume any update left by a previous session, run a fresh check, then
    /// poll until [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let visibility = Arc::clone(&self.visibility);
        let poll_interval = self.config.poll_interval();

        tokio::spawn(async move {
            if let Some(this) = weak.upgrade() {
                this.resume_pending().await;
                if let Err(error) = this.check_now().await {
                    warn!("Initial update check failed: {error}");
                }
            }

            let mut ticker =
                tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => debug!("Polling for a new version"),
                    () = visibility.notified() => debug!("Host visible again, checking for a new version"),
                }
                let Some(this) = weak.upgrade() else { break };
                if let Err(error) = this.check_now().await {
                    warn!("Update check failed: {error}");
                }
            }
            debug!("Update polling stopped");
        })
    }

    /// Host regained focus or visibility; triggers a check on the poll task.
    pub fn visibility_restored(&self) {
        self.visibility.notify_one();
    }

    /// Fetch the deployed version and queue it when it differs from the
    /// running one.
    ///
    /// # Errors
    /// Returns the fetch failure, or the storage failure when the update could
    /// not be queued. The running version is unaffected either way.
    pub async fn check_now(self: &Arc<Self>) -> Result<CheckOutcome, UpdateError> {
        if self.halted.load(Ordering::SeqCst) {
            return Ok(CheckOutcome::Halted);
        }
        if lock(&self.in_flight).is_some() {
            return Ok(CheckOutcome::Busy);
        }
        let Ok(_checking) = self.check_lock.try_lock() else {
            return Ok(CheckOutcome::Busy);
        };

        let previous_phase = self.state.borrow().phase;
        self.update_state(|state| {
            state.phase = UpdatePhase::Checking;
            state.last_check_at = Some(Utc::now());
        });

        let fetched = match self.fetcher.fetch().await {
            Ok(fetched) => fetched,
            Err(error) => {
                self.update_state(|state| {
                    state.phase = previous_phase;
                    state.error = Some(error.clone());
                });
                return Err(error);
            }
        };

        let current = self.current_version().await;
        if current.as_ref().is_some_and(|current| current.same_build(&fetched)) {
            if !self.queue.is_empty().await {
                debug!("Running build is current, dropping stale queued updates");
                self.scheduler.cancel();
                self.queue.clear().await;
            }
            self.update_state(|state| {
                state.phase = UpdatePhase::Idle;
                state.pending_version = None;
                state.scheduled_at = None;
                state.error = None;
                state.retry_count = 0;
            });
            return Ok(CheckOutcome::UpToDate);
        }

        if lock(&self.abandoned_build).as_deref() == Some(fetched.build_id.as_str()) {
            debug!("Build {} was abandoned earlier, not retrying", fetched.build_id);
            self.update_state(|state| state.phase = UpdatePhase::Failed);
            return Ok(CheckOutcome::PreviouslyAbandoned);
        }

        if let Some(pending) = self.queue.peek_next().await
            && pending.version.same_build(&fetched)
        {
            self.update_state(|state| {
                state.phase = UpdatePhase::UpdateAvailable;
                state.pending_version = Some(pending.version.clone());
                state.retry_count = pending.retry_count;
            });
            if self.retry_pending() {
                debug!("Retry of {} still backing off", pending.id);
            } else {
                self.arm_apply();
            }
            return Ok(CheckOutcome::AlreadyQueued);
        }

        log_transition(current.as_ref(), &fetched);
        let id = match self.queue.enqueue(&fetched).await {
            Ok(id) => id,
            Err(error) => {
                self.update_state(|state| {
                    state.phase = UpdatePhase::Failed;
                    state.error = Some(error.clone());
                });
                return Err(error);
            }
        };

        self.update_state(|state| {
            state.phase = UpdatePhase::UpdateAvailable;
            state.pending_version = Some(fetched.clone());
            state.error = None;
            state.retry_count = 0;
        });
        self.arm_apply();

        Ok(CheckOutcome::UpdateQueued {
            id,
            version: fetched,
        })
    }

    /// Apply the newest queued update now, regardless of user activity.
    ///
    /// # Errors
    /// Returns the terminal failure when the update was abandoned or the
    /// reload could not be triggered.
    pub async fn apply_next(self: &Arc<Self>) -> Result<ApplyOutcome, UpdateError> {
        if self.halted.load(Ordering::SeqCst) {
            return Ok(ApplyOutcome::Halted);
        }
        let Some(entry) = self.queue.peek_next().await else {
            return Ok(ApplyOutcome::NothingPending);
        };
        let Some(_flight) = FlightGuard::acquire(&self.in_flight, &entry.id) else {
            return Ok(ApplyOutcome::AlreadyApplying);
        };
        if !self.queue.contains(&entry.id).await {
            return Ok(ApplyOutcome::NothingPending);
        }

        self.queue.set_processing(true).await;
        self.update_state(|state| {
            state.phase = UpdatePhase::Applying;
            state.pending_version = Some(entry.version.clone());
            state.scheduled_at = None;
            state.retry_count = entry.retry_count;
        });

        match self.apply_entry(&entry).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => self.handle_apply_failure(&entry, error).await,
        }
    }

    async fn apply_entry(&self, entry: &QueuedUpdate) -> Result<ApplyOutcome, UpdateError> {
        let confirmed = self.fetcher.fetch_attempt(entry.retry_count).await?;
        let current = self.current_version().await;

        if current.as_ref().is_some_and(|current| current.same_build(&confirmed)) {
            info!(
                "Deployment of {} was withdrawn, dropping queued update",
                entry.version.build_id
            );
            self.queue.complete(&entry.id).await;
            self.update_state(|state| {
                state.phase = UpdatePhase::Idle;
                state.pending_version = None;
                state.error = None;
                state.retry_count = 0;
            });
            return Ok(ApplyOutcome::RolledBack);
        }

        let target = if confirmed.same_build(&entry.version) {
            entry.version.clone()
        } else {
            info!(
                "Queued build {} superseded by {}",
                entry.version.build_id, confirmed.build_id
            );
            log_transition(current.as_ref(), &confirmed);
            confirmed
        };

        let cache = self
            .invalidator
            .clear_all(std::slice::from_ref(&target.cache_name))
            .await;
        let persisted = self.persist_version(&target).await;
        self.queue.complete(&entry.id).await;

        let reload_strategy = reload_with_fallbacks(&self.reloaders).await?;

        self.update_state(|state| {
            state.phase = UpdatePhase::Completed;
            state.pending_version = None;
            state.error = None;
            state.retry_count = 0;
        });
        info!(
            "Applied version {} ({}) via {reload_strategy}",
            target.version, target.build_id
        );

        Ok(ApplyOutcome::Completed {
            version: target,
            persisted,
            reload_strategy,
            cache,
        })
    }

    async fn handle_apply_failure(
        self: &Arc<Self>,
        entry: &QueuedUpdate,
        failure: UpdateError,
    ) -> Result<ApplyOutcome, UpdateError> {
        if !failure.is_recoverable() {
            if matches!(failure, UpdateError::Reload { .. }) {
                error!("Reload failed, updates halted until the application restarts: {failure}");
                self.halted.store(true, Ordering::SeqCst);
                self.scheduler.cancel();
            } else {
                self.queue.set_processing(false).await;
            }
            self.update_state(|state| {
                state.phase = UpdatePhase::Failed;
                state.error = Some(failure.clone());
            });
            return Err(failure);
        }

        let retry_count = entry.retry_count + 1;
        if self.queue.fail(&entry.id, &failure.to_string()).await {
            let delay = self.backoff.delay(retry_count);
            warn!(
                "Applying {} failed (attempt {retry_count}): {failure}; retrying in {}ms",
                entry.version.build_id,
                delay.as_millis()
            );
            self.update_state(|state| {
                state.phase = UpdatePhase::UpdateAvailable;
                state.error = Some(failure.clone());
                state.retry_count = retry_count;
            });
            self.arm_retry(delay);
            return Ok(ApplyOutcome::RetryScheduled { retry_count, delay });
        }

        let abandoned = UpdateError::UpdateAbandoned {
            build_id: entry.version.build_id.clone(),
            retries: retry_count,
            reason: failure.to_string(),
        };
        error!("{abandoned}");
        *lock(&self.abandoned_build) = Some(entry.version.build_id.clone());
        self.update_state(|state| {
            state.phase = UpdatePhase::Failed;
            state.error = Some(abandoned.clone());
            state.pending_version = None;
            state.retry_count = retry_count;
        });
        Err(abandoned)
    }

    /// Record `version` in the first tier that accepts it.
    async fn persist_version(&self, version: &VersionDescriptor) -> PersistTier {
        match self.store.put(version).await {
            Ok(()) => {
                self.store.retire_emergency(version).await;
                *lock(&self.memory_marker) = None;
                return PersistTier::Durable;
            }
            Err(error) => warn!("Durable version record not written: {error}"),
        }

        let tier = match self.store.put_emergency(version).await {
            Ok(()) => PersistTier::Secondary,
            Err(error) => {
                warn!("Emergency version record not written, keeping it in memory: {error}");
                PersistTier::InMemory
            }
        };
        *lock(&self.memory_marker) = Some(version.clone());
        tier
    }

    async fn current_version(&self) -> Option<VersionDescriptor> {
        let marker = lock(&self.memory_marker).clone();
        if marker.is_some() {
            return marker;
        }
        if let Some(emergency) = self.store.get_emergency().await {
            return Some(emergency);
        }
        self.store.get().await
    }

    async fn resume_pending(self: &Arc<Self>) {
        let Some(entry) = self.queue.peek_next().await else {
            return;
        };
        info!(
            "Resuming update {} left by a previous session (retry {})",
            entry.id, entry.retry_count
        );
        self.update_state(|state| {
            state.phase = UpdatePhase::UpdateAvailable;
            state.pending_version = Some(entry.version.clone());
            state.retry_count = entry.retry_count;
        });
        self.arm_apply();
    }

    fn arm_apply(self: &Arc<Self>) {
        let mut scheduled = lock(&self.scheduled);
        if let Some(existing) = scheduled.as_ref()
            && !existing.is_finished()
        {
            return;
        }

        let weak = Arc::downgrade(self);
        *scheduled = Some(self.scheduler.schedule_apply(move |trigger| async move {
            let Some(this) = weak.upgrade() else { return };
            lock(&this.scheduled).take();
            match this.apply_next().await {
                Ok(outcome) => debug!("Scheduled apply ({trigger:?}) finished: {outcome:?}"),
                Err(error) => warn!("Scheduled apply ({trigger:?}) failed: {error}"),
            }
        }));
        drop(scheduled);

        self.update_state(|state| state.scheduled_at = Some(Utc::now()));
    }

    fn arm_retry(self: &Arc<Self>, delay: Duration) {
        let deadline = Instant::now() + delay;
        *lock(&self.retry_at) = Some(deadline);

        let weak = Arc::downgrade(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => {
                    if let Some(this) = weak.upgrade() {
                        lock(&this.retry_at).take();
                        this.arm_apply();
                    }
                }
            }
        });
    }

    /// A backoff timer owns the next apply of the queued entry.
    fn retry_pending(&self) -> bool {
        lock(&self.retry_at).is_some_and(|deadline| deadline > Instant::now())
    }

    fn update_state(&self, change: impl FnOnce(&mut UpdateState)) {
        self.state.send_modify(|state| {
            let before = state.phase;
            change(state);
            if state.phase != before {
                info!("Update phase {before} -> {}", state.phase);
            }
        });
    }

    #[must_use]
    pub fn state(&self) -> UpdateState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn in_flight_update(&self) -> Option<String> {
        lock(&self.in_flight).clone()
    }

    #[must_use]
    pub fn activity_monitor(&self) -> Option<&Arc<ActivityMonitor>> {
        self.monitor.as_ref()
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop polling and revoke every pending timer. An apply that already
    /// started runs to completion.
    pub fn shutdown(&self) {
        info!("Shutting down update orchestrator");
        self.scheduler.cancel();
        self.cancel.cancel();
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn log_transition(current: Option<&VersionDescriptor>, next: &VersionDescriptor) {
    let transition = classify(current, next);
    let from = current.map_or("none", |current| current.version.as_str());
    if transition == VersionTransition::Rollback {
        warn!(
            "Deployed version {} ({}) is older than running {from}",
            next.version, next.build_id
        );
    } else {
        info!(
            "New build {} detected: {from} -> {} ({transition})",
            next.build_id, next.version
        );
    }
}
