use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::ActivityError;
use crate::traits::ActivitySource;
use crate::types::ActivityState;

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const QUARTER_FLOOR: Duration = Duration::from_secs(5);
const HUB_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    Pointer,
    Key,
    Scroll,
    Touch,
}

/// In-process broadcast of user interactions. Hosts call [`emit`] from their
/// input handling and hand the hub to the monitor as its [`ActivitySource`].
///
/// [`emit`]: InteractionHub::emit
pub struct InteractionHub {
    sender: broadcast::Sender<Interaction>,
}

impl InteractionHub {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, kind: Interaction) {
        // no listeners yet is fine
        let _ = self.sender.send(kind);
    }
}

impl Default for InteractionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivitySource for InteractionHub {
    fn subscribe(&self) -> Result<broadcast::Receiver<Interaction>, ActivityError> {
        Ok(self.sender.subscribe())
    }
}

/// Progressively shorter idle thresholds tried while attaching to the
/// interaction source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStrategy {
    Full,
    Halved,
    Quarter,
}

impl InitStrategy {
    pub const ORDER: [InitStrategy; 3] = [Self::Full, Self::Halved, Self::Quarter];

    #[must_use]
    pub fn threshold(self, configured: Duration) -> Duration {
        match self {
            Self::Full => configured,
            Self::Halved => configured / 2,
            Self::Quarter => (configured / 4).max(QUARTER_FLOOR).min(configured),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    Live(InitStrategy),
    /// No live event stream; activity is derived from elapsed time alone.
    Fallback,
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct MonitorState {
    mode: MonitorMode,
    threshold: Duration,
    is_active: bool,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    stream_open: bool,
}

struct Shared {
    state: Mutex<MonitorState>,
    subscribers: Mutex<Vec<(u64, Callback)>>,
    next_subscriber: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<(u64, Callback)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        let mut state = self.state();
        state.is_active = true;
        state.last_activity = Instant::now();
        state.last_activity_at = Utc::now();
    }

    fn check_idle(&self) {
        {
            let mut state = self.state();
            if !state.is_active || state.last_activity.elapsed() < state.threshold {
                return;
            }
            state.is_active = false;
        }

        debug!("User became inactive");
        let callbacks: Vec<Callback> = self
            .subscribers()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    fn check_health(&self) {
        let mut state = self.state();
        if matches!(state.mode, MonitorMode::Live(_)) && !state.stream_open {
            warn!("Interaction stream ended, activity monitor falling back to elapsed time");
            state.mode = MonitorMode::Fallback;
        }
    }
}

/// Tracks whether the user is currently interacting with the host.
pub struct ActivityMonitor {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl ActivityMonitor {
    /// Attach to `source` and start the idle and health timers. Must be called
    /// from within a tokio runtime.
    pub fn start(source: Option<&dyn ActivitySource>, threshold: Duration) -> Self {
        Self::start_with_token(source, threshold, CancellationToken::new())
    }

    pub fn start_with_token(
        source: Option<&dyn ActivitySource>,
        threshold: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let attached = source.and_then(|source| attach(source, threshold));

        let (mode, receiver) = match attached {
            Some((strategy, receiver)) => (MonitorMode::Live(strategy), Some(receiver)),
            None => (MonitorMode::Fallback, None),
        };
        let effective = match mode {
            MonitorMode::Live(strategy) => strategy.threshold(threshold),
            MonitorMode::Fallback => threshold,
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(MonitorState {
                mode,
                threshold: effective,
                is_active: true,
                last_activity: Instant::now(),
                last_activity_at: Utc::now(),
                stream_open: receiver.is_some(),
            }),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
        });

        if let Some(receiver) = receiver {
            tokio::spawn(listen(Arc::clone(&shared), receiver, cancel.clone()));
        }
        tokio::spawn(idle_loop(Arc::clone(&shared), cancel.clone()));
        tokio::spawn(health_loop(Arc::clone(&shared), cancel.clone()));

        info!(
            "Activity monitor started in {mode:?} mode ({}ms threshold)",
            effective.as_millis()
        );
        Self { shared, cancel }
    }

    #[must_use]
    pub fn current(&self) -> ActivityState {
        let state = self.shared.state();
        let is_active = match state.mode {
            MonitorMode::Live(_) => state.is_active,
            MonitorMode::Fallback => state.last_activity.elapsed() < state.threshold,
        };
        ActivityState {
            is_active,
            last_activity_at: state.last_activity_at,
            inactivity_threshold_ms: u64::try_from(state.threshold.as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Feed an interaction directly, bypassing the event source.
    pub fn record_interaction(&self, kind: Interaction) {
        debug!("Recorded {kind:?} interaction");
        self.shared.touch();
    }

    /// Register `callback` to run each time the user crosses the inactivity
    /// threshold. The callback stays registered until the returned handle is
    /// dropped.
    pub fn on_become_inactive<F>(&self, callback: F) -> InactivitySubscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers().push((id, Arc::new(callback)));
        InactivitySubscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    #[must_use]
    pub fn mode(&self) -> MonitorMode {
        self.shared.state().mode
    }

    #[must_use]
    pub fn threshold(&self) -> Duration {
        self.shared.state().threshold
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self.mode(), MonitorMode::Live(_)) && !self.cancel.is_cancelled()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct InactivitySubscription {
    shared: Weak<Shared>,
    id: u64,
}

impl InactivitySubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for InactivitySubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers().retain(|(id, _)| *id != self.id);
        }
    }
}

fn attach(
    source: &dyn ActivitySource,
    threshold: Duration,
) -> Option<(InitStrategy, broadcast::Receiver<Interaction>)> {
    for strategy in InitStrategy::ORDER {
        match source.subscribe() {
            Ok(receiver) => return Some((strategy, receiver)),
            Err(error) => warn!(
                "Activity monitor {strategy:?} strategy ({}ms) failed to attach: {error}",
                strategy.threshold(threshold).as_millis()
            ),
        }
    }
    None
}

async fn listen(
    shared: Arc<Shared>,
    mut receiver: broadcast::Receiver<Interaction>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = receiver.recv() => match received {
                Ok(_) | Err(RecvError::Lagged(_)) => shared.touch(),
                Err(RecvError::Closed) => {
                    debug!("Interaction source closed");
                    shared.state().stream_open = false;
                    break;
                }
            },
        }
    }
}

async fn idle_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => shared.check_idle(),
        }
    }
}

async fn health_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + HEALTH_CHECK_INTERVAL,
        HEALTH_CHECK_INTERVAL,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => shared.check_health(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::{ActivityMonitor, InitStrategy, Interaction, InteractionHub, MonitorMode};
    use crate::error::ActivityError;
    use crate::traits::ActivitySource;

    const THRESHOLD: Duration = Duration::from_secs(30);

    /// Refuses the first `failures` subscriptions.
    struct FlakySource {
        hub: InteractionHub,
        failures: AtomicUsize,
    }

    impl ActivitySource for FlakySource {
        fn subscribe(&self) -> Result<broadcast::Receiver<Interaction>, ActivityError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ActivityError::Unavailable("listener refused".to_string()));
            }
            self.hub.subscribe()
        }
    }

    fn flaky(failures: usize) -> FlakySource {
        FlakySource {
            hub: InteractionHub::new(),
            failures: AtomicUsize::new(failures),
        }
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn strategy_thresholds_shrink_with_floor() {
        assert_eq!(InitStrategy::Full.threshold(THRESHOLD), THRESHOLD);
        assert_eq!(
            InitStrategy::Halved.threshold(THRESHOLD),
            Duration::from_secs(15)
        );
        assert_eq!(
            InitStrategy::Quarter.threshold(THRESHOLD),
            Duration::from_millis(7_500)
        );
        assert_eq!(
            InitStrategy::Quarter.threshold(Duration::from_secs(12)),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_inactive_after_threshold_and_notifies() {
        let hub = InteractionHub::new();
        let monitor = ActivityMonitor::start(Some(&hub), THRESHOLD);
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let _subscription = monitor.on_become_inactive(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(monitor.current().is_active);
        tokio::time::sleep(Duration::from_secs(20)).await;
        hub.emit(Interaction::Key);
        settle().await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(monitor.current().is_active);
        assert_eq!(notified.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!monitor.current().is_active);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_subscription_is_not_called() {
        let hub = InteractionHub::new();
        let monitor = ActivityMonitor::start(Some(&hub), THRESHOLD);
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let subscription = monitor.on_become_inactive(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        subscription.unsubscribe();
        tokio::time::sleep(Duration::from_secs(32)).await;

        assert!(!monitor.current().is_active);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_strategies_shorten_threshold() {
        let source = flaky(1);
        let monitor = ActivityMonitor::start(Some(&source), THRESHOLD);
        assert_eq!(monitor.mode(), MonitorMode::Live(InitStrategy::Halved));
        assert_eq!(monitor.current().inactivity_threshold_ms, 15_000);

        let source = flaky(2);
        let monitor = ActivityMonitor::start(Some(&source), THRESHOLD);
        assert_eq!(monitor.mode(), MonitorMode::Live(InitStrategy::Quarter));
    }

    #[tokio::test(start_paused = true)]
    async fn unattachable_source_means_fallback_mode() {
        let source = flaky(3);
        let monitor = ActivityMonitor::start(Some(&source), THRESHOLD);

        assert_eq!(monitor.mode(), MonitorMode::Fallback);
        assert!(!monitor.is_healthy());

        monitor.record_interaction(Interaction::Pointer);
        assert!(monitor.current().is_active);
        tokio::time::sleep(THRESHOLD).await;
        assert!(!monitor.current().is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_open_stream_stays_live() {
        let hub = InteractionHub::new();
        let monitor = ActivityMonitor::start(Some(&hub), THRESHOLD);

        tokio::time::sleep(Duration::from_secs(95)).await;

        assert_eq!(monitor.mode(), MonitorMode::Live(InitStrategy::Full));
        assert!(monitor.is_healthy());
        assert!(!monitor.current().is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_demotes_closed_stream() {
        let hub = InteractionHub::new();
        let monitor = ActivityMonitor::start(Some(&hub), THRESHOLD);
        assert!(monitor.is_healthy());

        drop(hub);
        settle().await;
        assert!(monitor.is_healthy());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(monitor.mode(), MonitorMode::Fallback);
        assert!(!monitor.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_marks_monitor_unhealthy() {
        let hub = InteractionHub::new();
        let monitor = ActivityMonitor::start(Some(&hub), THRESHOLD);

        monitor.shutdown();

        assert!(!monitor.is_healthy());
    }
}
