use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityMonitor;
use crate::config::UpdaterConfig;

/// Which path released a scheduled apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyTrigger {
    Immediate,
    Inactivity,
    Timeout,
}

/// Decides when a pending update may be applied without interrupting the user.
#[derive(Clone)]
pub struct UpdateScheduler {
    monitor: Option<Arc<ActivityMonitor>>,
    activity_aware: bool,
    immediate_delay: Duration,
    max_wait: Duration,
    cancel: CancellationToken,
    pending: Arc<Mutex<Option<CancellationToken>>>,
}

impl UpdateScheduler {
    pub fn new(
        monitor: Option<Arc<ActivityMonitor>>,
        activity_aware: bool,
        immediate_delay: Duration,
        max_wait: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            monitor,
            activity_aware,
            immediate_delay,
            max_wait,
            cancel,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_config(
        monitor: Option<Arc<ActivityMonitor>>,
        config: &UpdaterConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(
            monitor,
            config.activity_aware,
            config.immediate_apply_delay(),
            config.max_wait(),
            cancel,
        )
    }

    /// True when nothing argues for waiting: activity awareness is off, the
    /// monitor is missing or unhealthy, or the user is idle.
    #[must_use]
    pub fn should_apply_now(&self) -> bool {
        if !self.activity_aware {
            return true;
        }
        match &self.monitor {
            Some(monitor) if monitor.is_healthy() => !monitor.current().is_active,
            _ => true,
        }
    }

    /// Resolve once an apply is allowed. The hard timeout bounds how long an
    /// active user can defer it.
    pub async fn wait_for_window(&self) -> ApplyTrigger {
        let monitor = match &self.monitor {
            Some(monitor) if !self.should_apply_now() => monitor,
            _ => {
                tokio::time::sleep(self.immediate_delay).await;
                return ApplyTrigger::Immediate;
            }
        };

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = monitor.on_become_inactive(move || {
            if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(());
            }
        });

        // the user may have gone idle before the callback was registered
        if !monitor.current().is_active {
            return ApplyTrigger::Inactivity;
        }

        let trigger = tokio::select! {
            Ok(()) = rx => ApplyTrigger::Inactivity,
            () = tokio::time::sleep(self.max_wait) => ApplyTrigger::Timeout,
        };
        subscription.unsubscribe();
        trigger
    }

    /// Run `apply` once the apply window opens. Replaces any apply that is
    /// still waiting.
    pub fn schedule_apply<F, Fut>(&self, apply: F) -> ScheduledApply
    where
        F: FnOnce(ApplyTrigger) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancel.child_token();
        if let Some(previous) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone())
        {
            previous.cancel();
        }

        let scheduler = self.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let trigger = tokio::select! {
                () = task_token.cancelled() => {
                    debug!("Scheduled update apply cancelled");
                    return;
                }
                trigger = scheduler.wait_for_window() => trigger,
            };
            info!("Update apply window opened ({trigger:?})");
            apply(trigger).await;
        });

        ScheduledApply { token, handle }
    }

    /// Cancel the apply that is still waiting for its window, if any.
    pub fn cancel(&self) {
        if let Some(token) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

pub struct ScheduledApply {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledApply {
    /// Has no effect once the apply callback has started.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) {
        if let Err(error) = self.handle.await {
            debug!("Scheduled apply task ended abnormally: {error}");
        }
    }
}
