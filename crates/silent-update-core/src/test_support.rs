use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ReloadError, TransportError};
use crate::traits::{HttpResponse, HttpTransport, ReloadStrategy};
use crate::types::VersionDescriptor;

pub(crate) fn descriptor(build_id: &str) -> VersionDescriptor {
    VersionDescriptor::new("1.0.0", build_id, "2026-10-01T00:00:00Z", format!("app-{build_id}"))
}

pub(crate) fn descriptor_json(build_id: &str) -> String {
    serde_json::to_string(&descriptor(build_id)).expect("descriptor serializes")
}

pub(crate) fn ok_response(build_id: &str) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::new(200, descriptor_json(build_id)))
}

/// Replays scripted responses in order; the last one repeats forever.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<(String, Duration)>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: Vec<Result<HttpResponse, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn serving(build_id: &str) -> Self {
        Self::new(vec![ok_response(build_id)])
    }

    pub(crate) fn set_script(&self, script: Vec<Result<HttpResponse, TransportError>>) {
        *self.script.lock().unwrap_or_else(PoisonError::into_inner) = script.into();
    }

    pub(crate) fn requests(&self) -> Vec<(String, Duration)> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((url.to_string(), timeout));
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        if script.len() > 1 {
            script.pop_front().expect("script has entries")
        } else {
            script
                .front()
                .cloned()
                .unwrap_or(Err(TransportError::Network("no scripted response".to_string())))
        }
    }
}

pub(crate) struct CountingReload {
    name: &'static str,
    fail: bool,
    calls: AtomicUsize,
}

impl CountingReload {
    pub(crate) fn succeeding(name: &'static str) -> Self {
        Self {
            name,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing(name: &'static str) -> Self {
        Self {
            name,
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReloadStrategy for CountingReload {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn reload(&self) -> Result<(), ReloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(ReloadError::new(self.name, "simulated failure"))
        } else {
            Ok(())
        }
    }
}
