//! Core state machines for silent background updates.
//!
//! This crate holds everything that does not depend on the host's concrete
//! storage, cache or process model:
//! - Version polling with cache-busting endpoint variants and jittered backoff.
//! - A verified, self-healing version record and a durable update queue.
//! - User activity tracking and activity-aware apply scheduling.
//! - Multi-layer cache invalidation and ordered reload fallbacks.
//! - The [`Orchestrator`] tying them together.

pub mod activity;
mod backoff;
pub mod cache;
mod config;
mod error;
pub mod fetcher;
mod memory;
mod orchestrator;
mod persist;
mod queue;
mod reload;
pub mod scheduler;
mod store;
mod traits;
mod transition;
mod transport;
mod types;

#[cfg(test)]
mod test_support;

/// Activity tracking and the in-process interaction hub.
pub use activity::{ActivityMonitor, InactivitySubscription, Interaction, InteractionHub};
/// Exponential backoff with jitter.
pub use backoff::Backoff;
/// Cache invalidation and its per-layer report.
pub use cache::{CacheInvalidator, InvalidationReport, LayerOutcome, StoragePurgeLayer};
/// Serializable updater configuration.
pub use config::{StorageKeys, UpdaterConfig};
/// Error taxonomy for the updater and its collaborator seams.
pub use error::{
    ActivityError, CacheError, ErrorClass, ReloadError, StorageError, StorageOperation,
    TransportError, UpdateError,
};
/// Version endpoint polling.
pub use fetcher::VersionFetcher;
/// In-memory key-value store, also useful as a test double.
pub use memory::MemoryStore;
/// Orchestrator state machine and its outcomes.
pub use orchestrator::{ApplyOutcome, CheckOutcome, Collaborators, Orchestrator, PersistTier};
pub use queue::UpdateQueue;
pub use reload::reload_with_fallbacks;
pub use scheduler::{ApplyTrigger, ScheduledApply, UpdateScheduler};
pub use store::VersionStore;
/// Collaborator seams implemented by the host.
pub use traits::{
    ActivitySource, CacheLayer, CacheStorage, HttpResponse, HttpTransport, KeyValueStore,
    ReloadStrategy,
};
pub use transition::{VersionTransition, classify as classify_transition};
/// `reqwest`-backed version endpoint transport.
pub use transport::ReqwestTransport;
pub use types::{
    ActivityState, QueuedUpdate, UpdatePhase, UpdateQueueState, UpdateState, VersionDescriptor,
};
