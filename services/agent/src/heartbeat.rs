//! Heartbeat coordinator.
//!
//! Keeps owned resources visibly alive by re-stamping a liveness annotation
//! on a fixed period. The external reaper treats objects whose marker has
//! gone stale as abandoned.
//!
//! - One background task per [`ResourceKey`]; starting a second heartbeat for
//!   the same key replaces the first, which is fully stopped before the new
//!   task is spawned
//! - Patch failures are logged and the timer keeps running
//! - [`HeartbeatCoordinator::stop`] returns only once the task has exited, so
//!   no patch is issued for that handle afterwards

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_resource::{LivenessPatch, ResourceKey, TimestampFormat, DEFAULT_HEARTBEAT_ANNOTATION};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::ResourceApi;
use crate::error::{ApiError, RegistrationError};

/// The capability a heartbeat invokes on every tick.
///
/// Implementations must tolerate concurrent calls for different keys.
#[async_trait]
pub trait LivenessPatcher: Send + Sync {
    async fn patch_liveness(&self, key: &ResourceKey) -> Result<(), ApiError>;
}

/// Patches the liveness annotation through a [`ResourceApi`].
pub struct ApiPatcher {
    api: Arc<dyn ResourceApi>,
    annotation: String,
    format: TimestampFormat,
}

const SEED_ATTEMPTS: usize = 3;

impl ApiPatcher {
    pub fn new(api: Arc<dyn ResourceApi>, annotation: impl Into<String>, format: TimestampFormat) -> Self {
        Self {
            api,
            annotation: annotation.into(),
            format,
        }
    }

    /// Write the marker as a fresh `annotations` map if the object has none.
    ///
    /// Returns false when the object already carries annotations, in which
    /// case the rejection had another cause.
    async fn seed(&self, key: &ResourceKey, patch: &LivenessPatch) -> Result<bool, ApiError> {
        for _ in 0..SEED_ATTEMPTS {
            let current = self.api.get(key).await?;
            if !current.metadata.annotations.is_empty() {
                return Ok(false);
            }

            match self.api.patch(key, &patch.to_seed_bytes(current.resource_version())).await {
                Ok(_) => {
                    info!(key = %key, annotation = %self.annotation, "Seeded liveness annotation");
                    return Ok(true);
                }
                // Changed since the read.
                Err(e) if e.is_unprocessable() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ApiError::Conflict(format!("{key} kept changing while seeding annotations")))
    }
}

#[async_trait]
impl LivenessPatcher for ApiPatcher {
    async fn patch_liveness(&self, key: &ResourceKey) -> Result<(), ApiError> {
        let patch = LivenessPatch::now(&self.annotation, self.format);
        debug!(key = %key, at = %patch.timestamp(), "Heartbeat tick");

        match self.api.patch(key, &patch.to_bytes()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_unprocessable() => {
                // Most likely no annotations map to add into.
                if self.seed(key, &patch).await? {
                    Ok(())
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// What a heartbeat does when its target no longer exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NotFoundPolicy {
    /// Keep ticking; the object may be recreated.
    #[default]
    KeepRetrying,
    /// End the heartbeat on the first not-found response.
    Stop,
}

/// Heartbeat settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Period between patches.
    pub interval: Duration,

    /// Annotation written on each tick.
    pub annotation: String,

    /// Timestamp encoding of the annotation value.
    pub timestamp_format: TimestampFormat,

    /// Behaviour on not-found patch failures.
    pub not_found: NotFoundPolicy,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            annotation: DEFAULT_HEARTBEAT_ANNOTATION.to_string(),
            timestamp_format: TimestampFormat::Unix,
            not_found: NotFoundPolicy::KeepRetrying,
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.interval.is_zero() {
            return Err(RegistrationError::InvalidInterval);
        }
        Ok(())
    }
}

/// Caller-side reference to one running heartbeat.
///
/// The coordinator owns the task and its cancel signal; the handle only
/// identifies which registration to tear down. A handle whose heartbeat was
/// replaced or stopped is stale and stopping it is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatHandle {
    key: ResourceKey,
    interval: Duration,
    generation: u64,
}

impl HeartbeatHandle {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

struct HeartbeatEntry {
    generation: u64,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatEntry {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the task and wait for it to exit.
    async fn shutdown(self, key: &ResourceKey) -> bool {
        let was_running = self.is_running();
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(key = %key, error = %e, "Heartbeat task panicked");
            }
        }
        was_running
    }
}

/// Owns every heartbeat task of a session.
///
/// Dropping the coordinator drops every cancel sender, which ends all of
/// its tasks at their next wait.
pub struct HeartbeatCoordinator {
    entries: Mutex<HashMap<ResourceKey, HeartbeatEntry>>,
    not_found: NotFoundPolicy,
    next_generation: AtomicU64,
}

impl HeartbeatCoordinator {
    pub fn new(not_found: NotFoundPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            not_found,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start (or replace) the heartbeat for `key`.
    pub async fn start(
        &self,
        key: ResourceKey,
        interval: Duration,
        patcher: Arc<dyn LivenessPatcher>,
    ) -> Result<HeartbeatHandle, RegistrationError> {
        if interval.is_zero() {
            return Err(RegistrationError::InvalidInterval);
        }

        let mut entries = self.entries.lock().await;

        if let Some(previous) = entries.remove(&key) {
            info!(key = %key, generation = previous.generation, "Replacing heartbeat");
            previous.shutdown(&key).await;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(run_heartbeat(
            key.clone(),
            interval,
            patcher,
            self.not_found,
            stop_rx,
        ));

        entries.insert(
            key.clone(),
            HeartbeatEntry {
                generation,
                stop_tx,
                task,
            },
        );

        info!(
            key = %key,
            interval_ms = interval.as_millis() as u64,
            generation,
            "Started heartbeat"
        );

        Ok(HeartbeatHandle {
            key,
            interval,
            generation,
        })
    }

    /// Stop the heartbeat `handle` refers to.
    ///
    /// Returns true if it was still running. Stale handles are ignored.
    pub async fn stop(&self, handle: &HeartbeatHandle) -> bool {
        let entry = {
            let mut entries = self.entries.lock().await;
            match entries.get(&handle.key) {
                Some(entry) if entry.generation == handle.generation => entries.remove(&handle.key),
                _ => None,
            }
        };

        match entry {
            Some(entry) => {
                let was_running = entry.shutdown(&handle.key).await;
                info!(key = %handle.key, generation = handle.generation, "Stopped heartbeat");
                was_running
            }
            None => {
                debug!(key = %handle.key, generation = handle.generation, "Heartbeat already stopped");
                false
            }
        }
    }

    /// Stop whatever heartbeat is registered for `key`.
    pub async fn stop_key(&self, key: &ResourceKey) -> bool {
        let entry = self.entries.lock().await.remove(key);
        match entry {
            Some(entry) => {
                let was_running = entry.shutdown(key).await;
                info!(key = %key, "Stopped heartbeat");
                was_running
            }
            None => false,
        }
    }

    /// Stop every heartbeat. Returns how many were still running.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().await.drain().collect();
        let total = drained.len();

        let mut stopped = 0;
        for (_, entry) in &drained {
            if entry.is_running() {
                stopped += 1;
            }
            let _ = entry.stop_tx.send(true);
        }

        for (key, entry) in drained {
            entry.shutdown(&key).await;
        }

        info!(total, stopped, "Stopped all heartbeats");
        stopped
    }

    /// Whether a heartbeat for `key` is currently ticking.
    pub async fn is_active(&self, key: &ResourceKey) -> bool {
        self.entries
            .lock()
            .await
            .get(key)
            .is_some_and(HeartbeatEntry::is_running)
    }

    /// Number of heartbeats currently ticking.
    pub async fn active_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.is_running())
            .count()
    }
}

impl Default for HeartbeatCoordinator {
    fn default() -> Self {
        Self::new(NotFoundPolicy::default())
    }
}

/// Tick until cancelled (or, under [`NotFoundPolicy::Stop`], until the
/// target disappears).
async fn run_heartbeat(
    key: ResourceKey,
    interval: Duration,
    patcher: Arc<dyn LivenessPatcher>,
    not_found: NotFoundPolicy,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        // A closed channel means the coordinator is gone: stop as well.
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = stop.changed() => break,
            result = patcher.patch_liveness(&key) => result,
        };

        match result {
            Ok(()) => {
                if consecutive_failures > 0 {
                    info!(key = %key, consecutive_failures, "Heartbeat recovered");
                }
                consecutive_failures = 0;
            }
            Err(e) if e.is_not_found() && not_found == NotFoundPolicy::Stop => {
                warn!(key = %key, error = %e, "Heartbeat target gone, stopping");
                break;
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures <= 3 {
                    warn!(key = %key, error = %e, consecutive_failures, "Heartbeat failed");
                } else {
                    error!(key = %key, error = %e, consecutive_failures, "Heartbeat failed repeatedly");
                }
            }
        }
    }

    debug!(key = %key, "Heartbeat loop exited");
}
