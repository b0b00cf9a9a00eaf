//! Resource lifecycle facade.
//!
//! Ties creating a resource to keeping it alive, and exposes watch
//! registration over the same API.

use std::collections::BTreeMap;
use std::sync::Arc;

use tether_resource::{map_contains, LabelSelector, LivenessPatch, Resource, ResourceKey, ServiceSpec};
use tracing::{info, warn};

use crate::api::{ListParams, ResourceApi};
use crate::error::{ApiError, LifecycleError, RegistrationError};
use crate::heartbeat::{ApiPatcher, HeartbeatConfig, HeartbeatCoordinator, HeartbeatHandle, LivenessPatcher};
use crate::watch::{WatchConfig, WatchHandler, WatchRequest, WatchSubscription, Watcher};

/// A created resource together with the heartbeat keeping it alive.
#[derive(Debug, Clone)]
pub struct TrackedResource {
    pub resource: Resource,
    pub heartbeat: HeartbeatHandle,
}

impl TrackedResource {
    pub fn key(&self) -> &ResourceKey {
        self.heartbeat.key()
    }
}

/// One agent session: every heartbeat it starts is owned here and stopped
/// by [`ResourceLifecycle::shutdown`].
pub struct ResourceLifecycle {
    api: Arc<dyn ResourceApi>,
    config: HeartbeatConfig,
    heartbeats: HeartbeatCoordinator,
    patcher: Arc<dyn LivenessPatcher>,
    watcher: Watcher,
}

impl ResourceLifecycle {
    pub fn new(api: Arc<dyn ResourceApi>, config: HeartbeatConfig) -> Result<Self, RegistrationError> {
        Self::with_watch_config(api, config, WatchConfig::default())
    }

    pub fn with_watch_config(
        api: Arc<dyn ResourceApi>,
        config: HeartbeatConfig,
        watch: WatchConfig,
    ) -> Result<Self, RegistrationError> {
        config.validate()?;

        let patcher: Arc<dyn LivenessPatcher> = Arc::new(ApiPatcher::new(
            Arc::clone(&api),
            config.annotation.clone(),
            config.timestamp_format,
        ));

        Ok(Self {
            heartbeats: HeartbeatCoordinator::new(config.not_found),
            watcher: Watcher::new(Arc::clone(&api), watch),
            api,
            config,
            patcher,
        })
    }

    pub fn api(&self) -> &Arc<dyn ResourceApi> {
        &self.api
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn heartbeats(&self) -> &HeartbeatCoordinator {
        &self.heartbeats
    }

    /// Create `resource` and start heartbeating it.
    ///
    /// The liveness annotation is seeded before creation so the annotations
    /// map exists when the first patch lands. If creation fails nothing is
    /// started.
    pub async fn create_and_track(&self, mut resource: Resource) -> Result<TrackedResource, LifecycleError> {
        let key = resource.key().map_err(RegistrationError::from)?;

        let seed = LivenessPatch::now(&self.config.annotation, self.config.timestamp_format);
        resource
            .metadata
            .annotations
            .insert(self.config.annotation.clone(), seed.timestamp().to_string());

        let created = match self.api.create(&resource).await {
            Ok(created) => created,
            Err(e) => {
                warn!(key = %key, error = %e, "Create failed, not tracking");
                return Err(e.into());
            }
        };

        let heartbeat = self.track(key.clone()).await?;
        info!(key = %key, uid = ?created.metadata.uid, "Created and tracking");

        Ok(TrackedResource {
            resource: created,
            heartbeat,
        })
    }

    /// Heartbeat an object that already exists. An object without
    /// annotations gets its map seeded by the first tick.
    pub async fn track(&self, key: ResourceKey) -> Result<HeartbeatHandle, RegistrationError> {
        self.heartbeats
            .start(key, self.config.interval, Arc::clone(&self.patcher))
            .await
    }

    /// Render and create a Service, then track it.
    pub async fn create_service(&self, spec: &ServiceSpec) -> Result<TrackedResource, LifecycleError> {
        self.create_and_track(spec.to_resource()).await
    }

    pub async fn get(&self, key: &ResourceKey) -> Result<Resource, ApiError> {
        self.api.get(key).await
    }

    pub async fn list_all(&self, namespace: &str) -> Result<Vec<Resource>, ApiError> {
        Ok(self.api.list(namespace, &ListParams::all()).await?.items)
    }

    /// Objects carrying every label in `labels` (filtered by the server).
    pub async fn list_by_labels(
        &self,
        namespace: &str,
        labels: &LabelSelector,
    ) -> Result<Vec<Resource>, ApiError> {
        let params = ListParams::labelled(labels.clone());
        Ok(self.api.list(namespace, &params).await?.items)
    }

    /// Objects whose `spec.selector` contains every pair in `selector`.
    pub async fn list_by_selector(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Resource>, ApiError> {
        let items = self.list_all(namespace).await?;
        Ok(items
            .into_iter()
            .filter(|r| map_contains(&spec_selector(r), selector))
            .collect())
    }

    pub async fn update(&self, resource: &Resource) -> Result<Resource, ApiError> {
        self.api.update(resource).await
    }

    /// Stop the heartbeat for `key`, then delete the object.
    pub async fn remove(&self, key: &ResourceKey) -> Result<(), ApiError> {
        self.heartbeats.stop_key(key).await;
        self.api.delete(key).await?;
        info!(key = %key, "Removed");
        Ok(())
    }

    pub fn watch<H: WatchHandler>(
        &self,
        request: WatchRequest,
        handler: H,
    ) -> Result<WatchSubscription, RegistrationError> {
        self.watcher.watch(request, handler)
    }

    /// Stop every heartbeat of this session. Returns how many were running.
    pub async fn shutdown(&self) -> usize {
        self.heartbeats.stop_all().await
    }
}

fn spec_selector(resource: &Resource) -> BTreeMap<String, String> {
    resource
        .spec()
        .and_then(|spec| spec.get("selector"))
        .and_then(|selector| selector.as_object())
        .map(|pairs| {
            pairs
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::memory::InMemoryApi;

    #[test]
    fn test_spec_selector() {
        let svc = ServiceSpec::new("web", "default")
            .with_selector("app", "web")
            .to_resource();
        let selector = spec_selector(&svc);
        assert_eq!(selector.get("app").map(String::as_str), Some("web"));

        let bare = Resource::new("v1", "Service", "bare", "default");
        assert!(spec_selector(&bare).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let api = Arc::new(InMemoryApi::new());
        let config = HeartbeatConfig {
            interval: Duration::ZERO,
            ..HeartbeatConfig::default()
        };
        assert!(matches!(
            ResourceLifecycle::new(api, config),
            Err(RegistrationError::InvalidInterval)
        ));
    }

    #[tokio::test]
    async fn test_create_seeds_annotation() {
        let api = Arc::new(InMemoryApi::new());
        let lifecycle = ResourceLifecycle::new(api.clone(), HeartbeatConfig::default()).unwrap();

        let tracked = lifecycle
            .create_and_track(Resource::new("v1", "Service", "web", "default"))
            .await
            .unwrap();

        let annotation = &lifecycle.config().annotation;
        assert!(tracked.resource.annotation(annotation).is_some());
        assert!(lifecycle.heartbeats().is_active(tracked.key()).await);

        assert_eq!(lifecycle.shutdown().await, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_missing_namespace() {
        let api = Arc::new(InMemoryApi::new());
        let lifecycle = ResourceLifecycle::new(api.clone(), HeartbeatConfig::default()).unwrap();

        let err = lifecycle
            .create_and_track(Resource::new("v1", "Service", "web", ""))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Registration(RegistrationError::EmptyNamespace)
        ));
        assert_eq!(api.create_calls(), 0);
    }
}
