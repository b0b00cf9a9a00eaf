//! Cluster API interface.
//!
//! The generic CRUD collaborator every other component talks through:
//! - Object reads and writes for one resource kind
//! - Blind patches (used by the heartbeat)
//! - List + incremental change feed (used by the watch subsystem)
//!
//! [`KubeClient`](crate::kube::KubeClient) speaks to a real API server and
//! [`InMemoryApi`](crate::memory::InMemoryApi) is provided for tests and
//! development.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tether_resource::{FieldSelector, LabelSelector, Resource, ResourceKey, ResourceList};

use crate::error::ApiError;

/// Server-side filters for list and watch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub fields: FieldSelector,
    pub labels: Option<LabelSelector>,
}

impl ListParams {
    /// Everything in the namespace.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            fields: FieldSelector::name(name),
            labels: None,
        }
    }

    pub fn labelled(labels: LabelSelector) -> Self {
        Self {
            fields: FieldSelector::everything(),
            labels: Some(labels),
        }
    }

    /// Client-side evaluation of the same filter.
    pub fn matches(&self, resource: &Resource) -> bool {
        self.fields.matches(resource)
            && self
                .labels
                .as_ref()
                .is_none_or(|labels| labels.matches_resource(resource))
    }
}

/// One frame of an incremental change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
    /// Progress marker carrying only a newer resourceVersion.
    Bookmark { resource_version: String },
}

impl FeedEvent {
    /// The resourceVersion this frame moves the feed to.
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            FeedEvent::Added(r) | FeedEvent::Modified(r) | FeedEvent::Deleted(r) => {
                r.resource_version()
            }
            FeedEvent::Bookmark { resource_version } => Some(resource_version),
        }
    }
}

/// A live change feed. Ends when the server closes the connection; an
/// `Err` item reports a feed-level failure.
pub type EventFeed = BoxStream<'static, Result<FeedEvent, ApiError>>;

/// Cluster API interface for a single resource kind.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Resource, ApiError>;

    async fn list(&self, namespace: &str, params: &ListParams) -> Result<ResourceList, ApiError>;

    async fn create(&self, resource: &Resource) -> Result<Resource, ApiError>;

    async fn update(&self, resource: &Resource) -> Result<Resource, ApiError>;

    async fn delete(&self, key: &ResourceKey) -> Result<(), ApiError>;

    /// Apply a JSON patch (RFC 6902) document.
    async fn patch(&self, key: &ResourceKey, patch: &[u8]) -> Result<Resource, ApiError>;

    /// Open a change feed continuing after `resource_version`.
    async fn watch(
        &self,
        namespace: &str,
        params: &ListParams,
        resource_version: &str,
    ) -> Result<EventFeed, ApiError>;
}
