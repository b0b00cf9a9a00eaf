//! HTTP cluster client.
//!
//! Speaks the Kubernetes REST conventions for a single resource kind:
//! - `GET/POST   {prefix}/namespaces/{ns}/{plural}`
//! - `GET/PUT/PATCH/DELETE {prefix}/namespaces/{ns}/{plural}/{name}`
//! - `GET ...?watch=true&resourceVersion=RV` streaming one JSON frame per line
//!
//! Authentication is left to whatever sits in front of `base_url`
//! (typically `kubectl proxy`).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::Value;
use tether_resource::{Resource, ResourceKey, ResourceList};
use tracing::{debug, warn};

use crate::api::{EventFeed, FeedEvent, ListParams, ResourceApi};
use crate::error::ApiError;

const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest watch frame accepted before the feed is failed.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Which collection the client addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKind {
    /// Path prefix, e.g. `api/v1` or `apis/apps/v1`.
    pub api_prefix: String,
    /// Lower-case plural, e.g. `services`.
    pub plural: String,
}

impl ResourceKind {
    pub fn new(api_prefix: impl Into<String>, plural: impl Into<String>) -> Self {
        Self {
            api_prefix: api_prefix.into(),
            plural: plural.into(),
        }
    }

    /// Core v1 Services.
    pub fn services() -> Self {
        Self::new("api/v1", "services")
    }
}

/// Cluster API client for one resource kind.
pub struct KubeClient {
    client: reqwest::Client,
    base_url: String,
    kind: ResourceKind,
    /// Server-side timeout requested on each watch call.
    watch_timeout_secs: u64,
}

impl KubeClient {
    /// Create a new client.
    pub fn new(base_url: &str, kind: ResourceKind) -> Result<Self, ApiError> {
        // No overall timeout: watch bodies stream for minutes. Plain calls set
        // their own per-request timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            kind,
            watch_timeout_secs: 290,
        })
    }

    /// Override the server-side watch timeout.
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn collection_url(&self, namespace: &str) -> String {
        format!(
            "{}/{}/namespaces/{}/{}",
            self.base_url, self.kind.api_prefix, namespace, self.kind.plural
        )
    }

    pub fn object_url(&self, key: &ResourceKey) -> String {
        format!("{}/{}", self.collection_url(key.namespace()), key.name())
    }

    fn selector_query(params: &ListParams) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(fields) = params.fields.to_query() {
            query.push(("fieldSelector", fields));
        }
        if let Some(labels) = params.labels.as_ref().filter(|l| !l.is_empty()) {
            query.push(("labelSelector", labels.to_query()));
        }
        query
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatusBody {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListBody {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Option<Vec<Resource>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default)]
    resource_version: String,
}

#[derive(Debug, Deserialize)]
struct WatchFrame {
    #[serde(rename = "type")]
    kind: String,
    object: Value,
}

/// Turn a non-success response into an error, keeping the server's message.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<StatusBody>(&body)
        .ok()
        .map(|s| s.message)
        .filter(|m| !m.is_empty())
        .unwrap_or(body);

    debug!(status = %status, message = %message, "Cluster API request failed");
    Err(ApiError::from_status(status.as_u16(), message))
}

/// Decode one line of a watch stream.
pub(crate) fn decode_frame(line: &[u8]) -> Result<FeedEvent, ApiError> {
    let frame: WatchFrame = serde_json::from_slice(line)?;

    match frame.kind.as_str() {
        "ADDED" => Ok(FeedEvent::Added(Resource::from_value(frame.object)?)),
        "MODIFIED" => Ok(FeedEvent::Modified(Resource::from_value(frame.object)?)),
        "DELETED" => Ok(FeedEvent::Deleted(Resource::from_value(frame.object)?)),
        "BOOKMARK" => {
            let resource = Resource::from_value(frame.object)?;
            Ok(FeedEvent::Bookmark {
                resource_version: resource.resource_version().unwrap_or_default().to_string(),
            })
        }
        "ERROR" => {
            let status: StatusBody = serde_json::from_value(frame.object).unwrap_or_default();
            Err(ApiError::from_status(status.code, status.message))
        }
        other => Err(ApiError::Decode(format!("unknown watch event type: {other}"))),
    }
}

struct LineDecoder {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: Vec<u8>,
    max_frame: usize,
    done: bool,
}

impl LineDecoder {
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        Some(line)
    }
}

/// Split a streaming body into frames.
fn frames(body: BoxStream<'static, reqwest::Result<Bytes>>) -> EventFeed {
    frames_with_limit(body, MAX_FRAME_BYTES)
}

fn frames_with_limit(body: BoxStream<'static, reqwest::Result<Bytes>>, max_frame: usize) -> EventFeed {
    let decoder = LineDecoder {
        body,
        buf: Vec::new(),
        max_frame,
        done: false,
    };

    stream::unfold(decoder, |mut dec| async move {
        loop {
            if let Some(line) = dec.take_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((decode_frame(&line), dec));
            }

            if dec.done {
                if dec.buf.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let rest = std::mem::take(&mut dec.buf);
                return Some((decode_frame(&rest), dec));
            }

            // No newline in the buffer: a partial frame.
            if dec.buf.len() > dec.max_frame {
                warn!(buffered = dec.buf.len(), limit = dec.max_frame, "Watch frame too large");
                dec.done = true;
                dec.buf.clear();
                return Some((
                    Err(ApiError::Decode(format!("watch frame exceeds {} bytes", dec.max_frame))),
                    dec,
                ));
            }

            match dec.body.next().await {
                Some(Ok(chunk)) => dec.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    warn!(error = %e, "Watch stream read failed");
                    dec.done = true;
                    dec.buf.clear();
                    return Some((Err(ApiError::Transport(e.to_string())), dec));
                }
                None => dec.done = true,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ResourceApi for KubeClient {
    async fn get(&self, key: &ResourceKey) -> Result<Resource, ApiError> {
        let url = self.object_url(key);
        debug!(url = %url, "Fetching object");

        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn list(&self, namespace: &str, params: &ListParams) -> Result<ResourceList, ApiError> {
        let url = self.collection_url(namespace);
        debug!(url = %url, "Listing objects");

        let response = self
            .client
            .get(&url)
            .query(&Self::selector_query(params))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let body: ListBody = check(response).await?.json().await?;

        Ok(ResourceList {
            items: body.items.unwrap_or_default(),
            resource_version: body.metadata.resource_version,
        })
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, ApiError> {
        let key = resource.key().map_err(|e| ApiError::invalid(e.to_string()))?;
        let url = self.collection_url(key.namespace());
        debug!(key = %key, "Creating object");

        let response = self
            .client
            .post(&url)
            .json(resource)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn update(&self, resource: &Resource) -> Result<Resource, ApiError> {
        let key = resource.key().map_err(|e| ApiError::invalid(e.to_string()))?;
        let url = self.object_url(&key);
        debug!(key = %key, "Updating object");

        let response = self
            .client
            .put(&url)
            .json(resource)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ApiError> {
        let url = self.object_url(key);
        debug!(key = %key, "Deleting object");

        let response = self
            .client
            .delete(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn patch(&self, key: &ResourceKey, patch: &[u8]) -> Result<Resource, ApiError> {
        let url = self.object_url(key);

        let response = self
            .client
            .patch(&url)
            .header(CONTENT_TYPE, JSON_PATCH_CONTENT_TYPE)
            .body(patch.to_vec())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn watch(
        &self,
        namespace: &str,
        params: &ListParams,
        resource_version: &str,
    ) -> Result<EventFeed, ApiError> {
        let url = self.collection_url(namespace);
        let mut query = Self::selector_query(params);
        query.push(("watch", "true".to_string()));
        query.push(("allowWatchBookmarks", "true".to_string()));
        query.push(("timeoutSeconds", self.watch_timeout_secs.to_string()));
        if !resource_version.is_empty() {
            query.push(("resourceVersion", resource_version.to_string()));
        }

        debug!(url = %url, resource_version, "Opening watch");

        let response = self.client.get(&url).query(&query).send().await?;
        let response = check(response).await?;

        Ok(frames(response.bytes_stream().boxed()))
    }
}
