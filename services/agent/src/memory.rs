//! In-memory cluster store.
//!
//! Behaves like a single-kind API server closely enough to exercise the
//! heartbeat and watch paths:
//! - Every write bumps a store-wide resourceVersion
//! - Watches replay retained history after the requested version, then
//!   follow live writes; asking for a version older than the retained
//!   history fails with [`ApiError::Gone`]
//! - JSON patches support `add`, `replace` and `remove` on object members
//! - A no-op patch leaves the version untouched and emits nothing
//!
//! Failure injection and call counters are provided for tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tether_resource::{Resource, ResourceKey, ResourceList};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::debug;

use crate::api::{EventFeed, FeedEvent, ListParams, ResourceApi};
use crate::error::ApiError;

const DEFAULT_HISTORY_LIMIT: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct Store {
    objects: BTreeMap<ResourceKey, Resource>,
    version: u64,
    history: VecDeque<(u64, FeedEvent)>,
    /// Highest version dropped from `history`.
    compacted_through: u64,
}

#[derive(Default)]
struct Faults {
    next_patch: VecDeque<ApiError>,
    all_patches: Option<ApiError>,
    next_create: VecDeque<ApiError>,
    next_list: VecDeque<ApiError>,
    next_watch: VecDeque<ApiError>,
}

/// Thread-safe in-memory implementation of [`ResourceApi`].
pub struct InMemoryApi {
    store: RwLock<Store>,
    events: broadcast::Sender<(u64, FeedEvent)>,
    /// Bumped to close every open feed.
    feed_epoch: watch::Sender<u64>,
    history_limit: usize,
    faults: Mutex<Faults>,

    patch_calls: AtomicU64,
    list_calls: AtomicU64,
    watch_calls: AtomicU64,
    create_calls: AtomicU64,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create a store that retains at most `limit` events for watch replay.
    pub fn with_history_limit(limit: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (feed_epoch, _) = watch::channel(0);
        Self {
            store: RwLock::new(Store {
                objects: BTreeMap::new(),
                version: 0,
                history: VecDeque::new(),
                compacted_through: 0,
            }),
            events,
            feed_epoch,
            history_limit: limit,
            faults: Mutex::new(Faults::default()),
            patch_calls: AtomicU64::new(0),
            list_calls: AtomicU64::new(0),
            watch_calls: AtomicU64::new(0),
            create_calls: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Test controls
    // -------------------------------------------------------------------------

    /// Close every open change feed, as if the server dropped connections.
    pub fn close_watches(&self) {
        self.feed_epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Drop all retained history; watches from older versions get `Gone`.
    pub async fn compact_history(&self) {
        let mut store = self.store.write().await;
        store.compacted_through = store.version;
        store.history.clear();
    }

    pub fn fail_next_patch(&self, err: ApiError) {
        self.faults().next_patch.push_back(err);
    }

    /// Fail every patch with `err` until cleared with `None`.
    pub fn fail_all_patches(&self, err: Option<ApiError>) {
        self.faults().all_patches = err;
    }

    pub fn fail_next_create(&self, err: ApiError) {
        self.faults().next_create.push_back(err);
    }

    pub fn fail_next_list(&self, err: ApiError) {
        self.faults().next_list.push_back(err);
    }

    pub fn fail_next_watch(&self, err: ApiError) {
        self.faults().next_watch.push_back(err);
    }

    pub fn patch_calls(&self) -> u64 {
        self.patch_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> u64 {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Current store version.
    pub async fn version(&self) -> u64 {
        self.store.read().await.version
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.store.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        // A panic while holding this lock cannot leave Faults inconsistent.
        self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Commit a write: bump the version, stamp it, record and publish the
    /// event. Runs under the store write lock so watch registration (under
    /// the read lock) sees a consistent history/broadcast split.
    fn commit(&self, store: &mut Store, mut resource: Resource, kind: EventKind) -> Resource {
        store.version += 1;
        let version = store.version;
        resource.metadata.resource_version = Some(version.to_string());

        let key = ResourceKey::new(resource.name(), resource.namespace());
        match (&kind, key) {
            (EventKind::Deleted, Ok(key)) => {
                store.objects.remove(&key);
            }
            (_, Ok(key)) => {
                store.objects.insert(key, resource.clone());
            }
            (_, Err(_)) => {}
        }

        let event = match kind {
            EventKind::Added => FeedEvent::Added(resource.clone()),
            EventKind::Modified => FeedEvent::Modified(resource.clone()),
            EventKind::Deleted => FeedEvent::Deleted(resource.clone()),
        };

        store.history.push_back((version, event.clone()));
        while store.history.len() > self.history_limit {
            if let Some((dropped, _)) = store.history.pop_front() {
                store.compacted_through = dropped;
            }
        }

        // No receivers is fine: nobody is watching.
        let _ = self.events.send((version, event));
        resource
    }
}

impl Default for InMemoryApi {
    fn default() -> Self {
        Self::new()
    }
}

enum EventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Deserialize)]
struct JsonPatchOp {
    op: String,
    path: String,
    #[serde(default)]
    value: Option<Value>,
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Apply RFC 6902 operations on object members.
fn apply_json_patch(target: &mut Value, patch: &[u8]) -> Result<(), ApiError> {
    let ops: Vec<JsonPatchOp> = serde_json::from_slice(patch)?;

    for op in ops {
        let (parent_path, token) = op
            .path
            .rsplit_once('/')
            .ok_or_else(|| ApiError::invalid(format!("invalid patch path: {}", op.path)))?;
        let token = unescape_token(token);

        let parent = target
            .pointer_mut(parent_path)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| ApiError::invalid(format!("patch target does not exist: {parent_path}")))?;

        match op.op.as_str() {
            "add" => {
                let value = op.value.ok_or_else(|| ApiError::invalid("add requires a value"))?;
                parent.insert(token, value);
            }
            "replace" => {
                let value = op
                    .value
                    .ok_or_else(|| ApiError::invalid("replace requires a value"))?;
                match parent.get_mut(&token) {
                    Some(slot) => *slot = value,
                    None => return Err(ApiError::invalid(format!("cannot replace missing member: {}", op.path))),
                }
            }
            "test" => {
                let expected = op.value.ok_or_else(|| ApiError::invalid("test requires a value"))?;
                if parent.get(&token) != Some(&expected) {
                    return Err(ApiError::invalid(format!("test failed on {}", op.path)));
                }
            }
            "remove" => {
                if parent.remove(&token).is_none() {
                    return Err(ApiError::invalid(format!("cannot remove missing member: {}", op.path)));
                }
            }
            other => return Err(ApiError::invalid(format!("unsupported patch op: {other}"))),
        }
    }

    Ok(())
}

struct FeedState {
    backlog: VecDeque<FeedEvent>,
    live: broadcast::Receiver<(u64, FeedEvent)>,
    epoch: watch::Receiver<u64>,
    params: ListParams,
    namespace: String,
    last_seen: u64,
    done: bool,
}

#[async_trait]
impl ResourceApi for InMemoryApi {
    async fn get(&self, key: &ResourceKey) -> Result<Resource, ApiError> {
        let store = self.store.read().await;
        store
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(key.to_string()))
    }

    async fn list(&self, namespace: &str, params: &ListParams) -> Result<ResourceList, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.faults().next_list.pop_front() {
            return Err(err);
        }

        let store = self.store.read().await;
        let items = store
            .objects
            .values()
            .filter(|r| r.namespace() == namespace && params.matches(r))
            .cloned()
            .collect();

        Ok(ResourceList {
            items,
            resource_version: store.version.to_string(),
        })
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, ApiError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.faults().next_create.pop_front() {
            return Err(err);
        }

        let key = resource
            .key()
            .map_err(|e| ApiError::invalid(e.to_string()))?;

        let mut store = self.store.write().await;
        if store.objects.contains_key(&key) {
            return Err(ApiError::Conflict(format!("{key} already exists")));
        }

        let mut resource = resource.clone();
        resource.metadata.uid = Some(format!("uid-{}", store.version + 1));
        debug!(key = %key, "[MEMORY] Creating object");
        Ok(self.commit(&mut store, resource, EventKind::Added))
    }

    async fn update(&self, resource: &Resource) -> Result<Resource, ApiError> {
        let key = resource
            .key()
            .map_err(|e| ApiError::invalid(e.to_string()))?;

        let mut store = self.store.write().await;
        let current = store
            .objects
            .get(&key)
            .ok_or_else(|| ApiError::NotFound(key.to_string()))?;

        if let Some(expected) = resource.resource_version() {
            if current.resource_version() != Some(expected) {
                return Err(ApiError::Conflict(format!(
                    "{key} was modified: expected version {expected}"
                )));
            }
        }

        let mut resource = resource.clone();
        resource.metadata.uid = current.metadata.uid.clone();
        Ok(self.commit(&mut store, resource, EventKind::Modified))
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ApiError> {
        let mut store = self.store.write().await;
        let current = store
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(key.to_string()))?;

        debug!(key = %key, "[MEMORY] Deleting object");
        self.commit(&mut store, current, EventKind::Deleted);
        Ok(())
    }

    async fn patch(&self, key: &ResourceKey, patch: &[u8]) -> Result<Resource, ApiError> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.faults();
            if let Some(err) = faults.next_patch.pop_front() {
                return Err(err);
            }
            if let Some(err) = faults.all_patches.clone() {
                return Err(err);
            }
        }

        let mut store = self.store.write().await;
        let current = store
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(key.to_string()))?;

        let mut value = current.to_value();
        apply_json_patch(&mut value, patch)?;
        let mut patched = Resource::from_value(value)?;

        // Identity is immutable.
        patched.metadata.name = current.metadata.name.clone();
        patched.metadata.namespace = current.metadata.namespace.clone();
        patched.metadata.uid = current.metadata.uid.clone();

        if patched == current {
            return Ok(current);
        }

        Ok(self.commit(&mut store, patched, EventKind::Modified))
    }

    async fn watch(
        &self,
        namespace: &str,
        params: &ListParams,
        resource_version: &str,
    ) -> Result<EventFeed, ApiError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.faults().next_watch.pop_front() {
            return Err(err);
        }

        // Read lock: no write can commit between the history snapshot and
        // the broadcast subscription.
        let store = self.store.read().await;

        let from = if resource_version.is_empty() {
            store.version
        } else {
            resource_version
                .parse::<u64>()
                .map_err(|_| ApiError::invalid(format!("invalid resource version: {resource_version}")))?
        };

        if from < store.compacted_through {
            return Err(ApiError::Gone(format!(
                "too old resource version: {from} ({})",
                store.compacted_through
            )));
        }

        let matches = |event: &FeedEvent| match event {
            FeedEvent::Added(r) | FeedEvent::Modified(r) | FeedEvent::Deleted(r) => {
                r.namespace() == namespace && params.matches(r)
            }
            FeedEvent::Bookmark { .. } => true,
        };

        let mut last_seen = from;
        let mut backlog = VecDeque::new();
        for (version, event) in store.history.iter() {
            if *version > from {
                last_seen = *version;
                if matches(event) {
                    backlog.push_back(event.clone());
                }
            }
        }

        let state = FeedState {
            backlog,
            live: self.events.subscribe(),
            epoch: self.feed_epoch.subscribe(),
            params: params.clone(),
            namespace: namespace.to_string(),
            last_seen,
            done: false,
        };
        drop(store);

        let feed = stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            if let Some(event) = st.backlog.pop_front() {
                return Some((Ok(event), st));
            }

            loop {
                tokio::select! {
                    biased;

                    _ = st.epoch.changed() => return None,

                    msg = st.live.recv() => match msg {
                        Ok((version, event)) => {
                            if version <= st.last_seen {
                                continue;
                            }
                            st.last_seen = version;

                            let relevant = match &event {
                                FeedEvent::Added(r) | FeedEvent::Modified(r) | FeedEvent::Deleted(r) => {
                                    r.namespace() == st.namespace && st.params.matches(r)
                                }
                                FeedEvent::Bookmark { .. } => true,
                            };
                            if relevant {
                                return Some((Ok(event), st));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            st.done = true;
                            return Some((Err(ApiError::Gone(format!("watch fell behind by {skipped} events"))), st));
                        }
                        Err(RecvError::Closed) => return None,
                    },
                }
            }
        });

        Ok(feed.boxed())
    }
}
