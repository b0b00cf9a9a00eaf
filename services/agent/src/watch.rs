//! Change-watch subsystem.
//!
//! A subscription runs list-then-watch against a [`ResourceApi`] in its own
//! task and hands every change to a [`WatchHandler`], one event at a time
//! and in feed order.
//!
//! The task keeps a cache of the objects it has reported, keyed by name.
//! Every listing is diffed against it and duplicate feed frames are
//! dropped, so reconnecting (which always re-lists) never repeats or loses
//! an event.
//!
//! ```text
//! Created -> Listing -> Watching -> (Reconnecting -> Listing -> Watching)* -> Stopped
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tether_resource::{FieldSelector, LabelSelector, Resource};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{EventFeed, FeedEvent, ListParams, ResourceApi};
use crate::backoff::BackoffPolicy;
use crate::error::{ApiError, RegistrationError};

// =============================================================================
// Events and handlers
// =============================================================================

/// A change delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
}

impl WatchEvent {
    /// Current representation (final state for deletions).
    pub fn resource(&self) -> &Resource {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r,
        }
    }

    pub fn into_resource(self) -> Resource {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Modified(_) => "modified",
            WatchEvent::Deleted(_) => "deleted",
        }
    }
}

/// Receives the events of one subscription.
///
/// Calls are strictly sequential; a slow handler delays the subscription.
pub trait WatchHandler: Send + 'static {
    fn on_event(&mut self, event: WatchEvent);

    /// Called once when the subscription stops on a terminal error.
    fn on_error(&mut self, _error: &ApiError) {}
}

/// Adapts a closure into a [`WatchHandler`].
pub struct FnHandler<F>(F);

/// Build a handler from a closure over [`WatchEvent`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(WatchEvent) + Send + 'static,
{
    FnHandler(f)
}

impl<F> WatchHandler for FnHandler<F>
where
    F: FnMut(WatchEvent) + Send + 'static,
{
    fn on_event(&mut self, event: WatchEvent) {
        (self.0)(event)
    }
}

type ResourceCallback = Box<dyn FnMut(Resource) + Send>;
type ErrorCallback = Box<dyn FnMut(&ApiError) + Send>;

/// Separate optional callbacks per event kind. A missing callback is a no-op.
#[derive(Default)]
pub struct HandlerFuncs {
    on_add: Option<ResourceCallback>,
    on_modify: Option<ResourceCallback>,
    on_delete: Option<ResourceCallback>,
    on_error: Option<ErrorCallback>,
}

impl HandlerFuncs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(mut self, f: impl FnMut(Resource) + Send + 'static) -> Self {
        self.on_add = Some(Box::new(f));
        self
    }

    pub fn on_modify(mut self, f: impl FnMut(Resource) + Send + 'static) -> Self {
        self.on_modify = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl FnMut(Resource) + Send + 'static) -> Self {
        self.on_delete = Some(Box::new(f));
        self
    }

    /// Called for terminal errors, through [`WatchHandler::on_error`].
    pub fn on_failure(mut self, f: impl FnMut(&ApiError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl WatchHandler for HandlerFuncs {
    fn on_event(&mut self, event: WatchEvent) {
        let slot = match &event {
            WatchEvent::Added(_) => &mut self.on_add,
            WatchEvent::Modified(_) => &mut self.on_modify,
            WatchEvent::Deleted(_) => &mut self.on_delete,
        };
        if let Some(callback) = slot {
            callback(event.into_resource());
        }
    }

    fn on_error(&mut self, error: &ApiError) {
        if let Some(callback) = &mut self.on_error {
            callback(error);
        }
    }
}

// =============================================================================
// Requests and configuration
// =============================================================================

/// What to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    namespace: String,
    name: Option<String>,
    labels: BTreeMap<String, String>,
}

impl WatchRequest {
    /// Every object in `namespace`.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: None,
            labels: BTreeMap::new(),
        }
    }

    /// Restrict to exactly one object name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Require a label pair. May be called repeatedly.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn namespace_name(&self) -> &str {
        &self.namespace
    }

    pub fn name_filter(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Validate and build the server-side filter.
    pub fn params(&self) -> Result<ListParams, RegistrationError> {
        if self.namespace.trim().is_empty() {
            return Err(RegistrationError::EmptyNamespace);
        }

        let fields = match &self.name {
            Some(name) if name.trim().is_empty() => return Err(RegistrationError::EmptyName),
            Some(name) => FieldSelector::name(name.clone()),
            None => FieldSelector::everything(),
        };

        let labels = if self.labels.is_empty() {
            None
        } else {
            Some(LabelSelector::new(self.labels.clone())?)
        };

        Ok(ListParams { fields, labels })
    }
}

impl fmt::Display for WatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name.as_deref().unwrap_or("*"))?;
        if !self.labels.is_empty() {
            let labels: Vec<_> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "[{}]", labels.join(","))?;
        }
        Ok(())
    }
}

/// Subscription tuning.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Delay policy between failed attempts.
    pub backoff: BackoffPolicy,

    /// Give up after this many consecutive failures. `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_consecutive_failures: None,
        }
    }
}

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, task not yet running.
    Created,
    /// Fetching the initial (or recovery) snapshot.
    Listing,
    /// Following the change feed.
    Watching,
    /// Waiting before re-listing after the feed ended.
    Reconnecting,
    /// Terminal.
    Stopped,
}

// =============================================================================
// Watcher
// =============================================================================

/// Registers subscriptions against one API.
pub struct Watcher {
    api: Arc<dyn ResourceApi>,
    config: WatchConfig,
    next_id: AtomicU64,
}

impl Watcher {
    pub fn new(api: Arc<dyn ResourceApi>, config: WatchConfig) -> Self {
        Self {
            api,
            config,
            next_id: AtomicU64::new(1),
        }
    }

    /// Validate `request` and start its subscription task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch<H: WatchHandler>(
        &self,
        request: WatchRequest,
        handler: H,
    ) -> Result<WatchSubscription, RegistrationError> {
        let params = request.params()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Created);

        let task = SubscriptionTask {
            id,
            api: Arc::clone(&self.api),
            namespace: request.namespace.clone(),
            label: request.to_string(),
            params,
            handler,
            backoff: self.config.backoff.clone(),
            max_consecutive_failures: self.config.max_consecutive_failures,
            cache: HashMap::new(),
            resource_version: String::new(),
            consecutive_failures: 0,
            state: state_tx,
            stop: stop_rx,
        };

        info!(subscription = id, target = %request, "Registering watch");
        let join = tokio::spawn(task.run());

        Ok(WatchSubscription {
            id,
            request,
            state: state_rx,
            stop_tx,
            task: join,
        })
    }
}

/// A running subscription.
///
/// Dropping it ends the task at its next suspension point without waiting;
/// [`WatchSubscription::stop`] waits.
pub struct WatchSubscription {
    id: u64,
    request: WatchRequest,
    state: watch::Receiver<SubscriptionState>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &WatchRequest {
        &self.request
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Wait until the feed is open (or the subscription has stopped).
    pub async fn ready(&self) -> SubscriptionState {
        self.wait_for(|s| matches!(s, SubscriptionState::Watching | SubscriptionState::Stopped))
            .await
    }

    /// Wait until the subscription stops on its own (terminal error).
    pub async fn stopped(&self) {
        self.wait_for(|s| *s == SubscriptionState::Stopped).await;
    }

    async fn wait_for(&self, predicate: impl FnMut(&SubscriptionState) -> bool) -> SubscriptionState {
        let mut state = self.state.clone();
        let reached = state.wait_for(predicate).await.map(|s| *s);
        // Sender dropped: the task is gone.
        reached.unwrap_or(SubscriptionState::Stopped)
    }

    /// Stop the subscription and wait for its task to exit. No handler call
    /// happens after this returns.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(subscription = self.id, error = %e, "Watch task panicked");
            }
        }
        info!(subscription = self.id, target = %self.request, "Watch stopped");
    }
}

// =============================================================================
// Subscription task
// =============================================================================

enum FeedEnd {
    /// Stop was requested.
    Stopped,
    /// The server closed the feed. Carries whether any frame arrived.
    Closed { received: bool },
    Failed(ApiError),
}

enum Flow {
    Continue,
    Stop,
}

struct SubscriptionTask<H> {
    id: u64,
    api: Arc<dyn ResourceApi>,
    namespace: String,
    label: String,
    params: ListParams,
    handler: H,
    backoff: BackoffPolicy,
    max_consecutive_failures: Option<u32>,
    /// Last reported state of each object, by name.
    cache: HashMap<String, Resource>,
    resource_version: String,
    consecutive_failures: u32,
    state: watch::Sender<SubscriptionState>,
    stop: watch::Receiver<bool>,
}

impl<H: WatchHandler> SubscriptionTask<H> {
    async fn run(mut self) {
        // Every pass re-lists: the diff against the cache covers whatever
        // the previous feed missed.
        loop {
            self.set_state(SubscriptionState::Listing);
            let listing =
                cancellable(&mut self.stop, self.api.list(&self.namespace, &self.params)).await;

            match listing {
                None => break,
                Some(Ok(list)) => {
                    debug!(
                        subscription = self.id,
                        items = list.items.len(),
                        resource_version = %list.resource_version,
                        "Listed"
                    );
                    if !self.sync(list.items) {
                        break;
                    }
                    self.resource_version = list.resource_version;
                }
                Some(Err(e)) => match self.fail(e).await {
                    Flow::Continue => continue,
                    Flow::Stop => break,
                },
            }

            let opened = cancellable(
                &mut self.stop,
                self.api.watch(&self.namespace, &self.params, &self.resource_version),
            )
            .await;

            let feed = match opened {
                None => break,
                Some(Ok(feed)) => feed,
                Some(Err(e)) => match self.fail(e).await {
                    Flow::Continue => continue,
                    Flow::Stop => break,
                },
            };

            self.consecutive_failures = 0;
            self.set_state(SubscriptionState::Watching);
            debug!(subscription = self.id, resource_version = %self.resource_version, "Watching");

            match self.consume(feed).await {
                FeedEnd::Stopped => break,
                FeedEnd::Closed { received: true } => {
                    debug!(subscription = self.id, "Feed closed, reconnecting");
                    self.set_state(SubscriptionState::Reconnecting);
                }
                FeedEnd::Closed { received: false } => {
                    // An empty feed that closes straight away must not spin.
                    self.consecutive_failures += 1;
                    self.set_state(SubscriptionState::Reconnecting);
                    let delay = self.backoff.delay(self.consecutive_failures);
                    if cancellable(&mut self.stop, tokio::time::sleep(delay)).await.is_none() {
                        break;
                    }
                }
                FeedEnd::Failed(e) if e.is_gone() => {
                    info!(subscription = self.id, error = %e, "Resource version expired, re-listing");
                    self.set_state(SubscriptionState::Reconnecting);
                }
                FeedEnd::Failed(e) => {
                    if let Flow::Stop = self.fail(e).await {
                        break;
                    }
                }
            }
        }

        self.set_state(SubscriptionState::Stopped);
        debug!(subscription = self.id, target = %self.label, "Watch loop exited");
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state.send_replace(state);
    }

    fn stop_requested(&self) -> bool {
        stop_signalled(&self.stop)
    }

    /// Deliver one event unless stop was requested.
    fn dispatch(&mut self, event: WatchEvent) -> bool {
        if self.stop_requested() {
            return false;
        }
        debug!(
            subscription = self.id,
            kind = event.kind(),
            name = %event.resource().name(),
            "Dispatching event"
        );
        self.handler.on_event(event);
        true
    }

    /// Diff a listing against the cache and report the differences.
    fn sync(&mut self, items: Vec<Resource>) -> bool {
        let mut seen = HashSet::with_capacity(items.len());

        for item in items {
            let name = item.name().to_string();
            seen.insert(name.clone());

            let event = match self.cache.get(&name) {
                None => Some(WatchEvent::Added(item.clone())),
                Some(known) if same_version(known, &item) => None,
                Some(_) => Some(WatchEvent::Modified(item.clone())),
            };
            self.cache.insert(name, item);

            if let Some(event) = event {
                if !self.dispatch(event) {
                    return false;
                }
            }
        }

        let mut vanished: Vec<String> = self
            .cache
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        vanished.sort();

        for name in vanished {
            if let Some(last) = self.cache.remove(&name) {
                if !self.dispatch(WatchEvent::Deleted(last)) {
                    return false;
                }
            }
        }

        true
    }

    /// Apply one feed frame. Returns false if stop was requested.
    fn apply(&mut self, frame: FeedEvent) -> bool {
        if let Some(version) = frame.resource_version().filter(|v| !v.is_empty()) {
            self.resource_version = version.to_string();
        }

        let event = match frame {
            FeedEvent::Bookmark { .. } => None,
            FeedEvent::Added(resource) | FeedEvent::Modified(resource) => {
                let name = resource.name().to_string();
                let event = match self.cache.get(&name) {
                    Some(known) if same_version(known, &resource) => None,
                    Some(_) => Some(WatchEvent::Modified(resource.clone())),
                    None => Some(WatchEvent::Added(resource.clone())),
                };
                self.cache.insert(name, resource);
                event
            }
            FeedEvent::Deleted(resource) => self
                .cache
                .remove(resource.name())
                .map(|_| WatchEvent::Deleted(resource)),
        };

        match event {
            Some(event) => self.dispatch(event),
            None => !self.stop_requested(),
        }
    }

    async fn consume(&mut self, mut feed: EventFeed) -> FeedEnd {
        let mut received = false;

        loop {
            let next = match cancellable(&mut self.stop, feed.next()).await {
                None => return FeedEnd::Stopped,
                Some(next) => next,
            };

            match next {
                None => return FeedEnd::Closed { received },
                Some(Err(e)) => return FeedEnd::Failed(e),
                Some(Ok(frame)) => {
                    received = true;
                    if !self.apply(frame) {
                        return FeedEnd::Stopped;
                    }
                }
            }
        }
    }

    /// Handle a failed list/watch call: give up on terminal errors,
    /// otherwise back off.
    async fn fail(&mut self, e: ApiError) -> Flow {
        if e.is_terminal() || e.is_not_found() {
            error!(subscription = self.id, target = %self.label, error = %e, "Watch failed permanently");
            self.handler.on_error(&e);
            return Flow::Stop;
        }

        if e.is_gone() {
            // Re-listing is the fix; no need to wait.
            self.set_state(SubscriptionState::Reconnecting);
            return Flow::Continue;
        }

        self.consecutive_failures += 1;
        if let Some(max) = self.max_consecutive_failures {
            if self.consecutive_failures > max {
                error!(
                    subscription = self.id,
                    target = %self.label,
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    "Watch retries exhausted"
                );
                self.handler.on_error(&e);
                return Flow::Stop;
            }
        }

        self.set_state(SubscriptionState::Reconnecting);
        let delay = self.backoff.delay(self.consecutive_failures);
        warn!(
            subscription = self.id,
            error = %e,
            attempt = self.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            "Watch interrupted, retrying"
        );

        match cancellable(&mut self.stop, tokio::time::sleep(delay)).await {
            Some(()) => Flow::Continue,
            None => Flow::Stop,
        }
    }
}

fn stop_signalled(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

/// Run `fut` unless stop is requested first.
async fn cancellable<F: Future>(stop: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    if stop_signalled(stop) {
        return None;
    }
    tokio::select! {
        biased;
        _ = stop.changed() => None,
        out = fut => Some(out),
    }
}

fn same_version(a: &Resource, b: &Resource) -> bool {
    a.resource_version().is_some() && a.resource_version() == b.resource_version()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    fn service(name: &str, version: &str) -> Resource {
        let mut r = Resource::new("v1", "Service", name, "default");
        r.metadata.resource_version = Some(version.to_string());
        r
    }

    #[test]
    fn test_request_validation() {
        assert!(WatchRequest::namespace("default").params().is_ok());
        assert_eq!(
            WatchRequest::namespace("").params(),
            Err(RegistrationError::EmptyNamespace)
        );
        assert_eq!(
            WatchRequest::namespace("default").named(" ").params(),
            Err(RegistrationError::EmptyName)
        );
        assert!(matches!(
            WatchRequest::namespace("default").with_label("app", "a,b").params(),
            Err(RegistrationError::InvalidSelector(_))
        ));
    }

    #[test]
    fn test_request_params() {
        let params = WatchRequest::namespace("default")
            .named("web")
            .with_label("app", "web")
            .params()
            .unwrap();

        assert_eq!(params.fields.target_name(), Some("web"));
        assert_eq!(params.labels.unwrap().to_query(), "app=web");
    }

    #[test]
    fn test_request_display() {
        assert_eq!(WatchRequest::namespace("default").to_string(), "default/*");
        assert_eq!(
            WatchRequest::namespace("default")
                .named("web")
                .with_label("app", "web")
                .to_string(),
            "default/web[app=web]"
        );
    }

    #[test]
    fn test_handler_funcs_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let added = Arc::clone(&seen);
        let deleted = Arc::clone(&seen);
        let failed = Arc::clone(&seen);
        let mut handler = HandlerFuncs::new()
            .on_add(move |r| added.lock().unwrap().push(format!("add:{}", r.name())))
            .on_delete(move |r| deleted.lock().unwrap().push(format!("del:{}", r.name())))
            .on_failure(move |e| failed.lock().unwrap().push(format!("err:{e}")));

        handler.on_event(WatchEvent::Added(service("a", "1")));
        // No modify callback registered: ignored.
        handler.on_event(WatchEvent::Modified(service("a", "2")));
        handler.on_event(WatchEvent::Deleted(service("a", "3")));
        WatchHandler::on_error(&mut handler, &ApiError::Forbidden("no".into()));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[..2], ["add:a", "del:a"]);
        assert!(seen[2].starts_with("err:"));
    }

    #[test]
    fn test_handler_funcs_without_failure_callback() {
        let mut handler = HandlerFuncs::new();
        handler.on_error(&ApiError::Forbidden("no".into()));
        handler.on_event(WatchEvent::Added(service("a", "1")));
    }

    #[test]
    fn test_same_version() {
        assert!(same_version(&service("a", "1"), &service("a", "1")));
        assert!(!same_version(&service("a", "1"), &service("a", "2")));

        let unversioned = Resource::new("v1", "Service", "a", "default");
        assert!(!same_version(&unversioned, &unversioned));
    }

    #[test]
    fn test_event_accessors() {
        let event = WatchEvent::Modified(service("a", "1"));
        assert_eq!(event.kind(), "modified");
        assert_eq!(event.resource().name(), "a");
        assert_eq!(event.into_resource().resource_version(), Some("1"));
    }
}
