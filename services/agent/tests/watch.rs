//! Integration tests for watch subscriptions against the in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_agent::{
    ApiError, BackoffPolicy, HandlerFuncs, InMemoryApi, RegistrationError, ResourceApi,
    SubscriptionState, WatchConfig, WatchEvent, WatchHandler, WatchRequest, Watcher,
};
use tether_resource::{Resource, ResourceKey};

type Log = Arc<Mutex<Vec<String>>>;

/// Records `kind:name` for every event and the last terminal error.
#[derive(Clone, Default)]
struct Recorder {
    events: Log,
    errors: Log,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    async fn wait_for_events(&self, count: usize) -> Vec<String> {
        for _ in 0..100 {
            if self.events.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.events()
    }
}

impl WatchHandler for Recorder {
    fn on_event(&mut self, event: WatchEvent) {
        let entry = format!("{}:{}", event.kind(), event.resource().name());
        self.events.lock().unwrap().push(entry);
    }

    fn on_error(&mut self, error: &ApiError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

fn fast() -> WatchConfig {
    WatchConfig {
        backoff: BackoffPolicy::immediate(),
        max_consecutive_failures: None,
    }
}

fn service(name: &str) -> Resource {
    Resource::new("v1", "Service", name, "default")
}

fn key(name: &str) -> ResourceKey {
    ResourceKey::new(name, "default").unwrap()
}

async fn touch(api: &InMemoryApi, name: &str) {
    let mut current = api.get(&key(name)).await.unwrap();
    current
        .metadata
        .labels
        .insert("touched".to_string(), current.resource_version().unwrap_or("0").to_string());
    api.update(&current).await.unwrap();
}

#[tokio::test]
async fn test_every_change_yields_one_callback_in_order() {
    let api = Arc::new(InMemoryApi::new());
    let watcher = Watcher::new(api.clone(), fast());
    let recorder = Recorder::default();

    let subscription = watcher
        .watch(WatchRequest::namespace("default"), recorder.clone())
        .unwrap();
    assert_eq!(subscription.ready().await, SubscriptionState::Watching);

    api.create(&service("web")).await.unwrap();
    touch(&api, "web").await;
    api.delete(&key("web")).await.unwrap();

    let events = recorder.wait_for_events(3).await;
    assert_eq!(events, vec!["added:web", "modified:web", "deleted:web"]);

    subscription.stop().await;
}

#[tokio::test]
async fn test_existing_objects_are_listed_as_added() {
    let api = Arc::new(InMemoryApi::new());
    api.create(&service("a")).await.unwrap();
    api.create(&service("b")).await.unwrap();

    let watcher = Watcher::new(api.clone(), fast());
    let recorder = Recorder::default();
    let subscription = watcher
        .watch(WatchRequest::namespace("default"), recorder.clone())
        .unwrap();
    subscription.ready().await;

    let mut events = recorder.wait_for_events(2).await;
    events.sort();
    assert_eq!(events, vec!["added:a", "added:b"]);

    subscription.stop().await;
}

#[tokio::test]
async fn test_name_filter_excludes_others() {
    let api = Arc::new(InMemoryApi::new());
    let watcher = Watcher::new(api.clone(), fast());
    let recorder = Recorder::default();

    let subscription = watcher
        .watch(WatchRequest::namespace("default").named("web"), recorder.clone())
        .unwrap();
    subscription.ready().await;

    api.create(&service("other")).await.unwrap();
    api.create(&service("web")).await.unwrap();
    api.delete(&key("other")).await.unwrap();

    let mut elsewhere = service("web");
    elsewhere.metadata.namespace = "staging".to_string();
    api.create(&elsewhere).await.unwrap();

    recorder.wait_for_events(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.events(), vec!["added:web"]);

    subscription.stop().await;
}

#[tokio::test]
async fn test_label_filter() {
    let api = Arc::new(InMemoryApi::new());
    let watcher = Watcher::new(api.clone(), fast());
    let recorder = Recorder::default();

    let subscription = watcher
        .watch(
            WatchRequest::namespace("default").with_label("app", "web"),
            recorder.clone(),
        )
        .unwrap();
    subscription.ready().await;

    let mut labelled = service("front");
    labelled.metadata.labels.insert("app".into(), "web".into());
    api.create(&service("plain")).await.unwrap();
    api.create(&labelled).await.unwrap();

    recorder.wait_for_events(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.events(), vec!["added:front"]);

    subscription.stop().await;
}

#[tokio::test]
async fn test_reconnect_after_forced_close_keeps_stream_exact() {
    let api = Arc::new(InMemoryApi::new());
    api.create(&service("a")).await.unwrap();

    let watcher = Watcher::new(api.clone(), fast());
    let recorder = Recorder::default();
    let subscription = watcher
        .watch(WatchRequest::namespace("default"), recorder.clone())
        .unwrap();
    subscription.ready().await;
    assert_eq!(recorder.wait_for_events(1).await, vec!["added:a"]);

    api.close_watches();
    touch(&api, "a").await;

    let events = recorder.wait_for_events(2).await;
    assert_eq!(events, vec!["added:a", "modified:a"]);

    // Changes after the reconnect still arrive.
    api.create(&service("b")).await.unwrap();
    let events = recorder.wait_for_events(3).await;
    assert_eq!(events, vec!["added:a", "modified:a", "added:b"]);
    assert!(api.list_calls() >= 2);

    subscription.stop().await;
}

#[tokio::test]
async fn test_close_after_frames_relists_once() {
    let api = Arc::new(InMemoryApi::new());
    let watcher = Watcher::new(api.clone(), fast());
    let recorder = Recorder::default();
    let subscription = watcher
        .watch(WatchRequest::namespace("default"), recorder.clone())
        .unwrap();
    subscription.ready().await;

    api.create(&service("b")).await.unwrap();
    assert_eq!(recorder.wait_for_events(1).await, vec!["added:b"]);
    assert_eq!(api.list_calls(), 1);

    // The feed delivered a frame before closing: one relist, no backoff.
    api.close_watches();
    for _ in 0..100 {
        if api.watch_calls() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(api.list_calls(), 2);

    api.create(&service("c")).await.unwrap();
    assert_eq!(recorder.wait_for_events(2).await, vec!["added:b", "added:c"]);
    assert_eq!(api.list_calls(), 2);
    assert_eq!(api.watch_calls(), 2);

    subscription.stop().await;
}

#[tokio::test]
async fn test_watch_failure_relists_without_duplicates() {
    let api = Arc::new(InMemoryApi::new());
    api.create(&service("a")).await.unwrap();
    api.create(&service("b")).await.unwrap();

    let watcher = Watcher::new(api.clone(), fast());
    let recorder = Recorder::default();

    // The first watch attempt fails after the list; the recovery listing
    // must not report the same objects again.
    api.fail_next_watch(ApiError::Transport("reset".into()));
    let subscription = watcher
        .watch(WatchRequest::namespace("default"), recorder.clone())
        .unwrap();

    subscription.ready().await;
    let mut events = recorder.wait_for_events(2).await;
    events.sort();
    assert_eq!(events, vec!["added:a", "added:b"]);

    subscription.stop().await;
    assert_eq!(api.watch_calls(), 2);
    assert_eq!(api.list_calls(), 2);
}

#[tokio::test]
async fn test_expired_version_forces_relist() {
    let api = Arc::new(InMemoryApi::new());
    api.create(&service("a")).await.unwrap();
    api.fail_next_watch(ApiError::Gone("too old".into()));

    let watcher = Watcher::new(api.clone(), fast());
    let recorder = Recorder::default();
    let subscription = watcher
        .watch(WatchRequest::namespace("default"), recorder.clone())
        .unwrap();
    assert_eq!(subscription.ready().await, SubscriptionState::Watching);

    assert_eq!(api.list_calls(), 2);
    assert_eq!(recorder.events(), vec!["added:a"]);

    api.create(&service("b")).await.unwrap();
    assert_eq!(recorder.wait_for_events(2).await, vec!["added:a", "added:b"]);

    subscription.stop().await;
}

#[tokio::test]
async fn test_terminal_list_error_stops_subscription() {
    let api = Arc::new(InMemoryApi::new());
    api.fail_next_list(ApiError::Forbidden("services is forbidden".into()));

    let watcher = Watcher::new(api.clone(), fast());
    let recorder = Recorder::default();
    let subscription = watcher
        .watch(WatchRequest::namespace("default"), recorder.clone())
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), subscription.stopped())
        .await
        .unwrap();
    assert_eq!(subscription.state(), SubscriptionState::Stopped);
    assert_eq!(recorder.errors().len(), 1);
    assert!(recorder.events().is_empty());
    assert_eq!(api.watch_calls(), 0);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let api = Arc::new(InMemoryApi::new());
    for _ in 0..3 {
        api.fail_next_list(ApiError::Transport("refused".into()));
    }

    let config = WatchConfig {
        backoff: BackoffPolicy::immediate(),
        max_consecutive_failures: Some(2),
    };
    let watcher = Watcher::new(api.clone(), config);
    let recorder = Recorder::default();
    let subscription = watcher
        .watch(WatchRequest::namespace("default"), recorder.clone())
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), subscription.stopped())
        .await
        .unwrap();
    assert_eq!(api.list_calls(), 3);
    assert_eq!(recorder.errors().len(), 1);
}

#[tokio::test]
async fn test_transient_list_errors_are_retried() {
    let api = Arc::new(InMemoryApi::new());
    api.create(&service("a")).await.unwrap();
    api.fail_next_list(ApiError::Status {
        code: 503,
        message: "unavailable".into(),
    });

    let watcher = Watcher::new(api.clone(), fast());
    let recorder = Recorder::default();
    let subscription = watcher
        .watch(WatchRequest::namespace("default"), recorder.clone())
        .unwrap();

    assert_eq!(subscription.ready().await, SubscriptionState::Watching);
    assert_eq!(recorder.events(), vec!["added:a"]);
    assert!(recorder.errors().is_empty());

    subscription.stop().await;
}

#[tokio::test]
async fn test_no_callbacks_after_stop() {
    let api = Arc::new(InMemoryApi::new());
    let watcher = Watcher::new(api.clone(), fast());
    let recorder = Recorder::default();

    let subscription = watcher
        .watch(WatchRequest::namespace("default"), recorder.clone())
        .unwrap();
    subscription.ready().await;
    subscription.stop().await;

    api.create(&service("late")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn test_stop_during_backoff() {
    let api = Arc::new(InMemoryApi::new());
    api.fail_next_list(ApiError::Transport("refused".into()));

    let config = WatchConfig {
        backoff: BackoffPolicy {
            base: Duration::from_secs(60),
            max: Duration::from_secs(60),
            jitter: 0.0,
        },
        max_consecutive_failures: None,
    };
    let watcher = Watcher::new(api.clone(), config);
    let subscription = watcher
        .watch(WatchRequest::namespace("default"), Recorder::default())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(subscription.state(), SubscriptionState::Reconnecting);

    tokio::time::timeout(Duration::from_secs(1), subscription.stop())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_registration_errors_are_synchronous() {
    let api = Arc::new(InMemoryApi::new());
    let watcher = Watcher::new(api.clone(), fast());

    let err = watcher
        .watch(WatchRequest::namespace(""), Recorder::default())
        .err()
        .unwrap();
    assert_eq!(err, RegistrationError::EmptyNamespace);

    let err = watcher
        .watch(
            WatchRequest::namespace("default").with_label("", "x"),
            Recorder::default(),
        )
        .err()
        .unwrap();
    assert!(matches!(err, RegistrationError::InvalidSelector(_)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(api.list_calls(), 0);
}

#[tokio::test]
async fn test_handler_funcs_subscription() {
    let api = Arc::new(InMemoryApi::new());
    let watcher = Watcher::new(api.clone(), fast());

    let added: Log = Arc::default();
    let deleted: Log = Arc::default();
    let handler = HandlerFuncs::new()
        .on_add({
            let added = Arc::clone(&added);
            move |r| added.lock().unwrap().push(r.name().to_string())
        })
        .on_delete({
            let deleted = Arc::clone(&deleted);
            move |r| deleted.lock().unwrap().push(r.name().to_string())
        });

    let subscription = watcher
        .watch(WatchRequest::namespace("default"), handler)
        .unwrap();
    subscription.ready().await;

    api.create(&service("web")).await.unwrap();
    touch(&api, "web").await;
    api.delete(&key("web")).await.unwrap();

    for _ in 0..100 {
        if !deleted.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    subscription.stop().await;

    assert_eq!(*added.lock().unwrap(), vec!["web"]);
    assert_eq!(*deleted.lock().unwrap(), vec!["web"]);
}
