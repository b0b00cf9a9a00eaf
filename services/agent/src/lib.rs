//! tether Agent Library
//!
//! The agent keeps the cluster objects it owns visibly alive and streams
//! change notifications for the objects it cares about.
//!
//! ## Architecture
//!
//! ```text
//! ResourceLifecycle
//! ├── HeartbeatCoordinator  (one ticking task per tracked object)
//! └── Watcher               (one list-watch task per subscription)
//!         │
//!         ▼
//!    ResourceApi            (KubeClient over HTTP, InMemoryApi for tests)
//! ```
//!
//! ## Modules
//!
//! - `heartbeat`: periodic liveness patches
//! - `watch`: list-watch subscriptions with reconnection
//! - `lifecycle`: create-and-track facade
//! - `kube`: HTTP client for a Kubernetes-style API server
//! - `memory`: in-process store with a change feed

pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod kube;
pub mod lifecycle;
pub mod memory;
pub mod watch;

// Re-export commonly used types
pub use api::{EventFeed, FeedEvent, ListParams, ResourceApi};
pub use backoff::BackoffPolicy;
pub use error::{ApiError, LifecycleError, RegistrationError};
pub use heartbeat::{
    ApiPatcher, HeartbeatConfig, HeartbeatCoordinator, HeartbeatHandle, LivenessPatcher,
    NotFoundPolicy,
};
pub use kube::{KubeClient, ResourceKind};
pub use lifecycle::{ResourceLifecycle, TrackedResource};
pub use memory::InMemoryApi;
pub use watch::{
    handler_fn, FnHandler, HandlerFuncs, SubscriptionState, WatchConfig, WatchEvent, WatchHandler,
    WatchRequest, WatchSubscription, Watcher,
};
