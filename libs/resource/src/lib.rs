//! # tether-resource
//!
//! Data model shared by the tether agent and anything that reads the
//! liveness markers it writes.
//!
//! ## Contents
//!
//! - [`ResourceKey`]: the `(name, namespace)` pair every heartbeat and watch
//!   is registered against
//! - [`Resource`]: an opaque cluster object with typed metadata
//! - [`LivenessPatch`]: the blind JSON patch that refreshes the heartbeat
//!   annotation
//! - [`LabelSelector`] / [`FieldSelector`]: server-side filters and the
//!   client-side "map contains" matcher
//! - [`ServiceSpec`]: renders a Service body for the agent to create
//!
//! Nothing in this crate performs I/O.

mod error;
mod key;
mod object;
mod patch;
mod selector;
mod service;

pub use error::ResourceError;
pub use key::ResourceKey;
pub use object::{ObjectMeta, Resource, ResourceList};
pub use patch::{
    encode_liveness_patch, escape_pointer_token, LivenessPatch, PatchOp, TimestampFormat,
    DEFAULT_HEARTBEAT_ANNOTATION,
};
pub use selector::{map_contains, FieldSelector, LabelSelector};
pub use service::ServiceSpec;
