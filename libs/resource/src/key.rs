//! Resource identity.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

/// Identifies a named, namespaced resource.
///
/// Both parts are validated on construction, so a `ResourceKey` that exists
/// is always usable as a heartbeat or watch target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    name: String,
    namespace: String,
}

impl ResourceKey {
    /// Create a key, rejecting empty parts.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Result<Self, ResourceError> {
        let name = name.into();
        let namespace = namespace.into();

        if name.trim().is_empty() {
            return Err(ResourceError::EmptyName);
        }
        if namespace.trim().is_empty() {
            return Err(ResourceError::EmptyNamespace);
        }

        Ok(Self { name, namespace })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
